//! WebSocket framed-stream server
//!
//! Carries the same tagged messages as the TCP server, JSON-encoded inside
//! a single text frame per message. Connection lifecycle, dispatch, and
//! close paths are shared with the TCP variant.

use crate::config::StreamConfig;
use crate::error::{NetError, Result};
use crate::stream::conn::{
    client_close, next_conn_id, notify, run_dispatch, server_close, CloseReason, ConnHandle,
    ConnRegistry, StreamHandler,
};
use crate::stream::frame::TlvFrame;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One tagged message as it travels inside a text frame
#[derive(Debug, Serialize, Deserialize)]
struct WsEnvelope {
    msg_id: u32,
    payload: String,
}

impl WsEnvelope {
    fn into_frame(self) -> TlvFrame {
        TlvFrame::new(self.msg_id, Bytes::from(self.payload.into_bytes()))
    }

    /// Text frames carry the payload verbatim, so it must be valid UTF-8;
    /// anything else is rejected rather than silently re-encoded.
    fn from_frame(frame: &TlvFrame) -> Result<Self> {
        let payload = String::from_utf8(frame.payload.to_vec())
            .map_err(|_| NetError::protocol("websocket payload is not utf-8"))?;
        Ok(Self {
            msg_id: frame.tag,
            payload,
        })
    }
}

/// WebSocket server hosting framed connections
pub struct WsServer {
    local_addr: SocketAddr,
    conns: ConnRegistry,
    handler: Arc<dyn StreamHandler>,
    config: StreamConfig,
    shutdown: CancellationToken,
}

impl WsServer {
    /// Bind and start accepting connections
    pub async fn bind(
        addr: SocketAddr,
        config: StreamConfig,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let conns: ConnRegistry = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            conns.clone(),
            handler.clone(),
            config.clone(),
            shutdown.clone(),
        ));

        info!(addr = %local_addr, "websocket server started");
        Ok(Self {
            local_addr,
            conns,
            handler,
            config,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn conn(&self, id: i64) -> Option<Arc<ConnHandle>> {
        self.conns.get(&id).map(|c| c.value().clone())
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// IDs of the live connections
    pub fn conn_ids(&self) -> Vec<i64> {
        self.conns.iter().map(|entry| *entry.key()).collect()
    }

    /// Push one frame to a connection outside the request lifecycle
    pub async fn notify(&self, id: i64, frame: TlvFrame) -> Result<()> {
        notify(&self.conns, &self.handler, id, frame).await
    }

    /// Close one connection from the server side, running the close hooks
    pub async fn close_conn(&self, id: i64) -> Result<()> {
        server_close(&self.conns, &self.handler, id, self.config.close_grace).await
    }

    /// Stop accepting and cut every connection without per-connection hooks
    pub fn close(&self) {
        self.shutdown.cancel();
        for entry in self.conns.iter() {
            entry.value().close_token().cancel();
        }
        self.conns.clear();
        info!(addr = %self.local_addr, "websocket server closed");
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    conns: ConnRegistry,
    handler: Arc<dyn StreamHandler>,
    config: StreamConfig,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        // the handshake happens off the accept loop
        let conns = conns.clone();
        let handler = handler.clone();
        let config = config.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => spawn_connection(ws, peer, &conns, &handler, &config),
                Err(e) => debug!(%peer, error = %e, "websocket handshake failed"),
            }
        });
    }
}

fn spawn_connection(
    ws: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    conns: &ConnRegistry,
    handler: &Arc<dyn StreamHandler>,
    config: &StreamConfig,
) {
    let id = next_conn_id();
    let (sink, stream) = ws.split();

    let (send_tx, send_rx) = mpsc::channel(config.write_queue);
    let (recv_tx, recv_rx) = mpsc::channel(config.recv_queue);
    let token = CancellationToken::new();
    let conn = Arc::new(ConnHandle::new(id, peer, send_tx, token.clone()));
    conns.insert(id, conn.clone());

    debug!(conn = id, %peer, "websocket connection accepted");

    tokio::spawn(run_dispatch(conn.clone(), handler.clone(), recv_rx));
    tokio::spawn(write_loop(
        id,
        sink,
        send_rx,
        config.write_timeout,
        token.clone(),
        conns.clone(),
        handler.clone(),
    ));
    tokio::spawn(read_loop(
        id,
        stream,
        recv_tx,
        config.recv_timeout,
        config.max_frame_bytes,
        token,
        conns.clone(),
        handler.clone(),
    ));
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    id: i64,
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    recv_tx: mpsc::Sender<TlvFrame>,
    recv_timeout: Option<Duration>,
    max_frame_bytes: usize,
    token: CancellationToken,
    conns: ConnRegistry,
    handler: Arc<dyn StreamHandler>,
) {
    let reason = loop {
        let next = tokio::select! {
            // server-side close: hooks already ran, just stop reading
            _ = token.cancelled() => return,
            next = next_message(&mut stream, recv_timeout) => next,
        };

        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => break CloseReason::Remote,
            Err(NetError::Timeout { timeout_ms }) => {
                warn!(conn = id, timeout_ms, "no frame within receive window");
                break CloseReason::Timeout;
            }
            Err(e) => {
                debug!(conn = id, error = %e, "read failed");
                break CloseReason::Remote;
            }
        };

        match message {
            Message::Text(text) => {
                if text.len() > max_frame_bytes {
                    warn!(conn = id, size = text.len(), "frame exceeds limit");
                    break CloseReason::Protocol;
                }
                match serde_json::from_str::<WsEnvelope>(&text) {
                    Ok(envelope) => {
                        if recv_tx.try_send(envelope.into_frame()).is_err() {
                            warn!(conn = id, "receive queue full, frame dropped");
                        }
                    }
                    Err(e) => {
                        warn!(conn = id, error = %e, "malformed frame");
                        break CloseReason::Protocol;
                    }
                }
            }
            Message::Binary(_) => {
                warn!(conn = id, "unexpected binary frame");
                break CloseReason::Protocol;
            }
            Message::Close(_) => break CloseReason::Remote,
            // pings and pongs are handled by the protocol layer
            _ => {}
        }
    };

    client_close(&conns, &handler, id, reason).await;
}

/// Read one websocket message, applying the optional receive deadline
async fn next_message(
    stream: &mut SplitStream<WebSocketStream<TcpStream>>,
    recv_timeout: Option<Duration>,
) -> Result<Option<Message>> {
    let next = match recv_timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next())
            .await
            .map_err(|_| NetError::timeout(limit.as_millis() as u64))?,
        None => stream.next().await,
    };
    match next {
        Some(Ok(message)) => Ok(Some(message)),
        Some(Err(e)) => Err(NetError::protocol(e.to_string())),
        None => Ok(None),
    }
}

async fn write_loop(
    id: i64,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut send_rx: mpsc::Receiver<TlvFrame>,
    write_timeout: Duration,
    token: CancellationToken,
    conns: ConnRegistry,
    handler: Arc<dyn StreamHandler>,
) {
    loop {
        let frame = tokio::select! {
            frame = send_rx.recv() => frame,
            _ = token.cancelled() => return,
        };
        let Some(frame) = frame else { return };

        let envelope = match WsEnvelope::from_frame(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn = id, tag = frame.tag, error = %e, "frame dropped");
                continue;
            }
        };
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(conn = id, error = %e, "response serialization failed");
                continue;
            }
        };

        match tokio::time::timeout(write_timeout, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(conn = id, error = %e, "write failed");
                client_close(&conns, &handler, id, CloseReason::Remote).await;
                return;
            }
            Err(_) => {
                warn!(conn = id, "write timed out");
                client_close(&conns, &handler, id, CloseReason::Timeout).await;
                return;
            }
        }
    }
}
