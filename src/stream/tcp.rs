//! TCP framed-stream server
//!
//! Accepts connections and runs three tasks per connection: read, dispatch,
//! write. Reads are deadline-bounded when a receive timeout is configured,
//! and a timeout closes the connection with a reason the handler can tell
//! apart from other failures.

use crate::config::StreamConfig;
use crate::error::{NetError, Result};
use crate::stream::conn::{
    client_close, next_conn_id, notify, run_dispatch, server_close, CloseReason, ConnHandle,
    ConnRegistry, StreamHandler,
};
use crate::stream::frame::{TlvCodec, TlvFrame};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// TCP server hosting framed connections
pub struct TcpServer {
    local_addr: SocketAddr,
    conns: ConnRegistry,
    handler: Arc<dyn StreamHandler>,
    config: StreamConfig,
    shutdown: CancellationToken,
}

impl TcpServer {
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

        info!(addr = %local_addr, "tcp server started");
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

    /// Look up a live connection by ID
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
        info!(addr = %self.local_addr, "tcp server closed");
    }
}

impl Drop for TcpServer {
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
        match accepted {
            Ok((stream, peer)) => {
                spawn_connection(stream, peer, &conns, &handler, &config);
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conns: &ConnRegistry,
    handler: &Arc<dyn StreamHandler>,
    config: &StreamConfig,
) {
    let id = next_conn_id();
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let (send_tx, send_rx) = mpsc::channel(config.write_queue);
    let (recv_tx, recv_rx) = mpsc::channel(config.recv_queue);
    let token = CancellationToken::new();
    let conn = Arc::new(ConnHandle::new(id, peer, send_tx, token.clone()));
    conns.insert(id, conn.clone());

    debug!(conn = id, %peer, "connection accepted");

    tokio::spawn(run_dispatch(conn.clone(), handler.clone(), recv_rx));
    tokio::spawn(write_loop(
        id,
        FramedWrite::new(write_half, TlvCodec::new(config.max_frame_bytes)),
        send_rx,
        config.write_timeout,
        token.clone(),
        conns.clone(),
        handler.clone(),
    ));
    tokio::spawn(read_loop(
        id,
        FramedRead::new(read_half, TlvCodec::new(config.max_frame_bytes)),
        recv_tx,
        config.recv_timeout,
        token,
        conns.clone(),
        handler.clone(),
    ));
}

async fn read_loop(
    id: i64,
    mut reader: FramedRead<OwnedReadHalf, TlvCodec>,
    recv_tx: mpsc::Sender<TlvFrame>,
    recv_timeout: Option<Duration>,
    token: CancellationToken,
    conns: ConnRegistry,
    handler: Arc<dyn StreamHandler>,
) {
    let reason = loop {
        let item = tokio::select! {
            // server-side close: hooks already ran, just stop reading
            _ = token.cancelled() => return,
            item = next_frame(&mut reader, recv_timeout) => item,
        };

        match item {
            Ok(Some(frame)) => {
                if recv_tx.try_send(frame).is_err() {
                    warn!(conn = id, "receive queue full, frame dropped");
                }
            }
            Ok(None) => break CloseReason::Remote,
            Err(NetError::Timeout { timeout_ms }) => {
                warn!(conn = id, timeout_ms, "no frame within receive window");
                break CloseReason::Timeout;
            }
            Err(e @ NetError::FrameTooLarge { .. }) => {
                warn!(conn = id, error = %e, "framing violation");
                break CloseReason::Protocol;
            }
            Err(e) => {
                debug!(conn = id, error = %e, "read failed");
                break CloseReason::Remote;
            }
        }
    };

    client_close(&conns, &handler, id, reason).await;
}

/// Read one frame, applying the optional receive deadline
async fn next_frame(
    reader: &mut FramedRead<OwnedReadHalf, TlvCodec>,
    recv_timeout: Option<Duration>,
) -> Result<Option<TlvFrame>> {
    let next = match recv_timeout {
        Some(limit) => tokio::time::timeout(limit, reader.next())
            .await
            .map_err(|_| NetError::timeout(limit.as_millis() as u64))?,
        None => reader.next().await,
    };
    next.transpose()
}

async fn write_loop(
    id: i64,
    mut writer: FramedWrite<OwnedWriteHalf, TlvCodec>,
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

        match tokio::time::timeout(write_timeout, writer.send(frame)).await {
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
