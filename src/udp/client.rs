//! UDP client: one connected socket, one session

use crate::buffer_pool;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::udp::bind_socket;
use crate::udp::session::Session;

use arq_core::{consts, ArqStats, ConvId};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Client endpoint owning a connected socket and a single session
pub struct Client {
    session: Session,
    local_addr: SocketAddr,
}

impl Client {
    /// Connect to a remote endpoint under the given conversation ID
    pub async fn connect(remote: SocketAddr, conv: ConvId, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad bind address")
            })?
        } else {
            "[::]:0".parse().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad bind address")
            })?
        };
        let socket = bind_socket(bind_addr, config.socket_recv_buffer, false)?;
        socket.connect(remote).await?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let read_buffer = config.read_buffer;
        let session = Session::spawn(conv, socket.clone(), remote, config.session, None)?;
        tokio::spawn(read_task(
            socket,
            remote,
            read_buffer,
            session.input_sender(),
            session.error_sender(),
            session.close_token(),
        ));

        info!(conv, %remote, %local_addr, "client connected");
        Ok(Self {
            session,
            local_addr,
        })
    }

    pub fn conv(&self) -> ConvId {
        self.session.conv()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue one message for reliable delivery
    pub fn send(&self, data: Bytes) -> Result<()> {
        self.session.send(data)
    }

    /// Receive the next complete message
    pub async fn recv(&self) -> Option<Bytes> {
        self.session.recv().await
    }

    /// Next asynchronous session error
    pub async fn next_error(&self) -> Option<crate::error::NetError> {
        self.session.next_error().await
    }

    pub fn stats(&self) -> ArqStats {
        self.session.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub fn close(&self) {
        self.session.close();
        debug!(conv = self.session.conv(), "client closed");
    }

    /// Borrow the underlying session
    pub fn session(&self) -> &Session {
        &self.session
    }
}

/// Feed datagrams from the connected socket into the session. Fatal socket
/// errors are surfaced on the session's error channel and close the session;
/// transient ones are retried.
async fn read_task(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    read_buffer: usize,
    input_tx: mpsc::Sender<(SocketAddr, Bytes)>,
    error_tx: mpsc::Sender<crate::error::NetError>,
    closed: CancellationToken,
) {
    let mut buf = buffer_pool::get_datagram_buffer();
    buf.resize(read_buffer, 0);

    loop {
        tokio::select! {
            result = socket.recv(&mut buf) => {
                match result {
                    Ok(len) => {
                        if len < consts::OVERHEAD as usize {
                            trace!(len, "runt datagram dropped");
                            continue;
                        }
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        if input_tx.try_send((remote, data)).is_err() {
                            trace!("inbound queue full, datagram dropped");
                        }
                    }
                    Err(e) => {
                        let err = crate::error::NetError::Io(e);
                        if err.is_fatal() {
                            error!(error = %err, "client socket read failed");
                            let _ = error_tx.try_send(err);
                            closed.cancel();
                            break;
                        }
                        trace!(error = %err, "transient read error");
                    }
                }
            }
            _ = closed.cancelled() => break,
        }
    }

    buffer_pool::put_datagram_buffer(buf);
}
