//! UDP listener: shared sockets, datagram dispatch, conv-keyed session registry
//!
//! One bound port serves every session. With `acceptor_count > 1` the port is
//! shared across reuse-port sockets, each with its own read task. Read tasks
//! shard raw datagrams by conversation ID onto bounded per-worker queues,
//! which keeps one conversation's datagrams ordered on one worker; each
//! worker routes its share to the owning session. Sessions are registered
//! explicitly, datagrams for unknown conversations are dropped.

use crate::buffer_pool;
use crate::config::{ListenerConfig, SessionConfig};
use crate::error::{NetError, Result};
use crate::fec::FecCodec;
use crate::udp::session::Session;
use crate::udp::bind_socket;

use arq_core::{consts, ConvId};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// A raw datagram with its conv already parsed, waiting for routing
type RawDatagram = (ConvId, SocketAddr, Bytes);

/// UDP listener hosting many sessions on one port
pub struct Listener {
    config: ListenerConfig,
    local_addr: SocketAddr,
    sockets: Vec<Arc<UdpSocket>>,
    sessions: Arc<DashMap<ConvId, Arc<Session>>>,
    shutdown: CancellationToken,
}

impl Listener {
    /// Bind to the specified address
    pub async fn bind(addr: SocketAddr, config: ListenerConfig) -> Result<Self> {
        config.validate()?;

        let reuse_port = config.acceptor_count > 1;
        let mut sockets = Vec::with_capacity(config.acceptor_count);
        for _ in 0..config.acceptor_count {
            sockets.push(Arc::new(bind_socket(
                addr,
                config.socket_recv_buffer,
                reuse_port,
            )?));
        }
        let local_addr = sockets[0].local_addr()?;

        let sessions: Arc<DashMap<ConvId, Arc<Session>>> = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        let mut dispatch_txs = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count {
            let (tx, rx) = mpsc::channel::<RawDatagram>(config.dispatch_queue);
            dispatch_txs.push(tx);
            tokio::spawn(route_task(rx, sessions.clone(), shutdown.clone()));
        }

        for (index, socket) in sockets.iter().enumerate() {
            tokio::spawn(read_task(
                index,
                socket.clone(),
                dispatch_txs.clone(),
                config.read_buffer,
                config.read_backoff,
                shutdown.clone(),
            ));
        }

        tokio::spawn(sweep_task(sessions.clone(), shutdown.clone()));

        info!(addr = %local_addr, acceptors = config.acceptor_count,
            workers = config.worker_count, "listener started");

        Ok(Self {
            config,
            local_addr,
            sockets,
            sessions,
            shutdown,
        })
    }

    /// Register a session for `conv`, bound to one of the listener's
    /// sockets. Fails when the conversation ID is already taken.
    pub fn add_session(&self, conv: ConvId, remote: SocketAddr) -> Result<Arc<Session>> {
        self.add_session_with(conv, remote, self.config.session.clone(), None)
    }

    /// Register a session with its own config and FEC codec
    pub fn add_session_with(
        &self,
        conv: ConvId,
        remote: SocketAddr,
        config: SessionConfig,
        fec: Option<Box<dyn FecCodec>>,
    ) -> Result<Arc<Session>> {
        use dashmap::mapref::entry::Entry;

        crate::config::validate_read_buffer(config.arq.mtu, self.config.read_buffer)?;

        match self.sessions.entry(conv) {
            Entry::Occupied(_) => Err(NetError::DuplicateSession(conv)),
            Entry::Vacant(entry) => {
                // sessions spread their writes across the shared sockets
                let socket = self.sockets[rand::random::<usize>() % self.sockets.len()].clone();
                let session = Arc::new(Session::spawn(conv, socket, remote, config, fec)?);
                entry.insert(session.clone());
                debug!(conv, %remote, "session registered");
                Ok(session)
            }
        }
    }

    /// Look up a session by conversation ID
    pub fn session(&self, conv: ConvId) -> Option<Arc<Session>> {
        self.sessions.get(&conv).map(|s| s.value().clone())
    }

    /// Deregister and close a session. No-op when the conversation ID is
    /// not registered.
    pub fn remove_session(&self, conv: ConvId) {
        if let Some((_, session)) = self.sessions.remove(&conv) {
            session.close();
            debug!(conv, "session removed");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop all read, routing, and session tasks
    pub fn close(&self) {
        self.shutdown.cancel();
        for entry in self.sessions.iter() {
            entry.value().close();
        }
        self.sessions.clear();
        info!(addr = %self.local_addr, "listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Read datagrams from one socket and shard them onto the per-worker
/// queues by conv. Transient read errors back off instead of killing the
/// task.
async fn read_task(
    index: usize,
    socket: Arc<UdpSocket>,
    dispatch_txs: Vec<mpsc::Sender<RawDatagram>>,
    read_buffer: usize,
    backoff: Duration,
    shutdown: CancellationToken,
) {
    let mut buf = buffer_pool::get_datagram_buffer();
    buf.resize(read_buffer, 0);

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        if len < consts::OVERHEAD as usize {
                            trace!(%from, len, "runt datagram dropped");
                            continue;
                        }
                        // conv is the first header field, little-endian
                        let conv = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        let worker = conv as usize % dispatch_txs.len();
                        if dispatch_txs[worker].try_send((conv, from, data)).is_err() {
                            warn!(reader = index, conv, "dispatch queue full, datagram dropped");
                        }
                    }
                    Err(e) => {
                        error!(reader = index, error = %e, "socket read failed, backing off");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    buffer_pool::put_datagram_buffer(buf);
    trace!(reader = index, "read task stopped");
}

/// Route one worker's share of the datagrams to their sessions
async fn route_task(
    mut dispatch_rx: mpsc::Receiver<RawDatagram>,
    sessions: Arc<DashMap<ConvId, Arc<Session>>>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            item = dispatch_rx.recv() => item,
            _ = shutdown.cancelled() => break,
        };
        let Some((conv, from, data)) = item else { break };

        match sessions.get(&conv) {
            Some(session) => session.input(from, data),
            None => trace!(conv, %from, "datagram for unknown conv dropped"),
        }
    }
}

/// Periodically drop registry entries whose session task has exited
async fn sweep_task(sessions: Arc<DashMap<ConvId, Arc<Session>>>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let before = sessions.len();
                sessions.retain(|_, session| !session.is_closed());
                let removed = before - sessions.len();
                if removed > 0 {
                    debug!(removed, remaining = sessions.len(), "swept closed sessions");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
