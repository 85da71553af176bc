//! Reliable-UDP session
//!
//! A session owns one ARQ engine inside a dedicated task and communicates
//! through bounded channels. No locks on the packet path: datagrams, app
//! messages, and errors each travel over their own queue, and a full queue
//! drops the item rather than blocking the producer.

use crate::config::SessionConfig;
use crate::error::{NetError, Result};
use crate::fec::{FecCodec, PassthroughFec};

use arq_core::{ArqEngine, ArqStats, ConvId};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// One logical conversation over a shared or owned UDP socket.
///
/// Created by [`Listener::add_session`](crate::udp::Listener::add_session)
/// or [`Client::connect`](crate::udp::Client::connect).
pub struct Session {
    conv: ConvId,
    remote_addr: Arc<RwLock<SocketAddr>>,

    input_tx: mpsc::Sender<(SocketAddr, Bytes)>,
    send_tx: mpsc::Sender<Bytes>,
    error_tx: mpsc::Sender<NetError>,
    data_rx: Mutex<mpsc::Receiver<Bytes>>,
    error_rx: Mutex<mpsc::Receiver<NetError>>,
    stats_rx: watch::Receiver<ArqStats>,

    closed: CancellationToken,
}

impl Session {
    /// Spawn a session task around a fresh engine.
    pub(crate) fn spawn(
        conv: ConvId,
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        config: SessionConfig,
        fec: Option<Box<dyn FecCodec>>,
    ) -> Result<Self> {
        config.validate()?;
        let engine = ArqEngine::new(conv, config.arq.clone())?;

        let (input_tx, input_rx) = mpsc::channel(config.recv_queue);
        let (send_tx, send_rx) = mpsc::channel(config.send_queue);
        let (data_tx, data_rx) = mpsc::channel(config.recv_queue);
        let (error_tx, error_rx) = mpsc::channel(config.error_queue);
        let (stats_tx, stats_rx) = watch::channel(ArqStats::default());
        let closed = CancellationToken::new();
        let remote_addr = Arc::new(RwLock::new(remote));

        let task = SessionTask {
            engine,
            socket,
            remote,
            remote_addr: remote_addr.clone(),
            config,
            fec: fec.unwrap_or_else(|| Box::new(PassthroughFec)),
            input_rx,
            send_rx,
            data_tx,
            error_tx: error_tx.clone(),
            stats_tx,
            closed: closed.clone(),
        };
        tokio::spawn(task.run());

        Ok(Self {
            conv,
            remote_addr,
            input_tx,
            send_tx,
            error_tx,
            data_rx: Mutex::new(data_rx),
            error_rx: Mutex::new(error_rx),
            stats_rx,
            closed,
        })
    }

    /// Conversation ID of this session
    pub fn conv(&self) -> ConvId {
        self.conv
    }

    /// Address of the most recent datagram from the peer
    pub async fn remote_addr(&self) -> SocketAddr {
        *self.remote_addr.read().await
    }

    /// Queue one message for reliable delivery. Fails with
    /// [`NetError::ChannelFull`] instead of blocking when the send queue
    /// is saturated.
    pub fn send(&self, data: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(NetError::Closed);
        }
        self.send_tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetError::ChannelFull { name: "send" },
            mpsc::error::TrySendError::Closed(_) => NetError::Closed,
        })
    }

    /// Receive the next complete message, or None once the session closed
    pub async fn recv(&self) -> Option<Bytes> {
        self.data_rx.lock().await.recv().await
    }

    /// Next asynchronous session error, or None once the session closed
    pub async fn next_error(&self) -> Option<NetError> {
        self.error_rx.lock().await.recv().await
    }

    /// Snapshot of the engine counters, refreshed every tick
    pub fn stats(&self) -> ArqStats {
        self.stats_rx.borrow().clone()
    }

    /// Route one raw datagram into the session. Drops the datagram with a
    /// warning when the inbound queue is full.
    pub(crate) fn input(&self, from: SocketAddr, datagram: Bytes) {
        if self.input_tx.try_send((from, datagram)).is_err() {
            warn!(conv = self.conv, %from, "inbound queue full, datagram dropped");
        }
    }

    /// Sender half of the inbound datagram queue, for external read loops
    pub(crate) fn input_sender(&self) -> mpsc::Sender<(SocketAddr, Bytes)> {
        self.input_tx.clone()
    }

    /// Sender half of the error queue, for external read loops
    pub(crate) fn error_sender(&self) -> mpsc::Sender<NetError> {
        self.error_tx.clone()
    }

    /// Token cancelled when the session closes
    pub(crate) fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the session. Idempotent; pending outbound data gets one final
    /// flush before the task exits.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// State owned exclusively by the session task
struct SessionTask {
    engine: ArqEngine,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    remote_addr: Arc<RwLock<SocketAddr>>,
    config: SessionConfig,
    fec: Box<dyn FecCodec>,

    input_rx: mpsc::Receiver<(SocketAddr, Bytes)>,
    send_rx: mpsc::Receiver<Bytes>,
    data_tx: mpsc::Sender<Bytes>,
    error_tx: mpsc::Sender<NetError>,
    stats_tx: watch::Sender<ArqStats>,
    closed: CancellationToken,
}

impl SessionTask {
    async fn run(mut self) {
        let start = Instant::now();
        let mut tick = tokio::time::interval(self.config.update_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(conv = self.engine.conv(), remote = %self.remote, "session started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = start.elapsed().as_millis() as u32;
                    self.engine.update(now);
                    self.flush_output().await;

                    if self.engine.is_dead() {
                        error!(conv = self.engine.conv(), "dead link, closing session");
                        self.report(NetError::Arq(arq_core::ArqError::DeadLink));
                        break;
                    }

                    let _ = self.stats_tx.send(self.engine.stats().clone());
                }

                msg = self.send_rx.recv() => {
                    let Some(data) = msg else { break };
                    if let Err(e) = self.engine.send(data) {
                        self.report(NetError::Arq(e));
                        continue;
                    }
                    // opportunistic flush so small sends don't wait a tick
                    self.engine.flush(false);
                    self.flush_output().await;
                }

                packet = self.input_rx.recv() => {
                    let Some((from, datagram)) = packet else { break };
                    self.handle_datagram(from, datagram).await;
                }

                _ = self.closed.cancelled() => {
                    self.engine.flush(false);
                    self.flush_output().await;
                    break;
                }
            }
        }

        self.closed.cancel();
        debug!(conv = self.engine.conv(), "session stopped");
    }

    async fn handle_datagram(&mut self, from: SocketAddr, datagram: Bytes) {
        // the peer may roam between addresses: last writer wins
        if from != self.remote {
            debug!(conv = self.engine.conv(), old = %self.remote, new = %from,
                "peer address changed");
            self.remote = from;
            *self.remote_addr.write().await = from;
        }

        for (payload, regular) in self.fec.decode(datagram) {
            if let Err(e) = self
                .engine
                .input(payload, regular, self.config.ack_nodelay)
            {
                warn!(conv = self.engine.conv(), error = %e, "datagram rejected");
            }
        }

        self.flush_output().await;

        while let Some(msg) = self.engine.recv() {
            if let Err(mpsc::error::TrySendError::Full(_)) = self.data_tx.try_send(msg) {
                warn!(conv = self.engine.conv(), "recv queue full, message dropped");
            }
        }
    }

    /// Push staged engine datagrams through FEC and onto the socket.
    /// Writes go out one `send_to` at a time; coalescing a cycle's shards
    /// into a batched syscall would change throughput, not delivery.
    async fn flush_output(&mut self) {
        let packets: Vec<Bytes> = self.engine.drain_output().collect();
        for packet in packets {
            for datagram in self.fec.encode(packet) {
                if let Err(e) = self.socket.send_to(&datagram, self.remote).await {
                    trace!(conv = self.engine.conv(), error = %e, "send_to failed");
                }
            }
        }
    }

    fn report(&self, err: NetError) {
        if self.error_tx.try_send(err).is_err() {
            trace!(conv = self.engine.conv(), "error queue full");
        }
    }
}
