//! Configuration types for the transport stack

use crate::error::{NetError, Result};
use arq_core::ArqConfig;
use std::time::Duration;

/// Configuration for one reliable-UDP session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Engine tuning, passed through to the protocol core
    pub arq: ArqConfig,
    /// Flush acks immediately instead of waiting for the next tick
    pub ack_nodelay: bool,
    /// Engine tick driving flushes and retransmit checks
    pub update_interval: Duration,
    /// Depth of the inbound datagram channel
    pub recv_queue: usize,
    /// Depth of the outbound message channel
    pub send_queue: usize,
    /// Depth of the error notification channel
    pub error_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            arq: ArqConfig::default().fastest(),
            ack_nodelay: true,
            update_interval: Duration::from_millis(10),
            recv_queue: 64,
            send_queue: 64,
            error_queue: 32,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arq(mut self, arq: ArqConfig) -> Self {
        self.arq = arq;
        self
    }

    pub fn ack_nodelay(mut self, enabled: bool) -> Self {
        self.ack_nodelay = enabled;
        self
    }

    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.arq.validate()?;
        if self.update_interval.is_zero() {
            return Err(NetError::config("update interval must be greater than 0"));
        }
        if self.recv_queue == 0 || self.send_queue == 0 || self.error_queue == 0 {
            return Err(NetError::config("queue depths must be greater than 0"));
        }
        Ok(())
    }
}

/// Configuration for the UDP listener
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Per-session defaults
    pub session: SessionConfig,
    /// Number of reuse-port sockets reading in parallel
    pub acceptor_count: usize,
    /// Number of workers parsing and routing datagrams
    pub worker_count: usize,
    /// Depth of each worker's datagram dispatch queue
    pub dispatch_queue: usize,
    /// Size of the per-socket read buffer; bounds the largest datagram
    /// that can be received, so it must cover the configured MTU
    pub read_buffer: usize,
    /// Delay before retrying after a socket read failure
    pub read_backoff: Duration,
    /// OS receive buffer size for each socket
    pub socket_recv_buffer: Option<usize>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            acceptor_count: 1,
            worker_count: 4,
            dispatch_queue: 4096,
            read_buffer: 2048,
            read_backoff: Duration::from_secs(3),
            socket_recv_buffer: None,
        }
    }
}

impl ListenerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn acceptors(mut self, count: usize) -> Self {
        self.acceptor_count = count;
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn read_buffer(mut self, size: usize) -> Self {
        self.read_buffer = size;
        self
    }

    pub fn socket_recv_buffer(mut self, size: usize) -> Self {
        self.socket_recv_buffer = Some(size);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        if self.acceptor_count == 0 || self.worker_count == 0 {
            return Err(NetError::config("acceptor and worker counts must be greater than 0"));
        }
        if self.dispatch_queue == 0 {
            return Err(NetError::config("dispatch queue depth must be greater than 0"));
        }
        validate_read_buffer(self.session.arq.mtu, self.read_buffer)?;
        Ok(())
    }
}

/// A datagram larger than the read buffer would be silently truncated by
/// `recv_from`, so the buffer must cover the MTU.
pub(crate) fn validate_read_buffer(mtu: u32, read_buffer: usize) -> Result<()> {
    if mtu as usize > read_buffer {
        return Err(NetError::config(format!(
            "mtu {mtu} exceeds the read buffer size {read_buffer}"
        )));
    }
    Ok(())
}

/// Configuration for the UDP client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-session defaults
    pub session: SessionConfig,
    /// Size of the socket read buffer; must cover the configured MTU
    pub read_buffer: usize,
    /// OS receive buffer size for the socket
    pub socket_recv_buffer: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            read_buffer: 2048,
            socket_recv_buffer: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn read_buffer(mut self, size: usize) -> Self {
        self.read_buffer = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        validate_read_buffer(self.session.arq.mtu, self.read_buffer)
    }
}

/// Configuration for framed-stream servers (TCP and WebSocket)
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Largest accepted frame payload in bytes
    pub max_frame_bytes: usize,
    /// Close the connection when no frame arrives within this window
    pub recv_timeout: Option<Duration>,
    /// Give up on a single write after this long
    pub write_timeout: Duration,
    /// Depth of the per-connection outbound frame channel
    pub write_queue: usize,
    /// Depth of the per-connection inbound frame channel
    pub recv_queue: usize,
    /// Drain window granted to in-flight writes before the socket closes
    pub close_grace: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 64 * 1024,
            recv_timeout: Some(Duration::from_secs(60)),
            write_timeout: Duration::from_secs(5),
            write_queue: 64,
            recv_queue: 64,
            close_grace: Duration::from_millis(100),
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn recv_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes == 0 {
            return Err(NetError::config("max frame size must be greater than 0"));
        }
        if self.write_queue == 0 || self.recv_queue == 0 {
            return Err(NetError::config("queue depths must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(ListenerConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
        assert!(StreamConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_update_interval() {
        let cfg = SessionConfig::default().update_interval(Duration::ZERO);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = ListenerConfig::default().workers(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_mtu_above_read_buffer() {
        let session = SessionConfig::default().arq(ArqConfig::default().mtu(3000));

        let listener = ListenerConfig::default().session(session.clone());
        assert!(listener.validate().is_err());
        let listener = ListenerConfig::default().session(session.clone()).read_buffer(4096);
        assert!(listener.validate().is_ok());

        let client = ClientConfig::default().session(session.clone());
        assert!(client.validate().is_err());
        let client = ClientConfig::default().session(session).read_buffer(4096);
        assert!(client.validate().is_ok());
    }
}
