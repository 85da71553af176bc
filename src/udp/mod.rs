//! Reliable-UDP transport: sessions multiplexed by conversation ID

pub mod client;
pub mod listener;
pub mod session;

pub use client::Client;
pub use listener::Listener;
pub use session::Session;

use crate::error::Result;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Bind a nonblocking UDP socket with optional receive-buffer sizing and
/// reuse-port sharding.
pub(crate) fn bind_socket(
    addr: SocketAddr,
    recv_buffer: Option<usize>,
    reuse_port: bool,
) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if let Some(size) = recv_buffer {
        socket.set_recv_buffer_size(size)?;
    }
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}
