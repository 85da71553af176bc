//! Framed-stream session layer: TLV messages over TCP or WebSocket

pub mod conn;
pub mod frame;
pub mod tcp;
pub mod ws;

pub use conn::{CloseReason, ConnHandle, StreamHandler};
pub use frame::{TlvCodec, TlvFrame};
pub use tcp::TcpServer;
pub use ws::WsServer;
