//! # rapidnet - Reliable-UDP and Framed-Stream Transport
//!
//! A network transport stack with two halves:
//!
//! - **Reliable UDP**: an ARQ protocol engine ([`arq_core`]) multiplexed
//!   into sessions over shared UDP sockets, with a listener for servers
//!   and a connected-socket client.
//! - **Framed streams**: TLV-tagged messages over TCP or WebSocket with a
//!   fixed per-message request lifecycle and independent read/dispatch/
//!   write pipelines per connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rapidnet::config::{ClientConfig, ListenerConfig};
//! use rapidnet::udp::{Client, Listener};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener =
//!         Listener::bind("127.0.0.1:9000".parse()?, ListenerConfig::default()).await?;
//!     let session = listener.add_session(1, "127.0.0.1:9001".parse()?)?;
//!
//!     let client =
//!         Client::connect("127.0.0.1:9000".parse()?, 1, ClientConfig::default()).await?;
//!     client.send(Bytes::from("hello"))?;
//!
//!     let msg = session.recv().await;
//!     println!("received: {msg:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  udp: Listener / Client      │  conv demux, session registry
//! ├──────────────────────────────┤
//! │  udp: Session                │  owns one engine, FEC bridge, timing
//! ├──────────────────────────────┤
//! │  arq-core: ArqEngine         │  pure protocol state machine
//! └──────────────────────────────┘
//! ┌──────────────────────────────┐
//! │  stream: TcpServer/WsServer  │  TLV framing, request lifecycle
//! └──────────────────────────────┘
//! ```

pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod fec;
pub mod stream;
pub mod udp;

pub use config::{ClientConfig, ListenerConfig, SessionConfig, StreamConfig};
pub use error::{NetError, Result};

pub use arq_core::{ArqConfig, NoDelayConfig};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
