//! Pure synchronous ARQ protocol engine.
//!
//! Implements the reliable-UDP ARQ protocol with zero runtime dependencies:
//! no tokio, no async, no I/O. The only dependency is `bytes`.
//!
//! The engine never touches a socket or a clock. Callers own both sides of
//! the boundary:
//!
//! - feed received datagrams in with [`ArqEngine::input`]
//! - queue application data with [`ArqEngine::send`]
//! - drive timing with [`ArqEngine::update`] and [`ArqEngine::check`],
//!   passing explicit millisecond timestamps
//! - pull reassembled messages with [`ArqEngine::recv`]
//! - pull outbound datagrams with [`ArqEngine::drain_output`]

pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;

pub use config::{ArqConfig, NoDelayConfig};
pub use engine::{ArqEngine, ArqStats};
pub use error::{ArqError, ArqResult};
pub use protocol::*;
