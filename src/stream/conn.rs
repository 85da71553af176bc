//! Per-connection lifecycle shared by the TCP and WebSocket servers
//!
//! Every connection runs three independent tasks: a read loop feeding a
//! bounded receive queue, a dispatch loop driving the request lifecycle,
//! and a write loop draining a bounded send queue. A panic while handling
//! one message is caught at the message boundary; the connection's other
//! work continues.

use crate::error::{NetError, Result};
use crate::stream::frame::TlvFrame;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Why a connection went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the socket or the read failed fatally
    Remote,
    /// No frame arrived within the configured receive window
    Timeout,
    /// Framing violation (oversized or malformed frame)
    Protocol,
}

/// Application callbacks around the per-message lifecycle and connection
/// teardown. All methods default to no-ops.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Runs before [`StreamHandler::handle_request`]. Returning a frame
    /// short-circuits the lifecycle with that response.
    async fn pre_handle_request(
        &self,
        _conn: &ConnHandle,
        _frame: &TlvFrame,
    ) -> Result<Option<TlvFrame>> {
        Ok(None)
    }

    /// Produce an optional response for one inbound frame
    async fn handle_request(&self, conn: &ConnHandle, frame: TlvFrame)
        -> Result<Option<TlvFrame>>;

    /// Last chance to adjust a response before it is queued for writing
    async fn pre_handle_response(&self, _conn: &ConnHandle, _frame: &mut TlvFrame) -> Result<()> {
        Ok(())
    }

    /// Runs after a response was queued
    async fn post_handle_response(&self, _conn: &ConnHandle, _frame: &TlvFrame) {}

    /// Runs before a server-pushed frame is queued for writing
    async fn pre_handle_notify(&self, _conn: &ConnHandle, _frame: &mut TlvFrame) -> Result<()> {
        Ok(())
    }

    /// Server-initiated close, before the socket is torn down
    async fn on_server_close(&self, _conn: &ConnHandle) {}

    /// Server-initiated close, after the socket is gone
    async fn on_server_closed(&self, _conn: &ConnHandle) {}

    /// Close that originated with the peer, a timeout, or a framing error
    async fn on_client_closed(&self, _conn: &ConnHandle, _reason: CloseReason) {}
}

const INITIAL_CONN_ID: i64 = 10_000_000;

static NEXT_CONN_ID: AtomicI64 = AtomicI64::new(INITIAL_CONN_ID);

/// Allocate a process-unique connection ID. Wraps back to 1 before the
/// counter could overflow into negative territory.
pub(crate) fn next_conn_id() -> i64 {
    loop {
        let id = NEXT_CONN_ID.load(Ordering::Relaxed);
        let next = if id == i64::MAX { 1 } else { id + 1 };
        if NEXT_CONN_ID
            .compare_exchange_weak(id, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return id;
        }
    }
}

/// Shared handle to one framed-stream connection
pub struct ConnHandle {
    id: i64,
    remote_addr: SocketAddr,
    send_tx: mpsc::Sender<TlvFrame>,
    closed: CancellationToken,
}

impl ConnHandle {
    pub(crate) fn new(
        id: i64,
        remote_addr: SocketAddr,
        send_tx: mpsc::Sender<TlvFrame>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote_addr,
            send_tx,
            closed,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue a frame for the write loop. Fails instead of blocking when
    /// the send queue is full.
    pub fn send(&self, frame: TlvFrame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(NetError::Closed);
        }
        self.send_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetError::ChannelFull { name: "write" },
            mpsc::error::TrySendError::Closed(_) => NetError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Registry of live connections, keyed by connection ID
pub(crate) type ConnRegistry = Arc<DashMap<i64, Arc<ConnHandle>>>;

/// Dispatch loop: drive the request lifecycle for each queued frame
pub(crate) async fn run_dispatch(
    conn: Arc<ConnHandle>,
    handler: Arc<dyn StreamHandler>,
    mut recv_rx: mpsc::Receiver<TlvFrame>,
) {
    loop {
        let frame = tokio::select! {
            frame = recv_rx.recv() => frame,
            _ = conn.closed.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        dispatch_frame(&conn, &handler, frame).await;
    }
}

/// One trip through the lifecycle. Stage errors abort this message only;
/// panics are recovered here so the connection survives.
async fn dispatch_frame(conn: &ConnHandle, handler: &Arc<dyn StreamHandler>, frame: TlvFrame) {
    let tag = frame.tag;
    let outcome = AssertUnwindSafe(async {
        let response = match handler.pre_handle_request(conn, &frame).await? {
            Some(response) => Some(response),
            None => handler.handle_request(conn, frame).await?,
        };

        if let Some(mut response) = response {
            handler.pre_handle_response(conn, &mut response).await?;
            conn.send(response.clone())?;
            handler.post_handle_response(conn, &response).await;
        }
        Ok::<(), NetError>(())
    })
    .catch_unwind()
    .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(conn = conn.id, tag, error = %e, "request aborted");
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(conn = conn.id, tag, panic = %msg, "handler panicked, message dropped");
        }
    }
}

/// Server push: run the notify hook, then queue the frame for writing
pub(crate) async fn notify(
    conns: &ConnRegistry,
    handler: &Arc<dyn StreamHandler>,
    id: i64,
    mut frame: TlvFrame,
) -> Result<()> {
    let Some(conn) = conns.get(&id).map(|c| c.value().clone()) else {
        return Err(NetError::ConnectionNotFound(id));
    };
    handler.pre_handle_notify(&conn, &mut frame).await?;
    conn.send(frame)
}

/// Server-initiated close: deregister first so no new work is dispatched,
/// run the pre-close hook, grant in-flight writes a grace window, then cut
/// the socket and run the post-close hook.
pub(crate) async fn server_close(
    conns: &ConnRegistry,
    handler: &Arc<dyn StreamHandler>,
    id: i64,
    grace: Duration,
) -> Result<()> {
    let Some((_, conn)) = conns.remove(&id) else {
        return Err(NetError::ConnectionNotFound(id));
    };

    handler.on_server_close(&conn).await;
    if !grace.is_zero() {
        tokio::time::sleep(grace).await;
    }
    conn.closed.cancel();
    handler.on_server_closed(&conn).await;
    debug!(conn = id, "connection closed by server");
    Ok(())
}

/// Peer-initiated close: deregister, run the client-closed hook, cut the
/// socket.
pub(crate) async fn client_close(
    conns: &ConnRegistry,
    handler: &Arc<dyn StreamHandler>,
    id: i64,
    reason: CloseReason,
) {
    let Some((_, conn)) = conns.remove(&id) else {
        return;
    };

    handler.on_client_closed(&conn, reason).await;
    conn.closed.cancel();
    debug!(conn = id, ?reason, "connection closed by peer");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_ids_are_unique_and_increasing() {
        let a = next_conn_id();
        let b = next_conn_id();
        assert!(b > a);
        assert!(a >= 1);
    }
}
