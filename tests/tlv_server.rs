//! Integration tests for the TCP and WebSocket framed-stream servers

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rapidnet::config::StreamConfig;
use rapidnet::error::Result;
use rapidnet::stream::{CloseReason, ConnHandle, StreamHandler, TcpServer, TlvCodec, TlvFrame, WsServer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio::time::timeout;

/// Echoes every request, records what it saw, panics on demand
#[derive(Default)]
struct RecordingHandler {
    seen_tags: Mutex<Vec<u32>>,
    close_reason: Mutex<Option<CloseReason>>,
    server_close_ran: AtomicBool,
    server_closed_ran: AtomicBool,
}

#[async_trait]
impl StreamHandler for RecordingHandler {
    async fn pre_handle_request(
        &self,
        _conn: &ConnHandle,
        frame: &TlvFrame,
    ) -> Result<Option<TlvFrame>> {
        // tag 99 short-circuits without reaching handle_request
        if frame.tag == 99 {
            return Ok(Some(TlvFrame::new(99, Bytes::from_static(b"intercepted"))));
        }
        Ok(None)
    }

    async fn handle_request(&self, _conn: &ConnHandle, frame: TlvFrame) -> Result<Option<TlvFrame>> {
        if frame.tag == 13 {
            panic!("handler bug");
        }
        self.seen_tags.lock().unwrap().push(frame.tag);
        Ok(Some(frame))
    }

    async fn on_server_close(&self, _conn: &ConnHandle) {
        self.server_close_ran.store(true, Ordering::SeqCst);
    }

    async fn on_server_closed(&self, _conn: &ConnHandle) {
        self.server_closed_ran.store(true, Ordering::SeqCst);
    }

    async fn on_client_closed(&self, _conn: &ConnHandle, reason: CloseReason) {
        *self.close_reason.lock().unwrap() = Some(reason);
    }
}

async fn start_tcp(config: StreamConfig) -> (TcpServer, Arc<RecordingHandler>) {
    let handler = Arc::new(RecordingHandler::default());
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), config, handler.clone())
        .await
        .expect("failed to bind server");
    (server, handler)
}

async fn connect(server: &TcpServer) -> Framed<TcpStream, TlvCodec> {
    let stream = TcpStream::connect(server.local_addr())
        .await
        .expect("failed to connect");
    Framed::new(stream, TlvCodec::new(64 * 1024))
}

#[tokio::test]
async fn test_two_tags_dispatch_in_order() {
    let (server, handler) = start_tcp(StreamConfig::default()).await;
    let mut framed = connect(&server).await;

    framed
        .send(TlvFrame::new(1, Bytes::from_static(b"first")))
        .await
        .unwrap();
    framed
        .send(TlvFrame::new(2, Bytes::from_static(b"second")))
        .await
        .unwrap();

    let a = timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out")
        .expect("connection closed")
        .expect("decode failed");
    let b = timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out")
        .expect("connection closed")
        .expect("decode failed");

    assert_eq!((a.tag, &a.payload[..]), (1, &b"first"[..]));
    assert_eq!((b.tag, &b.payload[..]), (2, &b"second"[..]));
    assert_eq!(*handler.seen_tags.lock().unwrap(), vec![1, 2]);

    server.close();
}

#[tokio::test]
async fn test_pre_handle_short_circuit() {
    let (server, handler) = start_tcp(StreamConfig::default()).await;
    let mut framed = connect(&server).await;

    framed
        .send(TlvFrame::new(99, Bytes::from_static(b"ignored")))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out")
        .expect("connection closed")
        .expect("decode failed");
    assert_eq!(reply.payload, Bytes::from_static(b"intercepted"));
    // handle_request never ran
    assert!(handler.seen_tags.lock().unwrap().is_empty());

    server.close();
}

#[tokio::test]
async fn test_oversize_frame_closes_connection() {
    let config = StreamConfig::default().max_frame_bytes(16);
    let (server, handler) = start_tcp(config).await;

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    // declared length of max + 1, written raw
    let mut raw = BytesMut::new();
    let mut codec = TlvCodec::new(64 * 1024);
    tokio_util::codec::Encoder::encode(
        &mut codec,
        TlvFrame::new(1, Bytes::from(vec![0u8; 17])),
        &mut raw,
    )
    .unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut stream, &raw)
        .await
        .unwrap();

    // the server closes cleanly: the client sees EOF, no response bytes
    let mut buf = [0u8; 64];
    let n = timeout(
        Duration::from_secs(5),
        tokio::io::AsyncReadExt::read(&mut stream, &mut buf),
    )
    .await
    .expect("timed out")
    .expect("read failed");
    assert_eq!(n, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        *handler.close_reason.lock().unwrap(),
        Some(CloseReason::Protocol)
    );
    assert_eq!(server.conn_count(), 0);
}

#[tokio::test]
async fn test_panic_recovered_at_message_boundary() {
    let (server, handler) = start_tcp(StreamConfig::default()).await;
    let mut framed = connect(&server).await;

    // tag 13 panics inside the handler; the connection must survive
    framed
        .send(TlvFrame::new(13, Bytes::from_static(b"boom")))
        .await
        .unwrap();
    framed
        .send(TlvFrame::new(4, Bytes::from_static(b"after")))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out")
        .expect("connection closed")
        .expect("decode failed");
    assert_eq!((reply.tag, &reply.payload[..]), (4, &b"after"[..]));
    assert_eq!(*handler.seen_tags.lock().unwrap(), vec![4]);

    server.close();
}

#[tokio::test]
async fn test_recv_timeout_closes_with_timeout_reason() {
    let config = StreamConfig::default().recv_timeout(Some(Duration::from_millis(100)));
    let (server, handler) = start_tcp(config).await;

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    // send nothing: the read deadline expires and the server closes
    let mut buf = [0u8; 16];
    let n = timeout(
        Duration::from_secs(5),
        tokio::io::AsyncReadExt::read(&mut stream, &mut buf),
    )
    .await
    .expect("timed out")
    .expect("read failed");
    assert_eq!(n, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        *handler.close_reason.lock().unwrap(),
        Some(CloseReason::Timeout)
    );
}

#[tokio::test]
async fn test_server_side_close_runs_hooks() {
    let (server, handler) = start_tcp(StreamConfig::default()).await;
    let mut framed = connect(&server).await;

    // a first exchange so the connection is registered and we can find it
    framed
        .send(TlvFrame::new(1, Bytes::from_static(b"hi")))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out");

    assert_eq!(server.conn_count(), 1);
    let id = server.conn_ids()[0];

    server.close_conn(id).await.expect("close failed");
    assert!(handler.server_close_ran.load(Ordering::SeqCst));
    assert!(handler.server_closed_ran.load(Ordering::SeqCst));
    assert_eq!(server.conn_count(), 0);

    // the client observes the socket closing
    let eof = timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out");
    assert!(eof.is_none() || eof.unwrap().is_err());
}

#[tokio::test]
async fn test_server_push_notify() {
    let (server, _handler) = start_tcp(StreamConfig::default()).await;
    let mut framed = connect(&server).await;

    // a first exchange so the connection is registered and we can find it
    framed
        .send(TlvFrame::new(1, Bytes::from_static(b"hi")))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out");

    let id = server.conn_ids()[0];
    server
        .notify(id, TlvFrame::new(7, Bytes::from_static(b"push")))
        .await
        .expect("notify failed");

    let pushed = timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out")
        .expect("connection closed")
        .expect("decode failed");
    assert_eq!((pushed.tag, &pushed.payload[..]), (7, &b"push"[..]));

    // pushing to an unknown connection is an error
    assert!(server
        .notify(id + 1, TlvFrame::new(7, Bytes::new()))
        .await
        .is_err());

    server.close();
}

#[tokio::test]
async fn test_ws_echo_roundtrip() {
    let handler = Arc::new(RecordingHandler::default());
    let server = WsServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        StreamConfig::default(),
        handler.clone(),
    )
    .await
    .expect("failed to bind ws server");

    let url = format!("ws://{}", server.local_addr());
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("failed to connect");

    ws.send(tokio_tungstenite::tungstenite::Message::Text(
        r#"{"msg_id":5,"payload":"ping"}"#.to_string(),
    ))
    .await
    .unwrap();

    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out")
        .expect("connection closed")
        .expect("ws error");
    let text = reply.into_text().expect("expected text frame");
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["msg_id"], 5);
    assert_eq!(value["payload"], "ping");
    assert_eq!(*handler.seen_tags.lock().unwrap(), vec![5]);

    server.close();
}
