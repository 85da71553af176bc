//! Integration tests for the reliable-UDP listener/client pairing

use bytes::Bytes;
use rapidnet::config::{ClientConfig, ListenerConfig, SessionConfig};
use rapidnet::error::NetError;
use rapidnet::udp::{Client, Listener};
use rapidnet::ArqConfig;
use std::time::Duration;
use tokio::time::timeout;

async fn bind_listener() -> Listener {
    Listener::bind("127.0.0.1:0".parse().unwrap(), ListenerConfig::default())
        .await
        .expect("failed to bind listener")
}

#[tokio::test]
async fn test_basic_exchange() {
    let listener = bind_listener().await;

    let client = Client::connect(listener.local_addr(), 1, ClientConfig::default())
        .await
        .expect("failed to connect");
    let session = listener
        .add_session(1, client.local_addr())
        .expect("failed to register session");

    client.send(Bytes::from("hello")).expect("send failed");
    let msg = timeout(Duration::from_secs(5), session.recv())
        .await
        .expect("timed out")
        .expect("session closed");
    assert_eq!(msg, Bytes::from("hello"));

    session.send(Bytes::from("world")).expect("send failed");
    let reply = timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out")
        .expect("client closed");
    assert_eq!(reply, Bytes::from("world"));

    client.close();
    listener.close();
}

#[tokio::test]
async fn test_large_transfer() {
    // 100 kB fragments into ~73 segments, so both receive windows must be
    // wider than that for the message to reassemble
    let session_cfg =
        SessionConfig::default().arq(ArqConfig::default().fastest().window_size(128, 128));
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        ListenerConfig::default().session(session_cfg.clone()),
    )
    .await
    .expect("failed to bind listener");

    let client = Client::connect(
        listener.local_addr(),
        2,
        ClientConfig::default().session(session_cfg),
    )
    .await
    .expect("failed to connect");
    let session = listener
        .add_session(2, client.local_addr())
        .expect("failed to register session");

    // spans many fragments and several window rounds
    let data: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
    client.send(Bytes::from(data.clone())).expect("send failed");

    let msg = timeout(Duration::from_secs(10), session.recv())
        .await
        .expect("timed out")
        .expect("session closed");
    assert_eq!(msg.len(), data.len());
    assert_eq!(&msg[..], &data[..]);

    client.close();
    listener.close();
}

#[tokio::test]
async fn test_send_wider_than_receive_window_rejected() {
    let listener = bind_listener().await;
    let client = Client::connect(listener.local_addr(), 10, ClientConfig::default())
        .await
        .expect("failed to connect");

    // default windows hold 32 segments; ~73 fragments can never reassemble,
    // so the engine rejects the message on the error channel
    let data: Vec<u8> = vec![0u8; 100_000];
    client.send(Bytes::from(data)).expect("queueing succeeds");

    let err = timeout(Duration::from_secs(2), client.next_error())
        .await
        .expect("timed out")
        .expect("error channel closed");
    assert!(matches!(err, NetError::Arq(_)));

    client.close();
    listener.close();
}

#[tokio::test]
async fn test_duplicate_session_rejected() {
    let listener = bind_listener().await;
    let remote = "127.0.0.1:40001".parse().unwrap();

    let first = listener.add_session(5, remote).expect("first registration");
    let second = listener.add_session(5, remote);
    assert!(matches!(second, Err(NetError::DuplicateSession(5))));

    // the original session is untouched
    assert!(!first.is_closed());
    assert_eq!(listener.session_count(), 1);

    listener.close();
}

#[tokio::test]
async fn test_remove_session() {
    let listener = bind_listener().await;
    let remote = "127.0.0.1:40002".parse().unwrap();

    let session = listener.add_session(6, remote).expect("registration");
    listener.remove_session(6);
    assert_eq!(listener.session_count(), 0);
    // removing an unknown conv is a no-op
    listener.remove_session(6);

    // removal closes the session task
    timeout(Duration::from_secs(1), async {
        while !session.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session did not close");

    listener.close();
}

#[tokio::test]
async fn test_unknown_conv_dropped() {
    let listener = bind_listener().await;

    // conv 7 is registered, the client talks on conv 99
    let client = Client::connect(listener.local_addr(), 99, ClientConfig::default())
        .await
        .expect("failed to connect");
    let session = listener
        .add_session(7, client.local_addr())
        .expect("registration");

    client.send(Bytes::from("lost")).expect("send failed");

    let result = timeout(Duration::from_millis(300), session.recv()).await;
    assert!(result.is_err(), "datagram for unknown conv must be dropped");

    client.close();
    listener.close();
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let listener = bind_listener().await;
    let session = listener
        .add_session(8, "127.0.0.1:40003".parse().unwrap())
        .expect("registration");

    session.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        session.send(Bytes::from("late")),
        Err(NetError::Closed)
    ));

    listener.close();
}

#[tokio::test]
async fn test_large_mtu_with_sized_read_buffer() {
    // a 3000-byte MTU needs read buffers wider than the 2048 default,
    // otherwise full-size datagrams would be truncated on receive
    let session_cfg = SessionConfig::default().arq(ArqConfig::default().fastest().mtu(3000));
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        ListenerConfig::default()
            .session(session_cfg.clone())
            .read_buffer(4096),
    )
    .await
    .expect("failed to bind listener");

    let client = Client::connect(
        listener.local_addr(),
        11,
        ClientConfig::default().session(session_cfg).read_buffer(4096),
    )
    .await
    .expect("failed to connect");
    let session = listener
        .add_session(11, client.local_addr())
        .expect("registration");

    // a single fragment occupying one datagram beyond the default buffer
    let data: Vec<u8> = (0..2900).map(|i| (i % 13) as u8).collect();
    client.send(Bytes::from(data.clone())).expect("send failed");

    let msg = timeout(Duration::from_secs(5), session.recv())
        .await
        .expect("timed out")
        .expect("session closed");
    assert_eq!(&msg[..], &data[..]);

    client.close();
    listener.close();
}

#[tokio::test]
async fn test_mtu_above_read_buffer_rejected() {
    // listener-wide config
    let session_cfg = SessionConfig::default().arq(ArqConfig::default().mtu(3000));
    let result = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        ListenerConfig::default().session(session_cfg.clone()),
    )
    .await;
    assert!(matches!(result, Err(NetError::Config { .. })));

    // per-session override
    let listener = bind_listener().await;
    let result = listener.add_session_with(
        12,
        "127.0.0.1:40004".parse().unwrap(),
        session_cfg,
        None,
    );
    assert!(matches!(result, Err(NetError::Config { .. })));
    assert_eq!(listener.session_count(), 0);

    listener.close();
}

#[tokio::test]
async fn test_sessions_route_across_workers() {
    // consecutive convs shard onto different routing workers
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        ListenerConfig::default().workers(2),
    )
    .await
    .expect("failed to bind listener");

    let first = Client::connect(listener.local_addr(), 21, ClientConfig::default())
        .await
        .expect("failed to connect");
    let second = Client::connect(listener.local_addr(), 22, ClientConfig::default())
        .await
        .expect("failed to connect");
    let first_session = listener
        .add_session(21, first.local_addr())
        .expect("registration");
    let second_session = listener
        .add_session(22, second.local_addr())
        .expect("registration");

    first.send(Bytes::from("odd")).expect("send failed");
    second.send(Bytes::from("even")).expect("send failed");

    let msg = timeout(Duration::from_secs(5), first_session.recv())
        .await
        .expect("timed out")
        .expect("session closed");
    assert_eq!(msg, Bytes::from("odd"));
    let msg = timeout(Duration::from_secs(5), second_session.recv())
        .await
        .expect("timed out")
        .expect("session closed");
    assert_eq!(msg, Bytes::from("even"));

    first.close();
    second.close();
    listener.close();
}

#[tokio::test]
async fn test_many_messages_in_order() {
    let listener = bind_listener().await;

    let client = Client::connect(listener.local_addr(), 9, ClientConfig::default())
        .await
        .expect("failed to connect");
    let session = listener
        .add_session(9, client.local_addr())
        .expect("registration");

    let count = 20u8;
    for i in 0..count {
        client.send(Bytes::from(vec![i; 32])).expect("send failed");
        // pace the sends so the bounded recv queue never overflows
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for i in 0..count {
        let msg = timeout(Duration::from_secs(5), session.recv())
            .await
            .expect("timed out")
            .expect("session closed");
        assert_eq!(&msg[..], &vec![i; 32][..]);
    }

    client.close();
    listener.close();
}
