use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time;

use relnet::{
    Conn, Dialer, Error, Event, ListenConfig, Listener, ProtocolVersion, Reliability,
};

/// Routes transport logs into the test harness, filtered by `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn dialer() -> Dialer {
    init_tracing();
    Dialer {
        timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn listen(config: ListenConfig) -> Listener {
    init_tracing();
    Listener::listen_with("127.0.0.1:0", config).await.unwrap()
}

/// A user payload: a tag byte in the user range followed by the content.
fn user_payload(content: &[u8]) -> Vec<u8> {
    let mut payload = vec![0xFEu8];
    payload.extend_from_slice(content);
    payload
}

#[tokio::test]
async fn test_connect_and_echo() {
    let mut listener = listen(ListenConfig::default()).await;
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let mut buf = [0u8; 1500];
        let n = conn.read(&mut buf).await.unwrap();
        conn.write(&buf[..n]).await.unwrap();
        // Keep the connection alive until the client is done with it.
        time::sleep(Duration::from_secs(2)).await;
    });

    let conn = dialer().dial(addr).await.unwrap();
    assert!(conn.is_connected());

    let payload = user_payload(b"hello over reliable transport");
    conn.write(&payload).await.unwrap();

    let mut buf = [0u8; 1500];
    let n = time::timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], payload.as_slice());

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_large_payload_is_split_and_reassembled() {
    let mut listener = listen(ListenConfig::default()).await;
    let addr = listener.local_addr().unwrap();

    let mut payload = user_payload(&[]);
    payload.extend((0..20_000u32).map(|i| i as u8));
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let data = time::timeout(Duration::from_secs(10), conn.read_packet())
            .await
            .unwrap()
            .unwrap();
        data.to_vec()
    });

    let conn = dialer().dial(addr).await.unwrap();
    conn.write(&payload).await.unwrap();

    let received = server.await.unwrap();
    assert_eq!(received, expected);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_multiple_messages_arrive_in_order() {
    let mut listener = listen(ListenConfig::default()).await;
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let mut received = Vec::new();
        for _ in 0..20 {
            let data = time::timeout(Duration::from_secs(10), conn.read_packet())
                .await
                .unwrap()
                .unwrap();
            received.push(data[1]);
        }
        received
    });

    let conn = dialer().dial(addr).await.unwrap();
    for i in 0..20u8 {
        conn.write_with(&[0xFE, i], Reliability::ReliableOrdered, 0)
            .await
            .unwrap();
    }

    let received = server.await.unwrap();
    assert_eq!(received, (0..20).collect::<Vec<u8>>());
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_password_mismatch_rejected() {
    let mut listener = listen(ListenConfig {
        password: b"secret".to_vec(),
        ..Default::default()
    })
    .await;
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        // The handshake never completes; hold the listener open regardless.
        let _ = listener.accept().await;
    });

    let result = Dialer {
        password: b"wrong".to_vec(),
        timeout: Duration::from_secs(5),
        ..Default::default()
    }
    .dial(addr)
    .await;

    assert!(matches!(result, Err(Error::InvalidPassword)));
}

#[tokio::test]
async fn test_password_match_accepted() {
    let mut listener = listen(ListenConfig {
        password: b"secret".to_vec(),
        ..Default::default()
    })
    .await;
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = listener.accept().await;
        time::sleep(Duration::from_secs(2)).await;
    });

    let conn = Dialer {
        password: b"secret".to_vec(),
        timeout: Duration::from_secs(5),
        ..Default::default()
    }
    .dial(addr)
    .await
    .unwrap();

    assert!(conn.is_connected());
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_banned_address_rejected() {
    let mut listener = listen(ListenConfig::default()).await;
    let addr = listener.local_addr().unwrap();

    listener.ban("127.0.0.1".parse().unwrap(), None);

    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let result = dialer().dial(addr).await;
    assert!(matches!(result, Err(Error::ConnectionBanned)));
}

#[tokio::test]
async fn test_mismatched_revision_does_not_connect() {
    let mut listener = listen(ListenConfig {
        version: ProtocolVersion::V8935,
        ..Default::default()
    })
    .await;
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let result = Dialer {
        version: ProtocolVersion::V8910,
        timeout: Duration::from_secs(3),
        ..Default::default()
    }
    .dial(addr)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_dial_unanswered_address_times_out() {
    // A bound socket that never answers.
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let result = dialer().dial(addr).await;
    assert!(matches!(result, Err(Error::Timeout)));
}

#[tokio::test]
async fn test_unconnected_ping_returns_pong_data() {
    let mut listener = listen(ListenConfig {
        pong_data: b"MOTD;players=3".to_vec(),
        ..Default::default()
    })
    .await;
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let data = dialer().ping(addr).await.unwrap();
    assert_eq!(data, b"MOTD;players=3");
}

#[tokio::test]
async fn test_static_data_exchanged_after_connect() {
    let mut listener = listen(ListenConfig {
        static_data: b"server blob".to_vec(),
        ..Default::default()
    })
    .await;
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let conn: Arc<Conn> = listener.accept().await.unwrap();
        // Wait for the client's blob to arrive.
        loop {
            match time::timeout(Duration::from_secs(5), conn.next_event()).await {
                Ok(Some(Event::StaticDataReceived { data, .. })) => return data,
                Ok(Some(_)) => continue,
                other => panic!("expected static data event, got {other:?}"),
            }
        }
    });

    let conn = Dialer {
        static_data: b"client blob".to_vec(),
        timeout: Duration::from_secs(5),
        ..Default::default()
    }
    .dial(addr)
    .await
    .unwrap();

    assert_eq!(server.await.unwrap(), b"client blob");

    // The server's blob reaches the client as well.
    let mut waited = Duration::ZERO;
    while conn.remote_static_data().is_empty() && waited < Duration::from_secs(5) {
        time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    assert_eq!(conn.remote_static_data(), b"server blob");

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_graceful_close_notifies_peer() {
    let mut listener = listen(ListenConfig::default()).await;
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        loop {
            match time::timeout(Duration::from_secs(10), conn.next_event()).await {
                Ok(Some(Event::DisconnectionNotification { .. })) => return,
                Ok(Some(_)) => continue,
                other => panic!("expected disconnection notification, got {other:?}"),
            }
        }
    });

    let conn = dialer().dial(addr).await.unwrap();
    conn.close().await.unwrap();

    server.await.unwrap();
}
