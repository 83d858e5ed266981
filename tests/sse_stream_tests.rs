//! # Event Stream Integration Tests
//!
//! Drives the connection registry against a local TCP server speaking the
//! SSE wire format, so the full path from socket bytes to callbacks is
//! exercised: subscribe, keepalives, event dispatch, parameter swap, and
//! shutdown.

use infisical_operator::error::Error;
use infisical_operator::sse::{
    ConnectionRegistry, OpenFn, RegistryCallbacks, RegistryConfig, SubscriptionParams,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Minimal SSE endpoint: answers every connection with the given frames and
/// then holds the socket open until the client goes away.
async fn spawn_sse_server(frames: Vec<String>, accepted: Arc<AtomicUsize>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            let frames = frames.clone();
            tokio::spawn(async move {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\n")
                    .await;
                for frame in frames {
                    if socket.write_all(frame.as_bytes()).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    addr
}

fn open_for(addr: SocketAddr) -> OpenFn {
    Arc::new(move || {
        let url = format!("http://{addr}/v1/events/subscribe/project-events");
        Box::pin(async move {
            reqwest::get(url)
                .await
                .map_err(|e| Error::UpstreamTransient(e.to_string()))
        })
    })
}

fn params(path: &str) -> SubscriptionParams {
    SubscriptionParams {
        project_id: "p1".to_string(),
        env_slug: "e1".to_string(),
        secrets_path: path.to_string(),
    }
}

fn quiet_config() -> RegistryConfig {
    RegistryConfig {
        health_check_interval: Duration::from_secs(3600),
        ..RegistryConfig::default()
    }
}

#[tokio::test]
async fn test_events_flow_from_socket_to_callback() {
    let accepted = Arc::new(AtomicUsize::new(0));
    let addr = spawn_sse_server(
        vec![
            "data: 1\n\n".to_string(),
            "event: secret:update\ndata: {\"secretKey\":\"FOO\"}\n\n".to_string(),
        ],
        accepted.clone(),
    )
    .await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_events = received.clone();
    let registry = ConnectionRegistry::with_config(
        RegistryCallbacks {
            on_event: Arc::new(move |event| {
                received_events.lock().unwrap().push(event);
            }),
            on_error: Arc::new(|err| panic!("unexpected stream error: {err}")),
            on_reconnect: Arc::new(|| {}),
        },
        quiet_config(),
    );

    registry
        .subscribe_with_params(params("/a"), open_for(addr))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = received.lock().unwrap().clone();
    assert_eq!(events.len(), 1, "the ping is consumed, the change event dispatched");
    assert_eq!(events[0].event, "secret:update");
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    registry.close().await;
}

#[tokio::test]
async fn test_param_swap_opens_fresh_connection() {
    let accepted = Arc::new(AtomicUsize::new(0));
    let addr = spawn_sse_server(vec!["data: 1\n\n".to_string()], accepted.clone()).await;

    let registry = ConnectionRegistry::with_config(
        RegistryCallbacks {
            on_event: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
            on_reconnect: Arc::new(|| {}),
        },
        quiet_config(),
    );

    registry
        .subscribe_with_params(params("/a"), open_for(addr))
        .await
        .unwrap();
    registry
        .subscribe_with_params(params("/b"), open_for(addr))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(accepted.load(Ordering::SeqCst), 2, "swap must reopen the stream");
    assert_eq!(registry.get_params().await.unwrap().secrets_path, "/b");
    assert!(registry.is_connected().await);

    // Same params again: no third connection.
    registry
        .subscribe_with_params(params("/b"), open_for(addr))
        .await
        .unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    registry.close().await;
}

#[tokio::test]
async fn test_close_terminates_within_bounded_time() {
    let accepted = Arc::new(AtomicUsize::new(0));
    let addr = spawn_sse_server(Vec::new(), accepted).await;

    let registry = ConnectionRegistry::with_config(
        RegistryCallbacks {
            on_event: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
            on_reconnect: Arc::new(|| {}),
        },
        quiet_config(),
    );
    registry
        .subscribe_with_params(params("/a"), open_for(addr))
        .await
        .unwrap();

    // The reader is blocked on the socket; close must still return quickly
    // because cancelling drops the response stream.
    let started = std::time::Instant::now();
    registry.close().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let err = registry
        .subscribe_with_params(params("/a"), open_for(addr))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
