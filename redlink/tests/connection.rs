//! Connection lifecycle tests: handshake, lazy connect, reconnect, close.

mod common;

use common::{Action, MockServer};
use redlink::{BackoffPolicy, Client, ConnectOpts, RedisError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_retry(opts: ConnectOpts) -> ConnectOpts {
    opts.with_max_retry_count(50).with_backoff(BackoffPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(40),
        multiplier: 1.0,
    })
}

#[tokio::test]
async fn test_handshake_runs_in_order() {
    let server = MockServer::start().await;
    let opts = ConnectOpts::new("127.0.0.1", server.port)
        .with_password("secret")
        .with_db(2)
        .with_name("conn-name");
    let client = Client::connect(opts).await.expect("connect");

    assert_eq!(client.ping().await.unwrap(), "PONG");

    let log = server.log();
    assert_eq!(log[0], "AUTH secret");
    assert_eq!(log[1], "SELECT 2");
    assert_eq!(log[2], "CLIENT SETNAME conn-name");
    assert_eq!(log[3], "PING");

    client.close().await;
}

#[tokio::test]
async fn test_lazy_client_connects_on_first_command() {
    let server = MockServer::start().await;
    let client = Client::connect_lazy(ConnectOpts::new("127.0.0.1", server.port));

    assert!(!client.is_connected());
    assert!(server.log().is_empty());

    assert_eq!(client.ping().await.unwrap(), "PONG");
    assert!(client.is_connected());

    client.close().await;
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_commands_after_close_fail_with_bad_resource() {
    let server = MockServer::start().await;
    let client = Client::connect(ConnectOpts::new("127.0.0.1", server.port))
        .await
        .expect("connect");
    client.close().await;

    assert!(matches!(
        client.ping().await,
        Err(RedisError::BadResource)
    ));
}

#[tokio::test]
async fn test_malformed_port_rejected_before_socket_work() {
    // No server is running; the URL parser rejects the port on its own.
    let err = Client::connect_url("redis://127.0.0.1:notaport")
        .await
        .unwrap_err();
    match err {
        RedisError::ConnectError(msg) => assert!(msg.contains("invalid port")),
        other => panic!("expected ConnectError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_auth_failure_is_fatal_and_never_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let server = MockServer::start_with(Arc::new(move |cmd: &[String]| {
        if cmd.first().map(String::as_str) == Some("AUTH") {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Action::raw("-ERR invalid password\r\n"))
        } else {
            None
        }
    }))
    .await;

    let opts = fast_retry(ConnectOpts::new("127.0.0.1", server.port).with_password("wrong"));
    let client = Client::connect_lazy(opts);

    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, RedisError::ConnectError(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reconnect_after_server_restart_on_same_port() {
    let server = MockServer::start().await;
    let opts = fast_retry(ConnectOpts::new("127.0.0.1", server.port));
    let client = Client::connect(opts).await.expect("connect");

    assert_eq!(client.ping().await.unwrap(), "PONG");

    let port = server.stop().await;
    let replacement = MockServer::start_on(port).await;

    // The existing client replays the command on the fresh transport.
    assert_eq!(client.ping().await.unwrap(), "PONG");
    assert_eq!(replacement.count_matching("PING"), 1);

    client.close().await;
}

#[tokio::test]
async fn test_retries_exhaust_into_connection_closed() {
    let server = MockServer::start().await;
    let opts = ConnectOpts::new("127.0.0.1", server.port)
        .with_max_retry_count(2)
        .with_backoff(BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            multiplier: 1.0,
        });
    let client = Client::connect(opts).await.expect("connect");
    let _port = server.stop().await;

    // Nobody is listening any more, so both reconnect attempts fail.
    assert!(matches!(
        client.ping().await,
        Err(RedisError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_concurrent_commands_keep_reply_alignment() {
    let server = MockServer::start().await;
    let client = Client::connect(ConnectOpts::new("127.0.0.1", server.port))
        .await
        .expect("connect");

    let mut handles = Vec::new();
    for i in 0..10 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("key{i}");
            let value = format!("value{i}");
            client.set(&key, &value).await.unwrap();
            assert_eq!(client.get(&key).await.unwrap().as_deref(), Some(value.as_str()));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    client.close().await;
}

#[tokio::test]
async fn test_health_check_pings_in_background() {
    let server = MockServer::start().await;
    let opts = ConnectOpts::new("127.0.0.1", server.port)
        .with_health_check_interval(Duration::from_millis(30));
    let client = Client::connect(opts).await.expect("connect");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.count_matching("PING") >= 2);

    client.close().await;
}
