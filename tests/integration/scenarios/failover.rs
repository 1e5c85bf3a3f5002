//! Failover, retry and health tracking against misbehaving servers

use crate::integration::{init_tracing, key_owned_by, test_config, MockMemcached, ResponseMode};
use memcached_client::{Client, ClientConfig, ClientError, Expiration, HealthState};
use std::time::{Duration, Instant};

fn state_of(client: &Client, address: &str) -> Option<HealthState> {
    client
        .health()
        .into_iter()
        .find(|status| status.address == address)
        .map(|status| status.state)
}

#[tokio::test]
async fn test_killed_server_is_routed_around() {
    init_tracing();
    let doomed = MockMemcached::new().await.unwrap();
    let survivor = MockMemcached::new().await.unwrap();
    let client = Client::new(test_config(&[doomed.addr(), survivor.addr()])).unwrap();

    let key = key_owned_by(&client, doomed.addr());
    client.set(&key, b"v", Expiration::Never, 0).await.unwrap();
    assert_eq!(doomed.get_stored_value(&key).unwrap(), b"v");

    doomed.shutdown();
    // Let the mock drop its sockets
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let result = client.get(&key).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    // The live server never saw the key, so failover yields a miss
    assert!(result.unwrap().is_none());
    assert_eq!(state_of(&client, doomed.addr()), Some(HealthState::Dead));

    // Writes now land on the survivor
    client.set(&key, b"v2", Expiration::Never, 0).await.unwrap();
    assert_eq!(survivor.get_stored_value(&key).unwrap(), b"v2");
}

#[tokio::test]
async fn test_killed_server_without_failover_fails_fast() {
    init_tracing();
    let doomed = MockMemcached::new().await.unwrap();
    let other = MockMemcached::new().await.unwrap();
    let config = ClientConfig {
        failover: false,
        ..test_config(&[doomed.addr(), other.addr()])
    };
    let client = Client::new(config).unwrap();

    let key = key_owned_by(&client, doomed.addr());
    doomed.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let err = client.get(&key).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(err, ClientError::ServerUnavailable(_)));

    // Marked dead: the next call is refused without touching the network
    let err = client.get(&key).await.unwrap_err();
    assert!(matches!(err, ClientError::ServerUnavailable(ref msg) if msg.contains("marked dead")));
    assert_eq!(other.stats().requests, 0);
}

#[tokio::test]
async fn test_idempotent_read_retries_then_gives_up() {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    mock.set_response_mode(ResponseMode::Failure);
    let client = Client::new(test_config(&[mock.addr()])).unwrap();

    let err = client.get("k").await.unwrap_err();
    assert!(err.is_transient(), "unexpected error: {:?}", err);

    // First attempt plus two retries, each on a fresh connection
    assert_eq!(mock.stats().connections, 3);
    // Three consecutive failures: Alive -> Suspected -> Dead
    assert_eq!(state_of(&client, mock.addr()), Some(HealthState::Dead));

    let metrics = client.metrics();
    assert_eq!(metrics[0].retries, 2);
    assert_eq!(metrics[0].failed_requests, 3);
}

#[tokio::test]
async fn test_write_after_send_is_ambiguous() {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    mock.set_response_mode(ResponseMode::Failure);
    let client = Client::new(test_config(&[mock.addr()])).unwrap();

    let err = client
        .set("k", b"v", Expiration::Never, 0)
        .await
        .unwrap_err();
    match err {
        ClientError::AmbiguousFailure { command, server, .. } => {
            assert_eq!(command, "set");
            assert_eq!(server, mock.addr());
        }
        other => panic!("expected AmbiguousFailure, got {:?}", other),
    }
    // Never retried
    assert_eq!(mock.stats().connections, 1);
}

#[tokio::test]
async fn test_silent_server_times_out() {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    mock.set_response_mode(ResponseMode::Silent);
    let config = ClientConfig {
        read_timeout_ms: 100,
        max_retries: 1,
        ..test_config(&[mock.addr()])
    };
    let client = Client::new(config).unwrap();

    let started = Instant::now();
    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.metrics()[0].timeouts, 2);

    let err = client
        .incr("counter", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::AmbiguousFailure { .. }));
}

#[tokio::test]
async fn test_unreachable_write_is_retried_elsewhere() {
    init_tracing();
    let live = MockMemcached::new().await.unwrap();
    let doomed = MockMemcached::new().await.unwrap();
    let client = Client::new(test_config(&[live.addr(), doomed.addr()])).unwrap();

    let key = key_owned_by(&client, doomed.addr());
    doomed.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Connect failures happen before anything is sent, so even a write may move
    assert!(client.set(&key, b"v", Expiration::Never, 0).await.unwrap());
    assert_eq!(live.get_stored_value(&key).unwrap(), b"v");
}

#[tokio::test]
async fn test_get_many_survives_dead_server() {
    init_tracing();
    let live = MockMemcached::new().await.unwrap();
    let doomed = MockMemcached::new().await.unwrap();
    let client = Client::new(test_config(&[live.addr(), doomed.addr()])).unwrap();

    let live_key = key_owned_by(&client, live.addr());
    let doomed_key = key_owned_by(&client, doomed.addr());
    live.set_stored_value(&live_key, b"here");
    doomed.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let found = client.get_many(&[&doomed_key, &live_key]).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(&found.get(&live_key).unwrap().value[..], b"here");
}
