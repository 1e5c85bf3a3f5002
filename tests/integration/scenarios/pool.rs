//! Connection pool behaviour seen through the client

use crate::integration::{init_tracing, test_config, MockMemcached, ResponseMode};
use memcached_client::{Client, ClientConfig, ClientError, Expiration};
use std::time::Duration;

#[tokio::test]
async fn test_connections_are_reused() {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    let client = Client::new(test_config(&[mock.addr()])).unwrap();

    for i in 0..10 {
        client
            .set(&format!("k{}", i), b"v", Expiration::Never, 0)
            .await
            .unwrap();
    }

    assert_eq!(mock.stats().connections, 1);
    let state = client.pool_state(mock.addr()).unwrap();
    assert_eq!(state.connections, 1);
    assert_eq!(state.idle_connections, 1);
}

#[tokio::test]
async fn test_concurrent_callers_share_bounded_pool() {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    let config = ClientConfig {
        pool_size: 3,
        pool_timeout_ms: 2000,
        ..test_config(&[mock.addr()])
    };
    let client = Client::new(config).unwrap();

    let mut handles = Vec::new();
    for i in 0..40 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("key-{}", i);
            let value = format!("value-{}", i);
            client
                .set(&key, value.as_bytes(), Expiration::Never, 0)
                .await
                .unwrap();
            let item = client.get(&key).await.unwrap().unwrap();
            assert_eq!(item.value, value.as_bytes());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(mock.stats().connections <= 3);
}

#[tokio::test]
async fn test_exhausted_pool_times_out() {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    mock.set_stored_value("k", b"v");
    mock.set_response_mode(ResponseMode::Slow(Duration::from_millis(250)));

    let config = ClientConfig {
        pool_size: 1,
        pool_timeout_ms: 50,
        read_timeout_ms: 1000,
        max_retries: 0,
        ..test_config(&[mock.addr()])
    };
    let client = Client::new(config).unwrap();

    let (first, second) = tokio::join!(client.get("k"), async {
        // Let the first caller take the only connection
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.get("k").await
    });

    assert!(first.unwrap().is_some());
    assert!(matches!(second, Err(ClientError::Timeout(_))));
}

#[tokio::test]
async fn test_cancelled_request_does_not_poison_pool() {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    mock.set_stored_value("a", b"1");
    mock.set_stored_value("b", b"2");

    let config = ClientConfig {
        pool_size: 1,
        read_timeout_ms: 1000,
        ..test_config(&[mock.addr()])
    };
    let client = Client::new(config).unwrap();

    // Caller gives up while the reply for "a" is still on its way
    mock.set_response_mode(ResponseMode::Slow(Duration::from_millis(150)));
    let cancelled = tokio::time::timeout(Duration::from_millis(30), client.get("a")).await;
    assert!(cancelled.is_err());

    // The stale "a" reply must never be read as the answer for "b"
    mock.set_response_mode(ResponseMode::Normal);
    let item = client.get("b").await.unwrap().unwrap();
    assert_eq!(item.key, "b");
    assert_eq!(&item.value[..], b"2");
    assert_eq!(mock.stats().connections, 2);
}

#[tokio::test]
async fn test_operation_timeout_discards_connection() {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    mock.set_stored_value("k", b"v");

    let config = ClientConfig {
        read_timeout_ms: 2000,
        operation_timeout_ms: Some(50),
        ..test_config(&[mock.addr()])
    };
    let client = Client::new(config).unwrap();

    mock.set_response_mode(ResponseMode::Slow(Duration::from_millis(300)));
    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(limit) if limit == Duration::from_millis(50)));

    mock.set_response_mode(ResponseMode::Normal);
    assert_eq!(&client.get("k").await.unwrap().unwrap().value[..], b"v");
    assert_eq!(mock.stats().connections, 2);
}
