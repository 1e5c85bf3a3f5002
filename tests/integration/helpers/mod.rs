
use memcached_client::{Client, ClientConfig};

/// Client settings scaled down so failure scenarios finish quickly
pub fn test_config(addrs: &[&str]) -> ClientConfig {
    ClientConfig {
        pool_size: 4,
        pool_timeout_ms: 200,
        connect_timeout_ms: 200,
        read_timeout_ms: 300,
        retry_backoff_ms: 1,
        max_backoff_ms: 5,
        ..ClientConfig::with_servers(addrs.iter().copied())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// The first `count` generated keys the ring places on `address`
pub fn keys_owned_by(client: &Client, address: &str, count: usize) -> Vec<String> {
    let keys: Vec<String> = (0..10_000)
        .map(|i| format!("key-{}", i))
        .filter(|key| client.server_for_key(key).unwrap().as_deref() == Some(address))
        .take(count)
        .collect();
    assert_eq!(keys.len(), count, "not enough keys map to {}", address);
    keys
}

/// A key the ring places on `address`
pub fn key_owned_by(client: &Client, address: &str) -> String {
    keys_owned_by(client, address, 1).remove(0)
}
