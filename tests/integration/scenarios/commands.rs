//! Client operations against a healthy mock server

use crate::integration::{init_tracing, keys_owned_by, test_config, MockMemcached, ResponseMode};
use memcached_client::{CacheValue, CasResult, Client, ClientConfig, ClientError, Expiration};
use serde_json::json;
use std::time::Duration;

async fn single_server() -> (MockMemcached, Client) {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    let client = Client::new(test_config(&[mock.addr()])).unwrap();
    (mock, client)
}

// ============================================================================
// Storage and retrieval
// ============================================================================

#[tokio::test]
async fn test_set_then_get_round_trip() {
    let (_mock, client) = single_server().await;

    assert!(client
        .set("greeting", b"hello", Expiration::Never, 42)
        .await
        .unwrap());

    let item = client.get("greeting").await.unwrap().unwrap();
    assert_eq!(item.key, "greeting");
    assert_eq!(&item.value[..], b"hello");
    assert_eq!(item.flags, 42);
    assert_eq!(item.cas, None);
}

#[tokio::test]
async fn test_get_is_idempotent() {
    let (mock, client) = single_server().await;
    mock.set_stored_value("k", b"v");

    let first = client.get("k").await.unwrap();
    let second = client.get("k").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(mock.stats().sets, 0);
}

#[tokio::test]
async fn test_delete_then_get_misses() {
    let (_mock, client) = single_server().await;

    client.set("k", b"v", Expiration::Never, 0).await.unwrap();
    assert!(client.delete("k").await.unwrap());
    assert!(client.get("k").await.unwrap().is_none());
    assert!(!client.delete("k").await.unwrap());
}

#[tokio::test]
async fn test_add_and_replace_semantics() {
    let (_mock, client) = single_server().await;

    assert!(!client.replace("k", b"1", Expiration::Never, 0).await.unwrap());
    assert!(client.add("k", b"1", Expiration::Never, 0).await.unwrap());
    assert!(!client.add("k", b"2", Expiration::Never, 0).await.unwrap());
    assert!(client.replace("k", b"3", Expiration::Never, 0).await.unwrap());

    let item = client.get("k").await.unwrap().unwrap();
    assert_eq!(&item.value[..], b"3");
}

#[tokio::test]
async fn test_append_and_prepend() {
    let (_mock, client) = single_server().await;

    assert!(!client.append("missing", b"x").await.unwrap());
    client.set("k", b"mid", Expiration::Never, 0).await.unwrap();
    assert!(client.append("k", b"-end").await.unwrap());
    assert!(client.prepend("k", b"start-").await.unwrap());

    let item = client.get("k").await.unwrap().unwrap();
    assert_eq!(&item.value[..], b"start-mid-end");
}

#[tokio::test]
async fn test_cas_semantics() {
    let (_mock, client) = single_server().await;

    client.set("k", b"v1", Expiration::Never, 0).await.unwrap();
    let item = client.gets("k").await.unwrap().unwrap();
    let token = item.cas.expect("gets returns a cas token");

    // Someone else writes in between
    client.set("k", b"v2", Expiration::Never, 0).await.unwrap();
    assert_eq!(
        client.cas("k", b"mine", token, Expiration::Never, 0).await.unwrap(),
        CasResult::Conflict
    );

    let fresh = client.gets("k").await.unwrap().unwrap();
    assert_eq!(
        client
            .cas("k", b"mine", fresh.cas.unwrap(), Expiration::Never, 0)
            .await
            .unwrap(),
        CasResult::Stored
    );
    assert_eq!(
        client.cas("gone", b"x", 1, Expiration::Never, 0).await.unwrap(),
        CasResult::NotFound
    );
    assert_eq!(&client.get("k").await.unwrap().unwrap().value[..], b"mine");
}

#[tokio::test]
async fn test_incr_decr() {
    let (_mock, client) = single_server().await;

    assert_eq!(client.incr("counter", 1).await.unwrap(), None);

    client.set("counter", b"10", Expiration::Never, 0).await.unwrap();
    assert_eq!(client.incr("counter", 5).await.unwrap(), Some(15));
    assert_eq!(client.decr("counter", 20).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_incr_non_numeric_is_server_error() {
    let (_mock, client) = single_server().await;

    client.set("text", b"abc", Expiration::Never, 0).await.unwrap();
    let err = client.incr("text", 1).await.unwrap_err();
    assert!(matches!(err, ClientError::Server(ref msg) if msg.starts_with("CLIENT_ERROR")));
}

#[tokio::test]
async fn test_touch() {
    let (_mock, client) = single_server().await;

    assert!(!client
        .touch("k", Expiration::After(Duration::from_secs(60)))
        .await
        .unwrap());
    client.set("k", b"v", Expiration::Never, 0).await.unwrap();
    assert!(client
        .touch("k", Expiration::After(Duration::from_secs(60)))
        .await
        .unwrap());
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn test_get_many_with_missing_key() {
    let (_mock, client) = single_server().await;

    client.set("a", b"1", Expiration::Never, 0).await.unwrap();
    client.set("c", b"3", Expiration::Never, 0).await.unwrap();

    let found = client.get_many(&["c", "b", "a", "c"]).await.unwrap();
    assert_eq!(found.len(), 2);
    assert!(!found.contains_key("b"));

    let keys: Vec<&str> = found.iter().map(|item| item.key.as_str()).collect();
    assert_eq!(keys, vec!["c", "a"]);
    assert_eq!(&found.get("a").unwrap().value[..], b"1");
}

#[tokio::test]
async fn test_get_many_sends_one_get_per_server() {
    init_tracing();
    let first = MockMemcached::new().await.unwrap();
    let second = MockMemcached::new().await.unwrap();
    let client = Client::new(test_config(&[first.addr(), second.addr()])).unwrap();

    let on_first = keys_owned_by(&client, first.addr(), 3);
    let on_second = keys_owned_by(&client, second.addr(), 3);
    for key in &on_first {
        first.set_stored_value(key, key.as_bytes());
    }
    for key in &on_second {
        second.set_stored_value(key, key.as_bytes());
    }

    // Servers interleaved in the requested order, plus a miss
    let requested = vec![
        on_second[0].clone(),
        on_first[0].clone(),
        on_first[1].clone(),
        "never-stored".to_string(),
        on_second[1].clone(),
        on_first[2].clone(),
        on_second[2].clone(),
    ];
    let found = client.get_many(&requested).await.unwrap();

    let expected: Vec<&str> = requested
        .iter()
        .map(String::as_str)
        .filter(|key| *key != "never-stored")
        .collect();
    let keys: Vec<&str> = found.iter().map(|item| item.key.as_str()).collect();
    assert_eq!(keys, expected);
    for item in found.iter() {
        assert_eq!(&item.value[..], item.key.as_bytes());
    }

    assert_eq!(first.stats().gets, 1);
    assert_eq!(second.stats().gets, 1);
}

#[tokio::test]
async fn test_get_many_empty_input() {
    let (mock, client) = single_server().await;

    let keys: [&str; 0] = [];
    assert!(client.get_many(&keys).await.unwrap().is_empty());
    assert_eq!(mock.stats().requests, 0);
}

#[tokio::test]
async fn test_set_many_and_delete_many() {
    let (mock, client) = single_server().await;

    let items = [("x", b"1".to_vec()), ("y", b"2".to_vec()), ("z", b"3".to_vec())];
    let failed = client.set_many(&items, Expiration::Never).await.unwrap();
    assert!(failed.is_empty());
    assert_eq!(mock.item_count(), 3);

    assert_eq!(client.delete_many(&["x", "y", "nope"]).await.unwrap(), 2);
    assert_eq!(mock.item_count(), 1);
}

// ============================================================================
// Prefixes, typed values and fan-out commands
// ============================================================================

#[tokio::test]
async fn test_key_prefix_is_applied_on_the_wire() {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    let config = ClientConfig {
        key_prefix: "app:".to_string(),
        ..test_config(&[mock.addr()])
    };
    let client = Client::new(config).unwrap();

    client.set("user", b"bob", Expiration::Never, 0).await.unwrap();
    assert_eq!(mock.get_stored_value("app:user").unwrap(), b"bob");

    let item = client.get("user").await.unwrap().unwrap();
    assert_eq!(item.key, "user");

    let many = client.get_many(&["user"]).await.unwrap();
    assert!(many.contains_key("user"));
}

#[tokio::test]
async fn test_typed_values() {
    let (_mock, client) = single_server().await;

    let cases = [
        CacheValue::from("text"),
        CacheValue::from(7i64),
        CacheValue::from(json!({"name": "bob", "tags": ["a", "b"]})),
        CacheValue::from(vec![0u8, 159, 146, 150]),
    ];
    for (i, value) in cases.iter().enumerate() {
        let key = format!("typed:{}", i);
        assert!(client.set_value(&key, value, Expiration::Never).await.unwrap());
        assert_eq!(client.get_value(&key).await.unwrap().as_ref(), Some(value));
    }
    assert!(client.get_value("typed:missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stats_version_and_flush_all() {
    init_tracing();
    let first = MockMemcached::new().await.unwrap();
    let second = MockMemcached::new().await.unwrap();
    let client = Client::new(test_config(&[first.addr(), second.addr()])).unwrap();

    let versions = client.version().await.unwrap();
    assert_eq!(versions.len(), 2);
    for version in &versions {
        assert_eq!(version.result.as_deref().unwrap(), "1.6.21-mock");
    }

    let stats = client.stats(None).await.unwrap();
    assert_eq!(stats.len(), 2);
    for server in &stats {
        let stats = server.result.as_ref().unwrap();
        assert!(stats.iter().any(|(name, value)| name == "pid" && value == "12345"));
    }

    first.set_stored_value("a", b"1");
    second.set_stored_value("b", b"2");
    let flushed = client.flush_all(None).await.unwrap();
    assert!(flushed.iter().all(|server| server.result.is_ok()));
    assert_eq!(first.item_count() + second.item_count(), 0);
}

#[tokio::test]
async fn test_server_error_reply_is_not_retried() {
    init_tracing();
    let mock = MockMemcached::new().await.unwrap();
    let client = Client::new(test_config(&[mock.addr()])).unwrap();
    mock.set_response_mode(ResponseMode::Custom(
        "SERVER_ERROR out of memory storing object\r\n".to_string(),
    ));

    let err = client
        .set("k", b"v", Expiration::Never, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Server(ref msg) if msg.contains("out of memory")));
    // One connection, one attempt
    assert_eq!(mock.stats().connections, 1);

    // The server answered, so it stays routable
    mock.set_response_mode(ResponseMode::Normal);
    assert!(client.set("k", b"v", Expiration::Never, 0).await.unwrap());
}
