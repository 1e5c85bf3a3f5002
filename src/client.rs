use crate::config::{ClientConfig, ConfigError, ServerSpec};
use crate::core::connection::ConnectionError;
use crate::core::connection_pool::{PoolError, PoolSettings, PoolState, ServerPool};
use crate::core::hash_ring::{HashRing, ServerSelector};
use crate::core::health::{FailureKind, HealthRegistry, ServerStatus};
use crate::core::item::{CacheItem, CasResult, Expiration};
use crate::core::key::{CacheKey, KeyError};
use crate::core::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::core::protocols::{AsciiCommand, AsciiResponse, ProtocolError, StoreMode};
use crate::core::retry::{Idempotency, RetryDecision, RetryPolicy};
use crate::core::serializer::{create_serializer, CacheValue, Serializer, SerializerError};
use crate::core::server::Server;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Async memcached client.
///
/// Cheap to clone; clones share the ring, the per-server pools and the health
/// registry. Every keyed call validates the key, picks a server on the hash
/// ring, checks out a pooled connection, runs one request/response exchange
/// and returns the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    selector: ServerSelector,
    pools: RwLock<HashMap<String, ServerPool>>,
    health: HealthRegistry,
    metrics: MetricsRegistry,
    retry: RetryPolicy,
    pool_settings: PoolSettings,
    operation_timeout: Option<Duration>,
    failover: bool,
    key_prefix: String,
    serializer: Arc<dyn Serializer>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.inner.selector.snapshot();
        let servers: Vec<&str> = ring.servers().iter().map(|s| s.address()).collect();
        f.debug_struct("Client")
            .field("servers", &servers)
            .field("key_prefix", &self.inner.key_prefix)
            .field("serializer", &self.inner.serializer.name())
            .finish()
    }
}

/// Items found by [`Client::get_many`], in the order the keys were requested
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiGet {
    items: Vec<CacheItem>,
    /// key -> position in `items`
    index: HashMap<String, usize>,
}

impl MultiGet {
    fn from_items(items: Vec<CacheItem>) -> Self {
        let index = items
            .iter()
            .enumerate()
            .map(|(position, item)| (item.key.clone(), position))
            .collect();
        Self { items, index }
    }

    pub fn get(&self, key: &str) -> Option<&CacheItem> {
        self.index.get(key).map(|&position| &self.items[position])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CacheItem> {
        self.items.iter()
    }

    pub fn into_items(self) -> Vec<CacheItem> {
        self.items
    }
}

impl IntoIterator for MultiGet {
    type Item = CacheItem;
    type IntoIter = std::vec::IntoIter<CacheItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Outcome of a command fanned out to every server
#[derive(Debug)]
pub struct ServerResult<T> {
    pub server: String,
    pub result: Result<T, ClientError>,
}

/// A failed attempt and whether the request had started going out
struct AttemptFailure {
    error: ClientError,
    sent: bool,
}

impl AttemptFailure {
    fn unsent(error: ClientError) -> Self {
        Self { error, sent: false }
    }
}

impl Client {
    /// Build a client from a validated configuration. Connections are opened
    /// lazily on first use.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let serializer = create_serializer(&config.serializer)?;
        Self::with_serializer(config, serializer)
    }

    /// Like [`Client::new`] with a caller-supplied serializer
    pub fn with_serializer(
        config: ClientConfig,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let servers: Vec<Arc<Server>> = config
            .parsed_servers()?
            .into_iter()
            .map(Arc::new)
            .collect();

        let pool_settings = config.pool_settings();
        let health = HealthRegistry::new(config.health_policy());
        let mut pools = HashMap::new();
        for server in &servers {
            health.register(server.address());
            pools.insert(
                server.address().to_string(),
                ServerPool::build(server.clone(), &pool_settings),
            );
        }

        info!(
            "Memcached client using {} server(s), serializer '{}'",
            servers.len(),
            serializer.name()
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                selector: ServerSelector::new(HashRing::new(servers, config.points_per_server)),
                pools: RwLock::new(pools),
                health,
                metrics: MetricsRegistry::new(),
                retry: config.retry_policy(),
                pool_settings,
                operation_timeout: config.operation_timeout(),
                failover: config.failover,
                key_prefix: config.key_prefix.clone(),
                serializer,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Fetch one item; `None` on a miss
    pub async fn get(&self, key: &str) -> Result<Option<CacheItem>, ClientError> {
        self.retrieve(key, false).await
    }

    /// Fetch one item together with its cas token
    pub async fn gets(&self, key: &str) -> Result<Option<CacheItem>, ClientError> {
        self.retrieve(key, true).await
    }

    async fn retrieve(&self, key: &str, with_cas: bool) -> Result<Option<CacheItem>, ClientError> {
        let key = self.key(key)?;
        let keys = vec![key.as_str()];
        let command = if with_cas {
            AsciiCommand::Gets { keys }
        } else {
            AsciiCommand::Get { keys }
        };

        match self.run(key.as_str(), &command).await? {
            AsciiResponse::Values(items) => Ok(items
                .into_iter()
                .find(|item| item.key == key.as_str())
                .map(|item| strip_prefix(item, &key))),
            other => Err(unexpected(&command, other)),
        }
    }

    /// Fetch many keys with one `get` per owning server, issued concurrently.
    ///
    /// Duplicate keys are fetched once. Missing keys are absent from the
    /// result. Keys whose server fails are regrouped and retried against the
    /// ring as it stands; if any group still fails the whole call fails.
    pub async fn get_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<MultiGet, ClientError> {
        self.ensure_open()?;
        let mut ordered: Vec<CacheKey> = Vec::with_capacity(keys.len());
        let mut unique = HashSet::new();
        for key in keys {
            let key = self.key(key.as_ref())?;
            if unique.insert(key.as_str().to_string()) {
                ordered.push(key);
            }
        }
        if ordered.is_empty() {
            return Ok(MultiGet::default());
        }

        let mut found = self
            .with_deadline(self.fetch_grouped(ordered.clone()))
            .await?;
        let items = ordered
            .iter()
            .filter_map(|key| found.remove(key.as_str()).map(|item| strip_prefix(item, key)))
            .collect();
        Ok(MultiGet::from_items(items))
    }

    async fn fetch_grouped(
        &self,
        keys: Vec<CacheKey>,
    ) -> Result<HashMap<String, CacheItem>, ClientError> {
        let mut found = HashMap::new();
        let mut pending = keys;
        let mut attempt = 0;

        while !pending.is_empty() {
            let mut groups: HashMap<String, (Arc<Server>, Vec<CacheKey>)> = HashMap::new();
            for key in pending.drain(..) {
                let server = self.route(key.as_str())?;
                groups
                    .entry(server.address().to_string())
                    .or_insert_with(|| (server, Vec::new()))
                    .1
                    .push(key);
            }
            debug!("get_many: {} server group(s), attempt {}", groups.len(), attempt);

            let results = join_all(groups.into_values().map(|(server, keys)| async move {
                let result = {
                    let command = AsciiCommand::Get {
                        keys: keys.iter().map(|k| k.as_str()).collect(),
                    };
                    match self.attempt(&server, &command).await {
                        Ok(AsciiResponse::Values(items)) => Ok(items),
                        Ok(other) => Err(AttemptFailure::unsent(unexpected(&command, other))),
                        Err(failure) => Err(failure),
                    }
                };
                (server, keys, result)
            }))
            .await;

            let mut retry_server = None;
            for (server, keys, result) in results {
                match result {
                    Ok(items) => {
                        for item in items {
                            found.insert(item.key.clone(), item);
                        }
                    }
                    Err(failure) => match self.inner.retry.decide(
                        attempt,
                        Idempotency::Idempotent,
                        failure.error.is_transient(),
                        failure.sent,
                    ) {
                        RetryDecision::Retry => {
                            pending.extend(keys);
                            retry_server = Some(server);
                        }
                        _ => return Err(failure.error),
                    },
                }
            }

            if let Some(server) = retry_server {
                self.inner.metrics.for_server(server.address()).record_retry();
                tokio::time::sleep(self.inner.retry.backoff(attempt)).await;
                attempt += 1;
            }
        }

        Ok(found)
    }

    /// Store unconditionally
    pub async fn set(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        expiration: Expiration,
        flags: u32,
    ) -> Result<bool, ClientError> {
        self.store(StoreMode::Set, key, value.as_ref(), expiration, flags)
            .await
    }

    /// Store only if the key does not exist
    pub async fn add(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        expiration: Expiration,
        flags: u32,
    ) -> Result<bool, ClientError> {
        self.store(StoreMode::Add, key, value.as_ref(), expiration, flags)
            .await
    }

    /// Store only if the key already exists
    pub async fn replace(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        expiration: Expiration,
        flags: u32,
    ) -> Result<bool, ClientError> {
        self.store(StoreMode::Replace, key, value.as_ref(), expiration, flags)
            .await
    }

    pub async fn append(&self, key: &str, value: impl AsRef<[u8]>) -> Result<bool, ClientError> {
        self.store(StoreMode::Append, key, value.as_ref(), Expiration::Never, 0)
            .await
    }

    pub async fn prepend(&self, key: &str, value: impl AsRef<[u8]>) -> Result<bool, ClientError> {
        self.store(StoreMode::Prepend, key, value.as_ref(), Expiration::Never, 0)
            .await
    }

    async fn store(
        &self,
        mode: StoreMode,
        key: &str,
        data: &[u8],
        expiration: Expiration,
        flags: u32,
    ) -> Result<bool, ClientError> {
        let key = self.key(key)?;
        let command = AsciiCommand::Store {
            mode,
            key: key.as_str(),
            flags,
            exptime: expiration.to_exptime(),
            data,
        };

        match self.run(key.as_str(), &command).await? {
            AsciiResponse::Stored => Ok(true),
            AsciiResponse::NotStored => Ok(false),
            other => Err(unexpected(&command, other)),
        }
    }

    /// Store several items concurrently. Returns the keys that were not
    /// stored, including those whose request failed.
    pub async fn set_many<K, V>(
        &self,
        items: &[(K, V)],
        expiration: Expiration,
    ) -> Result<Vec<String>, ClientError>
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        self.ensure_open()?;
        for (key, _) in items {
            self.key(key.as_ref())?;
        }

        let results = join_all(
            items
                .iter()
                .map(|(key, value)| self.set(key.as_ref(), value.as_ref(), expiration, 0)),
        )
        .await;

        let mut failed = Vec::new();
        for ((key, _), result) in items.iter().zip(results) {
            match result {
                Ok(true) => {}
                Ok(false) => failed.push(key.as_ref().to_string()),
                Err(e) => {
                    warn!("set_many: failed to store {}: {}", key.as_ref(), e);
                    failed.push(key.as_ref().to_string());
                }
            }
        }
        Ok(failed)
    }

    /// Check-and-set against a token from [`Client::gets`]
    pub async fn cas(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        cas_token: u64,
        expiration: Expiration,
        flags: u32,
    ) -> Result<CasResult, ClientError> {
        let key = self.key(key)?;
        let command = AsciiCommand::Cas {
            key: key.as_str(),
            flags,
            exptime: expiration.to_exptime(),
            data: value.as_ref(),
            cas: cas_token,
        };

        match self.run(key.as_str(), &command).await? {
            AsciiResponse::Stored => Ok(CasResult::Stored),
            AsciiResponse::Exists => Ok(CasResult::Conflict),
            AsciiResponse::NotFound => Ok(CasResult::NotFound),
            other => Err(unexpected(&command, other)),
        }
    }

    /// Returns `false` when the key did not exist
    pub async fn delete(&self, key: &str) -> Result<bool, ClientError> {
        let key = self.key(key)?;
        let command = AsciiCommand::Delete { key: key.as_str() };

        match self.run(key.as_str(), &command).await? {
            AsciiResponse::Deleted => Ok(true),
            AsciiResponse::NotFound => Ok(false),
            other => Err(unexpected(&command, other)),
        }
    }

    /// Delete several keys concurrently, returning how many existed
    pub async fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<usize, ClientError> {
        self.ensure_open()?;
        for key in keys {
            self.key(key.as_ref())?;
        }

        let results = join_all(keys.iter().map(|key| self.delete(key.as_ref()))).await;
        let mut deleted = 0;
        for result in results {
            if result? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Add `delta` to a decimal value; `None` when the key does not exist
    pub async fn incr(&self, key: &str, delta: u64) -> Result<Option<u64>, ClientError> {
        let key = self.key(key)?;
        let command = AsciiCommand::Incr {
            key: key.as_str(),
            delta,
        };
        self.arithmetic(&key, &command).await
    }

    /// Subtract `delta`, stopping at zero; `None` when the key does not exist
    pub async fn decr(&self, key: &str, delta: u64) -> Result<Option<u64>, ClientError> {
        let key = self.key(key)?;
        let command = AsciiCommand::Decr {
            key: key.as_str(),
            delta,
        };
        self.arithmetic(&key, &command).await
    }

    async fn arithmetic(
        &self,
        key: &CacheKey,
        command: &AsciiCommand<'_>,
    ) -> Result<Option<u64>, ClientError> {
        match self.run(key.as_str(), command).await? {
            AsciiResponse::Numeric(value) => Ok(Some(value)),
            AsciiResponse::NotFound => Ok(None),
            other => Err(unexpected(command, other)),
        }
    }

    /// Update an item's expiration; `false` when the key does not exist
    pub async fn touch(&self, key: &str, expiration: Expiration) -> Result<bool, ClientError> {
        let key = self.key(key)?;
        let command = AsciiCommand::Touch {
            key: key.as_str(),
            exptime: expiration.to_exptime(),
        };

        match self.run(key.as_str(), &command).await? {
            AsciiResponse::Touched => Ok(true),
            AsciiResponse::NotFound => Ok(false),
            other => Err(unexpected(&command, other)),
        }
    }

    /// Serialize `value` with the configured serializer and `set` it
    pub async fn set_value(
        &self,
        key: &str,
        value: &CacheValue,
        expiration: Expiration,
    ) -> Result<bool, ClientError> {
        let (data, flags) = self.inner.serializer.serialize(value)?;
        self.set(key, data, expiration, flags).await
    }

    /// `get` and decode with the configured serializer
    pub async fn get_value(&self, key: &str) -> Result<Option<CacheValue>, ClientError> {
        match self.get(key).await? {
            Some(item) => Ok(Some(
                self.inner.serializer.deserialize(item.value, item.flags)?,
            )),
            None => Ok(None),
        }
    }

    /// `stats` (or `stats <args>`) from every server
    pub async fn stats(
        &self,
        args: Option<&str>,
    ) -> Result<Vec<ServerResult<Vec<(String, String)>>>, ClientError> {
        let command = AsciiCommand::Stats { args };
        self.fan_out(&command, |response| match response {
            AsciiResponse::Stats(stats) => Ok(stats),
            other => Err(unexpected(&command, other)),
        })
        .await
    }

    pub async fn version(&self) -> Result<Vec<ServerResult<String>>, ClientError> {
        let command = AsciiCommand::Version;
        self.fan_out(&command, |response| match response {
            AsciiResponse::Version(version) => Ok(version),
            other => Err(unexpected(&command, other)),
        })
        .await
    }

    /// Invalidate every item on every server, optionally after `delay`
    pub async fn flush_all(
        &self,
        delay: Option<Duration>,
    ) -> Result<Vec<ServerResult<()>>, ClientError> {
        let command = AsciiCommand::FlushAll {
            delay: delay.map(|d| d.as_secs().min(u32::MAX as u64) as u32),
        };
        self.fan_out(&command, |response| match response {
            AsciiResponse::Ok => Ok(()),
            other => Err(unexpected(&command, other)),
        })
        .await
    }

    async fn fan_out<T, F>(
        &self,
        command: &AsciiCommand<'_>,
        interpret: F,
    ) -> Result<Vec<ServerResult<T>>, ClientError>
    where
        F: Fn(AsciiResponse) -> Result<T, ClientError>,
    {
        self.ensure_open()?;
        let ring = self.inner.selector.snapshot();
        if ring.is_empty() {
            return Err(ClientError::NoServers);
        }

        let results = join_all(ring.servers().iter().map(|server| {
            self.with_deadline(self.call_with_retry(command, move || {
                if self.inner.health.is_available(server.address()) {
                    Ok(server.clone())
                } else {
                    Err(ClientError::ServerUnavailable(format!(
                        "{} is marked dead",
                        server
                    )))
                }
            }))
        }))
        .await;

        Ok(ring
            .servers()
            .iter()
            .zip(results)
            .map(|(server, result)| ServerResult {
                server: server.address().to_string(),
                result: result.and_then(&interpret),
            })
            .collect())
    }

    /// Add a server, or change the weight of one already in the ring
    pub async fn add_server(&self, spec: impl Into<ServerSpec>) -> Result<(), ClientError> {
        self.ensure_open()?;
        let server = Arc::new(spec.into().to_server()?);
        let address = server.address().to_string();

        self.inner.health.register(&address);
        self.inner
            .pools
            .write()
            .entry(address.clone())
            .or_insert_with(|| ServerPool::build(server.clone(), &self.inner.pool_settings));
        self.inner.selector.add_server(server);
        Ok(())
    }

    /// Remove a server from the ring and drop its pool. Returns `false` when
    /// the address was not configured.
    pub async fn remove_server(&self, address: &str) -> Result<bool, ClientError> {
        self.ensure_open()?;
        if !self.inner.selector.remove_server(address) {
            return Ok(false);
        }
        self.inner.pools.write().remove(address);
        self.inner.health.unregister(address);
        self.inner.metrics.remove(address);
        Ok(true)
    }

    /// Address of the server that owns `key`, ignoring health
    pub fn server_for_key(&self, key: &str) -> Result<Option<String>, ClientError> {
        let key = self.key(key)?;
        Ok(self
            .inner
            .selector
            .select(key.as_str())
            .map(|server| server.address().to_string()))
    }

    pub fn servers(&self) -> Vec<String> {
        self.inner
            .selector
            .snapshot()
            .servers()
            .iter()
            .map(|s| s.address().to_string())
            .collect()
    }

    pub fn health(&self) -> Vec<ServerStatus> {
        self.inner.health.snapshot()
    }

    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.inner.metrics.snapshot()
    }

    pub fn pool_state(&self, address: &str) -> Option<PoolState> {
        self.inner.pools.read().get(address).map(|pool| pool.state())
    }

    /// Drop every pool; later calls on this client or its clones fail with
    /// `Closed`
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!("Closing memcached client");
            self.inner.pools.write().clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    fn key(&self, key: &str) -> Result<CacheKey, ClientError> {
        Ok(CacheKey::new(&self.inner.key_prefix, key)?)
    }

    /// Pick the server for `key`, routing around dead servers when failover
    /// is enabled
    fn route(&self, key: &str) -> Result<Arc<Server>, ClientError> {
        let ring = self.inner.selector.snapshot();
        if ring.is_empty() {
            return Err(ClientError::NoServers);
        }
        let health = &self.inner.health;

        if self.inner.failover {
            let selected = ring
                .walk(key)
                .find(|server| health.is_available(server.address()))
                .cloned();
            selected.ok_or_else(|| {
                ClientError::ServerUnavailable("every server is marked dead".to_string())
            })
        } else {
            match ring.primary(key) {
                Some(server) if health.is_available(server.address()) => Ok(server.clone()),
                Some(server) => Err(ClientError::ServerUnavailable(format!(
                    "{} is marked dead",
                    server
                ))),
                None => Err(ClientError::NoServers),
            }
        }
    }

    /// Validate state, then run the command for `route_key` under the
    /// operation deadline
    async fn run(
        &self,
        route_key: &str,
        command: &AsciiCommand<'_>,
    ) -> Result<AsciiResponse, ClientError> {
        self.ensure_open()?;
        self.with_deadline(self.call_with_retry(command, || self.route(route_key)))
            .await
    }

    async fn with_deadline<T, F>(&self, operation: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        match self.inner.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => operation.await,
        }
    }

    async fn call_with_retry<R>(
        &self,
        command: &AsciiCommand<'_>,
        route: R,
    ) -> Result<AsciiResponse, ClientError>
    where
        R: Fn() -> Result<Arc<Server>, ClientError>,
    {
        let idempotency = if command.is_idempotent() {
            Idempotency::Idempotent
        } else {
            Idempotency::NonIdempotent
        };

        let mut attempt = 0;
        loop {
            // Routing failures are final: nothing healthy to send to
            let server = route()?;
            let failure = match self.attempt(&server, command).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            match self.inner.retry.decide(
                attempt,
                idempotency,
                failure.error.is_transient(),
                failure.sent,
            ) {
                RetryDecision::Retry => {
                    let delay = self.inner.retry.backoff(attempt);
                    debug!(
                        "Retrying {} after {:?} ({} failed: {})",
                        command.name(),
                        delay,
                        server,
                        failure.error
                    );
                    self.inner.metrics.for_server(server.address()).record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => return Err(failure.error),
                RetryDecision::Ambiguous => {
                    warn!(
                        "{} to {} may or may not have been applied: {}",
                        command.name(),
                        server,
                        failure.error
                    );
                    return Err(ClientError::AmbiguousFailure {
                        command: command.name(),
                        server: server.address().to_string(),
                        reason: failure.error.to_string(),
                    });
                }
            }
        }
    }

    /// One exchange with one server, feeding the outcome to health tracking
    /// and metrics
    async fn attempt(
        &self,
        server: &Arc<Server>,
        command: &AsciiCommand<'_>,
    ) -> Result<AsciiResponse, AttemptFailure> {
        let address = server.address();
        let pool = self.inner.pools.read().get(address).cloned();
        let pool = match pool {
            Some(pool) => pool,
            None if self.is_closed() => return Err(AttemptFailure::unsent(ClientError::Closed)),
            None => {
                return Err(AttemptFailure::unsent(ClientError::ServerUnavailable(
                    format!("{} was removed", address),
                )))
            }
        };
        let metrics = self.inner.metrics.for_server(address);
        let health = &self.inner.health;

        let started = Instant::now();
        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                if let PoolError::Unavailable(_) = e {
                    health.record_failure(address, FailureKind::Unavailable);
                    metrics.record_connection_failure();
                }
                metrics.record_failure(None);
                return Err(AttemptFailure::unsent(e.into()));
            }
        };

        debug!("{} -> {}", command.name(), address);
        let result = conn.request(command).await;
        let sent = conn.has_sent();
        let elapsed = started.elapsed();

        match result {
            Ok(response) if response.is_error() => {
                // The server answered, so it is healthy, but the stream may
                // hold leftovers of the rejected request
                conn.invalidate();
                health.record_success(address);
                metrics.record_failure(Some(elapsed));
                Err(AttemptFailure {
                    error: server_error(response),
                    sent,
                })
            }
            Ok(response) => {
                health.record_success(address);
                metrics.record_success(elapsed);
                Ok(response)
            }
            Err(e) => {
                if e.is_network() {
                    health.record_failure(address, FailureKind::Transient);
                }
                match e {
                    ConnectionError::Timeout(_) => metrics.record_timeout(),
                    _ => metrics.record_failure(Some(elapsed)),
                }
                warn!("{} to {} failed: {}", command.name(), address, e);
                Err(AttemptFailure {
                    error: e.into(),
                    sent,
                })
            }
        }
    }
}

fn strip_prefix(mut item: CacheItem, key: &CacheKey) -> CacheItem {
    item.key = key.unprefixed().to_string();
    item
}

fn unexpected(command: &AsciiCommand<'_>, response: AsciiResponse) -> ClientError {
    ClientError::Protocol(ProtocolError::UnexpectedResponse {
        command: command.name(),
        line: format!("{:?}", response),
    })
}

fn server_error(response: AsciiResponse) -> ClientError {
    match response {
        AsciiResponse::Error(msg) if msg.is_empty() => {
            ClientError::Server("ERROR".to_string())
        }
        AsciiResponse::Error(msg) => ClientError::Server(format!("ERROR {}", msg)),
        AsciiResponse::ClientError(msg) => ClientError::Server(format!("CLIENT_ERROR {}", msg)),
        AsciiResponse::ServerError(msg) => ClientError::Server(format!("SERVER_ERROR {}", msg)),
        other => ClientError::Server(format!("{:?}", other)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),
    #[error("No servers configured")]
    NoServers,
    #[error("{command} to {server} failed after the request was sent; it may have been applied: {reason}")]
    AmbiguousFailure {
        command: &'static str,
        server: String,
        reason: String,
    },
    #[error("Invalid key: {0}")]
    Validation(#[from] KeyError),
    #[error("Client is closed")]
    Closed,
    #[error("Server replied with an error: {0}")]
    Server(String),
    #[error(transparent)]
    Serialization(#[from] SerializerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Errors that another attempt (possibly on another server) may fix
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::Timeout(_) | ClientError::ServerUnavailable(_)
        )
    }
}

impl From<ConnectionError> for ClientError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::Timeout(limit) => ClientError::Timeout(limit),
            ConnectionError::Protocol(e) => ClientError::Protocol(e),
            other => ClientError::Connection(other.to_string()),
        }
    }
}

impl From<PoolError> for ClientError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Unavailable(reason) => ClientError::ServerUnavailable(reason),
            PoolError::Timeout(limit) => ClientError::Timeout(limit),
        }
    }
}
