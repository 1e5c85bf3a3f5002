use crate::core::connection::{Connection, ConnectionError, ConnectionTimeouts};
use crate::core::protocols::{AsciiCommand, AsciiResponse};
use crate::core::server::Server;
use async_trait::async_trait;
use bb8::{ErrorSink, Pool, PooledConnection, RunError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Connection manager for bb8 that opens memcached connections to one server
#[derive(Debug, Clone)]
pub struct MemcachedConnectionManager {
    server: Arc<Server>,
    timeouts: ConnectionTimeouts,
}

impl MemcachedConnectionManager {
    pub fn new(server: Arc<Server>, timeouts: ConnectionTimeouts) -> Self {
        Self { server, timeouts }
    }
}

#[async_trait]
impl bb8::ManageConnection for MemcachedConnectionManager {
    type Connection = Connection;
    type Error = ConnectionError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        Connection::connect(self.server.clone(), self.timeouts).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        match conn.request(&AsciiCommand::Version).await? {
            AsciiResponse::Version(_) => Ok(()),
            other => {
                conn.invalidate();
                Err(ConnectionError::Io(format!(
                    "Health check got unexpected reply: {:?}",
                    other
                )))
            }
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.check_in()
    }
}

/// Remembers when the pool last failed to open a connection so that a
/// checkout timeout can be told apart from plain exhaustion.
#[derive(Debug, Clone, Default)]
struct ConnectFailureSink {
    last_failure: Arc<Mutex<Option<(Instant, String)>>>,
}

impl ErrorSink<ConnectionError> for ConnectFailureSink {
    fn sink(&self, error: ConnectionError) {
        debug!("Background connect failed: {}", error);
        *self.last_failure.lock() = Some((Instant::now(), error.to_string()));
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<ConnectionError>> {
        Box::new(self.clone())
    }
}

/// Pool tuning shared by every server
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_size: u32,
    /// How long `acquire` waits for a free slot
    pub checkout_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub test_on_checkout: bool,
    pub timeouts: ConnectionTimeouts,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            checkout_timeout: Duration::from_secs(1),
            idle_timeout: Some(Duration::from_secs(300)),
            max_lifetime: Some(Duration::from_secs(3600)),
            test_on_checkout: false,
            timeouts: ConnectionTimeouts::default(),
        }
    }
}

/// Type alias for our connection pool
pub type MemcachedPool = Pool<MemcachedConnectionManager>;

/// A checked-out connection; dropping it returns it to its pool
pub type PooledMemcachedConnection = PooledConnection<'static, MemcachedConnectionManager>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub connections: u32,
    pub idle_connections: u32,
}

/// Bounded set of connections to a single server
#[derive(Clone)]
pub struct ServerPool {
    server: Arc<Server>,
    pool: MemcachedPool,
    failures: ConnectFailureSink,
    checkout_timeout: Duration,
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPool")
            .field("server", &self.server.address())
            .field("state", &self.state())
            .finish()
    }
}

impl ServerPool {
    /// Create the pool. No connection is opened until the first checkout.
    pub fn build(server: Arc<Server>, settings: &PoolSettings) -> Self {
        let failures = ConnectFailureSink::default();
        let manager = MemcachedConnectionManager::new(server.clone(), settings.timeouts);

        let pool = Pool::builder()
            .max_size(settings.max_size.max(1))
            .min_idle(None)
            // bb8 rejects a zero checkout timeout
            .connection_timeout(settings.checkout_timeout.max(Duration::from_millis(1)))
            .idle_timeout(settings.idle_timeout)
            .max_lifetime(settings.max_lifetime)
            .test_on_check_out(settings.test_on_checkout)
            .retry_connection(false)
            .error_sink(Box::new(failures.clone()))
            .build_unchecked(manager);

        Self {
            server,
            pool,
            failures,
            checkout_timeout: settings.checkout_timeout,
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Check out a connection, opening one if the pool has room.
    ///
    /// Fails with `Unavailable` when a connection cannot be established and
    /// with `Timeout` when every slot stays busy for the checkout timeout.
    pub async fn acquire(&self) -> Result<PooledMemcachedConnection, PoolError> {
        let started = Instant::now();
        match self.pool.get_owned().await {
            Ok(mut conn) => {
                conn.mark_in_use();
                Ok(conn)
            }
            Err(RunError::User(e)) => {
                warn!("Failed to connect to {}: {}", self.server, e);
                Err(PoolError::Unavailable(e.to_string()))
            }
            Err(RunError::TimedOut) => {
                let recent = self
                    .failures
                    .last_failure
                    .lock()
                    .as_ref()
                    .filter(|(at, _)| *at >= started)
                    .map(|(_, reason)| reason.clone());
                match recent {
                    Some(reason) => {
                        warn!("Failed to connect to {}: {}", self.server, reason);
                        Err(PoolError::Unavailable(reason))
                    }
                    None => {
                        debug!("Pool for {} exhausted", self.server);
                        Err(PoolError::Timeout(self.checkout_timeout))
                    }
                }
            }
        }
    }

    /// Return a connection. Broken or abandoned connections are discarded
    /// by the pool instead of being reused.
    pub fn release(&self, conn: PooledMemcachedConnection) {
        drop(conn);
    }

    pub fn state(&self) -> PoolState {
        let state = self.pool.state();
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Server unavailable: {0}")]
    Unavailable(String),
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    Timeout(Duration),
}
