pub mod connection;
pub mod connection_pool;
pub mod hash_ring;
pub mod health;
pub mod item;
pub mod key;
pub mod metrics;
pub mod protocols;
pub mod retry;
pub mod serializer;
pub mod server;

// Re-export core types
pub use connection::{Connection, ConnectionError, ConnectionState, ConnectionTimeouts};
pub use connection_pool::{
    MemcachedConnectionManager, MemcachedPool, PoolError, PoolSettings, PoolState, ServerPool,
};
pub use hash_ring::{HashRing, ServerSelector};
pub use health::{FailureKind, HealthPolicy, HealthRegistry, HealthState, ServerStatus};
pub use item::{CacheItem, CasResult, Expiration};
pub use key::{CacheKey, KeyError};
pub use metrics::{MetricsRegistry, MetricsSnapshot, ServerMetrics};
pub use protocols::ProtocolError;
pub use retry::RetryPolicy;
pub use serializer::{
    create_serializer, CacheValue, IdentitySerializer, JsonSerializer, Serializer,
    SerializerError,
};
pub use server::{Server, ServerAddr};
