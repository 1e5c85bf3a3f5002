//! Integration test helpers and scenarios
//!
//! - A mock memcached server with configurable failure modes
//! - Client configuration tuned for fast failure detection
//! - Scenarios exercising the client end to end over TCP

pub mod helpers;
pub mod scenarios;

// Re-export commonly used helpers
pub use helpers::{
    init_tracing, key_owned_by, keys_owned_by,
    mock_memcached::{MockMemcached, MockMemcachedBuilder, ResponseMode},
    test_config,
};
