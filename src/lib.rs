pub mod client;
pub mod config;
pub mod core;

// Re-export main components for easy access
pub use client::{Client, ClientError, MultiGet, ServerResult};
pub use config::{ClientConfig, ConfigError, ServerSpec};
pub use core::*;
