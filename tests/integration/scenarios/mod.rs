//! Test scenarios for integration testing
//!
//! Each module contains tests for specific functionality:
//! - commands: every client operation against a healthy server
//! - pool: connection reuse, bounds and cancellation
//! - failover: dead servers, retries and ambiguous failures

pub mod commands;
pub mod failover;
pub mod pool;
