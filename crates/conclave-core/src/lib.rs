//! Orchestration core for the conclave multi-agent collaboration server.
//!
//! Executes scheduled actions and DAG-shaped pipelines against the shared
//! PostgreSQL store, with multi-instance coordination via advisory locks,
//! crash recovery, and ordered graceful shutdown.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod events;
pub mod pipeline;
pub mod ports;
pub mod scheduler;
pub mod shutdown;
