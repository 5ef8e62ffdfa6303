//! Persistence layer for the conclave orchestration core.
//!
//! Provides the PostgreSQL connection pool, embedded migrations, row
//! models, query functions, and the transaction-scoped advisory-lock
//! primitive used for multi-instance coordination.

pub mod advisory;
pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
