//! Netpass shared infrastructure
//!
//! Database pool construction and migration running, shared by the API
//! server and the background worker.

mod db;

pub use db::{create_migration_pool, create_pool, run_migrations};
