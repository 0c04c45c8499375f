//! Persistence layer: SQLite-backed Job Repository (C7) and Metrics
//! Snapshot Store (C13), sharing one connection pool.

pub mod sqlite;
