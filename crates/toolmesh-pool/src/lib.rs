//! Toolmesh Connection Pool
//!
//! Keeps a bounded set of long-lived connections per backend server. Each
//! connection monitors its own health and reconnects with exponential backoff
//! when a probe fails; the pool hands out healthy connections and reaps dead
//! or stale ones.

pub mod config;
pub mod connection;
pub mod pool;

pub use config::ConnectionPoolConfig;
pub use connection::{ConnectionInfo, ConnectionState, PooledConnection, StateChange};
pub use pool::{ConnectionPool, PoolStats, ServerPoolStats};
