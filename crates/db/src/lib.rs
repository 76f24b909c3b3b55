pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with, DbPool, PoolSettings};
pub use repositories::{SqlAuditStore, SqlInstanceStore};
