//! `SQLite` backend for the store.
//!
//! # Architecture
//!
//! - **[`ephemeral`]**: the named shared-cache in-memory dataset and its
//!   anchor connection.
//! - **[`connection`]**: `r2d2` pool whose customizer attaches the dataset and
//!   applies pragmas on every new connection, capped at `max_idle` idle.
//! - **[`schema`]**: table DDL for the durable file and the dataset.
//! - **[`statements`]**: the typed statement set and its compile cache.

pub mod connection;
pub mod ephemeral;
pub mod schema;
pub mod statements;

pub use connection::{
    new_pool, verify_pragmas, ConnectionPool, IdleCappedManager, PooledConnection, PragmaState,
};
pub use ephemeral::EphemeralDataset;
pub use schema::init_schema;
pub use statements::{StatementCache, StatementKind};
