//! # ed-store
//!
//! Pooled `SQLite` store pairing a durable `entity` table with a
//! process-lifetime `activity` table.
//!
//! - **Shared dataset**: every pooled connection attaches one named
//!   shared-cache in-memory database as `mem`, so activity recorded through
//!   any connection is visible to all of them
//! - **Statement cache**: a typed, exhaustively checked statement set,
//!   compiled once per connection and reused
//! - **Pool**: bounded `r2d2` pool with an idle ceiling; concurrency relies on
//!   `SQLite` locking and lock waits bounded by the busy timeout
//!
//! ```no_run
//! let store = ed_store::Store::open("diskDb.db")?;
//! store.upsert_entity(1, "Andy")?;
//! store.record_activity(1)?;
//! for row in store.report_activity()? {
//!     println!("{row:?}");
//! }
//! store.close();
//! # Ok::<(), ed_store::StoreError>(())
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod logging;
pub mod sqlite;
pub mod store;
pub mod types;

pub use config::{load_config_from_path, ConfigError, PoolConfig, StoreConfig};
pub use errors::{InitStage, Result, StoreError};
pub use sqlite::StatementKind;
pub use store::{PoolStatus, Store};
pub use types::{ActivityReport, Entity, ReportRow, UpsertOutcome};
