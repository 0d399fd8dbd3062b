//! The shared in-memory dataset attached to every pooled connection.
//!
//! `SQLite` gives each `:memory:` connection a private database. A named
//! in-memory database opened through a `mode=memory&cache=shared` URI is
//! instead shared by every connection in the process that opens the same
//! name, and it lives exactly as long as at least one such connection is open.
//!
//! [`EphemeralDataset`] owns that name and an anchor connection. Pool
//! connections come and go (idle reaping, lifetime limits) without the
//! dataset vanishing underneath them; dropping the dataset after the pool
//! closes destroys it. Each dataset gets a fresh name, so a store reopened in
//! the same process starts with an empty ephemeral table and two stores open
//! at once never see each other's events.

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{InitStage, Result, StoreError};

/// Schema alias under which the dataset is attached.
pub const ALIAS: &str = "mem";

/// A named, process-scoped, shared in-memory database.
#[derive(Debug)]
pub struct EphemeralDataset {
    name: String,
    anchor: Mutex<Connection>,
}

impl EphemeralDataset {
    /// Create a new dataset and attach it to its anchor connection.
    pub fn create() -> Result<Self> {
        let name = format!("ed-mem-{}", Uuid::now_v7());
        let anchor =
            Connection::open_in_memory().map_err(|e| StoreError::init(InitStage::Dataset, e))?;
        let dataset = Self {
            name,
            anchor: Mutex::new(anchor),
        };
        dataset
            .attach(&dataset.anchor.lock())
            .map_err(|e| StoreError::init(InitStage::Dataset, e))?;
        debug!(dataset = %dataset.name, "created shared dataset");
        Ok(dataset)
    }

    /// Dataset name (unique per store instance).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// URI that opens this dataset in shared-cache memory mode.
    pub fn uri(&self) -> String {
        format!("file:{}?mode=memory&cache=shared", self.name)
    }

    /// Attach the dataset to `conn` as [`ALIAS`].
    ///
    /// `conn` must have been opened with URI filenames enabled (the `rusqlite`
    /// default flags include `SQLITE_OPEN_URI`).
    pub fn attach(&self, conn: &Connection) -> rusqlite::Result<()> {
        let _ = conn.execute(&format!("ATTACH DATABASE ?1 AS {ALIAS}"), [self.uri()])?;
        Ok(())
    }

    /// Run `f` on the anchor connection.
    pub fn with_anchor<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        f(&self.anchor.lock())
    }
}

/// Whether `conn` has a database attached under [`ALIAS`].
pub fn is_attached(conn: &Connection) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("PRAGMA database_list")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == ALIAS {
            return Ok(true);
        }
    }
    Ok(false)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
