//! SQL DDL for the durable and ephemeral tables.

use rusqlite::Connection;
use tracing::info;

use crate::errors::{InitStage, Result, StoreError};

/// Durable entities. Safe to run against an existing file.
pub const CREATE_PERSISTENT: &str = r"
CREATE TABLE IF NOT EXISTS main.entity (
    id           INTEGER PRIMARY KEY,
    name         TEXT    NOT NULL,
    update_count INTEGER NOT NULL DEFAULT 0
);
";

/// Activity events. The dataset is always empty at attach, so no `IF NOT EXISTS`.
pub const CREATE_EPHEMERAL: &str = r"
CREATE TABLE mem.activity (
    id          INTEGER PRIMARY KEY,
    entity_id   INTEGER NOT NULL,
    occurred_at TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
";

/// Create both tables in one transaction on `conn`.
///
/// Must complete before any other connection runs statements against the
/// schema.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| StoreError::init(InitStage::Schema, e))?;
    tx.execute_batch(CREATE_PERSISTENT)
        .map_err(|e| StoreError::init(InitStage::Schema, format!("entity table: {e}")))?;
    tx.execute_batch(CREATE_EPHEMERAL)
        .map_err(|e| StoreError::init(InitStage::Schema, format!("activity table: {e}")))?;
    tx.commit()
        .map_err(|e| StoreError::init(InitStage::Schema, e))?;
    info!("schema ready");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
