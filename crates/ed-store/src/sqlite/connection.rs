//! `SQLite` connection pool whose connections all carry the shared dataset.
//!
//! Uses `r2d2` connection pooling with the `r2d2_sqlite` backend. The
//! [`AttachCustomizer`] runs on each new connection: it sets the busy timeout
//! and journal pragmas, sizes the per-connection statement cache, and attaches
//! the store's [`EphemeralDataset`]. When the pool retires a connection the
//! customizer finalizes its cached statements.
//!
//! `r2d2` has no idle ceiling of its own. [`IdleCappedManager`] reports a
//! connection as broken when it is checked in while `max_idle` connections
//! already sit idle, and the pool closes it on the spot.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use r2d2::event::{AcquireEvent, CheckoutEvent, HandleEvent, ReleaseEvent};
use r2d2::{ManageConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::debug;

use crate::config::StoreConfig;
use crate::errors::{InitStage, Result, StoreError};
use crate::sqlite::ephemeral::{self, EphemeralDataset};

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<IdleCappedManager>;

/// Alias for a pooled connection.
pub type PooledConnection = r2d2::PooledConnection<IdleCappedManager>;

/// Per-connection setup hook.
#[derive(Debug)]
struct AttachCustomizer {
    dataset: Arc<EphemeralDataset>,
    busy_timeout_ms: u32,
    statement_cache_capacity: usize,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for AttachCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        // journal_mode applies to every attached schema, so it runs before ATTACH.
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};\
             PRAGMA journal_mode = WAL;\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))?;
        conn.set_prepared_statement_cache_capacity(self.statement_cache_capacity);
        self.dataset.attach(conn)?;
        debug!(dataset = %self.dataset.name(), "attached shared dataset to new connection");
        Ok(())
    }

    fn on_release(&self, conn: Connection) {
        conn.flush_prepared_statement_cache();
        debug!(dataset = %self.dataset.name(), "released pooled connection");
    }
}

/// Idle-connection bookkeeping shared by the manager and the pool events.
#[derive(Debug)]
struct IdleCeiling {
    max_idle: u32,
    idle: AtomicU32,
    /// Check-ins refused by [`IdleCappedManager::has_broken`] whose release
    /// event has not arrived yet.
    refused: AtomicU32,
}

impl IdleCeiling {
    fn new(max_idle: u32) -> Self {
        Self {
            max_idle,
            idle: AtomicU32::new(0),
            refused: AtomicU32::new(0),
        }
    }

    /// Claim an idle slot for a connection being checked in.
    fn admit(&self) -> bool {
        self.idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_idle).then_some(n + 1)
            })
            .is_ok()
    }

    fn leave(&self) {
        let _ = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Keeps [`IdleCeiling`] in step with connections the pool opens, hands out,
/// and closes.
#[derive(Debug)]
struct IdleTracker(Arc<IdleCeiling>);

impl HandleEvent for IdleTracker {
    fn handle_acquire(&self, _event: AcquireEvent) {
        // New connections land in the idle set before anyone checks them out.
        let _ = self.0.idle.fetch_add(1, Ordering::AcqRel);
    }

    fn handle_checkout(&self, _event: CheckoutEvent) {
        self.0.leave();
    }

    fn handle_release(&self, _event: ReleaseEvent) {
        let refused = self
            .0
            .refused
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        // A refused check-in never held an idle slot.
        if refused.is_err() {
            self.0.leave();
        }
    }
}

/// [`SqliteConnectionManager`] that enforces the pool's idle ceiling.
#[derive(Debug)]
pub struct IdleCappedManager {
    inner: SqliteConnectionManager,
    ceiling: Arc<IdleCeiling>,
}

impl ManageConnection for IdleCappedManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> std::result::Result<Connection, rusqlite::Error> {
        self.inner.connect()
    }

    fn is_valid(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        self.inner.is_valid(conn)
    }

    /// Called by the pool on check-in. `true` closes the connection instead
    /// of returning it to the idle set.
    fn has_broken(&self, conn: &mut Connection) -> bool {
        let close = self.inner.has_broken(conn) || !self.ceiling.admit();
        if close {
            let _ = self.ceiling.refused.fetch_add(1, Ordering::AcqRel);
            debug!(max_idle = self.ceiling.max_idle, "closing connection above idle ceiling");
        }
        close
    }
}

/// Build the pool for `config`, attaching `dataset` to every connection.
///
/// At most `max_idle` connections stay open while unused; a connection
/// checked in above that is closed immediately. One connection is opened
/// eagerly so an unusable database path fails here.
pub fn new_pool(config: &StoreConfig, dataset: Arc<EphemeralDataset>) -> Result<ConnectionPool> {
    let ceiling = Arc::new(IdleCeiling::new(config.pool.max_idle));
    let manager = IdleCappedManager {
        inner: SqliteConnectionManager::file(&config.db_path),
        ceiling: Arc::clone(&ceiling),
    };
    let pool = Pool::builder()
        .max_size(config.pool.max_size)
        .min_idle(Some(config.pool.max_idle.min(1)))
        .idle_timeout(Some(config.pool.idle_timeout()))
        .max_lifetime(None)
        .connection_timeout(config.pool.connection_timeout())
        .event_handler(Box::new(IdleTracker(ceiling)))
        .connection_customizer(Box::new(AttachCustomizer {
            dataset,
            busy_timeout_ms: config.busy_timeout_ms,
            statement_cache_capacity: config.statement_cache_capacity,
        }))
        .build(manager)
        .map_err(|e| StoreError::init(InitStage::Pool, e))?;
    Ok(pool)
}

/// Verify pragmas and attachment on a connection.
pub fn verify_pragmas(conn: &Connection) -> rusqlite::Result<PragmaState> {
    let journal_mode: String = conn.query_row("PRAGMA main.journal_mode", [], |row| row.get(0))?;
    let busy_timeout_ms: u32 = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;
    Ok(PragmaState {
        journal_mode,
        busy_timeout_ms,
        dataset_attached: ephemeral::is_attached(conn)?,
    })
}

/// Pragma state for verification.
#[derive(Debug)]
pub struct PragmaState {
    /// Journal mode of the durable database (should be "wal").
    pub journal_mode: String,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Whether the shared dataset is attached.
    pub dataset_attached: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
