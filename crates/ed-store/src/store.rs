//! High-level [`Store`] API.
//!
//! A `Store` owns the connection pool, the shared in-memory dataset every
//! pooled connection attaches, and the validated statement set. It is
//! `Send + Sync`; share it across workers with an `Arc`. Workers never
//! coordinate with each other: contention is resolved by pool checkout, the
//! `SQLite` busy timeout on the durable file, and a bounded retry on the
//! shared dataset's table locks. Every lock wait ends within the busy timeout
//! as [`StoreError::ContentionTimeout`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rusqlite::{named_params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::errors::{InitStage, Result, StatementResultExt, StoreError};
use crate::sqlite::connection::{self, ConnectionPool, PooledConnection};
use crate::sqlite::ephemeral::EphemeralDataset;
use crate::sqlite::schema;
use crate::sqlite::statements::{StatementCache, StatementKind};
use crate::types::{ActivityReport, Entity, ReportRow, UpsertOutcome};

/// Snapshot of pool occupancy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections.
    pub connections: u32,
    /// Open connections not checked out.
    pub idle_connections: u32,
}

/// Pooled hybrid store: durable entities plus process-lifetime activity.
///
/// Field order matters: the pool drops before the dataset it attaches.
pub struct Store {
    pool: ConnectionPool,
    statements: StatementCache,
    dataset: Arc<EphemeralDataset>,
    db_path: PathBuf,
    lock_wait: Duration,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_path", &self.db_path)
            .field("dataset", &self.dataset.name())
            .field("pool", &self.pool_status())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open the store backed by the database file at `path`, with defaults.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(&StoreConfig::for_path(path.as_ref()))
    }

    /// Open the store described by `config`.
    ///
    /// Creates the shared dataset, builds the pool, creates the schema on a
    /// single connection, and compiles the statement set, in that order.
    pub fn open_with_config(config: &StoreConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| StoreError::init(InitStage::Config, e))?;

        let dataset = Arc::new(EphemeralDataset::create()?);
        let pool = connection::new_pool(config, Arc::clone(&dataset))?;
        {
            let conn = pool
                .get()
                .map_err(|e| StoreError::init(InitStage::Schema, e))?;
            schema::init_schema(&conn)?;
        }
        let statements = StatementCache::prepare_all(&pool)?;

        info!(
            path = %config.db_path.display(),
            dataset = %dataset.name(),
            max_size = config.pool.max_size,
            max_idle = config.pool.max_idle,
            "store opened"
        );

        Ok(Self {
            pool,
            statements,
            dataset,
            db_path: config.db_path.clone(),
            lock_wait: Duration::from_millis(u64::from(config.busy_timeout_ms)),
        })
    }

    /// Release compiled statements, close the pool, and drop the dataset.
    ///
    /// Consumes the store. Returns the number of idle connections whose
    /// statements were released explicitly.
    pub fn close(self) -> usize {
        let released = self.statements.release_all(&self.pool);
        let Self {
            pool,
            dataset,
            db_path,
            ..
        } = self;
        drop(pool);
        info!(
            path = %db_path.display(),
            dataset = %dataset.name(),
            released,
            "store closed"
        );
        drop(dataset);
        released
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Run `op`, retrying while a shared-cache table lock refuses it.
    ///
    /// Gives up once the busy timeout has elapsed and returns the last error.
    fn retry_locked<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let deadline = Instant::now() + self.lock_wait;
        let mut attempts = 0;
        loop {
            match op() {
                Err(err) if is_table_locked(&err) && back_off(&mut attempts, deadline) => {}
                Err(err) => return Err(log_contention(err)),
                ok => return ok,
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Entities
    // ─────────────────────────────────────────────────────────────────────

    /// Create the entity or overwrite its name and bump its update count.
    ///
    /// Update-if-exists then insert-if-absent, as two autocommit statements
    /// on one connection. If another caller creates the id between the two,
    /// the insert is ignored and the update runs once more, so every
    /// [`UpsertOutcome::Updated`] is counted in `update_count`.
    pub fn upsert_entity(&self, id: i64, name: &str) -> Result<UpsertOutcome> {
        let conn = self.conn()?;
        let run = |kind: StatementKind| {
            self.retry_locked(|| {
                self.statements
                    .statement(&conn, kind)?
                    .execute(named_params! { ":id": id, ":name": name })
                    .during(kind)
            })
        };

        if run(StatementKind::UpdateEntity)? > 0 {
            return Ok(UpsertOutcome::Updated);
        }
        if run(StatementKind::InsertEntity)? > 0 {
            return Ok(UpsertOutcome::Inserted);
        }
        debug!(id, "entity created concurrently, updating instead");
        match run(StatementKind::UpdateEntity)? {
            0 => Err(StoreError::execution(
                StatementKind::UpdateEntity,
                rusqlite::Error::StatementChangedRows(0),
            )),
            _ => Ok(UpsertOutcome::Updated),
        }
    }

    /// Fetch an entity by id.
    pub fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
        let conn = self.conn()?;
        self.retry_locked(|| {
            self.statements
                .statement(&conn, StatementKind::GetEntity)?
                .query_row(named_params! { ":id": id }, Entity::from_row)
                .optional()
                .during(StatementKind::GetEntity)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Activity
    // ─────────────────────────────────────────────────────────────────────

    /// Append one activity event for `entity_id` and return its event id.
    ///
    /// `entity_id` is not checked against existing entities; events for ids
    /// that were never upserted are kept and reported with no name.
    pub fn record_activity(&self, entity_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        self.retry_locked(|| {
            self.statements
                .statement(&conn, StatementKind::RecordActivity)?
                .insert(named_params! { ":entity_id": entity_id })
                .during(StatementKind::RecordActivity)
        })
    }

    /// Per-entity activity aggregate, oldest latest-event first.
    pub fn report_activity(&self) -> Result<ActivityReport> {
        let mut rows = Vec::new();
        let _ = self.for_each_activity(|row| rows.push(row))?;
        Ok(ActivityReport::new(rows))
    }

    /// Stream the activity report to `f` without collecting it.
    ///
    /// Returns the number of rows visited. The connection stays checked out
    /// and holds a read lock on the activity table until the last row is
    /// delivered. Recording activity from `f` therefore waits out the busy
    /// timeout and fails with [`StoreError::ContentionTimeout`].
    pub fn for_each_activity<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(ReportRow),
    {
        let conn = self.conn()?;
        let deadline = Instant::now() + self.lock_wait;
        let mut attempts = 0;
        loop {
            let mut visited = 0;
            match self.stream_report(&conn, &mut f, &mut visited) {
                Ok(()) => return Ok(visited),
                // Rows already handed to `f` cannot be taken back.
                Err(err)
                    if visited == 0 && is_table_locked(&err) && back_off(&mut attempts, deadline) => {}
                Err(err) => return Err(log_contention(err)),
            }
        }
    }

    fn stream_report<F>(&self, conn: &Connection, f: &mut F, visited: &mut usize) -> Result<()>
    where
        F: FnMut(ReportRow),
    {
        let kind = StatementKind::ReportActivity;
        let mut stmt = self.statements.statement(conn, kind)?;
        let mut rows = stmt.query([]).during(kind)?;
        while let Some(row) = rows.next().during(kind)? {
            f(ReportRow::from_row(row)?);
            *visited += 1;
        }
        Ok(())
    }

    /// Number of activity events recorded since open.
    pub fn activity_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = self.retry_locked(|| {
            self.statements
                .statement(&conn, StatementKind::CountActivity)?
                .query_row([], |row| row.get(0))
                .during(StatementKind::CountActivity)
        })?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    /// Current pool occupancy.
    pub fn pool_status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    /// Name of the shared dataset this store attaches.
    pub fn dataset_name(&self) -> &str {
        self.dataset.name()
    }

    /// Check out a raw connection (diagnostics and tests).
    pub fn connection(&self) -> Result<PooledConnection> {
        self.conn()
    }
}

/// Whether a shared-cache table lock refused the statement.
///
/// `SQLITE_BUSY` on the durable file has already waited in the busy handler
/// and is not retried.
fn is_table_locked(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::ContentionTimeout { source, .. }
            if source.sqlite_error_code() == Some(ErrorCode::DatabaseLocked)
    )
}

/// Sleep before the next attempt: linear backoff capped at 5 ms, ±25% jitter.
///
/// Returns `false` without sleeping when the pause would pass `deadline`.
fn back_off(attempts: &mut u32, deadline: Instant) -> bool {
    *attempts += 1;
    let base_us = u64::from(*attempts).saturating_mul(100).min(5_000);
    let jitter_range = base_us / 4;
    let jitter = rand::rng().random_range(0..=jitter_range * 2);
    let pause = Duration::from_micros(base_us - jitter_range + jitter);
    if Instant::now() + pause > deadline {
        return false;
    }
    std::thread::sleep(pause);
    true
}

fn log_contention(err: StoreError) -> StoreError {
    if let StoreError::ContentionTimeout { statement, .. } = &err {
        warn!(statement = %statement, "lock wait exceeded busy timeout");
    }
    err
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn first_upsert_inserts() {
        let (_dir, store) = open_temp();
        assert_eq!(store.upsert_entity(1, "Andy").unwrap(), UpsertOutcome::Inserted);
        let entity = store.get_entity(1).unwrap().unwrap();
        assert_eq!(
            entity,
            Entity {
                id: 1,
                name: "Andy".into(),
                update_count: 0
            }
        );
    }

    #[test]
    fn second_upsert_updates_name_and_count() {
        let (_dir, store) = open_temp();
        let _ = store.upsert_entity(1, "Andy").unwrap();
        assert_eq!(store.upsert_entity(1, "Andy2").unwrap(), UpsertOutcome::Updated);
        let entity = store.get_entity(1).unwrap().unwrap();
        assert_eq!((entity.id, entity.name.as_str(), entity.update_count), (1, "Andy2", 1));
    }

    #[test]
    fn update_count_tracks_every_update() {
        let (_dir, store) = open_temp();
        for name in ["Jim", "Sue", "SueSpoon"] {
            let _ = store.upsert_entity(2, name).unwrap();
        }
        let entity = store.get_entity(2).unwrap().unwrap();
        assert_eq!(entity.name, "SueSpoon");
        assert_eq!(entity.update_count, 2);
    }

    #[test]
    fn missing_entity_is_none() {
        let (_dir, store) = open_temp();
        assert_eq!(store.get_entity(42).unwrap(), None);
    }

    #[test]
    fn record_activity_returns_increasing_ids() {
        let (_dir, store) = open_temp();
        let a = store.record_activity(1).unwrap();
        let b = store.record_activity(1).unwrap();
        assert!(b > a);
        assert_eq!(store.activity_count().unwrap(), 2);
    }

    #[test]
    fn worked_example() {
        let (_dir, store) = open_temp();
        let _ = store.upsert_entity(1, "Andy").unwrap();
        let _ = store.upsert_entity(1, "Andy2").unwrap();
        for _ in 0..3 {
            let _ = store.record_activity(1).unwrap();
        }
        let before_report = chrono::Utc::now();

        let rows: Vec<_> = store.report_activity().unwrap().collect();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.entity_name.as_deref(), Some("Andy2"));
        assert_eq!(row.entity_id, 1);
        assert_eq!(row.event_count, 3);
        assert!(row.latest_at <= before_report);
    }

    #[test]
    fn orphan_events_report_without_name() {
        let (_dir, store) = open_temp();
        let _ = store.record_activity(77).unwrap();
        let _ = store.record_activity(77).unwrap();
        let rows: Vec<_> = store.report_activity().unwrap().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_name, None);
        assert_eq!(rows[0].entity_id, 77);
        assert_eq!(rows[0].event_count, 2);
    }

    #[test]
    fn distinct_orphans_are_not_merged() {
        let (_dir, store) = open_temp();
        let _ = store.record_activity(5).unwrap();
        let _ = store.record_activity(6).unwrap();
        let report = store.report_activity().unwrap();
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn report_orders_by_latest_event() {
        let (_dir, store) = open_temp();
        let _ = store.upsert_entity(1, "Andy").unwrap();
        let _ = store.upsert_entity(2, "Jim").unwrap();
        let _ = store.record_activity(2).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _ = store.record_activity(1).unwrap();

        let ids: Vec<_> = store.report_activity().unwrap().map(|r| r.entity_id).collect();
        assert_eq!(ids, vec![2, 1]);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let _ = store.record_activity(2).unwrap();
        let ids: Vec<_> = store.report_activity().unwrap().map(|r| r.entity_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn report_reflects_state_at_call_time() {
        let (_dir, store) = open_temp();
        let _ = store.record_activity(1).unwrap();
        let first = store.report_activity().unwrap();
        let _ = store.record_activity(1).unwrap();
        let second: Vec<_> = store.report_activity().unwrap().collect();
        assert_eq!(first.map(|r| r.event_count).collect::<Vec<_>>(), vec![1]);
        assert_eq!(second[0].event_count, 2);
    }

    #[test]
    fn for_each_activity_streams_rows() {
        let (_dir, store) = open_temp();
        let _ = store.record_activity(1).unwrap();
        let _ = store.record_activity(2).unwrap();
        let mut seen = Vec::new();
        let visited = store.for_each_activity(|row| seen.push(row.entity_id)).unwrap();
        assert_eq!(visited, 2);
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn empty_report() {
        let (_dir, store) = open_temp();
        assert_eq!(store.report_activity().unwrap().len(), 0);
    }

    #[test]
    fn execution_error_leaves_store_usable() {
        let (_dir, store) = open_temp();
        {
            let conn = store.connection().unwrap();
            conn.execute_batch("DROP TABLE mem.activity").unwrap();
        }
        let err = store.record_activity(1).unwrap_err();
        assert!(err.is_execution());

        {
            let conn = store.connection().unwrap();
            conn.execute_batch(schema::CREATE_EPHEMERAL).unwrap();
        }
        let _ = store.record_activity(1).unwrap();
        let _ = store.upsert_entity(1, "Andy").unwrap();
    }

    #[test]
    fn invalid_config_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::for_path(dir.path().join("x.db"));
        config.pool.max_idle = config.pool.max_size + 1;
        assert_matches!(
            Store::open_with_config(&config),
            Err(StoreError::Initialization {
                stage: InitStage::Config,
                ..
            })
        );
    }

    #[test]
    fn close_releases_idle_connections() {
        let (_dir, store) = open_temp();
        let _ = store.upsert_entity(1, "Andy").unwrap();
        assert!(store.pool_status().idle_connections > 0);
        assert!(store.close() > 0);
    }

    #[test]
    fn back_off_respects_deadline() {
        let mut attempts = 0;
        assert!(!back_off(&mut attempts, Instant::now()));
        assert_eq!(attempts, 1);

        let later = Instant::now() + Duration::from_secs(5);
        assert!(back_off(&mut attempts, later));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn only_table_locks_are_retried() {
        let locked = StoreError::execution(
            StatementKind::RecordActivity,
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                None,
            ),
        );
        let busy = StoreError::execution(
            StatementKind::UpdateEntity,
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            ),
        );
        assert!(is_table_locked(&locked));
        assert!(!is_table_locked(&busy));
        assert!(busy.is_contention());
    }

    #[test]
    fn recording_inside_a_report_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            busy_timeout_ms: 50,
            ..StoreConfig::for_path(dir.path().join("store.db"))
        };
        let store = Store::open_with_config(&config).unwrap();
        let _ = store.record_activity(1).unwrap();

        let mut nested = None;
        let visited = store
            .for_each_activity(|_| nested = Some(store.record_activity(1)))
            .unwrap();
        assert_eq!(visited, 1);
        assert_matches!(
            nested,
            Some(Err(StoreError::ContentionTimeout {
                statement: StatementKind::RecordActivity,
                ..
            }))
        );
        assert_eq!(store.activity_count().unwrap(), 1);
    }

    #[test]
    fn store_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Store>();
    }
}
