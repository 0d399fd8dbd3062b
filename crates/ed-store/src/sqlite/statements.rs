//! The fixed statement set and its per-connection compilation cache.
//!
//! Every statement the store runs is a [`StatementKind`]. The SQL text and the
//! named placeholders of each kind are given by exhaustive matches, so adding a
//! kind without its SQL does not compile. [`StatementCache::prepare_all`]
//! compiles the whole set once at startup and checks that each statement's
//! placeholders are exactly the declared ones.
//!
//! Compiled statements are bound to the connection that compiled them.
//! Invocations go through `rusqlite`'s per-connection LRU cache, so each
//! statement is compiled once per pooled connection and reused for every call
//! that checks that connection out.

use std::collections::BTreeSet;
use std::fmt;

use rusqlite::{CachedStatement, Connection};
use tracing::debug;

use crate::errors::{InitStage, Result, StatementResultExt, StoreError};
use crate::sqlite::connection::{ConnectionPool, PooledConnection};

/// Named operations the store can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatementKind {
    /// Overwrite an entity's name and bump its update count.
    UpdateEntity,
    /// Create an entity unless the id is taken.
    InsertEntity,
    /// Append one activity event.
    RecordActivity,
    /// Per-entity activity aggregate.
    ReportActivity,
    /// Fetch one entity.
    GetEntity,
    /// Count activity events.
    CountActivity,
}

impl StatementKind {
    /// Every kind, in registration order.
    pub const ALL: [Self; 6] = [
        Self::UpdateEntity,
        Self::InsertEntity,
        Self::RecordActivity,
        Self::ReportActivity,
        Self::GetEntity,
        Self::CountActivity,
    ];

    /// Stable snake-case name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::UpdateEntity => "update_entity",
            Self::InsertEntity => "insert_entity",
            Self::RecordActivity => "record_activity",
            Self::ReportActivity => "report_activity",
            Self::GetEntity => "get_entity",
            Self::CountActivity => "count_activity",
        }
    }

    /// SQL text.
    pub fn sql(self) -> &'static str {
        match self {
            Self::UpdateEntity => {
                "UPDATE main.entity
                    SET name = :name,
                        update_count = update_count + 1
                  WHERE id = :id"
            }
            Self::InsertEntity => {
                "INSERT OR IGNORE INTO main.entity (id, name)
                 VALUES (:id, :name)"
            }
            Self::RecordActivity => {
                "INSERT INTO mem.activity (entity_id)
                 VALUES (:entity_id)"
            }
            Self::ReportActivity => {
                "SELECT e.name             AS entity_name,
                        a.entity_id        AS entity_id,
                        MAX(a.occurred_at) AS latest_at,
                        COUNT(*)           AS event_count
                   FROM mem.activity AS a
                   LEFT OUTER JOIN main.entity AS e
                     ON e.id = a.entity_id
                  GROUP BY a.entity_id
                  ORDER BY latest_at ASC, a.entity_id ASC"
            }
            Self::GetEntity => {
                "SELECT id, name, update_count
                   FROM main.entity
                  WHERE id = :id"
            }
            Self::CountActivity => "SELECT COUNT(*) FROM mem.activity",
        }
    }

    /// Named placeholders the SQL must bind.
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Self::UpdateEntity | Self::InsertEntity => &[":id", ":name"],
            Self::RecordActivity => &[":entity_id"],
            Self::GetEntity => &[":id"],
            Self::ReportActivity | Self::CountActivity => &[],
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle to the validated statement set.
///
/// Holds no compiled statements itself; those live in each connection's
/// cache, sized by the pool customizer.
#[derive(Debug)]
pub struct StatementCache {
    _validated: (),
}

impl StatementCache {
    /// Compile and validate every [`StatementKind`] on one pooled connection.
    ///
    /// Runs after the schema exists. Any compile error or placeholder mismatch
    /// is an [`InitStage::Statements`] failure.
    pub fn prepare_all(pool: &ConnectionPool) -> Result<Self> {
        let conn = pool
            .get()
            .map_err(|e| StoreError::init(InitStage::Statements, e))?;
        for kind in StatementKind::ALL {
            let stmt = conn
                .prepare_cached(kind.sql())
                .map_err(|e| StoreError::init(InitStage::Statements, format!("{kind}: {e}")))?;
            check_placeholders(kind, &stmt)?;
            debug!(statement = %kind, "statement compiled");
        }
        Ok(Self { _validated: () })
    }

    /// Compiled statement for `kind` on `conn`, compiling on first use.
    pub fn statement<'c>(&self, conn: &'c Connection, kind: StatementKind) -> Result<CachedStatement<'c>> {
        conn.prepare_cached(kind.sql()).during(kind)
    }

    /// Finalize the compiled statements of every idle connection.
    ///
    /// Returns the number of connections flushed. Connections checked out
    /// elsewhere are flushed by the pool when it retires them.
    pub fn release_all(&self, pool: &ConnectionPool) -> usize {
        let idle = pool.state().idle_connections;
        let held: Vec<PooledConnection> = (0..idle).map_while(|_| pool.try_get()).collect();
        for conn in &held {
            conn.flush_prepared_statement_cache();
        }
        debug!(connections = held.len(), "released compiled statements");
        held.len()
    }
}

fn check_placeholders(kind: StatementKind, stmt: &rusqlite::Statement<'_>) -> Result<()> {
    let found: BTreeSet<&str> = (1..=stmt.parameter_count())
        .filter_map(|i| stmt.parameter_name(i))
        .collect();
    let expected: BTreeSet<&str> = kind.params().iter().copied().collect();
    if stmt.parameter_count() != expected.len() || found != expected {
        return Err(StoreError::init(
            InitStage::Statements,
            format!("{kind}: placeholders {found:?} do not match {expected:?}"),
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_index(kind: StatementKind) -> usize {
        match kind {
            StatementKind::UpdateEntity => 0,
            StatementKind::InsertEntity => 1,
            StatementKind::RecordActivity => 2,
            StatementKind::ReportActivity => 3,
            StatementKind::GetEntity => 4,
            StatementKind::CountActivity => 5,
        }
    }

    #[test]
    fn all_lists_every_kind_once() {
        for (i, kind) in StatementKind::ALL.into_iter().enumerate() {
            assert_eq!(kind_index(kind), i);
        }
    }

    #[test]
    fn names_are_unique() {
        let names: BTreeSet<_> = StatementKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names.len(), StatementKind::ALL.len());
    }

    #[test]
    fn sql_uses_named_placeholders_only() {
        for kind in StatementKind::ALL {
            assert!(!kind.sql().contains('?'), "{kind} uses positional params");
        }
    }

    #[test]
    fn declared_params_appear_in_sql() {
        for kind in StatementKind::ALL {
            for param in kind.params() {
                assert!(kind.sql().contains(param), "{kind} is missing {param}");
            }
        }
    }

    #[test]
    fn placeholder_mismatch_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE entity (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        let stmt = conn
            .prepare("SELECT name FROM entity WHERE id = :entity")
            .unwrap();
        let err = check_placeholders(StatementKind::GetEntity, &stmt).unwrap_err();
        assert!(err.to_string().contains("get_entity"));
    }

    #[test]
    fn matching_placeholders_pass() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE entity (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        let stmt = conn
            .prepare("UPDATE entity SET name = :name WHERE id = :id")
            .unwrap();
        check_placeholders(StatementKind::UpdateEntity, &stmt).unwrap();
    }

    #[test]
    fn display_matches_name() {
        assert_eq!(StatementKind::RecordActivity.to_string(), "record_activity");
    }
}
