//! Row types returned by the store.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StatementResultExt, StoreError};
use crate::sqlite::StatementKind;

/// A durable entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Caller-assigned id.
    pub id: i64,
    /// Latest name written.
    pub name: String,
    /// Number of upserts that found the entity already present.
    pub update_count: i64,
}

impl Entity {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            update_count: row.get(2)?,
        })
    }
}

/// What an upsert did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpsertOutcome {
    /// The id was new; the entity was created with `update_count = 0`.
    Inserted,
    /// The id existed; its name was overwritten and its count bumped.
    Updated,
}

/// One line of the activity report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    /// Entity name, `None` when no entity with this id has been upserted.
    pub entity_name: Option<String>,
    /// Entity id the events refer to.
    pub entity_id: i64,
    /// Timestamp of the most recent event.
    pub latest_at: DateTime<Utc>,
    /// Number of events recorded for this id.
    pub event_count: u64,
}

impl ReportRow {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self> {
        let kind = StatementKind::ReportActivity;
        let latest: String = row.get(2).during(kind)?;
        let count: i64 = row.get(3).during(kind)?;
        Ok(Self {
            entity_name: row.get(0).during(kind)?,
            entity_id: row.get(1).during(kind)?,
            latest_at: parse_timestamp(&latest)?,
            event_count: u64::try_from(count).unwrap_or_default(),
        })
    }
}

/// Parse an RFC 3339 timestamp written by the engine.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidTimestamp(format!("{raw}: {e}")))
}

/// A finished, one-shot activity report.
///
/// Iterating consumes it. Call [`crate::Store::report_activity`] again for a
/// fresh view of current state.
#[derive(Debug)]
pub struct ActivityReport {
    rows: std::vec::IntoIter<ReportRow>,
}

impl ActivityReport {
    pub(crate) fn new(rows: Vec<ReportRow>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl Iterator for ActivityReport {
    type Item = ReportRow;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for ActivityReport {}

impl std::iter::FusedIterator for ActivityReport {}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_engine_timestamp() {
        let ts = parse_timestamp("2026-10-17T08:15:42.123Z").unwrap();
        assert_eq!(ts.year(), 2026);
        assert_eq!(ts.hour(), 8);
        assert_eq!(ts.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn rejects_sqlite_default_format() {
        let err = parse_timestamp("2026-10-17 08:15:42").unwrap_err();
        assert!(matches!(err, StoreError::InvalidTimestamp(_)));
    }

    #[test]
    fn report_is_one_shot() {
        let row = ReportRow {
            entity_name: None,
            entity_id: 9,
            latest_at: parse_timestamp("2026-10-17T08:15:42.000Z").unwrap(),
            event_count: 1,
        };
        let mut report = ActivityReport::new(vec![row.clone()]);
        assert_eq!(report.len(), 1);
        assert_eq!(report.next(), Some(row));
        assert_eq!(report.next(), None);
        assert_eq!(report.next(), None);
    }

    #[test]
    fn report_row_serializes_camel_case() {
        let row = ReportRow {
            entity_name: Some("Andy".into()),
            entity_id: 1,
            latest_at: parse_timestamp("2026-10-17T08:15:42.000Z").unwrap(),
            event_count: 3,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["entityName"], "Andy");
        assert_eq!(json["eventCount"], 3);
    }
}
