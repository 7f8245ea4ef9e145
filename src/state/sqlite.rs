use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ratchet_common::{FailureCode, PhaseStatus};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};

use super::store::{PersistedPhaseRow, PhaseStore, UpdateOutcome};
use crate::errors::{StoreError, StoreErrorKind};

const ROW_COLUMNS: &str = "phase_id, run_id, state, retry_attempt, revision_epoch, escalation_level,
     last_failure_reason, last_failure_code, last_attempt_timestamp, version, created_at, updated_at";

/// SQLite-backed [`PhaseStore`].
///
/// Conditional updates run inside a `BEGIN IMMEDIATE` transaction, which
/// takes the database write lock before the version is read.
pub struct SqlitePhaseStore {
    conn: Connection,
}

impl SqlitePhaseStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| map_sqlite_err(e, false))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| map_sqlite_err(e, false))?;
        // journal_mode answers with a row, so it cannot go through execute_batch
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(|e| map_sqlite_err(e, false))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| map_sqlite_err(e, false))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS phase_rows (
                    phase_id TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'pending',
                    retry_attempt INTEGER NOT NULL DEFAULT 0,
                    revision_epoch INTEGER NOT NULL DEFAULT 0,
                    escalation_level INTEGER NOT NULL DEFAULT 0,
                    last_failure_reason TEXT,
                    last_failure_code TEXT,
                    last_attempt_timestamp TEXT,
                    version INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, phase_id)
                );

                CREATE INDEX IF NOT EXISTS idx_phase_rows_run_state ON phase_rows(run_id, state);
                ",
            )
            .map_err(|e| map_sqlite_err(e, false))
    }

    fn select_row(
        conn: &Connection,
        run_id: &str,
        phase_id: &str,
    ) -> rusqlite::Result<Option<PersistedPhaseRow>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM phase_rows WHERE run_id = ?1 AND phase_id = ?2",
                ROW_COLUMNS
            ),
            params![run_id, phase_id],
            row_from_sql,
        )
        .optional()
    }
}

impl PhaseStore for SqlitePhaseStore {
    fn fetch(&mut self, run_id: &str, phase_id: &str) -> Result<Option<PersistedPhaseRow>, StoreError> {
        Self::select_row(&self.conn, run_id, phase_id).map_err(|e| map_sqlite_err(e, false))
    }

    fn insert_if_absent(&mut self, row: &PersistedPhaseRow) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO phase_rows
                 (phase_id, run_id, state, retry_attempt, revision_epoch, escalation_level,
                  last_failure_reason, last_failure_code, last_attempt_timestamp, version,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.phase_id,
                    row.run_id,
                    row.state.as_str(),
                    row.retry_attempt,
                    row.revision_epoch,
                    row.escalation_level,
                    row.last_failure_reason,
                    row.last_failure_code.map(|c| c.as_str()),
                    row.last_attempt_timestamp.map(|t| t.to_rfc3339()),
                    row.version,
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| map_sqlite_err(e, true))?;
        Ok(())
    }

    fn update_if_version(
        &mut self,
        row: &PersistedPhaseRow,
        expected_version: i64,
    ) -> Result<UpdateOutcome, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_sqlite_err(e, true))?;

        let stored: Option<i64> = tx
            .query_row(
                "SELECT version FROM phase_rows WHERE run_id = ?1 AND phase_id = ?2",
                params![row.run_id, row.phase_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| map_sqlite_err(e, true))?;

        if stored != Some(expected_version) {
            return Ok(UpdateOutcome::VersionMismatch { found: stored });
        }

        let changed = tx
            .execute(
                "UPDATE phase_rows
                 SET state = ?1, retry_attempt = ?2, revision_epoch = ?3, escalation_level = ?4,
                     last_failure_reason = ?5, last_failure_code = ?6, last_attempt_timestamp = ?7,
                     updated_at = ?8, version = version + 1
                 WHERE run_id = ?9 AND phase_id = ?10 AND version = ?11",
                params![
                    row.state.as_str(),
                    row.retry_attempt,
                    row.revision_epoch,
                    row.escalation_level,
                    row.last_failure_reason,
                    row.last_failure_code.map(|c| c.as_str()),
                    row.last_attempt_timestamp.map(|t| t.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                    row.run_id,
                    row.phase_id,
                    expected_version,
                ],
            )
            .map_err(|e| map_sqlite_err(e, true))?;

        if changed != 1 {
            return Ok(UpdateOutcome::VersionMismatch { found: stored });
        }

        let updated = Self::select_row(&tx, &row.run_id, &row.phase_id)
            .map_err(|e| map_sqlite_err(e, true))?
            .ok_or_else(|| StoreError::new(StoreErrorKind::NotFound, row.phase_id.clone()))?;
        tx.commit().map_err(|e| map_sqlite_err(e, true))?;

        Ok(UpdateOutcome::Updated(updated))
    }

    fn list_in_state(
        &mut self,
        run_id: Option<&str>,
        state: PhaseStatus,
    ) -> Result<Vec<PersistedPhaseRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM phase_rows
             WHERE state = ?1 AND (?2 IS NULL OR run_id = ?2)
             ORDER BY phase_id",
            ROW_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| map_sqlite_err(e, false))?;
        let rows = stmt
            .query_map(params![state.as_str(), run_id], row_from_sql)
            .map_err(|e| map_sqlite_err(e, false))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_sqlite_err(e, false))?;
        Ok(rows)
    }
}

fn row_from_sql(r: &Row<'_>) -> rusqlite::Result<PersistedPhaseRow> {
    let state: String = r.get(2)?;
    let code: Option<String> = r.get(7)?;
    let last_attempt: Option<String> = r.get(8)?;
    let created_at: String = r.get(10)?;
    let updated_at: String = r.get(11)?;

    Ok(PersistedPhaseRow {
        phase_id: r.get(0)?,
        run_id: r.get(1)?,
        state: state.parse().map_err(|e: String| conversion_err(2, e))?,
        retry_attempt: r.get(3)?,
        revision_epoch: r.get(4)?,
        escalation_level: r.get(5)?,
        last_failure_reason: r.get(6)?,
        last_failure_code: code
            .map(|c| c.parse::<FailureCode>())
            .transpose()
            .map_err(|e| conversion_err(7, e))?,
        last_attempt_timestamp: last_attempt.map(|t| parse_ts(8, &t)).transpose()?,
        version: r.get(9)?,
        created_at: parse_ts(10, &created_at)?,
        updated_at: parse_ts(11, &updated_at)?,
    })
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e.to_string()))
}

fn conversion_err(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Classify a SQLite error by its result code.
///
/// `SQLITE_BUSY` inside a write transaction means another connection holds
/// the write lock, which is a serialization conflict; outside one it is a
/// plain timeout.
pub(crate) fn map_sqlite_err(err: rusqlite::Error, in_write: bool) -> StoreError {
    let kind = match &err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy if in_write => StoreErrorKind::Serialization,
            ErrorCode::DatabaseBusy => StoreErrorKind::Timeout,
            ErrorCode::DatabaseLocked => StoreErrorKind::Deadlock,
            ErrorCode::CannotOpen | ErrorCode::SystemIoFailure | ErrorCode::FileLockingProtocolFailed => {
                StoreErrorKind::ConnectionLost
            }
            ErrorCode::OperationInterrupted => StoreErrorKind::Timeout,
            ErrorCode::ConstraintViolation => StoreErrorKind::Constraint,
            _ => StoreErrorKind::Other,
        },
        rusqlite::Error::QueryReturnedNoRows => StoreErrorKind::NotFound,
        _ => StoreErrorKind::Other,
    };
    StoreError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        )
    }

    #[test]
    fn test_insert_if_absent_is_idempotent() {
        let mut store = SqlitePhaseStore::open_in_memory().unwrap();
        let row = PersistedPhaseRow::new_default("run-1", "p1");
        store.insert_if_absent(&row).unwrap();
        store.insert_if_absent(&row).unwrap();
        let fetched = store.fetch("run-1", "p1").unwrap().unwrap();
        assert_eq!(fetched.version, 0);
        assert_eq!(fetched.state, PhaseStatus::Pending);
    }

    #[test]
    fn test_rows_are_scoped_by_run() {
        let mut store = SqlitePhaseStore::open_in_memory().unwrap();
        let mut first = PersistedPhaseRow::new_default("run-1", "scaffold");
        store.insert_if_absent(&first).unwrap();
        first.state = PhaseStatus::Failed;
        first.retry_attempt = 1;
        store.update_if_version(&first, 0).unwrap();

        let second = PersistedPhaseRow::new_default("run-2", "scaffold");
        store.insert_if_absent(&second).unwrap();
        let fetched = store.fetch("run-2", "scaffold").unwrap().unwrap();
        assert_eq!(fetched.run_id, "run-2");
        assert_eq!(fetched.state, PhaseStatus::Pending);
        assert_eq!(fetched.version, 0);

        // a write to one run leaves the other run's row alone
        let outcome = store.update_if_version(&second, 0).unwrap();
        assert!(matches!(outcome, UpdateOutcome::Updated(_)));
        let first = store.fetch("run-1", "scaffold").unwrap().unwrap();
        assert_eq!(first.state, PhaseStatus::Failed);
        assert_eq!(first.version, 1);
    }

    #[test]
    fn test_fetch_missing_returns_none() {
        let mut store = SqlitePhaseStore::open_in_memory().unwrap();
        assert!(store.fetch("run-1", "nope").unwrap().is_none());
    }

    #[test]
    fn test_update_if_version_increments() {
        let mut store = SqlitePhaseStore::open_in_memory().unwrap();
        let mut row = PersistedPhaseRow::new_default("run-1", "p1");
        store.insert_if_absent(&row).unwrap();

        row.state = PhaseStatus::InProgress;
        row.retry_attempt = 1;
        let outcome = store.update_if_version(&row, 0).unwrap();
        let UpdateOutcome::Updated(updated) = outcome else {
            panic!("expected update");
        };
        assert_eq!(updated.version, 1);
        assert_eq!(updated.state, PhaseStatus::InProgress);
        assert_eq!(updated.retry_attempt, 1);
    }

    #[test]
    fn test_update_with_stale_version_is_rejected() {
        let mut store = SqlitePhaseStore::open_in_memory().unwrap();
        let row = PersistedPhaseRow::new_default("run-1", "p1");
        store.insert_if_absent(&row).unwrap();
        store.update_if_version(&row, 0).unwrap();

        let outcome = store.update_if_version(&row, 0).unwrap();
        assert_eq!(outcome, UpdateOutcome::VersionMismatch { found: Some(1) });
    }

    #[test]
    fn test_update_missing_row_reports_mismatch() {
        let mut store = SqlitePhaseStore::open_in_memory().unwrap();
        let row = PersistedPhaseRow::new_default("run-1", "ghost");
        let outcome = store.update_if_version(&row, 0).unwrap();
        assert_eq!(outcome, UpdateOutcome::VersionMismatch { found: None });
    }

    #[test]
    fn test_failure_code_and_timestamp_roundtrip() {
        let mut store = SqlitePhaseStore::open_in_memory().unwrap();
        let mut row = PersistedPhaseRow::new_default("run-1", "p1");
        store.insert_if_absent(&row).unwrap();
        row.state = PhaseStatus::Failed;
        row.last_failure_reason = Some("patch rejected".into());
        row.last_failure_code = Some(FailureCode::ApplyFailed);
        row.last_attempt_timestamp = Some(Utc::now());
        store.update_if_version(&row, 0).unwrap();

        let fetched = store.fetch("run-1", "p1").unwrap().unwrap();
        assert_eq!(fetched.last_failure_code, Some(FailureCode::ApplyFailed));
        assert_eq!(fetched.last_failure_reason.as_deref(), Some("patch rejected"));
        assert!(fetched.last_attempt_timestamp.is_some());
    }

    #[test]
    fn test_list_in_state_filters_by_run() {
        let mut store = SqlitePhaseStore::open_in_memory().unwrap();
        for (run, phase) in [("run-1", "a"), ("run-1", "b"), ("run-2", "c")] {
            let mut row = PersistedPhaseRow::new_default(run, phase);
            store.insert_if_absent(&row).unwrap();
            row.state = PhaseStatus::InProgress;
            store.update_if_version(&row, 0).unwrap();
        }
        let all = store.list_in_state(None, PhaseStatus::InProgress).unwrap();
        assert_eq!(all.len(), 3);
        let run1 = store
            .list_in_state(Some("run-1"), PhaseStatus::InProgress)
            .unwrap();
        assert_eq!(run1.len(), 2);
        assert!(store.list_in_state(None, PhaseStatus::Completed).unwrap().is_empty());
    }

    #[test]
    fn test_busy_maps_by_transaction_context() {
        assert_eq!(map_sqlite_err(busy(), false).kind, StoreErrorKind::Timeout);
        assert_eq!(map_sqlite_err(busy(), true).kind, StoreErrorKind::Serialization);
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let err = map_sqlite_err(rusqlite::Error::QueryReturnedNoRows, false);
        assert_eq!(err.kind, StoreErrorKind::NotFound);
        assert!(!err.is_transient());
    }
}
