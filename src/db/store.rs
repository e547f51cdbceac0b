//! SQLite database store implementation.

use crate::model::{CheckPoint, ErrRange, ErrType, Key, KeptResult, Report, Severity};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Persistent history of check results, errors, checkpoints and reports.
///
/// Timestamps are stored as unix nanoseconds so that a record can be found
/// again by the exact start time of its check.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))
            .map_err(|e| DbError::Migration(format!("Pragma failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Results ---

    /// Persist one check result. Writing the same record twice is a no-op.
    pub fn keep_result(&self, key: &Key, started: DateTime<Utc>, result: &KeptResult) -> Result<(), DbError> {
        let headers = serde_json::to_string(&result.headers)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO results (stream_key, started, uri, tid, master, group_name, stream_name,
             err_type, http_code, http_status, content_length, real_content_length, headers, body, elapsed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                key.to_hex(),
                to_nanos(started),
                result.uri,
                result.tid,
                result.master,
                result.group,
                result.name,
                result.err_type.code(),
                result.http_code,
                result.http_status,
                result.content_length,
                result.real_content_length,
                headers,
                result.body,
                result.elapsed.as_nanos() as i64,
            ],
        )?;
        Ok(())
    }

    /// Results of a stream in `[from, to]`, ordered by start time.
    pub fn load_results(&self, key: &Key, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<KeptResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT tid, uri, group_name, stream_name, master, err_type, http_code, http_status,
             content_length, real_content_length, headers, body, started, elapsed
             FROM results WHERE stream_key = ?1 AND started >= ?2 AND started <= ?3
             ORDER BY started ASC, master DESC",
        )?;

        let results = stmt
            .query_map(params![key.to_hex(), to_nanos(from), to_nanos(to)], |row| kept_from_row(*key, row))?
            .collect::<SqlResult<Vec<_>>>()?;

        if results.is_empty() {
            return Err(DbError::NotFound);
        }
        Ok(results)
    }

    /// Delete results started before `now - retention`.
    pub fn remove_expired_results(&self, retention: Duration) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM results WHERE started < ?1", params![cutoff(retention)])?)
    }

    // --- Errors ---

    pub fn keep_error(&self, key: &Key, started: DateTime<Utc>, err: ErrType) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO errors (stream_key, started, err_type) VALUES (?1, ?2, ?3)",
            params![key.to_hex(), to_nanos(started), err.code()],
        )?;
        Ok(())
    }

    /// Errors of a stream in `[from, to]` keyed by check start time.
    pub fn load_errors(
        &self,
        key: &Key,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeMap<DateTime<Utc>, ErrType>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT started, err_type FROM errors WHERE stream_key = ?1 AND started >= ?2 AND started <= ?3",
        )?;

        let errors = stmt
            .query_map(params![key.to_hex(), to_nanos(from), to_nanos(to)], |row| {
                Ok((from_nanos(row.get(0)?), ErrType::from_code(row.get(1)?)))
            })?
            .collect::<SqlResult<BTreeMap<_, _>>>()?;

        if errors.is_empty() {
            return Err(DbError::NotFound);
        }
        Ok(errors)
    }

    pub fn remove_expired_errors(&self, retention: Duration) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM errors WHERE started < ?1", params![cutoff(retention)])?)
    }

    // --- Checkpoints ---

    pub fn save_checkpoint(&self, key: &Key, checkpoint: &CheckPoint) -> Result<(), DbError> {
        let opened = checkpoint
            .opened_range
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO checkpoints (stream_key, tid, occured, opened_range) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(stream_key) DO UPDATE SET
             tid=excluded.tid, occured=excluded.occured, opened_range=excluded.opened_range",
            params![key.to_hex(), checkpoint.tid, to_nanos(checkpoint.occured), opened],
        )?;
        Ok(())
    }

    pub fn load_checkpoint(&self, key: &Key) -> Result<Option<CheckPoint>, DbError> {
        let conn = self.conn()?;
        let row: Option<(i64, i64, Option<String>)> = conn
            .query_row(
                "SELECT tid, occured, opened_range FROM checkpoints WHERE stream_key = ?1",
                params![key.to_hex()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((tid, occured, opened)) = row else {
            return Ok(None);
        };
        let opened_range = opened.map(|s| serde_json::from_str::<ErrRange>(&s)).transpose()?;
        Ok(Some(CheckPoint {
            tid,
            occured: from_nanos(occured),
            opened_range,
        }))
    }

    // --- Reports ---

    /// Store a report unless an equivalent one exists. Returns true if stored.
    pub fn save_report(&self, report: &Report) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO reports (stream_key, group_name, stream_name, title, body, err_type,
             severity, from_tid, to_tid, occured, discontinued, ongoing, generated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                report.stream_key.to_hex(),
                report.group,
                report.stream_name,
                report.title,
                report.body,
                report.error.code(),
                report.severity.as_str(),
                report.range.from_tid,
                report.range.to_tid,
                to_nanos(report.range.occured),
                to_nanos(report.range.discontinued),
                report.ongoing,
                to_nanos(report.generated),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// All reports, newest first.
    pub fn load_reports(&self) -> Result<Vec<Report>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT stream_key, group_name, stream_name, title, body, err_type, severity, from_tid, to_tid,
             occured, discontinued, ongoing, generated FROM reports ORDER BY generated DESC, id DESC",
        )?;

        let reports = stmt
            .query_map([], |row| {
                let key: String = row.get(0)?;
                let err = ErrType::from_code(row.get(5)?);
                let severity: String = row.get(6)?;
                Ok(Report {
                    stream_key: Key::from_hex(&key).unwrap_or_default(),
                    group: row.get(1)?,
                    stream_name: row.get(2)?,
                    title: row.get(3)?,
                    body: row.get(4)?,
                    error: err,
                    severity: Severity::from_str_lossy(&severity),
                    range: ErrRange {
                        from_tid: row.get(7)?,
                        to_tid: row.get(8)?,
                        occured: from_nanos(row.get(9)?),
                        discontinued: from_nanos(row.get(10)?),
                        err,
                    },
                    ongoing: row.get(11)?,
                    generated: from_nanos(row.get(12)?),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(reports)
    }
}

fn kept_from_row(key: Key, row: &Row<'_>) -> SqlResult<KeptResult> {
    let headers: String = row.get(10)?;
    let elapsed: i64 = row.get(13)?;
    Ok(KeptResult {
        tid: row.get(0)?,
        stream_key: key,
        uri: row.get(1)?,
        group: row.get(2)?,
        name: row.get(3)?,
        master: row.get(4)?,
        err_type: ErrType::from_code(row.get(5)?),
        http_code: row.get(6)?,
        http_status: row.get(7)?,
        content_length: row.get(8)?,
        real_content_length: row.get(9)?,
        headers: serde_json::from_str(&headers).unwrap_or_default(),
        body: row.get(11)?,
        started: from_nanos(row.get(12)?),
        elapsed: Duration::from_nanos(elapsed.max(0) as u64),
    })
}

fn to_nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn from_nanos(ns: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_nanos(ns)
}

fn cutoff(retention: Duration) -> i64 {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(retention)
        .map(to_nanos)
        .unwrap_or(i64::MIN)
}
