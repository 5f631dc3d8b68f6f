// src/db.rs

//! Optional build-log database.
//!
//! When configured, banquet records one row per build and keeps a per-package
//! status. The scheduler consults it for throttling (last success time) and
//! for skipping promotion of known-bad dependencies. Everything degrades
//! gracefully when no database is configured.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;

/// One row appended to the run log after a build completes
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub pkgbase: String,
    /// Outcome kind name (`successful`, `staged`, `skipped`, `failed`)
    pub outcome: String,
    pub nv_version: Option<String>,
    pub pkg_version: Option<String>,
    pub elapsed: f64,
    pub cpu_secs: Option<f64>,
    pub peak_mem_bytes: Option<i64>,
    /// Build reasons serialized as JSON
    pub reasons: String,
    pub message: Option<String>,
}

/// Interface the scheduler uses; each call is a fresh short-lived session
pub trait BuildLogDb: Send + Sync {
    /// Whether the most recent recorded run of this package failed
    fn is_last_build_failed(&self, pkgbase: &str) -> Result<bool>;

    /// Time of the most recent successful (or staged) build
    fn last_success_at(&self, pkgbase: &str) -> Result<Option<DateTime<Utc>>>;

    /// Update the package's transient status (`building`, `done`)
    fn mark_status(&self, pkgbase: &str, status: &str) -> Result<()>;

    /// Append one run-log row
    fn append_run(&self, record: &RunRecord) -> Result<()>;
}

/// SQLite-backed implementation
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pkg_status (
                 pkgbase    TEXT PRIMARY KEY,
                 status     TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS build_runs (
                 id             INTEGER PRIMARY KEY AUTOINCREMENT,
                 pkgbase        TEXT NOT NULL,
                 outcome        TEXT NOT NULL,
                 nv_version     TEXT,
                 pkg_version    TEXT,
                 elapsed        REAL NOT NULL,
                 cpu_secs       REAL,
                 peak_mem_bytes INTEGER,
                 reasons        TEXT NOT NULL,
                 message        TEXT,
                 created_at     TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_build_runs_pkgbase
                 ON build_runs (pkgbase, id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&conn)
    }
}

impl BuildLogDb for SqliteDb {
    fn is_last_build_failed(&self, pkgbase: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let outcome: Option<String> = conn
                .query_row(
                    "SELECT outcome FROM build_runs WHERE pkgbase = ?1
                     ORDER BY id DESC LIMIT 1",
                    [pkgbase],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(outcome.as_deref() == Some("failed"))
        })
    }

    fn last_success_at(&self, pkgbase: &str) -> Result<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let stamp: Option<String> = conn
                .query_row(
                    "SELECT created_at FROM build_runs
                     WHERE pkgbase = ?1 AND outcome IN ('successful', 'staged')
                     ORDER BY id DESC LIMIT 1",
                    [pkgbase],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(stamp
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)))
        })
    }

    fn mark_status(&self, pkgbase: &str, status: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pkg_status (pkgbase, status, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (pkgbase) DO UPDATE SET
                     status = excluded.status,
                     updated_at = excluded.updated_at",
                params![pkgbase, status, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn append_run(&self, record: &RunRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO build_runs (pkgbase, outcome, nv_version, pkg_version,
                     elapsed, cpu_secs, peak_mem_bytes, reasons, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.pkgbase,
                    record.outcome,
                    record.nv_version,
                    record.pkg_version,
                    record.elapsed,
                    record.cpu_secs,
                    record.peak_mem_bytes,
                    record.reasons,
                    record.message,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }
}
