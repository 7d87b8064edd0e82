// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-backed persistent store.
//!
//! A single connection sits behind a `tokio::sync::Mutex`; statements are
//! short and never held across an await on anything else. Timestamps are
//! stored as Unix milliseconds.

mod audit;
mod executions;
mod logs;
mod previews;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::types::ParseLabelError;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 2;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        agent_kind TEXT NOT NULL,
        status TEXT NOT NULL,
        phase TEXT NOT NULL DEFAULT '',
        prompt TEXT NOT NULL,
        working_dir TEXT,
        session_id TEXT,
        pid INTEGER,
        exit_code INTEGER,
        error TEXT,
        message_count INTEGER NOT NULL DEFAULT 0,
        turn_count INTEGER,
        cost_usd REAL,
        duration_ms INTEGER,
        heartbeat_at INTEGER,
        created_at INTEGER NOT NULL,
        run_started_at INTEGER,
        finished_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS permission_grants (
        execution_id TEXT NOT NULL,
        ref_id TEXT NOT NULL,
        permission TEXT NOT NULL,
        UNIQUE (execution_id, ref_id, permission),
        FOREIGN KEY (execution_id) REFERENCES executions(id)
    );

    CREATE TABLE IF NOT EXISTS execution_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        stream TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS preview_processes (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        ref_type TEXT NOT NULL,
        ref_id TEXT NOT NULL,
        status TEXT NOT NULL,
        port INTEGER,
        pid INTEGER,
        command TEXT,
        urls TEXT NOT NULL DEFAULT '[]',
        restart_attempts INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        last_health_check INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS preview_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        stream TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS port_allocations (
        port INTEGER PRIMARY KEY,
        preview_id TEXT NOT NULL,
        allocated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS git_operations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        operation TEXT NOT NULL,
        ref_id TEXT,
        duration_ms INTEGER NOT NULL,
        success INTEGER NOT NULL,
        error TEXT,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS change_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL,
        ref_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        commit_hash TEXT,
        detail TEXT,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
    CREATE INDEX IF NOT EXISTS idx_execution_logs_owner ON execution_logs(owner_id, id);
    CREATE INDEX IF NOT EXISTS idx_preview_logs_owner ON preview_logs(owner_id, id);
    CREATE INDEX IF NOT EXISTS idx_previews_execution
        ON preview_processes(execution_id, ref_type, ref_id);
    CREATE INDEX IF NOT EXISTS idx_git_operations_op ON git_operations(operation);
    CREATE INDEX IF NOT EXISTS idx_change_records_execution ON change_records(execution_id);
"#;

/// Handle to the engine database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;
        Self::init_schema(&conn)?;
        debug!("Opened store at {:?}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(db_path.to_path_buf()),
        })
    }

    /// A private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(SCHEMA)?;

        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;
        match current {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    [SCHEMA_VERSION],
                )?;
            }
            Some(version) if version < SCHEMA_VERSION => {
                Self::migrate(conn, version)?;
                conn.execute("UPDATE schema_version SET version = ?1", [SCHEMA_VERSION])?;
                debug!("Migrated store schema from v{} to v{}", version, SCHEMA_VERSION);
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn migrate(conn: &Connection, from: u32) -> Result<(), StoreError> {
        if from < 2 {
            // v2: the stuck-execution sweep measures from the latest move into running.
            conn.execute_batch(
                "ALTER TABLE executions ADD COLUMN run_started_at INTEGER;
                 UPDATE executions SET run_started_at = created_at WHERE status = 'running';",
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// Row helpers
// ============================================================================

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

/// Read a TEXT column holding an enum label.
pub(crate) fn label<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseLabelError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: ParseLabelError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
