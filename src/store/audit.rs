// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git operation audit rows and change records.

use async_trait::async_trait;
use rusqlite::params;
use tracing::warn;

use crate::error::StoreError;
use crate::git::AuditSink;
use crate::types::{ChangeKind, ChangeRecord, GitOperationRecord, OperationSummary};

use super::{from_ms, label, now_ms, Store};

impl Store {
    pub async fn insert_git_operation(
        &self,
        record: &GitOperationRecord,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO git_operations (operation, ref_id, duration_ms, success, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.operation,
                record.ref_id,
                record.duration_ms as i64,
                record.success,
                record.error,
                now_ms()
            ],
        )?;
        Ok(())
    }

    /// Per-operation counts, failures and mean duration.
    pub async fn audit_summary(&self) -> Result<Vec<OperationSummary>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT operation, COUNT(*), SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END),
                    AVG(duration_ms)
             FROM git_operations GROUP BY operation ORDER BY operation",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OperationSummary {
                operation: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
                failures: row.get::<_, i64>(2)? as u64,
                avg_duration_ms: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn insert_change(
        &self,
        execution_id: &str,
        ref_id: &str,
        kind: ChangeKind,
        commit_hash: Option<&str>,
        detail: Option<&str>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO change_records
                 (execution_id, ref_id, kind, commit_hash, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![execution_id, ref_id, kind.as_str(), commit_hash, detail, now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Change records for one execution, oldest first.
    pub async fn list_changes(&self, execution_id: &str) -> Result<Vec<ChangeRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, ref_id, kind, commit_hash, detail, created_at
             FROM change_records WHERE execution_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([execution_id], |row| {
            Ok(ChangeRecord {
                id: row.get(0)?,
                execution_id: row.get(1)?,
                ref_id: row.get(2)?,
                kind: label::<ChangeKind>(row, 3)?,
                commit_hash: row.get(4)?,
                detail: row.get(5)?,
                created_at: from_ms(row.get(6)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl AuditSink for Store {
    async fn record_git_operation(&self, record: GitOperationRecord) {
        if let Err(e) = self.insert_git_operation(&record).await {
            warn!(operation = %record.operation, "Failed to record git operation: {}", e);
        }
    }
}
