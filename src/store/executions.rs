// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Execution rows and permission grants.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::types::{
    AgentKind, CompletionMetrics, Execution, ExecutionStatus, Permission, PermissionGrant,
};

use super::{from_ms, label, now_ms, opt_from_ms, Store};

const EXECUTION_COLUMNS: &str = "id, agent_kind, status, phase, prompt, working_dir, session_id, \
     pid, exit_code, error, message_count, turn_count, cost_usd, duration_ms, heartbeat_at, \
     created_at, finished_at, run_started_at";

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        id: row.get(0)?,
        agent_kind: label::<AgentKind>(row, 1)?,
        status: label::<ExecutionStatus>(row, 2)?,
        phase: row.get(3)?,
        prompt: row.get(4)?,
        working_dir: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
        session_id: row.get(6)?,
        pid: row.get(7)?,
        exit_code: row.get(8)?,
        error: row.get(9)?,
        message_count: row.get::<_, i64>(10)? as u64,
        turn_count: row.get(11)?,
        cost_usd: row.get(12)?,
        duration_ms: row.get::<_, Option<i64>>(13)?.map(|v| v as u64),
        heartbeat_at: opt_from_ms(row.get(14)?),
        created_at: from_ms(row.get(15)?),
        finished_at: opt_from_ms(row.get(16)?),
        run_started_at: opt_from_ms(row.get(17)?),
    })
}

/// Run an UPDATE against one execution, failing if the row is missing.
fn update_one(
    conn: &Connection,
    id: &str,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<(), StoreError> {
    let changed = conn.execute(sql, params)?;
    if changed == 0 {
        return Err(StoreError::ExecutionNotFound(id.to_string()));
    }
    Ok(())
}

impl Store {
    /// Insert a new execution in `starting`.
    pub async fn create_execution(
        &self,
        id: &str,
        agent_kind: AgentKind,
        prompt: &str,
    ) -> Result<Execution, StoreError> {
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO executions (id, agent_kind, status, phase, prompt, created_at)
                 VALUES (?1, ?2, ?3, 'created', ?4, ?5)",
                params![
                    id,
                    agent_kind.as_str(),
                    ExecutionStatus::Starting.as_str(),
                    prompt,
                    now_ms()
                ],
            )?;
        }
        self.get_execution(id).await
    }

    pub async fn find_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        let conn = self.conn.lock().await;
        let execution = conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                [id],
                row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    pub async fn get_execution(&self, id: &str) -> Result<Execution, StoreError> {
        self.find_execution(id)
            .await?
            .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))
    }

    /// Executions in any of `statuses` (all when empty), newest first.
    pub async fn list_executions(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, StoreError> {
        let conn = self.conn.lock().await;
        let mut sql = format!("SELECT {} FROM executions", EXECUTION_COLUMNS);
        if !statuses.is_empty() {
            let placeholders = vec!["?"; statuses.len()].join(", ");
            sql.push_str(&format!(" WHERE status IN ({})", placeholders));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(statuses.iter().map(|s| s.as_str())),
            row_to_execution,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Number of executions that are starting or running.
    pub async fn count_active_executions(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE status IN (?1, ?2)",
            params![
                ExecutionStatus::Starting.as_str(),
                ExecutionStatus::Running.as_str()
            ],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Set status (and error). Terminal statuses stamp `finished_at`.
    pub async fn update_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let finished = status.is_terminal().then(now_ms);
        // Every transition into running restarts the clock the stuck sweep reads.
        let run_started = (status == ExecutionStatus::Running).then(now_ms);
        update_one(
            &conn,
            id,
            "UPDATE executions
             SET status = ?2, error = COALESCE(?3, error), finished_at = COALESCE(?4, finished_at),
                 run_started_at = CASE
                     WHEN ?5 IS NULL THEN run_started_at
                     WHEN status = ?2 THEN COALESCE(run_started_at, ?5)
                     ELSE ?5
                 END
             WHERE id = ?1",
            &[&id, &status.as_str(), &error, &finished, &run_started],
        )
    }

    pub async fn update_execution_phase(&self, id: &str, phase: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_one(&conn, id, "UPDATE executions SET phase = ?2 WHERE id = ?1", &[&id, &phase])
    }

    pub async fn set_working_dir(&self, id: &str, dir: &Path) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let dir = dir.to_string_lossy().to_string();
        update_one(&conn, id, "UPDATE executions SET working_dir = ?2 WHERE id = ?1", &[&id, &dir])
    }

    pub async fn set_session_id(&self, id: &str, session_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_one(
            &conn,
            id,
            "UPDATE executions SET session_id = ?2 WHERE id = ?1",
            &[&id, &session_id],
        )
    }

    pub async fn set_pid(&self, id: &str, pid: Option<u32>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_one(&conn, id, "UPDATE executions SET pid = ?2 WHERE id = ?1", &[&id, &pid])
    }

    pub async fn set_exit_code(&self, id: &str, exit_code: Option<i32>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_one(
            &conn,
            id,
            "UPDATE executions SET exit_code = ?2, pid = NULL WHERE id = ?1",
            &[&id, &exit_code],
        )
    }

    /// Record liveness and the number of messages seen so far.
    pub async fn record_heartbeat(&self, id: &str, message_count: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let count = message_count as i64;
        update_one(
            &conn,
            id,
            "UPDATE executions SET heartbeat_at = ?2, message_count = ?3 WHERE id = ?1",
            &[&id, &now_ms(), &count],
        )
    }

    pub async fn record_completion(
        &self,
        id: &str,
        metrics: &CompletionMetrics,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let duration = metrics.duration_ms.map(|d| d as i64);
        update_one(
            &conn,
            id,
            "UPDATE executions SET turn_count = ?2, cost_usd = ?3, duration_ms = ?4 WHERE id = ?1",
            &[&id, &metrics.turn_count, &metrics.cost_usd, &duration],
        )
    }

    /// Running executions created before `cutoff`.
    pub async fn running_since_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM executions
             WHERE status = ?1 AND COALESCE(run_started_at, created_at) < ?2",
            EXECUTION_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![ExecutionStatus::Running.as_str(), cutoff.timestamp_millis()],
            row_to_execution,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ========================================================================
    // Permission grants
    // ========================================================================

    /// Record grants; duplicates of an existing triple are ignored.
    pub async fn insert_grants(
        &self,
        execution_id: &str,
        grants: &[(String, Permission)],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO permission_grants (execution_id, ref_id, permission)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (ref_id, permission) in grants {
                stmt.execute(params![execution_id, ref_id, permission.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn list_grants(
        &self,
        execution_id: &str,
    ) -> Result<Vec<PermissionGrant>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT execution_id, ref_id, permission FROM permission_grants
             WHERE execution_id = ?1 ORDER BY permission, ref_id",
        )?;
        let rows = stmt.query_map([execution_id], |row| {
            Ok(PermissionGrant {
                execution_id: row.get(0)?,
                ref_id: row.get(1)?,
                permission: label::<Permission>(row, 2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
