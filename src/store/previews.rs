// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Preview rows and the port reservation table.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::types::{PortAllocation, PreviewProcess, PreviewStatus, RefType};

use super::{from_ms, label, now_ms, opt_from_ms, Store};

const PREVIEW_COLUMNS: &str = "id, execution_id, ref_type, ref_id, status, port, pid, command, \
     urls, restart_attempts, error, last_health_check, created_at, updated_at";

fn row_to_preview(row: &Row<'_>) -> rusqlite::Result<PreviewProcess> {
    let urls: String = row.get(8)?;
    Ok(PreviewProcess {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        ref_type: label::<RefType>(row, 2)?,
        ref_id: row.get(3)?,
        status: label::<PreviewStatus>(row, 4)?,
        port: row.get(5)?,
        pid: row.get(6)?,
        command: row.get(7)?,
        urls: serde_json::from_str(&urls).unwrap_or_default(),
        restart_attempts: row.get(9)?,
        error: row.get(10)?,
        last_health_check: opt_from_ms(row.get(11)?),
        created_at: from_ms(row.get(12)?),
        updated_at: from_ms(row.get(13)?),
    })
}

fn update_one(
    conn: &Connection,
    id: &str,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<(), StoreError> {
    if conn.execute(sql, params)? == 0 {
        return Err(StoreError::PreviewNotFound(id.to_string()));
    }
    Ok(())
}

impl Store {
    /// Insert a preview in `installing`.
    pub async fn insert_preview(
        &self,
        id: &str,
        execution_id: &str,
        ref_type: RefType,
        ref_id: &str,
    ) -> Result<PreviewProcess, StoreError> {
        {
            let conn = self.conn.lock().await;
            let now = now_ms();
            conn.execute(
                "INSERT INTO preview_processes
                 (id, execution_id, ref_type, ref_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    id,
                    execution_id,
                    ref_type.as_str(),
                    ref_id,
                    PreviewStatus::Installing.as_str(),
                    now
                ],
            )?;
        }
        self.get_preview(id).await
    }

    pub async fn find_preview(&self, id: &str) -> Result<Option<PreviewProcess>, StoreError> {
        let conn = self.conn.lock().await;
        let preview = conn
            .query_row(
                &format!("SELECT {} FROM preview_processes WHERE id = ?1", PREVIEW_COLUMNS),
                [id],
                row_to_preview,
            )
            .optional()?;
        Ok(preview)
    }

    pub async fn get_preview(&self, id: &str) -> Result<PreviewProcess, StoreError> {
        self.find_preview(id)
            .await?
            .ok_or_else(|| StoreError::PreviewNotFound(id.to_string()))
    }

    /// Set status and, when given, the error text.
    pub async fn update_preview_status(
        &self,
        id: &str,
        status: PreviewStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_one(
            &conn,
            id,
            "UPDATE preview_processes SET status = ?2, error = COALESCE(?3, error), updated_at = ?4
             WHERE id = ?1",
            &[&id, &status.as_str(), &error, &now_ms()],
        )
    }

    pub async fn set_preview_pid(&self, id: &str, pid: Option<u32>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_one(
            &conn,
            id,
            "UPDATE preview_processes SET pid = ?2, updated_at = ?3 WHERE id = ?1",
            &[&id, &pid, &now_ms()],
        )
    }

    pub async fn set_preview_port(&self, id: &str, port: Option<u16>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_one(
            &conn,
            id,
            "UPDATE preview_processes SET port = ?2, updated_at = ?3 WHERE id = ?1",
            &[&id, &port, &now_ms()],
        )
    }

    pub async fn set_preview_command(&self, id: &str, command: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_one(
            &conn,
            id,
            "UPDATE preview_processes SET command = ?2, updated_at = ?3 WHERE id = ?1",
            &[&id, &command, &now_ms()],
        )
    }

    pub async fn set_preview_urls(&self, id: &str, urls: &[String]) -> Result<(), StoreError> {
        let json = serde_json::to_string(urls)?;
        let conn = self.conn.lock().await;
        update_one(
            &conn,
            id,
            "UPDATE preview_processes SET urls = ?2, updated_at = ?3 WHERE id = ?1",
            &[&id, &json, &now_ms()],
        )
    }

    pub async fn set_preview_restart_attempts(
        &self,
        id: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        update_one(
            &conn,
            id,
            "UPDATE preview_processes SET restart_attempts = ?2, updated_at = ?3 WHERE id = ?1",
            &[&id, &attempts, &now_ms()],
        )
    }

    pub async fn touch_preview_health(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let now = now_ms();
        update_one(
            &conn,
            id,
            "UPDATE preview_processes SET last_health_check = ?2, updated_at = ?2 WHERE id = ?1",
            &[&id, &now],
        )
    }

    /// The newest non-terminal preview for `(execution, ref_type, ref_id)`.
    pub async fn find_active_preview(
        &self,
        execution_id: &str,
        ref_type: RefType,
        ref_id: &str,
    ) -> Result<Option<PreviewProcess>, StoreError> {
        let conn = self.conn.lock().await;
        let preview = conn
            .query_row(
                &format!(
                    "SELECT {} FROM preview_processes
                     WHERE execution_id = ?1 AND ref_type = ?2 AND ref_id = ?3
                       AND status IN (?4, ?5, ?6)
                     ORDER BY created_at DESC LIMIT 1",
                    PREVIEW_COLUMNS
                ),
                params![
                    execution_id,
                    ref_type.as_str(),
                    ref_id,
                    PreviewStatus::Installing.as_str(),
                    PreviewStatus::Starting.as_str(),
                    PreviewStatus::Running.as_str()
                ],
                row_to_preview,
            )
            .optional()?;
        Ok(preview)
    }

    /// All previews, or only those of one execution.
    pub async fn list_previews(
        &self,
        execution_id: Option<&str>,
    ) -> Result<Vec<PreviewProcess>, StoreError> {
        let conn = self.conn.lock().await;
        let rows = match execution_id {
            Some(id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM preview_processes WHERE execution_id = ?1 ORDER BY created_at",
                    PREVIEW_COLUMNS
                ))?;
                let rows = stmt.query_map([id], row_to_preview)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM preview_processes ORDER BY created_at",
                    PREVIEW_COLUMNS
                ))?;
                let rows = stmt.query_map([], row_to_preview)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    pub async fn list_previews_by_status(
        &self,
        statuses: &[PreviewStatus],
    ) -> Result<Vec<PreviewProcess>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().await;
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM preview_processes WHERE status IN ({}) ORDER BY created_at",
            PREVIEW_COLUMNS, placeholders
        ))?;
        let rows = stmt.query_map(
            params_from_iter(statuses.iter().map(|s| s.as_str())),
            row_to_preview,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ========================================================================
    // Port reservations
    // ========================================================================

    /// Reserve `port` for a preview. Returns false if it is already taken.
    pub async fn reserve_port(&self, port: u16, preview_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO port_allocations (port, preview_id, allocated_at)
             VALUES (?1, ?2, ?3)",
            params![port, preview_id, now_ms()],
        )?;
        Ok(inserted == 1)
    }

    /// Release a reservation. Releasing an unreserved port is a no-op.
    pub async fn release_port(&self, port: u16) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM port_allocations WHERE port = ?1", [port])?;
        Ok(())
    }

    /// Release every port held by a preview; returns how many were released.
    pub async fn release_ports_for(&self, preview_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        Ok(conn.execute(
            "DELETE FROM port_allocations WHERE preview_id = ?1",
            [preview_id],
        )?)
    }

    pub async fn port_owner(&self, port: u16) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        let owner = conn
            .query_row(
                "SELECT preview_id FROM port_allocations WHERE port = ?1",
                [port],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    pub async fn list_port_allocations(&self) -> Result<Vec<PortAllocation>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT port, preview_id, allocated_at FROM port_allocations ORDER BY port",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PortAllocation {
                port: row.get(0)?,
                preview_id: row.get(1)?,
                allocated_at: from_ms(row.get(2)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_preview_row_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let preview = store
            .insert_preview("P1", "E1", RefType::Mutate, "app")
            .await
            .unwrap();
        assert_eq!(preview.status, PreviewStatus::Installing);
        assert!(preview.urls.is_empty());

        store.set_preview_port("P1", Some(4321)).await.unwrap();
        store.set_preview_pid("P1", Some(99)).await.unwrap();
        store
            .set_preview_urls("P1", &["http://localhost:4321".to_string()])
            .await
            .unwrap();
        store.set_preview_command("P1", "npm run dev").await.unwrap();
        store.set_preview_restart_attempts("P1", 1).await.unwrap();
        store.touch_preview_health("P1").await.unwrap();
        store
            .update_preview_status("P1", PreviewStatus::Running, None)
            .await
            .unwrap();

        let preview = store.get_preview("P1").await.unwrap();
        assert_eq!(preview.port, Some(4321));
        assert_eq!(preview.pid, Some(99));
        assert_eq!(preview.urls, vec!["http://localhost:4321"]);
        assert_eq!(preview.command.as_deref(), Some("npm run dev"));
        assert_eq!(preview.restart_attempts, 1);
        assert!(preview.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_find_active_preview_ignores_terminal() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_preview("P1", "E1", RefType::Mutate, "app")
            .await
            .unwrap();
        let active = store
            .find_active_preview("E1", RefType::Mutate, "app")
            .await
            .unwrap();
        assert_eq!(active.map(|p| p.id).as_deref(), Some("P1"));

        store
            .update_preview_status("P1", PreviewStatus::Failed, Some("crashed"))
            .await
            .unwrap();
        assert!(store
            .find_active_preview("E1", RefType::Mutate, "app")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_active_preview("E1", RefType::Create, "app")
            .await
            .unwrap()
            .is_none());

        let failed = store
            .list_previews_by_status(&[PreviewStatus::Failed])
            .await
            .unwrap();
        assert_eq!(failed[0].error.as_deref(), Some("crashed"));
        assert_eq!(store.list_previews(Some("E1")).await.unwrap().len(), 1);
        assert!(store.list_previews(Some("E2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_preview_update() {
        let store = Store::open_in_memory().unwrap();
        let err = store.set_preview_pid("nope", None).await.unwrap_err();
        assert!(matches!(err, StoreError::PreviewNotFound(_)));
    }

    #[tokio::test]
    async fn test_port_reservations() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.reserve_port(4100, "P1").await.unwrap());
        assert!(!store.reserve_port(4100, "P2").await.unwrap());
        assert!(store.reserve_port(4101, "P1").await.unwrap());
        assert_eq!(store.port_owner(4100).await.unwrap().as_deref(), Some("P1"));

        store.release_port(4100).await.unwrap();
        store.release_port(4100).await.unwrap();
        assert!(store.port_owner(4100).await.unwrap().is_none());

        assert_eq!(store.release_ports_for("P1").await.unwrap(), 1);
        assert!(store.list_port_allocations().await.unwrap().is_empty());
    }
}
