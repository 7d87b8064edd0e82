// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Append-only log lines for executions and previews.

use rusqlite::{params, Connection};

use crate::error::StoreError;
use crate::types::{LogRecord, LogStream};

use super::{from_ms, label, now_ms, Store};

/// Which log table a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogTable {
    Execution,
    Preview,
}

impl LogTable {
    fn name(self) -> &'static str {
        match self {
            Self::Execution => "execution_logs",
            Self::Preview => "preview_logs",
        }
    }
}

fn append(
    conn: &Connection,
    table: LogTable,
    owner_id: &str,
    stream: LogStream,
    content: &str,
) -> Result<i64, StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO {} (owner_id, stream, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            table.name()
        ),
        params![owner_id, stream.as_str(), content, now_ms()],
    )?;
    Ok(conn.last_insert_rowid())
}

fn list(
    conn: &Connection,
    table: LogTable,
    owner_id: &str,
    after_id: Option<i64>,
    limit: usize,
) -> Result<Vec<LogRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, owner_id, stream, content, created_at FROM {}
         WHERE owner_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
        table.name()
    ))?;
    let rows = stmt.query_map(
        params![owner_id, after_id.unwrap_or(0), limit as i64],
        |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                stream: label::<LogStream>(row, 2)?,
                content: row.get(3)?,
                created_at: from_ms(row.get(4)?),
            })
        },
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

impl Store {
    /// Append a line to an execution's log and return its row id.
    pub async fn append_execution_log(
        &self,
        execution_id: &str,
        stream: LogStream,
        content: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        append(&conn, LogTable::Execution, execution_id, stream, content)
    }

    /// Lines with id greater than `after_id`, oldest first.
    pub async fn list_execution_logs(
        &self,
        execution_id: &str,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let conn = self.conn.lock().await;
        list(&conn, LogTable::Execution, execution_id, after_id, limit)
    }

    pub async fn append_preview_log(
        &self,
        preview_id: &str,
        stream: LogStream,
        content: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        append(&conn, LogTable::Preview, preview_id, stream, content)
    }

    pub async fn list_preview_logs(
        &self,
        preview_id: &str,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let conn = self.conn.lock().await;
        list(&conn, LogTable::Preview, preview_id, after_id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execution_log_paging() {
        let store = Store::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                store
                    .append_execution_log("E1", LogStream::Stdout, &format!("line {}", i))
                    .await
                    .unwrap(),
            );
        }
        store
            .append_execution_log("E2", LogStream::Stderr, "other")
            .await
            .unwrap();

        let first = store.list_execution_logs("E1", None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].content, "line 0");

        let rest = store
            .list_execution_logs("E1", Some(first[1].id), 100)
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest.last().unwrap().id, *ids.last().unwrap());
    }

    #[tokio::test]
    async fn test_preview_logs_are_separate() {
        let store = Store::open_in_memory().unwrap();
        store
            .append_preview_log("P1", LogStream::System, "port 4100 reserved")
            .await
            .unwrap();
        assert!(store
            .list_execution_logs("P1", None, 10)
            .await
            .unwrap()
            .is_empty());
        let logs = store.list_preview_logs("P1", None, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].stream, LogStream::System);
    }
}
