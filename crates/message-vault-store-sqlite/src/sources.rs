//! Source (account) operations: natural-key get-or-create, listing, sync
//! cursor maintenance, per-source reset, and full removal.

use message_vault_core::Source;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{SqlContext, StoreError, StoreResult};
use crate::{now_rfc3339, parse_rfc3339, parse_rfc3339_opt, Store};

const SOURCE_COLUMNS: &str = "id, source_type, identifier, display_name, \
                              last_sync_at, sync_cursor, created_at, updated_at";

fn scan_source(row: &Row<'_>) -> rusqlite::Result<(Source, Option<String>, String, String)> {
    let source = Source {
        id: row.get("id")?,
        source_type: row.get("source_type")?,
        identifier: row.get("identifier")?,
        display_name: row.get("display_name")?,
        last_sync_at: None,
        sync_cursor: row.get("sync_cursor")?,
        created_at: time::OffsetDateTime::UNIX_EPOCH,
        updated_at: time::OffsetDateTime::UNIX_EPOCH,
    };
    let last_sync_at: Option<String> = row.get("last_sync_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok((source, last_sync_at, created_at, updated_at))
}

fn finish_source(
    (mut source, last_sync_at, created_at, updated_at): (Source, Option<String>, String, String),
) -> StoreResult<Source> {
    source.last_sync_at = parse_rfc3339_opt(last_sync_at)?;
    source.created_at = parse_rfc3339(&created_at)?;
    source.updated_at = parse_rfc3339(&updated_at)?;
    Ok(source)
}

/// Progress reported while a per-source reset deletes data in batches.
#[derive(Debug, Clone, Default)]
pub struct ResetProgress {
    pub phase: &'static str,
    pub total_messages: i64,
    pub deleted_messages: i64,
    pub current_table: &'static str,
}

impl Store {
    /// Get or create a source by its `(source_type, identifier)` natural
    /// key. The surrogate id is stable across repeated calls; a concurrent
    /// race on an unseen key is resolved by the unique constraint plus the
    /// insert-or-ignore-then-select pattern.
    ///
    /// # Errors
    /// Returns an error when the lookup or insert fails.
    pub fn get_or_create_source(
        &mut self,
        source_type: &str,
        identifier: &str,
    ) -> StoreResult<Source> {
        let op = "get or create source";
        let now = now_rfc3339()?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO sources (source_type, identifier, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![source_type, identifier, now],
            )
            .op(op)?;

        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE source_type = ?1 AND identifier = ?2"
        );
        let scanned = self
            .conn
            .query_row(&sql, params![source_type, identifier], scan_source)
            .op(op)?;
        finish_source(scanned)
    }

    /// List sources, optionally filtered by source type, ordered by
    /// identifier.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn list_sources(&self, source_type: Option<&str>) -> StoreResult<Vec<Source>> {
        let op = "list sources";
        let sql = match source_type {
            Some(_) => format!(
                "SELECT {SOURCE_COLUMNS} FROM sources WHERE source_type = ?1 ORDER BY identifier"
            ),
            None => format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY identifier"),
        };

        let mut stmt = self.conn.prepare(&sql).op(op)?;
        let mut rows = match source_type {
            Some(kind) => stmt.query(params![kind]).op(op)?,
            None => stmt.query([]).op(op)?,
        };

        let mut sources = Vec::new();
        while let Some(row) = rows.next().op(op)? {
            sources.push(finish_source(scan_source(row).op(op)?)?);
        }
        Ok(sources)
    }

    /// Look up a source by identifier alone; `None` when absent.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn source_by_identifier(&self, identifier: &str) -> StoreResult<Option<Source>> {
        let op = "get source by identifier";
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE identifier = ?1");
        let scanned = self
            .conn
            .query_row(&sql, params![identifier], scan_source)
            .optional()
            .op(op)?;
        scanned.map(finish_source).transpose()
    }

    /// Record the ingestion cursor after a successful sync.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn update_source_sync_cursor(&mut self, source_id: i64, cursor: &str) -> StoreResult<()> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "UPDATE sources
                 SET sync_cursor = ?1, last_sync_at = ?2, updated_at = ?2
                 WHERE id = ?3",
                params![cursor, now, source_id],
            )
            .op("update sync cursor")?;
        Ok(())
    }

    /// Delete a source and everything it owns. The schema cascades through
    /// conversations, messages, labels and sync state; the full-text index
    /// has no cascade support, so its rows are cleared explicitly first.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the source does not exist, or
    /// another error when a delete fails.
    pub fn remove_source(&mut self, source_id: i64) -> StoreResult<()> {
        let op = "remove source";
        let tx = self.conn.transaction().op(op)?;

        self.search.delete_source(&tx, source_id)?;

        let deleted = tx
            .execute("DELETE FROM sources WHERE id = ?1", params![source_id])
            .op(op)?;
        if deleted == 0 {
            return Err(StoreError::not_found("source", source_id.to_string()));
        }

        tx.commit().op(op)?;
        tracing::info!(source_id, "source removed");
        Ok(())
    }

    /// Delete all of one source's synced data while keeping the source row
    /// itself, so a clean re-sync can start from nothing. Children are
    /// deleted before parents in batches with foreign keys off for speed;
    /// user labels (NULL source) and other sources are untouched. Returns
    /// the number of messages deleted.
    ///
    /// # Errors
    /// Returns an error when any delete or pragma fails.
    pub fn reset_source_data(
        &mut self,
        source_id: i64,
        mut progress: Option<&mut dyn FnMut(ResetProgress)>,
    ) -> StoreResult<i64> {
        let op = "reset source data";
        const BATCH_SIZE: i64 = 5_000;

        let total_messages: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE source_id = ?1",
                params![source_id],
                |row| row.get(0),
            )
            .op(op)?;

        if let Some(report) = progress.as_deref_mut() {
            report(ResetProgress { phase: "counting", total_messages, ..ResetProgress::default() });
        }

        // FK enforcement off so child rows can be dropped in bulk without
        // per-row parent checks. Restored before returning.
        self.conn.execute_batch("PRAGMA foreign_keys = OFF;").op(op)?;
        let result = self.reset_source_tables(source_id, total_messages, BATCH_SIZE, &mut progress);
        self.conn.execute_batch("PRAGMA foreign_keys = ON;").op(op)?;
        result
    }

    fn reset_source_tables(
        &mut self,
        source_id: i64,
        total_messages: i64,
        batch_size: i64,
        progress: &mut Option<&mut dyn FnMut(ResetProgress)>,
    ) -> StoreResult<i64> {
        let op = "reset source data";

        // Child tables of messages, rowid-batched so every statement finds
        // live rows to delete.
        let child_tables: [(&'static str, &'static str); 6] = [
            ("message_bodies", "message_id"),
            ("message_raw", "message_id"),
            ("message_recipients", "message_id"),
            ("message_labels", "message_id"),
            ("attachments", "message_id"),
            ("reactions", "message_id"),
        ];

        let mut deleted_messages = 0_i64;

        for (table, fk_column) in child_tables {
            let sql = format!(
                "DELETE FROM {table} WHERE rowid IN (
                   SELECT {table}.rowid FROM {table}
                   JOIN messages ON messages.id = {table}.{fk_column}
                   WHERE messages.source_id = ?1
                   LIMIT ?2
                 )"
            );
            loop {
                let rows = self.conn.execute(&sql, params![source_id, batch_size]).op(op)?;
                if rows == 0 {
                    break;
                }
                if let Some(report) = progress.as_deref_mut() {
                    report(ResetProgress {
                        phase: "deleting",
                        total_messages,
                        deleted_messages,
                        current_table: table,
                    });
                }
            }
        }

        loop {
            let rows = self
                .conn
                .execute(
                    "DELETE FROM messages WHERE id IN (
                       SELECT id FROM messages WHERE source_id = ?1 LIMIT ?2
                     )",
                    params![source_id, batch_size],
                )
                .op(op)?;
            if rows == 0 {
                break;
            }
            deleted_messages += rows as i64;
            if let Some(report) = progress.as_deref_mut() {
                report(ResetProgress {
                    phase: "deleting",
                    total_messages,
                    deleted_messages,
                    current_table: "messages",
                });
            }
        }

        self.conn
            .execute(
                "DELETE FROM conversation_participants WHERE conversation_id IN (
                   SELECT id FROM conversations WHERE source_id = ?1
                 )",
                params![source_id],
            )
            .op(op)?;
        self.conn
            .execute("DELETE FROM conversations WHERE source_id = ?1", params![source_id])
            .op(op)?;

        // Owned labels only; user labels have NULL source_id and survive.
        self.conn
            .execute("DELETE FROM labels WHERE source_id = ?1", params![source_id])
            .op(op)?;

        self.conn
            .execute("DELETE FROM sync_checkpoints WHERE source_id = ?1", params![source_id])
            .op(op)?;
        self.conn
            .execute("DELETE FROM sync_runs WHERE source_id = ?1", params![source_id])
            .op(op)?;

        let now = now_rfc3339()?;
        self.conn
            .execute(
                "UPDATE sources
                 SET sync_cursor = NULL, last_sync_at = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now, source_id],
            )
            .op(op)?;

        if let Some(report) = progress.as_deref_mut() {
            report(ResetProgress {
                phase: "complete",
                total_messages,
                deleted_messages,
                current_table: "",
            });
        }

        tracing::info!(source_id, deleted_messages, "source data reset");
        Ok(deleted_messages)
    }
}
