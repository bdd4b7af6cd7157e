//! Append-only sync-run log: one running run per source at a time,
//! checkpoints for resumption, completion and failure records.

use message_vault_core::{SyncCheckpoint, SyncRun, SyncStatus};
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{SqlContext, StoreError, StoreResult};
use crate::{now_rfc3339, parse_rfc3339, parse_rfc3339_opt, Store};

const SYNC_RUN_COLUMNS: &str = "id, source_id, started_at, completed_at, status, \
                                messages_processed, messages_added, messages_updated, \
                                errors_count, error_message, cursor_before, cursor_after";

fn scan_sync_run(row: &Row<'_>) -> rusqlite::Result<(SyncRun, String, Option<String>, String)> {
    let run = SyncRun {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        started_at: time::OffsetDateTime::UNIX_EPOCH,
        completed_at: None,
        status: SyncStatus::Running,
        messages_processed: row.get("messages_processed")?,
        messages_added: row.get("messages_added")?,
        messages_updated: row.get("messages_updated")?,
        errors_count: row.get("errors_count")?,
        error_message: row.get("error_message")?,
        cursor_before: row.get("cursor_before")?,
        cursor_after: row.get("cursor_after")?,
    };
    let started_at: String = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let status: String = row.get("status")?;
    Ok((run, started_at, completed_at, status))
}

fn finish_sync_run(
    (mut run, started_at, completed_at, status): (SyncRun, String, Option<String>, String),
) -> StoreResult<SyncRun> {
    run.started_at = parse_rfc3339(&started_at)?;
    run.completed_at = parse_rfc3339_opt(completed_at)?;
    run.status = SyncStatus::parse(&status)
        .ok_or_else(|| StoreError::Encoding(format!("unknown sync status: {status}")))?;
    Ok(run)
}

impl Store {
    /// Start a new sync run for a source, superseding any run still marked
    /// running (it is failed with an explanatory message). Returns the new
    /// run's id.
    ///
    /// # Errors
    /// Returns an error when the supersede update or the insert fails.
    pub fn start_sync(&mut self, source_id: i64) -> StoreResult<i64> {
        let op = "start sync";
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().op(op)?;

        tx.execute(
            "UPDATE sync_runs
             SET status = 'failed',
                 error_message = 'superseded by new sync',
                 completed_at = ?1
             WHERE source_id = ?2 AND status = 'running'",
            params![now, source_id],
        )
        .op(op)?;

        tx.execute(
            "INSERT INTO sync_runs (source_id, started_at, status)
             VALUES (?1, ?2, 'running')",
            params![source_id, now],
        )
        .op(op)?;
        let run_id = tx.last_insert_rowid();

        tx.commit().op(op)?;
        Ok(run_id)
    }

    /// Save mid-run progress for resumption: counters on the run row plus an
    /// append-only checkpoint record.
    ///
    /// # Errors
    /// Returns an error when either write fails.
    pub fn update_sync_checkpoint(
        &mut self,
        run_id: i64,
        checkpoint: &SyncCheckpoint,
    ) -> StoreResult<()> {
        let op = "update sync checkpoint";
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().op(op)?;

        let updated = tx
            .execute(
                "UPDATE sync_runs
                 SET cursor_before = ?1,
                     messages_processed = ?2,
                     messages_added = ?3,
                     messages_updated = ?4,
                     errors_count = ?5
                 WHERE id = ?6",
                params![
                    checkpoint.page_token,
                    checkpoint.messages_processed,
                    checkpoint.messages_added,
                    checkpoint.messages_updated,
                    checkpoint.errors_count,
                    run_id,
                ],
            )
            .op(op)?;
        if updated == 0 {
            return Err(StoreError::not_found("sync run", run_id.to_string()));
        }

        tx.execute(
            "INSERT INTO sync_checkpoints
               (source_id, sync_run_id, page_token, messages_processed, created_at)
             SELECT source_id, id, ?1, ?2, ?3 FROM sync_runs WHERE id = ?4",
            params![checkpoint.page_token, checkpoint.messages_processed, now, run_id],
        )
        .op(op)?;

        tx.commit().op(op)?;
        Ok(())
    }

    /// Mark a run completed, recording the final cursor.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn complete_sync(&mut self, run_id: i64, cursor_after: &str) -> StoreResult<()> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "UPDATE sync_runs
                 SET status = 'completed', completed_at = ?1, cursor_after = ?2
                 WHERE id = ?3",
                params![now, cursor_after, run_id],
            )
            .op("complete sync")?;
        Ok(())
    }

    /// Mark a run failed with an error message.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn fail_sync(&mut self, run_id: i64, error_message: &str) -> StoreResult<()> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "UPDATE sync_runs
                 SET status = 'failed', completed_at = ?1, error_message = ?2
                 WHERE id = ?3",
                params![now, error_message, run_id],
            )
            .op("fail sync")?;
        Ok(())
    }

    /// The currently running run for a source, if any.
    ///
    /// # Errors
    /// Returns an error when the query fails or the row cannot be decoded.
    pub fn active_sync(&self, source_id: i64) -> StoreResult<Option<SyncRun>> {
        let sql = format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs
             WHERE source_id = ?1 AND status = 'running'
             ORDER BY started_at DESC
             LIMIT 1"
        );
        let scanned = self
            .conn
            .query_row(&sql, params![source_id], scan_sync_run)
            .optional()
            .op("get active sync")?;
        scanned.map(finish_sync_run).transpose()
    }

    /// The most recent successfully completed run for a source, if any.
    ///
    /// # Errors
    /// Returns an error when the query fails or the row cannot be decoded.
    pub fn last_successful_sync(&self, source_id: i64) -> StoreResult<Option<SyncRun>> {
        let sql = format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs
             WHERE source_id = ?1 AND status = 'completed'
             ORDER BY completed_at DESC
             LIMIT 1"
        );
        let scanned = self
            .conn
            .query_row(&sql, params![source_id], scan_sync_run)
            .optional()
            .op("get last successful sync")?;
        scanned.map(finish_sync_run).transpose()
    }
}
