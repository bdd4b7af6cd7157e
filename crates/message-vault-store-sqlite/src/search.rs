//! Full-text index maintenance and its degraded fallback.
//!
//! The search capability is selected once, when the store is opened or the
//! schema initialized: `IndexedSearch` maintains the FTS5 virtual table,
//! `PatternSearch` matches with escaped LIKE patterns when the FTS5 module
//! is unavailable. Index-maintenance calls are no-ops in degraded mode.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::{SqlContext, StoreResult};
use crate::Store;

/// One page of ranked search hits: message surrogate ids plus the total
/// match count across all pages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchPage {
    pub ids: Vec<i64>,
    pub total: i64,
}

pub(crate) trait SearchBackend: Send {
    fn is_indexed(&self) -> bool;
    fn index_message(&self, conn: &Connection, message_id: i64) -> StoreResult<()>;
    fn delete_source(&self, conn: &Connection, source_id: i64) -> StoreResult<()>;
    fn backfill(
        &self,
        conn: &Connection,
        progress: &mut dyn FnMut(i64, i64),
    ) -> StoreResult<i64>;
    fn search_page(
        &self,
        conn: &Connection,
        query: &str,
        offset: i64,
        limit: i64,
    ) -> StoreResult<SearchPage>;
}

pub(crate) fn select_backend(conn: &Connection) -> StoreResult<Box<dyn SearchBackend>> {
    let has_fts: i64 = conn
        .query_row(
            "SELECT EXISTS(
               SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'messages_fts'
             )",
            [],
            |row| row.get(0),
        )
        .op("probe search capability")?;

    if has_fts == 1 {
        Ok(Box::new(IndexedSearch))
    } else {
        Ok(Box::new(PatternSearch))
    }
}

/// Document projection shared by per-row indexing, the batched backfill, and
/// the post-copy rebuild in subset extraction: subject and body joined with
/// the per-type recipient address lists.
pub(crate) const FTS_DOCUMENT_SELECT: &str = "
  SELECT m.id, m.id, COALESCE(m.subject, ''), COALESCE(mb.body_text, ''),
    COALESCE((SELECT GROUP_CONCAT(p.email_address, ' ')
              FROM message_recipients mr JOIN participants p ON p.id = mr.participant_id
              WHERE mr.message_id = m.id AND mr.recipient_type = 'from'), ''),
    COALESCE((SELECT GROUP_CONCAT(p.email_address, ' ')
              FROM message_recipients mr JOIN participants p ON p.id = mr.participant_id
              WHERE mr.message_id = m.id AND mr.recipient_type = 'to'), ''),
    COALESCE((SELECT GROUP_CONCAT(p.email_address, ' ')
              FROM message_recipients mr JOIN participants p ON p.id = mr.participant_id
              WHERE mr.message_id = m.id AND mr.recipient_type = 'cc'), '')
  FROM messages m
  LEFT JOIN message_bodies mb ON mb.message_id = m.id";

pub(crate) const FTS_INSERT_PREFIX: &str = "INSERT OR REPLACE INTO messages_fts \
  (rowid, message_id, subject, body, from_addr, to_addr, cc_addr)";

pub(crate) struct IndexedSearch;

impl IndexedSearch {
    const BACKFILL_BATCH: i64 = 5_000;
}

impl SearchBackend for IndexedSearch {
    fn is_indexed(&self) -> bool {
        true
    }

    fn index_message(&self, conn: &Connection, message_id: i64) -> StoreResult<()> {
        let sql = format!("{FTS_INSERT_PREFIX} {FTS_DOCUMENT_SELECT} WHERE m.id = ?1");
        conn.execute(&sql, params![message_id]).op("index message")?;
        Ok(())
    }

    fn delete_source(&self, conn: &Connection, source_id: i64) -> StoreResult<()> {
        conn.execute(
            "DELETE FROM messages_fts WHERE message_id IN (
               SELECT id FROM messages WHERE source_id = ?1
             )",
            params![source_id],
        )
        .op("delete source index rows")?;
        Ok(())
    }

    /// Rebuild the whole index: clear it, then walk the full message id
    /// range in fixed-size batches. Each batch statement commits on its own,
    /// so an interruption preserves all prior batches' work; a re-run still
    /// restarts from a cleared index. Reports `(ids processed, total ids)`
    /// after every batch. Returns the number of rows indexed.
    fn backfill(
        &self,
        conn: &Connection,
        progress: &mut dyn FnMut(i64, i64),
    ) -> StoreResult<i64> {
        let op = "backfill search index";

        // MIN/MAX are instant B-tree lookups, unlike COUNT(*).
        let (min_id, max_id): (i64, i64) = conn
            .query_row(
                "SELECT COALESCE(MIN(id), 0), COALESCE(MAX(id), 0) FROM messages",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .op(op)?;
        if max_id == 0 {
            return Ok(0);
        }
        let id_range = max_id - min_id + 1;

        conn.execute("DELETE FROM messages_fts", []).op(op)?;

        let batch_sql =
            format!("{FTS_INSERT_PREFIX} {FTS_DOCUMENT_SELECT} WHERE m.id >= ?1 AND m.id < ?2");

        let mut indexed = 0_i64;
        let mut cursor = min_id;
        while cursor <= max_id {
            let batch_end = cursor + Self::BACKFILL_BATCH;
            let rows = conn.execute(&batch_sql, params![cursor, batch_end]).op(op)?;
            indexed += rows as i64;
            cursor = batch_end;

            progress((cursor - min_id).min(id_range), id_range);
        }

        tracing::info!(indexed, "search index backfilled");
        Ok(indexed)
    }

    fn search_page(
        &self,
        conn: &Connection,
        query: &str,
        offset: i64,
        limit: i64,
    ) -> StoreResult<SearchPage> {
        let op = "search messages";

        let page = (|| -> rusqlite::Result<SearchPage> {
            let mut stmt = conn.prepare(
                "SELECT m.id
                 FROM messages_fts fts
                 JOIN messages m ON m.id = fts.rowid
                 WHERE messages_fts MATCH ?1 AND m.deleted_from_source_at IS NULL
                 ORDER BY rank
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![query, limit, offset], |row| row.get::<_, i64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }

            let total: i64 = conn.query_row(
                "SELECT COUNT(*)
                 FROM messages_fts fts
                 JOIN messages m ON m.id = fts.rowid
                 WHERE messages_fts MATCH ?1 AND m.deleted_from_source_at IS NULL",
                params![query],
                |row| row.get(0),
            )?;
            Ok(SearchPage { ids, total })
        })();

        match page {
            Ok(page) => Ok(page),
            Err(err) => {
                // A MATCH syntax error from free-form user input falls back
                // to the literal pattern search rather than surfacing.
                tracing::debug!(error = %err, "FTS query failed; using pattern fallback");
                PatternSearch.search_page(conn, query, offset, limit).map_err(|_| {
                    crate::error::StoreError::from_sqlite(op, err)
                })
            }
        }
    }
}

pub(crate) struct PatternSearch;

impl SearchBackend for PatternSearch {
    fn is_indexed(&self) -> bool {
        false
    }

    fn index_message(&self, _conn: &Connection, _message_id: i64) -> StoreResult<()> {
        Ok(())
    }

    fn delete_source(&self, _conn: &Connection, _source_id: i64) -> StoreResult<()> {
        Ok(())
    }

    fn backfill(
        &self,
        _conn: &Connection,
        _progress: &mut dyn FnMut(i64, i64),
    ) -> StoreResult<i64> {
        Ok(0)
    }

    fn search_page(
        &self,
        conn: &Connection,
        query: &str,
        offset: i64,
        limit: i64,
    ) -> StoreResult<SearchPage> {
        let op = "search messages (pattern)";
        let pattern = format!("%{}%", escape_like(query));

        let total: i64 = conn
            .query_row(
                r"SELECT COUNT(*) FROM messages m
                  WHERE m.deleted_from_source_at IS NULL
                    AND (m.subject LIKE ?1 ESCAPE '\' OR m.snippet LIKE ?1 ESCAPE '\')",
                params![pattern],
                |row| row.get(0),
            )
            .op(op)?;

        let mut stmt = conn
            .prepare(
                r"SELECT m.id FROM messages m
                  WHERE m.deleted_from_source_at IS NULL
                    AND (m.subject LIKE ?1 ESCAPE '\' OR m.snippet LIKE ?1 ESCAPE '\')
                  ORDER BY COALESCE(m.sent_at, m.received_at, m.internal_date) DESC, m.id DESC
                  LIMIT ?2 OFFSET ?3",
            )
            .op(op)?;
        let rows = stmt
            .query_map(params![pattern, limit, offset], |row| row.get::<_, i64>(0))
            .op(op)?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.op(op)?);
        }
        Ok(SearchPage { ids, total })
    }
}

/// Escape LIKE metacharacters so they match literally. `%`, `_` and the
/// escape character itself are prefixed with `\`; the pattern must be used
/// with `ESCAPE '\'`.
pub(crate) fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl Store {
    /// Write one message's subject/body/address fields into the search
    /// index. No-op when search is degraded.
    ///
    /// # Errors
    /// Returns an error when the index write fails.
    pub fn index_message(&mut self, message_id: i64) -> StoreResult<()> {
        self.search.index_message(&self.conn, message_id)
    }

    /// Rebuild the entire search index in batches, reporting
    /// `(ids processed, total ids)` after each batch. Returns the number of
    /// rows indexed; 0 without error when search is degraded.
    ///
    /// # Errors
    /// Returns an error when clearing or a batch insert fails.
    pub fn backfill_fts(
        &mut self,
        progress: Option<&mut dyn FnMut(i64, i64)>,
    ) -> StoreResult<i64> {
        let mut noop = |_done: i64, _total: i64| {};
        self.search.backfill(&self.conn, progress.unwrap_or(&mut noop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::Store;
    use message_vault_core::{MessageInput, MessageKind};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn open_store() -> StoreResult<(tempfile::TempDir, Store)> {
        let dir = tempfile::tempdir()
            .map_err(|err| StoreError::from_io("create temp dir", err))?;
        let mut store = Store::open(&dir.path().join("archive.db"))?;
        store.init_schema()?;
        Ok((dir, store))
    }

    fn seed_message(store: &mut Store, key: &str, subject: &str, body: &str) -> StoreResult<i64> {
        let source = store.get_or_create_source("imap", "ada@example.com")?;
        let conversation = store.ensure_conversation(source.id, "thread", "email_thread", None)?;
        let input = MessageInput {
            conversation_id: conversation,
            source_id: source.id,
            source_message_id: key.to_string(),
            kind: MessageKind::Email,
            sent_at: None,
            received_at: None,
            internal_date: None,
            sender_id: None,
            reply_to_message_id: None,
            is_from_me: false,
            subject: Some(subject.to_string()),
            snippet: Some(subject.to_string()),
            size_estimate: 0,
            has_attachments: false,
            attachment_count: 0,
            body_text: Some(body.to_string()),
            body_html: None,
            raw: None,
            recipients: Vec::new(),
            label_ids: Vec::new(),
        };
        store.persist_message(&input)
    }

    #[test]
    fn escape_like_makes_metacharacters_literal() {
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn backfill_indexes_every_message_and_reports_progress() -> TestResult {
        let (_dir, mut store) = open_store()?;
        for i in 0..25 {
            seed_message(&mut store, &format!("msg-{i}"), &format!("subject {i}"), "body")?;
        }

        let mut reports = Vec::new();
        let mut on_progress = |done: i64, total: i64| reports.push((done, total));
        let indexed = store.backfill_fts(Some(&mut on_progress))?;
        assert_eq!(indexed, 25);
        assert!(!reports.is_empty());
        let (done, total) = reports[reports.len() - 1];
        assert_eq!(done, total);

        let fts_rows: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM messages_fts", [], |row| row.get(0))?;
        assert_eq!(fts_rows, 25);
        Ok(())
    }

    #[test]
    fn indexed_search_finds_body_text() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let id = seed_message(&mut store, "m1", "quarterly report", "the figures are in")?;
        store.index_message(id)?;
        seed_message(&mut store, "m2", "lunch", "sandwiches")?;

        let page = store.search_messages("figures", 0, 10)?;
        assert_eq!(page.total, 1);
        Ok(())
    }

    #[test]
    fn pattern_search_treats_percent_literally() -> TestResult {
        let (_dir, mut store) = open_store()?;
        seed_message(&mut store, "m1", "sale: 100% off", "")?;
        seed_message(&mut store, "m2", "sale: 1000 items", "")?;
        seed_message(&mut store, "m3", "sale: 100 days", "")?;

        let page = PatternSearch.search_page(store.connection(), "100%", 0, 10)?;
        assert_eq!(page.total, 1, "LIKE wildcard must not leak from the query");

        let all = PatternSearch.search_page(store.connection(), "sale", 0, 10)?;
        assert_eq!(all.total, 3);
        Ok(())
    }

    #[test]
    fn pattern_backend_is_a_noop_for_maintenance() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let id = seed_message(&mut store, "m1", "hello", "body")?;

        PatternSearch.index_message(store.connection(), id)?;
        let mut noop = |_d: i64, _t: i64| {};
        assert_eq!(PatternSearch.backfill(store.connection(), &mut noop)?, 0);
        Ok(())
    }

    #[test]
    fn soft_deleted_messages_never_match() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let id = seed_message(&mut store, "m1", "secret plans", "")?;
        store.index_message(id)?;

        let source = store.get_or_create_source("imap", "ada@example.com")?;
        store.soft_delete_message(source.id, "m1")?;

        assert_eq!(store.search_messages("secret", 0, 10)?.total, 0);
        let page = PatternSearch.search_page(store.connection(), "secret", 0, 10)?;
        assert_eq!(page.total, 0);
        Ok(())
    }
}
