//! Subset extraction: a new, self-contained archive holding the N most
//! recently active, non-deleted messages and the complete transitive
//! closure of everything they reference, with zero dangling references.
//!
//! The copy attaches the source database and runs `INSERT ... SELECT` in
//! dependency order inside one transaction, so every foreign key already
//! resolves when its row lands. Validation runs against the destination
//! alone, after the source is detached. Any failure removes every artifact
//! this call created.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::{is_missing_fts5, is_missing_table, SqlContext, StoreError, StoreResult};
use crate::search::{FTS_DOCUMENT_SELECT, FTS_INSERT_PREFIX};
use crate::Store;

/// File name of the archive database inside a subset destination directory.
pub const SUBSET_DB_FILE: &str = "message_vault.db";

/// Summary of one subset copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CopyResult {
    pub messages: i64,
    pub conversations: i64,
    pub participants: i64,
    pub labels: i64,
    pub sources: i64,
    pub db_size: i64,
    pub elapsed_ms: u64,
}

/// Copy the `row_count` most recently active, non-deleted messages (and the
/// transitive closure of everything they reference) from the archive at
/// `src_db_path` into a fresh database under `dst_dir`.
///
/// Eligible messages are ranked by best-available timestamp (`sent_at`,
/// else `received_at`, else `internal_date`) descending, ties broken by
/// surrogate id descending. Reply-parent references pointing outside the
/// copied set are nulled; the child message is kept. Conversation
/// aggregates are recomputed from the copied rows and the full-text index
/// rebuilt over them.
///
/// # Errors
/// Returns a configuration error for a non-positive `row_count`, an already
/// populated destination, or a source path containing control characters;
/// an IO error when the source is missing; and a storage error when any
/// copy or validation step fails. On failure no destination artifact is
/// left behind: the database file and its durability sidecars are removed,
/// and the destination directory too when this call created it.
pub fn copy_subset(
    src_db_path: &Path,
    dst_dir: &Path,
    row_count: i64,
) -> StoreResult<CopyResult> {
    if row_count <= 0 {
        return Err(StoreError::config(format!(
            "row count must be positive, got {row_count}"
        )));
    }

    let dst_db_path = dst_dir.join(SUBSET_DB_FILE);
    if dst_db_path.exists() {
        return Err(StoreError::config(format!(
            "destination database already exists: {}",
            dst_db_path.display()
        )));
    }

    // Remember whether the directory is ours so cleanup only removes what
    // this call made.
    let created_dir = !dst_dir.exists();
    fs::create_dir_all(dst_dir)
        .map_err(|err| StoreError::from_io("create destination directory", err))?;

    let started = Instant::now();
    match copy_into(src_db_path, &dst_db_path, row_count) {
        Ok(mut result) => {
            if let Ok(meta) = fs::metadata(&dst_db_path) {
                result.db_size = i64::try_from(meta.len()).unwrap_or(i64::MAX);
            }
            result.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            tracing::info!(
                messages = result.messages,
                sources = result.sources,
                elapsed_ms = result.elapsed_ms,
                "subset copied"
            );
            Ok(result)
        }
        Err(err) => {
            remove_artifacts(dst_dir, &dst_db_path, created_dir);
            Err(err)
        }
    }
}

fn remove_artifacts(dst_dir: &Path, dst_db_path: &Path, created_dir: bool) {
    if created_dir {
        let _ = fs::remove_dir_all(dst_dir);
    } else {
        let _ = fs::remove_file(dst_db_path);
        for sidecar in ["-wal", "-shm"] {
            let mut path = dst_db_path.as_os_str().to_os_string();
            path.push(sidecar);
            let _ = fs::remove_file(PathBuf::from(path));
        }
    }
}

fn copy_into(src_db_path: &Path, dst_db_path: &Path, row_count: i64) -> StoreResult<CopyResult> {
    // Phase 1: create the destination with the ordinary schema manager.
    {
        let mut store = Store::open(dst_db_path)?;
        store.init_schema()?;
    }

    // Validate the source path before attaching, so ATTACH cannot silently
    // create an empty file for a bad path.
    let src_db_path = fs::canonicalize(src_db_path)
        .map_err(|err| StoreError::from_io("locate source database", err))?;
    let src_text = src_db_path.to_string_lossy().into_owned();
    for ch in src_text.chars() {
        if ch < '\u{20}' || ch == '\u{7f}' {
            return Err(StoreError::config(format!(
                "source database path contains control character (U+{:04X})",
                ch as u32
            )));
        }
    }

    // Phase 2: bulk copy with foreign keys off; every key resolves by
    // construction, and the final check proves it.
    let mut conn = Connection::open(dst_db_path).op("reopen destination")?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = OFF;",
    )
    .op("configure destination pragmas")?;

    let escaped = src_text.replace('\'', "''");
    conn.execute_batch(&format!("ATTACH DATABASE '{escaped}' AS src"))
        .op("attach source database")?;

    let copied = {
        let tx = conn.transaction().op("begin copy transaction")?;
        let result = copy_data(&tx, row_count)?;
        tx.commit().op("commit copy transaction")?;
        result
    };

    // Detach before validation so the foreign-key check scans the
    // destination alone; pre-existing problems in the source must not be
    // misreported as failures of this copy.
    conn.execute_batch("DETACH DATABASE src").op("detach source database")?;

    verify_foreign_keys(&conn)?;
    repair_conversation_aggregates(&conn)?;
    rebuild_fts(&conn);

    Ok(copied)
}

/// `INSERT ... SELECT` in dependency order, scoped to the selected
/// messages. Explicit column lists keep a schema-column reorder from
/// silently corrupting the copy.
fn copy_data(tx: &Connection, row_count: i64) -> StoreResult<CopyResult> {
    let mut result = CopyResult::default();

    tx.execute(
        "CREATE TEMP TABLE selected_messages AS
         SELECT id FROM src.messages
         WHERE deleted_from_source_at IS NULL
         ORDER BY COALESCE(sent_at, received_at, internal_date) DESC, id DESC
         LIMIT ?1",
        params![row_count],
    )
    .op("select messages")?;

    result.messages = tx
        .query_row("SELECT COUNT(*) FROM selected_messages", [], |row| row.get(0))
        .op("count selected messages")?;

    result.sources = tx
        .execute(
            "INSERT INTO main.sources
               (id, source_type, identifier, display_name, last_sync_at, sync_cursor,
                created_at, updated_at)
             SELECT id, source_type, identifier, display_name, last_sync_at, sync_cursor,
                    created_at, updated_at
             FROM src.sources
             WHERE id IN (
               SELECT DISTINCT source_id FROM src.messages
               WHERE id IN (SELECT id FROM selected_messages)
             )",
            [],
        )
        .op("copy sources")? as i64;

    result.conversations = tx
        .execute(
            "INSERT INTO main.conversations
               (id, source_id, source_conversation_id, conversation_type, title,
                message_count, participant_count, last_message_at, created_at, updated_at)
             SELECT id, source_id, source_conversation_id, conversation_type, title,
                    message_count, participant_count, last_message_at, created_at, updated_at
             FROM src.conversations
             WHERE id IN (
               SELECT DISTINCT conversation_id FROM src.messages
               WHERE id IN (SELECT id FROM selected_messages)
             )",
            [],
        )
        .op("copy conversations")? as i64;

    // Participants are referenced through three independent join paths —
    // sender, recipient links, and reactions — all three must be unioned.
    result.participants = tx
        .execute(
            "INSERT INTO main.participants
               (id, email_address, phone_number, display_name, domain, created_at, updated_at)
             SELECT id, email_address, phone_number, display_name, domain, created_at, updated_at
             FROM src.participants
             WHERE id IN (
               SELECT sender_id FROM src.messages
               WHERE id IN (SELECT id FROM selected_messages) AND sender_id IS NOT NULL
               UNION
               SELECT participant_id FROM src.message_recipients
               WHERE message_id IN (SELECT id FROM selected_messages)
               UNION
               SELECT participant_id FROM src.reactions
               WHERE message_id IN (SELECT id FROM selected_messages)
             )",
            [],
        )
        .op("copy participants")? as i64;

    tx.execute(
        "INSERT INTO main.participant_identifiers
           (id, participant_id, identifier_type, identifier_value, created_at)
         SELECT id, participant_id, identifier_type, identifier_value, created_at
         FROM src.participant_identifiers
         WHERE participant_id IN (SELECT id FROM main.participants)",
        [],
    )
    .op("copy participant identifiers")?;

    tx.execute(
        "INSERT INTO main.conversation_participants (conversation_id, participant_id)
         SELECT conversation_id, participant_id
         FROM src.conversation_participants
         WHERE conversation_id IN (SELECT id FROM main.conversations)
           AND participant_id IN (SELECT id FROM main.participants)",
        [],
    )
    .op("copy conversation participants")?;

    tx.execute(
        "INSERT INTO main.messages
           (id, conversation_id, source_id, source_message_id, message_type,
            sent_at, received_at, internal_date, sender_id, reply_to_message_id,
            is_from_me, subject, snippet, size_estimate, has_attachments,
            attachment_count, deleted_from_source_at, archived_at)
         SELECT id, conversation_id, source_id, source_message_id, message_type,
                sent_at, received_at, internal_date, sender_id, reply_to_message_id,
                is_from_me, subject, snippet, size_estimate, has_attachments,
                attachment_count, deleted_from_source_at, archived_at
         FROM src.messages
         WHERE id IN (SELECT id FROM selected_messages)",
        [],
    )
    .op("copy messages")?;

    // A reply-parent outside the copied set is nulled; the child keeps its
    // own content and is never dropped for its parent's absence.
    tx.execute(
        "UPDATE main.messages SET reply_to_message_id = NULL
         WHERE reply_to_message_id IS NOT NULL
           AND reply_to_message_id NOT IN (SELECT id FROM selected_messages)",
        [],
    )
    .op("prune reply parents")?;

    tx.execute(
        "INSERT INTO main.message_bodies (message_id, body_text, body_html)
         SELECT message_id, body_text, body_html
         FROM src.message_bodies
         WHERE message_id IN (SELECT id FROM selected_messages)",
        [],
    )
    .op("copy message bodies")?;

    tx.execute(
        "INSERT INTO main.message_raw (message_id, raw_data, raw_format, compression)
         SELECT message_id, raw_data, raw_format, compression
         FROM src.message_raw
         WHERE message_id IN (SELECT id FROM selected_messages)",
        [],
    )
    .op("copy raw payloads")?;

    tx.execute(
        "INSERT INTO main.message_recipients
           (id, message_id, participant_id, recipient_type, display_name)
         SELECT id, message_id, participant_id, recipient_type, display_name
         FROM src.message_recipients
         WHERE message_id IN (SELECT id FROM selected_messages)",
        [],
    )
    .op("copy recipients")?;

    tx.execute(
        "INSERT INTO main.reactions
           (id, message_id, participant_id, reaction_type, reaction_value, created_at)
         SELECT id, message_id, participant_id, reaction_type, reaction_value, created_at
         FROM src.reactions
         WHERE message_id IN (SELECT id FROM selected_messages)",
        [],
    )
    .op("copy reactions")?;

    tx.execute(
        "INSERT INTO main.attachments
           (id, message_id, filename, mime_type, storage_path, content_hash, size, created_at)
         SELECT id, message_id, filename, mime_type, storage_path, content_hash, size, created_at
         FROM src.attachments
         WHERE message_id IN (SELECT id FROM selected_messages)",
        [],
    )
    .op("copy attachments")?;

    // Labels owned by a copied source, plus labels referenced by a selected
    // message's link. The second arm preserves user labels whose source_id
    // is NULL.
    result.labels = tx
        .execute(
            "INSERT INTO main.labels (id, source_id, source_label_id, name, label_type)
             SELECT id, source_id, source_label_id, name, label_type
             FROM src.labels
             WHERE source_id IN (SELECT id FROM main.sources)
                OR id IN (
                  SELECT label_id FROM src.message_labels
                  WHERE message_id IN (SELECT id FROM selected_messages)
                )",
            [],
        )
        .op("copy labels")? as i64;

    tx.execute(
        "INSERT INTO main.message_labels (message_id, label_id)
         SELECT message_id, label_id
         FROM src.message_labels
         WHERE message_id IN (SELECT id FROM selected_messages)
           AND label_id IN (SELECT id FROM main.labels)",
        [],
    )
    .op("copy message labels")?;

    tx.execute("DROP TABLE IF EXISTS selected_messages", []).op("drop selection table")?;

    Ok(result)
}

/// `PRAGMA foreign_key_check` over the destination; any row is a violation
/// and fails the copy.
fn verify_foreign_keys(conn: &Connection) -> StoreResult<()> {
    let op = "verify foreign keys";
    conn.execute_batch("PRAGMA foreign_keys = ON").op(op)?;

    let mut stmt = conn.prepare("PRAGMA foreign_key_check").op(op)?;
    let rows = stmt
        .query_map([], |row| {
            let table: String = row.get(0)?;
            let rowid: i64 = row.get(1)?;
            let parent: String = row.get(2)?;
            Ok(format!("{table}(rowid={rowid}) -> {parent}"))
        })
        .op(op)?;

    let mut violations = Vec::new();
    for row in rows {
        violations.push(row.op(op)?);
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Constraint {
            op,
            message: format!("foreign key violations: {}", violations.join("; ")),
        })
    }
}

/// Recompute the denormalized conversation aggregates from the copied rows,
/// with the same timestamp fallback the selection uses.
fn repair_conversation_aggregates(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "UPDATE conversations SET
           message_count = (
             SELECT COUNT(*) FROM messages
             WHERE conversation_id = conversations.id
               AND deleted_from_source_at IS NULL
           ),
           participant_count = (
             SELECT COUNT(*) FROM conversation_participants
             WHERE conversation_id = conversations.id
           ),
           last_message_at = (
             SELECT MAX(COALESCE(sent_at, received_at, internal_date)) FROM messages
             WHERE conversation_id = conversations.id
               AND deleted_from_source_at IS NULL
           )",
        [],
    )
    .op("repair conversation aggregates")?;
    Ok(())
}

/// Rebuild the full-text index over the copied rows. Tolerates a
/// destination without FTS5 (degraded search); other failures are logged
/// and leave the archive searchable via the pattern fallback.
fn rebuild_fts(conn: &Connection) {
    let sql = format!("{FTS_INSERT_PREFIX} {FTS_DOCUMENT_SELECT}");
    if let Err(err) = conn.execute(&sql, []) {
        if !is_missing_table(&err) && !is_missing_fts5(&err) {
            tracing::warn!(error = %err, "subset FTS rebuild failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_vault_core::{
        Address, LabelKind, MessageInput, MessageKind, RecipientInput, RecipientType,
    };
    use time::OffsetDateTime;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn message(
        source_id: i64,
        conversation_id: i64,
        key: &str,
        sent_unix: Option<i64>,
    ) -> MessageInput {
        MessageInput {
            conversation_id,
            source_id,
            source_message_id: key.to_string(),
            kind: MessageKind::Email,
            sent_at: sent_unix.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            received_at: None,
            internal_date: None,
            sender_id: None,
            reply_to_message_id: None,
            is_from_me: false,
            subject: Some(format!("subject {key}")),
            snippet: None,
            size_estimate: 0,
            has_attachments: false,
            attachment_count: 0,
            body_text: Some(format!("body of {key}")),
            body_html: None,
            raw: None,
            recipients: Vec::new(),
            label_ids: Vec::new(),
        }
    }

    fn dest_conn(dst_dir: &Path) -> rusqlite::Result<Connection> {
        Connection::open(dst_dir.join(SUBSET_DB_FILE))
    }

    fn count(conn: &Connection, sql: &str) -> rusqlite::Result<i64> {
        conn.query_row(sql, [], |row| row.get(0))
    }

    #[test]
    fn copies_exactly_the_requested_budget() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join("src.db");
        let mut store = Store::open(&src_path)?;
        store.init_schema()?;

        let source = store.get_or_create_source("imap", "a@example.com")?;
        let conversation = store.ensure_conversation(source.id, "t1", "email_thread", None)?;
        for i in 0..8_i64 {
            store.persist_message(&message(
                source.id,
                conversation,
                &format!("m{i}"),
                Some(1_000 + i),
            ))?;
        }
        drop(store);

        let dst = dir.path().join("subset");
        let result = copy_subset(&src_path, &dst, 3)?;
        assert_eq!(result.messages, 3);
        assert_eq!(result.sources, 1);
        assert!(result.db_size > 0);

        let conn = dest_conn(&dst)?;
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM messages")?, 3);

        // The three most recent by sent_at.
        let oldest: String = conn.query_row(
            "SELECT source_message_id FROM messages ORDER BY sent_at ASC LIMIT 1",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(oldest, "m5");
        Ok(())
    }

    #[test]
    fn copies_everything_when_budget_exceeds_archive() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join("src.db");
        let mut store = Store::open(&src_path)?;
        store.init_schema()?;
        let source = store.get_or_create_source("imap", "a@example.com")?;
        let conversation = store.ensure_conversation(source.id, "t1", "email_thread", None)?;
        for i in 0..4_i64 {
            store.persist_message(&message(source.id, conversation, &format!("m{i}"), Some(i)))?;
        }
        drop(store);

        let dst = dir.path().join("subset");
        let result = copy_subset(&src_path, &dst, 100)?;
        assert_eq!(result.messages, 4);
        Ok(())
    }

    #[test]
    fn ties_prefer_higher_surrogate_ids() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join("src.db");
        let mut store = Store::open(&src_path)?;
        store.init_schema()?;
        let source = store.get_or_create_source("imap", "a@example.com")?;
        let conversation = store.ensure_conversation(source.id, "t1", "email_thread", None)?;
        for i in 0..5_i64 {
            // Identical sent_at for the whole group.
            store.persist_message(&message(source.id, conversation, &format!("m{i}"), Some(7_000)))?;
        }
        drop(store);

        let dst = dir.path().join("subset");
        copy_subset(&src_path, &dst, 2)?;

        let conn = dest_conn(&dst)?;
        let mut stmt = conn.prepare("SELECT source_message_id FROM messages ORDER BY id")?;
        let keys: Vec<String> =
            stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<_>>()?;
        // More recently ingested (higher id) wins the tie.
        assert_eq!(keys, vec!["m3".to_string(), "m4".to_string()]);
        Ok(())
    }

    #[test]
    fn ranks_by_fallback_timestamp_when_sent_at_is_missing() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join("src.db");
        let mut store = Store::open(&src_path)?;
        store.init_schema()?;
        let source = store.get_or_create_source("imap", "a@example.com")?;
        let conversation = store.ensure_conversation(source.id, "t1", "email_thread", None)?;

        let mut oldest = message(source.id, conversation, "oldest", Some(1_000));
        oldest.sent_at = OffsetDateTime::from_unix_timestamp(1_000).ok();
        store.persist_message(&oldest)?;

        // No sent_at; internal_date makes it the most recent.
        let mut fallback = message(source.id, conversation, "fallback", None);
        fallback.internal_date = OffsetDateTime::from_unix_timestamp(9_000).ok();
        store.persist_message(&fallback)?;

        let mut middle = message(source.id, conversation, "middle", Some(5_000));
        middle.sent_at = OffsetDateTime::from_unix_timestamp(5_000).ok();
        store.persist_message(&middle)?;
        drop(store);

        let dst = dir.path().join("subset");
        copy_subset(&src_path, &dst, 2)?;

        let conn = dest_conn(&dst)?;
        let keys: Vec<String> = conn
            .prepare("SELECT source_message_id FROM messages ORDER BY id")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        assert!(keys.contains(&"fallback".to_string()));
        assert!(keys.contains(&"middle".to_string()));

        // The conversation's last activity comes from the fallback column.
        let last: String = conn.query_row(
            "SELECT last_message_at FROM conversations LIMIT 1",
            [],
            |row| row.get(0),
        )?;
        assert!(last.starts_with("1970-01-01T02:30"));
        Ok(())
    }

    #[test]
    fn excluded_reply_parent_is_nulled_not_dropped() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join("src.db");
        let mut store = Store::open(&src_path)?;
        store.init_schema()?;
        let source = store.get_or_create_source("imap", "a@example.com")?;
        let conversation = store.ensure_conversation(source.id, "t1", "email_thread", None)?;

        let parent_id =
            store.persist_message(&message(source.id, conversation, "parent", Some(1_000)))?;
        let mut child = message(source.id, conversation, "child", Some(2_000));
        child.reply_to_message_id = Some(parent_id);
        store.persist_message(&child)?;
        drop(store);

        // Budget of one keeps only the child; its parent pointer must be
        // nulled, not the row dropped.
        let dst = dir.path().join("subset");
        let result = copy_subset(&src_path, &dst, 1)?;
        assert_eq!(result.messages, 1);

        let conn = dest_conn(&dst)?;
        let (key, reply_to): (String, Option<i64>) = conn.query_row(
            "SELECT source_message_id, reply_to_message_id FROM messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(key, "child");
        assert_eq!(reply_to, None);

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM pragma_foreign_key_check")?, 0);
        Ok(())
    }

    #[test]
    fn closure_spans_reactions_and_user_labels() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join("src.db");
        let mut store = Store::open(&src_path)?;
        store.init_schema()?;
        let source = store.get_or_create_source("chat", "group")?;
        let conversation = store.ensure_conversation(source.id, "t1", "chat", None)?;

        let sender = store.ensure_participant(&Address::email("sender@example.com", ""))?;
        let recipient = store.ensure_participant(&Address::email("rcpt@example.com", ""))?;
        // Participant reachable only through a reaction.
        let reactor = store.ensure_participant(&Address::phone("+15550199", "Reactor"))?;
        let user_label = store.get_or_create_user_label("Keep")?;

        let mut input = message(source.id, conversation, "m1", Some(1_000));
        input.sender_id = Some(sender);
        input.recipients = vec![RecipientInput {
            recipient_type: RecipientType::To,
            participant_id: recipient,
            display_name: None,
        }];
        input.label_ids = vec![user_label];
        let message_id = store.persist_message(&input)?;
        store.add_reaction(message_id, reactor, "emoji", Some("+1"))?;
        store.upsert_attachment(message_id, Some("a.txt"), None, None, "hash-1", 10)?;

        // A label on another source that should also be excluded when that
        // source has no selected messages.
        let other = store.get_or_create_source("imap", "other@example.com")?;
        store.ensure_label(other.id, "X", "X", LabelKind::System)?;
        drop(store);

        let dst = dir.path().join("subset");
        let result = copy_subset(&src_path, &dst, 10)?;
        assert_eq!(result.messages, 1);
        assert_eq!(result.sources, 1, "unrepresented source must not be copied");
        assert_eq!(result.participants, 3, "reaction join path must be unioned");
        assert_eq!(result.labels, 1, "user label with NULL source survives");

        let conn = dest_conn(&dst)?;
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM reactions")?, 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM attachments")?, 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM message_labels")?, 1);
        let label_source: Option<i64> =
            conn.query_row("SELECT source_id FROM labels", [], |row| row.get(0))?;
        assert_eq!(label_source, None);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM pragma_foreign_key_check")?, 0);
        Ok(())
    }

    #[test]
    fn end_to_end_soft_deletes_and_source_pruning() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join("src.db");
        let mut store = Store::open(&src_path)?;
        store.init_schema()?;

        let first = store.get_or_create_source("imap", "first@example.com")?;
        let second = store.get_or_create_source("imap", "second@example.com")?;
        let conv_first = store.ensure_conversation(first.id, "t1", "email_thread", None)?;
        let conv_second = store.ensure_conversation(second.id, "t2", "email_thread", None)?;

        // 5 active messages on the first source, 5 soft-deleted on the second.
        for i in 0..5_i64 {
            store.persist_message(&message(first.id, conv_first, &format!("a{i}"), Some(100 + i)))?;
        }
        let doomed: Vec<String> = (0..5_i64).map(|i| format!("b{i}")).collect();
        for (i, key) in doomed.iter().enumerate() {
            store.persist_message(&message(
                second.id,
                conv_second,
                key,
                Some(1_000 + i as i64),
            ))?;
        }
        store.soft_delete_messages_batch(second.id, &doomed)?;
        drop(store);

        let dst = dir.path().join("subset");
        let result = copy_subset(&src_path, &dst, 5)?;
        assert_eq!(result.messages, 5, "only active messages are eligible");
        assert_eq!(result.sources, 1, "the all-deleted source must not survive");
        assert_eq!(result.conversations, 1);

        let conn = dest_conn(&dst)?;
        let identifiers: Vec<String> = conn
            .prepare("SELECT identifier FROM sources")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        assert_eq!(identifiers, vec!["first@example.com".to_string()]);

        // Denormalized counts must match the actual copied rows.
        let (message_count, actual): (i64, i64) = conn.query_row(
            "SELECT c.message_count,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
             FROM conversations c",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(message_count, 5);
        assert_eq!(message_count, actual);
        Ok(())
    }

    #[test]
    fn rejects_bad_budgets_and_populated_destinations() -> TestResult {
        let dir = tempfile::tempdir()?;
        let src_path = dir.path().join("src.db");
        let mut store = Store::open(&src_path)?;
        store.init_schema()?;
        drop(store);

        let dst = dir.path().join("subset");
        assert!(matches!(
            copy_subset(&src_path, &dst, 0),
            Err(StoreError::Config(_))
        ));
        assert!(!dst.exists(), "rejected call must not create the directory");

        copy_subset(&src_path, &dst, 5)?;
        // Second run into the same directory refuses to overwrite, and the
        // existing database survives.
        assert!(matches!(
            copy_subset(&src_path, &dst, 5),
            Err(StoreError::Config(_))
        ));
        assert!(dst.join(SUBSET_DB_FILE).exists());
        Ok(())
    }

    #[test]
    fn missing_source_leaves_no_artifacts() -> TestResult {
        let dir = tempfile::tempdir()?;
        let dst = dir.path().join("subset");

        let result = copy_subset(&dir.path().join("no-such.db"), &dst, 5);
        assert!(matches!(result, Err(StoreError::Io { .. })));
        assert!(!dst.exists(), "created directory must be removed on failure");
        Ok(())
    }

    #[test]
    fn control_characters_in_source_path_are_rejected() -> TestResult {
        let dir = tempfile::tempdir()?;
        // A real file whose name carries a control character, so the check
        // fires after canonicalization instead of a missing-path error.
        let src_path = dir.path().join("bad\u{7}name.db");
        fs::write(&src_path, b"")?;

        let dst = dir.path().join("subset");
        match copy_subset(&src_path, &dst, 5) {
            Err(StoreError::Config(message)) => assert!(message.contains("control character")),
            other => panic!("expected Config error, got {other:?}"),
        }
        assert!(!dst.exists(), "no artifacts may survive the rejected copy");
        Ok(())
    }

    #[test]
    fn failure_preserves_a_preexisting_destination_directory() -> TestResult {
        let dir = tempfile::tempdir()?;
        let dst = dir.path().join("subset");
        fs::create_dir_all(&dst)?;
        fs::write(dst.join("unrelated.txt"), b"keep me")?;

        let result = copy_subset(&dir.path().join("no-such.db"), &dst, 5);
        assert!(result.is_err());

        // The caller's directory and file survive; only our artifacts went.
        assert!(dst.exists());
        assert!(dst.join("unrelated.txt").exists());
        assert!(!dst.join(SUBSET_DB_FILE).exists());
        assert!(!dst.join(format!("{SUBSET_DB_FILE}-wal")).exists());
        Ok(())
    }
}
