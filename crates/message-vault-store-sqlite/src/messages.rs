//! Message persistence: natural-key upserts, the atomic multi-table
//! persistence transaction, recipient/label replacement, soft and permanent
//! deletion, and sampling helpers.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use message_vault_core::{Address, LabelKind, MessageInput, RecipientType};
use rand::Rng;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::chunk::{exec_in_chunks, insert_in_chunks, placeholders, query_in_chunks};
use crate::error::{BatchFailure, SqlContext, StoreError, StoreResult};
use crate::{now_rfc3339, rfc3339_opt, Store};

fn upsert_message_row(conn: &Connection, input: &MessageInput, now: &str) -> StoreResult<i64> {
    let op = "upsert message";
    input.validate().map_err(|err| StoreError::Config(err.to_string()))?;

    conn.query_row(
        "INSERT INTO messages (
           conversation_id, source_id, source_message_id, message_type,
           sent_at, received_at, internal_date, sender_id, reply_to_message_id,
           is_from_me, subject, snippet, size_estimate, has_attachments,
           attachment_count, archived_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT (source_id, source_message_id) DO UPDATE SET
           conversation_id = excluded.conversation_id,
           sent_at = excluded.sent_at,
           received_at = excluded.received_at,
           internal_date = excluded.internal_date,
           sender_id = excluded.sender_id,
           reply_to_message_id = excluded.reply_to_message_id,
           is_from_me = excluded.is_from_me,
           subject = excluded.subject,
           snippet = excluded.snippet,
           size_estimate = excluded.size_estimate,
           has_attachments = excluded.has_attachments,
           attachment_count = excluded.attachment_count
         RETURNING id",
        params![
            input.conversation_id,
            input.source_id,
            input.source_message_id,
            input.kind.as_str(),
            rfc3339_opt(input.sent_at)?,
            rfc3339_opt(input.received_at)?,
            rfc3339_opt(input.internal_date)?,
            input.sender_id,
            input.reply_to_message_id,
            input.is_from_me,
            input.subject,
            input.snippet,
            input.size_estimate,
            input.has_attachments,
            input.attachment_count,
            now,
        ],
        |row| row.get(0),
    )
    .op(op)
}

fn upsert_body_row(
    conn: &Connection,
    message_id: i64,
    body_text: Option<&str>,
    body_html: Option<&str>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO message_bodies (message_id, body_text, body_html)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (message_id) DO UPDATE SET
           body_text = excluded.body_text,
           body_html = excluded.body_html",
        params![message_id, body_text, body_html],
    )
    .op("upsert message body")?;
    Ok(())
}

fn upsert_raw_row(conn: &Connection, message_id: i64, raw: &[u8]) -> StoreResult<()> {
    let compressed = compress_zlib(raw)?;
    conn.execute(
        "INSERT INTO message_raw (message_id, raw_data, raw_format, compression)
         VALUES (?1, ?2, 'mime', 'zlib')
         ON CONFLICT (message_id) DO UPDATE SET
           raw_data = excluded.raw_data,
           raw_format = excluded.raw_format,
           compression = excluded.compression",
        params![message_id, compressed],
    )
    .op("store raw payload")?;
    Ok(())
}

fn replace_recipient_set(
    conn: &Connection,
    message_id: i64,
    recipient_type: RecipientType,
    entries: &[(i64, Option<String>)],
) -> StoreResult<()> {
    let op = "replace recipients";
    conn.execute(
        "DELETE FROM message_recipients WHERE message_id = ?1 AND recipient_type = ?2",
        params![message_id, recipient_type.as_str()],
    )
    .op(op)?;

    if entries.is_empty() {
        return Ok(());
    }

    insert_in_chunks(
        conn,
        op,
        entries.len(),
        4,
        "INSERT INTO message_recipients (message_id, participant_id, recipient_type, display_name) VALUES ",
        |index| {
            let (participant_id, display_name) = &entries[index];
            vec![
                Value::from(message_id),
                Value::from(*participant_id),
                Value::from(recipient_type.as_str().to_string()),
                display_name.clone().map_or(Value::Null, Value::from),
            ]
        },
    )?;
    Ok(())
}

fn replace_label_set(conn: &Connection, message_id: i64, label_ids: &[i64]) -> StoreResult<()> {
    let op = "replace labels";
    conn.execute("DELETE FROM message_labels WHERE message_id = ?1", params![message_id])
        .op(op)?;

    if label_ids.is_empty() {
        return Ok(());
    }

    insert_in_chunks(
        conn,
        op,
        label_ids.len(),
        2,
        "INSERT INTO message_labels (message_id, label_id) VALUES ",
        |index| vec![Value::from(message_id), Value::from(label_ids[index])],
    )?;
    Ok(())
}

/// Recompute one conversation's denormalized aggregates from its current
/// active messages, keeping them equal to the true aggregate after every
/// mutation.
fn refresh_conversation_stats(conn: &Connection, conversation_id: i64, now: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE conversations SET
           message_count = (
             SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = conversations.id
               AND m.deleted_from_source_at IS NULL
           ),
           participant_count = (
             SELECT COUNT(*) FROM conversation_participants cp
             WHERE cp.conversation_id = conversations.id
           ),
           last_message_at = (
             SELECT MAX(COALESCE(m.sent_at, m.received_at, m.internal_date)) FROM messages m
             WHERE m.conversation_id = conversations.id
               AND m.deleted_from_source_at IS NULL
           ),
           updated_at = ?2
         WHERE id = ?1",
        params![conversation_id, now],
    )
    .op("refresh conversation stats")?;
    Ok(())
}

/// Refresh aggregates for every conversation of a source, after a bulk
/// mutation whose touched conversations are not tracked individually.
fn refresh_source_conversation_stats(
    conn: &Connection,
    source_id: i64,
    now: &str,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE conversations SET
           message_count = (
             SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = conversations.id
               AND m.deleted_from_source_at IS NULL
           ),
           participant_count = (
             SELECT COUNT(*) FROM conversation_participants cp
             WHERE cp.conversation_id = conversations.id
           ),
           last_message_at = (
             SELECT MAX(COALESCE(m.sent_at, m.received_at, m.internal_date)) FROM messages m
             WHERE m.conversation_id = conversations.id
               AND m.deleted_from_source_at IS NULL
           ),
           updated_at = ?2
         WHERE source_id = ?1",
        params![source_id, now],
    )
    .op("refresh conversation stats")?;
    Ok(())
}

/// Hex SHA-256 content address for an attachment payload. Identical bytes
/// always land on the same hash, which is what makes the
/// `(message_id, content_hash)` key deduplicate.
#[must_use]
pub fn attachment_content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn compress_zlib(raw: &[u8]) -> StoreResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .and_then(|()| encoder.finish())
        .map_err(|err| StoreError::Encoding(format!("failed to compress raw payload: {err}")))
}

fn decompress_zlib(compressed: &[u8]) -> StoreResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| StoreError::Encoding(format!("failed to decompress raw payload: {err}")))?;
    Ok(out)
}

impl Store {
    /// Get or create a conversation by its `(source_id,
    /// source_conversation_id)` natural key.
    ///
    /// # Errors
    /// Returns an error when the lookup or insert fails.
    pub fn ensure_conversation(
        &mut self,
        source_id: i64,
        source_conversation_id: &str,
        conversation_type: &str,
        title: Option<&str>,
    ) -> StoreResult<i64> {
        let op = "ensure conversation";
        let now = now_rfc3339()?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO conversations (
                   source_id, source_conversation_id, conversation_type, title,
                   created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![source_id, source_conversation_id, conversation_type, title, now],
            )
            .op(op)?;

        self.conn
            .query_row(
                "SELECT id FROM conversations
                 WHERE source_id = ?1 AND source_conversation_id = ?2",
                params![source_id, source_conversation_id],
                |row| row.get(0),
            )
            .op(op)
    }

    /// Get or create a participant by email or phone. Dedup is global:
    /// participants are shared across sources.
    ///
    /// # Errors
    /// Returns a configuration error for an address with neither email nor
    /// phone, or a storage error when the lookup or insert fails.
    pub fn ensure_participant(&mut self, address: &Address) -> StoreResult<i64> {
        let op = "ensure participant";
        let now = now_rfc3339()?;

        if let Some(email) = address.email.as_deref() {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO participants
                       (email_address, display_name, domain, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![email, address.display_name, address.domain(), now],
                )
                .op(op)?;
            return self
                .conn
                .query_row(
                    "SELECT id FROM participants WHERE email_address = ?1",
                    params![email],
                    |row| row.get(0),
                )
                .op(op);
        }

        if let Some(phone) = address.phone.as_deref() {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO participants
                       (phone_number, display_name, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)",
                    params![phone, address.display_name, now],
                )
                .op(op)?;
            return self
                .conn
                .query_row(
                    "SELECT id FROM participants WHERE phone_number = ?1",
                    params![phone],
                    |row| row.get(0),
                )
                .op(op);
        }

        Err(StoreError::config("address must carry an email or a phone number"))
    }

    /// Resolve many addresses to participant ids in one pass: insert the
    /// unseen ones, then fetch all ids with chunked IN-list selects. The
    /// returned map is keyed by the identifying value (email or phone).
    ///
    /// # Errors
    /// Returns an error when an insert or a chunked select fails.
    pub fn ensure_participants_batch(
        &mut self,
        addresses: &[Address],
    ) -> StoreResult<HashMap<String, i64>> {
        let op = "ensure participants batch";
        let mut result = HashMap::new();
        if addresses.is_empty() {
            return Ok(result);
        }

        let now = now_rfc3339()?;
        let mut emails: Vec<String> = Vec::new();
        let mut phones: Vec<String> = Vec::new();

        for address in addresses {
            if let Some(email) = address.email.as_deref() {
                self.conn
                    .execute(
                        "INSERT OR IGNORE INTO participants
                           (email_address, display_name, domain, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?4)",
                        params![email, address.display_name, address.domain(), now],
                    )
                    .op(op)?;
                emails.push(email.to_string());
            } else if let Some(phone) = address.phone.as_deref() {
                self.conn
                    .execute(
                        "INSERT OR IGNORE INTO participants
                           (phone_number, display_name, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?3)",
                        params![phone, address.display_name, now],
                    )
                    .op(op)?;
                phones.push(phone.to_string());
            }
        }

        if !emails.is_empty() {
            query_in_chunks(
                &self.conn,
                op,
                &emails,
                &[],
                "SELECT email_address, id FROM participants WHERE email_address IN ({ids})",
                |row| {
                    result.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
                    Ok(())
                },
            )?;
        }
        if !phones.is_empty() {
            query_in_chunks(
                &self.conn,
                op,
                &phones,
                &[],
                "SELECT phone_number, id FROM participants WHERE phone_number IN ({ids})",
                |row| {
                    result.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
                    Ok(())
                },
            )?;
        }

        Ok(result)
    }

    /// Record an alternate identifier (handle, secondary address) for a
    /// participant.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn add_participant_identifier(
        &mut self,
        participant_id: i64,
        identifier_type: &str,
        identifier_value: &str,
    ) -> StoreResult<()> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO participant_identifiers
                   (participant_id, identifier_type, identifier_value, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![participant_id, identifier_type, identifier_value, now],
            )
            .op("add participant identifier")?;
        Ok(())
    }

    /// Link a participant to a conversation.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn add_conversation_participant(
        &mut self,
        conversation_id: i64,
        participant_id: i64,
    ) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO conversation_participants
                   (conversation_id, participant_id)
                 VALUES (?1, ?2)",
                params![conversation_id, participant_id],
            )
            .op("add conversation participant")?;
        Ok(())
    }

    /// Get or create a platform label by its `(source_id, source_label_id)`
    /// natural key.
    ///
    /// # Errors
    /// Returns an error when the lookup or insert fails.
    pub fn ensure_label(
        &mut self,
        source_id: i64,
        source_label_id: &str,
        name: &str,
        kind: LabelKind,
    ) -> StoreResult<i64> {
        let op = "ensure label";
        self.conn
            .execute(
                "INSERT OR IGNORE INTO labels (source_id, source_label_id, name, label_type)
                 VALUES (?1, ?2, ?3, ?4)",
                params![source_id, source_label_id, name, kind.as_str()],
            )
            .op(op)?;

        self.conn
            .query_row(
                "SELECT id FROM labels WHERE source_id = ?1 AND source_label_id = ?2",
                params![source_id, source_label_id],
                |row| row.get(0),
            )
            .op(op)
    }

    /// Get or create a user label. User labels have no owning source
    /// (`source_id` NULL), dedup by name, and survive every by-source
    /// operation.
    ///
    /// # Errors
    /// Returns an error when the lookup or insert fails.
    pub fn get_or_create_user_label(&mut self, name: &str) -> StoreResult<i64> {
        let op = "get or create user label";
        self.conn
            .execute(
                "INSERT OR IGNORE INTO labels (source_id, source_label_id, name, label_type)
                 VALUES (NULL, NULL, ?1, 'user')",
                params![name],
            )
            .op(op)?;

        self.conn
            .query_row(
                "SELECT id FROM labels WHERE source_id IS NULL AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .op(op)
    }

    /// Ensure a set of platform labels, returning `source_label_id -> id`.
    ///
    /// # Errors
    /// Returns an error when any label cannot be ensured.
    pub fn ensure_labels_batch(
        &mut self,
        source_id: i64,
        labels: &[(String, String, LabelKind)],
    ) -> StoreResult<HashMap<String, i64>> {
        let mut result = HashMap::with_capacity(labels.len());
        for (source_label_id, name, kind) in labels {
            let id = self.ensure_label(source_id, source_label_id, name, *kind)?;
            result.insert(source_label_id.clone(), id);
        }
        Ok(result)
    }

    /// Which of the given source message ids already exist for a source.
    /// Returns `source_message_id -> surrogate id` for the ones that do.
    ///
    /// # Errors
    /// Returns an error when a chunked select fails.
    pub fn message_exists_batch(
        &self,
        source_id: i64,
        source_message_ids: &[String],
    ) -> StoreResult<HashMap<String, i64>> {
        let mut result = HashMap::new();
        if source_message_ids.is_empty() {
            return Ok(result);
        }

        query_in_chunks(
            &self.conn,
            "message exists batch",
            source_message_ids,
            &[&source_id],
            "SELECT source_message_id, id FROM messages
             WHERE source_id = ? AND source_message_id IN ({ids})",
            |row| {
                result.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
                Ok(())
            },
        )?;
        Ok(result)
    }

    /// Upsert only the message row, keyed on `(source_id,
    /// source_message_id)`. On conflict every mutable field is overwritten;
    /// the surrogate id is stable across repeated upserts.
    ///
    /// # Errors
    /// Returns an error when validation or the statement fails.
    pub fn upsert_message(&mut self, input: &MessageInput) -> StoreResult<i64> {
        let now = now_rfc3339()?;
        let message_id = upsert_message_row(&self.conn, input, &now)?;
        refresh_conversation_stats(&self.conn, input.conversation_id, &now)?;
        Ok(message_id)
    }

    /// Atomically persist a normalized message: the message row, its body,
    /// its compressed raw payload, every recipient-type set
    /// (delete-then-insert), and its label set — all in one transaction.
    /// A failure at any step leaves the prior committed state unchanged.
    ///
    /// # Errors
    /// Returns the underlying error wrapped with the failing step's name.
    pub fn persist_message(&mut self, input: &MessageInput) -> StoreResult<i64> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().op("persist message")?;

        let message_id = upsert_message_row(&tx, input, &now)?;

        if input.body_text.is_some() || input.body_html.is_some() {
            upsert_body_row(&tx, message_id, input.body_text.as_deref(), input.body_html.as_deref())?;
        }

        if let Some(raw) = input.raw.as_deref() {
            upsert_raw_row(&tx, message_id, raw)?;
        }

        for recipient_type in RecipientType::ALL {
            let entries: Vec<(i64, Option<String>)> = input
                .recipients
                .iter()
                .filter(|recipient| recipient.recipient_type == recipient_type)
                .map(|recipient| (recipient.participant_id, recipient.display_name.clone()))
                .collect();
            replace_recipient_set(&tx, message_id, recipient_type, &entries)?;
        }

        replace_label_set(&tx, message_id, &input.label_ids)?;
        refresh_conversation_stats(&tx, input.conversation_id, &now)?;

        tx.commit().op("persist message")?;
        Ok(message_id)
    }

    /// Replace the recipients of one type for a message.
    ///
    /// # Errors
    /// Returns an error when the delete or chunked insert fails.
    pub fn replace_message_recipients(
        &mut self,
        message_id: i64,
        recipient_type: RecipientType,
        entries: &[(i64, Option<String>)],
    ) -> StoreResult<()> {
        let tx = self.conn.transaction().op("replace recipients")?;
        replace_recipient_set(&tx, message_id, recipient_type, entries)?;
        tx.commit().op("replace recipients")
    }

    /// Replace the full label set for a message.
    ///
    /// # Errors
    /// Returns an error when the delete or chunked insert fails.
    pub fn replace_message_labels(
        &mut self,
        message_id: i64,
        label_ids: &[i64],
    ) -> StoreResult<()> {
        let tx = self.conn.transaction().op("replace labels")?;
        replace_label_set(&tx, message_id, label_ids)?;
        tx.commit().op("replace labels")
    }

    /// Remove specific labels from a message, leaving the rest.
    ///
    /// # Errors
    /// Returns an error when the chunked delete fails.
    pub fn remove_message_labels(
        &mut self,
        message_id: i64,
        label_ids: &[i64],
    ) -> StoreResult<()> {
        if label_ids.is_empty() {
            return Ok(());
        }
        exec_in_chunks(
            &self.conn,
            "remove message labels",
            label_ids,
            &[&message_id],
            "DELETE FROM message_labels WHERE message_id = ? AND label_id IN ({ids})",
        )?;
        Ok(())
    }

    /// Record an attachment, content-addressed by hash. A duplicate
    /// `(message_id, content_hash)` pair is a no-op.
    ///
    /// # Errors
    /// Returns an error when the lookup or insert fails.
    pub fn upsert_attachment(
        &mut self,
        message_id: i64,
        filename: Option<&str>,
        mime_type: Option<&str>,
        storage_path: Option<&str>,
        content_hash: &str,
        size: i64,
    ) -> StoreResult<i64> {
        let op = "upsert attachment";
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO attachments
                   (message_id, filename, mime_type, storage_path, content_hash, size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![message_id, filename, mime_type, storage_path, content_hash, size, now],
            )
            .op(op)?;

        self.conn
            .query_row(
                "SELECT id FROM attachments WHERE message_id = ?1 AND content_hash = ?2",
                params![message_id, content_hash],
                |row| row.get(0),
            )
            .op(op)
    }

    /// Record a reaction. The `(message, participant, type, value)`
    /// quadruple is unique; duplicates are no-ops.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn add_reaction(
        &mut self,
        message_id: i64,
        participant_id: i64,
        reaction_type: &str,
        reaction_value: Option<&str>,
    ) -> StoreResult<()> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO reactions
                   (message_id, participant_id, reaction_type, reaction_value, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![message_id, participant_id, reaction_type, reaction_value, now],
            )
            .op("add reaction")?;
        Ok(())
    }

    /// The decompressed raw payload for a message, or `None` when no raw
    /// payload was stored.
    ///
    /// # Errors
    /// Returns an error when the lookup or decompression fails.
    pub fn message_raw(&self, message_id: i64) -> StoreResult<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT raw_data, compression FROM message_raw WHERE message_id = ?1",
                params![message_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .op("get raw payload")?;

        match row {
            None => Ok(None),
            Some((data, compression)) => {
                if compression.as_deref() == Some("zlib") {
                    Ok(Some(decompress_zlib(&data)?))
                } else {
                    Ok(Some(data))
                }
            }
        }
    }

    /// Soft-delete one message by natural key: stamp
    /// `deleted_from_source_at` without removing the row.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn soft_delete_message(
        &mut self,
        source_id: i64,
        source_message_id: &str,
    ) -> StoreResult<()> {
        let now = now_rfc3339()?;
        let conversation_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT conversation_id FROM messages
                 WHERE source_id = ?1 AND source_message_id = ?2",
                params![source_id, source_message_id],
                |row| row.get(0),
            )
            .optional()
            .op("soft delete message")?;

        self.conn
            .execute(
                "UPDATE messages SET deleted_from_source_at = ?1
                 WHERE source_id = ?2 AND source_message_id = ?3",
                params![now, source_id, source_message_id],
            )
            .op("soft delete message")?;

        if let Some(conversation_id) = conversation_id {
            refresh_conversation_stats(&self.conn, conversation_id, &now)?;
        }
        Ok(())
    }

    /// Soft-delete a batch of messages with best-effort chunk semantics:
    /// a failed chunk falls back to per-id updates, every chunk is
    /// attempted, and all failures are reported together as a
    /// [`StoreError::PartialBatch`]. Returns the number of rows stamped.
    ///
    /// # Errors
    /// Returns [`StoreError::PartialBatch`] listing each failed id after all
    /// chunks were attempted.
    pub fn soft_delete_messages_batch(
        &mut self,
        source_id: i64,
        source_message_ids: &[String],
    ) -> StoreResult<u64> {
        let op = "soft delete messages batch";
        if source_message_ids.is_empty() {
            return Ok(0);
        }

        let now = now_rfc3339()?;
        let chunk_size = crate::chunk::chunk_rows(1).saturating_sub(2).max(1);
        let mut affected = 0_u64;
        let mut failures = Vec::new();

        for chunk in source_message_ids.chunks(chunk_size) {
            let sql = format!(
                "UPDATE messages SET deleted_from_source_at = ?
                 WHERE source_id = ? AND source_message_id IN ({})",
                placeholders(chunk.len())
            );

            let mut args: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 2);
            args.push(&now);
            args.push(&source_id);
            for id in chunk {
                args.push(id);
            }

            match self.conn.execute(&sql, args.as_slice()) {
                Ok(rows) => affected += rows as u64,
                Err(chunk_err) => {
                    tracing::warn!(error = %chunk_err, "chunked soft delete failed; retrying individually");
                    for id in chunk {
                        match self.conn.execute(
                            "UPDATE messages SET deleted_from_source_at = ?1
                             WHERE source_id = ?2 AND source_message_id = ?3",
                            params![now, source_id, id],
                        ) {
                            Ok(rows) => affected += rows as u64,
                            Err(err) => failures.push(BatchFailure {
                                key: id.clone(),
                                cause: err.to_string(),
                            }),
                        }
                    }
                }
            }
        }

        refresh_source_conversation_stats(&self.conn, source_id, &now)?;

        if failures.is_empty() {
            Ok(affected)
        } else {
            Err(StoreError::PartialBatch {
                op,
                attempted: source_message_ids.len(),
                failures,
            })
        }
    }

    /// Delete one message by natural key. `permanent` removes the row (and,
    /// via cascade, its body, raw payload, recipient/label links, reactions
    /// and attachment records); otherwise this is a soft delete. Attachment
    /// blobs on disk are content-addressed and shared, so they are never
    /// unlinked here.
    ///
    /// # Errors
    /// Returns an error when the delete or update fails.
    pub fn delete_message(
        &mut self,
        source_id: i64,
        source_message_id: &str,
        permanent: bool,
    ) -> StoreResult<()> {
        if !permanent {
            return self.soft_delete_message(source_id, source_message_id);
        }

        let op = "delete message";
        let now = now_rfc3339()?;
        let conversation_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT conversation_id FROM messages
                 WHERE source_id = ?1 AND source_message_id = ?2",
                params![source_id, source_message_id],
                |row| row.get(0),
            )
            .optional()
            .op(op)?;

        self.conn
            .execute(
                "DELETE FROM messages WHERE source_id = ?1 AND source_message_id = ?2",
                params![source_id, source_message_id],
            )
            .op(op)?;

        if let Some(conversation_id) = conversation_id {
            refresh_conversation_stats(&self.conn, conversation_id, &now)?;
        }
        Ok(())
    }

    /// Count of active (not soft-deleted) messages for a source.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_messages_for_source(&self, source_id: i64) -> StoreResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE source_id = ?1 AND deleted_from_source_at IS NULL",
                params![source_id],
                |row| row.get(0),
            )
            .op("count messages")
    }

    /// A random sample of active message ids for a source. Small tables use
    /// `ORDER BY RANDOM()`; large tables use random OFFSET probes so the
    /// cost stays proportional to the sample size.
    ///
    /// # Errors
    /// Returns an error when a sampling query fails.
    pub fn random_message_ids(&self, source_id: i64, limit: usize) -> StoreResult<Vec<i64>> {
        let op = "sample message ids";
        let total: i64 = self.count_messages_for_source(source_id)?;
        if total == 0 || limit == 0 {
            return Ok(Vec::new());
        }

        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        if total < 10_000 || limit_i64 >= total {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT id FROM messages
                     WHERE source_id = ?1 AND deleted_from_source_at IS NULL
                     ORDER BY RANDOM()
                     LIMIT ?2",
                )
                .op(op)?;
            let rows = stmt
                .query_map(params![source_id, limit_i64], |row| row.get::<_, i64>(0))
                .op(op)?;

            let mut ids = Vec::with_capacity(limit);
            for row in rows {
                ids.push(row.op(op)?);
            }
            return Ok(ids);
        }

        let mut rng = rand::thread_rng();
        let mut ids = Vec::with_capacity(limit);
        let mut seen = std::collections::HashSet::with_capacity(limit);

        while ids.len() < limit {
            let offset = rng.gen_range(0..total);
            let id: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM messages
                     WHERE source_id = ?1 AND deleted_from_source_at IS NULL
                     ORDER BY id
                     LIMIT 1 OFFSET ?2",
                    params![source_id, offset],
                    |row| row.get(0),
                )
                .optional()
                .op(op)?;

            if let Some(id) = id {
                if seen.insert(id) {
                    ids.push(id);
                }
            }
        }

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_vault_core::{MessageKind, RecipientInput};
    use time::OffsetDateTime;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn open_store() -> StoreResult<(tempfile::TempDir, Store)> {
        let dir = tempfile::tempdir()
            .map_err(|err| StoreError::from_io("create temp dir", err))?;
        let mut store = Store::open(&dir.path().join("archive.db"))?;
        store.init_schema()?;
        Ok((dir, store))
    }

    fn fixture_input(source_id: i64, conversation_id: i64, key: &str) -> MessageInput {
        MessageInput {
            conversation_id,
            source_id,
            source_message_id: key.to_string(),
            kind: MessageKind::Email,
            sent_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).ok(),
            received_at: None,
            internal_date: None,
            sender_id: None,
            reply_to_message_id: None,
            is_from_me: false,
            subject: Some("hello".to_string()),
            snippet: Some("hello there".to_string()),
            size_estimate: 128,
            has_attachments: false,
            attachment_count: 0,
            body_text: Some("hello there, world".to_string()),
            body_html: None,
            raw: None,
            recipients: Vec::new(),
            label_ids: Vec::new(),
        }
    }

    fn seed_conversation(store: &mut Store) -> StoreResult<(i64, i64)> {
        let source = store.get_or_create_source("imap", "ada@example.com")?;
        let conversation = store.ensure_conversation(source.id, "thread-1", "email_thread", None)?;
        Ok((source.id, conversation))
    }

    #[test]
    fn upsert_preserves_surrogate_id_and_overwrites_fields() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let (source_id, conversation_id) = seed_conversation(&mut store)?;

        let mut input = fixture_input(source_id, conversation_id, "msg-1");
        let first = store.upsert_message(&input)?;

        input.subject = Some("updated subject".to_string());
        input.size_estimate = 4_096;
        let second = store.upsert_message(&input)?;
        assert_eq!(first, second);

        let (subject, size): (String, i64) = store.connection().query_row(
            "SELECT subject, size_estimate FROM messages WHERE id = ?1",
            params![first],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(subject, "updated subject");
        assert_eq!(size, 4_096);
        Ok(())
    }

    #[test]
    fn persist_message_is_atomic_and_complete() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let (source_id, conversation_id) = seed_conversation(&mut store)?;

        let sender = store.ensure_participant(&Address::email("bob@example.com", "Bob"))?;
        let to = store.ensure_participant(&Address::email("carol@example.com", "Carol"))?;
        let label = store.ensure_label(source_id, "INBOX", "INBOX", LabelKind::System)?;

        let mut input = fixture_input(source_id, conversation_id, "msg-2");
        input.sender_id = Some(sender);
        input.raw = Some(b"Received: raw mime bytes".to_vec());
        input.recipients = vec![
            RecipientInput {
                recipient_type: RecipientType::From,
                participant_id: sender,
                display_name: Some("Bob".to_string()),
            },
            RecipientInput {
                recipient_type: RecipientType::To,
                participant_id: to,
                display_name: None,
            },
        ];
        input.label_ids = vec![label];

        let message_id = store.persist_message(&input)?;

        let body: String = store.connection().query_row(
            "SELECT body_text FROM message_bodies WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        assert_eq!(body, "hello there, world");

        let raw = store.message_raw(message_id)?.ok_or("raw payload should exist")?;
        assert_eq!(raw, b"Received: raw mime bytes");

        let recipient_count: i64 = store.connection().query_row(
            "SELECT COUNT(*) FROM message_recipients WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        assert_eq!(recipient_count, 2);

        let label_count: i64 = store.connection().query_row(
            "SELECT COUNT(*) FROM message_labels WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        assert_eq!(label_count, 1);
        Ok(())
    }

    #[test]
    fn persist_rolls_back_when_a_step_fails() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let (source_id, conversation_id) = seed_conversation(&mut store)?;

        let mut input = fixture_input(source_id, conversation_id, "msg-3");
        // Dangling participant id makes the recipient insert fail.
        input.recipients = vec![RecipientInput {
            recipient_type: RecipientType::To,
            participant_id: 9_999,
            display_name: None,
        }];

        assert!(store.persist_message(&input).is_err());

        let exists = store.message_exists_batch(source_id, &["msg-3".to_string()])?;
        assert!(exists.is_empty(), "failed persist must leave no message row");
        Ok(())
    }

    #[test]
    fn recipient_replace_beyond_parameter_limit_is_exact() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let (source_id, conversation_id) = seed_conversation(&mut store)?;
        let input = fixture_input(source_id, conversation_id, "msg-4");
        let message_id = store.upsert_message(&input)?;

        let addresses: Vec<Address> = (0..400)
            .map(|i| Address::email(format!("person{i}@example.com"), format!("Person {i}")))
            .collect();
        let id_map = store.ensure_participants_batch(&addresses)?;
        assert_eq!(id_map.len(), 400);

        // 400 recipients x 4 params per row exceeds one statement's budget.
        let entries: Vec<(i64, Option<String>)> =
            id_map.values().map(|id| (*id, None)).collect();
        store.replace_message_recipients(message_id, RecipientType::To, &entries)?;

        let count: i64 = store.connection().query_row(
            "SELECT COUNT(*) FROM message_recipients
             WHERE message_id = ?1 AND recipient_type = 'to'",
            params![message_id],
            |row| row.get(0),
        )?;
        assert_eq!(count, 400);

        // Replacing again with a smaller set leaves exactly that set.
        store.replace_message_recipients(message_id, RecipientType::To, &entries[..5])?;
        let count: i64 = store.connection().query_row(
            "SELECT COUNT(*) FROM message_recipients
             WHERE message_id = ?1 AND recipient_type = 'to'",
            params![message_id],
            |row| row.get(0),
        )?;
        assert_eq!(count, 5);
        Ok(())
    }

    #[test]
    fn ensure_participant_dedups_by_email_and_phone() -> TestResult {
        let (_dir, mut store) = open_store()?;

        let by_email = store.ensure_participant(&Address::email("ada@example.com", "Ada"))?;
        let again = store.ensure_participant(&Address::email("ada@example.com", "A."))?;
        assert_eq!(by_email, again);

        let by_phone = store.ensure_participant(&Address::phone("+15550100", "Ada"))?;
        let phone_again = store.ensure_participant(&Address::phone("+15550100", ""))?;
        assert_eq!(by_phone, phone_again);
        assert_ne!(by_email, by_phone);

        assert!(store.ensure_participant(&Address::default()).is_err());
        Ok(())
    }

    #[test]
    fn user_labels_have_no_source_and_dedup_by_name() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let first = store.get_or_create_user_label("Follow up")?;
        let second = store.get_or_create_user_label("Follow up")?;
        assert_eq!(first, second);

        let source_id: Option<i64> = store.connection().query_row(
            "SELECT source_id FROM labels WHERE id = ?1",
            params![first],
            |row| row.get(0),
        )?;
        assert_eq!(source_id, None);
        Ok(())
    }

    #[test]
    fn soft_delete_excludes_from_counts_and_sampling() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let (source_id, conversation_id) = seed_conversation(&mut store)?;

        for i in 0..6 {
            let input = fixture_input(source_id, conversation_id, &format!("msg-{i}"));
            store.upsert_message(&input)?;
        }
        assert_eq!(store.count_messages_for_source(source_id)?, 6);

        store.soft_delete_message(source_id, "msg-0")?;
        let deleted = store.soft_delete_messages_batch(
            source_id,
            &["msg-1".to_string(), "msg-2".to_string()],
        )?;
        assert_eq!(deleted, 2);

        assert_eq!(store.count_messages_for_source(source_id)?, 3);

        let sample = store.random_message_ids(source_id, 10)?;
        assert_eq!(sample.len(), 3);

        let survivors = store.message_exists_batch(
            source_id,
            &["msg-3".to_string(), "msg-4".to_string(), "msg-5".to_string()],
        )?;
        for id in sample {
            assert!(survivors.values().any(|survivor| *survivor == id));
        }
        Ok(())
    }

    #[test]
    fn permanent_delete_removes_row_and_children() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let (source_id, conversation_id) = seed_conversation(&mut store)?;

        let mut input = fixture_input(source_id, conversation_id, "msg-perm");
        input.raw = Some(b"raw".to_vec());
        let message_id = store.persist_message(&input)?;

        store.delete_message(source_id, "msg-perm", true)?;

        let exists = store.message_exists_batch(source_id, &["msg-perm".to_string()])?;
        assert!(exists.is_empty());

        let body_rows: i64 = store.connection().query_row(
            "SELECT COUNT(*) FROM message_bodies WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        assert_eq!(body_rows, 0);
        let raw_rows: i64 = store.connection().query_row(
            "SELECT COUNT(*) FROM message_raw WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        assert_eq!(raw_rows, 0);
        Ok(())
    }

    #[test]
    fn conversation_aggregates_track_mutations() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let (source_id, conversation_id) = seed_conversation(&mut store)?;

        for i in 0..3 {
            let input = fixture_input(source_id, conversation_id, &format!("msg-{i}"));
            store.persist_message(&input)?;
        }

        let counts = |store: &Store| -> rusqlite::Result<(i64, Option<String>)> {
            store.connection().query_row(
                "SELECT message_count, last_message_at FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
        };

        let (message_count, last_message_at) = counts(&store)?;
        assert_eq!(message_count, 3);
        assert!(last_message_at.is_some());

        store.soft_delete_message(source_id, "msg-2")?;
        assert_eq!(counts(&store)?.0, 2);

        store.delete_message(source_id, "msg-1", true)?;
        assert_eq!(counts(&store)?.0, 1);
        Ok(())
    }

    #[test]
    fn attachments_dedup_by_content_hash() -> TestResult {
        let (_dir, mut store) = open_store()?;
        let (source_id, conversation_id) = seed_conversation(&mut store)?;
        let input = fixture_input(source_id, conversation_id, "msg-att");
        let message_id = store.upsert_message(&input)?;

        let hash = attachment_content_hash(b"pdf bytes");
        assert_eq!(hash, attachment_content_hash(b"pdf bytes"));

        let first = store.upsert_attachment(
            message_id,
            Some("report.pdf"),
            Some("application/pdf"),
            Some("blobs/ab/cd"),
            &hash,
            2_048,
        )?;
        let second =
            store.upsert_attachment(message_id, Some("report.pdf"), None, None, &hash, 2_048)?;
        assert_eq!(first, second);

        let count: i64 = store.connection().query_row(
            "SELECT COUNT(*) FROM attachments WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        assert_eq!(count, 1);
        Ok(())
    }
}
