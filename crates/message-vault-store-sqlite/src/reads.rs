//! Read paths over the archive: paginated listing, single-message detail,
//! search through the selected backend, and schema-aware inspection used by
//! tests. Soft-deleted messages are excluded everywhere.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::chunk::query_in_chunks;
use crate::error::{SqlContext, StoreResult};
use crate::{parse_rfc3339_opt, Store};

/// One row of a message listing or search result page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageSummary {
    pub id: i64,
    pub subject: String,
    pub from: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub sent_at: Option<OffsetDateTime>,
    pub snippet: String,
    pub has_attachments: bool,
    pub size_estimate: i64,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A page of summaries plus the total match count.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<MessageSummary>,
    pub total: i64,
}

/// Attachment metadata as exposed by [`MessageDetail`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttachmentInfo {
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size: i64,
}

/// Full detail for one message, body included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDetail {
    #[serde(flatten)]
    pub summary: MessageSummary,
    pub body: String,
    pub attachments: Vec<AttachmentInfo>,
}

/// Consolidated per-message facts for test assertions, keeping schema
/// knowledge inside the store.
#[derive(Debug, Clone, Default)]
pub struct MessageInspection {
    pub sent_at: Option<String>,
    pub internal_date: Option<String>,
    pub deleted_from_source: bool,
    pub conversation_source_id: String,
    pub body_text: Option<String>,
    pub raw_data_exists: bool,
    pub recipient_counts: HashMap<String, usize>,
}

const SUMMARY_SELECT: &str = "
  SELECT
    m.id,
    COALESCE(m.subject, '') AS subject,
    COALESCE(p.email_address, '') AS from_addr,
    COALESCE(m.sent_at, m.received_at, m.internal_date) AS activity_at,
    COALESCE(m.snippet, '') AS snippet,
    m.has_attachments,
    m.size_estimate
  FROM messages m
  LEFT JOIN message_recipients mr ON mr.message_id = m.id AND mr.recipient_type = 'from'
  LEFT JOIN participants p ON p.id = mr.participant_id";

fn scan_summary(row: &Row<'_>) -> rusqlite::Result<(MessageSummary, Option<String>)> {
    let summary = MessageSummary {
        id: row.get("id")?,
        subject: row.get("subject")?,
        from: row.get("from_addr")?,
        sent_at: None,
        snippet: row.get("snippet")?,
        has_attachments: row.get("has_attachments")?,
        size_estimate: row.get("size_estimate")?,
        to: Vec::new(),
        labels: Vec::new(),
    };
    let activity_at: Option<String> = row.get("activity_at")?;
    Ok((summary, activity_at))
}

impl Store {
    /// A page of active messages, most recent first by best-available
    /// timestamp, with recipients and labels batch-loaded for the page.
    ///
    /// # Errors
    /// Returns an error when a query fails or a row cannot be decoded.
    pub fn list_messages(&self, offset: i64, limit: i64) -> StoreResult<MessagePage> {
        let op = "list messages";

        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE deleted_from_source_at IS NULL",
                [],
                |row| row.get(0),
            )
            .op(op)?;

        let sql = format!(
            "{SUMMARY_SELECT}
             WHERE m.deleted_from_source_at IS NULL
             ORDER BY COALESCE(m.sent_at, m.received_at, m.internal_date) DESC, m.id DESC
             LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = self.conn.prepare(&sql).op(op)?;
        let mut rows = stmt.query(params![limit, offset]).op(op)?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().op(op)? {
            let (mut summary, activity_at) = scan_summary(row).op(op)?;
            summary.sent_at = parse_rfc3339_opt(activity_at)?;
            messages.push(summary);
        }
        drop(rows);
        drop(stmt);

        self.populate_page(&mut messages)?;
        Ok(MessagePage { messages, total })
    }

    /// Full detail for one active message; `None` when absent or
    /// soft-deleted.
    ///
    /// # Errors
    /// Returns an error when a query fails or a row cannot be decoded.
    pub fn get_message(&self, id: i64) -> StoreResult<Option<MessageDetail>> {
        let op = "get message";

        let sql = format!(
            "{SUMMARY_SELECT} WHERE m.id = ?1 AND m.deleted_from_source_at IS NULL"
        );
        let scanned = self
            .conn
            .query_row(&sql, params![id], scan_summary)
            .optional()
            .op(op)?;

        let Some((mut summary, activity_at)) = scanned else {
            return Ok(None);
        };
        summary.sent_at = parse_rfc3339_opt(activity_at)?;

        let mut page = vec![summary];
        self.populate_page(&mut page)?;
        let Some(summary) = page.pop() else {
            return Ok(None);
        };

        let body: Option<(Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT body_text, body_html FROM message_bodies WHERE message_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .op(op)?;
        let body = match body {
            Some((Some(text), _)) => text,
            Some((None, Some(html))) => html,
            _ => String::new(),
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT filename, mime_type, size FROM attachments
                 WHERE message_id = ?1 ORDER BY id",
            )
            .op(op)?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(AttachmentInfo {
                    filename: row.get(0)?,
                    mime_type: row.get(1)?,
                    size: row.get(2)?,
                })
            })
            .op(op)?;
        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row.op(op)?);
        }

        Ok(Some(MessageDetail { summary, body, attachments }))
    }

    /// Search active messages through the selected backend (full-text index
    /// or escaped pattern matching), hydrating one page of summaries in
    /// ranked order.
    ///
    /// # Errors
    /// Returns an error when the search or the hydration queries fail.
    pub fn search_messages(
        &self,
        query: &str,
        offset: i64,
        limit: i64,
    ) -> StoreResult<MessagePage> {
        let op = "search messages";
        let page = self.search.search_page(&self.conn, query, offset, limit)?;
        if page.ids.is_empty() {
            return Ok(MessagePage { messages: Vec::new(), total: page.total });
        }

        let mut by_id: HashMap<i64, MessageSummary> = HashMap::with_capacity(page.ids.len());
        let sql = format!("{SUMMARY_SELECT} WHERE m.id IN ({{ids}})");
        let mut decode_err: Option<crate::StoreError> = None;
        query_in_chunks(&self.conn, op, &page.ids, &[], &sql, |row| {
            let (mut summary, activity_at) = scan_summary(row)?;
            match parse_rfc3339_opt(activity_at) {
                Ok(activity) => summary.sent_at = activity,
                Err(err) => decode_err = Some(err),
            }
            by_id.insert(summary.id, summary);
            Ok(())
        })?;
        if let Some(err) = decode_err {
            return Err(err);
        }

        let mut messages: Vec<MessageSummary> =
            page.ids.iter().filter_map(|id| by_id.remove(id)).collect();
        self.populate_page(&mut messages)?;
        Ok(MessagePage { messages, total: page.total })
    }

    /// Batch-load `to` recipients and label names for one page of summaries.
    fn populate_page(&self, messages: &mut [MessageSummary]) -> StoreResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = messages.iter().map(|message| message.id).collect();

        let mut recipients: HashMap<i64, Vec<String>> = HashMap::new();
        query_in_chunks(
            &self.conn,
            "batch load recipients",
            &ids,
            &[],
            "SELECT mr.message_id, COALESCE(p.email_address, p.phone_number, '')
             FROM message_recipients mr
             JOIN participants p ON p.id = mr.participant_id
             WHERE mr.recipient_type = 'to' AND mr.message_id IN ({ids})",
            |row| {
                let message_id: i64 = row.get(0)?;
                let address: String = row.get(1)?;
                if !address.is_empty() {
                    recipients.entry(message_id).or_default().push(address);
                }
                Ok(())
            },
        )?;

        let mut labels: HashMap<i64, Vec<String>> = HashMap::new();
        query_in_chunks(
            &self.conn,
            "batch load labels",
            &ids,
            &[],
            "SELECT ml.message_id, l.name
             FROM message_labels ml
             JOIN labels l ON l.id = ml.label_id
             WHERE ml.message_id IN ({ids})",
            |row| {
                let message_id: i64 = row.get(0)?;
                labels.entry(message_id).or_default().push(row.get(1)?);
                Ok(())
            },
        )?;

        for message in messages {
            if let Some(to) = recipients.remove(&message.id) {
                message.to = to;
            }
            if let Some(names) = labels.remove(&message.id) {
                message.labels = names;
            }
        }
        Ok(())
    }

    /// Detailed facts about one message by its source message id,
    /// consolidating the queries test assertions need.
    ///
    /// # Errors
    /// Returns [`crate::StoreError::NotFound`] when no message carries the
    /// given source message id, or another error when a query fails.
    pub fn inspect_message(&self, source_message_id: &str) -> StoreResult<MessageInspection> {
        let op = "inspect message";

        let base: Option<(Option<String>, Option<String>, Option<String>, String, i64)> = self
            .conn
            .query_row(
                "SELECT m.sent_at, m.internal_date, m.deleted_from_source_at,
                        c.source_conversation_id, m.id
                 FROM messages m
                 JOIN conversations c ON m.conversation_id = c.id
                 WHERE m.source_message_id = ?1",
                params![source_message_id],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                },
            )
            .optional()
            .op(op)?;

        let Some((sent_at, internal_date, deleted_at, conversation_source_id, message_id)) = base
        else {
            return Err(crate::StoreError::not_found("message", source_message_id));
        };

        let mut inspection = MessageInspection {
            sent_at,
            internal_date,
            deleted_from_source: deleted_at.is_some(),
            conversation_source_id,
            ..MessageInspection::default()
        };

        inspection.body_text = self
            .conn
            .query_row(
                "SELECT body_text FROM message_bodies WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()
            .op(op)?
            .flatten();

        let raw: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM message_raw WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()
            .op(op)?;
        inspection.raw_data_exists = raw.is_some();

        let mut stmt = self
            .conn
            .prepare(
                "SELECT recipient_type, COUNT(*) FROM message_recipients
                 WHERE message_id = ?1 GROUP BY recipient_type",
            )
            .op(op)?;
        let mut rows = stmt.query(params![message_id]).op(op)?;
        while let Some(row) = rows.next().op(op)? {
            let recipient_type: String = row.get(0).op(op)?;
            let count: i64 = row.get(1).op(op)?;
            inspection
                .recipient_counts
                .insert(recipient_type, usize::try_from(count).unwrap_or(0));
        }

        Ok(inspection)
    }
}
