//! Schema bootstrap and database statistics.

use serde::{Deserialize, Serialize};

use crate::error::{is_missing_fts5, is_missing_table, SqlContext, StoreError, StoreResult};
use crate::{search, Store};

const BASE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sources (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_type TEXT NOT NULL,
  identifier TEXT NOT NULL,
  display_name TEXT,
  last_sync_at TEXT,
  sync_cursor TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (source_type, identifier)
);

CREATE TABLE IF NOT EXISTS participants (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email_address TEXT,
  phone_number TEXT,
  display_name TEXT,
  domain TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_participants_email
  ON participants(email_address) WHERE email_address IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_participants_phone
  ON participants(phone_number) WHERE phone_number IS NOT NULL;

CREATE TABLE IF NOT EXISTS participant_identifiers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  participant_id INTEGER NOT NULL REFERENCES participants(id),
  identifier_type TEXT NOT NULL,
  identifier_value TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (identifier_type, identifier_value)
);

CREATE TABLE IF NOT EXISTS conversations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
  source_conversation_id TEXT NOT NULL,
  conversation_type TEXT,
  title TEXT,
  message_count INTEGER NOT NULL DEFAULT 0,
  participant_count INTEGER NOT NULL DEFAULT 0,
  last_message_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (source_id, source_conversation_id)
);

CREATE TABLE IF NOT EXISTS conversation_participants (
  conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
  participant_id INTEGER NOT NULL REFERENCES participants(id),
  PRIMARY KEY (conversation_id, participant_id)
);

CREATE TABLE IF NOT EXISTS messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
  source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
  source_message_id TEXT NOT NULL,
  message_type TEXT NOT NULL DEFAULT 'email',
  sent_at TEXT,
  received_at TEXT,
  internal_date TEXT,
  sender_id INTEGER REFERENCES participants(id),
  reply_to_message_id INTEGER REFERENCES messages(id) ON DELETE SET NULL,
  is_from_me INTEGER NOT NULL DEFAULT 0,
  subject TEXT,
  snippet TEXT,
  size_estimate INTEGER NOT NULL DEFAULT 0,
  has_attachments INTEGER NOT NULL DEFAULT 0,
  attachment_count INTEGER NOT NULL DEFAULT 0,
  deleted_from_source_at TEXT,
  archived_at TEXT NOT NULL,
  UNIQUE (source_id, source_message_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id);
CREATE INDEX IF NOT EXISTS idx_messages_activity
  ON messages(COALESCE(sent_at, received_at, internal_date));

CREATE TABLE IF NOT EXISTS message_bodies (
  message_id INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
  body_text TEXT,
  body_html TEXT
);

CREATE TABLE IF NOT EXISTS message_raw (
  message_id INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
  raw_data BLOB NOT NULL,
  raw_format TEXT NOT NULL,
  compression TEXT
);

CREATE TABLE IF NOT EXISTS message_recipients (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
  participant_id INTEGER NOT NULL REFERENCES participants(id),
  recipient_type TEXT NOT NULL CHECK (recipient_type IN ('from','to','cc','bcc','mention')),
  display_name TEXT,
  UNIQUE (message_id, participant_id, recipient_type)
);

CREATE INDEX IF NOT EXISTS idx_message_recipients_participant
  ON message_recipients(participant_id);

CREATE TABLE IF NOT EXISTS labels (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_id INTEGER REFERENCES sources(id) ON DELETE CASCADE,
  source_label_id TEXT,
  name TEXT NOT NULL,
  label_type TEXT CHECK (label_type IN ('system','user')),
  UNIQUE (source_id, source_label_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_labels_user_name
  ON labels(name) WHERE source_id IS NULL;

CREATE TABLE IF NOT EXISTS message_labels (
  message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
  label_id INTEGER NOT NULL REFERENCES labels(id) ON DELETE CASCADE,
  PRIMARY KEY (message_id, label_id)
);

CREATE TABLE IF NOT EXISTS attachments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
  filename TEXT,
  mime_type TEXT,
  storage_path TEXT,
  content_hash TEXT NOT NULL,
  size INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  UNIQUE (message_id, content_hash)
);

CREATE TABLE IF NOT EXISTS reactions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
  participant_id INTEGER NOT NULL REFERENCES participants(id),
  reaction_type TEXT NOT NULL,
  reaction_value TEXT,
  created_at TEXT NOT NULL,
  UNIQUE (message_id, participant_id, reaction_type, reaction_value)
);

CREATE TABLE IF NOT EXISTS sync_runs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
  started_at TEXT NOT NULL,
  completed_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  messages_processed INTEGER NOT NULL DEFAULT 0,
  messages_added INTEGER NOT NULL DEFAULT 0,
  messages_updated INTEGER NOT NULL DEFAULT 0,
  errors_count INTEGER NOT NULL DEFAULT 0,
  error_message TEXT,
  cursor_before TEXT,
  cursor_after TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_runs_source ON sync_runs(source_id, status);

CREATE TABLE IF NOT EXISTS sync_checkpoints (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
  sync_run_id INTEGER NOT NULL REFERENCES sync_runs(id) ON DELETE CASCADE,
  page_token TEXT NOT NULL,
  messages_processed INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);
";

pub(crate) const FTS_SCHEMA_SQL: &str = r"
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
  message_id UNINDEXED,
  subject,
  body,
  from_addr,
  to_addr,
  cc_addr
);
";

/// Row counts per entity plus the database file size.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Stats {
    pub message_count: i64,
    pub conversation_count: i64,
    pub participant_count: i64,
    pub attachment_count: i64,
    pub label_count: i64,
    pub source_count: i64,
    pub database_size: i64,
}

impl Store {
    /// Create all base tables and indexes, then attempt the optional FTS5
    /// virtual table. Safe to call repeatedly. A missing FTS5 module flips
    /// the store into degraded pattern search instead of failing.
    ///
    /// # Errors
    /// Returns an error when base schema creation fails, or when the FTS
    /// schema fails for any reason other than a missing FTS5 module.
    pub fn init_schema(&mut self) -> StoreResult<()> {
        self.conn.execute_batch(BASE_SCHEMA_SQL).op("create base schema")?;

        if let Err(err) = self.conn.execute_batch(FTS_SCHEMA_SQL) {
            if !is_missing_fts5(&err) {
                return Err(StoreError::from_sqlite("create fts schema", err));
            }
            tracing::warn!("FTS5 unavailable; search degraded to pattern matching");
        }

        self.search = search::select_backend(&self.conn)?;
        Ok(())
    }

    /// Row counts for the main entities. Missing tables (schema not yet
    /// initialized) count as zero rather than erroring.
    ///
    /// # Errors
    /// Returns an error when a count query fails for any other reason, or
    /// when the database file cannot be stat'ed.
    pub fn stats(&self) -> StoreResult<Stats> {
        let mut stats = Stats::default();

        let counts: [(&str, &mut i64); 6] = [
            ("SELECT COUNT(*) FROM messages WHERE deleted_from_source_at IS NULL", &mut stats.message_count),
            ("SELECT COUNT(*) FROM conversations", &mut stats.conversation_count),
            ("SELECT COUNT(*) FROM participants", &mut stats.participant_count),
            ("SELECT COUNT(*) FROM attachments", &mut stats.attachment_count),
            ("SELECT COUNT(*) FROM labels", &mut stats.label_count),
            ("SELECT COUNT(*) FROM sources", &mut stats.source_count),
        ];

        for (sql, dest) in counts {
            match self.conn.query_row(sql, [], |row| row.get::<_, i64>(0)) {
                Ok(count) => *dest = count,
                Err(err) if is_missing_table(&err) => {}
                Err(err) => return Err(StoreError::from_sqlite("collect stats", err)),
            }
        }

        if let Ok(meta) = std::fs::metadata(&self.db_path) {
            stats.database_size = i64::try_from(meta.len()).unwrap_or(i64::MAX);
        }

        Ok(stats)
    }
}
