//! SQLite-backed storage engine for the message archive: schema bootstrap,
//! natural-key upserts, transactional message persistence, full-text index
//! maintenance with graceful degradation, lifecycle management, and
//! dependency-ordered subset extraction.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use time::OffsetDateTime;

mod chunk;
mod error;
mod messages;
mod reads;
mod schema;
mod search;
mod sources;
mod subset;
mod sync;

pub use error::{BatchFailure, StoreError, StoreResult};
pub use messages::attachment_content_hash;
pub use reads::{AttachmentInfo, MessageDetail, MessageInspection, MessagePage, MessageSummary};
pub use sources::ResetProgress;
pub use schema::Stats;
pub use search::SearchPage;
pub use subset::{copy_subset, CopyResult, SUBSET_DB_FILE};

use error::SqlContext;
use search::SearchBackend;

/// Handle to one archive database. Single-writer: mutating operations take
/// `&mut self`; lock contention against other processes is absorbed by the
/// connection's busy timeout rather than retried here.
pub struct Store {
    conn: Connection,
    db_path: PathBuf,
    search: Box<dyn SearchBackend>,
}

impl Store {
    /// Open or create the archive database at `path`, configuring
    /// write-ahead durability, foreign keys, and a bounded lock wait.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created or the
    /// database cannot be opened and configured.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| StoreError::from_io("create db directory", err))?;
            }
        }

        let conn = Connection::open(path).op("open database")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .op("configure pragmas")?;

        let search = search::select_backend(&conn)?;
        Ok(Self { conn, db_path: path.to_path_buf(), search })
    }

    /// Whether full-text indexing is active, as opposed to the escaped
    /// pattern-matching fallback.
    #[must_use]
    pub fn search_indexed(&self) -> bool {
        self.search.is_indexed()
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> StoreResult<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Encoding(format!("failed to format RFC3339 timestamp: {err}")))
}

pub(crate) fn rfc3339_opt(value: Option<OffsetDateTime>) -> StoreResult<Option<String>> {
    value.map(rfc3339).transpose()
}

pub(crate) fn parse_rfc3339(value: &str) -> StoreResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Encoding(format!("invalid RFC3339 timestamp {value:?}: {err}")))
}

pub(crate) fn parse_rfc3339_opt(value: Option<String>) -> StoreResult<Option<OffsetDateTime>> {
    value.as_deref().map(parse_rfc3339).transpose()
}

pub(crate) fn now_rfc3339() -> StoreResult<String> {
    rfc3339(OffsetDateTime::now_utc())
}
