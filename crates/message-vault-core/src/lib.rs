use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ModelError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Where a message's recipient sits on the envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecipientType {
    From,
    To,
    Cc,
    Bcc,
    Mention,
}

impl RecipientType {
    pub const ALL: [Self; 5] = [Self::From, Self::To, Self::Cc, Self::Bcc, Self::Mention];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::From => "from",
            Self::To => "to",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
            Self::Mention => "mention",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "from" => Some(Self::From),
            "to" => Some(Self::To),
            "cc" => Some(Self::Cc),
            "bcc" => Some(Self::Bcc),
            "mention" => Some(Self::Mention),
            _ => None,
        }
    }
}

impl Display for RecipientType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Email,
    Chat,
}

impl MessageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Chat => "chat",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "email" => Some(Self::Email),
            "chat" => Some(Self::Chat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    System,
    User,
}

impl LabelKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// One imported account/platform instance (a mailbox, a chat export, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: i64,
    pub source_type: String,
    pub identifier: String,
    pub display_name: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_sync_at: Option<OffsetDateTime>,
    pub sync_cursor: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A person, deduplicated globally by email or phone. Participants are
/// shared across sources and never owned by one of them.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Participant {
    pub id: i64,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    pub domain: Option<String>,
}

/// An address as importers hand it to the store: at least one of email or
/// phone identifies the person.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Address {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub display_name: Option<String>,
}

impl Address {
    #[must_use]
    pub fn email(email: impl Into<String>, display_name: impl Into<String>) -> Self {
        let display_name: String = display_name.into();
        Self {
            email: Some(email.into()),
            phone: None,
            display_name: (!display_name.is_empty()).then_some(display_name),
        }
    }

    #[must_use]
    pub fn phone(phone: impl Into<String>, display_name: impl Into<String>) -> Self {
        let display_name: String = display_name.into();
        Self {
            email: None,
            phone: Some(phone.into()),
            display_name: (!display_name.is_empty()).then_some(display_name),
        }
    }

    /// The domain part of the email address, when there is one.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.email.as_deref().and_then(|email| email.rsplit_once('@').map(|(_, domain)| domain))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: i64,
    pub source_id: i64,
    pub source_conversation_id: String,
    pub conversation_type: Option<String>,
    pub title: Option<String>,
    pub message_count: i64,
    pub participant_count: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Label {
    pub id: i64,
    pub source_id: Option<i64>,
    pub source_label_id: Option<String>,
    pub name: String,
    pub label_type: Option<LabelKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Attachment {
    pub id: i64,
    pub message_id: i64,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub storage_path: Option<String>,
    pub content_hash: String,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reaction {
    pub id: i64,
    pub message_id: i64,
    pub participant_id: i64,
    pub reaction_type: String,
    pub reaction_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRun {
    pub id: i64,
    pub source_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub status: SyncStatus,
    pub messages_processed: i64,
    pub messages_added: i64,
    pub messages_updated: i64,
    pub errors_count: i64,
    pub error_message: Option<String>,
    pub cursor_before: Option<String>,
    pub cursor_after: Option<String>,
}

/// Progress saved mid-run so an interrupted ingestion can resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncCheckpoint {
    pub page_token: String,
    pub messages_processed: i64,
    pub messages_added: i64,
    pub messages_updated: i64,
    pub errors_count: i64,
}

/// One recipient entry of a normalized message, already resolved to a
/// participant surrogate id.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecipientInput {
    pub recipient_type: RecipientType,
    pub participant_id: i64,
    pub display_name: Option<String>,
}

/// The normalized record importers submit for atomic persistence: the
/// message row plus its body, optional raw payload, per-type recipient
/// lists, and label set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageInput {
    pub conversation_id: i64,
    pub source_id: i64,
    pub source_message_id: String,
    pub kind: MessageKind,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub sent_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub received_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub internal_date: Option<OffsetDateTime>,
    pub sender_id: Option<i64>,
    pub reply_to_message_id: Option<i64>,
    pub is_from_me: bool,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub size_estimate: i64,
    pub has_attachments: bool,
    pub attachment_count: i64,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    #[serde(default)]
    pub raw: Option<Vec<u8>>,
    #[serde(default)]
    pub recipients: Vec<RecipientInput>,
    #[serde(default)]
    pub label_ids: Vec<i64>,
}

impl MessageInput {
    /// Validate a normalized message before it reaches the store.
    ///
    /// # Errors
    /// Returns [`ModelError::Validation`] when the natural key is missing or
    /// a size/count field is negative.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.source_message_id.trim().is_empty() {
            return Err(ModelError::Validation(
                "source_message_id MUST be provided for every message".to_string(),
            ));
        }

        if self.size_estimate < 0 {
            return Err(ModelError::Validation("size_estimate MUST NOT be negative".to_string()));
        }

        if self.attachment_count < 0 {
            return Err(ModelError::Validation(
                "attachment_count MUST NOT be negative".to_string(),
            ));
        }

        if self.has_attachments && self.attachment_count == 0 {
            return Err(ModelError::Validation(
                "has_attachments requires a positive attachment_count".to_string(),
            ));
        }

        Ok(())
    }

    /// The best-available activity timestamp used for ranking: `sent_at`,
    /// else `received_at`, else `internal_date`.
    #[must_use]
    pub fn ranking_timestamp(&self) -> Option<OffsetDateTime> {
        self.sent_at.or(self.received_at).or(self.internal_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_input() -> MessageInput {
        MessageInput {
            conversation_id: 1,
            source_id: 1,
            source_message_id: "msg-1".to_string(),
            kind: MessageKind::Email,
            sent_at: None,
            received_at: None,
            internal_date: None,
            sender_id: None,
            reply_to_message_id: None,
            is_from_me: false,
            subject: None,
            snippet: None,
            size_estimate: 0,
            has_attachments: false,
            attachment_count: 0,
            body_text: None,
            body_html: None,
            raw: None,
            recipients: Vec::new(),
            label_ids: Vec::new(),
        }
    }

    #[test]
    fn recipient_type_round_trips_through_strings() {
        for recipient_type in RecipientType::ALL {
            assert_eq!(RecipientType::parse(recipient_type.as_str()), Some(recipient_type));
        }
        assert_eq!(RecipientType::parse("reply-to"), None);
    }

    #[test]
    fn sync_status_round_trips_through_strings() {
        for status in [SyncStatus::Running, SyncStatus::Completed, SyncStatus::Failed] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn address_domain_comes_from_email() {
        let address = Address::email("ada@example.com", "Ada");
        assert_eq!(address.domain(), Some("example.com"));
        assert_eq!(Address::phone("+15550100", "").domain(), None);
    }

    #[test]
    fn empty_display_name_is_dropped() {
        assert_eq!(Address::email("ada@example.com", "").display_name, None);
    }

    #[test]
    fn validate_rejects_blank_natural_key() {
        let mut input = minimal_input();
        input.source_message_id = "  ".to_string();
        assert!(input.validate().is_err());
    }

    #[test]
    fn validate_rejects_attachment_flag_without_count() {
        let mut input = minimal_input();
        input.has_attachments = true;
        assert!(input.validate().is_err());
        input.attachment_count = 2;
        assert!(input.validate().is_ok());
    }

    #[test]
    fn ranking_timestamp_prefers_sent_then_received_then_internal() {
        let sent = OffsetDateTime::from_unix_timestamp(3_000).ok();
        let received = OffsetDateTime::from_unix_timestamp(2_000).ok();
        let internal = OffsetDateTime::from_unix_timestamp(1_000).ok();

        let mut input = minimal_input();
        input.internal_date = internal;
        assert_eq!(input.ranking_timestamp(), internal);

        input.received_at = received;
        assert_eq!(input.ranking_timestamp(), received);

        input.sent_at = sent;
        assert_eq!(input.ranking_timestamp(), sent);
    }
}
