//! Outbound message representation
//!
//! The delivery core treats everything except the identifier, the sender and the
//! recipients as an opaque payload that is handed to a channel untouched.

use std::{collections::BTreeMap, fmt, str::FromStr, time::SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier for an outbound message
///
/// A ULID, so identifiers sort by creation time and are collision resistant
/// across producer threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId {
    id: ulid::Ulid,
}

impl MessageId {
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    /// Generate a new unique message ID
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }

    /// Milliseconds since the Unix epoch encoded in the identifier
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self::new)
    }
}

/// Delivery priority, ordered from least to most urgent
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown priority: {0}")]
pub struct UnknownPriority(String);

impl FromStr for Priority {
    type Err = UnknownPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(UnknownPriority(s.to_string())),
        }
    }
}

/// A message waiting to be delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub html_body: Option<String>,
    /// References to attachments (paths or provider-side handles)
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub created_at: SystemTime,
}

impl Message {
    /// Create a plain text message with a freshly generated identifier
    #[must_use]
    pub fn new(
        sender: impl Into<String>,
        recipients: Vec<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            sender: sender.into(),
            recipients,
            subject: subject.into(),
            body: body.into(),
            html_body: None,
            attachments: Vec::new(),
            headers: BTreeMap::new(),
            created_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_html_body(mut self, html: impl Into<String>) -> Self {
        self.html_body = Some(html.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The first recipient, used when logging
    pub fn primary_recipient(&self) -> Option<&str> {
        self.recipients.first().map(String::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("URGENT".parse::<Priority>(), Ok(Priority::Urgent));
        assert_eq!("low".parse::<Priority>(), Ok(Priority::Low));
        assert!("whenever".parse::<Priority>().is_err());
    }

    #[test]
    fn test_message_id_roundtrip_through_string() {
        let id = MessageId::generate();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("../not-a-ulid".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_message_builder() {
        let message = Message::new(
            "sender@example.org",
            vec!["a@example.com".to_string(), "b@example.com".to_string()],
            "Subject",
            "Body",
        )
        .with_html_body("<p>Body</p>")
        .with_header("X-Campaign", "spring");

        assert_eq!(message.primary_recipient(), Some("a@example.com"));
        assert_eq!(message.html_body.as_deref(), Some("<p>Body</p>"));
        assert_eq!(
            message.headers.get("X-Campaign").map(String::as_str),
            Some("spring")
        );
    }

    #[test]
    fn test_message_deserialize_defaults() {
        let message: Message = ron::from_str(
            r#"(
                id: "01ARZ3NDEKTSV4RRFFQ69G5FAV",
                sender: "sender@example.org",
                recipients: ["rcpt@example.com"],
                subject: "Hi",
                body: "Hello",
                created_at: (secs_since_epoch: 1700000000, nanos_since_epoch: 0),
            )"#,
        )
        .unwrap();

        pretty_assertions::assert_eq!(message.attachments, Vec::<String>::new());
        assert!(message.html_body.is_none());
        assert_eq!(message.id.to_string(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
    }
}
