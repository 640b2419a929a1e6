use serde::{Deserialize, Serialize};

use crate::phone;

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// One text message, as stored in the mailbox tree.
///
/// The on-disk encoding is a JSON object carrying only the fields that are
/// set; readers must accept absent keys (never `null`). Exactly one of
/// `recipient` / `sender` is set on a well-formed message, and that is
/// what decides the [`Direction`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_user: Option<String>,
    /// E.164 number, present iff the message is outbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Sender identifier, present iff the message is inbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// ISO-8601 UTC, `T` separator, no timezone suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// When the message arrived locally; inbound only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Filename assigned when the message was persisted.
    #[serde(skip)]
    pub filename: String,
    /// Set while a copy of this message still sits in the outbox.
    #[serde(skip)]
    pub not_yet_sent: bool,
}

impl Message {
    pub fn direction(&self) -> Direction {
        if self.recipient.is_some() {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    /// A message is valid only with exactly one of recipient / sender.
    pub fn is_valid(&self) -> bool {
        self.recipient.is_some() != self.sender.is_some()
    }

    /// The wire form sent over the satellite link:
    /// `<recipient>:<body>` as UTF-8 bytes.
    ///
    /// Returns `None` for a message without a recipient.
    pub fn sbd_payload(&self) -> Option<Vec<u8>> {
        let recipient = self.recipient.as_deref()?;
        let body = self.body.as_deref().unwrap_or("");
        Some(format!("{}:{}", recipient, body).into_bytes())
    }

    /// Recipient formatted for display.
    pub fn recipient_printable(&self) -> Option<String> {
        self.recipient.as_deref().map(phone::printable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbd_payload() {
        let msg = Message {
            recipient: Some("18008008000".to_string()),
            ..Default::default()
        };
        assert_eq!(msg.sbd_payload().unwrap(), b"18008008000:");

        let msg = Message {
            recipient: Some("18008008000".to_string()),
            body: Some("Hi".to_string()),
            ..Default::default()
        };
        assert_eq!(msg.sbd_payload().unwrap(), b"18008008000:Hi");
    }

    #[test]
    fn sbd_payload_missing_recipient() {
        let msg = Message {
            sender: Some("alice".to_string()),
            body: Some("hi".to_string()),
            ..Default::default()
        };
        assert_eq!(msg.sbd_payload(), None);
    }

    #[test]
    fn direction_follows_recipient() {
        let out = Message {
            recipient: Some("+14158008000".to_string()),
            ..Default::default()
        };
        assert_eq!(out.direction(), Direction::Outbound);
        assert!(out.is_valid());

        let inbound = Message {
            sender: Some("alice".to_string()),
            ..Default::default()
        };
        assert_eq!(inbound.direction(), Direction::Inbound);
        assert!(inbound.is_valid());

        let neither = Message::default();
        assert!(!neither.is_valid());
    }

    #[test]
    fn json_skips_unset_fields() {
        let msg = Message {
            local_user: Some("local".to_string()),
            recipient: Some("+14158008000".to_string()),
            timestamp: Some("2018-01-02T03:04:05.000001".to_string()),
            body: Some("Hi".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("sender"));
        assert!(!json.contains("received_at"));
        assert!(!json.contains("null"));
        assert!(!json.contains("not_yet_sent"));

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.recipient.as_deref(), Some("+14158008000"));
        assert_eq!(back.sender, None);
        assert!(!back.not_yet_sent);
    }
}
