use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::SessionError, transport::Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    User,
    Bot,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::User => f.write_str("You"),
            Sender::Bot => f.write_str("Bot"),
        }
    }
}

/// One line of the chat timeline. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    sender: Sender,
    content: String,
    timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            sender,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Sender::User, content)
    }

    pub fn bot(content: impl Into<String>) -> Self {
        Self::new(Sender::Bot, content)
    }

    pub fn sender(&self) -> Sender {
        self.sender
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// JSON shape used by newer backends; any other fields are ignored.
#[derive(Deserialize)]
struct Envelope {
    message: String,
}

/// Extracts the chat content from a server text payload.
///
/// A JSON object with a string `message` field yields that field. Anything
/// else, including valid JSON without such a field, is used verbatim.
pub fn decode_text(raw: &str) -> String {
    match serde_json::from_str::<Envelope>(raw) {
        Ok(envelope) => envelope.message,
        Err(_) => raw.to_string(),
    }
}

/// Decodes one inbound frame. Binary frames are accepted when they hold
/// UTF-8; otherwise the frame cannot be rendered and is rejected.
pub fn decode_frame(frame: Frame) -> Result<String, SessionError> {
    match frame {
        Frame::Text(text) => Ok(decode_text(&text)),
        Frame::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Ok(decode_text(&text)),
            Err(err) => Err(SessionError::MalformedPayload {
                detail: format!("binary frame is not UTF-8 ({err})"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_is_content() {
        assert_eq!(decode_text("hi"), "hi");
    }

    #[test]
    fn json_envelope_yields_message_field() {
        assert_eq!(decode_text(r#"{"message":"hi","extra":1}"#), "hi");
    }

    #[test]
    fn json_without_message_field_is_literal_text() {
        assert_eq!(decode_text(r#"{"foo":"bar"}"#), r#"{"foo":"bar"}"#);
    }

    #[test]
    fn non_string_message_field_is_literal_text() {
        let raw = r#"{"message":42}"#;
        assert_eq!(decode_text(raw), raw);
        assert_eq!(decode_text("[1,2,3]"), "[1,2,3]");
    }

    #[test]
    fn utf8_binary_frame_decodes_like_text() {
        let frame = Frame::Binary(br#"{"message":"from bytes"}"#.to_vec());
        assert_eq!(decode_frame(frame).expect("decodes"), "from bytes");
    }

    #[test]
    fn invalid_utf8_binary_frame_is_malformed() {
        let result = decode_frame(Frame::Binary(vec![0xff, 0xfe, 0x00]));
        assert!(matches!(result, Err(SessionError::MalformedPayload { .. })));
    }

    #[test]
    fn sender_labels_match_the_chat_view() {
        let message = ChatMessage::user("What is X?");
        assert_eq!(message.sender().to_string(), "You");
        assert_eq!(Sender::Bot.to_string(), "Bot");
        assert_eq!(message.content(), "What is X?");
    }
}
