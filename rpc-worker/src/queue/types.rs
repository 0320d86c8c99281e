//! Wire types for the request/reply fabric.
//!
//! Calls, commands and replies all travel as the same JSON object:
//!
//! ```text
//! { "id": "...", "messageType": "...", "messageData": { ... }, "replyTo": "..." }
//! ```
//!
//! The `messageType` is read once and decides how the rest of the envelope
//! is interpreted, see [`Inbound`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::EnvelopeError;

/// Discriminator reserved for replies.
pub const REPLY_TYPE: &str = "reply";

/// Open payload carried by every envelope.
pub type MessageData = Map<String, Value>;

/// A message unit exchanged over the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Correlation identifier
    pub id: String,
    /// Command name, or `"reply"`
    pub message_type: String,
    /// Command arguments or reply payload
    #[serde(default, deserialize_with = "null_as_default")]
    pub message_data: MessageData,
    /// Queue the sender listens on for the answer
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub reply_to: String,
}

impl Envelope {
    /// Build an outbound call.
    pub fn request(
        id: impl Into<String>,
        message_type: impl Into<String>,
        message_data: MessageData,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            message_type: message_type.into(),
            message_data,
            reply_to: reply_to.into(),
        }
    }

    /// Build the reply to the call identified by `id`.
    pub fn reply(id: impl Into<String>, result: CommandResult) -> Self {
        Self {
            id: id.into(),
            message_type: REPLY_TYPE.to_string(),
            message_data: result.into_data(),
            reply_to: String::new(),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.message_type == REPLY_TYPE
    }

    /// Decode raw delivery bytes and classify them.
    pub fn decode(body: &[u8]) -> Result<Inbound, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        envelope.classify()
    }

    /// Split an envelope into a reply or a command based on its type.
    pub fn classify(self) -> Result<Inbound, EnvelopeError> {
        if self.id.trim().is_empty() {
            return Err(EnvelopeError::MissingId);
        }
        if self.message_type.trim().is_empty() {
            return Err(EnvelopeError::MissingType);
        }

        if self.is_reply() {
            Ok(Inbound::Reply {
                id: self.id,
                data: self.message_data,
            })
        } else {
            Ok(Inbound::Command(self))
        }
    }
}

/// What the consumer loop received.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Someone answering a call this process made
    Reply { id: String, data: MessageData },
    /// New work this process must execute
    Command(Envelope),
}

/// Outcome of a dispatched command, carried back as the reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    Success(String),
    Failure(String),
}

impl CommandResult {
    pub fn success() -> Self {
        CommandResult::Success("success".to_string())
    }

    pub fn failure(reason: impl ToString) -> Self {
        CommandResult::Failure(reason.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandResult::Success(_))
    }

    /// Render as `{"message": ...}` or `{"error": ...}`.
    pub fn into_data(self) -> MessageData {
        let mut data = MessageData::new();
        match self {
            CommandResult::Success(message) => {
                data.insert("message".to_string(), Value::String(message));
            }
            CommandResult::Failure(error) => {
                data.insert("error".to_string(), Value::String(error));
            }
        }
        data
    }

    /// Read a reply payload back. An `error` key wins over `message`.
    pub fn from_data(data: &MessageData) -> Option<Self> {
        if let Some(error) = data.get("error") {
            return Some(CommandResult::Failure(value_text(error)));
        }
        data.get("message")
            .map(|message| CommandResult::Success(value_text(message)))
    }
}

/// Peers encode an empty payload as `null`; read it as the empty value.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
