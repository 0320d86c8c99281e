//! Typed commands parsed out of an envelope's open payload.

use serde_json::Value;
use uuid::Uuid;

use crate::error::CommandError;
use crate::queue::MessageData;

pub const SEND_MAIL: &str = "send_mail";
pub const CLONE_MP_REQUEST: &str = "clone_mp_request";

/// How a command may be treated if it ends up running more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retriability {
    /// Re-running repeats the side effect. Never redeliver.
    AtMostOnce,
    /// Re-running with the same arguments is harmless. No current command
    /// qualifies; a command lands here only once its collaborator
    /// deduplicates on the caller's id.
    Idempotent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneMpRequest {
    pub clone_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendMail(SendMail),
    CloneMpRequest(CloneMpRequest),
}

impl Command {
    /// Validate `data` against the shape `message_type` requires.
    pub fn parse(message_type: &str, data: &MessageData) -> Result<Self, CommandError> {
        match message_type {
            SEND_MAIL => {
                let to = split_recipients(required_str(data, "to")?);
                if to.is_empty() {
                    return Err(CommandError::Empty("to"));
                }

                Ok(Command::SendMail(SendMail {
                    to,
                    subject: required_str(data, "subject")?.to_string(),
                    body: required_str(data, "body")?.to_string(),
                    from: required_str(data, "from")?.to_string(),
                }))
            }
            CLONE_MP_REQUEST => {
                let raw = required_str(data, "mpr_clone_id")?;
                let clone_id = Uuid::parse_str(raw.trim()).map_err(|_| CommandError::InvalidId {
                    field: "mpr_clone_id",
                    value: raw.to_string(),
                })?;

                Ok(Command::CloneMpRequest(CloneMpRequest { clone_id }))
            }
            other => Err(CommandError::UnknownType(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SendMail(_) => SEND_MAIL,
            Command::CloneMpRequest(_) => CLONE_MP_REQUEST,
        }
    }

    /// Mail has no inverse. Cloning creates a fresh record on every run
    /// because the recruitment API doesn't deduplicate by source id.
    pub fn retriability(&self) -> Retriability {
        match self {
            Command::SendMail(_) => Retriability::AtMostOnce,
            Command::CloneMpRequest(_) => Retriability::AtMostOnce,
        }
    }
}

fn required_str<'a>(data: &'a MessageData, field: &'static str) -> Result<&'a str, CommandError> {
    match data.get(field) {
        None | Some(Value::Null) => Err(CommandError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(CommandError::NotAString(field)),
    }
}

fn split_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
