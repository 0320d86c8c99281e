//! Error types shared across the correlation engine.

use std::time::Duration;

use thiserror::Error;

/// Failure of a synchronous-style call made through the [`Producer`](crate::rpc::Producer).
#[derive(Debug, Error)]
pub enum CallError {
    #[error("call {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    /// The pending entry was removed without a reply, e.g. by registry expiry.
    #[error("call {id} was abandoned before a reply arrived")]
    Abandoned { id: String },

    #[error("failed to publish call {id}: {reason:#}")]
    Publish { id: String, reason: anyhow::Error },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl CallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("correlation id {0} is already pending")]
    Duplicate(String),
}

/// An inbound message that can't be turned into an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope has an empty id")]
    MissingId,

    #[error("envelope has an empty messageType")]
    MissingType,
}

/// A command whose payload can't be executed. These never stop the worker;
/// they become the `error` text of the reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` must be a string")]
    NotAString(&'static str),

    #[error("field `{0}` must not be empty")]
    Empty(&'static str),

    #[error("invalid {field} `{value}`")]
    InvalidId { field: &'static str, value: String },

    #[error("unknown message type")]
    UnknownType(String),
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail collaborator is not configured: {0}")]
    NotConfigured(&'static str),

    #[error("mail request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("mail provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Free-form failure reported by a mail backend.
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("manpower request {0} not found")]
    NotFound(String),

    #[error("recruitment api rejected clone ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("{0}")]
    Backend(String),
}
