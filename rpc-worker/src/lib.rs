//! Talentflow worker - request/reply correlation over RabbitMQ.
//!
//! Lets code call another service and wait for its answer over a broker
//! that only moves fire-and-forget messages, and executes the commands
//! other services send to this one.
//!
//! ## Architecture
//!
//! ```text
//! HTTP → Producer ──► request queue            inbound queue ──► Consumer loop
//!           ▲                                                    │        │
//!           └──────────── CorrelationRegistry ◄── reply ─────────┘        │
//!                                                           command ──► Dispatcher ──► replyTo
//! ```

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod rpc;
pub mod web;

#[cfg(test)]
pub(crate) mod testkit;

// Re-export commonly used types
pub use config::Config;
pub use consumer::{AckMode, ConsumerStats, Delivered, Handled, Worker};
pub use dispatch::{Command, Dispatcher, HttpManpowerRequests, MailgunMailer};
pub use error::{CallError, CommandError, EnvelopeError, RegistryError};
pub use queue::{AmqpPublisher, CommandResult, Envelope, Inbound, MessageData, Transport};
pub use rpc::{CorrelationRegistry, Producer};
