//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The envelope wire format shared by calls, commands and replies
//! - The outbound [`Transport`] and its lapin-backed publisher
//! - Connection setup with retry
//!
//! ## Architecture
//!
//! ```text
//! Producer ──call──► request queue ──► (remote service)
//!                                          │
//! Consumer loop ◄── inbound queue ◄──reply─┘
//! ```

pub mod connection;
pub mod publisher;
pub mod types;

pub use connection::{connect_with_retry, retry_with_backoff, RetryPolicy};
pub use publisher::{AmqpPublisher, Transport};
pub use types::{CommandResult, Envelope, Inbound, MessageData, REPLY_TYPE};
