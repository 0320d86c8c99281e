//! Blocking-style calls over the fire-and-forget broker.

use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CallError;
use crate::queue::{Envelope, MessageData, Transport};
use crate::rpc::CorrelationRegistry;

/// Issues calls and waits for their replies.
///
/// Replies only reach the caller if this process also runs the consumer
/// loop on `reply_queue`, sharing the same [`CorrelationRegistry`].
pub struct Producer<T> {
    transport: T,
    registry: CorrelationRegistry,
    request_queue: String,
    reply_queue: String,
}

/// Removes the pending entry however the call ends, including when the
/// calling future is dropped mid-wait.
struct CancelOnDrop<'a> {
    registry: &'a CorrelationRegistry,
    id: &'a str,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.cancel(self.id);
    }
}

impl<T: Transport> Producer<T> {
    pub fn new(
        transport: T,
        registry: CorrelationRegistry,
        request_queue: impl Into<String>,
        reply_queue: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            registry,
            request_queue: request_queue.into(),
            reply_queue: reply_queue.into(),
        }
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Publish a `message_type` call and wait up to `timeout` for its reply.
    ///
    /// No retry happens here; a timed-out call is simply reported.
    pub async fn call(
        &self,
        message_type: &str,
        data: MessageData,
        timeout: Duration,
    ) -> Result<MessageData, CallError> {
        let id = Uuid::new_v4().to_string();

        // Register before publishing so a fast reply can't beat us.
        let reply = self.registry.register(&id)?;
        let _guard = CancelOnDrop {
            registry: &self.registry,
            id: &id,
        };

        let envelope = Envelope::request(id.as_str(), message_type, data, self.reply_queue.as_str());

        if let Err(reason) = self.transport.publish(&self.request_queue, &envelope).await {
            warn!(id = %id, message_type = message_type, error = %reason, "call_publish_failed");
            return Err(CallError::Publish {
                id: id.clone(),
                reason,
            });
        }

        info!(
            id = %id,
            message_type = message_type,
            queue = %self.request_queue,
            timeout_ms = timeout.as_millis() as u64,
            "call_published"
        );

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(data)) => {
                info!(id = %id, message_type = message_type, "call_replied");
                Ok(data)
            }
            Ok(Err(_)) => {
                warn!(id = %id, message_type = message_type, "call_abandoned");
                Err(CallError::Abandoned { id: id.clone() })
            }
            Err(_) => {
                warn!(
                    id = %id,
                    message_type = message_type,
                    timeout_ms = timeout.as_millis() as u64,
                    "call_timed_out"
                );
                Err(CallError::Timeout {
                    id: id.clone(),
                    timeout,
                })
            }
        }
    }
}
