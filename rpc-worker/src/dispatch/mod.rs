//! Command dispatch.
//!
//! Executes the side effect a command names and answers the caller.
//!
//! ## Processing Flow
//!
//! ```text
//! Envelope → Command::parse() → side effect → CommandResult → reply envelope → replyTo
//! ```
//!
//! Side effects are never rolled back: a sent mail stays sent even if the
//! reply can't be published afterwards.

pub mod command;
pub mod mail;
pub mod records;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::queue::{CommandResult, Envelope, Transport};

pub use command::{CloneMpRequest, Command, Retriability, SendMail, CLONE_MP_REQUEST, SEND_MAIL};
pub use mail::{MailgunMailer, Mailer};
pub use records::{HttpManpowerRequests, ManpowerRequest, ManpowerRequests};

/// Maps commands to collaborators and replies through the outbound transport.
pub struct Dispatcher<T, M, R> {
    transport: T,
    mailer: M,
    records: R,
}

impl<T, M, R> Dispatcher<T, M, R>
where
    T: Transport,
    M: Mailer,
    R: ManpowerRequests,
{
    pub fn new(transport: T, mailer: M, records: R) -> Self {
        Self {
            transport,
            mailer,
            records,
        }
    }

    /// Run the command carried by `envelope`. Never fails: every problem
    /// becomes an error-shaped result.
    pub async fn execute(&self, envelope: &Envelope) -> CommandResult {
        let command = match Command::parse(&envelope.message_type, &envelope.message_data) {
            Ok(command) => command,
            Err(e) => {
                warn!(
                    id = %envelope.id,
                    message_type = %envelope.message_type,
                    error = %e,
                    "command_rejected"
                );
                return CommandResult::failure(e);
            }
        };

        info!(
            id = %envelope.id,
            command = command.name(),
            retriability = ?command.retriability(),
            "command_executing"
        );

        match command {
            Command::SendMail(mail) => {
                match self
                    .mailer
                    .send(&mail.from, &mail.to, &mail.subject, &mail.body)
                    .await
                {
                    Ok(()) => CommandResult::success(),
                    Err(e) => {
                        error!(id = %envelope.id, error = %e, "send_mail_failed");
                        CommandResult::failure(e)
                    }
                }
            }
            Command::CloneMpRequest(clone) => {
                match self.records.create_from_clone(clone.clone_id).await {
                    Ok(record) => {
                        info!(
                            id = %envelope.id,
                            clone_id = %clone.clone_id,
                            record_id = %record.id,
                            "clone_mp_request_completed"
                        );
                        CommandResult::success()
                    }
                    Err(e) => {
                        error!(
                            id = %envelope.id,
                            clone_id = %clone.clone_id,
                            error = %e,
                            "clone_mp_request_failed"
                        );
                        CommandResult::failure(e)
                    }
                }
            }
        }
    }

    /// Execute `envelope` and publish the reply to its `replyTo` queue.
    ///
    /// The reply is a one-way emission; nothing is registered for it. The
    /// returned result is what was (or would have been) sent back.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<CommandResult> {
        let result = self.execute(envelope).await;

        if envelope.reply_to.is_empty() {
            warn!(
                id = %envelope.id,
                message_type = %envelope.message_type,
                "reply_dropped_no_reply_to"
            );
            return Ok(result);
        }

        let reply = Envelope::reply(envelope.id.as_str(), result.clone());
        self.transport.publish(&envelope.reply_to, &reply).await?;

        info!(
            id = %envelope.id,
            reply_to = %envelope.reply_to,
            success = result.is_success(),
            "reply_published"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MailError, RecordError};
    use crate::queue::MessageData;
    use crate::testkit::{FailingTransport, FakeMailer, FakeRecords, RecordingTransport};
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn command(message_type: &str, payload: Value, reply_to: &str) -> Envelope {
        let Value::Object(data) = payload else {
            panic!("payload must be an object");
        };
        Envelope::request("cmd-1", message_type, data, reply_to)
    }

    fn mail_payload() -> Value {
        json!({ "to": "a@x.com", "subject": "s", "body": "b", "from": "c@x.com" })
    }

    #[tokio::test]
    async fn test_send_mail_success_replies_to_caller() {
        let transport = RecordingTransport::default();
        let mailer = FakeMailer::ok();
        let dispatcher = Dispatcher::new(transport.clone(), mailer.clone(), FakeRecords::ok());

        let result = dispatcher
            .dispatch(&command(SEND_MAIL, mail_payload(), "caller_queue"))
            .await
            .unwrap();

        assert_eq!(result, CommandResult::success());
        assert_eq!(mailer.sent().len(), 1);
        assert_eq!(mailer.sent()[0].to, vec!["a@x.com".to_string()]);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "caller_queue");
        assert_eq!(sent[0].1.id, "cmd-1");
        assert_eq!(sent[0].1.message_type, "reply");
        assert_eq!(sent[0].1.message_data.get("message"), Some(&json!("success")));
    }

    #[tokio::test]
    async fn test_send_mail_collaborator_error_is_reported() {
        let transport = RecordingTransport::default();
        let mailer = FakeMailer::failing(|| MailError::Backend("smtp down".to_string()));
        let dispatcher = Dispatcher::new(transport.clone(), mailer, FakeRecords::ok());

        let result = dispatcher
            .dispatch(&command(SEND_MAIL, mail_payload(), "caller_queue"))
            .await
            .unwrap();

        assert_eq!(result, CommandResult::Failure("smtp down".to_string()));
        assert_eq!(
            transport.sent()[0].1.message_data.get("error"),
            Some(&json!("smtp down"))
        );
    }

    #[tokio::test]
    async fn test_send_mail_missing_body_skips_mailer() {
        let mailer = FakeMailer::ok();
        let dispatcher = Dispatcher::new(RecordingTransport::default(), mailer.clone(), FakeRecords::ok());

        let payload = json!({ "to": "a@x.com", "subject": "s", "from": "c@x.com" });
        let result = dispatcher.execute(&command(SEND_MAIL, payload, "q")).await;

        match result {
            CommandResult::Failure(reason) => assert!(reason.contains("body")),
            other => panic!("Expected failure, got {:?}", other),
        }
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_clone_invalid_id_skips_records() {
        let records = FakeRecords::ok();
        let dispatcher = Dispatcher::new(RecordingTransport::default(), FakeMailer::ok(), records.clone());

        let result = dispatcher
            .execute(&command(CLONE_MP_REQUEST, json!({ "mpr_clone_id": "12" }), "q"))
            .await;

        assert!(!result.is_success());
        assert!(records.cloned().is_empty());
    }

    #[tokio::test]
    async fn test_clone_success_and_failure() {
        let id = Uuid::new_v4();
        let records = FakeRecords::ok();
        let dispatcher = Dispatcher::new(RecordingTransport::default(), FakeMailer::ok(), records.clone());

        let result = dispatcher
            .execute(&command(CLONE_MP_REQUEST, json!({ "mpr_clone_id": id.to_string() }), "q"))
            .await;
        assert_eq!(result, CommandResult::success());
        assert_eq!(records.cloned(), vec![id]);

        let failing = Dispatcher::new(
            RecordingTransport::default(),
            FakeMailer::ok(),
            FakeRecords::failing(|id| RecordError::NotFound(id.to_string())),
        );
        let result = failing
            .execute(&command(CLONE_MP_REQUEST, json!({ "mpr_clone_id": id.to_string() }), "q"))
            .await;
        assert_eq!(
            result,
            CommandResult::Failure(format!("manpower request {id} not found"))
        );
    }

    #[tokio::test]
    async fn test_unknown_type_still_replies() {
        let transport = RecordingTransport::default();
        let dispatcher = Dispatcher::new(transport.clone(), FakeMailer::ok(), FakeRecords::ok());

        let envelope = Envelope::request("cmd-9", "archive_vacancy", MessageData::new(), "q");
        let result = dispatcher.dispatch(&envelope).await.unwrap();

        assert_eq!(result, CommandResult::Failure("unknown message type".to_string()));
        assert_eq!(transport.sent()[0].1.id, "cmd-9");
    }

    #[tokio::test]
    async fn test_missing_reply_to_executes_without_reply() {
        let transport = RecordingTransport::default();
        let mailer = FakeMailer::ok();
        let dispatcher = Dispatcher::new(transport.clone(), mailer.clone(), FakeRecords::ok());

        let result = dispatcher
            .dispatch(&command(SEND_MAIL, mail_payload(), ""))
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(mailer.sent().len(), 1);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reply_publish_failure_surfaces_after_side_effect() {
        let mailer = FakeMailer::ok();
        let dispatcher = Dispatcher::new(FailingTransport, mailer.clone(), FakeRecords::ok());

        let outcome = dispatcher
            .dispatch(&command(SEND_MAIL, mail_payload(), "caller_queue"))
            .await;

        assert!(outcome.is_err());
        assert_eq!(mailer.sent().len(), 1);
    }
}
