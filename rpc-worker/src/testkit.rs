//! In-memory stand-ins for the broker and collaborators used by unit tests.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use uuid::Uuid;

use crate::consumer::Delivered;
use crate::dispatch::{Mailer, ManpowerRequest, ManpowerRequests};
use crate::error::{MailError, RecordError};
use crate::queue::{Envelope, Transport};

/// Records every ack by delivery tag.
#[derive(Clone, Default)]
pub struct AckLog(Arc<Mutex<Vec<u64>>>);

impl AckLog {
    pub fn count(&self, tag: u64) -> usize {
        self.0.lock().unwrap().iter().filter(|&&t| t == tag).count()
    }

    pub fn total(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn all_once(&self) -> bool {
        let tags = self.0.lock().unwrap();
        tags.iter().all(|tag| tags.iter().filter(|t| *t == tag).count() == 1)
    }
}

pub struct TestDelivery {
    tag: u64,
    body: Vec<u8>,
    acks: AckLog,
}

impl TestDelivery {
    pub fn new(tag: u64, body: &[u8]) -> Self {
        Self::with_log(tag, body, AckLog::default())
    }

    pub fn with_log(tag: u64, body: &[u8], acks: AckLog) -> Self {
        Self {
            tag,
            body: body.to_vec(),
            acks,
        }
    }

    pub fn acks(&self) -> AckLog {
        self.acks.clone()
    }
}

impl Delivered for TestDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    async fn ack(&self) -> Result<()> {
        self.acks.0.lock().unwrap().push(self.tag);
        Ok(())
    }
}

/// Keeps every published envelope.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<(String, Envelope)>>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(String, Envelope)> {
        self.sent.lock().unwrap().clone()
    }

    /// Poll until at least `n` envelopes went out.
    pub async fn wait_for_sent(&self, n: usize) -> Vec<(String, Envelope)> {
        for _ in 0..400 {
            let sent = self.sent();
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} published envelopes");
    }
}

impl Transport for RecordingTransport {
    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((queue.to_string(), envelope.clone()));
        Ok(())
    }
}

pub struct FailingTransport;

impl Transport for FailingTransport {
    async fn publish(&self, _queue: &str, _envelope: &Envelope) -> Result<()> {
        Err(anyhow!("broker unavailable"))
    }
}

/// Every publish, whatever the queue, comes back out of one delivery stream.
#[derive(Clone)]
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<TestDelivery>,
    next_tag: Arc<AtomicU64>,
    acks: AckLog,
}

impl LoopbackTransport {
    pub fn new() -> (Self, impl Stream<Item = Result<TestDelivery, Infallible>> + Unpin + Send) {
        let (tx, rx) = mpsc::unbounded();
        let transport = Self {
            tx,
            next_tag: Arc::new(AtomicU64::new(1)),
            acks: AckLog::default(),
        };
        (transport, rx.map(Ok))
    }

    pub fn acks(&self) -> AckLog {
        self.acks.clone()
    }
}

impl Transport for LoopbackTransport {
    async fn publish(&self, _queue: &str, envelope: &Envelope) -> Result<()> {
        let body = serde_json::to_vec(envelope)?;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.tx
            .unbounded_send(TestDelivery::with_log(tag, &body, self.acks.clone()))
            .map_err(|e| anyhow!("loopback closed: {e}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

type MailFailure = Arc<dyn Fn() -> MailError + Send + Sync>;

/// Mailer that records what it was asked to send. Can be held shut to
/// observe work that is still in flight.
#[derive(Clone)]
pub struct FakeMailer {
    sent: Arc<Mutex<Vec<SentMail>>>,
    gate: Arc<watch::Sender<bool>>,
    failure: Option<MailFailure>,
}

impl FakeMailer {
    pub fn ok() -> Self {
        Self {
            sent: Arc::default(),
            gate: Arc::new(watch::channel(false).0),
            failure: None,
        }
    }

    pub fn failing(failure: impl Fn() -> MailError + Send + Sync + 'static) -> Self {
        Self {
            failure: Some(Arc::new(failure)),
            ..Self::ok()
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn hold(&self) {
        self.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.gate.send_replace(false);
    }
}

impl Mailer for FakeMailer {
    async fn send(&self, from: &str, to: &[String], subject: &str, body: &str) -> Result<(), MailError> {
        let mut gate = self.gate.subscribe();
        while *gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }

        self.sent.lock().unwrap().push(SentMail {
            from: from.to_string(),
            to: to.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
        });

        match &self.failure {
            Some(failure) => Err(failure()),
            None => Ok(()),
        }
    }
}

type RecordFailure = Arc<dyn Fn(Uuid) -> RecordError + Send + Sync>;

#[derive(Clone, Default)]
pub struct FakeRecords {
    cloned: Arc<Mutex<Vec<Uuid>>>,
    failure: Option<RecordFailure>,
}

impl FakeRecords {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failing(failure: impl Fn(Uuid) -> RecordError + Send + Sync + 'static) -> Self {
        Self {
            cloned: Arc::default(),
            failure: Some(Arc::new(failure)),
        }
    }

    pub fn cloned(&self) -> Vec<Uuid> {
        self.cloned.lock().unwrap().clone()
    }
}

impl ManpowerRequests for FakeRecords {
    async fn create_from_clone(&self, clone_id: Uuid) -> Result<ManpowerRequest, RecordError> {
        if let Some(failure) = &self.failure {
            return Err(failure(clone_id));
        }

        self.cloned.lock().unwrap().push(clone_id);
        Ok(ManpowerRequest {
            id: Uuid::new_v4(),
            document_number: Some("MPR/0001".to_string()),
            status: Some("DRAFT".to_string()),
        })
    }
}
