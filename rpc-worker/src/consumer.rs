//! The inbound pump.
//!
//! One loop reads every message from the inbound queue, tells replies from
//! commands by their `messageType`, acknowledges each message exactly once
//! and routes it: replies to the [`CorrelationRegistry`], commands to the
//! [`Dispatcher`] on their own task.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use futures::{Stream, StreamExt};
use lapin::{message::Delivery, options::BasicAckOptions};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatcher, Mailer, ManpowerRequests};
use crate::queue::{Envelope, Inbound, Transport};
use crate::rpc::CorrelationRegistry;

/// Bytes of an unparseable body kept in the log line.
const BODY_PREVIEW_LIMIT: usize = 500;

/// Default wait for in-flight commands once the loop stops.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A received message that can be acknowledged.
pub trait Delivered: Send + Sync + 'static {
    fn body(&self) -> &[u8];

    fn delivery_tag(&self) -> u64;

    fn ack(&self) -> impl Future<Output = Result<()>> + Send;
}

impl Delivered for Delivery {
    fn body(&self) -> &[u8] {
        &self.data
    }

    fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .context("Failed to acknowledge delivery")
    }
}

/// When a command is acknowledged relative to its dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Ack on receipt. A crash mid-dispatch loses the command.
    BeforeDispatch,
    /// Ack once the reply is out. A crash mid-dispatch redelivers it.
    AfterDispatch,
}

/// Running counters for the loop.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    replies_delivered: AtomicU64,
    replies_orphaned: AtomicU64,
    commands_dispatched: AtomicU64,
    malformed: AtomicU64,
    ack_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub replies_delivered: u64,
    pub replies_orphaned: u64,
    pub commands_dispatched: u64,
    pub malformed: u64,
    pub ack_failures: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            replies_delivered: self.replies_delivered.load(Ordering::Relaxed),
            replies_orphaned: self.replies_orphaned.load(Ordering::Relaxed),
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// How a single message was handled.
#[derive(Debug)]
pub enum Handled {
    Reply { id: String, delivered: bool },
    /// The dispatch task; it finishes once the reply is published.
    Command { id: String, task: JoinHandle<()> },
    Malformed,
}

/// Everything the loop needs to route one message.
pub struct Worker<T, M, R> {
    registry: CorrelationRegistry,
    dispatcher: Arc<Dispatcher<T, M, R>>,
    ack_mode: AckMode,
    drain_timeout: Duration,
    stats: Arc<ConsumerStats>,
}

impl<T, M, R> Worker<T, M, R>
where
    T: Transport,
    M: Mailer,
    R: ManpowerRequests,
{
    pub fn new(registry: CorrelationRegistry, dispatcher: Dispatcher<T, M, R>, ack_mode: AckMode) -> Self {
        Self {
            registry,
            dispatcher: Arc::new(dispatcher),
            ack_mode,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    /// Bound the wait for running commands when [`Worker::pump`] stops.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Route one delivery. Acknowledges it exactly once, either here or at
    /// the end of the spawned dispatch task.
    pub async fn handle<D: Delivered>(&self, delivery: D) -> Handled {
        match self.route(delivery).await {
            Routed::Done(handled) => handled,
            Routed::Dispatch { id, work } => Handled::Command {
                id,
                task: tokio::spawn(work),
            },
        }
    }

    async fn route<D: Delivered>(&self, delivery: D) -> Routed {
        ConsumerStats::bump(&self.stats.received);
        let delivery_tag = delivery.delivery_tag();

        let inbound = match Envelope::decode(delivery.body()) {
            Ok(inbound) => inbound,
            Err(e) => {
                let body = delivery.body();
                error!(
                    delivery_tag = delivery_tag,
                    error = %e,
                    body_preview = %String::from_utf8_lossy(&body[..body.len().min(BODY_PREVIEW_LIMIT)]),
                    "inbound_parse_failed"
                );
                ConsumerStats::bump(&self.stats.malformed);

                // Ack and drop so a poison message can't loop forever.
                acknowledge(&delivery, &self.stats).await;
                return Routed::Done(Handled::Malformed);
            }
        };

        match inbound {
            Inbound::Reply { id, data } => {
                let delivered = self.registry.deliver(&id, data);
                if delivered {
                    ConsumerStats::bump(&self.stats.replies_delivered);
                    info!(id = %id, delivery_tag = delivery_tag, "reply_delivered");
                } else {
                    ConsumerStats::bump(&self.stats.replies_orphaned);
                    debug!(id = %id, delivery_tag = delivery_tag, "reply_orphaned");
                }

                acknowledge(&delivery, &self.stats).await;
                Routed::Done(Handled::Reply { id, delivered })
            }
            Inbound::Command(envelope) => {
                ConsumerStats::bump(&self.stats.commands_dispatched);
                info!(
                    id = %envelope.id,
                    message_type = %envelope.message_type,
                    reply_to = %envelope.reply_to,
                    delivery_tag = delivery_tag,
                    "command_received"
                );

                let id = envelope.id.clone();
                let dispatcher = Arc::clone(&self.dispatcher);
                let stats = Arc::clone(&self.stats);

                let work = match self.ack_mode {
                    AckMode::BeforeDispatch => {
                        acknowledge(&delivery, &self.stats).await;
                        async move {
                            run_dispatch(&dispatcher, &envelope).await;
                        }
                        .boxed()
                    }
                    AckMode::AfterDispatch => async move {
                        run_dispatch(&dispatcher, &envelope).await;
                        acknowledge(&delivery, &stats).await;
                    }
                    .boxed(),
                };

                Routed::Dispatch { id, work }
            }
        }
    }

    /// Pull deliveries until the stream ends or `shutdown` resolves, then
    /// wait up to the drain timeout for commands still running.
    pub async fn pump<S, D, E, F>(&self, mut deliveries: S, shutdown: F)
    where
        S: Stream<Item = Result<D, E>> + Unpin,
        D: Delivered,
        E: Display,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("consumer_stopping");
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(joined);
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            if let Routed::Dispatch { work, .. } = self.route(delivery).await {
                                in_flight.spawn(work);
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "rabbitmq_delivery_error");
                        }
                        None => {
                            warn!("rabbitmq_consumer_closed");
                            break;
                        }
                    }
                }
            }
        }

        self.drain(in_flight).await;
        info!(stats = ?self.stats.snapshot(), "consumer_stopped");
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        info!(in_flight = in_flight.len(), "consumer_draining");

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                reap(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "consumer_drain_timed_out"
            );
            in_flight.abort_all();
        }
    }
}

/// A routed delivery: settled in place, or dispatch work still to run.
enum Routed {
    Done(Handled),
    Dispatch { id: String, work: BoxFuture<'static, ()> },
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "dispatch_task_panicked");
        }
    }
}

async fn run_dispatch<T, M, R>(dispatcher: &Dispatcher<T, M, R>, envelope: &Envelope)
where
    T: Transport,
    M: Mailer,
    R: ManpowerRequests,
{
    if let Err(e) = dispatcher.dispatch(envelope).await {
        error!(
            id = %envelope.id,
            reply_to = %envelope.reply_to,
            error = %e,
            "reply_publish_failed"
        );
    }
}

async fn acknowledge<D: Delivered>(delivery: &D, stats: &ConsumerStats) {
    if let Err(e) = delivery.ack().await {
        ConsumerStats::bump(&stats.ack_failures);
        error!(
            delivery_tag = delivery.delivery_tag(),
            error = %e,
            "rabbitmq_ack_failed"
        );
    }
}
