//! Broker connection setup with bounded exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use lapin::{Connection, ConnectionProperties};
use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt,
    /// without jitter.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(32);
        self.initial_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms)
    }
}

/// Run `operation` until it succeeds or the policy's attempts are spent.
///
/// Delays double after every failure, capped at `max_delay_ms`, with ±10%
/// jitter so a fleet of workers doesn't reconnect in lockstep.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "retry_succeeded");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt >= policy.max_attempts {
                    warn!(
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "retry_exhausted"
                    );
                    return Err(e);
                }

                let base = policy.base_delay_ms(attempt);
                let jitter: f64 = rand::thread_rng().gen_range(-0.1..=0.1);
                let delay_ms = ((base as f64) * (1.0 + jitter)).max(0.0) as u64;

                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms,
                    error = %e,
                    "retry_backing_off"
                );

                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

/// Connect to RabbitMQ, retrying with backoff before giving up.
pub async fn connect_with_retry(url: &str, policy: &RetryPolicy) -> Result<Connection> {
    info!(url_length = url.len(), "rabbitmq_connecting");

    let connection = retry_with_backoff(policy, || {
        Connection::connect(url, ConnectionProperties::default())
    })
    .await
    .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");
    Ok(connection)
}
