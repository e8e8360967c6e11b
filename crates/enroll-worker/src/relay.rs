//! Outbox relay: moves envelopes written in the registration transaction
//! into the task queue.
//!
//! A message is deleted only after the queue accepted it, so a crash between
//! the two may enqueue it twice. Handlers tolerate repeated delivery.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use enroll_core::Config;
use enroll_db::OutboxStore;

use crate::distributor::TaskDistributor;

#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    pub interval_ms: u64,
    pub batch_size: i64,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            batch_size: 50,
        }
    }
}

impl From<&Config> for OutboxRelayConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval_ms: config.outbox_relay_interval_ms,
            batch_size: config.outbox_relay_batch_size,
        }
    }
}

#[derive(Clone)]
pub struct OutboxRelay {
    outbox: Arc<dyn OutboxStore>,
    distributor: Arc<dyn TaskDistributor>,
    config: OutboxRelayConfig,
    shutdown: CancellationToken,
}

impl OutboxRelay {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        distributor: Arc<dyn TaskDistributor>,
        config: OutboxRelayConfig,
    ) -> Self {
        Self {
            outbox,
            distributor,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                interval_ms = relay.config.interval_ms,
                batch_size = relay.config.batch_size,
                "Outbox relay started"
            );
            let mut interval = tokio::time::interval(Duration::from_millis(relay.config.interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = relay.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = relay.relay_once().await {
                            tracing::error!(error = %e, "Outbox relay pass failed");
                        }
                    }
                }
            }
            tracing::info!("Outbox relay stopped");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Relay one batch. Returns the number of messages handed to the queue.
    pub async fn relay_once(&self) -> Result<usize> {
        let messages = self.outbox.fetch_pending(self.config.batch_size).await?;
        let mut relayed = 0;

        for message in messages {
            match self.distributor.distribute(&message.envelope()).await {
                Ok(task_id) => {
                    self.outbox.delete(message.id).await?;
                    relayed += 1;
                    tracing::debug!(outbox_id = message.id, task_id = %task_id, "Relayed outbox message");
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        outbox_id = message.id,
                        attempts = message.attempts,
                        error = %e,
                        "Queue unavailable, keeping outbox message"
                    );
                    self.outbox.record_failure(message.id, &e.to_string()).await?;
                    // The queue is down for the rest of the batch too.
                    break;
                }
                Err(e) => {
                    // The queue will never accept this envelope.
                    tracing::error!(
                        outbox_id = message.id,
                        task_type = %message.task_type,
                        payload = %message.payload,
                        error = %e,
                        "Discarding undeliverable outbox message"
                    );
                    self.outbox.delete(message.id).await?;
                }
            }
        }

        Ok(relayed)
    }
}
