use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::observability;

use super::{Delta, ReplicaCache, SyncSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Upper bound of the random delay added to every wait.
    pub jitter: Duration,
    /// Quiet period after the last interaction before a sync runs.
    pub debounce: Duration,
    pub max_backoff: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            jitter: Duration::from_secs(3),
            debounce: Duration::from_millis(500),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// When to poll next. Swappable so push-capable deployments can stretch or drop the interval.
pub trait PollStrategy: Send + Sync {
    fn next_delay(&self, consecutive_failures: u32) -> Duration;
    fn debounce(&self) -> Duration;
}

/// Fixed interval plus uniform jitter; doubles per consecutive failure up to `max_backoff`.
#[derive(Debug, Clone, Copy)]
pub struct JitteredInterval {
    config: PollConfig,
}

impl JitteredInterval {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }
}

impl PollStrategy for JitteredInterval {
    fn next_delay(&self, consecutive_failures: u32) -> Duration {
        let base = match consecutive_failures {
            0 => self.config.interval,
            n => self
                .config
                .interval
                .saturating_mul(1u32 << n.min(16))
                .min(self.config.max_backoff),
        };
        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    fn debounce(&self) -> Duration {
        self.config.debounce
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The user touched something. Debounced.
    Interaction,
    /// The view came back to the foreground. Syncs right away.
    Foreground,
    /// Something upstream said the cache is wrong (e.g. a NotFound). Syncs right away.
    Invalidate,
    Shutdown,
}

pub struct PollerHandle {
    triggers: mpsc::Sender<Trigger>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub async fn trigger(&self, trigger: Trigger) {
        let _ = self.triggers.send(trigger).await;
    }

    pub async fn shutdown(self) {
        let _ = self.triggers.send(Trigger::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Keeps a [`ReplicaCache`] in sync with a [`SyncSource`] and publishes non-empty deltas.
pub struct Poller {
    source: Arc<dyn SyncSource>,
    cache: Arc<RwLock<ReplicaCache>>,
    strategy: Arc<dyn PollStrategy>,
    triggers: mpsc::Receiver<Trigger>,
    deltas: mpsc::Sender<Delta>,
}

impl Poller {
    /// Start polling. The first sync runs immediately.
    pub fn spawn(
        source: Arc<dyn SyncSource>,
        cache: Arc<RwLock<ReplicaCache>>,
        strategy: Arc<dyn PollStrategy>,
    ) -> (PollerHandle, mpsc::Receiver<Delta>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(64);
        let (delta_tx, delta_rx) = mpsc::channel(64);
        let poller = Poller {
            source,
            cache,
            strategy,
            triggers: trigger_rx,
            deltas: delta_tx,
        };
        let task = tokio::spawn(poller.run());
        (
            PollerHandle {
                triggers: trigger_tx,
                task,
            },
            delta_rx,
        )
    }

    async fn run(mut self) {
        let mut failures = 0u32;
        let mut next_tick = Instant::now();
        let mut debounce_until: Option<Instant> = None;

        loop {
            let wake = debounce_until.map_or(next_tick, |d| d.min(next_tick));
            tokio::select! {
                _ = sleep_until(wake) => {}
                trigger = self.triggers.recv() => match trigger {
                    None | Some(Trigger::Shutdown) => break,
                    Some(Trigger::Interaction) => {
                        debounce_until = Some(Instant::now() + self.strategy.debounce());
                        continue;
                    }
                    Some(Trigger::Foreground) => {}
                    Some(Trigger::Invalidate) => self.cache.write().await.invalidate(),
                },
            }

            debounce_until = None;
            failures = self.sync_once(failures).await;
            next_tick = Instant::now() + self.strategy.next_delay(failures);
        }
        debug!("poller stopped");
    }

    /// One reconciliation. Returns the new consecutive failure count.
    async fn sync_once(&self, failures: u32) -> u32 {
        let provider_id = self.cache.read().await.provider_id();
        // Fetch outside the cache lock so readers are never blocked on the network.
        let snapshot = match self.source.fetch(provider_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                metrics::counter!(observability::RECONCILE_FAILURES_TOTAL).increment(1);
                warn!(
                    "reconciliation for provider {provider_id} failed ({} in a row): {e}",
                    failures + 1
                );
                return failures.saturating_add(1);
            }
        };

        let delta = self.cache.write().await.apply(snapshot);
        if !delta.is_empty() {
            debug!(
                "provider {provider_id}: +{} -{} ~{} slots, {} appointment updates",
                delta.added.len(),
                delta.removed.len(),
                delta.slot_changes.len(),
                delta.status_changed.len()
            );
            // Never wait on the consumer. The cache is already current, so a delta that does
            // not fit is dropped and the next read of the cache shows the change anyway.
            match self.deltas.try_send(delta) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("provider {provider_id}: delta channel full, delta dropped")
                }
            }
        }
        0
    }
}
