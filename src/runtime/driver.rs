//! # Reconciliation Driver
//!
//! Shared watch-plus-resync loop. A controller supplies only a [`Reconcile`]
//! implementation; the driver merges its event sources with periodic resync
//! ticks, deduplicates pending keys, applies per-key exponential backoff on
//! failure, and stops promptly when the shutdown token is cancelled.

use super::backoff::ExponentialBackoff;
use super::error_policy;
use crate::config::ControllerConfig;
use crate::observability::metrics;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

/// What to do with a key after a successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Wait for the next event or resync tick
    Done,
    /// Reconcile the key again after the delay
    RequeueAfter(Duration),
}

/// Domain logic of one controller
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Controller name used in logs and metrics
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &str) -> Result<Outcome, Self::Error>;
}

/// Timing knobs of a [`Driver`]
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub resync_interval: Duration,
    pub backoff_start: Duration,
    pub backoff_max: Duration,
    pub watch_restart_delay: Duration,
}

impl From<&ControllerConfig> for DriverConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            resync_interval: config.resync_interval(),
            backoff_start: config.backoff_start(),
            backoff_max: config.backoff_max(),
            watch_restart_delay: config.watch_restart_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Delayed {
    at: Instant,
    // Backoff delays are not shortened by new events for the same key
    backing_off: bool,
}

/// Reusable reconciliation loop for one controller
pub struct Driver<R: Reconcile> {
    reconciler: Arc<R>,
    config: DriverConfig,
    sources: Vec<BoxStream<'static, String>>,
    resync_keys: Vec<String>,
}

impl<R: Reconcile> std::fmt::Debug for Driver<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("controller", &self.reconciler.name())
            .field("config", &self.config)
            .field("sources", &self.sources.len())
            .field("resync_keys", &self.resync_keys)
            .finish()
    }
}

impl<R: Reconcile> Driver<R> {
    pub fn new(reconciler: Arc<R>, config: DriverConfig) -> Self {
        Self {
            reconciler,
            config,
            sources: Vec::new(),
            resync_keys: Vec::new(),
        }
    }

    /// Reconcile `key` on start and on every resync tick
    #[must_use]
    pub fn with_resync_key(mut self, key: impl Into<String>) -> Self {
        self.resync_keys.push(key.into());
        self
    }

    /// Add a stream of keys to reconcile
    #[must_use]
    pub fn with_source(mut self, keys: BoxStream<'static, String>) -> Self {
        self.sources.push(keys);
        self
    }

    /// Add a watch whose stream is recreated, after a delay, whenever it ends
    #[must_use]
    pub fn with_watch<F>(self, factory: F) -> Self
    where
        F: Fn() -> BoxStream<'static, String> + Send + Sync + 'static,
    {
        let source = restarting(
            self.reconciler.name(),
            factory,
            self.config.watch_restart_delay,
        );
        self.with_source(source)
    }

    /// Add a trigger channel, e.g. fed by a provider [`crate::dynamic_cert::TriggerListener`]
    #[must_use]
    pub fn with_trigger(self, receiver: mpsc::UnboundedReceiver<String>) -> Self {
        self.with_source(channel_keys(receiver))
    }

    /// Run until `shutdown` is cancelled; in-flight work is abandoned
    pub async fn run(self, shutdown: CancellationToken) {
        let name = self.reconciler.name();
        let mut events = stream::select_all(self.sources);
        let mut ticker = tokio::time::interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut queue = Queue::default();
        let mut delayed: HashMap<String, Delayed> = HashMap::new();
        let mut backoffs: HashMap<String, ExponentialBackoff> = HashMap::new();

        info!(controller = name, "controller started");

        loop {
            if let Some(key) = queue.pop() {
                let span = tracing::info_span!("controller.reconcile", controller = name, key = %key);
                let started = std::time::Instant::now();
                let result = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    result = self.reconciler.reconcile(&key).instrument(span) => result,
                };
                metrics::increment_reconciliations(name);
                metrics::observe_reconciliation_duration(name, started.elapsed().as_secs_f64());

                match result {
                    Ok(outcome) => {
                        if let Some(backoff) = backoffs.get_mut(&key) {
                            backoff.reset();
                        }
                        match outcome {
                            Outcome::Done => {
                                delayed.remove(&key);
                            }
                            Outcome::RequeueAfter(after) => {
                                debug!(controller = name, key = %key, requeue_in_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX), "requeue scheduled");
                                delayed.insert(
                                    key,
                                    Delayed {
                                        at: Instant::now() + after,
                                        backing_off: false,
                                    },
                                );
                            }
                        }
                    }
                    Err(err) => {
                        let backoff = backoffs.entry(key.clone()).or_insert_with(|| {
                            ExponentialBackoff::new(self.config.backoff_start, self.config.backoff_max)
                        });
                        let after =
                            error_policy::handle_reconciliation_error(name, &key, &err, backoff);
                        delayed.insert(
                            key,
                            Delayed {
                                at: Instant::now() + after,
                                backing_off: true,
                            },
                        );
                    }
                }
                continue;
            }

            let next_due = delayed.values().map(|d| d.at).min();
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(key) = events.next() => {
                    offer(&mut queue, &mut delayed, key);
                }
                _ = ticker.tick() => {
                    for key in &self.resync_keys {
                        offer(&mut queue, &mut delayed, key.clone());
                    }
                }
                () = sleep_until(next_due), if next_due.is_some() => {
                    let now = Instant::now();
                    let due: Vec<String> = delayed
                        .iter()
                        .filter(|(_, d)| d.at <= now)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in due {
                        delayed.remove(&key);
                        queue.push(key);
                    }
                }
            }
        }

        info!(controller = name, "controller stopped");
    }
}

/// Queue `key` unless it is already pending or waiting out a failure backoff
fn offer(queue: &mut Queue, delayed: &mut HashMap<String, Delayed>, key: String) {
    if delayed.get(&key).is_some_and(|d| d.backing_off) {
        return;
    }
    delayed.remove(&key);
    queue.push(key);
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// FIFO of distinct keys
#[derive(Debug, Default)]
struct Queue {
    order: VecDeque<String>,
    pending: HashSet<String>,
}

impl Queue {
    fn push(&mut self, key: String) {
        if self.pending.insert(key.clone()) {
            self.order.push_back(key);
        }
    }

    fn pop(&mut self) -> Option<String> {
        let key = self.order.pop_front()?;
        self.pending.remove(&key);
        Some(key)
    }
}

/// Keys from an unbounded channel
pub fn channel_keys(receiver: mpsc::UnboundedReceiver<String>) -> BoxStream<'static, String> {
    stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|key| (key, receiver))
    })
    .boxed()
}

fn restarting<F>(controller: &'static str, factory: F, delay: Duration) -> BoxStream<'static, String>
where
    F: Fn() -> BoxStream<'static, String> + Send + Sync + 'static,
{
    let factory = Arc::new(factory);
    stream::iter(0u64..)
        .then(move |attempt| {
            let factory = Arc::clone(&factory);
            async move {
                if attempt > 0 {
                    error_policy::handle_watch_stream_end(controller, delay);
                    tokio::time::sleep(delay).await;
                }
                factory()
            }
            .boxed()
        })
        .flatten()
        .boxed()
}
