//! Background uptime sampler over one canary record.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, instrument, warn};

use crate::cluster::StoreClient;

use super::{CanaryRecord, Counts, ProbeError, SampleOutcome, classify_sample};

/// Default bound on each canary put, get and delete.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

enum Sampler {
    Idle,
    Running {
        shutdown: Option<oneshot::Sender<()>>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Periodically reads a canary record and tallies the outcomes.
///
/// Lifecycle: [`create`](Self::create) writes the canary,
/// [`start`](Self::start) spawns the sampling task,
/// [`stop`](Self::stop) drains it, [`cleanup`](Self::cleanup) deletes the
/// canary. `stop` only returns once the sampling task has exited, so counts
/// read afterwards never change again.
///
/// # Concurrency
///
/// Exactly one sampling task exists per measurer. Ticks are serialized: a
/// read that overruns the interval delays the next tick instead of
/// overlapping it. `total` and `failed` are updated together under one
/// lock, so [`counts`](Self::counts) always returns a consistent pair.
pub struct UptimeMeasurer {
    store: Arc<dyn StoreClient>,
    canary: CanaryRecord,
    interval: Duration,
    operation_timeout: Duration,
    counts: Arc<Mutex<Counts>>,
    sampler: tokio::sync::Mutex<Sampler>,
}

impl std::fmt::Debug for UptimeMeasurer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UptimeMeasurer")
            .field("store", &self.store.describe())
            .field("canary", &self.canary.key())
            .field("interval", &self.interval)
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

fn lock_counts(counts: &Mutex<Counts>) -> MutexGuard<'_, Counts> {
    counts.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UptimeMeasurer {
    /// Writes a fresh canary record and returns a measurer for it.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::CanaryWrite`] when the write fails or times out.
    pub async fn create(
        store: Arc<dyn StoreClient>,
        interval: Duration,
    ) -> Result<Self, ProbeError> {
        Self::with_timeout(store, interval, DEFAULT_OPERATION_TIMEOUT).await
    }

    /// Like [`create`](Self::create) with an explicit per-operation timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::CanaryWrite`] when the write fails or times out.
    #[instrument(skip(store), fields(endpoints = %store.describe()))]
    pub async fn with_timeout(
        store: Arc<dyn StoreClient>,
        interval: Duration,
        operation_timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let canary = CanaryRecord::generate();
        store
            .put(canary.key(), canary.value(), operation_timeout)
            .await
            .map_err(|source| ProbeError::CanaryWrite {
                key: canary.key().to_string(),
                endpoints: store.describe(),
                source,
            })?;

        debug!(key = canary.key(), "canary written");
        Ok(Self {
            store,
            canary,
            interval,
            operation_timeout,
            counts: Arc::new(Mutex::new(Counts::default())),
            sampler: tokio::sync::Mutex::new(Sampler::Idle),
        })
    }

    /// The canary record this measurer reads.
    #[must_use]
    pub fn canary(&self) -> &CanaryRecord {
        &self.canary
    }

    /// Spawns the sampling task. The first read happens one interval from now.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::AlreadyStarted`] when called a second time,
    /// including after [`stop`](Self::stop).
    pub async fn start(&self) -> Result<(), ProbeError> {
        let mut sampler = self.sampler.lock().await;
        if !matches!(*sampler, Sampler::Idle) {
            return Err(ProbeError::AlreadyStarted {
                key: self.canary.key().to_string(),
            });
        }

        let (shutdown, signal) = oneshot::channel();
        let handle = tokio::spawn(sample_loop(
            Arc::clone(&self.store),
            self.canary.clone(),
            self.interval,
            self.operation_timeout,
            Arc::clone(&self.counts),
            signal,
        ));
        *sampler = Sampler::Running {
            shutdown: Some(shutdown),
            handle,
        };

        info!(key = self.canary.key(), interval = ?self.interval, "measurer started");
        Ok(())
    }

    /// Stops sampling and waits for the sampling task to exit.
    ///
    /// At most one in-flight read is awaited. Calling `stop` again, or on a
    /// measurer that never started, returns immediately. If a `stop` future
    /// is dropped mid-drain, the next call resumes waiting for the task.
    pub async fn stop(&self) {
        let mut sampler = self.sampler.lock().await;

        match &mut *sampler {
            Sampler::Idle => {
                *sampler = Sampler::Stopped;
                return;
            }
            Sampler::Stopped => return,
            Sampler::Running { shutdown, handle } => {
                if let Some(shutdown) = shutdown.take() {
                    let _ = shutdown.send(());
                }
                if let Err(error) = handle.await {
                    warn!(error = %error, key = self.canary.key(), "sampling task ended abnormally");
                }
            }
        }
        *sampler = Sampler::Stopped;

        let counts = self.counts();
        info!(
            key = self.canary.key(),
            total = counts.total,
            failed = counts.failed,
            "measurer stopped"
        );
    }

    /// Consistent snapshot of the sample tally.
    #[must_use]
    pub fn counts(&self) -> Counts {
        *lock_counts(&self.counts)
    }

    /// `failed / total`, or `None` when no sample was taken.
    #[must_use]
    pub fn actual_deviation(&self) -> Option<f64> {
        self.counts().deviation()
    }

    /// Deletes the canary record. Valid in any lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::CanaryDelete`] when the delete fails.
    pub async fn cleanup(&self) -> Result<(), ProbeError> {
        self.store
            .delete(self.canary.key(), self.operation_timeout)
            .await
            .map_err(|source| ProbeError::CanaryDelete {
                key: self.canary.key().to_string(),
                endpoints: self.store.describe(),
                source,
            })?;
        debug!(key = self.canary.key(), "canary deleted");
        Ok(())
    }
}

fn failure_label(outcome: &SampleOutcome) -> &'static str {
    match outcome {
        SampleOutcome::Success => "success",
        SampleOutcome::TransportError { .. } => "transport error",
        SampleOutcome::WrongCardinality { .. } => "unexpected number of keys",
        SampleOutcome::ValueMismatch { .. } => "mismatching values",
    }
}

async fn sample_loop(
    store: Arc<dyn StoreClient>,
    canary: CanaryRecord,
    period: Duration,
    operation_timeout: Duration,
    counts: Arc<Mutex<Counts>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            // a dropped sender ends the loop too
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        let result = store.get(canary.key(), operation_timeout).await;
        let outcome = classify_sample(&canary, &result);

        let snapshot = {
            let mut guard = lock_counts(&counts);
            guard.record(&outcome);
            *guard
        };

        if !outcome.is_success() {
            warn!(
                key = canary.key(),
                failure = snapshot.failed,
                total = snapshot.total,
                kind = failure_label(&outcome),
                detail = %outcome,
                "Encountered failure (#{})",
                snapshot.failed
            );
        }
    }
}
