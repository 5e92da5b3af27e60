//! Delayed, coalescing restart scheduler.
//!
//! Turns the stream of [`ChangeEvent`]s into restart cycles. A cycle waits
//! out the configured delay, runs the [`Reconciler`] once and records the
//! outcome. The cycle runs on its own task so a long delay or a slow API
//! server never holds up the watch.
//!
//! Phases, guarded by one mutex:
//!
//! - `Idle`: a change starts a new cycle.
//! - `Waiting`: the cycle is in its delay; changes are absorbed.
//! - `Restarting`: the write loop is running; a change is remembered and
//!   starts a fresh cycle once the current outcome is recorded.

use crate::config::WatchTarget;
use crate::metrics::{OutcomeRecorder, RestartOutcome};
use crate::reconciler::{Reconciler, RestartResult};
use crate::watcher::ChangeEvent;
use rollout_client::DeploymentClientTrait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Waiting,
    Restarting { rearm: bool },
}

/// How a change notification was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Started a new restart cycle
    Scheduled,
    /// Folded into the cycle already waiting out its delay
    Coalesced,
    /// Arrived mid-restart; another cycle follows the current one
    Deferred,
}

struct Inner<C> {
    reconciler: Arc<Reconciler<C>>,
    recorder: Arc<dyn OutcomeRecorder>,
    watch: WatchTarget,
    delay: Duration,
    phase: Mutex<Phase>,
}

impl<C> Inner<C> {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Schedules delayed restarts of one Deployment for one Secret.
pub struct RestartScheduler<C> {
    inner: Arc<Inner<C>>,
    cycle: Mutex<Option<JoinHandle<()>>>,
}

impl<C> std::fmt::Debug for RestartScheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartScheduler")
            .field("watch", &self.inner.watch)
            .field("delay", &self.inner.delay)
            .finish_non_exhaustive()
    }
}

impl<C: DeploymentClientTrait + 'static> RestartScheduler<C> {
    /// Creates a new scheduler.
    pub fn new(
        reconciler: Arc<Reconciler<C>>,
        recorder: Arc<dyn OutcomeRecorder>,
        watch: WatchTarget,
        delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                reconciler,
                recorder,
                watch,
                delay,
                phase: Mutex::new(Phase::Idle),
            }),
            cycle: Mutex::new(None),
        }
    }

    /// Handle one change notification.
    pub fn notify(&self, change: &ChangeEvent, shutdown: &CancellationToken) -> Admission {
        let admission = {
            let mut phase = self.inner.phase();
            match *phase {
                Phase::Idle => {
                    *phase = Phase::Waiting;
                    Admission::Scheduled
                }
                Phase::Waiting => Admission::Coalesced,
                Phase::Restarting { .. } => {
                    *phase = Phase::Restarting { rearm: true };
                    Admission::Deferred
                }
            }
        };

        let version = change.resource_version.as_deref().unwrap_or("<none>");
        match admission {
            Admission::Scheduled => {
                info!(
                    "Secret {} changed (resourceVersion {}), waiting {:?} before restarting deployment {}",
                    self.inner.watch,
                    version,
                    self.inner.delay,
                    self.inner.reconciler.target()
                );
                let handle = tokio::spawn(run_cycle(self.inner.clone(), shutdown.clone()));
                *self.cycle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Admission::Coalesced => {
                debug!(resource_version = version, "Restart already pending, change coalesced");
            }
            Admission::Deferred => {
                info!(
                    resource_version = version,
                    "Secret changed during restart, another restart will follow"
                );
            }
        }
        admission
    }

    /// Consume notifications until the feed closes or shutdown is requested.
    ///
    /// A cycle still in its delay is abandoned on shutdown; one already in
    /// its write loop is awaited.
    pub async fn run(self, mut events: mpsc::Receiver<ChangeEvent>, shutdown: CancellationToken) {
        info!("Restart scheduler running for {}", self.inner.watch);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = events.recv() => match change {
                    Some(change) => {
                        self.notify(&change, &shutdown);
                    }
                    None => break,
                },
            }
        }

        let in_flight = self.cycle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = in_flight {
            if let Err(e) = handle.await {
                error!("Restart task panicked: {}", e);
            }
        }
        info!("Restart scheduler stopped");
    }
}

async fn run_cycle<C: DeploymentClientTrait>(inner: Arc<Inner<C>>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                warn!("Shutting down, pending restart of {} abandoned", inner.reconciler.target());
                *inner.phase() = Phase::Idle;
                return;
            }
            _ = tokio::time::sleep(inner.delay) => {}
        }

        *inner.phase() = Phase::Restarting { rearm: false };

        // Not cancellable: the write loop finishes even during shutdown
        let result = inner.reconciler.restart_deployment().await;
        match &result {
            RestartResult::Succeeded { attempts } => {
                debug!(secret = %inner.watch, attempts = *attempts, "Restart cycle complete");
            }
            RestartResult::Failed { reason } => {
                warn!(
                    secret = %inner.watch,
                    error = %reason,
                    "Restart cycle failed, the next change will try again"
                );
            }
        }
        inner
            .recorder
            .record(&RestartOutcome::new(
                &inner.watch,
                inner.reconciler.target(),
                result.succeeded(),
            ));

        let again = {
            let mut phase = inner.phase();
            let again =
                matches!(*phase, Phase::Restarting { rearm: true }) && !shutdown.is_cancelled();
            *phase = if again { Phase::Waiting } else { Phase::Idle };
            again
        };
        if !again {
            return;
        }
        info!(
            "Waiting {:?} before restarting deployment {} again",
            inner.delay,
            inner.reconciler.target()
        );
    }
}
