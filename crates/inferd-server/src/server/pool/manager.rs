//! Session admission and coordinated drain.
//!
//! [`SessionPool`] bounds the number of concurrently open sessions with a
//! semaphore and tracks every session task and background generation unit
//! with one [`TaskTracker`]. Shutdown is cooperative and phased:
//!
//! 1. `draining` fires: new sessions are refused, idle sessions close.
//! 2. In-flight turns get `grace` to finish and deliver their final chunk.
//! 3. `terminate` fires: remaining sessions stop forwarding and close.
//! 4. Generation units are never interrupted; they get a short bounded wait.

use core::time::Duration;
use inferd_core::Error;
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// How long background generation units may outlive `terminate`.
const UNIT_GRACE: Duration = Duration::from_secs(3);

/// Drain signals observed by every session.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignals {
    draining: CancellationToken,
    terminate: CancellationToken,
}

impl ShutdownSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Resolves once draining begins.
    pub async fn draining(&self) {
        self.draining.cancelled().await;
    }

    /// Resolves once the grace period is over.
    pub async fn terminated(&self) {
        self.terminate.cancelled().await;
    }

    pub(crate) fn begin_drain(&self) {
        self.draining.cancel();
    }

    pub(crate) fn terminate(&self) {
        self.draining.cancel();
        self.terminate.cancel();
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every session and generation unit finished within the grace period.
    Clean,
    /// Sessions were still open when the grace period elapsed and were
    /// terminated; all background units then exited.
    Forced,
    /// Generation units were still running after the final wait.
    Abandoned,
}

/// Occupied session slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SessionSlot {
    _permit: OwnedSemaphorePermit,
    inflight: Arc<AtomicUsize>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded set of concurrently running sessions.
#[derive(Debug)]
pub struct SessionPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    signals: ShutdownSignals,
    inflight: Arc<AtomicUsize>,
}

impl SessionPool {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_sessions)),
            tracker: TaskTracker::new(),
            signals: ShutdownSignals::new(),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Tracker shared with the generation bridge so drain waits for units.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    pub fn signals(&self) -> ShutdownSignals {
        self.signals.clone()
    }

    /// Number of sessions currently holding a slot.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] once draining has begun, including
    /// for callers already waiting.
    pub async fn admit(&self) -> Result<SessionSlot, Error> {
        if self.signals.is_draining() {
            return Err(Error::ServiceShutdown);
        }

        let permit = tokio::select! {
            biased;
            () = self.signals.draining() => return Err(Error::ServiceShutdown),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| Error::ServiceShutdown)?
            }
        };

        self.inflight.fetch_add(1, Ordering::AcqRel);
        Ok(SessionSlot {
            _permit: permit,
            inflight: Arc::clone(&self.inflight),
        })
    }

    /// Runs a session task holding `slot` until it returns.
    pub fn spawn<F>(&self, slot: SessionSlot, session: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            let _slot = slot;
            session.await;
        });
    }

    /// Drains sessions, waiting at most `grace` before terminating them.
    pub async fn shutdown(&self, grace: Duration) -> DrainOutcome {
        // === Phase 0: Stop accepting new sessions ===
        tracing::info!("Refusing new sessions");
        self.signals.begin_drain();
        self.permits.close();
        self.tracker.close();

        // === Phase 1: Let in-flight turns finish ===
        tracing::info!("Draining in-flight sessions ({} active)", self.inflight());
        let forced = match timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                tracing::debug!("All sessions drained");
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Graceful drain timed out ({} sessions still active)",
                    self.inflight()
                );
                true
            }
        };

        // === Phase 2: Terminate whatever is left ===
        tracing::debug!("Terminating remaining sessions");
        self.signals.terminate();

        // === Phase 3: Bounded wait for generation units ===
        if !forced {
            return DrainOutcome::Clean;
        }
        match timeout(UNIT_GRACE, self.tracker.wait()).await {
            Ok(()) => DrainOutcome::Forced,
            Err(_) => {
                tracing::warn!(
                    "{} tasks still running after termination; exiting without them",
                    self.tracker.len()
                );
                DrainOutcome::Abandoned
            }
        }
    }
}
