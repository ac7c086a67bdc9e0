//! Process-wide mutual exclusion over the generation engine.
//!
//! The model and its accelerator context are not safe for concurrent
//! `generate` calls. Every session goes through one [`AcceleratorGate`];
//! a [`GatePermit`] is held for exactly the duration of one `generate` call
//! and is released by the background thread that ran it, not by the session.
//!
//! Waiters are admitted in FIFO order (`tokio::sync::Mutex` is fair), so no
//! session starves while a bounded number of sessions compete.

use crate::server::telemetry::record_gate_wait;
use std::{sync::Arc, time::Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Shared gate serializing access to the accelerator.
#[derive(Debug, Clone, Default)]
pub struct AcceleratorGate {
    inner: Arc<Mutex<()>>,
}

/// Proof of exclusive access. Dropping it lets the next waiter in.
#[derive(Debug)]
pub struct GatePermit {
    _guard: OwnedMutexGuard<()>,
}

impl AcceleratorGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the accelerator is free.
    pub async fn admit(&self) -> GatePermit {
        let start = Instant::now();
        let guard = Arc::clone(&self.inner).lock_owned().await;
        record_gate_wait(start.elapsed().as_secs_f64() * 1000.0);
        GatePermit { _guard: guard }
    }

    #[cfg(test)]
    pub(crate) fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn at_most_one_holder_under_contention() {
        let gate = AcceleratorGate::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..16 {
            let gate = gate.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let permit = gate.admit().await;
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                    i
                })
                .await
                .unwrap()
            }));
        }

        let mut done = Vec::new();
        for handle in handles {
            done.push(handle.await.unwrap());
        }
        done.sort_unstable();

        assert_eq!(done, (0..16).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn permit_release_admits_next_waiter() {
        let gate = AcceleratorGate::new();
        let first = gate.admit().await;
        assert!(gate.is_busy());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.admit().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter admitted")
            .unwrap();
        drop(second);
        assert!(!gate.is_busy());
    }
}
