use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use th_telemetry::metrics::{global_metrics, MAX_CONCURRENT_APPS, RUNNING_APPS};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// AdmissionController
// ---------------------------------------------------------------------------

/// Process-wide cap on how many child processes may run at once.
///
/// Acquisition never blocks: a caller either gets a slot immediately or is
/// told the server is busy. There is no queue.
pub struct AdmissionController {
    max_concurrent: usize,
    current_jobs: Mutex<usize>,
}

impl AdmissionController {
    /// Create a controller with the given capacity. A capacity of zero is
    /// raised to one.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        info!(max_concurrent, "creating AdmissionController");
        global_metrics().set_gauge(MAX_CONCURRENT_APPS, max_concurrent as i64);
        Self {
            max_concurrent,
            current_jobs: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.current_jobs.lock().unwrap_or_else(|e| {
            warn!("admission lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.lock();
        if *current >= self.max_concurrent {
            info!(
                current_jobs = *current,
                max_concurrent = self.max_concurrent,
                "admission denied"
            );
            return false;
        }
        *current += 1;
        record(*current, self.max_concurrent, "app admitted");
        true
    }

    /// Give a slot back. Never drops below zero.
    pub fn release(&self) {
        let mut current = self.lock();
        if *current == 0 {
            warn!(max_concurrent = self.max_concurrent, "release with no jobs running");
        }
        *current = current.saturating_sub(1);
        record(*current, self.max_concurrent, "app released");
    }

    /// Like [`try_acquire`](Self::try_acquire), but returns an owned slot that
    /// gives itself back exactly once.
    pub fn acquire_slot(self: &Arc<Self>) -> Option<AdmissionSlot> {
        self.try_acquire().then(|| AdmissionSlot {
            controller: Arc::clone(self),
            released: AtomicBool::new(false),
        })
    }

    /// Number of slots currently taken.
    pub fn current_jobs(&self) -> usize {
        *self.lock()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

fn record(current_jobs: usize, max_concurrent: usize, msg: &'static str) {
    info!(current_jobs, max_concurrent, "{msg}");
    global_metrics().set_gauge(RUNNING_APPS, current_jobs as i64);
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("max_concurrent", &self.max_concurrent)
            .field("current_jobs", &self.current_jobs())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AdmissionSlot
// ---------------------------------------------------------------------------

/// One admitted process's claim on the controller.
///
/// Whichever path finishes with the process first (natural exit or forced
/// teardown) calls [`release`](Self::release); later calls are no-ops.
/// Dropping an unreleased slot releases it.
pub struct AdmissionSlot {
    controller: Arc<AdmissionController>,
    released: AtomicBool,
}

impl AdmissionSlot {
    /// Returns `true` if this call performed the release.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.controller.release();
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for AdmissionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionSlot")
            .field("released", &self.is_released())
            .finish()
    }
}
