//! Global atomic counters for planner and sandbox activity.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a walk).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    plans_built: AtomicU64,
    steps_completed: AtomicU64,
    steps_failed: AtomicU64,
    recoveries_spliced: AtomicU64,
    sandbox_runs: AtomicU64,
    limit_violations: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            plans_built: AtomicU64::new(0),
            steps_completed: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            recoveries_spliced: AtomicU64::new(0),
            sandbox_runs: AtomicU64::new(0),
            limit_violations: AtomicU64::new(0),
        }
    }

    pub fn inc_plans_built(&self) {
        self.plans_built.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "plans_built", "counter incremented");
    }

    pub fn inc_steps_completed(&self) {
        self.steps_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_completed", "counter incremented");
    }

    pub fn inc_steps_failed(&self) {
        self.steps_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_failed", "counter incremented");
    }

    pub fn inc_recoveries(&self) {
        self.recoveries_spliced.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "recoveries_spliced", "counter incremented");
    }

    pub fn inc_sandbox_runs(&self) {
        self.sandbox_runs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sandbox_runs", "counter incremented");
    }

    /// Timeout, memory, output or denylist termination.
    pub fn inc_limit_violations(&self) {
        self.limit_violations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "limit_violations", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a walk, CLI exit)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            plans_built = self.plans_built(),
            steps_completed = self.steps_completed(),
            steps_failed = self.steps_failed(),
            recoveries_spliced = self.recoveries_spliced(),
            sandbox_runs = self.sandbox_runs(),
            limit_violations = self.limit_violations(),
        );
    }

    pub fn plans_built(&self) -> u64 {
        self.plans_built.load(Ordering::Relaxed)
    }

    pub fn steps_completed(&self) -> u64 {
        self.steps_completed.load(Ordering::Relaxed)
    }

    pub fn steps_failed(&self) -> u64 {
        self.steps_failed.load(Ordering::Relaxed)
    }

    pub fn recoveries_spliced(&self) -> u64 {
        self.recoveries_spliced.load(Ordering::Relaxed)
    }

    pub fn sandbox_runs(&self) -> u64 {
        self.sandbox_runs.load(Ordering::Relaxed)
    }

    pub fn limit_violations(&self) -> u64 {
        self.limit_violations.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.plans_built.store(0, Ordering::Relaxed);
        self.steps_completed.store(0, Ordering::Relaxed);
        self.steps_failed.store(0, Ordering::Relaxed);
        self.recoveries_spliced.store(0, Ordering::Relaxed);
        self.sandbox_runs.store(0, Ordering::Relaxed);
        self.limit_violations.store(0, Ordering::Relaxed);
    }
}
