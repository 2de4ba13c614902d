//! Priority scheduling and bounded execution.
//!
//! One dispatch loop pops the highest-priority, earliest-arrived request
//! and spawns an execution unit per pop; true parallelism is capped by a
//! fixed permit pool acquired inside each unit.

pub mod queue;

pub(crate) mod executor;

pub use queue::RequestQueue;

use crate::config::QueueConfig;
use crate::request::RequestType;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

/// Bookkeeping entry for a request in the active set.
#[derive(Debug, Clone)]
pub(crate) struct ActiveEntry {
    pub request_type: RequestType,
    pub client_ip: String,
}

/// Monotonic request counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub total: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
}

/// Shared scheduler state: queue, permit pool, active set, counters.
pub(crate) struct SchedulerCore {
    pub queue: RequestQueue,
    pub semaphore: Semaphore,
    pub active: Mutex<HashMap<String, ActiveEntry>>,
    pub counters: Counters,
    pub running: AtomicBool,
}

impl SchedulerCore {
    pub(crate) fn new(config: &QueueConfig) -> Self {
        Self {
            queue: RequestQueue::new(config.max_queue_size),
            semaphore: Semaphore::new(config.max_concurrent),
            active: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    /// Advisory wait estimate for newly queued work, in seconds.
    ///
    /// Weighted mean of queued duration estimates (weight `1 / 2^priority`)
    /// times the number of requests ahead (queued plus active). Never used
    /// for scheduling decisions.
    pub(crate) fn estimated_wait_secs(&self) -> f64 {
        let queue_len = self.queue.len();
        if queue_len == 0 {
            return 0.0;
        }
        let avg = self.queue.average_estimated_secs().unwrap_or(5.0);
        (queue_len + self.active_count()) as f64 * avg
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            total_requests: self.counters.total.load(Ordering::Relaxed),
            completed_requests: self.counters.completed.load(Ordering::Relaxed),
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            rejected_requests: self.counters.rejected.load(Ordering::Relaxed),
            queue_size: self.queue.len(),
            active_count: self.active_count(),
            active_requests: self.lock_active().keys().cloned().collect(),
            is_running: self.running.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveEntry>> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    /// Requests ever admitted.
    pub total_requests: u64,
    /// Requests that completed successfully.
    pub completed_requests: u64,
    /// Requests that failed or timed out during execution.
    pub failed_requests: u64,
    /// Submissions rejected at admission.
    pub rejected_requests: u64,
    /// Requests currently queued.
    pub queue_size: usize,
    /// Requests currently executing (or awaiting a permit).
    pub active_count: usize,
    /// Ids of requests in the active set.
    pub active_requests: Vec<String>,
    /// Whether the dispatch loop is running.
    pub is_running: bool,
}
