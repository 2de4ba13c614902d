//! Bounded priority queue keyed on (priority, arrival order).
//!
//! A binary max-heap pops the highest-priority, earliest-arrived entry;
//! a monotonic sequence number assigned at push preserves FIFO among
//! equal priorities. Capacity overflow is a hard rejection, never a
//! block.

use crate::error::{PipelineError, Result};
use crate::request::PipelineRequest;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Heap entry; ordering is (priority, then arrival order).
struct QueueEntry {
    priority: u8,
    seq: u64,
    request: PipelineRequest,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins; among equals the lower sequence
        // number (earlier arrival) wins.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

/// Bounded priority queue shared between admission and the dispatch loop.
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    notify: Notify,
}

impl RequestQueue {
    /// Create a queue holding at most `capacity` requests.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::with_capacity(capacity),
                next_seq: 0,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Number of queued requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_inner().heap.len()
    }

    /// Whether the queue holds no requests.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Push a request, returning its queue position (1-based).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::QueueFull`] at capacity; never blocks.
    pub fn try_push(&self, request: PipelineRequest) -> Result<usize> {
        let position = {
            let mut inner = self.lock_inner();
            if inner.heap.len() >= self.capacity {
                return Err(PipelineError::QueueFull);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueueEntry {
                priority: request.priority,
                seq,
                request,
            });
            inner.heap.len()
        };
        self.notify.notify_one();
        Ok(position)
    }

    /// Pop the highest-priority, earliest-arrived request, if any.
    #[must_use]
    pub fn try_pop(&self) -> Option<PipelineRequest> {
        self.lock_inner().heap.pop().map(|entry| entry.request)
    }

    /// Pop the next request, waiting while the queue is empty.
    pub async fn pop(&self) -> PipelineRequest {
        loop {
            if let Some(request) = self.try_pop() {
                return request;
            }
            self.notify.notified().await;
        }
    }

    /// Priority-weighted mean of queued duration estimates, in seconds.
    ///
    /// Each entry weighs `1 / 2^priority`. `None` when the queue is empty.
    #[must_use]
    pub fn average_estimated_secs(&self) -> Option<f64> {
        let inner = self.lock_inner();
        if inner.heap.is_empty() {
            return None;
        }
        let mut weighted_total = 0.0_f64;
        let mut total_weight = 0.0_f64;
        for entry in &inner.heap {
            let weight = 1.0 / f64::powi(2.0, i32::from(entry.priority));
            weighted_total += entry.request.estimated_duration.as_secs_f64() * weight;
            total_weight += weight;
        }
        (total_weight > 0.0).then(|| weighted_total / total_weight)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::events::WireEvent;
    use crate::request::{RequestPayload, RequestType};
    use crate::sink::EventSink;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn send(&self, _event: WireEvent) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn request(id: &str, priority: u8) -> PipelineRequest {
        PipelineRequest {
            id: id.to_owned(),
            request_type: RequestType::Audio,
            client_ip: "10.0.0.1".to_owned(),
            session_token: "tok".to_owned(),
            payload: RequestPayload::default(),
            submitted_at: chrono::Utc::now(),
            priority,
            estimated_duration: Duration::from_secs(8),
            sink: Arc::new(NullSink),
        }
    }

    #[test]
    fn higher_priority_pops_first() {
        let queue = RequestQueue::new(10);
        queue.try_push(request("a", 1)).unwrap();
        queue.try_push(request("b", 3)).unwrap();
        queue.try_push(request("c", 2)).unwrap();

        assert_eq!(queue.try_pop().unwrap().id, "b");
        assert_eq!(queue.try_pop().unwrap().id, "c");
        assert_eq!(queue.try_pop().unwrap().id, "a");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn equal_priority_is_fifo() {
        let queue = RequestQueue::new(10);
        for id in ["first", "second", "third"] {
            queue.try_push(request(id, 1)).unwrap();
        }
        assert_eq!(queue.try_pop().unwrap().id, "first");
        assert_eq!(queue.try_pop().unwrap().id, "second");
        assert_eq!(queue.try_pop().unwrap().id, "third");
    }

    #[test]
    fn late_high_priority_overtakes_waiting_low_priority() {
        let queue = RequestQueue::new(10);
        queue.try_push(request("audio_turn", 1)).unwrap();
        queue.try_push(request("followup", 3)).unwrap();
        assert_eq!(queue.try_pop().unwrap().id, "followup");
    }

    #[test]
    fn capacity_overflow_is_a_hard_rejection() {
        let queue = RequestQueue::new(2);
        assert_eq!(queue.try_push(request("a", 1)).unwrap(), 1);
        assert_eq!(queue.try_push(request("b", 1)).unwrap(), 2);
        assert!(matches!(
            queue.try_push(request("c", 1)),
            Err(PipelineError::QueueFull)
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn weighted_estimate_favors_high_priority_entries() {
        let queue = RequestQueue::new(10);
        assert!(queue.average_estimated_secs().is_none());

        let mut short = request("short", 3);
        short.estimated_duration = Duration::from_secs(2);
        let mut long = request("long", 1);
        long.estimated_duration = Duration::from_secs(10);
        queue.try_push(short).unwrap();
        queue.try_push(long).unwrap();

        let avg = queue.average_estimated_secs().unwrap();
        // Priority 3 weighs 1/8, priority 1 weighs 1/2:
        // (2/8 + 10/2) / (1/8 + 1/2) = 8.4
        assert!((avg - 8.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(RequestQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.id })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.try_push(request("wake", 1)).unwrap();
        assert_eq!(waiter.await.unwrap(), "wake");
    }
}
