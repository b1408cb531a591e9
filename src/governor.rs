//! Admission control for capture pipelines
//!
//! At most `max_concurrent_captures` pipelines run at once. Further requests
//! wait in a bounded FIFO queue (tokio's semaphore hands permits to waiters in
//! arrival order) and are rejected with `CapacityExceeded` when the queue is
//! full or their wait exceeds `queue_timeout`.

use crate::{format_duration, metrics, CaptureError, GovernorConfig};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug)]
pub struct ConcurrencyGovernor {
    permits: Arc<Semaphore>,
    queue_slots: Arc<Semaphore>,
    counters: Arc<GovernorCounters>,
    max_concurrent: usize,
    max_queued: usize,
    queue_timeout: Duration,
}

#[derive(Debug, Default)]
struct GovernorCounters {
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

impl GovernorCounters {
    fn publish(&self) {
        metrics::set_governor_gauges(
            self.in_flight.load(Ordering::Relaxed),
            self.queued.load(Ordering::Relaxed),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorStats {
    pub in_flight: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queued: usize,
}

impl ConcurrencyGovernor {
    pub fn new(config: &GovernorConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_captures)),
            queue_slots: Arc::new(Semaphore::new(config.max_queued_captures)),
            counters: Arc::new(GovernorCounters::default()),
            max_concurrent: config.max_concurrent_captures,
            max_queued: config.max_queued_captures,
            queue_timeout: config.queue_timeout,
        }
    }

    /// Wait for a capture slot. The returned guard holds the slot until dropped.
    pub async fn admit(&self) -> Result<Admission, CaptureError> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(self.admitted(permit));
        }

        let slot = self.queue_slots.clone().try_acquire_owned().map_err(|_| {
            CaptureError::CapacityExceeded(format!(
                "{} captures running and {} queued",
                self.max_concurrent, self.max_queued
            ))
        })?;

        let waiting = QueuedGuard::enter(self.counters.clone());
        debug!("Capture queued ({} waiting)", self.counters.queued.load(Ordering::Relaxed));

        let acquired = tokio::time::timeout(self.queue_timeout, self.permits.clone().acquire_owned()).await;
        drop(waiting);
        drop(slot);

        match acquired {
            Ok(Ok(permit)) => Ok(self.admitted(permit)),
            Ok(Err(_)) => Err(CaptureError::CapacityExceeded("governor is shut down".to_string())),
            Err(_) => Err(CaptureError::CapacityExceeded(format!(
                "no capture slot became free within {}",
                format_duration(self.queue_timeout)
            ))),
        }
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            max_concurrent: self.max_concurrent,
            max_queued: self.max_queued,
        }
    }

    fn admitted(&self, permit: OwnedSemaphorePermit) -> Admission {
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        self.counters.publish();
        Admission {
            _permit: permit,
            counters: self.counters.clone(),
        }
    }
}

/// A granted capture slot
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GovernorCounters>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.counters.publish();
    }
}

struct QueuedGuard {
    counters: Arc<GovernorCounters>,
}

impl QueuedGuard {
    fn enter(counters: Arc<GovernorCounters>) -> Self {
        counters.queued.fetch_add(1, Ordering::Relaxed);
        counters.publish();
        Self { counters }
    }
}

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        self.counters.queued.fetch_sub(1, Ordering::Relaxed);
        self.counters.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(max_concurrent: usize, max_queued: usize, queue_timeout: Duration) -> Arc<ConcurrencyGovernor> {
        Arc::new(ConcurrencyGovernor::new(&GovernorConfig {
            max_concurrent_captures: max_concurrent,
            max_queued_captures: max_queued,
            queue_timeout,
        }))
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let governor = governor(1, 0, Duration::from_secs(10));
        let _first = governor.admit().await.unwrap();

        let err = governor.admit().await.unwrap_err();
        assert!(matches!(err, CaptureError::CapacityExceeded(_)));
        assert!(err.is_retryable());
        assert_eq!(governor.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_queued_request_is_served_when_slot_frees() {
        let governor = governor(1, 1, Duration::from_secs(10));
        let first = governor.admit().await.unwrap();

        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move { governor.admit().await.map(|_| ()) })
        };

        while governor.stats().queued == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(governor.stats().queued, 1);

        drop(first);
        waiter.await.unwrap().unwrap();

        let stats = governor.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_queued_requests_are_admitted_in_arrival_order() {
        let governor = governor(1, 2, Duration::from_secs(10));
        let first = governor.admit().await.unwrap();
        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        let mut waiters = Vec::new();
        for (position, name) in ["early", "late"].into_iter().enumerate() {
            let governor_for_task = governor.clone();
            let order_tx = order_tx.clone();
            waiters.push(tokio::spawn(async move {
                let admission = governor_for_task.admit().await.unwrap();
                order_tx.send(name).unwrap();
                tokio::task::yield_now().await;
                drop(admission);
            }));

            while governor.stats().queued <= position {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(governor.stats().queued, 2);

        drop(first);
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(order_rx.recv().await, Some("early"));
        assert_eq!(order_rx.recv().await, Some("late"));
        assert_eq!(governor.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_rejects() {
        let governor = governor(1, 4, Duration::from_secs(2));
        let _first = governor.admit().await.unwrap();

        let start = tokio::time::Instant::now();
        let err = governor.admit().await.unwrap_err();
        assert!(matches!(err, CaptureError::CapacityExceeded(_)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2100));
        assert_eq!(governor.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_stats_track_admissions() {
        let governor = governor(3, 2, Duration::from_secs(1));
        let a = governor.admit().await.unwrap();
        let _b = governor.admit().await.unwrap();

        assert_eq!(
            governor.stats(),
            GovernorStats {
                in_flight: 2,
                queued: 0,
                max_concurrent: 3,
                max_queued: 2
            }
        );

        drop(a);
        assert_eq!(governor.stats().in_flight, 1);
    }
}
