//! Lifecycle event stream for job/restore collaborators.
//!
//! Every subscriber owns a bounded queue. When a queue is full, the oldest
//! queued progress event is dropped to make room; lifecycle (non-progress)
//! events are never dropped, so a slow subscriber may temporarily hold more
//! than `capacity` entries if it falls behind on terminal events alone.

use super::job::{JobError, JobKind, JobStage, JobStatus, ProgressSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    JobCreated {
        job_id: Uuid,
        kind: JobKind,
        policy_id: String,
    },
    StatusChanged {
        job_id: Uuid,
        kind: JobKind,
        status: JobStatus,
    },
    Progress {
        job_id: Uuid,
        kind: JobKind,
        progress: ProgressSnapshot,
    },
    Terminal {
        job_id: Uuid,
        kind: JobKind,
        policy_id: String,
        status: JobStatus,
        record_id: Option<Uuid>,
        error: Option<JobError>,
    },
    TriggerSkipped {
        policy_id: String,
        reason: String,
    },
    IntegrityAlert {
        policy_id: Option<String>,
        record_id: Option<Uuid>,
        provider: Option<String>,
        message: String,
    },
    ConfigurationError {
        entity: String,
        message: String,
    },
}

impl LifecycleEvent {
    pub fn is_progress(&self) -> bool {
        matches!(self, LifecycleEvent::Progress { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleEvent::Terminal { .. })
    }
}

#[derive(Debug)]
struct SubscriberQueue {
    buffer: Mutex<VecDeque<LifecycleEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn push(&self, event: LifecycleEvent) {
        let Ok(mut buffer) = self.buffer.lock() else {
            return;
        };

        if buffer.len() >= self.capacity {
            if let Some(position) = buffer.iter().position(LifecycleEvent::is_progress) {
                buffer.remove(position);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            } else if event.is_progress() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        buffer.push_back(event);
        drop(buffer);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<LifecycleEvent> {
        self.buffer.lock().ok()?.pop_front()
    }
}

/// Fan-out of lifecycle events with per-subscriber backpressure.
#[derive(Debug)]
pub struct EventBus {
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        let queue = Arc::new(SubscriberQueue {
            buffer: Mutex::new(VecDeque::with_capacity(self.capacity)),
            notify: Notify::new(),
            capacity: self.capacity,
            dropped: AtomicU64::new(0),
        });

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Arc::downgrade(&queue));
        }

        EventSubscription { queue }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let live: Vec<Arc<SubscriberQueue>> = match self.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.retain(|s| s.strong_count() > 0);
                subscribers.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => return,
        };

        for queue in live {
            queue.push(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|s| s.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Receiving end of an [`EventBus`] subscription
#[derive(Debug)]
pub struct EventSubscription {
    queue: Arc<SubscriberQueue>,
}

impl EventSubscription {
    pub async fn recv(&self) -> LifecycleEvent {
        loop {
            if let Some(event) = self.queue.pop() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<LifecycleEvent> {
        self.queue.pop()
    }

    /// Number of progress events dropped because this subscriber lagged
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }
}

/// Lets at most one progress event through per interval.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Tracks a running job's progress, shares the latest snapshot with status
/// readers and publishes throttled progress events.
#[derive(Debug)]
pub struct ProgressReporter {
    job_id: Uuid,
    kind: JobKind,
    bus: Arc<EventBus>,
    throttle: ProgressThrottle,
    shared: Arc<Mutex<ProgressSnapshot>>,
    started: Instant,
}

impl ProgressReporter {
    pub fn new(job_id: Uuid, kind: JobKind, bus: Arc<EventBus>, interval: Duration) -> Self {
        Self {
            job_id,
            kind,
            bus,
            throttle: ProgressThrottle::new(interval),
            shared: Arc::new(Mutex::new(ProgressSnapshot::default())),
            started: Instant::now(),
        }
    }

    pub fn shared(&self) -> Arc<Mutex<ProgressSnapshot>> {
        self.shared.clone()
    }

    pub fn update(&mut self, stage: JobStage, current: u64, total: u64, item: Option<String>) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            current as f64 / elapsed
        } else {
            0.0
        };
        let eta_seconds = if throughput > 0.0 && total >= current {
            Some(((total - current) as f64 / throughput).ceil() as u64)
        } else {
            None
        };

        let snapshot = ProgressSnapshot {
            stage,
            current,
            total,
            current_item: item,
            throughput_bytes_per_sec: throughput,
            eta_seconds,
        };

        if let Ok(mut shared) = self.shared.lock() {
            *shared = snapshot.clone();
        }

        if self.throttle.ready() {
            self.bus.publish(LifecycleEvent::Progress {
                job_id: self.job_id,
                kind: self.kind,
                progress: snapshot,
            });
        }
    }

    pub fn set_stage(&mut self, stage: JobStage) {
        let (current, total) = self
            .shared
            .lock()
            .map(|s| (s.current, s.total))
            .unwrap_or((0, 0));
        self.update(stage, current, total, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(job_id: Uuid, current: u64) -> LifecycleEvent {
        LifecycleEvent::Progress {
            job_id,
            kind: JobKind::Backup,
            progress: ProgressSnapshot {
                current,
                ..Default::default()
            },
        }
    }

    fn terminal(job_id: Uuid) -> LifecycleEvent {
        LifecycleEvent::Terminal {
            job_id,
            kind: JobKind::Backup,
            policy_id: "nightly".to_string(),
            status: JobStatus::Completed,
            record_id: None,
            error: None,
        }
    }

    #[test]
    fn test_full_queue_drops_oldest_progress_first() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe();
        let job = Uuid::new_v4();

        bus.publish(progress(job, 1));
        bus.publish(progress(job, 2));
        bus.publish(progress(job, 3));

        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.try_recv(), Some(progress(job, 2)));
        assert_eq!(sub.try_recv(), Some(progress(job, 3)));
    }

    #[test]
    fn test_terminal_events_are_never_dropped() {
        let bus = EventBus::new(1);
        let sub = bus.subscribe();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        bus.publish(terminal(a));
        bus.publish(progress(b, 1));
        bus.publish(terminal(b));

        assert_eq!(sub.try_recv(), Some(terminal(a)));
        assert_eq!(sub.try_recv(), Some(terminal(b)));
        assert_eq!(sub.try_recv(), None);
        assert_eq!(sub.dropped(), 1);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(terminal(Uuid::new_v4()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_limits_rate() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(100));
        assert!(throttle.ready());
        assert!(!throttle.ready());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(throttle.ready());
    }
}
