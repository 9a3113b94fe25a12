//! Analysis events and the real-time event broadcaster
//!
//! Events describe job progress and outcomes for one repository. The
//! [`EventBroadcaster`] fans each event out to the repository's subscribers
//! and to the global activity feed.
//!
//! Delivery is best-effort and never blocks the publisher: every subscriber
//! owns a bounded queue, and a subscriber whose queue is full is dropped.
//! Its stream then ends, and the client must reconnect and re-fetch state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Queue topic for completed jobs
pub const TOPIC_ANALYSIS_COMPLETED: &str = "analysis.completed";
/// Queue topic for failed jobs
pub const TOPIC_ANALYSIS_FAILED: &str = "analysis.failed";
/// Queue topic for insight batches written by an analyzer
pub const TOPIC_INSIGHTS_GENERATED: &str = "insights.generated";

/// All queue topics, in a stable order
pub const QUEUE_TOPICS: [&str; 3] = [
    TOPIC_ANALYSIS_COMPLETED,
    TOPIC_ANALYSIS_FAILED,
    TOPIC_INSIGHTS_GENERATED,
];

/// Coarse event category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Completed,
    Failed,
    Cancelled,
}

/// Analysis job events
///
/// Serialized with a `type` tag for SSE and queue payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnalysisEvent {
    /// Job accepted and waiting for a worker
    JobQueued {
        job_id: Uuid,
        repository_id: Uuid,
        /// `owner/name`
        repository: String,
        analyzers: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Progress percentage changed
    JobProgress {
        job_id: Uuid,
        repository_id: Uuid,
        /// 0-100, never decreases within a job
        progress_percent: u8,
        /// Pipeline stage ("fetching", "analyzing", ...)
        stage: String,
        timestamp: DateTime<Utc>,
    },

    /// One analyzer finished and its insights are persisted
    AnalyzerCompleted {
        job_id: Uuid,
        repository_id: Uuid,
        analyzer: String,
        insight_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// One analyzer failed; siblings keep running
    AnalyzerFailed {
        job_id: Uuid,
        repository_id: Uuid,
        analyzer: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Job reached `Completed`
    JobCompleted {
        job_id: Uuid,
        repository_id: Uuid,
        insight_count: usize,
        /// Resource kinds that could not be fully fetched
        degraded_kinds: Vec<String>,
        failed_analyzers: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Job reached `Failed`
    JobFailed {
        job_id: Uuid,
        repository_id: Uuid,
        error: String,
        degraded_kinds: Vec<String>,
        failed_analyzers: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Job reached `Cancelled`
    JobCancelled {
        job_id: Uuid,
        repository_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl AnalysisEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            AnalysisEvent::JobQueued { .. } => "JobQueued",
            AnalysisEvent::JobProgress { .. } => "JobProgress",
            AnalysisEvent::AnalyzerCompleted { .. } => "AnalyzerCompleted",
            AnalysisEvent::AnalyzerFailed { .. } => "AnalyzerFailed",
            AnalysisEvent::JobCompleted { .. } => "JobCompleted",
            AnalysisEvent::JobFailed { .. } => "JobFailed",
            AnalysisEvent::JobCancelled { .. } => "JobCancelled",
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            AnalysisEvent::JobQueued { .. }
            | AnalysisEvent::JobProgress { .. }
            | AnalysisEvent::AnalyzerCompleted { .. }
            | AnalysisEvent::AnalyzerFailed { .. } => EventKind::Progress,
            AnalysisEvent::JobCompleted { .. } => EventKind::Completed,
            AnalysisEvent::JobFailed { .. } => EventKind::Failed,
            AnalysisEvent::JobCancelled { .. } => EventKind::Cancelled,
        }
    }

    pub fn repository_id(&self) -> Uuid {
        match self {
            AnalysisEvent::JobQueued { repository_id, .. }
            | AnalysisEvent::JobProgress { repository_id, .. }
            | AnalysisEvent::AnalyzerCompleted { repository_id, .. }
            | AnalysisEvent::AnalyzerFailed { repository_id, .. }
            | AnalysisEvent::JobCompleted { repository_id, .. }
            | AnalysisEvent::JobFailed { repository_id, .. }
            | AnalysisEvent::JobCancelled { repository_id, .. } => *repository_id,
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            AnalysisEvent::JobQueued { job_id, .. }
            | AnalysisEvent::JobProgress { job_id, .. }
            | AnalysisEvent::AnalyzerCompleted { job_id, .. }
            | AnalysisEvent::AnalyzerFailed { job_id, .. }
            | AnalysisEvent::JobCompleted { job_id, .. }
            | AnalysisEvent::JobFailed { job_id, .. }
            | AnalysisEvent::JobCancelled { job_id, .. } => *job_id,
        }
    }

    /// Queue topic this event is mirrored to, if any
    pub fn queue_topic(&self) -> Option<&'static str> {
        match self {
            AnalysisEvent::JobCompleted { .. } => Some(TOPIC_ANALYSIS_COMPLETED),
            AnalysisEvent::JobFailed { .. } => Some(TOPIC_ANALYSIS_FAILED),
            AnalysisEvent::AnalyzerCompleted { insight_count, .. } if *insight_count > 0 => {
                Some(TOPIC_INSIGHTS_GENERATED)
            }
            _ => None,
        }
    }
}

/// Subscription target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Every event for every repository
    Global,
    /// Events for one repository
    Repository(Uuid),
}

/// Outcome of a single publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers the event was queued for
    pub delivered: usize,
    /// Subscribers removed because their queue was full
    pub dropped: usize,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<AnalysisEvent>,
}

struct Inner {
    channels: Mutex<HashMap<Channel, Vec<Subscriber>>>,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
    subscriber_queue: usize,
    global_queue: usize,
}

/// Non-blocking publisher with per-subscriber bounded queues
///
/// Cheap to clone; all clones share the subscriber registry.
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

/// Receiving half handed to one subscriber
///
/// `recv` returns `None` once the broadcaster dropped this subscriber
/// (queue overflow) or was itself dropped.
pub struct Subscription {
    id: u64,
    channel: Channel,
    rx: mpsc::Receiver<AnalysisEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub async fn recv(&mut self) -> Option<AnalysisEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive, `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<AnalysisEvent> {
        self.rx.try_recv().ok()
    }
}

impl EventBroadcaster {
    /// Create a broadcaster
    ///
    /// # Arguments
    /// * `subscriber_queue` - queue length for repository subscribers
    /// * `global_queue` - queue length for global feed subscribers (busier)
    pub fn new(subscriber_queue: usize, global_queue: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dropped_total: AtomicU64::new(0),
                subscriber_queue: subscriber_queue.max(1),
                global_queue: global_queue.max(1),
            }),
        }
    }

    /// Register a new subscriber on `channel`
    pub fn subscribe(&self, channel: Channel) -> Subscription {
        let capacity = match channel {
            Channel::Global => self.inner.global_queue,
            Channel::Repository(_) => self.inner.subscriber_queue,
        };
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut channels = self.lock_channels();
        channels
            .entry(channel)
            .or_default()
            .push(Subscriber { id, tx });

        debug!(subscriber = id, ?channel, "Subscriber registered");
        Subscription { id, channel, rx }
    }

    /// Deliver `event` to its repository channel and the global channel
    ///
    /// Never awaits. Full queues cause the subscriber to be dropped;
    /// closed receivers are pruned.
    pub fn publish(&self, event: &AnalysisEvent) -> PublishReport {
        let mut report = PublishReport::default();
        let targets = [Channel::Repository(event.repository_id()), Channel::Global];

        let mut channels = self.lock_channels();
        for channel in targets {
            let Some(subscribers) = channels.get_mut(&channel) else {
                continue;
            };

            subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscriber = sub.id,
                        ?channel,
                        event = event.event_type(),
                        "Subscriber queue full, dropping subscriber"
                    );
                    report.dropped += 1;
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = sub.id, "Subscriber disconnected");
                    false
                }
            });

            if subscribers.is_empty() {
                channels.remove(&channel);
            }
        }
        drop(channels);

        if report.dropped > 0 {
            self.inner
                .dropped_total
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
        }

        report
    }

    /// Number of live subscribers on `channel`
    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.lock_channels()
            .get(&channel)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Subscribers dropped for overflow since startup
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<Channel, Vec<Subscriber>>> {
        // The registry holds no invariants a panicking holder could break.
        self.inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
