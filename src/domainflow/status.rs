//! Per-job progress events and their fan-out to subscribers.
//!
//! Producers (scheduler, agent runtime, tool broker) publish
//! [`StatusEvent`]s through a per-job [`JobEmitter`], which stamps each
//! event with a strictly increasing sequence number starting at 1. The
//! [`StatusBus`] fans events out to subscribers keyed by user identity,
//! optionally filtered to a single job.
//!
//! Delivery is best-effort at-most-once: a subscriber that falls away or
//! misses events reconciles by reading the job record, which carries the
//! emitted-event count. The bus holds no durable state and does not
//! survive a process restart; the durable audit trail lives on the job and
//! its invocation records.

use crate::domainflow::types::{ToolName, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// The closed set of progress-event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlanLoaded,
    AgentStarted,
    ToolInvoked,
    ToolDone,
    ToolFailed,
    AgentOk,
    AgentError,
    AgentTimeout,
    Validating,
    Synthesizing,
    Complete,
    Failed,
    Cancelled,
}

impl EventKind {
    /// Kinds that end a job's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Complete | EventKind::Failed | EventKind::Cancelled
        )
    }
}

/// Wire-stable progress event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: String,
    pub user_id: UserId,
    /// Strictly increasing per job, starting at 1.
    pub sequence: u64,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<ToolName>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

struct Subscriber {
    job_filter: Option<String>,
    sender: mpsc::UnboundedSender<StatusEvent>,
}

/// In-process fan-out of status events, keyed by user identity.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use domainflow::status::{EventKind, StatusBus};
/// use domainflow::types::UserId;
///
/// # async {
/// let bus = Arc::new(StatusBus::new());
/// let user = UserId::new("u-1");
/// let mut stream = bus.subscribe(user.clone(), None);
///
/// let emitter = bus.emitter("job-1", user);
/// emitter.emit(EventKind::PlanLoaded, None, None, "plan has 2 levels");
///
/// let event = stream.recv().await.unwrap();
/// assert_eq!(event.sequence, 1);
/// # };
/// ```
#[derive(Default)]
pub struct StatusBus {
    subscribers: RwLock<HashMap<UserId, Vec<Subscriber>>>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `user_id`, optionally restricted to one
    /// job. Returns the receiving end of an unbounded channel; drop it to
    /// unsubscribe.
    pub fn subscribe(
        &self,
        user_id: UserId,
        job_filter: Option<String>,
    ) -> mpsc::UnboundedReceiver<StatusEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers
            .entry(user_id)
            .or_default()
            .push(Subscriber { job_filter, sender });
        receiver
    }

    /// Create the per-job emitter producers share. The emitter owns the
    /// job's sequence counter, so every event published through it (from
    /// any producer, on any task) gets a unique, increasing sequence.
    pub fn emitter(self: &Arc<Self>, job_id: impl Into<String>, user_id: UserId) -> JobEmitter {
        JobEmitter {
            bus: Arc::clone(self),
            job_id: job_id.into(),
            user_id,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    fn publish(&self, event: StatusEvent) {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = subscribers.get_mut(&event.user_id) {
            // Best effort: closed receivers are pruned, full ones never
            // block (the channel is unbounded), and nothing is redelivered.
            list.retain(|sub| {
                let wants = sub
                    .job_filter
                    .as_ref()
                    .map(|j| *j == event.job_id)
                    .unwrap_or(true);
                if !wants {
                    return !sub.sender.is_closed();
                }
                sub.sender.send(event.clone()).is_ok()
            });
            if list.is_empty() {
                subscribers.remove(&event.user_id);
            }
        }
    }
}

/// Handle producers use to publish events for one job.
///
/// Cloneable and cheap; the scheduler hands clones to the runtime and
/// broker so all three producers share the job's sequence counter.
#[derive(Clone)]
pub struct JobEmitter {
    bus: Arc<StatusBus>,
    job_id: String,
    user_id: UserId,
    sequence: Arc<AtomicU64>,
}

impl JobEmitter {
    /// Publish one event. Assigns the next sequence number and stamps the
    /// current time.
    pub fn emit(
        &self,
        kind: EventKind,
        agent_id: Option<&str>,
        tool_name: Option<ToolName>,
        message: impl Into<String>,
    ) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = StatusEvent {
            job_id: self.job_id.clone(),
            user_id: self.user_id.clone(),
            sequence,
            kind,
            agent_id: agent_id.map(|s| s.to_string()),
            tool_name,
            message: message.into(),
            timestamp: Utc::now(),
        };
        log::debug!(
            "status job={} seq={} kind={:?} agent={:?}",
            event.job_id,
            event.sequence,
            event.kind,
            event.agent_id
        );
        self.bus.publish(event);
    }

    /// How many events this job has emitted so far.
    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}
