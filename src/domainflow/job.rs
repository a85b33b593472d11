//! Jobs, agent invocations, and result artifacts.
//!
//! A [`Job`] is one run of the orchestrator over a captured plan snapshot.
//! The job owns its [`AgentInvocation`] records (one per scheduled agent)
//! and its terminal [`ResultArtifact`]. State transitions are monotonic:
//! `queued → running → (succeeded | failed | cancelled)`, and terminal
//! states are sticky.

use crate::domainflow::error::ErrorEnvelope;
use crate::domainflow::graph::Plan;
use crate::domainflow::types::{AgentClass, Interrogative, TenantId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle states of a job. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether moving to `next` respects the monotonic state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (*self, next) {
            (JobState::Queued, JobState::Running) => true,
            (JobState::Queued, JobState::Cancelled) => true,
            (JobState::Running, JobState::Succeeded)
            | (JobState::Running, JobState::Failed)
            | (JobState::Running, JobState::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// The caller-supplied work for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobInput {
    /// Unstructured report text plus opaque attachment references. Bytes
    /// never flow through the engine; attachments are URIs resolved by the
    /// external object store.
    Ingest {
        text: String,
        #[serde(default)]
        attachments: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<u8>,
    },
    /// A natural-language question with optional filters (for example a
    /// time range or a category restriction).
    Query {
        question: String,
        #[serde(default)]
        filters: BTreeMap<String, String>,
    },
}

impl JobInput {
    /// The text handed to agents as their raw input.
    pub fn raw_text(&self) -> &str {
        match self {
            JobInput::Ingest { text, .. } => text,
            JobInput::Query { question, .. } => question,
        }
    }
}

/// One run of the orchestrator for a single ingest or query.
///
/// The `plan_snapshot` is captured at submission and never changes, so the
/// job is reproducible and auditable regardless of later catalog edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub class: AgentClass,
    pub domain_id: String,
    pub input: JobInput,
    pub plan_snapshot: Plan,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Populated when the job fails; carries the job-fatal cause.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
    /// Count of status events emitted so far. Subscribers that miss
    /// best-effort events reconcile against this.
    pub events_emitted: u64,
    /// One record per scheduled agent, in completion order.
    pub invocations: Vec<AgentInvocation>,
    /// Present once the job succeeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ResultArtifact>,
}

/// Terminal states of a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Pending,
    Running,
    Ok,
    Error,
    Timeout,
    Cancelled,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvocationStatus::Pending => "pending",
            InvocationStatus::Running => "running",
            InvocationStatus::Ok => "ok",
            InvocationStatus::Error => "error",
            InvocationStatus::Timeout => "timeout",
            InvocationStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A validated, bounded agent output.
///
/// Produced exactly once at the runtime boundary after the agent's raw
/// response passed schema validation. Downstream components consume this
/// record; no unvalidated map ever escapes the runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    values: BTreeMap<String, serde_json::Value>,
}

impl AgentOutput {
    pub fn new(values: BTreeMap<String, serde_json::Value>) -> Self {
        Self { values }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The agent's self-reported confidence, when the schema declares one.
    /// Used by the synthesizer to break conflicts on promoted fields.
    pub fn confidence(&self) -> Option<f64> {
        self.values.get("confidence").and_then(|v| v.as_f64())
    }
}

/// One row per `(job, agent)`: the audit record of a single invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub job_id: String,
    pub agent_id: String,
    /// Execution level this agent ran at.
    pub level: usize,
    /// The input actually presented to the agent: raw text plus, when a
    /// parent contributed, a note of which parent.
    pub input_view: String,
    /// Validated output; empty unless `status` is `Ok`.
    pub output: AgentOutput,
    pub status: InvocationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// The agent-local failure, when `status` is `Error` or `Timeout`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

impl AgentInvocation {
    pub fn pending(job_id: impl Into<String>, agent_id: impl Into<String>, level: usize) -> Self {
        Self {
            job_id: job_id.into(),
            agent_id: agent_id.into(),
            level,
            input_view: String::new(),
            output: AgentOutput::empty(),
            status: InvocationStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// One bullet of a query artifact: the interrogative axis plus a short
/// insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bullet {
    pub interrogative: Interrogative,
    pub text: String,
}

/// Geographic visualization spec appended when a query surfaced spatial
/// data: a bounding box and the feature set to render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationSpec {
    /// `[min_lon, min_lat, max_lon, max_lat]`.
    pub bounds: [f64; 4],
    pub features: Vec<serde_json::Value>,
}

/// Semantic fields promoted from namespaced agent outputs to the top of an
/// ingest artifact. Precedence on conflict: explicit marking, then highest
/// confidence, then deterministic agent-id order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromotedFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<serde_json::Value>,
}

/// The single merged record written once per successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResultArtifact {
    /// Ingest: namespaced merge of agent outputs plus promoted fields.
    Ingest {
        job_id: String,
        /// Output key `k` from agent `a` lands here as `"a.k"`.
        fields: BTreeMap<String, serde_json::Value>,
        promoted: PromotedFields,
        /// References back to the raw input (text and attachment URIs).
        raw_text: String,
        attachments: Vec<String>,
        /// Terminal status of every scheduled agent.
        agent_status: BTreeMap<String, InvocationStatus>,
    },
    /// Query: ordered bullets plus a short summary.
    Query {
        job_id: String,
        /// One bullet per agent that produced output, in canonical
        /// interrogative order.
        bullets: Vec<Bullet>,
        summary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        visualization: Option<VisualizationSpec>,
        agent_status: BTreeMap<String, InvocationStatus>,
    },
}

impl ResultArtifact {
    /// Whether the artifact carries any synthesized content.
    pub fn is_empty(&self) -> bool {
        match self {
            ResultArtifact::Ingest { fields, .. } => fields.is_empty(),
            ResultArtifact::Query { bullets, .. } => bullets.is_empty(),
        }
    }
}
