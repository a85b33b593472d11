//! Engine-wide error taxonomy.
//!
//! Every failure the engine can surface is one of a closed set of variants,
//! each carrying a human-readable message. Callers branch on the variant,
//! not on message text. The taxonomy splits into five families:
//!
//! - **Validation**: structural problems in configuration writes. Reported
//!   to the caller verbatim and never retried.
//! - **Authorization**: identity or ACL refusals, including cross-tenant
//!   access attempts. Never retried.
//! - **Agent-local**: failures of a single agent invocation (parse errors,
//!   timeouts, tool failures). These are recovered locally: they become
//!   values on the invocation record and never abort a job by themselves.
//! - **Job-fatal**: conditions that move a whole job to `failed`.
//! - **Capacity / lifecycle**: backpressure rejections and cooperative
//!   cancellation.
//!
//! The wire shape for external surfaces is [`ErrorEnvelope`], produced via
//! [`EngineError::to_envelope`].

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Convenience alias used by every fallible engine operation.
pub type EngineResult<T> = Result<T, EngineError>;

/// The closed set of failures the engine can report.
///
/// Variants carry a message with the offending identifiers; the variant
/// itself is the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    // ── Validation ───────────────────────────────────────────────────────
    /// An agent definition's output schema exceeds the bounded-output cap
    /// or is otherwise malformed.
    SchemaViolation(String),

    /// A referenced entity (agent, playbook, template, parent) does not
    /// exist or is not usable in this position.
    BadReference(String),

    /// An agent's class does not match the class of the playbook or parent
    /// that references it.
    ClassMismatch(String),

    /// The dependency graph contains a cycle.
    Cycle(String),

    /// Some node in the dependency graph has more than one incoming edge.
    MultiParent(String),

    /// The dependency graph chains parents: a node with a parent is itself
    /// the parent of another node.
    MultiLevel(String),

    /// A dependency edge references an agent outside the playbook.
    DanglingEdge(String),

    /// An attempt was made to modify or delete a built-in agent.
    BuiltinImmutable(String),

    /// An agent's output failed validation against its declared schema.
    OutputValidation(String),

    // ── Authorization ────────────────────────────────────────────────────
    /// The caller's identity is not allowed to perform this operation.
    Unauthorized(String),

    /// The agent is not permitted to invoke the requested tool.
    ToolDenied(String),

    /// The operation's tenant does not match the tenant of the entity it
    /// touches. Tenancy is structural; this is always a bug or an attack.
    CrossTenant(String),

    // ── Agent-local (recovered onto the invocation record) ───────────────
    /// The agent's response could not be parsed as structured output, even
    /// after the single permitted repair attempt.
    ParseError(String),

    /// The invocation exceeded its deadline.
    AgentTimeout(String),

    /// A tool call failed after the broker exhausted its retries.
    ToolFailed(String),

    // ── Job-fatal ────────────────────────────────────────────────────────
    /// Every agent in the job failed; there is nothing to synthesize.
    NoViableAgents(String),

    /// The synthesizer refused the partial result set.
    SynthesisRefused(String),

    /// An unhandled internal error. The message is diagnostic only.
    Internal(String),

    // ── Capacity ─────────────────────────────────────────────────────────
    /// The scheduler queue is at its high-water mark; retry later.
    AtCapacity(String),

    /// A downstream resource is shedding load; retry later.
    Backpressure(String),

    // ── Lifecycle ────────────────────────────────────────────────────────
    /// The job or invocation was cancelled. Terminal, but not a failure.
    Cancelled(String),
}

impl EngineError {
    /// Stable machine-readable code for the wire envelope.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SchemaViolation(_) => "SchemaViolation",
            EngineError::BadReference(_) => "BadReference",
            EngineError::ClassMismatch(_) => "ClassMismatch",
            EngineError::Cycle(_) => "Cycle",
            EngineError::MultiParent(_) => "MultiParent",
            EngineError::MultiLevel(_) => "MultiLevel",
            EngineError::DanglingEdge(_) => "DanglingEdge",
            EngineError::BuiltinImmutable(_) => "BuiltinImmutable",
            EngineError::OutputValidation(_) => "OutputValidation",
            EngineError::Unauthorized(_) => "Unauthorized",
            EngineError::ToolDenied(_) => "ToolDenied",
            EngineError::CrossTenant(_) => "CrossTenant",
            EngineError::ParseError(_) => "ParseError",
            EngineError::AgentTimeout(_) => "AgentTimeout",
            EngineError::ToolFailed(_) => "ToolFailed",
            EngineError::NoViableAgents(_) => "NoViableAgents",
            EngineError::SynthesisRefused(_) => "SynthesisRefused",
            EngineError::Internal(_) => "Internal",
            EngineError::AtCapacity(_) => "AtCapacity",
            EngineError::Backpressure(_) => "Backpressure",
            EngineError::Cancelled(_) => "Cancelled",
        }
    }

    /// The message carried by the variant.
    pub fn message(&self) -> &str {
        match self {
            EngineError::SchemaViolation(m)
            | EngineError::BadReference(m)
            | EngineError::ClassMismatch(m)
            | EngineError::Cycle(m)
            | EngineError::MultiParent(m)
            | EngineError::MultiLevel(m)
            | EngineError::DanglingEdge(m)
            | EngineError::BuiltinImmutable(m)
            | EngineError::OutputValidation(m)
            | EngineError::Unauthorized(m)
            | EngineError::ToolDenied(m)
            | EngineError::CrossTenant(m)
            | EngineError::ParseError(m)
            | EngineError::AgentTimeout(m)
            | EngineError::ToolFailed(m)
            | EngineError::NoViableAgents(m)
            | EngineError::SynthesisRefused(m)
            | EngineError::Internal(m)
            | EngineError::AtCapacity(m)
            | EngineError::Backpressure(m)
            | EngineError::Cancelled(m) => m,
        }
    }

    /// Whether the caller may retry the operation unchanged.
    ///
    /// Only capacity conditions are retryable. Validation and authorization
    /// failures will fail the same way every time, and agent-local failures
    /// have already been retried by the broker or runtime.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            EngineError::AtCapacity(_) | EngineError::Backpressure(_)
        )
    }

    /// Whether this failure is recovered locally onto the invocation
    /// record rather than propagated to the scheduler.
    pub fn is_agent_local(&self) -> bool {
        matches!(
            self,
            EngineError::ParseError(_)
                | EngineError::AgentTimeout(_)
                | EngineError::ToolFailed(_)
        )
    }

    /// Whether this failure moves the owning job to `failed`.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::NoViableAgents(_)
                | EngineError::SynthesisRefused(_)
                | EngineError::Internal(_)
        )
    }

    /// Process exit code for CLI surfaces: 1 unrecoverable, 2 validation,
    /// 3 capacity.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::SchemaViolation(_)
            | EngineError::BadReference(_)
            | EngineError::ClassMismatch(_)
            | EngineError::Cycle(_)
            | EngineError::MultiParent(_)
            | EngineError::MultiLevel(_)
            | EngineError::DanglingEdge(_)
            | EngineError::BuiltinImmutable(_)
            | EngineError::OutputValidation(_) => 2,
            EngineError::AtCapacity(_) | EngineError::Backpressure(_) => 3,
            _ => 1,
        }
    }

    /// Build the wire-stable envelope for external surfaces.
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code().to_string(),
            message: self.message().to_string(),
            retryable: self.retryable(),
            details: None,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl Error for EngineError {}

/// Wire-stable error shape: `{code, message, retryable, details?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// One of the [`EngineError`] codes.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Hint that retrying the same request may succeed.
    pub retryable: bool,
    /// Optional structured detail payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
