//! Cross-agent validation and result synthesis.
//!
//! After the last level joins, the scheduler hands every invocation record
//! here. [`validate_invocations`] runs the cross-agent consistency checks;
//! [`Synthesizer`] then merges the surviving outputs into the job's single
//! [`ResultArtifact`]:
//!
//! - **Ingest**: outputs are merged under namespaced keys (`agent.key`),
//!   and the semantic keys `location`, `timestamp`, and `category` are
//!   additionally promoted to top-level fields. Conflicts on a promoted
//!   field resolve by highest reported confidence, then lexicographic
//!   agent id.
//! - **Query**: one bullet per successful agent, ordered by the canonical
//!   interrogative sequence; a short summary produced by a dedicated LLM
//!   call; a visualization spec appended when any output carried spatial
//!   data.
//!
//! Synthesis tolerates partial input by design. It refuses only when
//! nothing useful survived, or when the question explicitly demanded
//! perspectives that all failed.

use crate::domainflow::broker::{ToolBroker, ToolContext};
use crate::domainflow::error::{EngineError, EngineResult};
use crate::domainflow::graph::Plan;
use crate::domainflow::job::{
    AgentInvocation, Bullet, InvocationStatus, JobInput, PromotedFields, ResultArtifact,
    VisualizationSpec,
};
use crate::domainflow::status::JobEmitter;
use crate::domainflow::types::{TenantId, ToolName};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Semantic keys promoted to the top of an ingest artifact.
const PROMOTED_KEYS: [&str; 3] = ["location", "timestamp", "category"];

/// Filter key a query submission uses to demand specific perspectives.
/// Value is a comma-separated list of interrogative prefixes, lowercase.
pub const REQUIRED_PERSPECTIVES_FILTER: &str = "required_perspectives";

/// Cross-agent consistency checks run before synthesis.
///
/// Confirms every invocation belongs to the job, and that no namespaced
/// key collides across agents (which would indicate a duplicated agent id
/// slipping past the catalog).
pub fn validate_invocations(job_id: &str, invocations: &[AgentInvocation]) -> EngineResult<()> {
    let mut seen_keys = std::collections::HashSet::new();
    let mut seen_agents = std::collections::HashSet::new();
    for invocation in invocations {
        if invocation.job_id != job_id {
            return Err(EngineError::Internal(format!(
                "invocation of agent '{}' belongs to job '{}', expected '{}'",
                invocation.agent_id, invocation.job_id, job_id
            )));
        }
        if !seen_agents.insert(invocation.agent_id.as_str()) {
            return Err(EngineError::Internal(format!(
                "agent '{}' was invoked more than once in job '{}'",
                invocation.agent_id, job_id
            )));
        }
        for (key, _) in invocation.output.iter() {
            let namespaced = format!("{}.{}", invocation.agent_id, key);
            if !seen_keys.insert(namespaced.clone()) {
                return Err(EngineError::Internal(format!(
                    "duplicate artifact key '{}'",
                    namespaced
                )));
            }
        }
    }
    Ok(())
}

/// Synthesis context handed through from the scheduler: identity, budget,
/// and the status emitter for `synthesizing`-phase events.
pub struct SynthesisContext {
    pub tenant_id: TenantId,
    pub job_id: String,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub emitter: JobEmitter,
}

/// Merges validated outputs into the terminal artifact.
pub struct Synthesizer {
    broker: Arc<ToolBroker>,
}

impl Synthesizer {
    pub fn new(broker: Arc<ToolBroker>) -> Self {
        Self { broker }
    }

    /// Namespaced merge for an ingest job.
    pub fn synthesize_ingest(
        &self,
        ctx: &SynthesisContext,
        input: &JobInput,
        invocations: &[AgentInvocation],
    ) -> EngineResult<ResultArtifact> {
        let mut fields: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut agent_status: BTreeMap<String, InvocationStatus> = BTreeMap::new();

        for invocation in invocations {
            agent_status.insert(invocation.agent_id.clone(), invocation.status);
            if invocation.status != InvocationStatus::Ok {
                continue;
            }
            for (key, value) in invocation.output.iter() {
                fields.insert(format!("{}.{}", invocation.agent_id, key), value.clone());
            }
        }

        if fields.is_empty() {
            return Err(EngineError::SynthesisRefused(format!(
                "job '{}' produced no fields to merge",
                ctx.job_id
            )));
        }

        let promoted = promote_fields(invocations);
        let (raw_text, attachments) = match input {
            JobInput::Ingest {
                text, attachments, ..
            } => (text.clone(), attachments.clone()),
            JobInput::Query { question, .. } => (question.clone(), Vec::new()),
        };

        Ok(ResultArtifact::Ingest {
            job_id: ctx.job_id.clone(),
            fields,
            promoted,
            raw_text,
            attachments,
            agent_status,
        })
    }

    /// Bullets, summary, and optional visualization for a query job.
    pub async fn synthesize_query(
        &self,
        ctx: &SynthesisContext,
        input: &JobInput,
        plan: &Plan,
        invocations: &[AgentInvocation],
    ) -> EngineResult<ResultArtifact> {
        let mut bullets: Vec<Bullet> = Vec::new();
        let mut agent_status: BTreeMap<String, InvocationStatus> = BTreeMap::new();

        // Pair each successful invocation with its agent's interrogative.
        let mut ranked: Vec<(usize, String, Bullet)> = Vec::new();
        for invocation in invocations {
            agent_status.insert(invocation.agent_id.clone(), invocation.status);
            if invocation.status != InvocationStatus::Ok {
                continue;
            }
            let interrogative = plan
                .agents
                .get(&invocation.agent_id)
                .and_then(|def| def.interrogative);
            let Some(interrogative) = interrogative else {
                continue;
            };
            let text = bullet_text(invocation);
            ranked.push((
                interrogative.canonical_rank(),
                invocation.agent_id.clone(),
                Bullet {
                    interrogative,
                    text,
                },
            ));
        }
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        for (_, _, bullet) in ranked {
            bullets.push(bullet);
        }

        if bullets.is_empty() {
            return Err(EngineError::SynthesisRefused(format!(
                "job '{}' produced no bullets",
                ctx.job_id
            )));
        }

        if let JobInput::Query { filters, .. } = input {
            check_required_perspectives(filters, &bullets)?;
        }

        let visualization = build_visualization(invocations);
        let summary = self.summarize(ctx, &bullets).await;

        Ok(ResultArtifact::Query {
            job_id: ctx.job_id.clone(),
            bullets,
            summary,
            visualization,
            agent_status,
        })
    }

    /// Dedicated summary completion over the bullets. Degrades to a
    /// concatenation when the LLM is unavailable; a missing summary never
    /// fails a job that has bullets.
    async fn summarize(&self, ctx: &SynthesisContext, bullets: &[Bullet]) -> String {
        let bullet_lines: Vec<String> = bullets
            .iter()
            .map(|b| format!("{}: {}", b.interrogative.display_prefix(), b.text))
            .collect();
        let prompt = format!(
            "Summarize the following findings in two to three sentences, plain prose:\n{}",
            bullet_lines.join("\n")
        );
        let tool_ctx = ToolContext {
            tenant_id: ctx.tenant_id.clone(),
            agent_id: "summary".to_string(),
            job_id: ctx.job_id.clone(),
            deadline: ctx.deadline,
            cancel: ctx.cancel.clone(),
            emitter: Some(ctx.emitter.clone()),
        };
        match self
            .broker
            .invoke_system(
                ToolName::Llm,
                serde_json::json!({ "prompt": prompt }),
                &tool_ctx,
            )
            .await
        {
            Ok(value) => value
                .get("text")
                .and_then(|t| t.as_str())
                .map(|t| t.trim().to_string())
                .unwrap_or_else(|| bullet_lines.join(" ")),
            Err(error) => {
                log::warn!(
                    "synthesizer tenant={} job={} summary call failed: {}",
                    ctx.tenant_id,
                    ctx.job_id,
                    error.message()
                );
                bullet_lines.join(" ")
            }
        }
    }
}

/// Promote the semantic keys, resolving conflicts by confidence then by
/// lexicographic agent id.
fn promote_fields(invocations: &[AgentInvocation]) -> PromotedFields {
    let mut promoted = PromotedFields::default();
    for key in PROMOTED_KEYS {
        let mut candidates: Vec<(&AgentInvocation, &serde_json::Value)> = invocations
            .iter()
            .filter(|inv| inv.status == InvocationStatus::Ok)
            .filter_map(|inv| inv.output.get(key).map(|v| (inv, v)))
            .collect();
        candidates.sort_by(|(a, _), (b, _)| {
            let ca = a.output.confidence().unwrap_or(f64::NEG_INFINITY);
            let cb = b.output.confidence().unwrap_or(f64::NEG_INFINITY);
            cb.partial_cmp(&ca)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        let winner = candidates.first().map(|(_, v)| (*v).clone());
        match key {
            "location" => promoted.location = winner,
            "timestamp" => promoted.timestamp = winner,
            "category" => promoted.category = winner,
            _ => {}
        }
    }
    promoted
}

/// One to two lines of insight for a bullet: the `insight` field when the
/// schema declares one, otherwise the first string value, otherwise the
/// whole output serialized.
fn bullet_text(invocation: &AgentInvocation) -> String {
    if let Some(text) = invocation.output.get("insight").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    if let Some(text) = invocation
        .output
        .iter()
        .find_map(|(_, v)| v.as_str())
    {
        return text.to_string();
    }
    let fields: BTreeMap<&str, &serde_json::Value> = invocation.output.iter().collect();
    serde_json::to_string(&fields).unwrap_or_default()
}

/// Enforce the explicit-demand predicate: when the submission's filters
/// name required perspectives, each named interrogative must have produced
/// a bullet.
fn check_required_perspectives(
    filters: &BTreeMap<String, String>,
    bullets: &[Bullet],
) -> EngineResult<()> {
    let Some(required) = filters.get(REQUIRED_PERSPECTIVES_FILTER) else {
        return Ok(());
    };
    for name in required.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let satisfied = bullets.iter().any(|b| {
            b.interrogative
                .display_prefix()
                .eq_ignore_ascii_case(name)
        });
        if !satisfied {
            return Err(EngineError::SynthesisRefused(format!(
                "required perspective '{}' produced no result",
                name
            )));
        }
    }
    Ok(())
}

/// Collect spatial points from the outputs and build the visualization
/// spec. A point is any object carrying numeric `lat` and `lon`; outputs
/// may contribute one point (for example a geocoded `location`) or an
/// array of them.
fn build_visualization(invocations: &[AgentInvocation]) -> Option<VisualizationSpec> {
    let mut features: Vec<serde_json::Value> = Vec::new();
    for invocation in invocations {
        if invocation.status != InvocationStatus::Ok {
            continue;
        }
        for (_, value) in invocation.output.iter() {
            collect_points(value, &mut features);
        }
    }
    if features.is_empty() {
        return None;
    }

    let mut bounds = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
    for feature in &features {
        let lon = feature.get("lon").and_then(|v| v.as_f64());
        let lat = feature.get("lat").and_then(|v| v.as_f64());
        if let (Some(lon), Some(lat)) = (lon, lat) {
            bounds[0] = bounds[0].min(lon);
            bounds[1] = bounds[1].min(lat);
            bounds[2] = bounds[2].max(lon);
            bounds[3] = bounds[3].max(lat);
        }
    }
    Some(VisualizationSpec { bounds, features })
}

fn collect_points(value: &serde_json::Value, out: &mut Vec<serde_json::Value>) {
    match value {
        serde_json::Value::Object(map) => {
            let has_point = map.get("lat").map(|v| v.is_number()).unwrap_or(false)
                && map.get("lon").map(|v| v.is_number()).unwrap_or(false);
            if has_point {
                out.push(value.clone());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_points(item, out);
            }
        }
        _ => {}
    }
}
