//! Execution of a single agent invocation.
//!
//! The runtime takes a scheduled agent plus its inputs, drives the LLM and
//! any additional tools the agent is authorized for, and returns a fully
//! populated [`AgentInvocation`]. It never returns an error: every failure
//! mode (parse failure, tool failure, timeout, cancellation) is recorded
//! as a value on the invocation, and the synthesizer decides what the
//! partial set means for the job.
//!
//! Contract per invocation:
//!
//! 1. Emit `agent_started`.
//! 2. Assemble the prompt deterministically from the agent's system
//!    prompt, its declared output schema, the raw input, and the parent's
//!    output when one exists. Identical inputs produce identical prompts.
//! 3. Complete through the broker's `llm` tool (the broker owns retry and
//!    backoff). If the response requests tool calls, route them through
//!    the broker and iterate; agents have no other I/O path.
//! 4. Parse the final response as a JSON object, permitting one repair
//!    round-trip on a parse failure.
//! 5. Validate against the declared output schema: every declared key
//!    present, no undeclared keys, values type-checked.
//! 6. Emit `agent_ok`, `agent_error`, or `agent_timeout`.

use crate::domainflow::broker::{ToolBroker, ToolContext};
use crate::domainflow::error::EngineError;
use crate::domainflow::graph::ScheduledAgent;
use crate::domainflow::job::{AgentInvocation, AgentOutput, InvocationStatus};
use crate::domainflow::status::{EventKind, JobEmitter};
use crate::domainflow::types::{AgentDefinition, TenantId, ToolName};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything one invocation needs, assembled by the scheduler.
pub struct InvocationRequest {
    pub tenant_id: TenantId,
    pub job_id: String,
    pub agent: ScheduledAgent,
    pub level: usize,
    pub raw_input: String,
    /// Present iff the agent has a dependency parent and that parent
    /// finished `ok`. Agents must tolerate `None` even when a parent is
    /// declared.
    pub parent_output: Option<AgentOutput>,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub emitter: JobEmitter,
}

/// Stateless executor for single agent invocations. Cheap to clone and
/// share across the per-level fan-out tasks.
#[derive(Clone)]
pub struct AgentRuntime {
    broker: Arc<ToolBroker>,
    /// Ceiling on simultaneous tool calls issued from one invocation.
    tool_call_ceiling: usize,
}

impl AgentRuntime {
    pub fn new(broker: Arc<ToolBroker>, tool_call_ceiling: usize) -> Self {
        Self {
            broker,
            tool_call_ceiling: tool_call_ceiling.max(1),
        }
    }

    /// Run one invocation to a terminal status.
    pub async fn run(&self, request: InvocationRequest) -> AgentInvocation {
        let agent_id = request.agent.agent_id.clone();
        let mut invocation =
            AgentInvocation::pending(request.job_id.clone(), agent_id.clone(), request.level);
        invocation.input_view = match (&request.agent.parent_id, &request.parent_output) {
            (Some(parent), Some(_)) => {
                format!("{} [with output of parent '{}']", request.raw_input, parent)
            }
            (Some(parent), None) => {
                format!("{} [parent '{}' produced no output]", request.raw_input, parent)
            }
            _ => request.raw_input.clone(),
        };
        invocation.status = InvocationStatus::Running;
        invocation.started_at = Some(Utc::now());

        request.emitter.emit(
            EventKind::AgentStarted,
            Some(&agent_id),
            None,
            format!("agent {} started at level {}", agent_id, request.level),
        );

        let outcome = self.execute(&request).await;
        invocation.finished_at = Some(Utc::now());

        match outcome {
            Ok(output) => {
                invocation.status = InvocationStatus::Ok;
                invocation.output = output;
                request.emitter.emit(
                    EventKind::AgentOk,
                    Some(&agent_id),
                    None,
                    format!("agent {} produced {} fields", agent_id, invocation.output.len()),
                );
            }
            Err(EngineError::Cancelled(_)) => {
                invocation.status = InvocationStatus::Cancelled;
            }
            Err(error) => {
                // Deadline expiry shows up as a tool failure from the
                // broker; classify it by the clock, not the message.
                let timed_out = Instant::now() >= request.deadline
                    || matches!(error, EngineError::AgentTimeout(_));
                if timed_out {
                    invocation.status = InvocationStatus::Timeout;
                    let error = EngineError::AgentTimeout(format!(
                        "agent '{}' exceeded its deadline",
                        agent_id
                    ));
                    request.emitter.emit(
                        EventKind::AgentTimeout,
                        Some(&agent_id),
                        None,
                        error.message().to_string(),
                    );
                    invocation.error = Some(error.to_envelope());
                } else {
                    invocation.status = InvocationStatus::Error;
                    request.emitter.emit(
                        EventKind::AgentError,
                        Some(&agent_id),
                        None,
                        format!("agent {} failed: {}", agent_id, error.message()),
                    );
                    invocation.error = Some(error.to_envelope());
                }
                log::warn!(
                    "runtime tenant={} job={} agent={} status={} cause={}",
                    request.tenant_id,
                    request.job_id,
                    agent_id,
                    invocation.status,
                    invocation
                        .error
                        .as_ref()
                        .map(|e| e.code.as_str())
                        .unwrap_or("none")
                );
            }
        }
        invocation
    }

    async fn execute(&self, request: &InvocationRequest) -> Result<AgentOutput, EngineError> {
        let definition = &request.agent.definition;
        let ctx = ToolContext {
            tenant_id: request.tenant_id.clone(),
            agent_id: request.agent.agent_id.clone(),
            job_id: request.job_id.clone(),
            deadline: request.deadline,
            cancel: request.cancel.clone(),
            emitter: Some(request.emitter.clone()),
        };

        let mut prompt = build_prompt(definition, &request.raw_input, request.parent_output.as_ref());
        let mut text = self.complete(&prompt, &ctx).await?;

        // Tool loop: while the model requests tools, execute them through
        // the broker and hand the results back. Bounded so a misbehaving
        // model cannot spin.
        for _ in 0..self.tool_call_ceiling {
            let requested = parse_tool_calls(&text);
            if requested.is_empty() {
                break;
            }
            let mut results = Vec::with_capacity(requested.len());
            let batch: Vec<_> = requested
                .into_iter()
                .take(self.tool_call_ceiling)
                .collect();
            let calls = batch.iter().map(|(tool, params)| {
                let ctx = ctx.clone();
                let broker = Arc::clone(&self.broker);
                let tool = *tool;
                let params = params.clone();
                async move { (tool, broker.invoke(tool, params, &ctx).await) }
            });
            for (tool, result) in join_all(calls).await {
                match result {
                    Ok(value) => results.push(format!(
                        "Tool '{}' result:\n{}",
                        tool,
                        serde_json::to_string(&value).unwrap_or_default()
                    )),
                    Err(EngineError::Cancelled(m)) => return Err(EngineError::Cancelled(m)),
                    Err(error) => results.push(format!(
                        "Tool '{}' failed: {}",
                        tool,
                        error.message()
                    )),
                }
            }
            prompt = format!(
                "{}\n\n{}\n\nUsing these tool results, respond with the final JSON object now.",
                prompt,
                results.join("\n\n")
            );
            text = self.complete(&prompt, &ctx).await?;
        }

        let parsed = match parse_structured(&text) {
            Some(object) => object,
            None => {
                // One repair attempt, then give up.
                let repair = format!(
                    "{}\n\nYour previous reply could not be parsed as JSON. \
                     Respond again with ONLY the JSON object, no prose, no code fences.\n\n\
                     Previous reply:\n{}",
                    prompt, text
                );
                let retried = self.complete(&repair, &ctx).await?;
                parse_structured(&retried).ok_or_else(|| {
                    EngineError::ParseError(format!(
                        "agent '{}' response was not a JSON object after repair",
                        request.agent.agent_id
                    ))
                })?
            }
        };

        validate_output(definition, parsed)
    }

    async fn complete(&self, prompt: &str, ctx: &ToolContext) -> Result<String, EngineError> {
        let response = self
            .broker
            .invoke(
                ToolName::Llm,
                serde_json::json!({ "prompt": prompt }),
                ctx,
            )
            .await?;
        response
            .get("text")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string())
            .ok_or_else(|| {
                EngineError::ToolFailed("llm provider returned no 'text' field".to_string())
            })
    }
}

/// Deterministic prompt assembly: system prompt, declared output contract,
/// raw input, and the parent's output when present.
fn build_prompt(
    definition: &AgentDefinition,
    raw_input: &str,
    parent_output: Option<&AgentOutput>,
) -> String {
    let mut schema_lines = String::new();
    for (key, ty) in definition.output_schema.iter() {
        schema_lines.push_str(&format!("- \"{}\" ({:?})\n", key, ty));
    }

    let mut prompt = format!(
        "{}\n\nRespond with a single JSON object containing exactly these keys:\n{}\n## Input\n{}",
        definition.system_prompt, schema_lines, raw_input
    );

    if let Some(parent_id) = &definition.dependency_parent {
        match parent_output {
            Some(output) => {
                let fields: BTreeMap<&str, &serde_json::Value> = output.iter().collect();
                prompt.push_str(&format!(
                    "\n\n## Output of upstream agent '{}'\n{}",
                    parent_id,
                    serde_json::to_string(&fields).unwrap_or_default()
                ));
            }
            None => {
                prompt.push_str(&format!(
                    "\n\n## Output of upstream agent '{}'\n(unavailable; proceed without it)",
                    parent_id
                ));
            }
        }
    }
    prompt
}

/// Extract tool requests from a model reply. Accepts the single form
/// `{"tool_call": {"name": ..., "parameters": ...}}` and the batch form
/// `{"tool_calls": [...]}`. Unknown tool names are ignored; the broker's
/// ACL handles authorization for the rest.
fn parse_tool_calls(text: &str) -> Vec<(ToolName, serde_json::Value)> {
    let Some(object) = parse_structured(text) else {
        return Vec::new();
    };
    let mut calls = Vec::new();
    let mut push = |entry: &serde_json::Value| {
        let name = entry.get("name").and_then(|n| n.as_str());
        let params = entry.get("parameters").cloned().unwrap_or(serde_json::json!({}));
        if let Some(name) = name {
            if let Ok(tool) = ToolName::from_str(name) {
                calls.push((tool, params));
            }
        }
    };
    if let Some(single) = object.get("tool_call") {
        push(single);
    }
    if let Some(batch) = object.get("tool_calls").and_then(|b| b.as_array()) {
        for entry in batch {
            push(entry);
        }
    }
    calls
}

/// Pull the first JSON object out of a reply, tolerating code fences and
/// surrounding prose. Brace counting, no regex.
fn parse_structured(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..=i];
                    return serde_json::from_str::<serde_json::Value>(candidate)
                        .ok()
                        .and_then(|v| match v {
                            serde_json::Value::Object(map) => Some(map),
                            _ => None,
                        });
                }
            }
            _ => {}
        }
    }
    None
}

/// Check the parsed object against the agent's declared schema and build
/// the validated output record.
fn validate_output(
    definition: &AgentDefinition,
    parsed: serde_json::Map<String, serde_json::Value>,
) -> Result<AgentOutput, EngineError> {
    for key in parsed.keys() {
        if definition.output_schema.field_type(key).is_none() {
            return Err(EngineError::OutputValidation(format!(
                "agent '{}' returned undeclared key '{}'",
                definition.agent_id, key
            )));
        }
    }
    let mut values = BTreeMap::new();
    for (key, ty) in definition.output_schema.iter() {
        let value = parsed.get(key).ok_or_else(|| {
            EngineError::OutputValidation(format!(
                "agent '{}' omitted declared key '{}'",
                definition.agent_id, key
            ))
        })?;
        if !ty.matches(value) {
            return Err(EngineError::OutputValidation(format!(
                "agent '{}' key '{}' has wrong type, expected {:?}",
                definition.agent_id, key, ty
            )));
        }
        values.insert(key.to_string(), value.clone());
    }
    Ok(AgentOutput::new(values))
}
