//! Uniform broker over the closed tool set.
//!
//! Agents never perform direct I/O. Every capability (LLM completion,
//! entity extraction, geocoding, web search, the `data.*` family, vector
//! search, custom HTTP) is reached by symbolic [`ToolName`] through
//! [`ToolBroker::invoke`], which:
//!
//! 1. checks the per-`(tenant, agent)` ACL, consulting a TTL'd in-process
//!    permission cache that explicit permission changes invalidate,
//! 2. acquires the tool's concurrency semaphore, with the caller's
//!    deadline applied to the wait,
//! 3. dispatches to the registered [`ToolProvider`], retrying transient
//!    failures with exponential backoff and jitter for idempotent tools,
//! 4. emits `tool_invoked` / `tool_done` / `tool_failed` status events.
//!
//! Credentials come from a [`SecretProvider`] and are cached in memory
//! only; they never appear in events, logs, or outputs.

use crate::domainflow::config::{EngineConfig, RetryPolicy};
use crate::domainflow::error::{EngineError, EngineResult};
use crate::domainflow::status::{EventKind, JobEmitter};
use crate::domainflow::types::{TenantId, ToolName};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identity and budget of one tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub tenant_id: TenantId,
    pub agent_id: String,
    pub job_id: String,
    /// Hard deadline for the whole invocation, waits included.
    pub deadline: Instant,
    /// Cooperative cancellation signal; checked at every suspension point.
    pub cancel: CancellationToken,
    /// Status emitter for the owning job, when one exists.
    pub emitter: Option<JobEmitter>,
}

impl ToolContext {
    fn emit(&self, kind: EventKind, tool: ToolName, message: String) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(kind, Some(&self.agent_id), Some(tool), message);
        }
    }
}

/// Failure modes a provider can report. The broker decides retry
/// eligibility from the variant; providers never retry internally.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Upstream 5xx, connection reset, provider-side timeout. Retryable
    /// for idempotent tools.
    Transient(String),
    /// Bad parameters, 4xx, unsupported operation. Never retried.
    Permanent(String),
}

impl ToolError {
    pub fn message(&self) -> &str {
        match self {
            ToolError::Transient(m) | ToolError::Permanent(m) => m,
        }
    }
}

/// Adapter for one capability of the closed tool set.
///
/// Implementations wrap a concrete upstream (an LLM API, a geocoder, the
/// relational store) and translate between JSON parameters and the
/// upstream's native interface.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// The capability this provider serves.
    fn tool(&self) -> ToolName;

    /// Perform one call. Implementations should honor `ctx.deadline` where
    /// the underlying client allows it; the broker enforces it regardless.
    async fn invoke(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Source of truth for which tools an agent may use.
///
/// The config store implements this by reading the agent's definition;
/// tests substitute fixed tables.
pub trait PermissionSource: Send + Sync {
    /// The agent's allowed tool set, or `None` if the agent is unknown.
    fn allowed_tools(&self, tenant: &TenantId, agent_id: &str) -> Option<BTreeSet<ToolName>>;
}

/// External secret provider contract. Secrets are fetched on first use and
/// held only in process memory.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn fetch(&self, tenant: &TenantId, name: &str) -> Result<String, ToolError>;
}

/// In-memory, fetch-once cache in front of a [`SecretProvider`].
pub struct SecretCache {
    provider: Arc<dyn SecretProvider>,
    cache: RwLock<HashMap<(TenantId, String), String>>,
}

impl SecretCache {
    pub fn new(provider: Arc<dyn SecretProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a secret, fetching it at most once per process.
    pub async fn get(&self, tenant: &TenantId, name: &str) -> Result<String, ToolError> {
        let key = (tenant.clone(), name.to_string());
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(secret) = cache.get(&key) {
                return Ok(secret.clone());
            }
        }
        let secret = self.provider.fetch(tenant, name).await?;
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.entry(key).or_insert_with(|| secret.clone());
        Ok(secret)
    }
}

struct CachedPermission {
    allowed: bool,
    expires: Instant,
}

/// The broker itself: ACL, cache, semaphores, providers, retry loop.
pub struct ToolBroker {
    source: Arc<dyn PermissionSource>,
    providers: RwLock<HashMap<ToolName, Arc<dyn ToolProvider>>>,
    permission_cache: RwLock<HashMap<(TenantId, String, ToolName), CachedPermission>>,
    semaphores: HashMap<ToolName, Arc<Semaphore>>,
    retry: RetryPolicy,
    cache_ttl: Duration,
}

impl ToolBroker {
    pub fn new(config: &EngineConfig, source: Arc<dyn PermissionSource>) -> Self {
        let mut semaphores = HashMap::new();
        for tool in ToolName::ALL {
            let permits = config
                .tool_concurrency
                .get(&tool)
                .copied()
                .unwrap_or(config.default_tool_concurrency);
            semaphores.insert(tool, Arc::new(Semaphore::new(permits)));
        }
        Self {
            source,
            providers: RwLock::new(HashMap::new()),
            permission_cache: RwLock::new(HashMap::new()),
            semaphores,
            retry: config.retry.clone(),
            cache_ttl: config.permission_cache_ttl,
        }
    }

    /// Register (or replace) the provider for a capability.
    pub fn register_provider(&self, provider: Arc<dyn ToolProvider>) {
        let tool = provider.tool();
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        providers.insert(tool, provider);
    }

    /// Drop every cached permission for `(tenant, agent)`. Called whenever
    /// an agent's definition changes, so ACL edits take effect immediately
    /// instead of after the TTL.
    pub fn invalidate_permissions(&self, tenant: &TenantId, agent_id: &str) {
        let mut cache = self
            .permission_cache
            .write()
            .unwrap_or_else(|e| e.into_inner());
        cache.retain(|(t, a, _), _| !(t == tenant && a == agent_id));
    }

    fn authorized(&self, tenant: &TenantId, agent_id: &str, tool: ToolName) -> bool {
        let key = (tenant.clone(), agent_id.to_string(), tool);
        let now = Instant::now();
        {
            let cache = self
                .permission_cache
                .read()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(&key) {
                if entry.expires > now {
                    return entry.allowed;
                }
            }
        }
        let allowed = self
            .source
            .allowed_tools(tenant, agent_id)
            .map(|tools| tools.contains(&tool))
            .unwrap_or(false);
        let mut cache = self
            .permission_cache
            .write()
            .unwrap_or_else(|e| e.into_inner());
        cache.insert(
            key,
            CachedPermission {
                allowed,
                expires: now + self.cache_ttl,
            },
        );
        allowed
    }

    /// Whether the broker may retry this call after a transient failure.
    ///
    /// Every tool except a non-GET `custom_http` call is idempotent.
    fn is_idempotent(tool: ToolName, params: &serde_json::Value) -> bool {
        if tool != ToolName::CustomHttp {
            return true;
        }
        params
            .get("method")
            .and_then(|m| m.as_str())
            .map(|m| m.eq_ignore_ascii_case("GET"))
            .unwrap_or(true)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.retry.jitter;
        if jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        delay.mul_f64(factor.max(0.0))
    }

    /// Invoke a tool on behalf of an agent.
    ///
    /// Returns `ToolDenied` without dispatching when the ACL refuses the
    /// call, `ToolFailed` when the provider fails permanently or retries
    /// are exhausted, and `Cancelled`/`AgentTimeout` when the cooperative
    /// signal or the deadline fires first.
    pub async fn invoke(
        &self,
        tool: ToolName,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> EngineResult<serde_json::Value> {
        self.invoke_inner(tool, params, ctx, true).await
    }

    /// Invoke a tool for an engine-internal caller (the synthesizer's
    /// summary call). Same semaphores, retries, and events; no per-agent
    /// ACL, because the caller is not an agent.
    pub async fn invoke_system(
        &self,
        tool: ToolName,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> EngineResult<serde_json::Value> {
        self.invoke_inner(tool, params, ctx, false).await
    }

    async fn invoke_inner(
        &self,
        tool: ToolName,
        params: serde_json::Value,
        ctx: &ToolContext,
        check_acl: bool,
    ) -> EngineResult<serde_json::Value> {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled(format!(
                "tool {} not dispatched, job {} cancelled",
                tool, ctx.job_id
            )));
        }

        if check_acl && !self.authorized(&ctx.tenant_id, &ctx.agent_id, tool) {
            log::warn!(
                "broker tenant={} job={} agent={} tool={} denied",
                ctx.tenant_id,
                ctx.job_id,
                ctx.agent_id,
                tool
            );
            return Err(EngineError::ToolDenied(format!(
                "agent '{}' is not authorized for tool '{}'",
                ctx.agent_id, tool
            )));
        }

        let provider = {
            let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
            providers.get(&tool).cloned()
        }
        .ok_or_else(|| {
            EngineError::ToolFailed(format!("no provider registered for tool '{}'", tool))
        })?;

        ctx.emit(
            EventKind::ToolInvoked,
            tool,
            format!("invoking {}", tool),
        );

        // Waiters on a saturated tool observe the caller's deadline.
        let semaphore = self.semaphores.get(&tool).cloned().ok_or_else(|| {
            EngineError::Internal(format!("no semaphore for tool '{}'", tool))
        })?;
        let _permit = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(EngineError::Cancelled(format!(
                    "cancelled waiting for tool '{}'", tool
                )));
            }
            acquired = tokio::time::timeout_at(ctx.deadline, semaphore.acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return Err(EngineError::Internal(format!(
                            "semaphore for tool '{}' closed", tool
                        )));
                    }
                    Err(_) => {
                        ctx.emit(
                            EventKind::ToolFailed,
                            tool,
                            format!("{} deadline exceeded before dispatch", tool),
                        );
                        return Err(EngineError::ToolFailed(format!(
                            "deadline exceeded waiting for tool '{}'", tool
                        )));
                    }
                }
            }
        };

        let retryable = Self::is_idempotent(tool, &params);
        let mut attempt: u32 = 0;
        let result = loop {
            let call = provider.invoke(params.clone(), ctx);
            let outcome = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(EngineError::Cancelled(format!(
                        "cancelled during tool '{}'", tool
                    )));
                }
                timed = tokio::time::timeout_at(ctx.deadline, call) => timed,
            };

            match outcome {
                Err(_) => {
                    break Err(EngineError::ToolFailed(format!(
                        "tool '{}' exceeded its deadline",
                        tool
                    )));
                }
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(ToolError::Permanent(msg))) => {
                    break Err(EngineError::ToolFailed(format!(
                        "tool '{}' failed: {}",
                        tool, msg
                    )));
                }
                Ok(Err(ToolError::Transient(msg))) => {
                    if !retryable || attempt >= self.retry.max_retries {
                        break Err(EngineError::ToolFailed(format!(
                            "tool '{}' failed after {} attempts: {}",
                            tool,
                            attempt + 1,
                            msg
                        )));
                    }
                    let delay = self.jittered(self.retry.delay_for_attempt(attempt));
                    if Instant::now() + delay >= ctx.deadline {
                        break Err(EngineError::ToolFailed(format!(
                            "tool '{}' failed and no budget remains to retry: {}",
                            tool, msg
                        )));
                    }
                    log::debug!(
                        "broker tenant={} job={} agent={} tool={} transient failure, retry {} in {:?}",
                        ctx.tenant_id,
                        ctx.job_id,
                        ctx.agent_id,
                        tool,
                        attempt + 1,
                        delay
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            return Err(EngineError::Cancelled(format!(
                                "cancelled during tool '{}' backoff", tool
                            )));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };
        drop(_permit);

        match &result {
            Ok(_) => ctx.emit(EventKind::ToolDone, tool, format!("{} ok", tool)),
            Err(e) => ctx.emit(EventKind::ToolFailed, tool, e.message().to_string()),
        }
        result
    }
}
