//! Engine configuration.
//!
//! Provides [`EngineConfig`], the plain struct callers construct and hand
//! to the engine at startup. No config-file parsing is done here; embed the
//! struct in whatever configuration system the host application uses.
//!
//! # Example
//!
//! ```rust
//! use domainflow::config::EngineConfig;
//! use std::time::Duration;
//!
//! // Defaults are production-reasonable.
//! let config = EngineConfig::default();
//!
//! // Or tighten the budgets for tests.
//! let config = EngineConfig {
//!     per_agent_budget: Duration::from_secs(5),
//!     job_budget: Duration::from_secs(20),
//!     ..EngineConfig::default()
//! };
//! ```

use crate::domainflow::types::ToolName;
use std::collections::BTreeMap;
use std::time::Duration;

/// Retry policy for transient failures: exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the initial try.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay.
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay (0.2 means ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given 0-based attempt, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.max_delay)
    }
}

/// Tunables for the whole engine. Constructed by the caller and passed to
/// `Engine::new`; there is no global configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wall-clock budget for a single agent invocation. The effective
    /// deadline is the minimum of this and the job's remaining budget.
    pub per_agent_budget: Duration,
    /// Wall-clock budget for a whole job.
    pub job_budget: Duration,
    /// High-water mark for jobs admitted but not yet terminal. Submissions
    /// past this fail fast with `AtCapacity`.
    pub queue_high_water: usize,
    /// Ceiling on simultaneous tool calls issued by one agent invocation.
    pub tool_calls_per_agent: usize,
    /// Per-tool concurrency ceilings enforced by the broker's semaphores.
    /// Tools absent from the map use `default_tool_concurrency`.
    pub tool_concurrency: BTreeMap<ToolName, usize>,
    /// Fallback concurrency ceiling for tools not listed above.
    pub default_tool_concurrency: usize,
    /// Retry policy for transient tool failures.
    pub retry: RetryPolicy,
    /// How long a permission-cache entry stays valid without an explicit
    /// invalidation.
    pub permission_cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut tool_concurrency = BTreeMap::new();
        // LLM providers rate-limit aggressively; keep the ceiling low.
        tool_concurrency.insert(ToolName::Llm, 8);
        tool_concurrency.insert(ToolName::CustomHttp, 8);
        Self {
            per_agent_budget: Duration::from_secs(30),
            job_budget: Duration::from_secs(180),
            queue_high_water: 64,
            tool_calls_per_agent: 4,
            tool_concurrency,
            default_tool_concurrency: 16,
            retry: RetryPolicy::default(),
            permission_cache_ttl: Duration::from_secs(300),
        }
    }
}
