use async_trait::async_trait;
use domainflow::broker::{
    PermissionSource, SecretCache, SecretProvider, ToolBroker, ToolContext, ToolError,
    ToolProvider,
};
use domainflow::config::{EngineConfig, RetryPolicy};
use domainflow::types::{TenantId, ToolName};
use domainflow::EngineError;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: 0.2,
        },
        ..EngineConfig::default()
    }
}

fn ctx() -> ToolContext {
    ToolContext {
        tenant_id: TenantId::new("acme"),
        agent_id: "agent-1".to_string(),
        job_id: "job-1".to_string(),
        deadline: Instant::now() + Duration::from_secs(5),
        cancel: CancellationToken::new(),
        emitter: None,
    }
}

struct TablePermissions {
    allowed: Mutex<BTreeSet<ToolName>>,
}

impl TablePermissions {
    fn allowing(tools: &[ToolName]) -> Arc<Self> {
        Arc::new(Self {
            allowed: Mutex::new(tools.iter().copied().collect()),
        })
    }

    fn set(&self, tools: &[ToolName]) {
        *self.allowed.lock().unwrap() = tools.iter().copied().collect();
    }
}

impl PermissionSource for TablePermissions {
    fn allowed_tools(&self, _tenant: &TenantId, _agent_id: &str) -> Option<BTreeSet<ToolName>> {
        Some(self.allowed.lock().unwrap().clone())
    }
}

/// Provider that fails with a transient error a fixed number of times
/// before succeeding, counting every call.
struct FlakyProvider {
    tool: ToolName,
    failures: usize,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolProvider for FlakyProvider {
    fn tool(&self) -> ToolName {
        self.tool
    }

    async fn invoke(
        &self,
        _params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(ToolError::Transient("upstream 503".to_string()))
        } else {
            Ok(serde_json::json!({"ok": true}))
        }
    }
}

struct PermanentFailProvider {
    tool: ToolName,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolProvider for PermanentFailProvider {
    fn tool(&self) -> ToolName {
        self.tool
    }

    async fn invoke(
        &self,
        _params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::Permanent("bad parameters".to_string()))
    }
}

#[tokio::test]
async fn test_unauthorized_tool_is_denied_without_dispatch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let broker = ToolBroker::new(&fast_config(), TablePermissions::allowing(&[]));
    broker.register_provider(Arc::new(FlakyProvider {
        tool: ToolName::Geocode,
        failures: 0,
        calls: Arc::clone(&calls),
    }));

    match broker.invoke(ToolName::Geocode, serde_json::json!({}), &ctx()).await {
        Err(EngineError::ToolDenied(msg)) => assert!(msg.contains("agent-1")),
        other => panic!("expected ToolDenied, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let broker = ToolBroker::new(&fast_config(), TablePermissions::allowing(&[ToolName::Llm]));
    broker.register_provider(Arc::new(FlakyProvider {
        tool: ToolName::Llm,
        failures: 2,
        calls: Arc::clone(&calls),
    }));

    let value = broker
        .invoke(ToolName::Llm, serde_json::json!({}), &ctx())
        .await
        .unwrap();
    assert_eq!(value["ok"], true);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retries_exhausted_becomes_tool_failed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let broker = ToolBroker::new(&fast_config(), TablePermissions::allowing(&[ToolName::Llm]));
    broker.register_provider(Arc::new(FlakyProvider {
        tool: ToolName::Llm,
        failures: 100,
        calls: Arc::clone(&calls),
    }));

    match broker.invoke(ToolName::Llm, serde_json::json!({}), &ctx()).await {
        Err(EngineError::ToolFailed(_)) => {}
        other => panic!("expected ToolFailed, got {:?}", other),
    }
    // Initial attempt plus max_retries.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_permanent_failures_are_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let broker = ToolBroker::new(&fast_config(), TablePermissions::allowing(&[ToolName::Llm]));
    broker.register_provider(Arc::new(PermanentFailProvider {
        tool: ToolName::Llm,
        calls: Arc::clone(&calls),
    }));

    assert!(broker
        .invoke(ToolName::Llm, serde_json::json!({}), &ctx())
        .await
        .is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_non_get_custom_http_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let broker = ToolBroker::new(
        &fast_config(),
        TablePermissions::allowing(&[ToolName::CustomHttp]),
    );
    broker.register_provider(Arc::new(FlakyProvider {
        tool: ToolName::CustomHttp,
        failures: 100,
        calls: Arc::clone(&calls),
    }));

    let result = broker
        .invoke(
            ToolName::CustomHttp,
            serde_json::json!({"method": "POST", "url": "https://x"}),
            &ctx(),
        )
        .await;
    assert!(matches!(result, Err(EngineError::ToolFailed(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // GET stays idempotent and retries.
    calls.store(0, Ordering::SeqCst);
    let result = broker
        .invoke(
            ToolName::CustomHttp,
            serde_json::json!({"method": "GET", "url": "https://x"}),
            &ctx(),
        )
        .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_permission_cache_and_explicit_invalidation() {
    let source = TablePermissions::allowing(&[ToolName::Llm]);
    let broker = ToolBroker::new(&fast_config(), Arc::clone(&source) as Arc<dyn PermissionSource>);
    let calls = Arc::new(AtomicUsize::new(0));
    broker.register_provider(Arc::new(FlakyProvider {
        tool: ToolName::Llm,
        failures: 0,
        calls,
    }));

    assert!(broker
        .invoke(ToolName::Llm, serde_json::json!({}), &ctx())
        .await
        .is_ok());

    // Revoking in the source alone is invisible while the cache entry
    // lives.
    source.set(&[]);
    assert!(broker
        .invoke(ToolName::Llm, serde_json::json!({}), &ctx())
        .await
        .is_ok());

    // Explicit invalidation takes effect immediately.
    broker.invalidate_permissions(&TenantId::new("acme"), "agent-1");
    assert!(matches!(
        broker.invoke(ToolName::Llm, serde_json::json!({}), &ctx()).await,
        Err(EngineError::ToolDenied(_))
    ));
}

#[tokio::test]
async fn test_cancelled_before_dispatch() {
    let broker = ToolBroker::new(&fast_config(), TablePermissions::allowing(&[ToolName::Llm]));
    let mut ctx = ctx();
    ctx.cancel = CancellationToken::new();
    ctx.cancel.cancel();
    assert!(matches!(
        broker.invoke(ToolName::Llm, serde_json::json!({}), &ctx).await,
        Err(EngineError::Cancelled(_))
    ));
}

struct CountingSecrets {
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl SecretProvider for CountingSecrets {
    async fn fetch(&self, tenant: &TenantId, name: &str) -> Result<String, ToolError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}:{}:secret", tenant, name))
    }
}

#[tokio::test]
async fn test_secret_cache_fetches_once_per_process() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let cache = SecretCache::new(Arc::new(CountingSecrets {
        fetches: Arc::clone(&fetches),
    }));
    let tenant = TenantId::new("acme");

    let first = cache.get(&tenant, "geocoder-key").await.unwrap();
    let second = cache.get(&tenant, "geocoder-key").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    // A different tenant's secret is a different entry.
    cache.get(&TenantId::new("other"), "geocoder-key").await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}
