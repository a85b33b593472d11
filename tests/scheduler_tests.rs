use async_trait::async_trait;
use domainflow::broker::{ToolContext, ToolError, ToolProvider};
use domainflow::config::{EngineConfig, RetryPolicy};
use domainflow::engine::Engine;
use domainflow::job::{InvocationStatus, JobState, ResultArtifact};
use domainflow::status::{EventKind, StatusEvent};
use domainflow::types::{
    AgentClass, AgentDefinition, DependencyGraph, FieldType, Interrogative, OutputSchema,
    Playbook, TenantId, ToolName, UserId,
};
use domainflow::EngineError;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// LLM stand-in that routes on a marker contained in the prompt (each
/// agent's system prompt is a distinct marker) and can delay or fail
/// selected routes.
struct RouterLlm {
    routes: Vec<(String, Route)>,
    delay: Duration,
}

enum Route {
    Reply(String),
    Fail,
}

impl RouterLlm {
    fn new(delay: Duration) -> Self {
        Self {
            routes: Vec::new(),
            delay,
        }
    }

    fn reply(mut self, needle: &str, response: &str) -> Self {
        self.routes
            .push((needle.to_string(), Route::Reply(response.to_string())));
        self
    }

    fn fail(mut self, needle: &str) -> Self {
        self.routes.push((needle.to_string(), Route::Fail));
        self
    }
}

#[async_trait]
impl ToolProvider for RouterLlm {
    fn tool(&self) -> ToolName {
        ToolName::Llm
    }

    async fn invoke(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let prompt = params["prompt"].as_str().unwrap_or_default();
        for (needle, route) in &self.routes {
            if prompt.contains(needle.as_str()) {
                return match route {
                    Route::Reply(text) => Ok(serde_json::json!({ "text": text })),
                    Route::Fail => Err(ToolError::Transient("upstream 503".to_string())),
                };
            }
        }
        Err(ToolError::Permanent(format!(
            "no scripted route for prompt: {}",
            &prompt[..prompt.len().min(60)]
        )))
    }
}

fn fast_config() -> EngineConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    EngineConfig {
        per_agent_budget: Duration::from_secs(5),
        job_budget: Duration::from_secs(10),
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: 0.2,
        },
        ..EngineConfig::default()
    }
}

fn tenant() -> TenantId {
    TenantId::new("acme")
}

fn user() -> UserId {
    UserId::new("u-1")
}

/// Drain events until the terminal one, with a hard cap so a wedged job
/// fails the test instead of hanging it.
async fn events_until_terminal(stream: &mut UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(15), stream.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed before a terminal event");
        let terminal = event.kind.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn assert_contiguous_sequences(events: &[StatusEvent]) {
    for (index, event) in events.iter().enumerate() {
        assert_eq!(
            event.sequence,
            index as u64 + 1,
            "event {} has sequence {}",
            index,
            event.sequence
        );
    }
}

fn setup_ingest_domain(engine: &Engine) {
    let t = tenant();
    let agents = [
        ("geo", "Extract the location of the incident.", "location"),
        ("temporal", "Extract when the incident happened.", "timestamp"),
        ("entity", "Classify the incident entity.", "category"),
    ];
    for (id, prompt, field) in agents {
        engine
            .put_agent(
                &t,
                AgentDefinition::new(id, AgentClass::Ingest, prompt)
                    .with_tool(ToolName::Llm)
                    .with_output_schema(
                        OutputSchema::new()
                            .with_field(field, FieldType::String)
                            .with_field("confidence", FieldType::Number),
                    ),
            )
            .unwrap();
    }
    engine
        .put_agent(
            &t,
            AgentDefinition::new("severity", AgentClass::Ingest, "Rate the incident severity.")
                .with_tool(ToolName::Llm)
                .with_output_schema(
                    OutputSchema::new().with_field("severity_level", FieldType::String),
                )
                .with_dependency_parent("entity"),
        )
        .unwrap();
    engine
        .put_playbook(
            &t,
            Playbook::new(
                "city-ingest",
                "city",
                AgentClass::Ingest,
                vec![
                    "geo".into(),
                    "temporal".into(),
                    "entity".into(),
                    "severity".into(),
                ],
            ),
        )
        .unwrap();
    engine
        .put_dependency_graph(
            &t,
            DependencyGraph::new(
                "city-ingest-graph",
                "city-ingest",
                vec![("entity".into(), "severity".into())],
            ),
        )
        .unwrap();
}

fn ingest_router(delay: Duration) -> RouterLlm {
    RouterLlm::new(delay)
        .reply(
            "Extract the location",
            r#"{"location": "5th Ave, New York", "confidence": 0.8}"#,
        )
        .reply(
            "Extract when",
            r#"{"timestamp": "2026-08-01T08:00:00Z", "confidence": 0.7}"#,
        )
        .reply(
            "Classify the incident",
            r#"{"category": "safety", "confidence": 0.95}"#,
        )
        .reply("Rate the incident severity", r#"{"severity_level": "high"}"#)
        .reply("Summarize the following findings", "A gas leak was reported.")
}

#[tokio::test]
async fn test_ingest_with_single_parent_dependency() {
    let engine = Engine::new(fast_config());
    engine.register_tool_provider(std::sync::Arc::new(ingest_router(Duration::ZERO)));
    setup_ingest_domain(&engine);

    let mut stream = engine.subscribe_status(&user(), None);
    let accepted = engine
        .submit_ingest(
            &tenant(),
            &user(),
            "city",
            "Gas leak on 5th Ave, reported this morning",
            vec![],
            None,
        )
        .unwrap();

    let events = events_until_terminal(&mut stream).await;
    assert_contiguous_sequences(&events);

    // plan_loaded opens the stream, complete closes it.
    assert_eq!(events[0].kind, EventKind::PlanLoaded);
    assert!(events[0].message.contains("2 levels"));
    assert_eq!(events.last().unwrap().kind, EventKind::Complete);

    // The child never starts before its parent succeeded.
    let entity_ok = events
        .iter()
        .position(|e| e.kind == EventKind::AgentOk && e.agent_id.as_deref() == Some("entity"))
        .expect("entity agent_ok missing");
    let severity_started = events
        .iter()
        .position(|e| {
            e.kind == EventKind::AgentStarted && e.agent_id.as_deref() == Some("severity")
        })
        .expect("severity agent_started missing");
    assert!(entity_ok < severity_started);

    let job = engine.get_job(&tenant(), &accepted.job_id).unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.events_emitted, events.len() as u64);
    assert_eq!(job.invocations.len(), 4);

    match job.artifact.unwrap() {
        ResultArtifact::Ingest {
            fields, promoted, ..
        } => {
            assert_eq!(
                fields["entity.category"],
                serde_json::Value::String("safety".to_string())
            );
            let severity = fields["severity.severity_level"].as_str().unwrap();
            assert!(severity == "high" || severity == "critical");
            assert_eq!(
                promoted.category,
                Some(serde_json::Value::String("safety".to_string()))
            );
            assert!(promoted.location.is_some());
            assert!(promoted.timestamp.is_some());
        }
        other => panic!("expected ingest artifact, got {:?}", other),
    }
}

fn setup_query_domain(engine: &Engine) {
    let t = tenant();
    let agents = [
        ("what", Interrogative::What, "Answer what is happening."),
        ("where", Interrogative::Where, "Answer where it is happening."),
        ("when", Interrogative::When, "Answer when it is happening."),
        ("why", Interrogative::Why, "Answer why it is happening."),
    ];
    for (id, interrogative, prompt) in agents {
        let mut schema = OutputSchema::new().with_field("insight", FieldType::String);
        if id == "where" {
            schema = schema.with_field("location", FieldType::Object);
        }
        engine
            .put_agent(
                &t,
                AgentDefinition::new(id, AgentClass::Query, prompt)
                    .with_tool(ToolName::Llm)
                    .with_output_schema(schema)
                    .with_interrogative(interrogative),
            )
            .unwrap();
    }
    engine
        .put_playbook(
            &t,
            Playbook::new(
                "city-query",
                "city",
                AgentClass::Query,
                vec!["what".into(), "where".into(), "when".into(), "why".into()],
            ),
        )
        .unwrap();
}

fn query_router() -> RouterLlm {
    RouterLlm::new(Duration::ZERO)
        .reply(
            "Answer what",
            r#"{"insight": "Pothole complaints are rising steadily."}"#,
        )
        .reply(
            "Answer where",
            r#"{"insight": "Complaints cluster along Main Street.", "location": {"lat": 40.71, "lon": -74.0}}"#,
        )
        .reply(
            "Answer when",
            r#"{"insight": "Most reports arrive after the morning commute."}"#,
        )
        .reply(
            "Answer why",
            r#"{"insight": "Freeze-thaw cycles are breaking the asphalt."}"#,
        )
        .reply(
            "Summarize the following findings",
            "Pothole complaints are rising, clustered on Main Street. Winter freeze-thaw damage is the likely cause.",
        )
}

#[tokio::test]
async fn test_query_bullets_follow_canonical_order() {
    let engine = Engine::new(fast_config());
    engine.register_tool_provider(std::sync::Arc::new(query_router()));
    setup_query_domain(&engine);

    let mut stream = engine.subscribe_status(&user(), None);
    let accepted = engine
        .submit_query(
            &tenant(),
            &user(),
            "city",
            "What are the trends in pothole complaints?",
            BTreeMap::new(),
        )
        .unwrap();

    let events = events_until_terminal(&mut stream).await;
    assert_contiguous_sequences(&events);
    let ok_count = events
        .iter()
        .filter(|e| e.kind == EventKind::AgentOk)
        .count();
    assert_eq!(ok_count, 4);

    let job = engine.get_job(&tenant(), &accepted.job_id).unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    match job.artifact.unwrap() {
        ResultArtifact::Query {
            bullets,
            summary,
            visualization,
            ..
        } => {
            let order: Vec<Interrogative> = bullets.iter().map(|b| b.interrogative).collect();
            assert_eq!(
                order,
                vec![
                    Interrogative::What,
                    Interrogative::Where,
                    Interrogative::When,
                    Interrogative::Why,
                ]
            );
            // Short summary, at most three sentences.
            assert!(summary.matches('.').count() <= 3);
            // The where agent returned spatial data, so a visualization
            // spec is attached.
            let viz = visualization.expect("visualization missing");
            assert_eq!(viz.features.len(), 1);
            assert!((viz.bounds[0] - -74.0).abs() < 1e-9);
            assert!((viz.bounds[1] - 40.71).abs() < 1e-9);
        }
        other => panic!("expected query artifact, got {:?}", other),
    }
}

#[tokio::test]
async fn test_agent_failure_does_not_abort_the_job() {
    let engine = Engine::new(fast_config());
    // Same playbook, but the where agent's upstream keeps failing.
    let router = RouterLlm::new(Duration::ZERO)
        .reply(
            "Answer what",
            r#"{"insight": "Pothole complaints are rising steadily."}"#,
        )
        .fail("Answer where")
        .reply(
            "Answer when",
            r#"{"insight": "Most reports arrive after the morning commute."}"#,
        )
        .reply(
            "Answer why",
            r#"{"insight": "Freeze-thaw cycles are breaking the asphalt."}"#,
        )
        .reply("Summarize the following findings", "Potholes are trending up.");
    engine.register_tool_provider(std::sync::Arc::new(router));
    setup_query_domain(&engine);

    let mut stream = engine.subscribe_status(&user(), None);
    let accepted = engine
        .submit_query(
            &tenant(),
            &user(),
            "city",
            "What are the trends in pothole complaints?",
            BTreeMap::new(),
        )
        .unwrap();

    let events = events_until_terminal(&mut stream).await;
    assert_eq!(events.last().unwrap().kind, EventKind::Complete);
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::AgentError && e.agent_id.as_deref() == Some("where")));

    let job = engine.get_job(&tenant(), &accepted.job_id).unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    match job.artifact.unwrap() {
        ResultArtifact::Query {
            bullets,
            agent_status,
            ..
        } => {
            assert_eq!(bullets.len(), 3);
            assert!(bullets
                .iter()
                .all(|b| b.interrogative != Interrogative::Where));
            assert_eq!(agent_status["where"], InvocationStatus::Error);
        }
        other => panic!("expected query artifact, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancellation_mid_run_is_idempotent() {
    let engine = Engine::new(fast_config());
    engine.register_tool_provider(std::sync::Arc::new(ingest_router(Duration::from_secs(
        30,
    ))));
    setup_ingest_domain(&engine);

    let mut stream = engine.subscribe_status(&user(), None);
    let accepted = engine
        .submit_ingest(&tenant(), &user(), "city", "Gas leak on 5th Ave", vec![], None)
        .unwrap();

    // Wait until at least two agents have started.
    let mut started = 0;
    let mut events = Vec::new();
    while started < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("timed out waiting for agent starts")
            .unwrap();
        if event.kind == EventKind::AgentStarted {
            started += 1;
        }
        events.push(event);
    }

    engine.cancel(&tenant(), &accepted.job_id).unwrap();

    let mut rest = events_until_terminal(&mut stream).await;
    events.append(&mut rest);
    assert_eq!(events.last().unwrap().kind, EventKind::Cancelled);
    assert_contiguous_sequences(&events);

    let job = engine.get_job(&tenant(), &accepted.job_id).unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    // Every agent that was in flight reports cancelled.
    assert!(!job.invocations.is_empty());
    for invocation in &job.invocations {
        assert_eq!(invocation.status, InvocationStatus::Cancelled);
    }

    // Cancel again: same terminal state, no further events.
    let state = engine.cancel(&tenant(), &accepted.job_id).unwrap();
    assert_eq!(state, JobState::Cancelled);
    let again = engine.get_job(&tenant(), &accepted.job_id).unwrap();
    assert_eq!(again.events_emitted, events.len() as u64);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stream.try_recv().is_err());
}

#[tokio::test]
async fn test_submissions_past_high_water_fail_fast() {
    let config = EngineConfig {
        queue_high_water: 1,
        ..fast_config()
    };
    let engine = Engine::new(config);
    engine.register_tool_provider(std::sync::Arc::new(ingest_router(Duration::from_secs(
        30,
    ))));
    setup_ingest_domain(&engine);

    let first = engine
        .submit_ingest(&tenant(), &user(), "city", "Report one", vec![], None)
        .unwrap();
    match engine.submit_ingest(&tenant(), &user(), "city", "Report two", vec![], None) {
        Err(EngineError::AtCapacity(_)) => {}
        other => panic!("expected AtCapacity, got {:?}", other),
    }

    engine.cancel(&tenant(), &first.job_id).unwrap();
}

#[tokio::test]
async fn test_all_agents_failing_fails_the_job() {
    let engine = Engine::new(fast_config());
    let router = RouterLlm::new(Duration::ZERO)
        .fail("Extract the location")
        .fail("Extract when")
        .fail("Classify the incident")
        .fail("Rate the incident severity");
    engine.register_tool_provider(std::sync::Arc::new(router));
    setup_ingest_domain(&engine);

    let mut stream = engine.subscribe_status(&user(), None);
    let accepted = engine
        .submit_ingest(&tenant(), &user(), "city", "Gas leak", vec![], None)
        .unwrap();

    let events = events_until_terminal(&mut stream).await;
    assert_eq!(events.last().unwrap().kind, EventKind::Failed);

    let job = engine.get_job(&tenant(), &accepted.job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.unwrap().code, "NoViableAgents");
}

#[tokio::test]
async fn test_descendant_of_failed_parent_still_runs() {
    let engine = Engine::new(fast_config());
    let router = RouterLlm::new(Duration::ZERO)
        .reply(
            "Extract the location",
            r#"{"location": "5th Ave", "confidence": 0.8}"#,
        )
        .reply(
            "Extract when",
            r#"{"timestamp": "2026-08-01T08:00:00Z", "confidence": 0.7}"#,
        )
        .fail("Classify the incident")
        .reply("Rate the incident severity", r#"{"severity_level": "low"}"#);
    engine.register_tool_provider(std::sync::Arc::new(router));
    setup_ingest_domain(&engine);

    let mut stream = engine.subscribe_status(&user(), None);
    let accepted = engine
        .submit_ingest(&tenant(), &user(), "city", "Gas leak", vec![], None)
        .unwrap();
    let _ = events_until_terminal(&mut stream).await;

    let job = engine.get_job(&tenant(), &accepted.job_id).unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    let severity = job
        .invocations
        .iter()
        .find(|i| i.agent_id == "severity")
        .unwrap();
    // The child ran without its parent's output and still succeeded.
    assert_eq!(severity.status, InvocationStatus::Ok);
    assert!(severity.input_view.contains("produced no output"));
}

#[tokio::test]
async fn test_revoked_tool_denies_the_next_dispatch() {
    let engine = Engine::new(fast_config());
    engine.register_tool_provider(std::sync::Arc::new(ingest_router(Duration::ZERO)));
    setup_ingest_domain(&engine);

    for agent in ["geo", "temporal", "entity", "severity"] {
        let version = engine.revoke_tool(&tenant(), agent, ToolName::Llm).unwrap();
        assert_eq!(version, 2);
    }

    let mut stream = engine.subscribe_status(&user(), None);
    let accepted = engine
        .submit_ingest(&tenant(), &user(), "city", "Gas leak", vec![], None)
        .unwrap();
    let events = events_until_terminal(&mut stream).await;
    assert_eq!(events.last().unwrap().kind, EventKind::Failed);

    let job = engine.get_job(&tenant(), &accepted.job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    for invocation in &job.invocations {
        assert_eq!(invocation.error.as_ref().unwrap().code, "ToolDenied");
    }

    // Granting it back restores service.
    for agent in ["geo", "temporal", "entity", "severity"] {
        engine.grant_tool(&tenant(), agent, ToolName::Llm).unwrap();
    }
    let mut stream2 = engine.subscribe_status(&user(), None);
    let accepted = engine
        .submit_ingest(&tenant(), &user(), "city", "Gas leak", vec![], None)
        .unwrap();
    let _ = events_until_terminal(&mut stream2).await;
    let job = engine.get_job(&tenant(), &accepted.job_id).unwrap();
    assert_eq!(job.state, JobState::Succeeded);
}

#[tokio::test]
async fn test_cross_tenant_access_is_refused() {
    let engine = Engine::new(fast_config());
    engine.register_tool_provider(std::sync::Arc::new(ingest_router(Duration::ZERO)));
    setup_ingest_domain(&engine);

    let accepted = engine
        .submit_ingest(&tenant(), &user(), "city", "Gas leak", vec![], None)
        .unwrap();

    let intruder = TenantId::new("mallory");
    assert!(matches!(
        engine.get_job(&intruder, &accepted.job_id),
        Err(EngineError::CrossTenant(_))
    ));
    assert!(matches!(
        engine.cancel(&intruder, &accepted.job_id),
        Err(EngineError::CrossTenant(_))
    ));
}
