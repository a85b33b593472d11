use domainflow::broker::ToolBroker;
use domainflow::config::EngineConfig;
use domainflow::graph::Plan;
use domainflow::job::{AgentInvocation, AgentOutput, InvocationStatus, JobInput, ResultArtifact};
use domainflow::status::StatusBus;
use domainflow::synthesizer::{
    validate_invocations, SynthesisContext, Synthesizer, REQUIRED_PERSPECTIVES_FILTER,
};
use domainflow::types::{
    AgentClass, AgentDefinition, Interrogative, TenantId, ToolName, UserId,
};
use domainflow::{EngineError, PermissionSource};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct AllowAll;

impl PermissionSource for AllowAll {
    fn allowed_tools(&self, _tenant: &TenantId, _agent_id: &str) -> Option<BTreeSet<ToolName>> {
        Some(ToolName::ALL.iter().copied().collect())
    }
}

fn synthesizer() -> Synthesizer {
    // No LLM provider registered: the summary degrades to concatenation,
    // which is also what this exercises.
    let broker = Arc::new(ToolBroker::new(&EngineConfig::default(), Arc::new(AllowAll)));
    Synthesizer::new(broker)
}

fn ctx() -> SynthesisContext {
    let bus = Arc::new(StatusBus::new());
    SynthesisContext {
        tenant_id: TenantId::new("acme"),
        job_id: "job-1".to_string(),
        deadline: Instant::now() + Duration::from_secs(5),
        cancel: CancellationToken::new(),
        emitter: bus.emitter("job-1", UserId::new("u-1")),
    }
}

fn ok_invocation(agent_id: &str, values: serde_json::Value) -> AgentInvocation {
    let mut invocation = AgentInvocation::pending("job-1", agent_id, 0);
    invocation.status = InvocationStatus::Ok;
    let map: BTreeMap<String, serde_json::Value> = values
        .as_object()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    invocation.output = AgentOutput::new(map);
    invocation
}

fn failed_invocation(agent_id: &str) -> AgentInvocation {
    let mut invocation = AgentInvocation::pending("job-1", agent_id, 0);
    invocation.status = InvocationStatus::Error;
    invocation
}

fn ingest_input() -> JobInput {
    JobInput::Ingest {
        text: "Gas leak on 5th Ave".to_string(),
        attachments: vec!["s3://bucket/photo.jpg".to_string()],
        priority: None,
    }
}

#[test]
fn test_ingest_merge_namespaces_keys() {
    let invocations = vec![
        ok_invocation("entity", serde_json::json!({"category": "safety"})),
        ok_invocation("geo", serde_json::json!({"location": "5th Ave"})),
        failed_invocation("temporal"),
    ];

    let artifact = synthesizer()
        .synthesize_ingest(&ctx(), &ingest_input(), &invocations)
        .unwrap();
    match artifact {
        ResultArtifact::Ingest {
            fields,
            agent_status,
            raw_text,
            attachments,
            ..
        } => {
            assert_eq!(fields.len(), 2);
            assert!(fields.contains_key("entity.category"));
            assert!(fields.contains_key("geo.location"));
            assert_eq!(agent_status["temporal"], InvocationStatus::Error);
            assert_eq!(raw_text, "Gas leak on 5th Ave");
            assert_eq!(attachments.len(), 1);
        }
        other => panic!("expected ingest artifact, got {:?}", other),
    }
}

#[test]
fn test_promotion_prefers_higher_confidence() {
    let invocations = vec![
        ok_invocation(
            "alpha",
            serde_json::json!({"category": "noise", "confidence": 0.4}),
        ),
        ok_invocation(
            "beta",
            serde_json::json!({"category": "safety", "confidence": 0.9}),
        ),
    ];

    let artifact = synthesizer()
        .synthesize_ingest(&ctx(), &ingest_input(), &invocations)
        .unwrap();
    match artifact {
        ResultArtifact::Ingest { promoted, .. } => {
            assert_eq!(
                promoted.category,
                Some(serde_json::Value::String("safety".to_string()))
            );
        }
        other => panic!("expected ingest artifact, got {:?}", other),
    }
}

#[test]
fn test_promotion_ties_break_by_agent_id() {
    let invocations = vec![
        ok_invocation("zeta", serde_json::json!({"category": "later"})),
        ok_invocation("alpha", serde_json::json!({"category": "first"})),
    ];

    let artifact = synthesizer()
        .synthesize_ingest(&ctx(), &ingest_input(), &invocations)
        .unwrap();
    match artifact {
        ResultArtifact::Ingest { promoted, .. } => {
            assert_eq!(
                promoted.category,
                Some(serde_json::Value::String("first".to_string()))
            );
        }
        other => panic!("expected ingest artifact, got {:?}", other),
    }
}

#[test]
fn test_ingest_refused_when_nothing_merged() {
    let invocations = vec![failed_invocation("entity"), failed_invocation("geo")];
    match synthesizer().synthesize_ingest(&ctx(), &ingest_input(), &invocations) {
        Err(EngineError::SynthesisRefused(_)) => {}
        other => panic!("expected SynthesisRefused, got {:?}", other),
    }
}

#[test]
fn test_validator_rejects_duplicate_agents() {
    let invocations = vec![
        ok_invocation("entity", serde_json::json!({"category": "a"})),
        ok_invocation("entity", serde_json::json!({"category": "b"})),
    ];
    assert!(matches!(
        validate_invocations("job-1", &invocations),
        Err(EngineError::Internal(_))
    ));
}

#[test]
fn test_validator_rejects_foreign_job_rows() {
    let mut stray = ok_invocation("entity", serde_json::json!({"category": "a"}));
    stray.job_id = "job-2".to_string();
    assert!(matches!(
        validate_invocations("job-1", &[stray]),
        Err(EngineError::Internal(_))
    ));
}

fn query_plan() -> Plan {
    let mut agents = BTreeMap::new();
    for (id, interrogative) in [
        ("why", Interrogative::Why),
        ("what", Interrogative::What),
        ("where", Interrogative::Where),
    ] {
        agents.insert(
            id.to_string(),
            AgentDefinition::new(id, AgentClass::Query, "p").with_interrogative(interrogative),
        );
    }
    Plan {
        domain_id: "city".to_string(),
        playbook_id: "pb".to_string(),
        class: AgentClass::Query,
        agents,
        edges: vec![],
        levels: vec![vec!["what".into(), "where".into(), "why".into()]],
    }
}

#[tokio::test]
async fn test_query_bullets_are_canonically_ordered() {
    // Invocations arrive in completion order, not canonical order.
    let invocations = vec![
        ok_invocation("why", serde_json::json!({"insight": "Freeze-thaw damage."})),
        ok_invocation("where", serde_json::json!({"insight": "Main Street."})),
        ok_invocation("what", serde_json::json!({"insight": "Potholes."})),
    ];
    let input = JobInput::Query {
        question: "What is going on?".to_string(),
        filters: BTreeMap::new(),
    };

    let artifact = synthesizer()
        .synthesize_query(&ctx(), &input, &query_plan(), &invocations)
        .await
        .unwrap();
    match artifact {
        ResultArtifact::Query {
            bullets, summary, ..
        } => {
            let order: Vec<Interrogative> = bullets.iter().map(|b| b.interrogative).collect();
            assert_eq!(
                order,
                vec![Interrogative::What, Interrogative::Where, Interrogative::Why]
            );
            // Degraded summary still carries the bullet content.
            assert!(summary.contains("Potholes."));
        }
        other => panic!("expected query artifact, got {:?}", other),
    }
}

#[tokio::test]
async fn test_required_perspective_missing_refuses_synthesis() {
    let invocations = vec![
        ok_invocation("what", serde_json::json!({"insight": "Potholes."})),
        failed_invocation("where"),
    ];
    let mut filters = BTreeMap::new();
    filters.insert(
        REQUIRED_PERSPECTIVES_FILTER.to_string(),
        "where".to_string(),
    );
    let input = JobInput::Query {
        question: "Where exactly?".to_string(),
        filters,
    };

    match synthesizer()
        .synthesize_query(&ctx(), &input, &query_plan(), &invocations)
        .await
    {
        Err(EngineError::SynthesisRefused(msg)) => assert!(msg.contains("where")),
        other => panic!("expected SynthesisRefused, got {:?}", other),
    }
}

#[tokio::test]
async fn test_visualization_bounds_cover_all_points() {
    let invocations = vec![
        ok_invocation(
            "where",
            serde_json::json!({
                "insight": "Two clusters.",
                "points": [
                    {"lat": 40.0, "lon": -74.0},
                    {"lat": 41.0, "lon": -73.0}
                ]
            }),
        ),
        ok_invocation("what", serde_json::json!({"insight": "Potholes."})),
    ];
    let input = JobInput::Query {
        question: "Where?".to_string(),
        filters: BTreeMap::new(),
    };

    let artifact = synthesizer()
        .synthesize_query(&ctx(), &input, &query_plan(), &invocations)
        .await
        .unwrap();
    match artifact {
        ResultArtifact::Query { visualization, .. } => {
            let viz = visualization.expect("visualization missing");
            assert_eq!(viz.features.len(), 2);
            assert_eq!(viz.bounds, [-74.0, 40.0, -73.0, 41.0]);
        }
        other => panic!("expected query artifact, got {:?}", other),
    }
}
