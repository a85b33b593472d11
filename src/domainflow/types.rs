//! Core entity model.
//!
//! Everything the engine stores or schedules is described here: tenant and
//! user identity, agent classes and definitions, playbooks, dependency
//! graphs, and domain templates. All entities are tenant-scoped; the tenant
//! is carried explicitly through every operation and is never ambient.
//!
//! Agent outputs are bounded by construction: an [`OutputSchema`] may
//! declare at most [`OUTPUT_SCHEMA_MAX_KEYS`] keys, and the runtime rejects
//! any agent response that strays outside the declared keys.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Hard cap on the number of keys an agent's output schema may declare.
pub const OUTPUT_SCHEMA_MAX_KEYS: usize = 5;

/// Tenant identity. The outermost isolation boundary; every entity and
/// operation carries one, and cross-entity joins assert equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        TenantId(id.into())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId(s.to_string())
    }
}

/// Opaque authenticated user identity. Determines status-event fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

/// The three classes an agent (and the playbook that contains it) can have.
///
/// A playbook only references agents of its own class, and dependency
/// parents must share the class of their children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentClass {
    /// Extracts structured facts from unstructured report text.
    Ingest,
    /// Answers one interrogative axis of a natural-language question.
    Query,
    /// Maintenance operations over existing domain data.
    Management,
}

impl fmt::Display for AgentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentClass::Ingest => "ingest",
            AgentClass::Query => "query",
            AgentClass::Management => "management",
        };
        write!(f, "{}", s)
    }
}

/// The semantic axis a query agent answers.
///
/// The declaration order below is the canonical presentation order for
/// query bullets: What, Where, When, Who, Why, How, Which, HowMany,
/// HowMuch, FromWhere, WhatKind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interrogative {
    What,
    Where,
    When,
    Who,
    Why,
    How,
    Which,
    HowMany,
    HowMuch,
    FromWhere,
    WhatKind,
}

impl Interrogative {
    /// All interrogatives in canonical presentation order.
    pub const CANONICAL_ORDER: [Interrogative; 11] = [
        Interrogative::What,
        Interrogative::Where,
        Interrogative::When,
        Interrogative::Who,
        Interrogative::Why,
        Interrogative::How,
        Interrogative::Which,
        Interrogative::HowMany,
        Interrogative::HowMuch,
        Interrogative::FromWhere,
        Interrogative::WhatKind,
    ];

    /// Position in the canonical order, used to sort query bullets.
    pub fn canonical_rank(&self) -> usize {
        Self::CANONICAL_ORDER
            .iter()
            .position(|i| i == self)
            .unwrap_or(Self::CANONICAL_ORDER.len())
    }

    /// Bullet prefix, e.g. `"Where"` or `"How many"`.
    pub fn display_prefix(&self) -> &'static str {
        match self {
            Interrogative::What => "What",
            Interrogative::Where => "Where",
            Interrogative::When => "When",
            Interrogative::Who => "Who",
            Interrogative::Why => "Why",
            Interrogative::How => "How",
            Interrogative::Which => "Which",
            Interrogative::HowMany => "How many",
            Interrogative::HowMuch => "How much",
            Interrogative::FromWhere => "From where",
            Interrogative::WhatKind => "What kind",
        }
    }
}

impl fmt::Display for Interrogative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_prefix())
    }
}

/// The closed set of capabilities agents may be authorized for.
///
/// Tools are identified by symbolic name on the wire (`"llm"`,
/// `"data.retrieval"`, ...). Agents never perform direct I/O; every
/// capability below is reached through the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolName {
    #[serde(rename = "llm")]
    Llm,
    #[serde(rename = "entity_nlp")]
    EntityNlp,
    #[serde(rename = "geocode")]
    Geocode,
    #[serde(rename = "web_search")]
    WebSearch,
    #[serde(rename = "data.retrieval")]
    DataRetrieval,
    #[serde(rename = "data.aggregation")]
    DataAggregation,
    #[serde(rename = "data.spatial")]
    DataSpatial,
    #[serde(rename = "data.analytics")]
    DataAnalytics,
    #[serde(rename = "vector_search")]
    VectorSearch,
    #[serde(rename = "custom_http")]
    CustomHttp,
}

impl ToolName {
    /// Every tool in the closed set.
    pub const ALL: [ToolName; 10] = [
        ToolName::Llm,
        ToolName::EntityNlp,
        ToolName::Geocode,
        ToolName::WebSearch,
        ToolName::DataRetrieval,
        ToolName::DataAggregation,
        ToolName::DataSpatial,
        ToolName::DataAnalytics,
        ToolName::VectorSearch,
        ToolName::CustomHttp,
    ];

    /// Symbolic wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::Llm => "llm",
            ToolName::EntityNlp => "entity_nlp",
            ToolName::Geocode => "geocode",
            ToolName::WebSearch => "web_search",
            ToolName::DataRetrieval => "data.retrieval",
            ToolName::DataAggregation => "data.aggregation",
            ToolName::DataSpatial => "data.spatial",
            ToolName::DataAnalytics => "data.analytics",
            ToolName::VectorSearch => "vector_search",
            ToolName::CustomHttp => "custom_http",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown tool '{}'", s))
    }
}

/// Value type of a single output-schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    StringList,
    Object,
}

impl FieldType {
    /// Check a parsed JSON value against this type.
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::StringList => value
                .as_array()
                .map(|a| a.iter().all(|v| v.is_string()))
                .unwrap_or(false),
            FieldType::Object => value.is_object(),
        }
    }
}

/// The bounded, typed shape an agent promises to return.
///
/// At most [`OUTPUT_SCHEMA_MAX_KEYS`] keys. Keys are stored ordered so
/// prompt construction and validation are deterministic.
///
/// # Example
///
/// ```rust
/// use domainflow::types::{FieldType, OutputSchema};
///
/// let schema = OutputSchema::new()
///     .with_field("category", FieldType::String)
///     .with_field("confidence", FieldType::Number);
/// assert_eq!(schema.len(), 2);
/// assert!(schema.field_type("category").is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    fields: BTreeMap<String, FieldType>,
}

impl OutputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field (builder pattern). The cap is enforced at config-store
    /// write time, not here, so oversized schemas can be constructed in
    /// order to be rejected with a proper error.
    pub fn with_field(mut self, key: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(key.into(), ty);
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    pub fn field_type(&self, key: &str) -> Option<FieldType> {
        self.fields.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// A named, parameterized unit of computation: consumes text (plus an
/// optional parent output) and returns a bounded structured record.
///
/// Definitions are immutable snapshots once stored; updates bump `version`
/// and the previous record is retained as a content-addressed backup.
///
/// # Example
///
/// ```rust
/// use domainflow::types::{AgentClass, AgentDefinition, FieldType, OutputSchema, ToolName};
///
/// let def = AgentDefinition::new("severity", AgentClass::Ingest, "Rate incident severity.")
///     .with_tool(ToolName::Llm)
///     .with_output_schema(
///         OutputSchema::new().with_field("severity_level", FieldType::String),
///     )
///     .with_dependency_parent("entity");
/// assert_eq!(def.agent_id, "severity");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Stable identifier referenced by playbooks and dependency graphs.
    pub agent_id: String,
    /// Class this agent belongs to; must match its playbook's class.
    pub class: AgentClass,
    /// Instructions applied to every invocation of this agent.
    pub system_prompt: String,
    /// Tools this agent may invoke through the broker. Anything outside
    /// this set is denied at dispatch time.
    pub allowed_tools: BTreeSet<ToolName>,
    /// Declared output shape; at most [`OUTPUT_SCHEMA_MAX_KEYS`] keys.
    pub output_schema: OutputSchema,
    /// Optional single parent whose output this agent consumes. The parent
    /// must exist, share this agent's class, and not have a parent itself.
    pub dependency_parent: Option<String>,
    /// For query-class agents, the interrogative axis this agent answers.
    pub interrogative: Option<Interrogative>,
    /// Built-in agents ship with the engine and are immutable.
    pub is_builtin: bool,
    /// Monotonic version, bumped by every successful update.
    pub version: u32,
    /// Disabled agents stay in the catalog but cannot be referenced by a
    /// playbook write and are skipped by plan loading.
    pub enabled: bool,
}

impl AgentDefinition {
    pub fn new(
        agent_id: impl Into<String>,
        class: AgentClass,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            class,
            system_prompt: system_prompt.into(),
            allowed_tools: BTreeSet::new(),
            output_schema: OutputSchema::new(),
            dependency_parent: None,
            interrogative: None,
            is_builtin: false,
            version: 0,
            enabled: true,
        }
    }

    /// Authorize one tool (builder pattern).
    pub fn with_tool(mut self, tool: ToolName) -> Self {
        self.allowed_tools.insert(tool);
        self
    }

    pub fn with_output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_dependency_parent(mut self, parent: impl Into<String>) -> Self {
        self.dependency_parent = Some(parent.into());
        self
    }

    pub fn with_interrogative(mut self, interrogative: Interrogative) -> Self {
        self.interrogative = Some(interrogative);
        self
    }

    pub fn builtin(mut self) -> Self {
        self.is_builtin = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Ordered set of agents executed together for a `(domain, class)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    pub playbook_id: String,
    pub domain_id: String,
    pub class: AgentClass,
    /// Referenced agent ids, unique within the playbook. Ownership stays
    /// with the agent catalog; playbooks hold ids only.
    pub agent_ids: Vec<String>,
    pub version: u32,
}

impl Playbook {
    pub fn new(
        playbook_id: impl Into<String>,
        domain_id: impl Into<String>,
        class: AgentClass,
        agent_ids: Vec<String>,
    ) -> Self {
        Self {
            playbook_id: playbook_id.into(),
            domain_id: domain_id.into(),
            class,
            agent_ids,
            version: 0,
        }
    }
}

/// Directed parent→child edges over a playbook's agents.
///
/// Must be a DAG with in-degree ≤ 1 per node and no chained parents; the
/// validator in [`crate::domainflow::graph`] enforces this at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub graph_id: String,
    pub playbook_id: String,
    /// `(from, to)` pairs, meaning `from` is the parent of `to`.
    pub edges: Vec<(String, String)>,
}

impl DependencyGraph {
    pub fn new(
        graph_id: impl Into<String>,
        playbook_id: impl Into<String>,
        edges: Vec<(String, String)>,
    ) -> Self {
        Self {
            graph_id: graph_id.into(),
            playbook_id: playbook_id.into(),
            edges,
        }
    }
}

/// Immutable bundle of agents, playbooks, and graphs that can be stamped
/// out for a tenant. Agent ids inside a template are symbolic; the config
/// store rewrites them to fresh ids at instantiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainTemplate {
    pub template_id: String,
    pub name: String,
    /// Bundled agent definitions keyed by symbolic id.
    pub agents: Vec<AgentDefinition>,
    /// Per-class playbooks referencing the symbolic ids above.
    pub playbooks: Vec<Playbook>,
    /// Dependency graphs over the symbolic ids above.
    pub graphs: Vec<DependencyGraph>,
}

impl DomainTemplate {
    pub fn new(template_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            name: name.into(),
            agents: Vec::new(),
            playbooks: Vec::new(),
            graphs: Vec::new(),
        }
    }

    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_playbook(mut self, playbook: Playbook) -> Self {
        self.playbooks.push(playbook);
        self
    }

    pub fn with_graph(mut self, graph: DependencyGraph) -> Self {
        self.graphs.push(graph);
        self
    }
}
