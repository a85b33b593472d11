//! The engine handle: the single entry point host applications hold.
//!
//! An [`Engine`] owns the config store, tool broker, status bus, and
//! scheduler, and exposes the request surface: submissions, job reads,
//! status subscription, cancellation, and the configuration writes. There
//! are no process globals; everything the engine touches hangs off this
//! handle, and every operation takes the caller's tenant explicitly.
//!
//! # Example
//!
//! ```rust,no_run
//! use domainflow::config::EngineConfig;
//! use domainflow::engine::Engine;
//! use domainflow::types::{
//!     AgentClass, AgentDefinition, FieldType, OutputSchema, Playbook, TenantId, ToolName, UserId,
//! };
//!
//! # async {
//! let engine = Engine::new(EngineConfig::default());
//! let tenant = TenantId::new("acme");
//! let user = UserId::new("u-1");
//!
//! engine.put_agent(
//!     &tenant,
//!     AgentDefinition::new("geo", AgentClass::Ingest, "Extract the location.")
//!         .with_tool(ToolName::Llm)
//!         .with_output_schema(OutputSchema::new().with_field("location", FieldType::String)),
//! ).unwrap();
//! engine.put_playbook(
//!     &tenant,
//!     Playbook::new("city-reports", "city", AgentClass::Ingest, vec!["geo".into()]),
//! ).unwrap();
//!
//! let accepted = engine
//!     .submit_ingest(&tenant, &user, "city", "Water main break on Elm St", vec![], None)
//!     .unwrap();
//! let job = engine.get_job(&tenant, &accepted.job_id).unwrap();
//! # };
//! ```

use crate::domainflow::broker::{PermissionSource, ToolBroker, ToolProvider};
use crate::domainflow::config::EngineConfig;
use crate::domainflow::config_store::{BackupRecord, ConfigStore, TemplateInstantiation};
use crate::domainflow::error::EngineResult;
use crate::domainflow::job::{Job, JobInput, JobState};
use crate::domainflow::runtime::AgentRuntime;
use crate::domainflow::scheduler::{JobAccepted, Scheduler};
use crate::domainflow::status::{StatusBus, StatusEvent};
use crate::domainflow::synthesizer::Synthesizer;
use crate::domainflow::types::{
    AgentClass, AgentDefinition, DependencyGraph, DomainTemplate, Playbook, TenantId, ToolName,
    UserId,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Engine {
    store: Arc<ConfigStore>,
    broker: Arc<ToolBroker>,
    bus: Arc<StatusBus>,
    scheduler: Scheduler,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let store = Arc::new(ConfigStore::new());
        let permissions: Arc<dyn PermissionSource> = Arc::clone(&store) as Arc<dyn PermissionSource>;
        let broker = Arc::new(ToolBroker::new(&config, permissions));
        let bus = Arc::new(StatusBus::new());
        let runtime = AgentRuntime::new(Arc::clone(&broker), config.tool_calls_per_agent);
        let synthesizer = Arc::new(Synthesizer::new(Arc::clone(&broker)));
        let scheduler = Scheduler::new(
            config,
            Arc::clone(&store),
            runtime,
            synthesizer,
            Arc::clone(&bus),
        );
        Self {
            store,
            broker,
            bus,
            scheduler,
        }
    }

    /// Register the provider behind one tool capability.
    pub fn register_tool_provider(&self, provider: Arc<dyn ToolProvider>) {
        self.broker.register_provider(provider);
    }

    // ── Job surface ──────────────────────────────────────────────────────

    /// Submit an unstructured report for the domain's ingest playbook.
    /// Attachment bytes never pass through the engine, only their URIs.
    pub fn submit_ingest(
        &self,
        tenant: &TenantId,
        user: &UserId,
        domain_id: &str,
        text: impl Into<String>,
        attachments: Vec<String>,
        priority: Option<u8>,
    ) -> EngineResult<JobAccepted> {
        self.scheduler.submit(
            tenant,
            user,
            AgentClass::Ingest,
            domain_id,
            JobInput::Ingest {
                text: text.into(),
                attachments,
                priority,
            },
        )
    }

    /// Submit a natural-language question for the domain's query playbook.
    pub fn submit_query(
        &self,
        tenant: &TenantId,
        user: &UserId,
        domain_id: &str,
        question: impl Into<String>,
        filters: BTreeMap<String, String>,
    ) -> EngineResult<JobAccepted> {
        self.scheduler.submit(
            tenant,
            user,
            AgentClass::Query,
            domain_id,
            JobInput::Query {
                question: question.into(),
                filters,
            },
        )
    }

    /// Run a management playbook. Management jobs execute under the same
    /// scheduler and produce a merged artifact like ingest jobs.
    pub fn submit_management(
        &self,
        tenant: &TenantId,
        user: &UserId,
        domain_id: &str,
        instruction: impl Into<String>,
    ) -> EngineResult<JobAccepted> {
        self.scheduler.submit(
            tenant,
            user,
            AgentClass::Management,
            domain_id,
            JobInput::Ingest {
                text: instruction.into(),
                attachments: Vec::new(),
                priority: None,
            },
        )
    }

    /// State plus artifact (when terminal) for one job.
    pub fn get_job(&self, tenant: &TenantId, job_id: &str) -> EngineResult<Job> {
        self.scheduler.get_job(tenant, job_id)
    }

    /// Stream of progress events for a user, optionally filtered to one
    /// job. Delivery is best-effort; reconcile against
    /// [`Job::events_emitted`] after gaps.
    pub fn subscribe_status(
        &self,
        user: &UserId,
        job_id: Option<String>,
    ) -> mpsc::UnboundedReceiver<StatusEvent> {
        self.bus.subscribe(user.clone(), job_id)
    }

    /// Cooperative, idempotent cancellation.
    pub fn cancel(&self, tenant: &TenantId, job_id: &str) -> EngineResult<JobState> {
        self.scheduler.cancel(tenant, job_id)
    }

    // ── Configuration surface ────────────────────────────────────────────

    /// Create or update an agent. Any cached tool permissions for the
    /// agent are invalidated immediately.
    pub fn put_agent(&self, tenant: &TenantId, def: AgentDefinition) -> EngineResult<u32> {
        let agent_id = def.agent_id.clone();
        let version = self.store.put_agent(tenant, def)?;
        self.broker.invalidate_permissions(tenant, &agent_id);
        Ok(version)
    }

    pub fn get_agent(&self, tenant: &TenantId, agent_id: &str) -> EngineResult<AgentDefinition> {
        self.store.get_agent(tenant, agent_id)
    }

    pub fn list_agents(&self, tenant: &TenantId) -> Vec<AgentDefinition> {
        self.store.list_agents(tenant)
    }

    pub fn delete_agent(&self, tenant: &TenantId, agent_id: &str) -> EngineResult<()> {
        self.store.delete_agent(tenant, agent_id)?;
        self.broker.invalidate_permissions(tenant, agent_id);
        Ok(())
    }

    /// Version history of an agent's previous definitions.
    pub fn agent_backups(&self, tenant: &TenantId, agent_id: &str) -> Vec<BackupRecord> {
        self.store.backups(tenant, agent_id)
    }

    /// Authorize one more tool for an agent. Versions the definition and
    /// drops the cached permissions so the grant is visible immediately.
    pub fn grant_tool(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        tool: ToolName,
    ) -> EngineResult<u32> {
        let mut def = self.store.get_agent(tenant, agent_id)?;
        def.allowed_tools.insert(tool);
        self.put_agent(tenant, def)
    }

    /// Withdraw a tool from an agent's allowed set. Takes effect on the
    /// next broker dispatch.
    pub fn revoke_tool(
        &self,
        tenant: &TenantId,
        agent_id: &str,
        tool: ToolName,
    ) -> EngineResult<u32> {
        let mut def = self.store.get_agent(tenant, agent_id)?;
        def.allowed_tools.remove(&tool);
        self.put_agent(tenant, def)
    }

    pub fn put_playbook(&self, tenant: &TenantId, playbook: Playbook) -> EngineResult<u32> {
        self.store.put_playbook(tenant, playbook)
    }

    pub fn get_playbook(&self, tenant: &TenantId, playbook_id: &str) -> EngineResult<Playbook> {
        self.store.get_playbook(tenant, playbook_id)
    }

    pub fn list_playbooks(&self, tenant: &TenantId) -> Vec<Playbook> {
        self.store.list_playbooks(tenant)
    }

    pub fn delete_playbook(&self, tenant: &TenantId, playbook_id: &str) -> EngineResult<()> {
        self.store.delete_playbook(tenant, playbook_id)
    }

    pub fn put_dependency_graph(
        &self,
        tenant: &TenantId,
        graph: DependencyGraph,
    ) -> EngineResult<()> {
        self.store.put_dependency_graph(tenant, graph)
    }

    pub fn get_dependency_graph(
        &self,
        tenant: &TenantId,
        playbook_id: &str,
    ) -> Option<DependencyGraph> {
        self.store.get_dependency_graph(tenant, playbook_id)
    }

    pub fn put_template(&self, tenant: &TenantId, template: DomainTemplate) -> EngineResult<()> {
        self.store.put_template(tenant, template)
    }

    pub fn get_template(
        &self,
        tenant: &TenantId,
        template_id: &str,
    ) -> EngineResult<DomainTemplate> {
        self.store.get_template(tenant, template_id)
    }

    pub fn list_templates(&self, tenant: &TenantId) -> Vec<DomainTemplate> {
        self.store.list_templates(tenant)
    }

    /// Stamp a template out for the tenant: fresh ids, rewritten
    /// references, atomic visibility.
    pub fn instantiate_template(
        &self,
        tenant: &TenantId,
        template_id: &str,
    ) -> EngineResult<TemplateInstantiation> {
        self.store.instantiate_template(tenant, template_id)
    }
}
