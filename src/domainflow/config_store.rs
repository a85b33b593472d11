//! Validated, versioned catalog of agents, playbooks, dependency graphs,
//! and domain templates.
//!
//! The store is the single write path for configuration, and every write
//! re-checks the structural invariants, so anything the scheduler reads is
//! well-formed by construction:
//!
//! - output schemas hold at most five keys
//! - built-in agents are immutable
//! - dependency parents exist and share their child's class
//! - playbooks only reference existing, enabled agents of their own class
//! - dependency graphs are single-parent, single-layer DAGs over their
//!   playbook's agents
//!
//! Writes are versioned: the previous record is retained as a
//! content-addressed backup (sha256 over the canonical JSON) before being
//! overwritten. Deletes are soft while any playbook still references the
//! agent, hard otherwise.
//!
//! Reads hand out owned snapshots, never references into the store, so a
//! job that captured a [`Plan`] is immune to later edits.

use crate::domainflow::error::{EngineError, EngineResult};
use crate::domainflow::graph::{assign_levels, validate_graph, Plan};
use crate::domainflow::types::{
    AgentClass, AgentDefinition, DependencyGraph, DomainTemplate, Playbook, TenantId,
    OUTPUT_SCHEMA_MAX_KEYS,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

/// A retained previous version of an agent definition, addressed by the
/// sha256 of its canonical JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub content_hash: String,
    pub agent_id: String,
    pub version: u32,
    pub stored_at: DateTime<Utc>,
    /// Canonical JSON of the replaced definition.
    pub payload: String,
}

/// Result of instantiating a template: the symbolic→fresh id rewrite plus
/// the ids of the records that became visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateInstantiation {
    /// Symbolic agent id → freshly minted agent id.
    pub agent_id_map: BTreeMap<String, String>,
    pub playbook_ids: Vec<String>,
    pub graph_ids: Vec<String>,
}

#[derive(Debug, Clone)]
struct AgentRecord {
    def: AgentDefinition,
    tombstoned: bool,
}

#[derive(Default)]
struct TenantCatalog {
    agents: HashMap<String, AgentRecord>,
    playbooks: HashMap<String, Playbook>,
    /// One graph per playbook, keyed by playbook id.
    graphs: HashMap<String, DependencyGraph>,
    templates: HashMap<String, DomainTemplate>,
    backups: Vec<BackupRecord>,
}

impl TenantCatalog {
    fn live_agent(&self, agent_id: &str) -> Option<&AgentDefinition> {
        self.agents
            .get(agent_id)
            .filter(|r| !r.tombstoned)
            .map(|r| &r.def)
    }

    fn referencing_playbooks(&self, agent_id: &str) -> Vec<&str> {
        self.playbooks
            .values()
            .filter(|p| p.agent_ids.iter().any(|a| a == agent_id))
            .map(|p| p.playbook_id.as_str())
            .collect()
    }
}

/// In-memory configuration store, tenant-partitioned.
///
/// Persistence of the catalog itself belongs to the external relational
/// store; this type holds the validated working set and is the only
/// component allowed to hand [`Plan`] snapshots to the scheduler.
#[derive(Default)]
pub struct ConfigStore {
    tenants: RwLock<HashMap<TenantId, TenantCatalog>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update an agent definition. Returns the stored version.
    ///
    /// Fails with `SchemaViolation` when the output schema exceeds the
    /// five-key cap or a query agent lacks an interrogative, with
    /// `BuiltinImmutable` when the target is built-in, and with
    /// `BadReference`/`ClassMismatch` when the dependency parent is
    /// missing, tombstoned, mismatched in class, or already a child.
    pub fn put_agent(&self, tenant: &TenantId, mut def: AgentDefinition) -> EngineResult<u32> {
        if def.output_schema.len() > OUTPUT_SCHEMA_MAX_KEYS {
            return Err(EngineError::SchemaViolation(format!(
                "agent '{}' declares {} output keys, maximum is {}",
                def.agent_id,
                def.output_schema.len(),
                OUTPUT_SCHEMA_MAX_KEYS
            )));
        }
        match def.class {
            AgentClass::Query => {
                if def.interrogative.is_none() {
                    return Err(EngineError::SchemaViolation(format!(
                        "query agent '{}' must declare an interrogative",
                        def.agent_id
                    )));
                }
            }
            _ => {
                if def.interrogative.is_some() {
                    return Err(EngineError::SchemaViolation(format!(
                        "agent '{}' is not query-class and may not declare an interrogative",
                        def.agent_id
                    )));
                }
            }
        }

        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        let catalog = tenants.entry(tenant.clone()).or_default();

        if let Some(parent_id) = &def.dependency_parent {
            let parent = catalog.live_agent(parent_id).ok_or_else(|| {
                EngineError::BadReference(format!(
                    "dependency parent '{}' of agent '{}' does not exist",
                    parent_id, def.agent_id
                ))
            })?;
            if parent.class != def.class {
                return Err(EngineError::ClassMismatch(format!(
                    "dependency parent '{}' is {} but agent '{}' is {}",
                    parent_id, parent.class, def.agent_id, def.class
                )));
            }
            if parent.dependency_parent.is_some() {
                return Err(EngineError::MultiLevel(format!(
                    "dependency parent '{}' already has a parent of its own",
                    parent_id
                )));
            }
        }

        match catalog.agents.get(&def.agent_id) {
            Some(existing) if existing.def.is_builtin => {
                return Err(EngineError::BuiltinImmutable(format!(
                    "agent '{}' is built-in and cannot be modified",
                    def.agent_id
                )));
            }
            Some(existing) => {
                // Retain the replaced record before overwriting.
                let backup = Self::backup_of(&existing.def)?;
                catalog.backups.push(backup);
                def.version = existing.def.version + 1;
            }
            None => {
                def.version = 1;
            }
        }

        let version = def.version;
        log::info!(
            "config tenant={} put_agent id={} version={}",
            tenant,
            def.agent_id,
            version
        );
        catalog.agents.insert(
            def.agent_id.clone(),
            AgentRecord {
                def,
                tombstoned: false,
            },
        );
        Ok(version)
    }

    pub fn get_agent(&self, tenant: &TenantId, agent_id: &str) -> EngineResult<AgentDefinition> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        tenants
            .get(tenant)
            .and_then(|c| c.live_agent(agent_id))
            .cloned()
            .ok_or_else(|| {
                EngineError::BadReference(format!("agent '{}' does not exist", agent_id))
            })
    }

    pub fn list_agents(&self, tenant: &TenantId) -> Vec<AgentDefinition> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        let mut agents: Vec<AgentDefinition> = tenants
            .get(tenant)
            .map(|c| {
                c.agents
                    .values()
                    .filter(|r| !r.tombstoned)
                    .map(|r| r.def.clone())
                    .collect()
            })
            .unwrap_or_default();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Delete an agent. Soft (tombstone) while any playbook references it,
    /// hard otherwise. Built-ins cannot be deleted.
    pub fn delete_agent(&self, tenant: &TenantId, agent_id: &str) -> EngineResult<()> {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        let catalog = tenants.get_mut(tenant).ok_or_else(|| {
            EngineError::BadReference(format!("agent '{}' does not exist", agent_id))
        })?;
        let record = catalog.agents.get(agent_id).ok_or_else(|| {
            EngineError::BadReference(format!("agent '{}' does not exist", agent_id))
        })?;
        if record.def.is_builtin {
            return Err(EngineError::BuiltinImmutable(format!(
                "agent '{}' is built-in and cannot be deleted",
                agent_id
            )));
        }
        if catalog.referencing_playbooks(agent_id).is_empty() {
            catalog.agents.remove(agent_id);
            log::info!("config tenant={} hard-deleted agent={}", tenant, agent_id);
        } else {
            if let Some(record) = catalog.agents.get_mut(agent_id) {
                record.tombstoned = true;
            }
            log::info!("config tenant={} tombstoned agent={}", tenant, agent_id);
        }
        Ok(())
    }

    /// Version history of an agent, newest last.
    pub fn backups(&self, tenant: &TenantId, agent_id: &str) -> Vec<BackupRecord> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        tenants
            .get(tenant)
            .map(|c| {
                c.backups
                    .iter()
                    .filter(|b| b.agent_id == agent_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Create or update a playbook.
    ///
    /// Every referenced agent must exist, be enabled, and share the
    /// playbook's class; agent ids must be unique within the playbook. If
    /// an existing dependency graph no longer fits the new agent set it is
    /// dropped, to be regenerated by the next graph write.
    pub fn put_playbook(&self, tenant: &TenantId, mut playbook: Playbook) -> EngineResult<u32> {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        let catalog = tenants.entry(tenant.clone()).or_default();

        let mut seen = std::collections::HashSet::new();
        for agent_id in &playbook.agent_ids {
            if !seen.insert(agent_id.as_str()) {
                return Err(EngineError::SchemaViolation(format!(
                    "agent '{}' appears more than once in playbook '{}'",
                    agent_id, playbook.playbook_id
                )));
            }
            let agent = catalog.live_agent(agent_id).ok_or_else(|| {
                EngineError::BadReference(format!(
                    "playbook '{}' references unknown agent '{}'",
                    playbook.playbook_id, agent_id
                ))
            })?;
            if agent.class != playbook.class {
                return Err(EngineError::ClassMismatch(format!(
                    "agent '{}' is {} but playbook '{}' is {}",
                    agent_id, agent.class, playbook.playbook_id, playbook.class
                )));
            }
            if !agent.enabled {
                return Err(EngineError::BadReference(format!(
                    "playbook '{}' references disabled agent '{}'",
                    playbook.playbook_id, agent_id
                )));
            }
        }

        playbook.version = catalog
            .playbooks
            .get(&playbook.playbook_id)
            .map(|p| p.version + 1)
            .unwrap_or(1);

        // A playbook edit can orphan its graph's edges.
        if let Some(graph) = catalog.graphs.get(&playbook.playbook_id) {
            if validate_graph(&graph.edges, &playbook.agent_ids).is_err() {
                log::warn!(
                    "config tenant={} playbook={} update invalidated its dependency graph, dropping it",
                    tenant,
                    playbook.playbook_id
                );
                catalog.graphs.remove(&playbook.playbook_id);
            }
        }

        let version = playbook.version;
        log::info!(
            "config tenant={} put_playbook id={} version={}",
            tenant,
            playbook.playbook_id,
            version
        );
        catalog
            .playbooks
            .insert(playbook.playbook_id.clone(), playbook);
        Ok(version)
    }

    pub fn get_playbook(&self, tenant: &TenantId, playbook_id: &str) -> EngineResult<Playbook> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        tenants
            .get(tenant)
            .and_then(|c| c.playbooks.get(playbook_id))
            .cloned()
            .ok_or_else(|| {
                EngineError::BadReference(format!("playbook '{}' does not exist", playbook_id))
            })
    }

    pub fn list_playbooks(&self, tenant: &TenantId) -> Vec<Playbook> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        let mut playbooks: Vec<Playbook> = tenants
            .get(tenant)
            .map(|c| c.playbooks.values().cloned().collect())
            .unwrap_or_default();
        playbooks.sort_by(|a, b| a.playbook_id.cmp(&b.playbook_id));
        playbooks
    }

    pub fn delete_playbook(&self, tenant: &TenantId, playbook_id: &str) -> EngineResult<()> {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        let catalog = tenants.get_mut(tenant).ok_or_else(|| {
            EngineError::BadReference(format!("playbook '{}' does not exist", playbook_id))
        })?;
        if catalog.playbooks.remove(playbook_id).is_none() {
            return Err(EngineError::BadReference(format!(
                "playbook '{}' does not exist",
                playbook_id
            )));
        }
        catalog.graphs.remove(playbook_id);
        Ok(())
    }

    /// Validate and store a dependency graph for its playbook. A graph
    /// that fails validation is not persisted; any previous graph for the
    /// playbook stays in place.
    pub fn put_dependency_graph(
        &self,
        tenant: &TenantId,
        graph: DependencyGraph,
    ) -> EngineResult<()> {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        let catalog = tenants.entry(tenant.clone()).or_default();
        let playbook = catalog.playbooks.get(&graph.playbook_id).ok_or_else(|| {
            EngineError::BadReference(format!(
                "graph '{}' references unknown playbook '{}'",
                graph.graph_id, graph.playbook_id
            ))
        })?;
        validate_graph(&graph.edges, &playbook.agent_ids)?;
        log::info!(
            "config tenant={} put_graph id={} playbook={} edges={}",
            tenant,
            graph.graph_id,
            graph.playbook_id,
            graph.edges.len()
        );
        catalog.graphs.insert(graph.playbook_id.clone(), graph);
        Ok(())
    }

    pub fn get_dependency_graph(
        &self,
        tenant: &TenantId,
        playbook_id: &str,
    ) -> Option<DependencyGraph> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        tenants
            .get(tenant)
            .and_then(|c| c.graphs.get(playbook_id))
            .cloned()
    }

    /// Resolve the playbook for `(domain_id, class)` into a read-only
    /// [`Plan`] snapshot with a precomputed level assignment.
    ///
    /// When multiple playbooks exist for the pair, the lexicographically
    /// smallest playbook id wins, for determinism. A referenced agent that
    /// has since been tombstoned or disabled fails the load with
    /// `BadReference` rather than silently shrinking the plan.
    pub fn get_plan(
        &self,
        tenant: &TenantId,
        domain_id: &str,
        class: AgentClass,
    ) -> EngineResult<Plan> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        let catalog = tenants.get(tenant).ok_or_else(|| {
            EngineError::BadReference(format!(
                "no playbook for domain '{}' class {}",
                domain_id, class
            ))
        })?;

        let playbook = catalog
            .playbooks
            .values()
            .filter(|p| p.domain_id == domain_id && p.class == class)
            .min_by(|a, b| a.playbook_id.cmp(&b.playbook_id))
            .ok_or_else(|| {
                EngineError::BadReference(format!(
                    "no playbook for domain '{}' class {}",
                    domain_id, class
                ))
            })?;

        let mut agents = BTreeMap::new();
        for agent_id in &playbook.agent_ids {
            let def = catalog.live_agent(agent_id).ok_or_else(|| {
                EngineError::BadReference(format!(
                    "playbook '{}' references missing agent '{}'",
                    playbook.playbook_id, agent_id
                ))
            })?;
            if !def.enabled {
                return Err(EngineError::BadReference(format!(
                    "playbook '{}' references disabled agent '{}'",
                    playbook.playbook_id, agent_id
                )));
            }
            agents.insert(agent_id.clone(), def.clone());
        }

        let edges = catalog
            .graphs
            .get(&playbook.playbook_id)
            .map(|g| g.edges.clone())
            .unwrap_or_default();
        let levels = assign_levels(&edges, &playbook.agent_ids);

        Ok(Plan {
            domain_id: playbook.domain_id.clone(),
            playbook_id: playbook.playbook_id.clone(),
            class,
            agents,
            edges,
            levels,
        })
    }

    pub fn put_template(&self, tenant: &TenantId, template: DomainTemplate) -> EngineResult<()> {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        let catalog = tenants.entry(tenant.clone()).or_default();
        catalog
            .templates
            .insert(template.template_id.clone(), template);
        Ok(())
    }

    pub fn get_template(&self, tenant: &TenantId, template_id: &str) -> EngineResult<DomainTemplate> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        tenants
            .get(tenant)
            .and_then(|c| c.templates.get(template_id))
            .cloned()
            .ok_or_else(|| {
                EngineError::BadReference(format!("template '{}' does not exist", template_id))
            })
    }

    pub fn list_templates(&self, tenant: &TenantId) -> Vec<DomainTemplate> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        let mut templates: Vec<DomainTemplate> = tenants
            .get(tenant)
            .map(|c| c.templates.values().cloned().collect())
            .unwrap_or_default();
        templates.sort_by(|a, b| a.template_id.cmp(&b.template_id));
        templates
    }

    /// Instantiate a template for a tenant: mint fresh agent ids, rewrite
    /// every reference in the bundled playbooks and graphs, validate, and
    /// commit all records in one step so nothing partial ever becomes
    /// visible.
    pub fn instantiate_template(
        &self,
        tenant: &TenantId,
        template_id: &str,
    ) -> EngineResult<TemplateInstantiation> {
        let template = self.get_template(tenant, template_id)?;

        let mut agent_id_map: BTreeMap<String, String> = BTreeMap::new();
        for agent in &template.agents {
            let fresh = format!("{}-{}", agent.agent_id, short_uuid());
            agent_id_map.insert(agent.agent_id.clone(), fresh);
        }

        // Rewrite everything against the fresh ids before anything is
        // committed.
        let mut new_agents = Vec::with_capacity(template.agents.len());
        for agent in &template.agents {
            let mut def = agent.clone();
            def.agent_id = agent_id_map[&agent.agent_id].clone();
            if let Some(parent) = &def.dependency_parent {
                let rewritten = agent_id_map.get(parent).ok_or_else(|| {
                    EngineError::BadReference(format!(
                        "template '{}' agent '{}' has parent '{}' outside the template",
                        template_id, agent.agent_id, parent
                    ))
                })?;
                def.dependency_parent = Some(rewritten.clone());
            }
            def.is_builtin = false;
            def.version = 1;
            new_agents.push(def);
        }

        let mut new_playbooks = Vec::with_capacity(template.playbooks.len());
        let mut playbook_id_map: BTreeMap<String, String> = BTreeMap::new();
        for playbook in &template.playbooks {
            let mut p = playbook.clone();
            p.playbook_id = format!("{}-{}", playbook.playbook_id, short_uuid());
            playbook_id_map.insert(playbook.playbook_id.clone(), p.playbook_id.clone());
            p.agent_ids = playbook
                .agent_ids
                .iter()
                .map(|id| {
                    agent_id_map.get(id).cloned().ok_or_else(|| {
                        EngineError::BadReference(format!(
                            "template '{}' playbook '{}' references agent '{}' outside the template",
                            template_id, playbook.playbook_id, id
                        ))
                    })
                })
                .collect::<EngineResult<Vec<String>>>()?;
            p.version = 1;
            new_playbooks.push(p);
        }

        let mut new_graphs = Vec::with_capacity(template.graphs.len());
        for graph in &template.graphs {
            let playbook_id = playbook_id_map.get(&graph.playbook_id).ok_or_else(|| {
                EngineError::BadReference(format!(
                    "template '{}' graph '{}' references playbook '{}' outside the template",
                    template_id, graph.graph_id, graph.playbook_id
                ))
            })?;
            let mut g = graph.clone();
            g.graph_id = format!("{}-{}", graph.graph_id, short_uuid());
            g.playbook_id = playbook_id.clone();
            g.edges = graph
                .edges
                .iter()
                .map(|(from, to)| {
                    let from = agent_id_map.get(from).ok_or_else(|| {
                        EngineError::DanglingEdge(format!(
                            "template graph edge source '{}' outside the template",
                            from
                        ))
                    })?;
                    let to = agent_id_map.get(to).ok_or_else(|| {
                        EngineError::DanglingEdge(format!(
                            "template graph edge target '{}' outside the template",
                            to
                        ))
                    })?;
                    Ok((from.clone(), to.clone()))
                })
                .collect::<EngineResult<Vec<(String, String)>>>()?;

            let owner = new_playbooks
                .iter()
                .find(|p| p.playbook_id == g.playbook_id)
                .ok_or_else(|| {
                    EngineError::BadReference(format!(
                        "template graph '{}' has no owning playbook after rewrite",
                        g.graph_id
                    ))
                })?;
            validate_graph(&g.edges, &owner.agent_ids)?;
            new_graphs.push(g);
        }

        // Commit under one write lock: first visibility is all-or-nothing.
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        let catalog = tenants.entry(tenant.clone()).or_default();
        for def in new_agents {
            catalog.agents.insert(
                def.agent_id.clone(),
                AgentRecord {
                    def,
                    tombstoned: false,
                },
            );
        }
        let playbook_ids: Vec<String> = new_playbooks
            .iter()
            .map(|p| p.playbook_id.clone())
            .collect();
        for p in new_playbooks {
            catalog.playbooks.insert(p.playbook_id.clone(), p);
        }
        let graph_ids: Vec<String> = new_graphs.iter().map(|g| g.graph_id.clone()).collect();
        for g in new_graphs {
            catalog.graphs.insert(g.playbook_id.clone(), g);
        }

        log::info!(
            "config tenant={} instantiated template={} agents={} playbooks={}",
            tenant,
            template_id,
            agent_id_map.len(),
            playbook_ids.len()
        );

        Ok(TemplateInstantiation {
            agent_id_map,
            playbook_ids,
            graph_ids,
        })
    }

    fn backup_of(def: &AgentDefinition) -> EngineResult<BackupRecord> {
        let payload = serde_json::to_string(def)
            .map_err(|e| EngineError::Internal(format!("serialize backup: {}", e)))?;
        let mut hasher = Sha256::new();
        hasher.update(payload.as_bytes());
        Ok(BackupRecord {
            content_hash: format!("{:x}", hasher.finalize()),
            agent_id: def.agent_id.clone(),
            version: def.version,
            stored_at: Utc::now(),
            payload,
        })
    }
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// The catalog is the source of truth for tool authorization: an agent may
/// use exactly the tools its live definition declares.
impl crate::domainflow::broker::PermissionSource for ConfigStore {
    fn allowed_tools(
        &self,
        tenant: &TenantId,
        agent_id: &str,
    ) -> Option<std::collections::BTreeSet<crate::domainflow::types::ToolName>> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        tenants
            .get(tenant)
            .and_then(|c| c.live_agent(agent_id))
            .map(|def| def.allowed_tools.clone())
    }
}
