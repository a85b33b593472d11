//! The per-job orchestrator.
//!
//! Each submitted job runs as an independent tokio task that walks the
//! captured plan level by level: every agent in a level is spawned
//! concurrently, the level joins before the next begins, and a child never
//! observes its parent's output before the parent's level has joined.
//! Failures of individual agents are recorded and tolerated; the job only
//! fails when nothing at all succeeded, when synthesis refuses the partial
//! set, or on an internal error.
//!
//! Job states move `queued → running → (succeeded | failed | cancelled)`
//! and terminal states are sticky. Transitions are made under the job
//! table lock together with the corresponding status event, so observers
//! never see a state without its event or vice versa.
//!
//! Cancellation is cooperative: `cancel` trips the job's token, in-flight
//! invocations return `cancelled` at their next suspension point, and the
//! driver emits a single terminal `cancelled` event. Repeat cancels are
//! acknowledged without new events.

use crate::domainflow::config::EngineConfig;
use crate::domainflow::config_store::ConfigStore;
use crate::domainflow::error::{EngineError, EngineResult};
use crate::domainflow::graph::{ExecutionPlan, Plan};
use crate::domainflow::job::{
    AgentInvocation, AgentOutput, InvocationStatus, Job, JobInput, JobState, ResultArtifact,
};
use crate::domainflow::runtime::{AgentRuntime, InvocationRequest};
use crate::domainflow::status::{EventKind, JobEmitter, StatusBus};
use crate::domainflow::synthesizer::{
    validate_invocations, SynthesisContext, Synthesizer,
};
use crate::domainflow::types::{AgentClass, TenantId, UserId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Acknowledgement returned at submission.
#[derive(Debug, Clone)]
pub struct JobAccepted {
    pub job_id: String,
    pub accepted_at: DateTime<Utc>,
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    emitter: JobEmitter,
}

type JobTable = Arc<RwLock<HashMap<String, JobEntry>>>;

/// Drives jobs from submission to a terminal state.
pub struct Scheduler {
    config: EngineConfig,
    store: Arc<ConfigStore>,
    runtime: AgentRuntime,
    synthesizer: Arc<Synthesizer>,
    bus: Arc<StatusBus>,
    jobs: JobTable,
}

impl Scheduler {
    pub fn new(
        config: EngineConfig,
        store: Arc<ConfigStore>,
        runtime: AgentRuntime,
        synthesizer: Arc<Synthesizer>,
        bus: Arc<StatusBus>,
    ) -> Self {
        Self {
            config,
            store,
            runtime,
            synthesizer,
            bus,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Admit a job and spawn its driver task.
    ///
    /// Fails fast with `AtCapacity` when the number of admitted,
    /// non-terminal jobs is at the high-water mark, and propagates plan
    /// loading failures (unknown domain, broken playbook) verbatim.
    pub fn submit(
        &self,
        tenant: &TenantId,
        user: &UserId,
        class: AgentClass,
        domain_id: &str,
        input: JobInput,
    ) -> EngineResult<JobAccepted> {
        {
            let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
            let active = jobs
                .values()
                .filter(|entry| !entry.job.state.is_terminal())
                .count();
            if active >= self.config.queue_high_water {
                return Err(EngineError::AtCapacity(format!(
                    "{} jobs in flight, high-water mark is {}",
                    active, self.config.queue_high_water
                )));
            }
        }

        let plan = self.store.get_plan(tenant, domain_id, class)?;
        let job_id = Uuid::new_v4().to_string();
        let accepted_at = Utc::now();
        let emitter = self.bus.emitter(job_id.clone(), user.clone());
        let cancel = CancellationToken::new();

        let job = Job {
            job_id: job_id.clone(),
            tenant_id: tenant.clone(),
            user_id: user.clone(),
            class,
            domain_id: domain_id.to_string(),
            input,
            plan_snapshot: plan,
            state: JobState::Queued,
            created_at: accepted_at,
            started_at: None,
            finished_at: None,
            error: None,
            events_emitted: 0,
            invocations: Vec::new(),
            artifact: None,
        };

        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            jobs.insert(
                job_id.clone(),
                JobEntry {
                    job,
                    cancel: cancel.clone(),
                    emitter: emitter.clone(),
                },
            );
        }

        log::info!(
            "scheduler tenant={} job={} class={} domain={} admitted",
            tenant,
            job_id,
            class,
            domain_id
        );

        let driver = JobDriver {
            config: self.config.clone(),
            runtime: self.runtime.clone(),
            synthesizer: Arc::clone(&self.synthesizer),
            jobs: Arc::clone(&self.jobs),
            job_id: job_id.clone(),
            emitter,
            cancel,
        };
        tokio::spawn(async move { driver.run().await });

        Ok(JobAccepted {
            job_id,
            accepted_at,
        })
    }

    /// Current job record, including invocations and the artifact once
    /// terminal. Refuses cross-tenant reads.
    pub fn get_job(&self, tenant: &TenantId, job_id: &str) -> EngineResult<Job> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let entry = jobs.get(job_id).ok_or_else(|| {
            EngineError::BadReference(format!("job '{}' does not exist", job_id))
        })?;
        if entry.job.tenant_id != *tenant {
            return Err(EngineError::CrossTenant(format!(
                "job '{}' belongs to a different tenant",
                job_id
            )));
        }
        let mut job = entry.job.clone();
        job.events_emitted = entry.emitter.emitted();
        Ok(job)
    }

    /// Request cooperative cancellation. Idempotent: the first call trips
    /// the token, later calls (and calls on already-terminal jobs) return
    /// the current state without emitting anything.
    pub fn cancel(&self, tenant: &TenantId, job_id: &str) -> EngineResult<JobState> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let entry = jobs.get(job_id).ok_or_else(|| {
            EngineError::BadReference(format!("job '{}' does not exist", job_id))
        })?;
        if entry.job.tenant_id != *tenant {
            return Err(EngineError::CrossTenant(format!(
                "job '{}' belongs to a different tenant",
                job_id
            )));
        }
        if !entry.job.state.is_terminal() {
            entry.cancel.cancel();
        }
        Ok(entry.job.state)
    }
}

/// Owns one job from admission to its terminal state.
struct JobDriver {
    config: EngineConfig,
    runtime: AgentRuntime,
    synthesizer: Arc<Synthesizer>,
    jobs: JobTable,
    job_id: String,
    emitter: JobEmitter,
    cancel: CancellationToken,
}

impl JobDriver {
    async fn run(self) {
        let (tenant, class, input, plan) = match self.start() {
            Some(snapshot) => snapshot,
            None => return,
        };

        let execution = match ExecutionPlan::build(&plan) {
            Ok(execution) => execution,
            Err(error) => {
                self.finish_failed(error);
                return;
            }
        };

        self.emitter.emit(
            EventKind::PlanLoaded,
            None,
            None,
            format!(
                "plan loaded: {} levels, {} agents",
                execution.levels.len(),
                execution.agent_count()
            ),
        );

        let job_deadline = Instant::now() + self.config.job_budget;
        let raw_input = input.raw_text().to_string();
        let mut outputs: HashMap<String, AgentOutput> = HashMap::new();

        for (level_index, level) in execution.levels.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.finish_cancelled();
                return;
            }

            // Fan out the level, then join it. The barrier is what lets
            // children trust their parent's output.
            let mut handles = Vec::with_capacity(level.agents.len());
            for scheduled in &level.agents {
                let deadline =
                    (Instant::now() + self.config.per_agent_budget).min(job_deadline);
                let parent_output = scheduled
                    .parent_id
                    .as_ref()
                    .and_then(|parent| outputs.get(parent))
                    .cloned();
                let request = InvocationRequest {
                    tenant_id: tenant.clone(),
                    job_id: self.job_id.clone(),
                    agent: scheduled.clone(),
                    level: level_index,
                    raw_input: raw_input.clone(),
                    parent_output,
                    deadline,
                    cancel: self.cancel.clone(),
                    emitter: self.emitter.clone(),
                };
                let runtime = self.runtime.clone();
                let agent_id = scheduled.agent_id.clone();
                handles.push((
                    agent_id,
                    tokio::spawn(async move { runtime.run(request).await }),
                ));
            }

            let mut level_invocations = Vec::with_capacity(handles.len());
            for (agent_id, handle) in handles {
                let invocation = match handle.await {
                    Ok(invocation) => invocation,
                    Err(join_error) => {
                        // A panicked agent task is an agent-local failure,
                        // not a job-fatal one.
                        let mut invocation = AgentInvocation::pending(
                            self.job_id.clone(),
                            agent_id.clone(),
                            level_index,
                        );
                        invocation.status = InvocationStatus::Error;
                        invocation.finished_at = Some(Utc::now());
                        invocation.error = Some(
                            EngineError::Internal(format!(
                                "agent task failed: {}",
                                join_error
                            ))
                            .to_envelope(),
                        );
                        invocation
                    }
                };
                if invocation.status == InvocationStatus::Ok {
                    outputs.insert(invocation.agent_id.clone(), invocation.output.clone());
                }
                level_invocations.push(invocation);
            }
            self.record_invocations(level_invocations);
        }

        if self.cancel.is_cancelled() {
            self.finish_cancelled();
            return;
        }

        let invocations = self.current_invocations();
        let any_ok = invocations
            .iter()
            .any(|inv| inv.status == InvocationStatus::Ok);
        if !any_ok {
            self.finish_failed(EngineError::NoViableAgents(format!(
                "all {} agents of job '{}' failed",
                invocations.len(),
                self.job_id
            )));
            return;
        }

        self.emitter.emit(
            EventKind::Validating,
            None,
            None,
            "validating agent outputs".to_string(),
        );
        if let Err(error) = validate_invocations(&self.job_id, &invocations) {
            self.finish_failed(error);
            return;
        }

        self.emitter.emit(
            EventKind::Synthesizing,
            None,
            None,
            "synthesizing result".to_string(),
        );
        let synthesis_ctx = SynthesisContext {
            tenant_id: tenant.clone(),
            job_id: self.job_id.clone(),
            deadline: job_deadline,
            cancel: self.cancel.clone(),
            emitter: self.emitter.clone(),
        };
        let artifact = match class {
            AgentClass::Query => {
                self.synthesizer
                    .synthesize_query(&synthesis_ctx, &input, &plan, &invocations)
                    .await
            }
            // Ingest and management jobs both produce a merged record.
            AgentClass::Ingest | AgentClass::Management => self
                .synthesizer
                .synthesize_ingest(&synthesis_ctx, &input, &invocations),
        };

        match artifact {
            Ok(artifact) if !artifact.is_empty() => self.finish_succeeded(artifact),
            Ok(_) => self.finish_failed(EngineError::SynthesisRefused(format!(
                "job '{}' synthesized an empty artifact",
                self.job_id
            ))),
            Err(error) if matches!(error, EngineError::Cancelled(_)) => {
                self.finish_cancelled();
            }
            Err(error) => self.finish_failed(error),
        }
    }

    /// Move queued → running and snapshot what the driver needs. Returns
    /// `None` when the job was cancelled before it started.
    fn start(&self) -> Option<(TenantId, AgentClass, JobInput, Plan)> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let entry = jobs.get_mut(&self.job_id)?;
        if self.cancel.is_cancelled() {
            if entry.job.state.can_transition_to(JobState::Cancelled) {
                entry.job.state = JobState::Cancelled;
                entry.job.finished_at = Some(Utc::now());
                self.emitter
                    .emit(EventKind::Cancelled, None, None, "job cancelled".to_string());
                entry.job.events_emitted = self.emitter.emitted();
            }
            return None;
        }
        entry.job.state = JobState::Running;
        entry.job.started_at = Some(Utc::now());
        Some((
            entry.job.tenant_id.clone(),
            entry.job.class,
            entry.job.input.clone(),
            entry.job.plan_snapshot.clone(),
        ))
    }

    fn record_invocations(&self, invocations: Vec<AgentInvocation>) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = jobs.get_mut(&self.job_id) {
            entry.job.invocations.extend(invocations);
        }
    }

    fn current_invocations(&self) -> Vec<AgentInvocation> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(&self.job_id)
            .map(|entry| entry.job.invocations.clone())
            .unwrap_or_default()
    }

    fn finish_succeeded(&self, artifact: ResultArtifact) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = jobs.get_mut(&self.job_id) {
            if !entry.job.state.can_transition_to(JobState::Succeeded) {
                return;
            }
            entry.job.state = JobState::Succeeded;
            entry.job.finished_at = Some(Utc::now());
            entry.job.artifact = Some(artifact);
            self.emitter
                .emit(EventKind::Complete, None, None, "job complete".to_string());
            entry.job.events_emitted = self.emitter.emitted();
            log::info!("scheduler job={} succeeded", self.job_id);
        }
    }

    fn finish_failed(&self, error: EngineError) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = jobs.get_mut(&self.job_id) {
            if !entry.job.state.can_transition_to(JobState::Failed) {
                return;
            }
            entry.job.state = JobState::Failed;
            entry.job.finished_at = Some(Utc::now());
            entry.job.error = Some(error.to_envelope());
            self.emitter.emit(
                EventKind::Failed,
                None,
                None,
                format!("job failed: {}", error.message()),
            );
            entry.job.events_emitted = self.emitter.emitted();
            log::warn!(
                "scheduler job={} failed cause={}",
                self.job_id,
                error.code()
            );
        }
    }

    fn finish_cancelled(&self) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = jobs.get_mut(&self.job_id) {
            if !entry.job.state.can_transition_to(JobState::Cancelled) {
                return;
            }
            entry.job.state = JobState::Cancelled;
            entry.job.finished_at = Some(Utc::now());
            self.emitter
                .emit(EventKind::Cancelled, None, None, "job cancelled".to_string());
            entry.job.events_emitted = self.emitter.emitted();
            log::info!("scheduler job={} cancelled", self.job_id);
        }
    }
}
