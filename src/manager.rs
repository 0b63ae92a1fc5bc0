//! Agent manager: owns configured agents and coordinates the scheduler,
//! the pipeline executor and the checkpoint store.
//!
//! Starting and resuming share one registration path: load the agent
//! checkpoint, resolve its flows, register them with the scheduler.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::checkpoint::{Checkpoint, CheckpointStore, StageStatus};
use crate::config::{AgentConfig, AgentDefinition};
use crate::error::{CycleError, ManagerError};
use crate::pipeline::{CycleReport, PipelineExecutor, ResolvedFlow};
use crate::plugins::PluginRegistry;
use crate::scheduler::{FlowStatus, RunOutcome, RunTicket, Scheduler, Trigger};
use crate::telemetry::TelemetrySink;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointStatus {
    pub cycle_count: u64,
    pub pending_gaps: usize,
    pub completed_gaps: usize,
    pub artifacts: usize,
    pub last_run_timestamp: Option<DateTime<Utc>>,
    /// Stages whose last recorded outcome was a failure.
    pub failed_stages: Vec<String>,
}

impl CheckpointStatus {
    fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            cycle_count: checkpoint.cycle_count,
            pending_gaps: checkpoint.pending_gaps.len(),
            completed_gaps: checkpoint.completed_gaps.len(),
            artifacts: checkpoint.artifacts.len(),
            last_run_timestamp: checkpoint.last_run_timestamp,
            failed_stages: checkpoint
                .stage_results
                .iter()
                .filter(|(_, result)| result.status == StageStatus::Failed)
                .map(|(stage, _)| stage.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowIssue {
    pub flow: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub enabled: bool,
    pub registered: bool,
    pub checkpoint: CheckpointStatus,
    pub flows: Vec<FlowStatus>,
    /// Flows that failed plugin resolution and are not scheduled.
    pub unresolved: Vec<FlowIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub started: bool,
    pub generated_at: DateTime<Utc>,
    pub agents: Vec<AgentStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Registration {
    pub agent: String,
    pub flows: Vec<String>,
    pub unresolved: Vec<FlowIssue>,
}

#[derive(Debug)]
pub enum RunOnce {
    /// Cycle spawned in the background.
    Started,
    Completed(CycleReport),
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Inner {
    config: AgentConfig,
    registry: PluginRegistry,
    executor: PipelineExecutor,
    scheduler: Mutex<Scheduler>,
    flows: Mutex<HashMap<(String, String), Arc<ResolvedFlow>>>,
    unresolved: Mutex<BTreeMap<String, Vec<FlowIssue>>>,
    stops: Mutex<HashMap<String, Arc<AtomicBool>>>,
    cycles: Mutex<JoinSet<()>>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Cheap to clone; clones share the same agents.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("agents", &self.inner.config.agents.len())
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl AgentManager {
    pub fn new(config: AgentConfig, registry: PluginRegistry) -> Self {
        let telemetry = TelemetrySink::new(&config.core);
        let store = Arc::new(CheckpointStore::new(config.core.checkpoint_dir.clone()));
        Self::with_parts(config, registry, store, telemetry)
    }

    pub fn with_parts(
        config: AgentConfig,
        registry: PluginRegistry,
        store: Arc<CheckpointStore>,
        telemetry: TelemetrySink,
    ) -> Self {
        let scheduler = Scheduler::new(config.core.history_limit, telemetry.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                executor: PipelineExecutor::new(store, telemetry),
                scheduler: Mutex::new(scheduler),
                flows: Mutex::new(HashMap::new()),
                unresolved: Mutex::new(BTreeMap::new()),
                stops: Mutex::new(HashMap::new()),
                cycles: Mutex::new(JoinSet::new()),
                started: AtomicBool::new(false),
                shutdown,
                config,
                registry,
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        self.inner.executor.store()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    fn agent(&self, name: &str) -> Result<&AgentDefinition, ManagerError> {
        self.inner
            .config
            .agent(name)
            .ok_or_else(|| ManagerError::UnknownAgent(name.to_string()))
    }

    /// Registers every enabled agent and starts the tick loop.
    ///
    /// A second call fails with [`ManagerError::AlreadyStarted`] and leaves
    /// the existing registrations alone.
    pub fn start(&self) -> Result<Vec<Registration>, ManagerError> {
        self.start_agents(&[])
    }

    /// Like [`AgentManager::start`], limited to the named agents when any
    /// are given. Named agents run even when disabled in configuration.
    pub fn start_agents(&self, names: &[String]) -> Result<Vec<Registration>, ManagerError> {
        for name in names {
            self.agent(name)?;
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        let selected = |agent: &&AgentDefinition| {
            if names.is_empty() {
                agent.enabled
            } else {
                names.contains(&agent.name)
            }
        };
        let mut registrations = Vec::new();
        for agent in self.inner.config.agents.iter().filter(selected) {
            registrations.push(self.register_agent(agent));
        }
        tracing::info!(
            agents = registrations.len(),
            tick_ms = self.inner.config.core.tick_interval_ms,
            "agent manager started"
        );

        let manager = self.clone();
        let shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move { manager.tick_loop(shutdown).await });
        Ok(registrations)
    }

    /// Re-registers an agent from its stored checkpoint.
    pub fn resume(&self, agent: &str) -> Result<Registration, ManagerError> {
        let definition = self.agent(agent)?;
        Ok(self.register_agent(definition))
    }

    /// Unregisters an agent. In-flight cycles finish their current gaps.
    pub fn stop(&self, agent: &str) -> Result<usize, ManagerError> {
        self.agent(agent)?;
        self.stop_flag(agent).store(true, Ordering::SeqCst);
        let removed = locked(&self.inner.scheduler).unregister_agent(agent);
        locked(&self.inner.flows).retain(|(flow_agent, _), _| flow_agent != agent);
        tracing::info!(agent, flows = removed, "agent stopped");
        Ok(removed)
    }

    /// Deletes an agent checkpoint. Refused while a cycle is in flight.
    pub fn reset(&self, agent: &str) -> Result<(), ManagerError> {
        self.agent(agent)?;
        if locked(&self.inner.scheduler).agent_running(agent) {
            return Err(ManagerError::Busy(agent.to_string()));
        }
        self.store().reset(agent)?;
        tracing::info!(agent, "checkpoint reset");
        Ok(())
    }

    pub fn status(&self) -> StatusSnapshot {
        let now = Utc::now();
        let flows = locked(&self.inner.scheduler).status(now);
        let unresolved = locked(&self.inner.unresolved).clone();
        let agents = self
            .inner
            .config
            .agents
            .iter()
            .map(|agent| {
                let agent_flows = flows
                    .iter()
                    .filter(|flow| flow.agent == agent.name)
                    .cloned()
                    .collect::<Vec<FlowStatus>>();
                AgentStatus {
                    name: agent.name.clone(),
                    enabled: agent.enabled,
                    registered: !agent_flows.is_empty(),
                    checkpoint: CheckpointStatus::from_checkpoint(
                        &self.store().load(&agent.name),
                    ),
                    flows: agent_flows,
                    unresolved: unresolved.get(&agent.name).cloned().unwrap_or_default(),
                }
            })
            .collect();
        StatusSnapshot {
            started: self.is_started(),
            generated_at: now,
            agents,
        }
    }

    /// Runs a flow outside its schedule, still honoring overlap prevention.
    ///
    /// A flow that is not registered is resolved and registered as a manual
    /// slot so later triggers see it as running.
    pub async fn run_once(
        &self,
        agent: &str,
        flow: &str,
        wait: bool,
    ) -> Result<RunOnce, ManagerError> {
        let definition = self.agent(agent)?;
        let flow_definition = definition
            .flow(flow)
            .ok_or_else(|| ManagerError::UnknownFlow {
                agent: agent.to_string(),
                flow: flow.to_string(),
            })?;

        let key = (agent.to_string(), flow.to_string());
        let existing = locked(&self.inner.flows).get(&key).cloned();
        if existing.is_none() {
            let resolved = ResolvedFlow::resolve(agent, flow_definition, &self.inner.registry)
                .map_err(|source| ManagerError::Resolution {
                    agent: agent.to_string(),
                    flow: flow.to_string(),
                    source,
                })?;
            locked(&self.inner.flows).insert(key.clone(), Arc::new(resolved));
            let mut manual = flow_definition.clone();
            manual.enabled = false;
            let mut scheduler = locked(&self.inner.scheduler);
            if !scheduler.is_registered(agent, flow) {
                scheduler.register(agent, &manual, Utc::now(), None);
            }
        }
        self.stop_flag(agent).store(false, Ordering::SeqCst);

        let ticket = locked(&self.inner.scheduler).try_begin(agent, flow, Trigger::Manual, Utc::now())?;
        if wait {
            let report = self.execute(ticket).await?;
            Ok(RunOnce::Completed(report))
        } else {
            self.spawn_cycle(ticket);
            Ok(RunOnce::Started)
        }
    }

    /// Grants and spawns every due flow. Returns how many cycles started.
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        self.reap_finished();
        let tickets = locked(&self.inner.scheduler).begin_due(now);
        let started = tickets.len();
        for ticket in tickets {
            self.spawn_cycle(ticket);
        }
        started
    }

    /// Stops the tick loop and waits for in-flight cycles to reach a gap
    /// boundary.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        for flag in locked(&self.inner.stops).values() {
            flag.store(true, Ordering::SeqCst);
        }
        self.wait_idle().await;
        tracing::info!("agent manager shut down");
    }

    /// Waits for every spawned cycle to finish.
    pub async fn wait_idle(&self) {
        loop {
            let mut cycles = std::mem::take(&mut *locked(&self.inner.cycles));
            if cycles.is_empty() {
                return;
            }
            while let Some(joined) = cycles.join_next().await {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "cycle task ended abnormally");
                }
            }
        }
    }

    /// Spawned cycles not yet reaped, finished or not.
    pub fn in_flight(&self) -> usize {
        locked(&self.inner.cycles).len()
    }

    fn reap_finished(&self) {
        let mut cycles = locked(&self.inner.cycles);
        while let Some(joined) = cycles.try_join_next() {
            if let Err(err) = joined {
                tracing::error!(error = %err, "cycle task ended abnormally");
            }
        }
    }

    fn stop_flag(&self, agent: &str) -> Arc<AtomicBool> {
        locked(&self.inner.stops)
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn register_agent(&self, agent: &AgentDefinition) -> Registration {
        let checkpoint = self.store().load(&agent.name);
        let now = Utc::now();
        self.stop_flag(&agent.name).store(false, Ordering::SeqCst);

        let mut registration = Registration {
            agent: agent.name.clone(),
            ..Registration::default()
        };
        for flow in &agent.flows {
            match ResolvedFlow::resolve(&agent.name, flow, &self.inner.registry) {
                Ok(resolved) => {
                    locked(&self.inner.flows)
                        .insert((agent.name.clone(), flow.name.clone()), Arc::new(resolved));
                    locked(&self.inner.scheduler).register(
                        &agent.name,
                        flow,
                        now,
                        checkpoint.last_run_of(&flow.name),
                    );
                    registration.flows.push(flow.name.clone());
                }
                Err(err) => {
                    tracing::error!(
                        agent = %agent.name,
                        flow = %flow.name,
                        error = %err,
                        "flow not registered"
                    );
                    registration.unresolved.push(FlowIssue {
                        flow: flow.name.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        locked(&self.inner.unresolved)
            .insert(agent.name.clone(), registration.unresolved.clone());
        tracing::info!(
            agent = %agent.name,
            flows = registration.flows.len(),
            cycle_count = checkpoint.cycle_count,
            pending = checkpoint.pending_gaps.len(),
            "agent registered"
        );
        registration
    }

    async fn tick_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.inner.config.core.tick_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("tick loop exited");
    }

    fn spawn_cycle(&self, ticket: RunTicket) {
        let manager = self.clone();
        locked(&self.inner.cycles).spawn(async move {
            // failures are already recorded on the flow slot
            let _ = manager.execute(ticket).await;
        });
    }

    async fn execute(&self, ticket: RunTicket) -> Result<CycleReport, CycleError> {
        let key = (ticket.agent.clone(), ticket.flow.clone());
        let flow = locked(&self.inner.flows).get(&key).cloned();
        let Some(flow) = flow else {
            let message = format!("flow '{}' is no longer registered", ticket.flow);
            locked(&self.inner.scheduler).finish(&ticket, RunOutcome::Failed, message, Utc::now());
            return Ok(CycleReport::default());
        };
        let stop = self.stop_flag(&ticket.agent);

        let result = self.inner.executor.run_cycle(&flow, &stop).await;
        let (outcome, summary) = match &result {
            Ok(report) if report.failed.is_empty() => (RunOutcome::Succeeded, report.summary()),
            Ok(report) => (RunOutcome::Failed, report.summary()),
            Err(err) => {
                tracing::error!(
                    agent = %ticket.agent,
                    flow = %ticket.flow,
                    error = %err,
                    "cycle failed"
                );
                (RunOutcome::Failed, err.to_string())
            }
        };
        locked(&self.inner.scheduler).finish(&ticket, outcome, summary, Utc::now());
        result
    }
}

fn format_time(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|time| time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_status(snapshot: &StatusSnapshot) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Manager: {} at {}\n",
        if snapshot.started { "started" } else { "idle" },
        format_time(Some(snapshot.generated_at))
    ));
    for agent in &snapshot.agents {
        let checkpoint = &agent.checkpoint;
        out.push_str(&format!(
            "\nAgent '{}' enabled={} registered={}\n",
            agent.name, agent.enabled, agent.registered
        ));
        out.push_str(&format!(
            "  cycles={} pending={} completed={} artifacts={} last_run={}\n",
            checkpoint.cycle_count,
            checkpoint.pending_gaps,
            checkpoint.completed_gaps,
            checkpoint.artifacts,
            format_time(checkpoint.last_run_timestamp)
        ));
        if !checkpoint.failed_stages.is_empty() {
            out.push_str(&format!(
                "  failed stages: {}\n",
                checkpoint.failed_stages.join(", ")
            ));
        }
        for flow in &agent.flows {
            out.push_str(&format!(
                "  flow '{}' [{}] state={} next={} last={} overlap_skips={}\n",
                flow.flow,
                flow.schedule,
                flow.state.label(),
                format_time(flow.next_fire),
                flow.last_outcome.map(RunOutcome::label).unwrap_or("-"),
                flow.overlap_skips
            ));
            if let Some(error) = &flow.last_error {
                out.push_str(&format!("    last error: {error}\n"));
            }
        }
        for issue in &agent.unresolved {
            out.push_str(&format!("  flow '{}' unresolved: {}\n", issue.flow, issue.error));
        }
    }
    out
}
