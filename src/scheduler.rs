/// Flow scheduling state machine.
///
/// The scheduler decides when flows are due and guarantees at most one
/// running cycle per (agent, flow). It does not run anything itself; the
/// agent manager asks it for due flows on every tick and reports back.
use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::config::FlowDefinition;
use crate::error::ManagerError;
use crate::schedule::ScheduleSpec;
use crate::telemetry::{
    CYCLE_COMPLETED, CYCLE_FAILED, CYCLE_OVERLAP_SKIPPED, CYCLE_STARTED, TelemetrySink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Idle,
    Due,
    Running,
    Cooldown,
    Disabled,
}

impl FlowState {
    pub fn label(self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::Due => "due",
            FlowState::Running => "running",
            FlowState::Cooldown => "cooldown",
            FlowState::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Schedule,
    Manual,
}

impl Trigger {
    pub fn label(self) -> &'static str {
        match self {
            Trigger::Schedule => "schedule",
            Trigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    OverlapSkipped,
}

impl RunOutcome {
    pub fn label(self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::OverlapSkipped => "overlap_skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub summary: String,
}

/// Proof that a cycle was granted; handed back on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTicket {
    pub agent: String,
    pub flow: String,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct FlowSlot {
    schedule: ScheduleSpec,
    disabled: bool,
    registered_at: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
    cooling: bool,
    overlap_skips: u64,
    last_error: Option<String>,
    history: VecDeque<RunRecord>,
}

impl FlowSlot {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.disabled && self.schedule.is_due(now, self.registered_at, self.last_fired)
    }

    fn state(&self, now: DateTime<Utc>, running: bool) -> FlowState {
        if running {
            FlowState::Running
        } else if self.disabled {
            FlowState::Disabled
        } else if self.cooling {
            FlowState::Cooldown
        } else if self.is_due(now) {
            FlowState::Due
        } else {
            FlowState::Idle
        }
    }

    fn next_fire(&self) -> Option<DateTime<Utc>> {
        if self.disabled {
            return None;
        }
        self.schedule.next_due(self.registered_at, self.last_fired)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowStatus {
    pub agent: String,
    pub flow: String,
    pub state: FlowState,
    pub schedule: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_outcome: Option<RunOutcome>,
    pub overlap_skips: u64,
    pub last_error: Option<String>,
    pub history: Vec<RunRecord>,
}

type FlowKey = (String, String);

fn flow_key(agent: &str, flow: &str) -> FlowKey {
    (agent.to_string(), flow.to_string())
}

/// In-flight cycles are tracked apart from the slots so that unregistering
/// and re-registering an agent keeps overlap prevention intact.
#[derive(Debug)]
pub struct Scheduler {
    slots: BTreeMap<FlowKey, FlowSlot>,
    running: BTreeMap<FlowKey, RunTicket>,
    history_limit: usize,
    telemetry: TelemetrySink,
}

impl Scheduler {
    pub fn new(history_limit: usize, telemetry: TelemetrySink) -> Self {
        Self {
            slots: BTreeMap::new(),
            running: BTreeMap::new(),
            history_limit: history_limit.max(1),
            telemetry,
        }
    }

    /// Registers or re-registers a flow. Re-registration keeps run history.
    ///
    /// `last_run` is this flow's last cycle start from the agent checkpoint;
    /// it seeds interval timing so a restart does not fire the flow early.
    pub fn register(
        &mut self,
        agent: &str,
        flow: &FlowDefinition,
        now: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
    ) {
        let key = flow_key(agent, &flow.name);
        let last_fired = match flow.schedule {
            ScheduleSpec::Interval(_) => last_run,
            _ => None,
        };
        let (history, overlap_skips) = match self.slots.remove(&key) {
            Some(slot) => (slot.history, slot.overlap_skips),
            None => (VecDeque::new(), 0),
        };
        tracing::info!(agent, flow = %flow.name, schedule = %flow.schedule, "flow registered");
        self.slots.insert(
            key,
            FlowSlot {
                schedule: flow.schedule.clone(),
                disabled: !flow.is_schedulable(),
                registered_at: now,
                last_fired,
                cooling: false,
                overlap_skips,
                last_error: None,
                history,
            },
        );
    }

    pub fn unregister_agent(&mut self, agent: &str) -> usize {
        let before = self.slots.len();
        self.slots.retain(|(slot_agent, _), _| slot_agent != agent);
        before - self.slots.len()
    }

    pub fn is_registered(&self, agent: &str, flow: &str) -> bool {
        self.slots.contains_key(&flow_key(agent, flow))
    }

    pub fn agent_running(&self, agent: &str) -> bool {
        self.running.keys().any(|(running_agent, _)| running_agent == agent)
    }

    /// Evaluates every registered flow and grants a run to each due one.
    ///
    /// A flow that is due while its previous cycle still runs is skipped;
    /// the skipped occurrence is consumed so it is recorded once.
    pub fn begin_due(&mut self, now: DateTime<Utc>) -> Vec<RunTicket> {
        let mut granted = Vec::new();
        let mut skipped = Vec::new();
        for (key, slot) in self.slots.iter_mut() {
            slot.cooling = false;
            if !slot.is_due(now) {
                continue;
            }
            slot.last_fired = Some(now);
            if self.running.contains_key(key) {
                skipped.push(key.clone());
                continue;
            }
            let ticket = RunTicket {
                agent: key.0.clone(),
                flow: key.1.clone(),
                trigger: Trigger::Schedule,
                started_at: now,
            };
            self.running.insert(key.clone(), ticket.clone());
            granted.push(ticket);
        }
        for (agent, flow) in skipped {
            self.record_overlap(&agent, &flow, Trigger::Schedule, now);
        }
        for ticket in &granted {
            self.emit_started(ticket);
        }
        granted
    }

    /// Grants a run outside the schedule. Overlap prevention still applies.
    pub fn try_begin(
        &mut self,
        agent: &str,
        flow: &str,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<RunTicket, ManagerError> {
        let key = flow_key(agent, flow);
        if !self.slots.contains_key(&key) {
            return Err(ManagerError::UnknownFlow {
                agent: agent.to_string(),
                flow: flow.to_string(),
            });
        }
        if self.running.contains_key(&key) {
            self.record_overlap(agent, flow, trigger, now);
            return Err(ManagerError::Overlap {
                agent: agent.to_string(),
                flow: flow.to_string(),
            });
        }
        let ticket = RunTicket {
            agent: agent.to_string(),
            flow: flow.to_string(),
            trigger,
            started_at: now,
        };
        self.running.insert(key, ticket.clone());
        self.emit_started(&ticket);
        Ok(ticket)
    }

    pub fn finish(
        &mut self,
        ticket: &RunTicket,
        outcome: RunOutcome,
        summary: String,
        now: DateTime<Utc>,
    ) {
        let key = flow_key(&ticket.agent, &ticket.flow);
        if self.running.get(&key) != Some(ticket) {
            return;
        }
        self.running.remove(&key);
        let event = match outcome {
            RunOutcome::Failed => CYCLE_FAILED,
            _ => CYCLE_COMPLETED,
        };
        self.telemetry.emit(
            event,
            &ticket.agent,
            &ticket.flow,
            json!({
                "trigger": ticket.trigger.label(),
                "duration_ms": (now - ticket.started_at).num_milliseconds(),
                "summary": summary,
            }),
        );

        let history_limit = self.history_limit;
        let Some(slot) = self.slots.get_mut(&key) else {
            tracing::debug!(agent = %ticket.agent, flow = %ticket.flow, "finished flow is no longer registered");
            return;
        };
        slot.cooling = true;
        slot.last_error = match outcome {
            RunOutcome::Failed => Some(summary.clone()),
            _ => None,
        };
        if matches!(slot.schedule, ScheduleSpec::Once(_)) && ticket.trigger == Trigger::Schedule {
            slot.disabled = true;
        }
        push_bounded(
            &mut slot.history,
            history_limit,
            RunRecord {
                trigger: ticket.trigger,
                started_at: ticket.started_at,
                finished_at: Some(now),
                outcome,
                summary,
            },
        );
    }

    pub fn status(&self, now: DateTime<Utc>) -> Vec<FlowStatus> {
        self.slots
            .iter()
            .map(|(key, slot)| FlowStatus {
                agent: key.0.clone(),
                flow: key.1.clone(),
                state: slot.state(now, self.running.contains_key(key)),
                schedule: slot.schedule.to_string(),
                next_fire: slot.next_fire(),
                last_outcome: slot.history.back().map(|record| record.outcome),
                overlap_skips: slot.overlap_skips,
                last_error: slot.last_error.clone(),
                history: slot.history.iter().cloned().collect(),
            })
            .collect()
    }

    pub fn flow_state(&self, agent: &str, flow: &str, now: DateTime<Utc>) -> Option<FlowState> {
        let key = flow_key(agent, flow);
        self.slots
            .get(&key)
            .map(|slot| slot.state(now, self.running.contains_key(&key)))
    }

    fn record_overlap(&mut self, agent: &str, flow: &str, trigger: Trigger, now: DateTime<Utc>) {
        let history_limit = self.history_limit;
        if let Some(slot) = self.slots.get_mut(&flow_key(agent, flow)) {
            slot.overlap_skips += 1;
            push_bounded(
                &mut slot.history,
                history_limit,
                RunRecord {
                    trigger,
                    started_at: now,
                    finished_at: Some(now),
                    outcome: RunOutcome::OverlapSkipped,
                    summary: "previous cycle still running".to_string(),
                },
            );
        }
        tracing::info!(agent, flow, trigger = trigger.label(), "overlapping trigger skipped");
        self.telemetry.emit(
            CYCLE_OVERLAP_SKIPPED,
            agent,
            flow,
            json!({ "trigger": trigger.label() }),
        );
    }

    fn emit_started(&self, ticket: &RunTicket) {
        tracing::info!(
            agent = %ticket.agent,
            flow = %ticket.flow,
            trigger = ticket.trigger.label(),
            "cycle started"
        );
        self.telemetry.emit(
            CYCLE_STARTED,
            &ticket.agent,
            &ticket.flow,
            json!({ "trigger": ticket.trigger.label() }),
        );
    }
}

fn push_bounded(history: &mut VecDeque<RunRecord>, limit: usize, record: RunRecord) {
    history.push_back(record);
    while history.len() > limit {
        history.pop_front();
    }
}
