use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use chrono::Utc;
use tokio::sync::Notify;

use crate::checkpoint::{CheckpointStore, StageStatus};
use crate::config::{
    AgentConfig, AgentDefinition, CoreSettings, FlowDefinition, LlmSettings, PipelineSettings,
    PluginRef, StageDefinition, TaskKind,
};
use crate::error::{ManagerError, StageError};
use crate::gaps::{GapStatus, IdentifiedGap, KnowledgeGap};
use crate::manager::{AgentManager, RunOnce};
use crate::pipeline::{PipelineExecutor, ResolvedFlow};
use crate::plugins::writer::MarkdownWriter;
use crate::plugins::{
    DocumentWriter, GapIdentifier, GapRequest, LlmPlugin, LlmPrompt, PluginParams,
    PluginRegistry, SearchPlugin, SearchResult,
};
use crate::schedule::ScheduleSpec;
use crate::scheduler::RunOutcome;
use crate::telemetry::TelemetrySink;
use tempfile::tempdir;

const SUBJECTS: [&str; 5] = [
    "transport negotiation",
    "resource subscriptions",
    "sampling requests",
    "tool schemas",
    "prompt templates",
];

// ---------------------------------------------------------------------------
// Fake plugins
// ---------------------------------------------------------------------------

struct ScriptedGaps {
    subjects: Vec<String>,
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl GapIdentifier for ScriptedGaps {
    async fn identify(&self, request: &GapRequest) -> Result<Vec<IdentifiedGap>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .subjects
            .iter()
            .take(request.max_gaps)
            .map(IdentifiedGap::new)
            .collect())
    }
}

/// Fails transiently until its failure budget is spent.
struct FlakySearch {
    failures_left: Arc<AtomicU32>,
    calls: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl SearchPlugin for FlakySearch {
    async fn search(
        &self,
        query: &str,
        _max_results: usize,
    ) -> Result<Vec<SearchResult>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StageError::transient("search backend returned 503"));
        }
        Ok(vec![SearchResult {
            title: format!("Notes on {query}"),
            url: format!("https://docs.example.org/{}", query.replace(' ', "-")),
            snippet: format!("{query} explained"),
        }])
    }
}

/// Rejects any query about a broken subject.
struct PickySearch;

#[async_trait::async_trait]
impl SearchPlugin for PickySearch {
    async fn search(
        &self,
        query: &str,
        _max_results: usize,
    ) -> Result<Vec<SearchResult>, StageError> {
        if query.starts_with("broken") {
            return Err(StageError::permanent("search backend rejected the query"));
        }
        Ok(vec![SearchResult {
            title: format!("Notes on {query}"),
            url: format!("https://docs.example.org/{}", query.replace(' ', "-")),
            snippet: format!("{query} explained"),
        }])
    }
}

struct TwoTermsLlm;

#[async_trait::async_trait]
impl LlmPlugin for TwoTermsLlm {
    async fn generate(&self, _prompt: &LlmPrompt) -> Result<String, StageError> {
        Ok("1. transport framing\n2. broken handshake".to_string())
    }
}

/// Holds every compile call until the gate opens.
struct GatedLlm {
    gate: Arc<Notify>,
}

#[async_trait::async_trait]
impl LlmPlugin for GatedLlm {
    async fn generate(&self, _prompt: &LlmPrompt) -> Result<String, StageError> {
        self.gate.notified().await;
        Ok("# Gated entry\n\nReleased.".to_string())
    }
}

struct SilentLlm;

#[async_trait::async_trait]
impl LlmPlugin for SilentLlm {
    async fn generate(&self, _prompt: &LlmPrompt) -> Result<String, StageError> {
        Ok("   ".to_string())
    }
}

#[derive(Default)]
struct Handles {
    identify_calls: Arc<AtomicUsize>,
    search_calls: Arc<AtomicU32>,
    search_failures: Arc<AtomicU32>,
    gate: Arc<Notify>,
}

fn registry(handles: &Handles, subjects: &[&str]) -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins().expect("builtins should register");

    let subjects = subjects.iter().map(|s| s.to_string()).collect::<Vec<String>>();
    let calls = handles.identify_calls.clone();
    registry
        .register_gap_identifier("scripted", move |_| {
            Ok(Arc::new(ScriptedGaps {
                subjects: subjects.clone(),
                calls: calls.clone(),
            }) as Arc<dyn GapIdentifier>)
        })
        .expect("scripted identifier should register");

    let failures_left = handles.search_failures.clone();
    let search_calls = handles.search_calls.clone();
    registry
        .register_search("flaky", move |_| {
            Ok(Arc::new(FlakySearch {
                failures_left: failures_left.clone(),
                calls: search_calls.clone(),
            }) as Arc<dyn SearchPlugin>)
        })
        .expect("flaky search should register");

    let gate = handles.gate.clone();
    registry
        .register_llm("gated", move |_| {
            Ok(Arc::new(GatedLlm { gate: gate.clone() }) as Arc<dyn LlmPlugin>)
        })
        .expect("gated llm should register");
    registry
        .register_llm("silent", |_| Ok(Arc::new(SilentLlm) as Arc<dyn LlmPlugin>))
        .expect("silent llm should register");
    registry
        .register_llm("two-terms", |_| Ok(Arc::new(TwoTermsLlm) as Arc<dyn LlmPlugin>))
        .expect("two-terms llm should register");
    registry
        .register_search("picky", |_| Ok(Arc::new(PickySearch) as Arc<dyn SearchPlugin>))
        .expect("picky search should register");
    registry
}

fn stage(name: &str, kind: TaskKind, plugin: &str, retries: u32) -> StageDefinition {
    StageDefinition {
        name: name.to_string(),
        kind,
        plugin: PluginRef {
            name: plugin.to_string(),
            params: PluginParams::new(),
        },
        retries,
        timeout_secs: 5,
    }
}

fn flow(knowledge_dir: &Path, compile_plugin: &str, search_retries: u32) -> FlowDefinition {
    let mut write = stage("write", TaskKind::WriteKnowledge, "markdown", 0);
    write.plugin.params = PluginParams::new().with("dir", knowledge_dir.display().to_string());
    FlowDefinition {
        name: "research".to_string(),
        schedule: ScheduleSpec::Interval(3600),
        enabled: true,
        stages: vec![
            stage("identify", TaskKind::IdentifyGaps, "scripted", 0),
            stage("search", TaskKind::WebSearch, "flaky", search_retries),
            stage("compile", TaskKind::CompileKnowledge, compile_plugin, 0),
            write,
        ],
        settings: PipelineSettings {
            max_gaps: 5,
            max_gaps_to_process: 3,
            retry_delay_ms: 1,
            ..PipelineSettings::default()
        },
        prompt: Some("Find gaps in MCP server knowledge".to_string()),
        llm: PluginRef {
            name: "template".to_string(),
            params: PluginParams::new(),
        },
    }
}

fn executor(root: &Path) -> (Arc<CheckpointStore>, PipelineExecutor) {
    let store = Arc::new(CheckpointStore::new(root.join("checkpoints")));
    let executor = PipelineExecutor::new(store.clone(), TelemetrySink::disabled());
    (store, executor)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_limit_leaves_remaining_gaps_for_the_next_cycle() {
    let dir = tempdir().expect("temp directory should create");
    let handles = Handles::default();
    let registry = registry(&handles, &SUBJECTS);
    let resolved = ResolvedFlow::resolve("mcp", &flow(&dir.path().join("kb"), "template", 0), &registry)
        .expect("flow should resolve");
    let (store, executor) = executor(dir.path());
    let stop = AtomicBool::new(false);

    let first = executor.run_cycle(&resolved, &stop).await.expect("first cycle");
    assert_eq!(first.identified, 5);
    assert_eq!(first.resolved.len(), 3);
    let checkpoint = store.load("mcp");
    assert_eq!(checkpoint.cycle_count, 3);
    assert_eq!(checkpoint.pending_gaps.len(), 2);

    let second = executor.run_cycle(&resolved, &stop).await.expect("second cycle");
    assert_eq!(second.identified, 0);
    assert_eq!(second.resolved.len(), 2);
    assert_eq!(handles.identify_calls.load(Ordering::SeqCst), 1);

    let checkpoint = store.load("mcp");
    assert_eq!(checkpoint.cycle_count, 5);
    assert!(checkpoint.pending_gaps.is_empty());
    assert_eq!(checkpoint.artifacts.len(), 5);
}

#[tokio::test]
async fn restart_resumes_pending_gaps_in_order_before_identifying() {
    let dir = tempdir().expect("temp directory should create");
    let handles = Handles::default();
    let registry = registry(&handles, &SUBJECTS);
    let definition = flow(&dir.path().join("kb"), "template", 0);

    // a previous process claimed the first gap and died before finishing it
    let seeded = {
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        let mut checkpoint = store.load("mcp");
        let now = Utc::now();
        for subject in &SUBJECTS[..3] {
            checkpoint.pending_gaps.push(KnowledgeGap::new(subject, 0, now));
        }
        checkpoint.pending_gaps[0].status = GapStatus::InProgress;
        store.save("mcp", &checkpoint).expect("seed checkpoint should save");
        checkpoint
            .pending_gaps
            .iter()
            .map(|gap| gap.id.clone())
            .collect::<Vec<String>>()
    };

    let resolved = ResolvedFlow::resolve("mcp", &definition, &registry).expect("flow should resolve");
    let (store, executor) = executor(dir.path());
    let report = executor
        .run_cycle(&resolved, &AtomicBool::new(false))
        .await
        .expect("cycle should succeed");

    assert_eq!(handles.identify_calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.resolved, seeded);
    let checkpoint = store.load("mcp");
    assert!(checkpoint.pending_gaps.is_empty());
    assert_eq!(
        checkpoint
            .artifacts
            .iter()
            .map(|artifact| artifact.gap_id.clone())
            .collect::<Vec<String>>(),
        seeded
    );
}

#[tokio::test]
async fn checkpoint_survives_a_fresh_store_instance() {
    let dir = tempdir().expect("temp directory should create");
    let handles = Handles::default();
    let registry = registry(&handles, &SUBJECTS[..2]);
    let resolved = ResolvedFlow::resolve("mcp", &flow(&dir.path().join("kb"), "template", 0), &registry)
        .expect("flow should resolve");
    let (store, executor) = executor(dir.path());
    executor
        .run_cycle(&resolved, &AtomicBool::new(false))
        .await
        .expect("cycle should succeed");

    let before = store.load("mcp");
    let reopened = CheckpointStore::new(dir.path().join("checkpoints"));
    assert_eq!(reopened.load("mcp"), before);
    assert_eq!(before.cycle_count, 2);
    assert_eq!(before.stage_results["identify"].status, StageStatus::Succeeded);
}

#[tokio::test]
async fn transient_search_failures_are_retried_within_budget() {
    let dir = tempdir().expect("temp directory should create");
    let handles = Handles::default();
    handles.search_failures.store(2, Ordering::SeqCst);
    let registry = registry(&handles, &SUBJECTS[..1]);
    let knowledge = dir.path().join("kb");
    let resolved = ResolvedFlow::resolve("mcp", &flow(&knowledge, "template", 2), &registry)
        .expect("flow should resolve");
    let (store, executor) = executor(dir.path());

    let report = executor
        .run_cycle(&resolved, &AtomicBool::new(false))
        .await
        .expect("cycle should succeed");
    assert_eq!(report.resolved.len(), 1);
    assert_eq!(handles.search_calls.load(Ordering::SeqCst), 3);
    let checkpoint = store.load("mcp");
    assert_eq!(checkpoint.stage_results["search"].attempts, 3);

    // the written artifact cites what the search returned
    let writer = MarkdownWriter::new(&knowledge);
    let artifact = writer
        .read(&report.artifact_paths[0])
        .await
        .expect("artifact should read back");
    assert_eq!(artifact.title, "transport negotiation");
    assert_eq!(artifact.citations.len(), 1);
    assert_eq!(
        artifact.citations[0].url,
        "https://docs.example.org/transport-negotiation"
    );
    assert_eq!(artifact.source_gap_id, report.resolved[0]);
}

#[tokio::test]
async fn exhausted_retries_leave_the_gap_pending() {
    let dir = tempdir().expect("temp directory should create");
    let handles = Handles::default();
    handles.search_failures.store(10, Ordering::SeqCst);
    let registry = registry(&handles, &SUBJECTS[..1]);
    let resolved = ResolvedFlow::resolve("mcp", &flow(&dir.path().join("kb"), "template", 1), &registry)
        .expect("flow should resolve");
    let (store, executor) = executor(dir.path());

    let report = executor
        .run_cycle(&resolved, &AtomicBool::new(false))
        .await
        .expect("stage failures do not fail the cycle");
    assert!(report.resolved.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].stage, "search");
    assert_eq!(handles.search_calls.load(Ordering::SeqCst), 2);

    let checkpoint = store.load("mcp");
    assert_eq!(checkpoint.cycle_count, 0);
    assert_eq!(checkpoint.pending_gaps.len(), 1);
    assert_eq!(checkpoint.pending_gaps[0].status, GapStatus::Pending);
    assert_eq!(checkpoint.stage_results["search"].status, StageStatus::Failed);
    assert!(checkpoint.last_run_timestamp.is_some());
}

#[tokio::test]
async fn one_failing_query_keeps_results_from_the_others() {
    let dir = tempdir().expect("temp directory should create");
    let handles = Handles::default();
    let registry = registry(&handles, &SUBJECTS[..1]);
    let knowledge = dir.path().join("kb");
    let mut definition = flow(&knowledge, "template", 0);
    definition.stages[1] = stage("search", TaskKind::WebSearch, "picky", 0);
    definition
        .stages
        .insert(1, stage("terms", TaskKind::GenerateSearchTerms, "two-terms", 0));
    let resolved = ResolvedFlow::resolve("mcp", &definition, &registry).expect("flow should resolve");
    let (store, executor) = executor(dir.path());

    let report = executor
        .run_cycle(&resolved, &AtomicBool::new(false))
        .await
        .expect("cycle should succeed");
    assert_eq!(report.resolved.len(), 1);
    assert!(report.failed.is_empty());

    let search = &store.load("mcp").stage_results["search"];
    assert_eq!(search.status, StageStatus::Succeeded);
    assert!(search.detail.contains("query 'broken handshake'"));

    let artifact = MarkdownWriter::new(&knowledge)
        .read(&report.artifact_paths[0])
        .await
        .expect("artifact should read back");
    assert_eq!(artifact.citations.len(), 1);
    assert_eq!(
        artifact.citations[0].url,
        "https://docs.example.org/transport-framing"
    );
}

#[tokio::test]
async fn empty_compile_output_fails_without_retry() {
    let dir = tempdir().expect("temp directory should create");
    let handles = Handles::default();
    let registry = registry(&handles, &SUBJECTS[..1]);
    let mut definition = flow(&dir.path().join("kb"), "silent", 0);
    definition.stages[2].retries = 3;
    let resolved = ResolvedFlow::resolve("mcp", &definition, &registry).expect("flow should resolve");
    let (store, executor) = executor(dir.path());

    let report = executor
        .run_cycle(&resolved, &AtomicBool::new(false))
        .await
        .expect("cycle should finish");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].stage, "compile");
    let compile = &store.load("mcp").stage_results["compile"];
    assert_eq!(compile.status, StageStatus::Failed);
    assert_eq!(compile.attempts, 1);
}

fn manager_for(root: &Path, registry: PluginRegistry, flows: Vec<FlowDefinition>) -> AgentManager {
    let config = AgentConfig {
        core: CoreSettings {
            knowledge_dir: root.join("kb"),
            checkpoint_dir: root.join("checkpoints"),
            telemetry_enabled: false,
            ..CoreSettings::default()
        },
        llm: LlmSettings::default(),
        pipeline: PipelineSettings::default(),
        agents: vec![AgentDefinition {
            name: "mcp".to_string(),
            enabled: true,
            description: None,
            flows,
        }],
        layers: Vec::new(),
    };
    AgentManager::new(config, registry)
}

#[tokio::test]
async fn manual_trigger_during_a_run_is_skipped_and_counted() {
    let dir = tempdir().expect("temp directory should create");
    let handles = Handles::default();
    let registry = registry(&handles, &SUBJECTS[..1]);
    let manager = manager_for(
        dir.path(),
        registry,
        vec![flow(&dir.path().join("kb"), "gated", 0)],
    );

    let first = manager
        .run_once("mcp", "research", false)
        .await
        .expect("first trigger should start");
    assert!(matches!(first, RunOnce::Started));
    let second = manager.run_once("mcp", "research", true).await;
    assert!(matches!(second, Err(ManagerError::Overlap { .. })));
    assert!(matches!(manager.reset("mcp"), Err(ManagerError::Busy(_))));

    handles.gate.notify_one();
    manager.wait_idle().await;

    let status = manager.status();
    let research = &status.agents[0].flows[0];
    assert_eq!(research.overlap_skips, 1);
    assert_eq!(research.last_outcome, Some(RunOutcome::Succeeded));
    assert_eq!(status.agents[0].checkpoint.cycle_count, 1);
}

#[tokio::test]
async fn scheduled_tick_runs_due_flows_once() {
    let dir = tempdir().expect("temp directory should create");
    let handles = Handles::default();
    let registry = registry(&handles, &SUBJECTS[..2]);
    let mut definition = flow(&dir.path().join("kb"), "template", 0);
    definition.schedule = ScheduleSpec::Interval(3600);
    let manager = manager_for(dir.path(), registry, vec![definition]);

    manager.start().expect("manager should start");
    // the first tick of the loop may already have fired the flow
    manager.wait_idle().await;
    manager.tick(Utc::now());
    manager.wait_idle().await;

    assert_eq!(handles.identify_calls.load(Ordering::SeqCst), 1);
    let status = manager.status();
    assert_eq!(status.agents[0].checkpoint.cycle_count, 2);
    assert!(status.agents[0].checkpoint.last_run_timestamp.is_some());
    manager.shutdown().await;
}

#[tokio::test]
async fn interval_timing_is_restored_per_flow() {
    let dir = tempdir().expect("temp directory should create");
    let handles = Handles::default();
    let registry = registry(&handles, &SUBJECTS[..1]);
    let research = flow(&dir.path().join("kb"), "template", 0);
    let mut digest = research.clone();
    digest.name = "digest".to_string();

    // only research ran before the restart
    let ran_at = Utc::now() - chrono::Duration::minutes(10);
    {
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        let mut checkpoint = store.load("mcp");
        checkpoint.mark_run("research", ran_at);
        store.save("mcp", &checkpoint).expect("seed checkpoint should save");
    }

    let manager = manager_for(dir.path(), registry, vec![research, digest]);
    manager.start().expect("manager should start");
    manager.wait_idle().await;

    let status = manager.status();
    let flows = &status.agents[0].flows;
    let research = flows
        .iter()
        .find(|flow| flow.flow == "research")
        .expect("research should be registered");
    assert_eq!(research.next_fire, Some(ran_at + chrono::Duration::hours(1)));
    assert!(research.last_outcome.is_none());
    let digest = flows
        .iter()
        .find(|flow| flow.flow == "digest")
        .expect("digest should be registered");
    assert!(digest.next_fire.is_some());
    assert_ne!(digest.next_fire, research.next_fire);
    manager.shutdown().await;
}
