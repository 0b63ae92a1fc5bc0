//! One cycle of a flow against an agent checkpoint.
//!
//! A cycle identifies gaps when nothing is pending, selects a batch, and runs
//! every selected gap through search terms, search, compile and write. Each
//! gap commits to the checkpoint on its own, so a crash mid-cycle keeps the
//! gaps that already finished.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use serde_json::json;

use crate::artifact::{
    ArtifactRef, Citation, KnowledgeArtifact, extract_title, strip_references_section,
};
use crate::checkpoint::{CheckpointStore, StageResult, StageStatus};
use crate::config::{FlowDefinition, StageDefinition, TaskKind};
use crate::error::{CheckpointIoError, CycleError, ResolutionError, StageError};
use crate::gaps::{GapStatus, KnowledgeGap, clean_gap_line, merge_identified_gaps, select_batch};
use crate::plugins::{
    DocumentWriter, GapIdentifier, GapRequest, LlmPlugin, LlmPrompt, PluginRegistry,
    SearchPlugin, SearchResult,
};
use crate::retry::{Attempted, RetryPolicy};
use crate::telemetry::{GAP_FAILED, GAP_RESOLVED, TelemetrySink};

/// Prefix the topic identifier puts in front of gap subjects.
pub const MISSING_KNOWLEDGE_PREFIX: &str = "Missing knowledge about: ";

const TERMS_SYSTEM_PROMPT: &str = "You are a search query generation expert.
Given a knowledge gap about MCP (Model Context Protocol) servers, generate 3-5 effective search queries
that would help gather comprehensive information about this topic.

Generate each search query on a new line.
Focus on technical, specific search terms that would yield high-quality results.";

const COMPILE_SYSTEM_PROMPT: &str = "You are an expert knowledge base creator for MCP (Model Context Protocol) servers.
Your task is to synthesize comprehensive markdown content using the provided search results,
filling a knowledge gap with accurate, well-cited information.

Your response MUST:
1. Have a clear, descriptive title (H1)
2. Include multiple sections with headings (H2, H3)
3. Provide technical details, examples, and where applicable, code snippets
4. Cite the provided sources with numbered references [1], [2], etc.
5. Be comprehensive but concise (600-1000 words)

Format as markdown with proper headings, lists, code blocks, etc.";

const UNCITED_SYSTEM_PROMPT: &str = "You are an expert knowledge base creator for MCP (Model Context Protocol) servers.
Your task is to generate comprehensive markdown content to fill a knowledge gap.

Your response should:
1. Have a clear, descriptive title (H1)
2. Include multiple sections with headings (H2, H3)
3. Provide technical details, examples, and where applicable, code snippets
4. Be comprehensive but concise (400-800 words)

Format as markdown with proper headings, lists, code blocks, etc.";

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

struct Stage<P: ?Sized> {
    name: String,
    plugin: Arc<P>,
    policy: RetryPolicy,
}

impl<P: ?Sized> Stage<P> {
    fn new(definition: &StageDefinition, plugin: Arc<P>, retry_delay: Duration) -> Self {
        Self {
            name: definition.name.clone(),
            plugin,
            policy: RetryPolicy::for_stage(
                definition.retries,
                retry_delay,
                Duration::from_secs(definition.timeout_secs),
            ),
        }
    }
}

/// A flow definition with every stage bound to a plugin instance.
pub struct ResolvedFlow {
    agent: String,
    definition: FlowDefinition,
    llm: Arc<dyn LlmPlugin>,
    identify: Stage<dyn GapIdentifier>,
    terms: Option<Stage<dyn LlmPlugin>>,
    search: Option<Stage<dyn SearchPlugin>>,
    compile: Stage<dyn LlmPlugin>,
    write: Stage<dyn DocumentWriter>,
}

impl std::fmt::Debug for ResolvedFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedFlow")
            .field("agent", &self.agent)
            .field("flow", &self.definition.name)
            .field(
                "stages",
                &self
                    .definition
                    .stages
                    .iter()
                    .map(|stage| format!("{}={}", stage.name, stage.plugin.name))
                    .collect::<Vec<String>>(),
            )
            .finish()
    }
}

impl ResolvedFlow {
    pub fn resolve(
        agent: &str,
        definition: &FlowDefinition,
        registry: &PluginRegistry,
    ) -> Result<Self, ResolutionError> {
        let delay = Duration::from_millis(definition.settings.retry_delay_ms);
        let required = |kind: TaskKind| {
            definition
                .stage(kind)
                .ok_or_else(|| ResolutionError::MissingStage {
                    flow: definition.name.clone(),
                    stage: kind.to_string(),
                })
        };

        let identify = required(TaskKind::IdentifyGaps)?;
        let compile = required(TaskKind::CompileKnowledge)?;
        let write = required(TaskKind::WriteKnowledge)?;

        let terms = match definition.stage(TaskKind::GenerateSearchTerms) {
            Some(stage) => Some(Stage::new(
                stage,
                registry.resolve_llm(&stage.plugin.name, &stage.plugin.params)?,
                delay,
            )),
            None => None,
        };
        let search = match definition.stage(TaskKind::WebSearch) {
            Some(stage) => Some(Stage::new(
                stage,
                registry.resolve_search(&stage.plugin.name, &stage.plugin.params)?,
                delay,
            )),
            None => None,
        };

        Ok(Self {
            agent: agent.to_string(),
            definition: definition.clone(),
            llm: registry.resolve_llm(&definition.llm.name, &definition.llm.params)?,
            identify: Stage::new(
                identify,
                registry.resolve_gap_identifier(&identify.plugin.name, &identify.plugin.params)?,
                delay,
            ),
            terms,
            search,
            compile: Stage::new(
                compile,
                registry.resolve_llm(&compile.plugin.name, &compile.plugin.params)?,
                delay,
            ),
            write: Stage::new(
                write,
                registry.resolve_document_writer(&write.plugin.name, &write.plugin.params)?,
                delay,
            ),
        })
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapFailure {
    pub gap_id: String,
    pub stage: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// New gaps admitted by this cycle's identify stage.
    pub identified: usize,
    pub selected: usize,
    pub resolved: Vec<String>,
    pub failed: Vec<GapFailure>,
    /// Gaps left untouched because the agent was stopping.
    pub cancelled: Vec<String>,
    pub artifact_paths: Vec<PathBuf>,
}

impl CycleReport {
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "identified={} selected={} resolved={} failed={}",
            self.identified,
            self.selected,
            self.resolved.len(),
            self.failed.len()
        );
        if !self.cancelled.is_empty() {
            summary.push_str(&format!(" cancelled={}", self.cancelled.len()));
        }
        if let Some(first) = self.failed.first() {
            summary.push_str(&format!(
                "; {} failed at {}: {}",
                first.gap_id, first.stage, first.error
            ));
        }
        summary
    }
}

enum GapOutcome {
    Resolved { gap_id: String, path: PathBuf },
    Failed(GapFailure),
    Cancelled(String),
}

type StageLog = Vec<(String, StageResult)>;

fn stage_result(
    status: StageStatus,
    detail: String,
    attempts: u32,
    gap_id: Option<&str>,
) -> StageResult {
    StageResult {
        status,
        detail,
        attempts,
        gap_id: gap_id.map(str::to_string),
        recorded_at: Utc::now(),
    }
}

/// Records a retried stage call and unwraps its value.
fn settle<T>(
    log: &mut StageLog,
    stage: &str,
    gap_id: &str,
    attempted: Attempted<T>,
    detail: impl FnOnce(&T) -> String,
) -> Result<T, (String, StageError)> {
    match attempted.result {
        Ok(value) => {
            log.push((
                stage.to_string(),
                stage_result(
                    StageStatus::Succeeded,
                    detail(&value),
                    attempted.attempts,
                    Some(gap_id),
                ),
            ));
            Ok(value)
        }
        Err(err) => {
            log.push((
                stage.to_string(),
                stage_result(
                    StageStatus::Failed,
                    err.to_string(),
                    attempted.attempts,
                    Some(gap_id),
                ),
            ));
            Err((stage.to_string(), err))
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    store: Arc<CheckpointStore>,
    telemetry: TelemetrySink,
}

impl PipelineExecutor {
    pub fn new(store: Arc<CheckpointStore>, telemetry: TelemetrySink) -> Self {
        Self { store, telemetry }
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Runs one cycle. Stage failures are recorded per gap; only checkpoint
    /// durability failures and a failed identify stage end the cycle early.
    ///
    /// `stop` is checked before each gap starts, so a stopping agent finishes
    /// the gaps already in flight and leaves the rest pending.
    pub async fn run_cycle(
        &self,
        flow: &ResolvedFlow,
        stop: &AtomicBool,
    ) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        let mut report = CycleReport::default();
        let batch = self.prepare_batch(flow, started_at, &mut report).await?;
        report.selected = batch.len();
        tracing::info!(
            agent = %flow.agent,
            flow = %flow.definition.name,
            identified = report.identified,
            selected = report.selected,
            "cycle batch selected"
        );

        let concurrency = flow.definition.settings.gap_concurrency.max(1);
        let mut queue = batch.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for gap in queue.by_ref().take(concurrency) {
            in_flight.push(self.process_gap(flow, gap, stop));
        }
        while let Some(outcome) = in_flight.next().await {
            match outcome? {
                GapOutcome::Resolved { gap_id, path } => {
                    report.resolved.push(gap_id);
                    report.artifact_paths.push(path);
                }
                GapOutcome::Failed(failure) => report.failed.push(failure),
                GapOutcome::Cancelled(gap_id) => report.cancelled.push(gap_id),
            }
            if let Some(gap) = queue.next() {
                in_flight.push(self.process_gap(flow, gap, stop));
            }
        }

        let _guard = self.store.lock(&flow.agent).await;
        let mut checkpoint = self.store.load(&flow.agent);
        checkpoint.mark_run(&flow.definition.name, started_at);
        self.store.save(&flow.agent, &checkpoint)?;
        Ok(report)
    }

    /// Identifies gaps when nothing is pending, then selects and claims a batch.
    async fn prepare_batch(
        &self,
        flow: &ResolvedFlow,
        started_at: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<Vec<KnowledgeGap>, CycleError> {
        let agent = flow.agent.as_str();
        let settings = &flow.definition.settings;

        // the identify call runs outside the lock; the merge below re-reads
        let snapshot = self.store.load(agent);
        let identified = if snapshot.pending_gaps.is_empty() {
            let request = GapRequest {
                summary: snapshot.knowledge_summary(),
                prompt: flow.definition.prompt.clone(),
                max_gaps: settings.max_gaps,
                llm: Some(flow.llm.clone()),
            };
            let stage = &flow.identify;
            let request = &request;
            Some(
                stage
                    .policy
                    .run(&stage.name, move || stage.plugin.identify(request))
                    .await,
            )
        } else {
            tracing::debug!(
                agent,
                pending = snapshot.pending_gaps.len(),
                "resuming pending gaps"
            );
            None
        };

        let _guard = self.store.lock(agent).await;
        let mut checkpoint = self.store.load(agent);
        if let Some(attempted) = identified {
            match attempted.result {
                Ok(candidates) => {
                    let completed = checkpoint.completed_gaps.clone();
                    let resolved = checkpoint.resolved_descriptions();
                    let offered = candidates.len();
                    let admitted = merge_identified_gaps(
                        &mut checkpoint.pending_gaps,
                        &completed,
                        &resolved,
                        candidates,
                        settings.dedup_similarity,
                        Utc::now(),
                    );
                    report.identified = admitted.len();
                    checkpoint.record_stage(
                        &flow.identify.name,
                        stage_result(
                            StageStatus::Succeeded,
                            format!("{} of {offered} gaps admitted", admitted.len()),
                            attempted.attempts,
                            None,
                        ),
                    );
                }
                Err(err) => {
                    checkpoint.record_stage(
                        &flow.identify.name,
                        stage_result(
                            StageStatus::Failed,
                            err.to_string(),
                            attempted.attempts,
                            None,
                        ),
                    );
                    checkpoint.mark_run(&flow.definition.name, started_at);
                    self.store.save(agent, &checkpoint)?;
                    return Err(CycleError::Identify(err));
                }
            }
        }

        let batch = select_batch(&checkpoint.pending_gaps, settings.max_gaps_to_process);
        let claimed = batch
            .iter()
            .map(|gap| gap.id.as_str())
            .collect::<HashSet<&str>>();
        for gap in checkpoint.pending_gaps.iter_mut() {
            if claimed.contains(gap.id.as_str()) {
                gap.status = GapStatus::InProgress;
            }
        }
        self.store.save(agent, &checkpoint)?;
        Ok(batch)
    }

    async fn process_gap(
        &self,
        flow: &ResolvedFlow,
        gap: KnowledgeGap,
        stop: &AtomicBool,
    ) -> Result<GapOutcome, CheckpointIoError> {
        if stop.load(Ordering::SeqCst) {
            self.release_gap(flow, &gap, Vec::new()).await?;
            return Ok(GapOutcome::Cancelled(gap.id));
        }

        let mut log = StageLog::new();
        match self.run_gap_stages(flow, &gap, &mut log).await {
            Ok((artifact, path)) => {
                self.commit_resolved(flow, &gap, &artifact, &path, log)
                    .await?;
                tracing::info!(
                    agent = %flow.agent,
                    gap_id = %gap.id,
                    path = %path.display(),
                    "gap resolved"
                );
                self.telemetry.emit(
                    GAP_RESOLVED,
                    &flow.agent,
                    &flow.definition.name,
                    json!({
                        "gap_id": gap.id,
                        "title": artifact.title,
                        "citations": artifact.citations.len(),
                        "path": path.display().to_string(),
                    }),
                );
                Ok(GapOutcome::Resolved {
                    gap_id: gap.id,
                    path,
                })
            }
            Err((stage, err)) => {
                self.release_gap(flow, &gap, log).await?;
                tracing::warn!(
                    agent = %flow.agent,
                    gap_id = %gap.id,
                    stage = %stage,
                    error = %err,
                    "gap left pending after stage failure"
                );
                self.telemetry.emit(
                    GAP_FAILED,
                    &flow.agent,
                    &flow.definition.name,
                    json!({
                        "gap_id": gap.id,
                        "stage": stage,
                        "transient": err.is_transient(),
                        "error": err.to_string(),
                    }),
                );
                Ok(GapOutcome::Failed(GapFailure {
                    gap_id: gap.id,
                    stage,
                    error: err.to_string(),
                }))
            }
        }
    }

    async fn run_gap_stages(
        &self,
        flow: &ResolvedFlow,
        gap: &KnowledgeGap,
        log: &mut StageLog,
    ) -> Result<(KnowledgeArtifact, PathBuf), (String, StageError)> {
        let settings = &flow.definition.settings;
        let subject = gap_subject(&gap.description);

        let terms = match &flow.terms {
            Some(stage) => {
                let prompt = LlmPrompt {
                    system: TERMS_SYSTEM_PROMPT.to_string(),
                    user: format!("Generate search queries for: {}", gap.description),
                    temperature: 0.4,
                    max_tokens: 200,
                };
                let prompt = &prompt;
                let attempted = stage
                    .policy
                    .run(&stage.name, move || stage.plugin.generate(prompt))
                    .await;
                let text = settle(log, &stage.name, &gap.id, attempted, |text| {
                    format!("{} bytes of search terms", text.len())
                })?;
                let terms = parse_search_terms(&text, settings.max_search_terms);
                if terms.is_empty() {
                    vec![subject.clone()]
                } else {
                    terms
                }
            }
            None => vec![subject.clone()],
        };

        let mut results = Vec::<SearchResult>::new();
        if let Some(stage) = &flow.search {
            let mut seen = HashSet::new();
            let mut attempts = 0;
            let mut failed_terms = Vec::new();
            let mut last_error = None;
            for term in &terms {
                let term = term.as_str();
                let per_term = settings.results_per_term;
                let attempted = stage
                    .policy
                    .run(&stage.name, move || stage.plugin.search(term, per_term))
                    .await;
                attempts += attempted.attempts;
                match attempted.result {
                    Ok(found) => {
                        for result in found {
                            if result.url.is_empty() || seen.insert(result.url.clone()) {
                                results.push(result);
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            gap = %gap.id,
                            query = term,
                            error = %err,
                            "search query failed"
                        );
                        failed_terms.push(format!("query '{term}': {err}"));
                        last_error = Some(err);
                    }
                }
            }
            // the stage fails only when no query got through
            if failed_terms.len() == terms.len()
                && let Some(err) = last_error
            {
                log.push((
                    stage.name.clone(),
                    stage_result(
                        StageStatus::Failed,
                        failed_terms.join("; "),
                        attempts,
                        Some(&gap.id),
                    ),
                ));
                return Err((stage.name.clone(), err));
            }
            let mut detail =
                format!("{} unique results for {} queries", results.len(), terms.len());
            if !failed_terms.is_empty() {
                detail.push_str(&format!("; failed {}", failed_terms.join("; ")));
            }
            log.push((
                stage.name.clone(),
                stage_result(StageStatus::Succeeded, detail, attempts, Some(&gap.id)),
            ));
        }

        let stage = &flow.compile;
        let prompt = compile_prompt(&gap.description, &results);
        let prompt = &prompt;
        let attempted = stage
            .policy
            .run(&stage.name, move || async move {
                let text = stage.plugin.generate(prompt).await?;
                if text.trim().is_empty() {
                    return Err(StageError::permanent("llm returned no content"));
                }
                Ok(text)
            })
            .await;
        let text = settle(log, &stage.name, &gap.id, attempted, |text| {
            format!("{} bytes compiled from {} sources", text.len(), results.len())
        })?;

        let body = strip_references_section(&text);
        let title = extract_title(body, &subject);
        let citations = results
            .iter()
            .map(|result| Citation {
                title: result.title.clone(),
                url: result.url.clone(),
            })
            .collect::<Vec<Citation>>();
        let artifact = KnowledgeArtifact::new(&title, body, citations, &gap.id, Utc::now());

        let stage = &flow.write;
        let artifact_ref = &artifact;
        let attempted = stage
            .policy
            .run(&stage.name, move || stage.plugin.write(artifact_ref))
            .await;
        let path = settle(log, &stage.name, &gap.id, attempted, |path| {
            path.display().to_string()
        })?;
        Ok((artifact, path))
    }

    async fn commit_resolved(
        &self,
        flow: &ResolvedFlow,
        gap: &KnowledgeGap,
        artifact: &KnowledgeArtifact,
        path: &std::path::Path,
        log: StageLog,
    ) -> Result<(), CheckpointIoError> {
        let _guard = self.store.lock(&flow.agent).await;
        let mut checkpoint = self.store.load(&flow.agent);
        for (stage, result) in log {
            checkpoint.record_stage(&stage, result);
        }
        let newly_resolved = checkpoint.resolve_gap(
            &gap.id,
            ArtifactRef {
                gap_id: gap.id.clone(),
                gap_description: gap.description.clone(),
                title: artifact.title.clone(),
                path: path.to_path_buf(),
                created_at: artifact.created_at,
            },
        );
        if !newly_resolved {
            tracing::debug!(agent = %flow.agent, gap_id = %gap.id, "gap was already resolved");
        }
        self.store.save(&flow.agent, &checkpoint)
    }

    /// Returns a claimed gap to the pending state, recording stage outcomes.
    async fn release_gap(
        &self,
        flow: &ResolvedFlow,
        gap: &KnowledgeGap,
        log: StageLog,
    ) -> Result<(), CheckpointIoError> {
        let _guard = self.store.lock(&flow.agent).await;
        let mut checkpoint = self.store.load(&flow.agent);
        for (stage, result) in log {
            checkpoint.record_stage(&stage, result);
        }
        if let Some(pending) = checkpoint
            .pending_gaps
            .iter_mut()
            .find(|pending| pending.id == gap.id)
        {
            pending.status = GapStatus::Pending;
        }
        self.store.save(&flow.agent, &checkpoint)
    }
}

// ---------------------------------------------------------------------------
// Stage helpers
// ---------------------------------------------------------------------------

/// Gap description without the topic identifier's prefix.
pub fn gap_subject(description: &str) -> String {
    description
        .strip_prefix(MISSING_KNOWLEDGE_PREFIX)
        .unwrap_or(description)
        .trim()
        .to_string()
}

/// One query per non-empty line, list markers and quotes removed.
pub fn parse_search_terms(text: &str, max_terms: usize) -> Vec<String> {
    let mut terms = Vec::new();
    for line in text.lines() {
        if terms.len() >= max_terms.max(1) {
            break;
        }
        let Some(cleaned) = clean_gap_line(line) else {
            continue;
        };
        let term = cleaned.trim_matches('"').trim().to_string();
        if !term.is_empty() && !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

pub fn compile_prompt(description: &str, results: &[SearchResult]) -> LlmPrompt {
    if results.is_empty() {
        return LlmPrompt {
            system: UNCITED_SYSTEM_PROMPT.to_string(),
            user: format!("Create knowledge content about: {description}"),
            temperature: 0.5,
            max_tokens: 1000,
        };
    }
    let sources = results
        .iter()
        .enumerate()
        .map(|(index, result)| {
            format!(
                "Source {}:\nTitle: {}\nURL: {}\nSnippet: {}\n",
                index + 1,
                result.title,
                result.url,
                result.snippet
            )
        })
        .collect::<Vec<String>>()
        .join("\n");
    LlmPrompt {
        system: COMPILE_SYSTEM_PROMPT.to_string(),
        user: format!("Create knowledge content about: {description}\n\nSearch Results:\n{sources}"),
        temperature: 0.5,
        max_tokens: 1500,
    }
}
