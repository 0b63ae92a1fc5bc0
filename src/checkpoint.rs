/// Durable per-agent checkpoints.
///
/// One JSON file per agent under the checkpoint directory. Every save goes to a
/// sibling temp file that is fsynced and renamed over the target, so readers
/// only ever see the previous or the next complete checkpoint.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::artifact::ArtifactRef;
use crate::error::CheckpointIoError;
use crate::gaps::KnowledgeGap;

pub const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Last recorded outcome of a named stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub gap_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    pub version: u32,
    pub cycle_count: u64,
    pub completed_gaps: BTreeSet<String>,
    pub pending_gaps: Vec<KnowledgeGap>,
    pub last_run_timestamp: Option<DateTime<Utc>>,
    /// Start of the last cycle per flow; seeds interval timing on restart.
    pub flow_runs: BTreeMap<String, DateTime<Utc>>,
    pub stage_results: BTreeMap<String, StageResult>,
    pub artifacts: Vec<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::fresh(Utc::now())
    }
}

impl Checkpoint {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            cycle_count: 0,
            completed_gaps: BTreeSet::new(),
            pending_gaps: Vec::new(),
            last_run_timestamp: None,
            flow_runs: BTreeMap::new(),
            stage_results: BTreeMap::new(),
            artifacts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_run(&mut self, flow: &str, started_at: DateTime<Utc>) {
        self.last_run_timestamp = Some(started_at);
        self.flow_runs.insert(flow.to_string(), started_at);
    }

    pub fn last_run_of(&self, flow: &str) -> Option<DateTime<Utc>> {
        self.flow_runs.get(flow).copied()
    }

    pub fn record_stage(&mut self, stage: &str, result: StageResult) {
        self.stage_results.insert(stage.to_string(), result);
    }

    /// Moves a pending gap to the completed set and records its artifact.
    ///
    /// Returns false when the gap is already completed, leaving the
    /// checkpoint untouched.
    pub fn resolve_gap(&mut self, gap_id: &str, artifact: ArtifactRef) -> bool {
        if self.completed_gaps.contains(gap_id) {
            self.pending_gaps.retain(|gap| gap.id != gap_id);
            return false;
        }
        self.pending_gaps.retain(|gap| gap.id != gap_id);
        self.completed_gaps.insert(gap_id.to_string());
        self.artifacts.push(artifact);
        self.cycle_count += 1;
        true
    }

    pub fn resolved_descriptions(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .map(|artifact| artifact.gap_description.clone())
            .collect()
    }

    /// Bullet list of known artifact titles, used as identifier context.
    pub fn knowledge_summary(&self) -> String {
        if self.artifacts.is_empty() {
            return "No knowledge files exist yet.".to_string();
        }
        self.artifacts
            .iter()
            .map(|artifact| format!("- {}", artifact.title))
            .collect::<Vec<String>>()
            .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Directory-backed checkpoint store with per-agent write serialization.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, agent: &str) -> PathBuf {
        self.dir
            .join(format!("{}{CHECKPOINT_SUFFIX}", sanitize_agent_name(agent)))
    }

    /// Acquires the agent's read-modify-write lock.
    pub async fn lock(&self, agent: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(agent.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Loads the agent checkpoint; missing or unreadable files yield a fresh one.
    pub fn load(&self, agent: &str) -> Checkpoint {
        let path = self.path_for(agent);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(agent, path = %path.display(), "no checkpoint, starting fresh");
                return Checkpoint::fresh(Utc::now());
            }
            Err(err) => {
                tracing::warn!(agent, path = %path.display(), error = %err, "checkpoint unreadable, starting fresh");
                return Checkpoint::fresh(Utc::now());
            }
        };
        match serde_json::from_str::<Checkpoint>(&raw) {
            Ok(checkpoint) => {
                if checkpoint.version > CHECKPOINT_VERSION {
                    tracing::warn!(
                        agent,
                        version = checkpoint.version,
                        "checkpoint written by a newer format version; unknown fields are ignored"
                    );
                }
                checkpoint
            }
            Err(err) => {
                tracing::warn!(agent, path = %path.display(), error = %err, "checkpoint corrupt, starting fresh");
                preserve_corrupt_file(&path);
                Checkpoint::fresh(Utc::now())
            }
        }
    }

    /// Atomically replaces the agent checkpoint.
    pub fn save(&self, agent: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointIoError> {
        let path = self.path_for(agent);
        if let Some(stored) = self.stored_cycle_count(&path)
            && checkpoint.cycle_count < stored
        {
            return Err(CheckpointIoError::Regression {
                agent: agent.to_string(),
                stored,
                attempted: checkpoint.cycle_count,
            });
        }

        let mut snapshot = checkpoint.clone();
        snapshot.version = CHECKPOINT_VERSION;
        snapshot.updated_at = Utc::now();
        let payload =
            serde_json::to_vec_pretty(&snapshot).map_err(|err| CheckpointIoError::Serialize {
                agent: agent.to_string(),
                message: err.to_string(),
            })?;

        fs::create_dir_all(&self.dir).map_err(|source| io_error(&self.dir, source))?;
        let temp = self.temp_path_for(&path);
        let write_result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&payload)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&temp, &path)
        })();
        if let Err(source) = write_result {
            let _ = fs::remove_file(&temp);
            return Err(io_error(&path, source));
        }
        sync_dir(&self.dir);
        tracing::debug!(agent, cycle_count = snapshot.cycle_count, "checkpoint saved");
        Ok(())
    }

    /// Deletes the agent checkpoint. Missing files are not an error.
    pub fn reset(&self, agent: &str) -> Result<(), CheckpointIoError> {
        let path = self.path_for(agent);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(agent, path = %path.display(), "checkpoint removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_error(&path, source)),
        }
    }

    pub fn exists(&self, agent: &str) -> bool {
        self.path_for(agent).is_file()
    }

    fn stored_cycle_count(&self, path: &Path) -> Option<u64> {
        let raw = fs::read_to_string(path).ok()?;
        let value = serde_json::from_str::<serde_json::Value>(&raw).ok()?;
        value.get("cycle_count")?.as_u64()
    }

    fn temp_path_for(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint".to_string());
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!(".{name}.{}.{seq}.tmp", std::process::id()))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointIoError {
    CheckpointIoError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn preserve_corrupt_file(path: &Path) {
    let target = path.with_extension(format!("json.corrupt-{}", Utc::now().timestamp()));
    if let Err(err) = fs::rename(path, &target) {
        tracing::warn!(path = %path.display(), error = %err, "could not move corrupt checkpoint aside");
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

pub fn sanitize_agent_name(agent: &str) -> String {
    let sanitized = agent
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    if sanitized.is_empty() {
        "agent".to_string()
    } else {
        sanitized
    }
}

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

pub fn format_checkpoint_summary(agent: &str, checkpoint: &Checkpoint) -> String {
    let last_run = checkpoint
        .last_run_timestamp
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    let mut out = format!(
        "{agent}: cycle_count={} pending={} completed={} last_run={last_run}\n",
        checkpoint.cycle_count,
        checkpoint.pending_gaps.len(),
        checkpoint.completed_gaps.len(),
    );
    for (stage, result) in &checkpoint.stage_results {
        if result.status == StageStatus::Failed {
            out.push_str(&format!(
                "  last {stage} failure ({} attempts): {}\n",
                result.attempts, result.detail
            ));
        }
    }
    out
}
