use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::config::CoreSettings;

pub const CYCLE_STARTED: &str = "cycle.started";
pub const CYCLE_COMPLETED: &str = "cycle.completed";
pub const CYCLE_FAILED: &str = "cycle.failed";
pub const CYCLE_OVERLAP_SKIPPED: &str = "cycle.overlap_skipped";
pub const GAP_RESOLVED: &str = "gap.resolved";
pub const GAP_FAILED: &str = "gap.failed";

pub fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Append-only JSONL event log shared by every flow of the process.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    pub enabled: bool,
    pub path: PathBuf,
    pub run_id: String,
    pub file_lock: Arc<std::sync::Mutex<()>>,
}

impl TelemetrySink {
    pub fn new(core: &CoreSettings) -> Self {
        Self::at_path(core.telemetry_enabled, core.telemetry_path.clone())
    }

    pub fn at_path(enabled: bool, path: PathBuf) -> Self {
        let run_id = format!("run-{}-{}", unix_ms_now(), std::process::id());
        Self {
            enabled,
            path,
            run_id,
            file_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    pub fn disabled() -> Self {
        Self::at_path(false, PathBuf::new())
    }

    pub fn emit(&self, event: &str, agent: &str, flow: &str, payload: Value) {
        if !self.enabled {
            return;
        }

        let mut record = serde_json::Map::new();
        record.insert("ts_unix_ms".to_string(), json!(unix_ms_now()));
        record.insert("event".to_string(), json!(event));
        record.insert("run_id".to_string(), json!(self.run_id));
        record.insert("agent".to_string(), json!(agent));
        record.insert("flow".to_string(), json!(flow));

        if let Some(map) = payload.as_object() {
            for (key, value) in map {
                record.insert(key.clone(), value.clone());
            }
        }

        let value = Value::Object(record);
        if let Err(err) = self.append_event_line(&value) {
            tracing::warn!(
                event = event,
                path = %self.path.display(),
                error = %err,
                "telemetry write failed"
            );
        }
    }

    fn append_event_line(&self, value: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create telemetry directory '{}'",
                    parent.display()
                )
            })?;
        }

        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open telemetry path '{}'", self.path.display()))?;

        serde_json::to_writer(&mut file, value).context("failed to serialize telemetry event")?;
        writeln!(file).context("failed to write telemetry newline")
    }
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    /// Events per `agent/flow`.
    pub flow_counts: HashMap<String, usize>,
    pub cycles_started: usize,
    pub cycles_completed: usize,
    pub cycles_failed: usize,
    pub overlap_skips: usize,
    pub gaps_resolved: usize,
    pub gaps_failed: usize,
    pub last_event_ts_unix_ms: Option<u128>,
}

pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary::default();
    let max_events = limit.max(1);
    summary.total_lines = lines.len();

    for line in lines.into_iter().rev().take(max_events) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match serde_json::from_str::<Value>(line) {
            Ok(value) => value,
            Err(_) => {
                summary.parse_errors += 1;
                continue;
            }
        };

        summary.parsed_events += 1;

        if let Some(run_id) = parsed.get("run_id").and_then(Value::as_str)
            && !run_id.is_empty()
        {
            summary.unique_runs.insert(run_id.to_string());
        }

        let agent = parsed.get("agent").and_then(Value::as_str).unwrap_or_default();
        let flow = parsed.get("flow").and_then(Value::as_str).unwrap_or_default();
        if !agent.is_empty() {
            *summary
                .flow_counts
                .entry(format!("{agent}/{flow}"))
                .or_insert(0) += 1;
        }

        if let Some(ts) = parsed.get("ts_unix_ms").and_then(Value::as_u64) {
            let ts_u128 = ts as u128;
            summary.last_event_ts_unix_ms = Some(
                summary
                    .last_event_ts_unix_ms
                    .map(|existing| existing.max(ts_u128))
                    .unwrap_or(ts_u128),
            );
        }

        match parsed
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
        {
            CYCLE_STARTED => summary.cycles_started += 1,
            CYCLE_COMPLETED => summary.cycles_completed += 1,
            CYCLE_FAILED => summary.cycles_failed += 1,
            CYCLE_OVERLAP_SKIPPED => summary.overlap_skips += 1,
            GAP_RESOLVED => summary.gaps_resolved += 1,
            GAP_FAILED => summary.gaps_failed += 1,
            _ => {}
        }
    }

    summary
}

pub fn format_telemetry_report(path: &Path, summary: &TelemetrySummary) -> String {
    let mut flows = summary.flow_counts.iter().collect::<Vec<_>>();
    flows.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), (*name).clone()));

    let mut out = String::new();
    out.push_str("Telemetry report\n");
    out.push_str(&format!("Path: {}\n", path.display()));
    out.push_str(&format!("Lines in file: {}\n", summary.total_lines));
    out.push_str(&format!(
        "Events analyzed: {} (parse_errors={})\n",
        summary.parsed_events, summary.parse_errors
    ));
    out.push_str(&format!("Unique runs: {}\n", summary.unique_runs.len()));
    out.push_str(&format!(
        "Cycles: started={} completed={} failed={} overlap_skipped={}\n",
        summary.cycles_started,
        summary.cycles_completed,
        summary.cycles_failed,
        summary.overlap_skips
    ));
    out.push_str(&format!(
        "Gaps: resolved={} failed={}\n",
        summary.gaps_resolved, summary.gaps_failed
    ));

    if !flows.is_empty() {
        out.push_str("Busiest flows:\n");
        for (name, count) in flows.into_iter().take(5) {
            out.push_str(&format!("- {name}: {count}\n"));
        }
    }

    if let Some(last_ts) = summary.last_event_ts_unix_ms {
        out.push_str(&format!("Last event ts_unix_ms: {last_ts}\n"));
    }
    out
}

pub fn run_telemetry_report(path: &Path, limit: usize) -> Result<()> {
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    let reader = io::BufReader::new(file);
    let lines = reader
        .lines()
        .collect::<std::result::Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;

    let summary = summarize_telemetry_lines(lines, limit);
    print!("{}", format_telemetry_report(path, &summary));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn emit_appends_jsonl_records() {
        let dir = tempdir().expect("temp directory should create");
        let path = dir.path().join("telemetry/events.jsonl");
        let sink = TelemetrySink::at_path(true, path.clone());
        sink.emit(CYCLE_STARTED, "mcp", "research", json!({"trigger": "schedule"}));
        sink.emit(GAP_RESOLVED, "mcp", "research", json!({"gap_id": "gap-1"}));

        let raw = std::fs::read_to_string(&path).expect("telemetry should be readable");
        let lines = raw.lines().collect::<Vec<&str>>();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).expect("line should parse");
        assert_eq!(first["event"], CYCLE_STARTED);
        assert_eq!(first["agent"], "mcp");
        assert_eq!(first["trigger"], "schedule");
        assert_eq!(first["run_id"], sink.run_id.as_str());
    }

    #[test]
    fn disabled_sink_writes_nothing() {
        let dir = tempdir().expect("temp directory should create");
        let path = dir.path().join("events.jsonl");
        let sink = TelemetrySink::at_path(false, path.clone());
        sink.emit(CYCLE_STARTED, "mcp", "research", json!({}));
        assert!(!path.exists());
    }

    #[test]
    fn summary_counts_cycle_and_gap_events() {
        let lines = vec![
            r#"{"ts_unix_ms":1,"event":"cycle.started","run_id":"r1","agent":"mcp","flow":"research"}"#,
            r#"{"ts_unix_ms":2,"event":"gap.resolved","run_id":"r1","agent":"mcp","flow":"research"}"#,
            r#"{"ts_unix_ms":3,"event":"gap.failed","run_id":"r1","agent":"mcp","flow":"research"}"#,
            r#"{"ts_unix_ms":4,"event":"cycle.completed","run_id":"r1","agent":"mcp","flow":"research"}"#,
            r#"{"ts_unix_ms":5,"event":"cycle.overlap_skipped","run_id":"r2","agent":"mcp","flow":"nightly"}"#,
            "not json",
        ]
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<String>>();

        let summary = summarize_telemetry_lines(lines, 100);
        assert_eq!(summary.parsed_events, 5);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.unique_runs.len(), 2);
        assert_eq!(summary.cycles_started, 1);
        assert_eq!(summary.cycles_completed, 1);
        assert_eq!(summary.overlap_skips, 1);
        assert_eq!(summary.gaps_resolved, 1);
        assert_eq!(summary.gaps_failed, 1);
        assert_eq!(summary.flow_counts.get("mcp/research"), Some(&4));
        assert_eq!(summary.last_event_ts_unix_ms, Some(5));

        let report = format_telemetry_report(Path::new("events.jsonl"), &summary);
        assert!(report.contains("Cycles: started=1 completed=1 failed=0 overlap_skipped=1"));
        assert!(report.contains("- mcp/research: 4"));
    }

    #[test]
    fn summary_respects_limit_from_the_tail() {
        let lines = (0..10)
            .map(|i| format!(r#"{{"ts_unix_ms":{i},"event":"gap.resolved","agent":"a","flow":"f"}}"#))
            .collect::<Vec<String>>();
        let summary = summarize_telemetry_lines(lines, 3);
        assert_eq!(summary.parsed_events, 3);
        assert_eq!(summary.last_event_ts_unix_ms, Some(9));
    }
}
