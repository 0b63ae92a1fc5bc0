/// Knowledge gap model, deduplication and batch selection.
use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Pending,
    InProgress,
    Resolved,
}

/// A unit of missing knowledge tracked by the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGap {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    pub status: GapStatus,
    pub identified_at: DateTime<Utc>,
}

impl KnowledgeGap {
    pub fn new(description: &str, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: gap_id(description),
            description: description.trim().to_string(),
            priority,
            status: GapStatus::Pending,
            identified_at: now,
        }
    }
}

/// Gap candidate as returned by a gap-identifier plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedGap {
    pub description: String,
    pub priority: i32,
}

impl IdentifiedGap {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Lowercases, drops punctuation and collapses whitespace.
pub fn normalize_description(description: &str) -> String {
    description
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

pub fn gap_id(description: &str) -> String {
    let digest = format!("{:x}", md5::compute(normalize_description(description)));
    format!("gap-{}", &digest[..12])
}

/// Strips list markers and numbering from a model-produced line.
pub fn clean_gap_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let cleaned = trimmed
        .trim_start_matches(|c: char| {
            c.is_ascii_digit() || c.is_whitespace() || matches!(c, '*' | '-' | '.' | ')')
        })
        .trim_end_matches(|c: char| c == '*' || c.is_whitespace());
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

pub fn parse_gap_lines(text: &str, max_gaps: usize) -> Vec<IdentifiedGap> {
    text.lines()
        .filter_map(clean_gap_line)
        .take(max_gaps)
        .map(IdentifiedGap::new)
        .collect()
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

/// Rejects candidates whose id is already known or whose normalized
/// description is at least `threshold` similar to a known description.
#[derive(Debug, Clone)]
pub struct GapDeduper {
    threshold: f64,
    ids: HashSet<String>,
    descriptions: Vec<String>,
}

impl GapDeduper {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            ids: HashSet::new(),
            descriptions: Vec::new(),
        }
    }

    pub fn remember_id(&mut self, id: &str) {
        self.ids.insert(id.to_string());
    }

    pub fn remember(&mut self, description: &str) {
        self.ids.insert(gap_id(description));
        self.descriptions.push(normalize_description(description));
    }

    pub fn is_duplicate(&self, description: &str) -> bool {
        if self.ids.contains(&gap_id(description)) {
            return true;
        }
        if self.threshold > 1.0 {
            return false;
        }
        let candidate = normalize_description(description);
        self.descriptions
            .iter()
            .any(|known| strsim::normalized_levenshtein(known, &candidate) >= self.threshold)
    }

    /// Remembers the description and returns true when it was not a duplicate.
    pub fn admit(&mut self, description: &str) -> bool {
        if normalize_description(description).is_empty() || self.is_duplicate(description) {
            return false;
        }
        self.remember(description);
        true
    }
}

/// Appends non-duplicate candidates to `pending` and returns the admitted gaps.
pub fn merge_identified_gaps(
    pending: &mut Vec<KnowledgeGap>,
    completed: &BTreeSet<String>,
    resolved_descriptions: &[String],
    candidates: Vec<IdentifiedGap>,
    similarity_threshold: f64,
    now: DateTime<Utc>,
) -> Vec<KnowledgeGap> {
    let mut deduper = GapDeduper::new(similarity_threshold);
    for id in completed {
        deduper.remember_id(id);
    }
    for description in resolved_descriptions {
        deduper.remember(description);
    }
    for gap in pending.iter() {
        deduper.remember(&gap.description);
    }

    let mut admitted = Vec::new();
    for candidate in candidates {
        if !deduper.admit(&candidate.description) {
            tracing::debug!(description = %candidate.description, "skipping duplicate gap");
            continue;
        }
        let gap = KnowledgeGap::new(&candidate.description, candidate.priority, now);
        pending.push(gap.clone());
        admitted.push(gap);
    }
    admitted
}

/// Picks up to `max` gaps, highest priority first, FIFO among equals.
pub fn select_batch(pending: &[KnowledgeGap], max: usize) -> Vec<KnowledgeGap> {
    let mut ordered = pending.iter().collect::<Vec<&KnowledgeGap>>();
    // stable sort keeps insertion order for ties
    ordered.sort_by_key(|gap| std::cmp::Reverse(gap.priority));
    ordered.into_iter().take(max).cloned().collect()
}
