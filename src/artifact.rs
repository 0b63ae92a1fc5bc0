/// Knowledge artifact document format.
///
/// Artifacts are markdown files with a small front-matter block, the compiled
/// body, and a trailing `## References` section that lists citations.
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const REFERENCES_HEADING: &str = "## References";
const FRONT_MATTER_FENCE: &str = "---";
const MAX_FILENAME_STEM: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeArtifact {
    pub title: String,
    pub body: String,
    pub citations: Vec<Citation>,
    pub created_at: DateTime<Utc>,
    pub source_gap_id: String,
}

/// Checkpoint-side reference to a written artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub gap_id: String,
    pub gap_description: String,
    pub title: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeArtifact {
    pub fn new(
        title: &str,
        body: &str,
        citations: Vec<Citation>,
        source_gap_id: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            title: single_line(title),
            body: body.trim().to_string(),
            citations,
            created_at,
            source_gap_id: source_gap_id.to_string(),
        }
    }

    /// `<sanitized-title>_<unix-seconds>.md`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.md",
            sanitize_title(&self.title),
            self.created_at.timestamp()
        )
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(FRONT_MATTER_FENCE);
        out.push('\n');
        out.push_str(&format!("title: {}\n", self.title));
        out.push_str(&format!(
            "created_at: {}\n",
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        out.push_str(&format!("source_gap_id: {}\n", self.source_gap_id));
        out.push_str(FRONT_MATTER_FENCE);
        out.push_str("\n\n");
        out.push_str(&self.body);
        out.push_str("\n\n");
        out.push_str(REFERENCES_HEADING);
        out.push_str("\n\n");
        for (index, citation) in self.citations.iter().enumerate() {
            out.push_str(&format!(
                "{}. [{}]({})\n",
                index + 1,
                escape_link_text(&single_line(&citation.title)),
                citation.url
            ));
        }
        out
    }

    pub fn parse_markdown(text: &str) -> Result<Self, String> {
        let rest = text
            .strip_prefix(FRONT_MATTER_FENCE)
            .and_then(|rest| rest.strip_prefix('\n'))
            .ok_or_else(|| "missing front matter".to_string())?;
        let fence_end = rest
            .find(&format!("\n{FRONT_MATTER_FENCE}\n"))
            .ok_or_else(|| "unterminated front matter".to_string())?;
        let front = &rest[..fence_end];
        let content = &rest[fence_end + FRONT_MATTER_FENCE.len() + 2..];

        let mut title = None;
        let mut created_at = None;
        let mut source_gap_id = None;
        for line in front.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "title" => title = Some(value.to_string()),
                "created_at" => {
                    created_at = Some(
                        DateTime::parse_from_rfc3339(value)
                            .map_err(|err| format!("invalid created_at '{value}': {err}"))?
                            .with_timezone(&Utc),
                    )
                }
                "source_gap_id" => source_gap_id = Some(value.to_string()),
                _ => {}
            }
        }

        let marker = format!("\n{REFERENCES_HEADING}\n");
        let (body, references) = match content.rfind(&marker) {
            Some(index) => (&content[..index], &content[index + marker.len()..]),
            None => (content, ""),
        };
        let citations = references
            .lines()
            .filter_map(parse_citation_line)
            .collect::<Vec<Citation>>();

        Ok(Self {
            title: title.ok_or_else(|| "missing title".to_string())?,
            body: body.trim().to_string(),
            citations,
            created_at: created_at.ok_or_else(|| "missing created_at".to_string())?,
            source_gap_id: source_gap_id.unwrap_or_default(),
        })
    }
}

fn parse_citation_line(line: &str) -> Option<Citation> {
    let line = line.trim();
    let (_, rest) = line.split_once(". [")?;
    let mut title = String::new();
    let mut chars = rest.char_indices();
    let mut url_start = None;
    while let Some((index, ch)) = chars.next() {
        match ch {
            '\\' => title.push(chars.next()?.1),
            ']' => {
                url_start = Some(index + 1);
                break;
            }
            _ => title.push(ch),
        }
    }
    let url = rest[url_start?..].strip_prefix('(')?.strip_suffix(')')?;
    Some(Citation {
        title,
        url: url.to_string(),
    })
}

/// Escapes `\` and `]` so link text survives a read back.
fn escape_link_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | ']') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Lowercase, `_`-separated, ASCII-only file stem derived from a title.
pub fn sanitize_title(title: &str) -> String {
    let mut stem = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            stem.push(ch.to_ascii_lowercase());
        } else if !stem.ends_with('_') && !stem.is_empty() {
            stem.push('_');
        }
    }
    let mut stem = stem.trim_end_matches('_').to_string();
    if stem.len() > MAX_FILENAME_STEM {
        stem.truncate(MAX_FILENAME_STEM);
        stem = stem.trim_end_matches('_').to_string();
    }
    if stem.is_empty() {
        "untitled".to_string()
    } else {
        stem
    }
}

/// Title from a leading markdown heading, else the fallback.
pub fn extract_title(text: &str, fallback: &str) -> String {
    text.lines()
        .find(|line| !line.trim().is_empty())
        .filter(|line| line.trim_start().starts_with('#'))
        .map(|line| line.trim().trim_start_matches('#').trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| single_line(fallback))
}

/// Drops a trailing references section produced by the model; the document
/// writer renders its own from the citation list.
pub fn strip_references_section(text: &str) -> &str {
    let lower = text.to_ascii_lowercase();
    for heading in ["\n## references", "\n# references", "\n### references"] {
        if let Some(index) = lower.rfind(heading) {
            return text[..index].trim_end();
        }
    }
    text.trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> KnowledgeArtifact {
        KnowledgeArtifact::new(
            "MCP Transport: stdio vs SSE",
            "# MCP Transport\n\nServers speak JSON-RPC [1] over stdio or SSE [2].\n\n## Details\n\nMore text.",
            vec![
                Citation {
                    title: "Guide overview".to_string(),
                    url: "https://example.org/guide".to_string(),
                },
                Citation {
                    title: "Transport guide".to_string(),
                    url: "https://example.org/transport?x=1".to_string(),
                },
            ],
            "gap-0123456789ab",
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap(),
        )
    }

    #[test]
    fn markdown_round_trip_preserves_fields() {
        let artifact = sample();
        let parsed = KnowledgeArtifact::parse_markdown(&artifact.to_markdown())
            .expect("artifact should parse");
        assert_eq!(parsed, artifact);
    }

    #[test]
    fn bracketed_citation_titles_survive_a_read_back() {
        let mut artifact = sample();
        artifact.citations[0].title = "[PDF] MCP specification".to_string();
        artifact.citations[1].title = r"Paths like C:\mcp\[x] and a]b".to_string();
        let markdown = artifact.to_markdown();
        assert!(markdown.contains(r"1. [[PDF\] MCP specification](https://example.org/guide)"));
        let parsed = KnowledgeArtifact::parse_markdown(&markdown).expect("artifact should parse");
        assert_eq!(parsed.citations, artifact.citations);
    }

    #[test]
    fn round_trip_with_body_mentioning_references() {
        let mut artifact = sample();
        artifact.body = "See the section below.\n\n## References\n\nold list".to_string();
        artifact.citations.truncate(1);
        let parsed = KnowledgeArtifact::parse_markdown(&artifact.to_markdown())
            .expect("artifact should parse");
        assert_eq!(parsed.body, artifact.body);
        assert_eq!(parsed.citations, artifact.citations);
    }

    #[test]
    fn file_name_is_deterministic() {
        let artifact = sample();
        assert_eq!(
            artifact.file_name(),
            format!("mcp_transport_stdio_vs_sse_{}.md", artifact.created_at.timestamp())
        );
        assert_eq!(sanitize_title("  ::  "), "untitled");
        assert!(sanitize_title(&"long title ".repeat(20)).len() <= MAX_FILENAME_STEM);
    }

    #[test]
    fn extract_title_prefers_heading() {
        assert_eq!(extract_title("\n# Tool Schemas\nbody", "gap"), "Tool Schemas");
        assert_eq!(extract_title("plain body", "Missing  knowledge"), "Missing knowledge");
    }

    #[test]
    fn strip_references_section_removes_model_list() {
        let text = "# Title\n\nBody [1].\n\n## References\n1. https://a";
        assert_eq!(strip_references_section(text), "# Title\n\nBody [1].");
        assert_eq!(strip_references_section("Body only\n"), "Body only");
    }

    #[test]
    fn parse_rejects_missing_front_matter() {
        assert!(KnowledgeArtifact::parse_markdown("# just markdown").is_err());
    }
}
