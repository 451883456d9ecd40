//! Memory context composer — per-agent on-disk memory, assembled per invocation.
//!
//! Each agent working directory may carry a `memory/` tree:
//!
//! ```text
//! memory/knowledge.md          free-form knowledge base
//! memory/reflections.jsonl     {ts, type, context, lesson, action?}
//! memory/episodes.jsonl        {ts, user, summary, tags[], outcome}
//! memory/skills/index.json     skill id → description
//! memory/skills/<id>.md        procedure text
//! ```
//!
//! The composer reads this tree and prepends a `[MEMORY]` block to the prompt
//! when any section is non-empty. Missing files read as empty; malformed JSONL
//! lines are skipped. The composer is pure over the file system state at the
//! moment of invocation: two calls over unchanged files produce byte-identical
//! blocks.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

/// Knowledge files containing this substring are treated as empty.
const KNOWLEDGE_PLACEHOLDER: &str = "_No entries yet";

/// Number of trailing reflections included.
const RECENT_REFLECTIONS: usize = 10;

/// Number of top-scoring episodes included.
const TOP_EPISODES: usize = 3;

/// Words at or below this length are ignored when matching.
const MIN_MATCH_WORD_LEN: usize = 3;

// ─────────────────────────────────────────────
// Record types
// ─────────────────────────────────────────────

/// Classification of a reflection entry. Unknown tags pass through verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReflectionKind {
    Failure,
    Success,
    Insight,
    Other(String),
}

impl From<&str> for ReflectionKind {
    fn from(tag: &str) -> Self {
        match tag {
            "failure" => ReflectionKind::Failure,
            "success" => ReflectionKind::Success,
            "insight" => ReflectionKind::Insight,
            other => ReflectionKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ReflectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReflectionKind::Failure => write!(f, "failure"),
            ReflectionKind::Success => write!(f, "success"),
            ReflectionKind::Insight => write!(f, "insight"),
            ReflectionKind::Other(tag) => write!(f, "{tag}"),
        }
    }
}

/// One line of `reflections.jsonl`. Everything but `ts` is optional in
/// practice; parsing is deliberately lenient.
#[derive(Debug, Deserialize)]
struct ReflectionRecord {
    #[serde(default)]
    #[allow(dead_code)]
    ts: Option<serde_json::Value>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    lesson: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

/// One line of `episodes.jsonl`.
#[derive(Debug, Deserialize)]
struct EpisodeRecord {
    #[serde(default)]
    #[allow(dead_code)]
    ts: Option<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    user: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    outcome: Option<String>,
}

// ─────────────────────────────────────────────
// Composer
// ─────────────────────────────────────────────

/// Build the memory block for one invocation, or `None` when empty.
pub fn compose(workdir: &Path, user_message: &str) -> Option<String> {
    let memory_dir = workdir.join("memory");

    let mut sections = Vec::new();
    if let Some(s) = knowledge_section(&memory_dir) {
        sections.push(s);
    }
    if let Some(s) = reflections_section(&memory_dir) {
        sections.push(s);
    }
    if let Some(s) = episodes_section(&memory_dir, user_message) {
        sections.push(s);
    }
    if let Some(s) = skills_section(&memory_dir, user_message) {
        sections.push(s);
    }

    if sections.is_empty() {
        None
    } else {
        Some(format!("[MEMORY]\n{}\n[/MEMORY]\n\n", sections.join("\n\n")))
    }
}

/// Prepend the memory block (if any) to the user message.
pub fn compose_prompt(workdir: &Path, user_message: &str) -> String {
    match compose(workdir, user_message) {
        Some(block) => format!("{block}{user_message}"),
        None => user_message.to_string(),
    }
}

// ────────────── Sections ──────────────

fn knowledge_section(memory_dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(memory_dir.join("knowledge.md")).ok()?;
    if content.trim().is_empty() || content.contains(KNOWLEDGE_PLACEHOLDER) {
        return None;
    }
    Some(format!("## Knowledge\n{}", content.trim_end()))
}

fn reflections_section(memory_dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(memory_dir.join("reflections.jsonl")).ok()?;

    let parsed: Vec<ReflectionRecord> = content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    if parsed.is_empty() {
        return None;
    }

    let start = parsed.len().saturating_sub(RECENT_REFLECTIONS);
    let lines: Vec<String> = parsed[start..].iter().map(render_reflection).collect();
    Some(format!("## Recent reflections\n{}", lines.join("\n")))
}

fn render_reflection(r: &ReflectionRecord) -> String {
    let kind = ReflectionKind::from(r.kind.as_deref().unwrap_or(""));
    let context = r.context.as_deref().unwrap_or("");
    let lesson = r.lesson.as_deref().unwrap_or("");
    match r.action.as_deref() {
        Some(action) if !action.is_empty() => {
            format!("- [{kind}] {context}: {lesson} → {action}")
        }
        _ => format!("- [{kind}] {context}: {lesson}"),
    }
}

fn episodes_section(memory_dir: &Path, user_message: &str) -> Option<String> {
    let content = std::fs::read_to_string(memory_dir.join("episodes.jsonl")).ok()?;
    let words = match_words(user_message);
    if words.is_empty() {
        return None;
    }

    let mut scored: Vec<(usize, EpisodeRecord)> = content
        .lines()
        .filter_map(|line| serde_json::from_str::<EpisodeRecord>(line).ok())
        .filter_map(|episode| {
            let haystack = format!(
                "{} {}",
                episode.summary.as_deref().unwrap_or(""),
                episode.tags.join(" ")
            )
            .to_lowercase();
            let score = words.iter().filter(|w| haystack.contains(w.as_str())).count();
            (score > 0).then_some((score, episode))
        })
        .collect();

    if scored.is_empty() {
        return None;
    }

    // Stable sort: ties keep file order.
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    let lines: Vec<String> = scored
        .iter()
        .take(TOP_EPISODES)
        .map(|(_, e)| {
            format!(
                "- [{}] {} ({})",
                e.outcome.as_deref().unwrap_or("unknown"),
                e.summary.as_deref().unwrap_or(""),
                e.tags.join(", ")
            )
        })
        .collect();
    Some(format!("## Relevant episodes\n{}", lines.join("\n")))
}

fn skills_section(memory_dir: &Path, user_message: &str) -> Option<String> {
    let skills_dir = memory_dir.join("skills");
    let content = std::fs::read_to_string(skills_dir.join("index.json")).ok()?;
    // BTreeMap keeps skill order deterministic across invocations.
    let index: BTreeMap<String, String> = serde_json::from_str(&content).ok()?;

    let message = user_message.to_lowercase();
    let mut entries = Vec::new();

    for (id, description) in &index {
        let matched = description
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > MIN_MATCH_WORD_LEN)
            .any(|w| message.contains(w));
        if !matched {
            continue;
        }
        match std::fs::read_to_string(skills_dir.join(format!("{id}.md"))) {
            Ok(body) => entries.push(format!("### {id}\n{}", body.trim_end())),
            Err(e) => debug!(skill = %id, error = %e, "skill file unreadable, skipped"),
        }
    }

    if entries.is_empty() {
        None
    } else {
        Some(format!("## Relevant skills\n{}", entries.join("\n\n")))
    }
}

/// Lowercased words of the user message longer than the match threshold.
fn match_words(user_message: &str) -> Vec<String> {
    user_message
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > MIN_MATCH_WORD_LEN)
        .map(str::to_string)
        .collect()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
