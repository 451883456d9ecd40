//! Swarm input resolution — turning a user message into a list of work items.
//!
//! Sources are tried in priority order:
//!
//! 1. an inline JSON array in the message,
//! 2. attached files (JSON array or one item per line),
//! 3. the swarm's configured input command (with `{{param}}` substitution
//!    from the message),
//! 4. a backtick-delimited inline command.
//!
//! Resolving zero items is an input error, not an empty job.

use std::process::Stdio;

use regex::Regex;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use hivebot_core::config::{InputKind, SwarmInput, SwarmSpec};

use super::SwarmError;

/// Resolve the item list for one swarm invocation.
pub async fn resolve_items(
    spec: &SwarmSpec,
    payload: &str,
    attached_files: &[String],
) -> Result<Vec<String>, SwarmError> {
    if let Some(items) = inline_json_items(payload) {
        debug!(count = items.len(), "items from inline JSON array");
        return Ok(items);
    }

    let from_files = attached_file_items(attached_files);
    if !from_files.is_empty() {
        debug!(count = from_files.len(), "items from attached files");
        return Ok(from_files);
    }

    if let Some(input) = &spec.input {
        let command = substitute_params(&input.command, payload);
        let stdout = run_shell(&command).await?;
        let items = parse_output(&stdout, input.kind)?;
        debug!(count = items.len(), command = %command, "items from input command");
        if items.is_empty() {
            return Err(SwarmError::NoInput);
        }
        return Ok(items);
    }

    if let Some(command) = backtick_command(payload) {
        let stdout = run_shell(&command).await?;
        let items = parse_output(&stdout, InputKind::Lines)?;
        debug!(count = items.len(), command = %command, "items from inline command");
        if items.is_empty() {
            return Err(SwarmError::NoInput);
        }
        return Ok(items);
    }

    Err(SwarmError::NoInput)
}

// ─────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────

/// Parse an inline JSON array out of the message, if one is present.
fn inline_json_items(text: &str) -> Option<Vec<String>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    let candidate = &text[start..=end];
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Array(elements)) if !elements.is_empty() => {
            Some(elements.iter().map(stringify_element).collect())
        }
        _ => None,
    }
}

/// One item per non-empty line, or a whole-file JSON array.
fn attached_file_items(files: &[String]) -> Vec<String> {
    let mut items = Vec::new();
    for path in files {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path, error = %e, "attached file unreadable, skipped");
                continue;
            }
        };
        if let Ok(Value::Array(elements)) = serde_json::from_str::<Value>(content.trim()) {
            items.extend(elements.iter().map(stringify_element));
        } else {
            items.extend(split_lines(&content));
        }
    }
    items
}

/// First backtick-delimited command in the message.
fn backtick_command(text: &str) -> Option<String> {
    let re = Regex::new(r"`([^`]+)`").unwrap();
    re.captures(text).map(|cap| cap[1].trim().to_string())
}

// ─────────────────────────────────────────────
// Parameter substitution
// ─────────────────────────────────────────────

/// Substitute `{{param}}` placeholders from the user message.
///
/// `{{repo}}` takes the first `owner/name` token, `{{limit}}` the first
/// numeric token; explicit `key=value` pairs substitute verbatim and override
/// the pattern-derived values.
pub fn substitute_params(command: &str, user_message: &str) -> String {
    let mut out = command.to_string();

    let repo_re = Regex::new(r"\b([A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+)\b").unwrap();
    if let Some(cap) = repo_re.captures(user_message) {
        if explicit_value(user_message, "repo").is_none() {
            out = out.replace("{{repo}}", &cap[1]);
        }
    }

    let limit_re = Regex::new(r"\b(\d+)\b").unwrap();
    if let Some(cap) = limit_re.captures(user_message) {
        if explicit_value(user_message, "limit").is_none() {
            out = out.replace("{{limit}}", &cap[1]);
        }
    }

    let pair_re = Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)=(\S+)").unwrap();
    for cap in pair_re.captures_iter(user_message) {
        out = out.replace(&format!("{{{{{}}}}}", &cap[1]), &cap[2]);
    }

    out
}

fn explicit_value(user_message: &str, key: &str) -> Option<String> {
    let re = Regex::new(&format!(r"\b{key}=(\S+)")).unwrap();
    re.captures(user_message).map(|cap| cap[1].to_string())
}

// ─────────────────────────────────────────────
// Command execution & parsing
// ─────────────────────────────────────────────

async fn run_shell(command: &str) -> Result<String, SwarmError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SwarmError::InputCommand(format!("failed to run `{command}`: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SwarmError::InputCommand(format!(
            "`{command}` exited with {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn parse_output(stdout: &str, kind: InputKind) -> Result<Vec<String>, SwarmError> {
    match kind {
        InputKind::Lines => Ok(split_lines(stdout)),
        InputKind::JsonArray => match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(Value::Array(elements)) => Ok(elements.iter().map(stringify_element).collect()),
            Ok(_) => Err(SwarmError::InputParse(
                "command output is valid JSON but not an array".into(),
            )),
            Err(e) => Err(SwarmError::InputParse(format!(
                "command output is not a JSON array: {e}"
            ))),
        },
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn stringify_element(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build a minimal `SwarmInput` (used by tests and config tooling).
pub fn input_of(command: &str, kind: InputKind) -> SwarmInput {
    SwarmInput {
        command: command.to_string(),
        kind,
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_input(input: Option<SwarmInput>) -> SwarmSpec {
        let mut spec: SwarmSpec = serde_json::from_value(serde_json::json!({
            "id": "s", "name": "S", "agent": "a", "promptTemplate": "p"
        }))
        .unwrap();
        spec.input = input;
        spec
    }

    #[tokio::test]
    async fn test_inline_json_array_wins() {
        let spec = spec_with_input(Some(input_of("echo never-run", InputKind::Lines)));
        let items = resolve_items(&spec, "please process [1, \"two\", 3]", &[])
            .await
            .unwrap();
        assert_eq!(items, vec!["1", "two", "3"]);
    }

    #[tokio::test]
    async fn test_attached_file_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("items.txt");
        std::fs::write(&file, "alpha\n\nbeta\n  gamma  \n").unwrap();

        let spec = spec_with_input(None);
        let items = resolve_items(&spec, "see attachment", &[file.display().to_string()])
            .await
            .unwrap();
        assert_eq!(items, vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn test_attached_file_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("items.json");
        std::fs::write(&file, r#"["x", {"id": 1}]"#).unwrap();

        let spec = spec_with_input(None);
        let items = resolve_items(&spec, "go", &[file.display().to_string()])
            .await
            .unwrap();
        assert_eq!(items, vec!["x", r#"{"id":1}"#]);
    }

    #[tokio::test]
    async fn test_input_command_lines() {
        let spec = spec_with_input(Some(input_of("printf 'one\\ntwo\\n'", InputKind::Lines)));
        let items = resolve_items(&spec, "run it", &[]).await.unwrap();
        assert_eq!(items, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_input_command_json_array() {
        let spec = spec_with_input(Some(input_of("echo '[\"a\",\"b\"]'", InputKind::JsonArray)));
        let items = resolve_items(&spec, "run it", &[]).await.unwrap();
        assert_eq!(items, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_input_command_failure() {
        let spec = spec_with_input(Some(input_of("exit 3", InputKind::Lines)));
        let err = resolve_items(&spec, "run it", &[]).await.unwrap_err();
        assert!(matches!(err, SwarmError::InputCommand(_)));
    }

    #[tokio::test]
    async fn test_input_command_bad_json() {
        let spec = spec_with_input(Some(input_of("echo not-json", InputKind::JsonArray)));
        let err = resolve_items(&spec, "run it", &[]).await.unwrap_err();
        assert!(matches!(err, SwarmError::InputParse(_)));
    }

    #[tokio::test]
    async fn test_backtick_command() {
        let spec = spec_with_input(None);
        let items = resolve_items(&spec, "process `printf 'x\\ny\\n'` for me", &[])
            .await
            .unwrap();
        assert_eq!(items, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_no_input() {
        let spec = spec_with_input(None);
        let err = resolve_items(&spec, "nothing to see", &[]).await.unwrap_err();
        assert!(matches!(err, SwarmError::NoInput));
    }

    #[test]
    fn test_substitute_repo_and_limit() {
        let out = substitute_params(
            "gh issue list -R {{repo}} -L {{limit}}",
            "scan rust-lang/cargo for the top 50 issues",
        );
        assert_eq!(out, "gh issue list -R rust-lang/cargo -L 50");
    }

    #[test]
    fn test_substitute_explicit_pairs_override() {
        let out = substitute_params(
            "scan {{repo}} --depth {{depth}}",
            "repo=octo/hive depth=3 also mentions other/name",
        );
        assert_eq!(out, "scan octo/hive --depth 3");
    }

    #[test]
    fn test_substitute_unknown_placeholder_untouched() {
        let out = substitute_params("run {{mystery}}", "no pairs here");
        assert_eq!(out, "run {{mystery}}");
    }

    #[test]
    fn test_inline_json_ignores_invalid() {
        assert!(inline_json_items("this [is not json] at all").is_none());
        assert!(inline_json_items("no brackets").is_none());
        assert!(inline_json_items("empty []").is_none());
    }

    #[test]
    fn test_inline_json_mixed_types() {
        let items = inline_json_items(r#"go [true, 2, "three", {"k":1}]"#).unwrap();
        assert_eq!(items, vec!["true", "2", "three", r#"{"k":1}"#]);
    }
}
