//! Worker invoker — launches agent CLI subprocesses and captures their output.
//!
//! Each configured agent is bound to a provider CLI:
//!
//! - `anthropic` → the `claude` binary; the response is plain stdout.
//! - `openai` → the `codex` binary in `exec --json` mode; stdout is a JSONL
//!   event stream and the response is the text of the final completed
//!   `agent_message` item.
//!
//! Invocations run in the agent's resolved working directory. Secrets and
//! other environment values are passed through `Command::env` only — never as
//! command-line arguments, which would be visible to `ps`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use hivebot_core::config::{AgentSpec, Provider};
use hivebot_core::events::{Event, EventSink, NullEventSink};

/// Stderr capture cap; stderr is only used for error reporting.
const STDERR_CAP_BYTES: usize = 64 * 1024;

/// Returned when a codex event stream carries no completed agent message.
pub const CODEX_EMPTY_FALLBACK: &str = "No response received from agent.";

// ─────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────

/// Failure modes of a worker invocation.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker binary could not be started (missing binary, bad permissions).
    #[error("failed to launch worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The subprocess exited non-zero.
    #[error("worker exited with status {code}: {stderr}")]
    Failed { code: i32, stderr: String },
    /// The subprocess exceeded the configured timeout and was killed.
    #[error("worker timed out after {secs}s")]
    TimedOut { secs: u64 },
}

impl WorkerError {
    /// Whether the failure is likely temporary (safe to retry inside a swarm).
    ///
    /// A missing binary is terminal; a non-zero exit or timeout may be a
    /// rate limit or a stuck session.
    pub fn is_transient(&self) -> bool {
        !matches!(self, WorkerError::Spawn { .. })
    }
}

// ─────────────────────────────────────────────
// WorkerInvoker trait
// ─────────────────────────────────────────────

/// The seam between the orchestration engine and agent subprocesses.
///
/// `fresh` requests a new conversation; otherwise the worker continues its
/// last session in that working directory.
#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentSpec,
        prompt: &str,
        fresh: bool,
    ) -> Result<String, WorkerError>;
}

// ─────────────────────────────────────────────
// CliWorkerInvoker
// ─────────────────────────────────────────────

/// Production invoker: spawns the provider CLI as a subprocess.
pub struct CliWorkerInvoker {
    /// Hive root; relative working directories resolve against it.
    root: PathBuf,
    timeout: Duration,
    stdout_cap: usize,
    /// Extra environment for worker processes (API keys, etc.).
    env: HashMap<String, String>,
    events: Arc<dyn EventSink>,
}

impl CliWorkerInvoker {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration, stdout_cap: usize) -> Self {
        Self {
            root: root.into(),
            timeout,
            stdout_cap,
            env: HashMap::new(),
            events: Arc::new(NullEventSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    async fn run(&self, agent: &AgentSpec, prompt: &str, fresh: bool) -> Result<String, WorkerError> {
        let (program, args) = build_command_line(agent, prompt, fresh);
        let workdir = resolve_workdir(&self.root, agent);
        if let Err(e) = std::fs::create_dir_all(&workdir) {
            warn!(agent = %agent.id, error = %e, "could not create worker directory");
        }

        debug!(agent = %agent.id, program = program, fresh = fresh, "invoking worker");

        let mut child = Command::new(program)
            .args(&args)
            .current_dir(&workdir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout_pipe = child.stdout.take().expect("stdout piped");
        let stderr_pipe = child.stderr.take().expect("stderr piped");
        let cap = self.stdout_cap;
        let stdout_task = tokio::spawn(read_capped(stdout_pipe, cap));
        let stderr_task = tokio::spawn(read_capped(stderr_pipe, STDERR_CAP_BYTES));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(WorkerError::Spawn {
                    program: program.to_string(),
                    source,
                })
            }
            Err(_) => {
                let _ = child.kill().await;
                warn!(agent = %agent.id, secs = self.timeout.as_secs(), "worker timed out");
                return Err(WorkerError::TimedOut {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, _) = stderr_task.await.unwrap_or_default();
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        if stdout_truncated {
            self.events.emit(Event::warn(
                "worker",
                "worker_stdout_truncated",
                json!({"agent": agent.id, "capBytes": cap}),
            ));
        }

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(WorkerError::Failed {
                code,
                stderr: stderr.trim().to_string(),
            });
        }

        let response = match agent.provider {
            Provider::Anthropic => stdout.trim().to_string(),
            Provider::OpenAi => parse_codex_response(&stdout),
        };

        info!(agent = %agent.id, response_len = response.len(), "worker finished");
        Ok(response)
    }
}

#[async_trait]
impl WorkerInvoker for CliWorkerInvoker {
    async fn invoke(
        &self,
        agent: &AgentSpec,
        prompt: &str,
        fresh: bool,
    ) -> Result<String, WorkerError> {
        self.run(agent, prompt, fresh).await
    }
}

// ─────────────────────────────────────────────
// Command construction
// ─────────────────────────────────────────────

/// Build the program name and argument vector for an invocation.
pub fn build_command_line(agent: &AgentSpec, prompt: &str, fresh: bool) -> (&'static str, Vec<String>) {
    match agent.provider {
        Provider::Anthropic => {
            let mut args = vec!["--dangerously-skip-permissions".to_string()];
            if let Some(model) = &agent.model {
                args.push("--model".into());
                args.push(model.clone());
            }
            if !fresh {
                args.push("-c".into());
            }
            args.push("-p".into());
            args.push(prompt.to_string());
            ("claude", args)
        }
        Provider::OpenAi => {
            let mut args = vec!["exec".to_string()];
            if !fresh {
                args.push("resume".into());
                args.push("--last".into());
            }
            if let Some(model) = &agent.model {
                args.push("--model".into());
                args.push(model.clone());
            }
            args.push("--skip-git-repo-check".into());
            args.push("--dangerously-bypass-approvals-and-sandbox".into());
            args.push("--json".into());
            args.push(prompt.to_string());
            ("codex", args)
        }
    }
}

/// Resolve an agent's working directory against the hive root.
pub fn resolve_workdir(root: &Path, agent: &AgentSpec) -> PathBuf {
    match &agent.working_directory {
        Some(dir) => {
            let path = PathBuf::from(dir);
            if path.is_absolute() {
                path
            } else {
                root.join(path)
            }
        }
        None => root.join("agents").join(&agent.id),
    }
}

/// Extract the final agent message from a codex `--json` event stream.
///
/// Each stdout line is a JSON event. The response is the `text` of the last
/// `item.completed` event whose item is an `agent_message`; anything else
/// (reasoning items, tool events, malformed lines) is skipped.
pub fn parse_codex_response(stdout: &str) -> String {
    let mut last: Option<String> = None;
    for line in stdout.lines() {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        if value.get("type").and_then(|t| t.as_str()) != Some("item.completed") {
            continue;
        }
        let Some(item) = value.get("item") else {
            continue;
        };
        if item.get("type").and_then(|t| t.as_str()) != Some("agent_message") {
            continue;
        }
        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
            last = Some(text.to_string());
        }
    }
    last.unwrap_or_else(|| CODEX_EMPTY_FALLBACK.to_string())
}

/// Read a stream to EOF, keeping at most `cap` bytes.
///
/// Keeps draining past the cap so the child never blocks on a full pipe.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < cap {
                    let take = n.min(cap - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (buf, truncated)
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
