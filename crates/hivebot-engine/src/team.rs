//! Team chain executor — sequential handoffs and parallel fan-out.
//!
//! A message addressed to a team enters at the leader. After each step, the
//! response is scanned for teammate mentions: none ends the chain, exactly one
//! hands off sequentially, and several fan out in parallel (fan-out results
//! are appended in mention order and then the chain terminates). The chain has
//! no a-priori depth bound; a warning event fires past a threshold and a hard
//! ceiling stops runaway mention cycles with a user-visible step.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use hivebot_core::config::Config;
use hivebot_core::events::{Event, EventSink};
use hivebot_core::layout::HiveLayout;
use hivebot_core::types::{extract_send_files, QueueMessage};
use hivebot_core::utils;
use hivebot_workers::invoker::resolve_workdir;
use hivebot_workers::{memory, ResetFlags, WorkerInvoker};

use crate::routing::extract_teammate_mentions;

/// Depth past which a warning event is emitted.
const DEPTH_WARN: usize = 10;

/// Hard ceiling; the chain is stopped with a user-visible step beyond this.
const DEPTH_LIMIT: usize = 50;

/// Separator between aggregated chain steps.
const STEP_SEPARATOR: &str = "\n\n---\n\n";

// ─────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────

/// One executed step of a chain.
#[derive(Clone, Debug)]
pub struct ChainStep {
    pub agent_id: String,
    pub response: String,
}

/// Final result of a chain run.
#[derive(Clone, Debug)]
pub struct ChainOutcome {
    /// Aggregated response text (single step verbatim, else `@id:` sections).
    pub message: String,
    /// Attachments collected from `[send_file: ...]` markers across steps.
    pub files: Vec<String>,
    pub steps: Vec<ChainStep>,
}

// ─────────────────────────────────────────────
// TeamChainExecutor
// ─────────────────────────────────────────────

/// Runs team chains over the worker invoker.
pub struct TeamChainExecutor {
    config: Arc<Config>,
    layout: HiveLayout,
    invoker: Arc<dyn WorkerInvoker>,
    events: Arc<dyn EventSink>,
}

impl TeamChainExecutor {
    pub fn new(
        config: Arc<Config>,
        layout: HiveLayout,
        invoker: Arc<dyn WorkerInvoker>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            layout,
            invoker,
            events,
        }
    }

    /// Execute a chain starting at `start_agent` and aggregate the result.
    pub async fn run(
        self: &Arc<Self>,
        team_id: &str,
        start_agent: &str,
        message: &str,
        origin: &QueueMessage,
    ) -> ChainOutcome {
        let Some(team) = self.config.find_team(team_id).cloned() else {
            return ChainOutcome {
                message: format!("Team `{team_id}` is not configured."),
                files: Vec::new(),
                steps: Vec::new(),
            };
        };

        self.events.emit(Event::info(
            "team",
            "team_chain_start",
            json!({"team": team_id, "leader": start_agent, "messageId": origin.message_id}),
        ));

        let resets = ResetFlags::new(self.layout.flags());
        let mut steps: Vec<ChainStep> = Vec::new();
        let mut files: Vec<String> = Vec::new();
        let mut current_agent = start_agent.to_string();
        let mut current_message = message.to_string();
        let mut depth = 0usize;
        let mut warned = false;

        loop {
            depth += 1;
            if depth > DEPTH_LIMIT {
                warn!(team = team_id, depth = depth, "chain depth ceiling reached");
                self.events.emit(Event::error(
                    "team",
                    "team_chain_depth_limit",
                    json!({"team": team_id, "depth": depth}),
                ));
                steps.push(ChainStep {
                    agent_id: current_agent.clone(),
                    response: format!(
                        "Team chain stopped after {DEPTH_LIMIT} steps; the remaining handoff was dropped."
                    ),
                });
                break;
            }
            if depth > DEPTH_WARN && !warned {
                warned = true;
                self.events.emit(Event::warn(
                    "team",
                    "team_chain_depth_warning",
                    json!({"team": team_id, "depth": depth}),
                ));
            }

            // The leader consumes the global flag; later steps only their own.
            let fresh = if depth == 1 {
                resets.consume_any(&current_agent)
            } else {
                resets.consume_for_agent(&current_agent)
            };

            self.events.emit(Event::info(
                "team",
                "team_chain_step_start",
                json!({"team": team_id, "agent": current_agent, "step": depth}),
            ));

            let raw = self.invoke_step(&current_agent, &current_message, fresh).await;
            let (clean, step_files) = extract_send_files(&raw);
            merge_files(&mut files, step_files);
            steps.push(ChainStep {
                agent_id: current_agent.clone(),
                response: clean.clone(),
            });

            self.events.emit(Event::info(
                "team",
                "team_chain_step_done",
                json!({"team": team_id, "agent": current_agent, "step": depth}),
            ));

            let teammates = team.teammates_of(&current_agent);
            let mentions = extract_teammate_mentions(&clean, &teammates);

            match mentions.len() {
                0 => break,
                1 => {
                    let mention = &mentions[0];
                    self.events.emit(Event::info(
                        "team",
                        "team_chain_handoff",
                        json!({"team": team_id, "from": current_agent, "to": mention.agent_id}),
                    ));
                    current_message = teammate_preface(&current_agent, &mention.body);
                    current_agent = mention.agent_id.clone();
                }
                _ => {
                    // Fan-out: all mentioned teammates in parallel, fresh
                    // conversations, then the chain ends.
                    let from = current_agent.clone();
                    let mut join_set = JoinSet::new();
                    for (idx, mention) in mentions.iter().enumerate() {
                        let executor = Arc::clone(self);
                        let agent_id = mention.agent_id.clone();
                        let prompt = teammate_preface(&from, &mention.body);
                        join_set.spawn(async move {
                            let raw = executor.invoke_step(&agent_id, &prompt, true).await;
                            (idx, agent_id, raw)
                        });
                    }

                    let mut results: Vec<(usize, String, String)> = Vec::new();
                    while let Some(joined) = join_set.join_next().await {
                        if let Ok(result) = joined {
                            results.push(result);
                        }
                    }
                    results.sort_by_key(|(idx, _, _)| *idx);

                    for (_, agent_id, raw) in results {
                        let (clean, step_files) = extract_send_files(&raw);
                        merge_files(&mut files, step_files);
                        self.events.emit(Event::info(
                            "team",
                            "team_chain_step_done",
                            json!({"team": team_id, "agent": agent_id, "fanOut": true}),
                        ));
                        steps.push(ChainStep {
                            agent_id,
                            response: clean,
                        });
                    }
                    break;
                }
            }
        }

        self.events.emit(Event::info(
            "team",
            "team_chain_end",
            json!({"team": team_id, "steps": steps.len()}),
        ));

        let message_text = aggregate(&steps);
        self.write_transcript(&team.name, team_id, origin, message, &steps);

        info!(team = team_id, steps = steps.len(), "team chain finished");
        ChainOutcome {
            message: message_text,
            files,
            steps,
        }
    }

    /// Invoke one agent, converting failures into a user-visible step.
    async fn invoke_step(&self, agent_id: &str, message: &str, fresh: bool) -> String {
        let Some(agent) = self.config.find_agent(agent_id) else {
            return format!("[{agent_id} is not a configured agent]");
        };
        let workdir = resolve_workdir(self.layout.root(), agent);
        let prompt = memory::compose_prompt(&workdir, message);

        debug!(agent = agent_id, fresh = fresh, "chain step invoking worker");
        match self.invoker.invoke(agent, &prompt, fresh).await {
            Ok(text) => text,
            Err(e) => {
                warn!(agent = agent_id, error = %e, "chain step failed");
                format!("[{agent_id} was unable to respond: {e}]")
            }
        }
    }

    /// Persist the chain transcript. Failures are logged and swallowed.
    fn write_transcript(
        &self,
        team_name: &str,
        team_id: &str,
        origin: &QueueMessage,
        user_message: &str,
        steps: &[ChainStep],
    ) {
        let dir = self.layout.team_chats(team_id);
        let path = dir.join(format!("{}.md", utils::file_timestamp()));

        let mut body = format!(
            "# {team_name}\n\n- When: {}\n- Channel: {} / {}\n- Steps: {}\n\n## User message\n\n{user_message}\n",
            utils::timestamp(),
            origin.channel,
            origin.sender,
            steps.len(),
        );
        for step in steps {
            body.push_str(&format!("\n## @{}\n\n{}\n", step.agent_id, step.response));
        }

        if let Err(e) = std::fs::create_dir_all(&dir).and_then(|_| std::fs::write(&path, body)) {
            warn!(path = %path.display(), error = %e, "failed to write chain transcript");
        }
    }

    #[cfg(test)]
    fn transcript_dir(&self, team_id: &str) -> std::path::PathBuf {
        self.layout.team_chats(team_id)
    }
}

/// Message format for a handoff or fan-out step.
fn teammate_preface(from: &str, body: &str) -> String {
    format!("[Message from teammate @{from}]:\n{body}")
}

/// Aggregate chain steps into the final response text.
fn aggregate(steps: &[ChainStep]) -> String {
    match steps {
        [only] => only.response.clone(),
        many => many
            .iter()
            .map(|s| format!("@{}: {}", s.agent_id, s.response))
            .collect::<Vec<_>>()
            .join(STEP_SEPARATOR),
    }
}

fn merge_files(into: &mut Vec<String>, new: Vec<String>) {
    for file in new {
        if !into.contains(&file) {
            into.push(file);
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
