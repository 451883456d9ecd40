//! Configuration schema — agent, team, and swarm records plus queue tuning.
//!
//! JSON on disk uses **camelCase** keys; Rust uses snake_case. The loader is
//! lenient (missing sections take defaults) but `Config::validate` is strict:
//! every cross-reference between teams, swarms, and agents must resolve.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fan-in for hierarchical reduction and the final shuffle merge.
pub const HIERARCHICAL_REDUCE_FANIN: usize = 20;

/// Hard cap on resolved swarm input items per job.
pub const MAX_SWARM_ITEMS: usize = 10_000;

// ─────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────

/// Which worker CLI an agent is bound to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// The `claude` CLI.
    Anthropic,
    /// The `codex` CLI.
    OpenAi,
}

/// One configured worker identity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Stable identifier; the keyspace for per-agent serialization.
    pub id: String,
    pub name: String,
    pub provider: Provider,
    /// Model identifier passed through to the worker CLI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Working directory, absolute or relative to the hive root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, provider: Provider) -> Self {
        AgentSpec {
            id: id.into(),
            name: name.into(),
            provider,
            model: None,
            working_directory: None,
        }
    }
}

// ─────────────────────────────────────────────
// Teams
// ─────────────────────────────────────────────

/// A named group of agents with a designated leader.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TeamSpec {
    pub id: String,
    pub name: String,
    /// Member agent ids (non-empty).
    pub agents: Vec<String>,
    /// Entry point for messages addressed to the team. Must be a member.
    pub leader_agent: String,
}

impl TeamSpec {
    /// Whether `agent_id` is a member of this team.
    pub fn has_member(&self, agent_id: &str) -> bool {
        self.agents.iter().any(|a| a == agent_id)
    }

    /// Members other than `agent_id`, in configured order.
    pub fn teammates_of(&self, agent_id: &str) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|a| a.as_str() != agent_id)
            .map(String::as_str)
            .collect()
    }
}

// ─────────────────────────────────────────────
// Swarms
// ─────────────────────────────────────────────

/// How raw input-command output is parsed into items.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Split on newline, drop empty lines.
    Lines,
    /// Parse as a JSON array, stringify each element.
    JsonArray,
}

/// Configured input source for a swarm.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SwarmInput {
    /// Shell command producing the items; supports `{{param}}` substitution.
    pub command: String,
    #[serde(rename = "type", default = "default_input_kind")]
    pub kind: InputKind,
}

fn default_input_kind() -> InputKind {
    InputKind::Lines
}

/// How items with more than one key value are grouped during shuffle.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MultiKey {
    /// Include the item under every produced key.
    Duplicate,
    /// Include only under the first key.
    First,
}

/// Shuffle-by-key phase configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShuffleSpec {
    /// Field read from each parsed map-output item.
    pub key_field: String,
    #[serde(default = "default_multi_key")]
    pub multi_key: MultiKey,
    /// Partitions larger than this are sub-split.
    #[serde(default = "default_max_partition_size")]
    pub max_partition_size: usize,
    /// Per-partition reducer prompt template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce_prompt: Option<String>,
    /// Final merge prompt template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_prompt: Option<String>,
}

fn default_multi_key() -> MultiKey {
    MultiKey::Duplicate
}

fn default_max_partition_size() -> usize {
    200
}

/// Reduction strategy when no shuffle is configured.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReduceStrategy {
    Concatenate,
    Summarize,
    Hierarchical,
}

/// Reduce phase configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReduceSpec {
    pub strategy: ReduceStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Reducer agent; defaults to the swarm's worker agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// A declarative map-reduce pipeline over many input items.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SwarmSpec {
    pub id: String,
    pub name: String,
    /// Worker agent id for the map phase.
    pub agent: String,
    /// Maximum concurrent worker invocations.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Items per map batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<SwarmInput>,
    /// Map prompt; rendered once per batch.
    pub prompt_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle: Option<ShuffleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<ReduceSpec>,
    /// Emit a progress message every N completed batches (0 disables).
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,
}

fn default_concurrency() -> usize {
    5
}

fn default_batch_size() -> usize {
    25
}

fn default_progress_interval() -> usize {
    10
}

impl SwarmSpec {
    /// Reducer agent id (explicit override, else the worker agent).
    pub fn reducer_agent(&self) -> &str {
        self.reduce
            .as_ref()
            .and_then(|r| r.agent.as_deref())
            .unwrap_or(&self.agent)
    }
}

// ─────────────────────────────────────────────
// Queue tuning
// ─────────────────────────────────────────────

/// Dispatcher and worker tuning knobs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Incoming directory poll interval.
    pub poll_interval_ms: u64,
    /// Worker subprocess timeout; on expiry the process is killed.
    pub worker_timeout_secs: u64,
    /// Per-invocation stdout capture cap in bytes.
    pub worker_stdout_cap_bytes: usize,
    /// Rollbacks of the same file before it is quarantined.
    pub deadletter_after: u32,
    /// Quiescence period before an idle per-key chain is reaped.
    pub chain_idle_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            worker_timeout_secs: 300,
            worker_stdout_cap_bytes: 10 * 1024 * 1024,
            deadletter_after: 5,
            chain_idle_secs: 30,
        }
    }
}

// ─────────────────────────────────────────────
// Root Config
// ─────────────────────────────────────────────

/// Root configuration — loaded from `config.json` under the hive root.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: Vec<AgentSpec>,
    pub teams: Vec<TeamSpec>,
    pub swarms: Vec<SwarmSpec>,
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agents: vec![AgentSpec::new("default", "Default", Provider::Anthropic)],
            teams: Vec::new(),
            swarms: Vec::new(),
            queue: QueueConfig::default(),
        }
    }
}

impl Config {
    pub fn find_agent(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn find_team(&self, id: &str) -> Option<&TeamSpec> {
        self.teams.iter().find(|t| t.id == id)
    }

    pub fn find_swarm(&self, id: &str) -> Option<&SwarmSpec> {
        self.swarms.iter().find(|s| s.id == id)
    }

    /// Fallback target for unrouted messages: the agent named `default`, or
    /// the first configured agent.
    pub fn default_agent(&self) -> Option<&AgentSpec> {
        self.find_agent("default").or_else(|| self.agents.first())
    }

    /// Check every cross-reference and numeric bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }

        for (i, agent) in self.agents.iter().enumerate() {
            if self.agents[..i].iter().any(|a| a.id == agent.id) {
                return Err(ConfigError::DuplicateAgent {
                    agent: agent.id.clone(),
                });
            }
        }

        for team in &self.teams {
            if team.agents.is_empty() {
                return Err(ConfigError::EmptyTeam {
                    team: team.id.clone(),
                });
            }
            for member in &team.agents {
                if self.find_agent(member).is_none() {
                    return Err(ConfigError::UnknownTeamAgent {
                        team: team.id.clone(),
                        agent: member.clone(),
                    });
                }
            }
            if !team.has_member(&team.leader_agent) {
                return Err(ConfigError::LeaderNotMember {
                    team: team.id.clone(),
                    leader: team.leader_agent.clone(),
                });
            }
        }

        for swarm in &self.swarms {
            if self.find_agent(&swarm.agent).is_none() {
                return Err(ConfigError::UnknownSwarmAgent {
                    swarm: swarm.id.clone(),
                    agent: swarm.agent.clone(),
                });
            }
            if let Some(reduce) = &swarm.reduce {
                if let Some(agent) = &reduce.agent {
                    if self.find_agent(agent).is_none() {
                        return Err(ConfigError::UnknownSwarmAgent {
                            swarm: swarm.id.clone(),
                            agent: agent.clone(),
                        });
                    }
                }
            }
            if swarm.concurrency == 0 {
                return Err(ConfigError::BadBound {
                    swarm: swarm.id.clone(),
                    field: "concurrency",
                });
            }
            if swarm.batch_size == 0 {
                return Err(ConfigError::BadBound {
                    swarm: swarm.id.clone(),
                    field: "batchSize",
                });
            }
            if let Some(shuffle) = &swarm.shuffle {
                if shuffle.max_partition_size == 0 {
                    return Err(ConfigError::BadBound {
                        swarm: swarm.id.clone(),
                        field: "maxPartitionSize",
                    });
                }
            }
        }

        Ok(())
    }
}

/// Configuration validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no agents configured")]
    NoAgents,
    #[error("duplicate agent id `{agent}`")]
    DuplicateAgent { agent: String },
    #[error("team `{team}` has no members")]
    EmptyTeam { team: String },
    #[error("team `{team}` references unknown agent `{agent}`")]
    UnknownTeamAgent { team: String, agent: String },
    #[error("team `{team}` leader `{leader}` is not a member")]
    LeaderNotMember { team: String, leader: String },
    #[error("swarm `{swarm}` references unknown agent `{agent}`")]
    UnknownSwarmAgent { swarm: String, agent: String },
    #[error("swarm `{swarm}` has invalid `{field}` (must be >= 1)")]
    BadBound { swarm: String, field: &'static str },
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
