//! Configuration: schema types and the file/env loader.

pub mod loader;
pub mod schema;

pub use loader::{config_path, load_config, save_config};
pub use schema::{
    AgentSpec, Config, ConfigError, InputKind, MultiKey, Provider, QueueConfig, ReduceSpec,
    ReduceStrategy, ShuffleSpec, SwarmInput, SwarmSpec, TeamSpec, HIERARCHICAL_REDUCE_FANIN,
    MAX_SWARM_ITEMS,
};
