//! Hivebot core — shared types for the file-queue orchestrator.
//!
//! This crate is the dependency leaf: queue record types, the on-disk layout,
//! configuration (agents, teams, swarms, queue tuning), and the append-only
//! event sink. The engine and worker crates build on these.

pub mod config;
pub mod events;
pub mod layout;
pub mod types;
pub mod utils;
