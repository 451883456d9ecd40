//! On-disk layout of a hive root.
//!
//! The file system is the durable bus. Everything the orchestrator touches
//! lives under one root directory:
//!
//! ```text
//! <root>/
//!   queue/incoming/     inbound message JSON
//!   queue/processing/   in-flight, owned by a dispatcher task
//!   queue/outgoing/     outbound response JSON
//!   queue/deadletter/   messages quarantined after repeated rollbacks
//!   chats/<teamId>/     team chain transcripts
//!   events/             append-only JSONL event stream
//!   flags/              reset sentinels
//!   files/              outbound attachments (long responses, swarm reports)
//!   agents/<agentId>/   default per-agent working directories
//! ```

use std::io;
use std::path::{Path, PathBuf};

/// Resolved directory layout for one hive root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HiveLayout {
    root: PathBuf,
}

impl HiveLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn incoming(&self) -> PathBuf {
        self.root.join("queue/incoming")
    }

    pub fn processing(&self) -> PathBuf {
        self.root.join("queue/processing")
    }

    pub fn outgoing(&self) -> PathBuf {
        self.root.join("queue/outgoing")
    }

    pub fn deadletter(&self) -> PathBuf {
        self.root.join("queue/deadletter")
    }

    /// Transcript directory for one team.
    pub fn team_chats(&self, team_id: &str) -> PathBuf {
        self.root.join("chats").join(team_id)
    }

    pub fn events(&self) -> PathBuf {
        self.root.join("events")
    }

    pub fn flags(&self) -> PathBuf {
        self.root.join("flags")
    }

    pub fn files(&self) -> PathBuf {
        self.root.join("files")
    }

    /// Default working directory for an agent with no configured one.
    pub fn agent_workdir(&self, agent_id: &str) -> PathBuf {
        self.root.join("agents").join(agent_id)
    }

    /// Create every directory of the layout (idempotent).
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.incoming(),
            self.processing(),
            self.outgoing(),
            self.deadletter(),
            self.root.join("chats"),
            self.events(),
            self.flags(),
            self.files(),
            self.root.join("agents"),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = HiveLayout::new("/var/hive");
        assert_eq!(layout.incoming(), PathBuf::from("/var/hive/queue/incoming"));
        assert_eq!(
            layout.processing(),
            PathBuf::from("/var/hive/queue/processing")
        );
        assert_eq!(layout.outgoing(), PathBuf::from("/var/hive/queue/outgoing"));
        assert_eq!(
            layout.deadletter(),
            PathBuf::from("/var/hive/queue/deadletter")
        );
        assert_eq!(layout.team_chats("eng"), PathBuf::from("/var/hive/chats/eng"));
        assert_eq!(
            layout.agent_workdir("alice"),
            PathBuf::from("/var/hive/agents/alice")
        );
    }

    #[test]
    fn test_ensure_creates_all_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = HiveLayout::new(dir.path());
        layout.ensure().unwrap();

        assert!(layout.incoming().is_dir());
        assert!(layout.processing().is_dir());
        assert!(layout.outgoing().is_dir());
        assert!(layout.deadletter().is_dir());
        assert!(layout.events().is_dir());
        assert!(layout.flags().is_dir());
        assert!(layout.files().is_dir());
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = HiveLayout::new(dir.path());
        layout.ensure().unwrap();
        layout.ensure().unwrap();
    }
}
