//! Reset flags — sentinel files that request a fresh worker conversation.
//!
//! `flags/reset` applies to the next invocation of any agent; `flags/reset-<id>`
//! applies to one agent. A flag is consumed (deleted) the moment it is
//! observed, so it affects exactly one invocation.

use std::io;
use std::path::PathBuf;

use tracing::debug;

/// File-based reset sentinel store.
pub struct ResetFlags {
    flags_dir: PathBuf,
}

impl ResetFlags {
    pub fn new(flags_dir: impl Into<PathBuf>) -> Self {
        Self {
            flags_dir: flags_dir.into(),
        }
    }

    fn global_path(&self) -> PathBuf {
        self.flags_dir.join("reset")
    }

    fn agent_path(&self, agent_id: &str) -> PathBuf {
        self.flags_dir
            .join(format!("reset-{}", hivebot_core::utils::safe_filename(agent_id)))
    }

    /// Check and consume the global reset flag.
    pub fn consume_global(&self) -> bool {
        self.consume(self.global_path())
    }

    /// Check and consume an agent's reset flag.
    pub fn consume_for_agent(&self, agent_id: &str) -> bool {
        self.consume(self.agent_path(agent_id))
    }

    /// Check and consume either the global or the agent flag.
    pub fn consume_any(&self, agent_id: &str) -> bool {
        // Both are consumed if both are set; one observation, one effect each.
        let global = self.consume_global();
        let scoped = self.consume_for_agent(agent_id);
        global || scoped
    }

    /// Raise the global reset flag.
    pub fn request_global(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.flags_dir)?;
        std::fs::write(self.global_path(), "")
    }

    /// Raise an agent's reset flag.
    pub fn request_for_agent(&self, agent_id: &str) -> io::Result<()> {
        std::fs::create_dir_all(&self.flags_dir)?;
        std::fs::write(self.agent_path(agent_id), "")
    }

    fn consume(&self, path: PathBuf) -> bool {
        if !path.exists() {
            return false;
        }
        if let Err(e) = std::fs::remove_file(&path) {
            debug!(path = %path.display(), error = %e, "failed to consume reset flag");
        }
        true
    }
}
