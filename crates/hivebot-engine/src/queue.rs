//! Queue file operations — the durable bus under `queue/`.
//!
//! Each message file is owned by exactly one dispatcher task at a time: it is
//! claimed by renaming from `incoming/` to `processing/`, and finishes by
//! either being deleted (response written) or renamed back to `incoming/`
//! (rolled back for a later retry). Startup recovery sweeps anything stranded
//! in `processing/` back to `incoming/`, which is what gives the queue its
//! at-least-once semantics across crashes.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, info, warn};

use hivebot_core::layout::HiveLayout;
use hivebot_core::types::{outgoing_filename, QueueMessage, QueueResponse};

// ─────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────

/// Framework-level queue failures. These roll the message back rather than
/// producing a user-visible response.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid message payload in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn parse_err(path: &Path, source: serde_json::Error) -> QueueError {
    QueueError::Parse {
        path: path.display().to_string(),
        source,
    }
}

// ─────────────────────────────────────────────
// QueueStore
// ─────────────────────────────────────────────

/// File operations over one hive root's queue directories.
pub struct QueueStore {
    layout: HiveLayout,
}

impl QueueStore {
    pub fn new(layout: HiveLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &HiveLayout {
        &self.layout
    }

    /// List incoming `*.json` files, oldest first (mtime, then name).
    pub fn list_incoming(&self) -> Result<Vec<PathBuf>, QueueError> {
        let dir = self.layout.incoming();
        let mut entries = Vec::new();

        for entry in std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((modified, path));
        }

        entries.sort_by(|(a_time, a_path), (b_time, b_path)| {
            a_time
                .cmp(b_time)
                .then_with(|| a_path.file_name().cmp(&b_path.file_name()))
        });

        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }

    /// Read and parse a message in place, without claiming it.
    pub fn peek(&self, path: &Path) -> Result<QueueMessage, QueueError> {
        let raw = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_json::from_str(&raw).map_err(|e| parse_err(path, e))
    }

    /// Claim an incoming file: move it to `processing/` and parse it.
    ///
    /// On a parse failure the file stays in `processing/`; the caller decides
    /// whether to roll it back or quarantine it.
    pub fn claim(&self, incoming_path: &Path) -> Result<(PathBuf, QueueMessage), QueueError> {
        let file_name = incoming_path.file_name().ok_or_else(|| {
            io_err(
                incoming_path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "file missing name"),
            )
        })?;
        let processing_path = self.layout.processing().join(file_name);

        std::fs::rename(incoming_path, &processing_path).map_err(|e| io_err(incoming_path, e))?;

        let raw = std::fs::read_to_string(&processing_path)
            .map_err(|e| io_err(&processing_path, e))?;
        let payload: QueueMessage =
            serde_json::from_str(&raw).map_err(|e| parse_err(&processing_path, e))?;

        debug!(file = %processing_path.display(), message_id = %payload.message_id, "claimed message");
        Ok((processing_path, payload))
    }

    /// Write a response into `queue/outgoing/`.
    pub fn write_response(&self, response: &QueueResponse) -> Result<PathBuf, QueueError> {
        let filename =
            outgoing_filename(&response.channel, &response.message_id, response.timestamp);
        let out_path = self.layout.outgoing().join(filename);
        let body = serde_json::to_string_pretty(response).map_err(|e| parse_err(&out_path, e))?;
        std::fs::write(&out_path, body).map_err(|e| io_err(&out_path, e))?;
        Ok(out_path)
    }

    /// Delete a processed file.
    pub fn finish(&self, processing_path: &Path) -> Result<(), QueueError> {
        std::fs::remove_file(processing_path).map_err(|e| io_err(processing_path, e))
    }

    /// Roll a claimed file back to `incoming/` for a later retry.
    pub fn rollback(&self, processing_path: &Path) -> Result<PathBuf, QueueError> {
        self.move_to(processing_path, &self.layout.incoming())
    }

    /// Quarantine a file under `queue/deadletter/`.
    pub fn deadletter(&self, path: &Path) -> Result<PathBuf, QueueError> {
        warn!(file = %path.display(), "quarantining message");
        self.move_to(path, &self.layout.deadletter())
    }

    /// Startup recovery: move every stranded processing file back to incoming.
    pub fn recover(&self) -> Result<Vec<PathBuf>, QueueError> {
        let dir = self.layout.processing();
        let mut restored = Vec::new();

        for entry in std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match self.move_to(&path, &self.layout.incoming()) {
                Ok(target) => restored.push(target),
                Err(e) => warn!(file = %path.display(), error = %e, "recovery move failed"),
            }
        }

        if !restored.is_empty() {
            info!(count = restored.len(), "recovered in-flight messages");
        }
        Ok(restored)
    }

    fn move_to(&self, from: &Path, target_dir: &Path) -> Result<PathBuf, QueueError> {
        let file_name = from.file_name().ok_or_else(|| {
            io_err(
                from,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "file missing name"),
            )
        })?;
        let target = target_dir.join(file_name);
        std::fs::rename(from, &target).map_err(|e| io_err(from, e))?;
        Ok(target)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, QueueStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = HiveLayout::new(dir.path());
        layout.ensure().unwrap();
        let store = QueueStore::new(HiveLayout::new(dir.path()));
        (dir, store)
    }

    fn write_incoming(store: &QueueStore, name: &str, message_id: &str) -> PathBuf {
        let msg = QueueMessage::new("test", "user", "hello", message_id);
        let path = store.layout().incoming().join(name);
        std::fs::write(&path, serde_json::to_string(&msg).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_list_incoming_sorted_by_mtime() {
        let (_guard, store) = make_store();
        write_incoming(&store, "b.json", "b");
        std::thread::sleep(std::time::Duration::from_millis(10));
        write_incoming(&store, "a.json", "a");

        let files = store.list_incoming().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("b.json"));
        assert!(files[1].ends_with("a.json"));
    }

    #[test]
    fn test_list_incoming_ignores_non_json() {
        let (_guard, store) = make_store();
        std::fs::write(store.layout().incoming().join("notes.txt"), "x").unwrap();
        write_incoming(&store, "m.json", "m");

        let files = store.list_incoming().unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_claim_moves_and_parses() {
        let (_guard, store) = make_store();
        let incoming = write_incoming(&store, "m.json", "m1");

        let (processing, payload) = store.claim(&incoming).unwrap();
        assert!(!incoming.exists());
        assert!(processing.exists());
        assert_eq!(payload.message_id, "m1");
    }

    #[test]
    fn test_claim_parse_failure_leaves_file_in_processing() {
        let (_guard, store) = make_store();
        let path = store.layout().incoming().join("bad.json");
        std::fs::write(&path, "not json").unwrap();

        let err = store.claim(&path).unwrap_err();
        assert!(matches!(err, QueueError::Parse { .. }));
        assert!(store.layout().processing().join("bad.json").exists());
    }

    #[test]
    fn test_rollback_restores_incoming() {
        let (_guard, store) = make_store();
        let incoming = write_incoming(&store, "m.json", "m1");
        let (processing, _) = store.claim(&incoming).unwrap();

        let restored = store.rollback(&processing).unwrap();
        assert!(restored.exists());
        assert!(!processing.exists());
        assert!(restored.starts_with(store.layout().incoming()));
    }

    #[test]
    fn test_finish_deletes_processing_file() {
        let (_guard, store) = make_store();
        let incoming = write_incoming(&store, "m.json", "m1");
        let (processing, _) = store.claim(&incoming).unwrap();

        store.finish(&processing).unwrap();
        assert!(!processing.exists());
    }

    #[test]
    fn test_write_response_uses_naming_convention() {
        let (_guard, store) = make_store();
        let msg = QueueMessage::new("slack", "u", "hi", "m7");
        let mut resp = QueueResponse::reply(&msg, Some("default"), "hello back");
        resp.timestamp = 42;

        let path = store.write_response(&resp).unwrap();
        assert!(path.ends_with("slack_m7_42.json"));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["message"], "hello back");
        assert_eq!(raw["originalMessage"], "hi");
    }

    #[test]
    fn test_write_heartbeat_response_naming() {
        let (_guard, store) = make_store();
        let msg = QueueMessage::new("heartbeat", "system", "ping", "hb-3");
        let resp = QueueResponse::reply(&msg, None, "pong");

        let path = store.write_response(&resp).unwrap();
        assert!(path.ends_with("hb-3.json"));
    }

    #[test]
    fn test_recover_sweeps_processing() {
        let (_guard, store) = make_store();
        let stranded = store.layout().processing().join("x.json");
        let msg = QueueMessage::new("t", "u", "m", "x");
        std::fs::write(&stranded, serde_json::to_string(&msg).unwrap()).unwrap();

        let restored = store.recover().unwrap();
        assert_eq!(restored.len(), 1);
        assert!(!stranded.exists());
        assert!(store.layout().incoming().join("x.json").exists());
    }

    #[test]
    fn test_recover_empty_is_noop() {
        let (_guard, store) = make_store();
        assert!(store.recover().unwrap().is_empty());
    }

    #[test]
    fn test_deadletter_moves_file() {
        let (_guard, store) = make_store();
        let incoming = write_incoming(&store, "m.json", "m1");
        let (processing, _) = store.claim(&incoming).unwrap();

        let parked = store.deadletter(&processing).unwrap();
        assert!(parked.starts_with(store.layout().deadletter()));
        assert!(parked.exists());
    }
}
