//! Queue record types — the JSON payloads flowing through the file bus.
//!
//! Channel clients deposit [`QueueMessage`] files into `queue/incoming/` and
//! pick up [`QueueResponse`] files from `queue/outgoing/`. The dispatcher owns
//! everything in between. On-disk JSON uses camelCase keys; unknown fields are
//! tolerated so channel clients can carry extra metadata without breaking the
//! core.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::utils::safe_filename;

// ─────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────

/// Maximum characters an outgoing response may carry inline.
pub const RESPONSE_MAX_CHARS: usize = 4000;

/// Characters kept when a response is truncated.
pub const RESPONSE_KEEP_CHARS: usize = 3900;

/// Notice appended to a truncated response.
pub const TRUNCATION_NOTICE: &str = "\n\n[Response truncated...]";

// ─────────────────────────────────────────────
// QueueMessage
// ─────────────────────────────────────────────

/// An inbound message read from `queue/incoming/`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Originating channel (opaque to the core).
    pub channel: String,
    /// Display name of the sender.
    pub sender: String,
    /// Raw user text.
    pub message: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    /// Unique message identifier; the on-disk filename derives from it.
    pub message_id: String,
    /// Pre-routed target agent, if the channel already resolved one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Channel-specific sender identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Paths of files the channel attached to the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl QueueMessage {
    /// Create a message with the minimal required fields.
    pub fn new(
        channel: impl Into<String>,
        sender: impl Into<String>,
        message: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        QueueMessage {
            channel: channel.into(),
            sender: sender.into(),
            message: message.into(),
            timestamp: crate::utils::now_ms(),
            message_id: message_id.into(),
            agent: None,
            sender_id: None,
            files: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────
// QueueResponse
// ─────────────────────────────────────────────

/// An outbound response deposited in `queue/outgoing/`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueResponse {
    pub channel: String,
    pub sender: String,
    /// Final text, already marker-stripped and truncated.
    pub message: String,
    /// The user text this responds to.
    pub original_message: String,
    pub timestamp: i64,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Attachments to deliver alongside the text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

impl QueueResponse {
    /// Build a response addressed back to the message's channel and sender.
    pub fn reply(msg: &QueueMessage, agent: Option<&str>, text: impl Into<String>) -> Self {
        QueueResponse {
            channel: msg.channel.clone(),
            sender: msg.sender.clone(),
            message: text.into(),
            original_message: msg.message.clone(),
            timestamp: crate::utils::now_ms(),
            message_id: msg.message_id.clone(),
            agent: agent.map(str::to_string),
            files: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────
// Filenames
// ─────────────────────────────────────────────

/// Filename for an outgoing response.
///
/// The heartbeat channel keeps its historical `<messageId>.json` form so
/// heartbeat consumers can address replies without parsing.
pub fn outgoing_filename(channel: &str, message_id: &str, timestamp: i64) -> String {
    if channel == "heartbeat" {
        format!("{}.json", safe_filename(message_id))
    } else {
        format!(
            "{}_{}_{}.json",
            safe_filename(channel),
            safe_filename(message_id),
            timestamp
        )
    }
}

/// Filename for an inbound message (used by channel clients, including the
/// local chat REPL).
pub fn incoming_filename(channel: &str, message_id: &str, timestamp: i64) -> String {
    format!(
        "{}_{}_{}.json",
        safe_filename(channel),
        safe_filename(message_id),
        timestamp
    )
}

// ─────────────────────────────────────────────
// Outbound preparation (markers + truncation)
// ─────────────────────────────────────────────

/// Response text after marker extraction and truncation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundText {
    pub message: String,
    pub files: Vec<String>,
}

fn send_file_regex() -> Regex {
    Regex::new(r"\[send_file:\s*([^\]]+)\]").unwrap()
}

/// Extract `[send_file: PATH]` markers from worker output.
///
/// Existing paths are collected as attachments; every marker is removed from
/// the text whether or not its path exists. Missing paths are dropped without
/// surfacing an error to the user.
pub fn extract_send_files(text: &str) -> (String, Vec<String>) {
    let re = send_file_regex();
    let mut files = Vec::new();

    for cap in re.captures_iter(text) {
        let path = cap[1].trim().to_string();
        if Path::new(&path).is_file() {
            if !files.contains(&path) {
                files.push(path);
            }
        } else {
            tracing::debug!(path = %path, "send_file marker dropped (path not found)");
        }
    }

    let stripped = re.replace_all(text, "").to_string();
    (stripped.trim().to_string(), files)
}

/// Truncate a response to the inline limit, appending the truncation notice.
///
/// Counts characters, not bytes, so multi-byte text never splits mid-scalar.
pub fn truncate_response(text: &str) -> String {
    if text.chars().count() <= RESPONSE_MAX_CHARS {
        return text.to_string();
    }
    let kept: String = text.chars().take(RESPONSE_KEEP_CHARS).collect();
    format!("{kept}{TRUNCATION_NOTICE}")
}

/// Prepare raw worker output for the outgoing queue: strip send-file markers,
/// then truncate what remains.
pub fn prepare_outbound(raw: &str) -> OutboundText {
    let (stripped, files) = extract_send_files(raw);
    OutboundText {
        message: truncate_response(&stripped),
        files,
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip_camel_case() {
        let mut msg = QueueMessage::new("slack", "alice", "hello", "m1");
        msg.sender_id = Some("U123".into());
        msg.files = vec!["/tmp/a.txt".into()];

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["senderId"], "U123");
        assert!(json.get("message_id").is_none());

        let back: QueueMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_message_optional_fields_default() {
        let json = serde_json::json!({
            "channel": "t",
            "sender": "u",
            "message": "hi",
            "timestamp": 1,
            "messageId": "m1"
        });
        let msg: QueueMessage = serde_json::from_value(json).unwrap();
        assert!(msg.agent.is_none());
        assert!(msg.sender_id.is_none());
        assert!(msg.files.is_empty());
    }

    #[test]
    fn test_message_tolerates_unknown_fields() {
        let json = serde_json::json!({
            "channel": "t",
            "sender": "u",
            "message": "hi",
            "timestamp": 1,
            "messageId": "m1",
            "threadTs": "1234.5678"
        });
        assert!(serde_json::from_value::<QueueMessage>(json).is_ok());
    }

    #[test]
    fn test_reply_carries_context() {
        let msg = QueueMessage::new("telegram", "bob", "what time is it", "m9");
        let resp = QueueResponse::reply(&msg, Some("default"), "noon");

        assert_eq!(resp.channel, "telegram");
        assert_eq!(resp.sender, "bob");
        assert_eq!(resp.message_id, "m9");
        assert_eq!(resp.original_message, "what time is it");
        assert_eq!(resp.agent.as_deref(), Some("default"));
    }

    #[test]
    fn test_outgoing_filename_rules() {
        assert_eq!(outgoing_filename("heartbeat", "hb-1", 100), "hb-1.json");
        assert_eq!(outgoing_filename("slack", "m1", 100), "slack_m1_100.json");
    }

    #[test]
    fn test_filename_sanitizes_components() {
        let name = outgoing_filename("sl/ack", "m 1", 5);
        assert!(!name.contains('/'));
        assert!(!name.contains(' '));
    }

    #[test]
    fn test_extract_send_files_existing_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("report.txt");
        std::fs::write(&real, "x").unwrap();

        let raw = format!(
            "here you go [send_file: {}] and [send_file: /nope/missing.txt] done",
            real.display()
        );
        let (text, files) = extract_send_files(&raw);

        assert_eq!(files, vec![real.display().to_string()]);
        assert!(!text.contains("[send_file:"));
        assert!(text.starts_with("here you go"));
        assert!(text.ends_with("done"));
    }

    #[test]
    fn test_extract_send_files_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("a.txt");
        std::fs::write(&real, "x").unwrap();

        let raw = format!(
            "[send_file: {p}] twice [send_file: {p}]",
            p = real.display()
        );
        let (_, files) = extract_send_files(&raw);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_truncate_short_response_unchanged() {
        let text = "short response";
        assert_eq!(truncate_response(text), text);
    }

    #[test]
    fn test_truncate_long_response() {
        let long = "a".repeat(4100);
        let out = truncate_response(&long);
        assert!(out.ends_with(TRUNCATION_NOTICE));
        assert_eq!(
            out.chars().count(),
            RESPONSE_KEEP_CHARS + TRUNCATION_NOTICE.chars().count()
        );
    }

    #[test]
    fn test_truncate_counts_chars_not_bytes() {
        let long = "é".repeat(4100);
        let out = truncate_response(&long);
        assert!(out.ends_with(TRUNCATION_NOTICE));
        assert_eq!(
            out.chars().count(),
            RESPONSE_KEEP_CHARS + TRUNCATION_NOTICE.chars().count()
        );
    }

    #[test]
    fn test_prepare_outbound_strips_then_truncates() {
        let long = format!("{} [send_file: /missing.bin]", "b".repeat(4100));
        let prepared = prepare_outbound(&long);
        assert!(!prepared.message.contains("[send_file:"));
        assert!(prepared.message.ends_with(TRUNCATION_NOTICE));
        assert!(prepared.files.is_empty());
    }

    #[test]
    fn test_prepare_outbound_exactly_at_limit() {
        let text = "c".repeat(RESPONSE_MAX_CHARS);
        let prepared = prepare_outbound(&text);
        assert_eq!(prepared.message.chars().count(), RESPONSE_MAX_CHARS);
        assert!(!prepared.message.ends_with(TRUNCATION_NOTICE));
    }
}
