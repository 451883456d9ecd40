//! Local chat channel — a REPL that speaks the file-queue protocol.
//!
//! Each line becomes a message file in `queue/incoming/`; the loop then polls
//! `queue/outgoing/` for responses carrying the same message id (progress
//! notices included) and consumes the files it prints. This is the reference
//! channel client used during development; production channels are external
//! processes speaking the same directory protocol.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};

use hivebot_core::layout::HiveLayout;
use hivebot_core::types::{incoming_filename, QueueMessage, QueueResponse};
use hivebot_core::utils;

use crate::helpers;

/// Exit commands (case-insensitive match).
const EXIT_COMMANDS: &[&str] = &["exit", "quit", "/exit", "/quit", ":q"];

/// How long to wait for a response before giving up on a message.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(600);

/// Outgoing poll cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Run the interactive chat loop.
pub async fn run(root: PathBuf, channel: &str, sender: &str) -> Result<()> {
    let layout = HiveLayout::new(&root);
    layout
        .ensure()
        .with_context(|| format!("failed to create hive layout at {}", root.display()))?;

    helpers::print_banner(&root);

    let mut editor = create_editor()?;
    let mut counter = 0u64;

    loop {
        let input = match editor.readline("You: ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {e}");
                break;
            }
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            continue;
        }
        if is_exit_command(trimmed) {
            println!("\nGoodbye! 👋");
            break;
        }
        let _ = editor.add_history_entry(&input);

        counter += 1;
        let message_id = format!("{}-{}-{counter}", channel, utils::now_ms());
        let msg = QueueMessage::new(channel, sender, trimmed, &message_id);

        let path = layout
            .incoming()
            .join(incoming_filename(channel, &message_id, msg.timestamp));
        std::fs::write(&path, serde_json::to_string_pretty(&msg)?)
            .with_context(|| format!("failed to deposit message at {}", path.display()))?;

        match wait_for_response(&layout, &message_id).await {
            Some(response) => {
                helpers::print_response(response.agent.as_deref(), &response.message);
                if !response.files.is_empty() {
                    helpers::print_progress(&format!(
                        "attachments: {}",
                        response.files.join(", ")
                    ));
                }
            }
            None => eprintln!("\n(no response within {}s — is `hivebot start` running?)\n", RESPONSE_TIMEOUT.as_secs()),
        }
    }

    save_history(&mut editor);
    Ok(())
}

/// Poll the outgoing directory until the final response for `message_id`
/// arrives, printing and consuming progress notices along the way.
async fn wait_for_response(layout: &HiveLayout, message_id: &str) -> Option<QueueResponse> {
    let deadline = Instant::now() + RESPONSE_TIMEOUT;

    while Instant::now() < deadline {
        let entries = match std::fs::read_dir(layout.outgoing()) {
            Ok(entries) => entries,
            Err(_) => {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(response) = serde_json::from_str::<QueueResponse>(&raw) else {
                continue;
            };

            if response.message_id == message_id {
                let _ = std::fs::remove_file(&path);
                return Some(response);
            }
            if response.message_id.starts_with(&format!("{message_id}-progress")) {
                helpers::print_progress(&response.message);
                let _ = std::fs::remove_file(&path);
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    None
}

fn create_editor() -> Result<Editor<(), DefaultHistory>> {
    use rustyline::config::Configurer;

    let mut editor = DefaultEditor::new()?;
    editor.set_max_history_size(1000)?;

    let history_path = history_path();
    if history_path.exists() {
        let _ = editor.load_history(&history_path);
    }
    Ok(editor)
}

fn save_history(editor: &mut Editor<(), DefaultHistory>) {
    let path = history_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = editor.save_history(&path);
}

fn history_path() -> PathBuf {
    hivebot_core::utils::get_data_path()
        .join("history")
        .join("chat_history")
}

fn is_exit_command(input: &str) -> bool {
    let lower = input.to_lowercase();
    EXIT_COMMANDS.contains(&lower.as_str())
}
