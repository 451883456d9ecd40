//! `hivebot status` — configuration summary and queue depths.

use std::path::{Path, PathBuf};

use anyhow::Result;
use colored::Colorize;

use hivebot_core::config::{load_config, Provider};
use hivebot_core::layout::HiveLayout;

pub fn run(root: PathBuf) -> Result<()> {
    let layout = HiveLayout::new(&root);
    let config = load_config(&root);

    println!("\n{}", "🐝 Hivebot status".bold());
    println!("{}", format!("   hive root: {}", root.display()).dimmed());

    match config.validate() {
        Ok(()) => println!("   config: {}", "valid".green()),
        Err(e) => println!("   config: {} ({e})", "invalid".red()),
    }

    println!("\n{}", "Agents".bold());
    for agent in &config.agents {
        let provider = match agent.provider {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
        };
        println!(
            "   {} ({provider}{})",
            agent.id,
            agent
                .model
                .as_deref()
                .map(|m| format!(", {m}"))
                .unwrap_or_default()
        );
    }

    if !config.teams.is_empty() {
        println!("\n{}", "Teams".bold());
        for team in &config.teams {
            println!(
                "   {} → leader {}, members [{}]",
                team.id,
                team.leader_agent,
                team.agents.join(", ")
            );
        }
    }

    if !config.swarms.is_empty() {
        println!("\n{}", "Swarms".bold());
        for swarm in &config.swarms {
            println!(
                "   {} → agent {}, concurrency {}, batch size {}",
                swarm.id, swarm.agent, swarm.concurrency, swarm.batch_size
            );
        }
    }

    println!("\n{}", "Queue".bold());
    println!("   incoming:   {}", count_files(&layout.incoming()));
    println!("   processing: {}", count_files(&layout.processing()));
    println!("   outgoing:   {}", count_files(&layout.outgoing()));
    println!("   deadletter: {}", count_files(&layout.deadletter()));
    println!();

    Ok(())
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_files_missing_dir() {
        assert_eq!(count_files(Path::new("/nonexistent/queue")), 0);
    }

    #[test]
    fn test_count_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        assert_eq!(count_files(dir.path()), 2);
    }

    #[test]
    fn test_status_runs_on_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path().to_path_buf()).unwrap();
    }
}
