//! Shared CLI helpers — root resolution and terminal output.

use std::path::PathBuf;

use colored::Colorize;

/// Resolve the hive root: explicit flag (with `~` expansion) or `~/.hivebot`.
pub fn resolve_root(flag: Option<&str>) -> PathBuf {
    match flag {
        Some(path) if path.starts_with("~/") || path == "~" => dirs_next::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(path.trim_start_matches("~/").trim_start_matches('~')),
        Some(path) => PathBuf::from(path),
        None => dirs_next::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hivebot"),
    }
}

/// Print the chat banner.
pub fn print_banner(root: &std::path::Path) {
    println!();
    println!("{}", "🐝 Hivebot chat".bold());
    println!("{}", format!("   hive root: {}", root.display()).dimmed());
    println!(
        "{}",
        "   Address agents with @name; `exit` to quit.".dimmed()
    );
    println!();
}

/// Print an agent response.
pub fn print_response(agent: Option<&str>, text: &str) {
    let label = agent.unwrap_or("hive");
    println!("\n{} {}\n", format!("{label}:").green().bold(), text);
}

/// Print a progress notice.
pub fn print_progress(text: &str) {
    println!("{}", text.dimmed());
}
