//! `hivebot init` — create the hive layout and a starter config.

use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::Colorize;

use hivebot_core::config::{config_path, load_config, save_config, Config};
use hivebot_core::layout::HiveLayout;

pub fn run(root: PathBuf) -> Result<()> {
    let layout = HiveLayout::new(&root);
    layout
        .ensure()
        .with_context(|| format!("failed to create layout at {}", root.display()))?;
    println!("{} {}", "created hive layout at".green(), root.display());

    let path = config_path(&root);
    if path.exists() {
        println!("{} {}", "config already present:".yellow(), path.display());
    } else {
        save_config(&Config::default(), &path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("{} {}", "wrote default config to".green(), path.display());
    }

    let config = load_config(&root);
    println!(
        "\n{} agent(s), {} team(s), {} swarm(s) configured",
        config.agents.len(),
        config.teams.len(),
        config.swarms.len()
    );
    println!("\nNext: `hivebot start --root {}`", root.display());
    Ok(())
}
