use anyhow::Result;
use colored::Colorize;
use serde_json::json;

use crate::demo::demo_registry;

pub fn execute(format: &str) -> Result<()> {
    let registry = demo_registry();
    let actions = registry.list_actions();

    if actions.is_empty() {
        println!("{}", "No actions registered.".yellow());
        return Ok(());
    }

    match format {
        "json" => {
            let entries: Vec<_> = actions
                .iter()
                .map(|a| json!({ "name": a.name, "hub": a.hub, "description": a.description }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("\n{}", "Available actions".green().bold());
            println!("{}", "─".repeat(80).dimmed());
            for action in &actions {
                println!(
                    "{:<14} {:<8} {}",
                    action.name.bold(),
                    action.hub.dimmed(),
                    action.description
                );
            }
        }
    }

    Ok(())
}
