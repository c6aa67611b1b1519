use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;

use maestro_core::{parse_plan, CallGraph};

pub fn execute(plan_path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(plan_path)
        .with_context(|| format!("reading plan file {}", plan_path.display()))?;

    let plan = parse_plan(&text)?;
    let graph = CallGraph::build(&plan)?;
    let order = graph.execution_order();
    info!(plan = %plan_path.display(), mode = %plan.mode, calls = graph.node_count(), "plan validated");

    println!("{}", "Plan is valid.".green().bold());
    println!("  mode:  {}", plan.mode);
    println!("  calls: {}", graph.node_count());

    println!("\n{}", "Execution order".bold());
    for (step, idx) in order.iter().enumerate() {
        let node = graph.node(*idx);
        let deps = graph.dependencies(*idx);
        if deps.is_empty() {
            println!("  {:>3}. {}", step + 1, node.call.tool_id);
        } else {
            let dep_ids: Vec<&str> = deps
                .iter()
                .map(|d| graph.node(*d).call.tool_id.as_str())
                .collect();
            println!(
                "  {:>3}. {} {}",
                step + 1,
                node.call.tool_id,
                format!("(after {})", dep_ids.join(", ")).dimmed()
            );
        }
    }

    Ok(())
}
