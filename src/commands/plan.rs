use super::CommandContext;
use crate::diff::{ActionKind, DiffSet};
use crate::execution::PlanOutcome;
use crate::loader::load_resource_set;
use crate::resource::ResourceId;
use crate::scheduler::plan_waves;
use crate::Result;
use std::path::Path;
use tracing::info;

/// Compute and print the plan. Never mutates.
pub fn execute(ctx: &CommandContext, file: &Path, target: Option<&ResourceId>) -> Result<()> {
    info!("planning from {}", file.display());
    let set = load_resource_set(file)?;
    let engine = ctx.engine(&set.provider_config, None);
    let outcome = engine.plan(set.resources, target)?;

    print_diff(&outcome.diff);
    print_waves(&outcome)?;
    Ok(())
}

pub fn print_diff(diff: &DiffSet) {
    if diff.is_noop() {
        println!("No changes. The desired state matches the snapshot.");
        return;
    }

    println!("Execution plan:");
    for entry in diff.changes() {
        let symbol = match entry.action {
            ActionKind::Create => "+",
            ActionKind::Update => "~",
            ActionKind::Replace => "±",
            ActionKind::Delete => "-",
            // Settled resource with deposed instances awaiting deletion.
            ActionKind::NoOp => {
                println!("  - delete old {}", entry.id);
                continue;
            }
        };
        println!("  {symbol} {} {}", entry.action, entry.id);
    }

    println!(
        "\nPlan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged.",
        diff.count(ActionKind::Create),
        diff.count(ActionKind::Update),
        diff.count(ActionKind::Replace),
        diff.count(ActionKind::Delete),
        diff.count(ActionKind::NoOp),
    );
}

fn print_waves(outcome: &PlanOutcome) -> Result<()> {
    let waves = plan_waves(&outcome.diff, &outcome.graph, &outcome.snapshot)?;
    if waves.is_empty() {
        return Ok(());
    }
    println!("\nExecution waves:");
    for (index, wave) in waves.iter().enumerate() {
        let steps: Vec<String> = wave.iter().map(|s| s.to_string()).collect();
        println!("  {}. {}", index + 1, steps.join(", "));
    }
    Ok(())
}
