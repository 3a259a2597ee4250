use super::CommandContext;
use crate::resource::ResourceId;
use crate::scheduler::ApplyReport;
use crate::Result;
use std::collections::BTreeMap;
use tracing::info;

/// Diff against an empty desired graph and execute the deletes in reverse
/// dependency order.
pub fn execute(
    ctx: &CommandContext,
    target: Option<&ResourceId>,
    concurrency: Option<usize>,
) -> Result<ApplyReport> {
    // Deletes need no replacement policies, so no provider configuration.
    let engine = ctx.engine(&BTreeMap::new(), concurrency);
    super::apply::install_interrupt_handler(&engine);

    let snapshot = engine.store().load()?;
    if snapshot.is_empty() {
        println!("Nothing to destroy: the snapshot is empty.");
        return Ok(ApplyReport {
            status: crate::scheduler::ApplyStatus::Succeeded,
            committed: Vec::new(),
            failed: Vec::new(),
            pending: Vec::new(),
        });
    }

    info!(resources = snapshot.len(), "destroying recorded resources");
    let (outcome, report) = engine.destroy(target)?;
    super::plan::print_diff(&outcome.diff);
    super::apply::print_report(&report);
    Ok(report)
}
