use super::CommandContext;
use crate::loader::load_resource_set;
use crate::resource::ResourceId;
use crate::scheduler::{ApplyReport, ApplyStatus};
use crate::Result;
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::info;

pub struct ApplyOptions {
    pub concurrency: Option<usize>,
    pub rollback_on_failure: bool,
}

/// Plan and execute. On partial failure the committed work stays in the
/// snapshot; rollback runs only when the caller opted in.
pub fn execute(
    ctx: &CommandContext,
    file: &Path,
    target: Option<&ResourceId>,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    let set = load_resource_set(file)?;
    let engine = ctx.engine(&set.provider_config, options.concurrency);
    install_interrupt_handler(&engine);

    let before = engine.store().load()?;
    let (outcome, report) = engine.apply(set.resources, target)?;

    super::plan::print_diff(&outcome.diff);
    print_report(&report);

    if report.status == ApplyStatus::PartialFailure && options.rollback_on_failure {
        info!("rolling back to the pre-apply snapshot");
        println!("\nRolling back to the pre-apply snapshot...");
        let rollback_report = engine.rollback(&before)?;
        print_report(&rollback_report);
        return Ok(report);
    }

    if report.status == ApplyStatus::PartialFailure {
        println!(
            "\nRe-run `converge apply` to retry the remainder, or re-run with \
             --rollback-on-failure to return to the previous snapshot."
        );
    }
    Ok(report)
}

/// Ctrl-C stops dispatching new waves; in-flight provider calls finish and
/// their commits land before the run winds down as `Aborted`.
pub(super) fn install_interrupt_handler(engine: &crate::execution::Engine) {
    let abort = engine.abort_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, stopping before the next wave");
        abort.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }
}

pub fn print_report(report: &ApplyReport) {
    println!("\nApply {}.", report.status);
    if !report.committed.is_empty() {
        println!("  Committed:");
        for id in &report.committed {
            println!("    - {id}");
        }
    }
    if !report.failed.is_empty() {
        println!("  Failed:");
        for (id, error) in &report.failed {
            println!("    - {id}: {error}");
        }
    }
    if !report.pending.is_empty() {
        println!("  Not started:");
        for id in &report.pending {
            println!("    - {id}");
        }
    }
}
