use super::CommandContext;
use crate::state::format_timestamp;
use crate::Result;

/// Operator force-release of the apply lock. The engine never clears a
/// stale lock on its own.
pub fn execute(ctx: &CommandContext) -> Result<()> {
    match ctx.store().force_unlock()? {
        Some(lock) => {
            println!(
                "Released lock held by {} (acquired {}, lease expired {}).",
                lock.holder,
                format_timestamp(lock.acquired_at),
                format_timestamp(lock.expires_at),
            );
        }
        None => println!("State is not locked."),
    }
    Ok(())
}
