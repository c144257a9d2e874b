//! Compact command implementation.

use super::inspect::format_size;
use super::{CliResult, DatabaseArgs};

/// Runs the compact command.
pub fn run(args: &DatabaseArgs) -> CliResult<()> {
    let db = args.open(false)?;
    let engine = args.engine(&db)?;
    let before = match &engine {
        Some(engine) => engine.journal_size()?,
        None => 0,
    };

    println!("Compacting {}", db.name());
    db.compact()?;

    let after = match &engine {
        Some(engine) => engine.journal_size()?,
        None => 0,
    };
    println!("  Size before: {}", format_size(before));
    println!("  Size after:  {}", format_size(after));
    println!(
        "  Space saved: {} ({:.1}%)",
        format_size(before.saturating_sub(after)),
        if before > 0 {
            (before.saturating_sub(after) as f64 / before as f64) * 100.0
        } else {
            0.0
        }
    );
    Ok(())
}
