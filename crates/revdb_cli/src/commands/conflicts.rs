//! Conflict listing and resolution.

use super::{CliResult, DatabaseArgs, Strategy};
use revdb_core::Database;
use tracing::info;

/// Runs the conflicts command.
pub fn list(args: &DatabaseArgs) -> CliResult<()> {
    let db = args.open(false)?;
    let conflicted = db.documents_in_conflict()?;
    if conflicted.is_empty() {
        println!("No conflicts");
    }
    for id in conflicted {
        println!("{id}");
    }
    Ok(())
}

/// Runs the resolve command for one document, or for every conflicted
/// document when `id` is `None`.
pub fn resolve(args: &DatabaseArgs, id: Option<&str>, strategy: Strategy) -> CliResult<()> {
    let db = args.open(false)?;
    let resolved = resolve_in(&db, id, strategy)?;
    println!("Resolved {resolved} document(s) with the {strategy:?} strategy");
    Ok(())
}

fn resolve_in(db: &Database, id: Option<&str>, strategy: Strategy) -> CliResult<usize> {
    let targets = match id {
        Some(id) => vec![id.to_string()],
        None => db.documents_in_conflict()?,
    };
    for doc_id in &targets {
        db.resolve_conflict(doc_id, &strategy)?;
        info!(doc_id = %doc_id, ?strategy, "resolved");
    }
    Ok(targets.len())
}
