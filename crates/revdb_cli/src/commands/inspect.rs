//! Inspect command implementation.

use super::{CliResult, DatabaseArgs};
use serde::Serialize;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database name.
    pub name: String,
    /// Database directory.
    pub path: String,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Highest committed sequence.
    pub last_sequence: u64,
    /// Number of live documents.
    pub live_documents: u64,
    /// Number of deleted documents still holding history.
    pub deleted_documents: u64,
    /// Ids of conflicted documents.
    pub conflicts: Vec<String>,
}

/// Runs the inspect command.
pub fn run(args: &DatabaseArgs, format: &str) -> CliResult<()> {
    let db = args.open(false)?;
    let journal_size = match args.engine(&db)? {
        Some(engine) => engine.journal_size()?,
        None => 0,
    };
    let live_documents = db.count()?;
    let stored = db.document_ids()?.len() as u64;

    let result = InspectResult {
        name: db.name().to_string(),
        path: db
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        journal_size,
        last_sequence: db.last_sequence()?,
        live_documents,
        deleted_documents: stored.saturating_sub(live_documents),
        conflicts: db.documents_in_conflict()?,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("revdb Database Inspection");
    println!("=========================");
    println!();
    println!("Name: {}", result.name);
    println!("Path: {}", result.path);
    println!();
    println!("Storage:");
    println!("  Journal size:  {}", format_size(result.journal_size));
    println!("  Last sequence: {}", result.last_sequence);
    println!();
    println!("Documents:");
    println!("  Live:      {}", result.live_documents);
    println!("  Deleted:   {}", result.deleted_documents);
    println!("  Conflicts: {}", result.conflicts.len());
    for id in &result.conflicts {
        println!("    {id}");
    }
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
