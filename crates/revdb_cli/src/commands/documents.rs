//! Single-document commands.

use super::{CliError, CliResult, DatabaseArgs};
use revdb_core::{ConcurrencyControl, CoreError, Database, Document};
use serde::Serialize;

/// A document as printed by `get`.
#[derive(Debug, Serialize)]
pub struct DocumentView {
    /// Document id.
    pub id: String,
    /// Current revision id.
    pub rev: Option<String>,
    /// Sequence of the current revision.
    pub sequence: u64,
    /// Document body.
    pub body: serde_json::Value,
    /// Revision history, newest first, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<String>>,
}

/// Runs the get command.
pub fn get(args: &DatabaseArgs, id: &str, history: bool) -> CliResult<()> {
    let db = args.open(false)?;
    let view = view(&db, id, history)?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

fn view(db: &Database, id: &str, history: bool) -> CliResult<DocumentView> {
    let doc = db
        .get_document(id)?
        .ok_or_else(|| CoreError::not_found(id))?;
    let history = if history {
        Some(
            db.revision_history(id)?
                .iter()
                .map(ToString::to_string)
                .collect(),
        )
    } else {
        None
    };
    Ok(DocumentView {
        id: doc.id().to_string(),
        rev: doc.revision_id().map(ToString::to_string),
        sequence: doc.sequence(),
        body: doc.to_json(),
        history,
    })
}

/// Runs the put command. Creates the database if needed.
pub fn put(args: &DatabaseArgs, id: &str, json: &str, fail_on_conflict: bool) -> CliResult<()> {
    let db = args.open(true)?;
    match store(&db, id, json, fail_on_conflict)? {
        Some(rev) => println!("{id} saved as {rev}"),
        None => println!("{id} changed concurrently, not saved"),
    }
    Ok(())
}

fn store(db: &Database, id: &str, json: &str, fail_on_conflict: bool) -> CliResult<Option<String>> {
    let parsed = Document::from_json(id, json)?;
    let mut doc = db
        .get_document(id)?
        .unwrap_or_else(|| Document::with_id(id));
    doc.set_body(parsed.body().clone());
    let concurrency = if fail_on_conflict {
        ConcurrencyControl::FailOnConflict
    } else {
        ConcurrencyControl::LastWriteWins
    };
    if !db.save_with_concurrency(&mut doc, concurrency)? {
        return Ok(None);
    }
    doc.revision_id()
        .map(|rev| Some(rev.to_string()))
        .ok_or(CliError::Usage("saved document has no revision"))
}

/// Runs the delete command.
pub fn delete(args: &DatabaseArgs, id: &str) -> CliResult<()> {
    let db = args.open(false)?;
    let mut doc = db
        .get_document(id)?
        .ok_or_else(|| CoreError::not_found(id))?;
    db.delete(&mut doc)?;
    println!("{id} deleted");
    Ok(())
}

/// Runs the purge command.
pub fn purge(args: &DatabaseArgs, id: &str) -> CliResult<()> {
    let db = args.open(false)?;
    db.purge_by_id(id)?;
    println!("{id} purged");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::args;
    use tempfile::TempDir;

    #[test]
    fn put_creates_then_updates() {
        let dir = TempDir::new().unwrap();
        let args = args(&dir);
        put(&args, "a", r#"{"n": 1}"#, false).unwrap();
        put(&args, "a", r#"{"n": 2}"#, true).unwrap();

        let db = args.open(false).unwrap();
        let view = view(&db, "a", true).unwrap();
        assert_eq!(view.body["n"], 2);
        assert_eq!(view.history.unwrap().len(), 2);
    }

    #[test]
    fn delete_and_purge() {
        let dir = TempDir::new().unwrap();
        let args = args(&dir);
        put(&args, "a", "{}", false).unwrap();
        put(&args, "b", "{}", false).unwrap();

        delete(&args, "a").unwrap();
        purge(&args, "b").unwrap();
        assert!(matches!(
            delete(&args, "a"),
            Err(CliError::Core(CoreError::NotFound { .. }))
        ));

        let db = args.open(false).unwrap();
        assert_eq!(db.count().unwrap(), 0);
        assert_eq!(db.document_ids().unwrap(), vec!["a"]);
    }

    #[test]
    fn invalid_json_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(put(&args(&dir), "a", "[1, 2]", false).is_err());
    }
}
