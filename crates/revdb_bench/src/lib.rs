//! Benchmark utilities.

use rand::distributions::Alphanumeric;
use rand::Rng;
use revdb_codec::{Dict, Value};
use revdb_core::{Database, Document};

/// Generates a body with `fields` text fields of roughly `field_size` bytes.
pub fn random_body(fields: usize, field_size: usize) -> Dict {
    let mut rng = rand::thread_rng();
    (0..fields)
        .map(|i| {
            let text: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(field_size)
                .map(char::from)
                .collect();
            (format!("field_{i}"), Value::Text(text))
        })
        .collect()
}

/// Generates a nested body `depth` levels deep with `width` keys per level.
pub fn nested_body(depth: usize, width: usize) -> Dict {
    (0..width)
        .map(|i| {
            let value = if depth <= 1 {
                Value::Integer(i as i64)
            } else {
                Value::Dict(nested_body(depth - 1, width))
            };
            (format!("key_{i}"), value)
        })
        .collect()
}

/// Saves `count` documents named `doc{n}` and returns them.
pub fn seed_documents(db: &Database, count: usize, body: &Dict) -> Vec<Document> {
    (0..count)
        .map(|n| {
            let mut doc = Document::with_body(format!("doc{n}"), body.clone());
            db.save(&mut doc).expect("Failed to seed document");
            doc
        })
        .collect()
}
