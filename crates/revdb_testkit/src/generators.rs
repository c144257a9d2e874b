//! Property-based test generators using proptest.
//!
//! Provides strategies for generating document ids, bodies and operation
//! sequences.

use proptest::prelude::*;
use revdb_codec::{Dict, Value};

/// Strategy for generating document ids.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for scalar values (no bytes, so no attachments).
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        "[ -~]{0,24}".prop_map(Value::Text),
    ]
}

/// Strategy for nested values up to a small depth.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4).prop_map(Value::Dict),
        ]
    })
}

/// Strategy for document bodies without attachments.
pub fn body_strategy() -> impl Strategy<Value = Dict> {
    prop::collection::btree_map("[a-z]{1,10}", value_strategy(), 0..6)
}

/// Strategy for document bodies that carry inline bytes.
pub fn body_with_attachment_strategy() -> impl Strategy<Value = Dict> {
    (body_strategy(), prop::collection::vec(any::<u8>(), 1..64)).prop_map(|(mut body, bytes)| {
        body.insert("attachment".to_string(), Value::Bytes(bytes));
        body
    })
}

/// A document operation for model-based tests.
#[derive(Debug, Clone)]
pub enum DocumentOperation {
    /// Save a body under an id.
    Save {
        /// Document id.
        id: String,
        /// New body.
        body: Dict,
    },
    /// Delete the document.
    Delete {
        /// Document id.
        id: String,
    },
    /// Purge the document.
    Purge {
        /// Document id.
        id: String,
    },
}

/// Strategy for operations over a small id space, so ids collide.
pub fn document_operation_strategy() -> impl Strategy<Value = DocumentOperation> {
    let id = prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(str::to_string);
    prop_oneof![
        4 => (id.clone(), body_strategy())
            .prop_map(|(id, body)| DocumentOperation::Save { id, body }),
        1 => id.clone().prop_map(|id| DocumentOperation::Delete { id }),
        1 => id.prop_map(|id| DocumentOperation::Purge { id }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<DocumentOperation>> {
    prop::collection::vec(document_operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
