//! # revdb Codec
//!
//! Document value model and body encoding for revdb.
//!
//! Document bodies are dictionaries of string keys to [`Value`]s with
//! arbitrary nesting. Bodies are stored as canonical CBOR:
//! - Dictionary keys are emitted length-first, then bytewise
//! - Integers use the shortest encoding
//! - No floats
//! - Identical bodies always produce identical bytes
//!
//! ## Usage
//!
//! ```
//! use revdb_codec::{decode_body, encode_body, Dict, Value};
//!
//! let mut body = Dict::new();
//! body.insert("a".to_string(), Value::Integer(1));
//!
//! let bytes = encode_body(&body).unwrap();
//! assert_eq!(decode_body(&bytes).unwrap(), body);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod json;
mod value;

pub use cbor::{decode_body, decode_value, encode_body, encode_value, from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use json::{body_from_json_str, body_to_json, from_json, to_json};
pub use value::{dict_has_attachments, Dict, Value, BLOB_TYPE, BLOB_TYPE_KEY};
