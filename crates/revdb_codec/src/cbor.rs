//! Canonical CBOR encoding of document values.
//!
//! Values are lowered to [`ciborium::value::Value`] and written with
//! ciborium. Dictionary keys are emitted in canonical order (shorter keys
//! first, then bytewise), so the same body always yields the same bytes and
//! revision digests computed over it are stable.

use crate::error::{CodecError, CodecResult};
use crate::value::{Dict, Value};
use ciborium::value::{Integer, Value as Cbor};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value to canonical CBOR bytes.
pub fn encode_value(value: &Value) -> CodecResult<Vec<u8>> {
    to_cbor(&lower(value))
}

/// Encode a document body to canonical CBOR bytes.
pub fn encode_body(body: &Dict) -> CodecResult<Vec<u8>> {
    to_cbor(&lower_dict(body))
}

/// Decode a value from CBOR bytes.
///
/// # Errors
///
/// Returns an error for malformed input, floats, integers outside the i64
/// range, non-text dictionary keys and duplicate keys.
pub fn decode_value(bytes: &[u8]) -> CodecResult<Value> {
    let raw: Cbor = from_cbor(bytes)?;
    raise(raw)
}

/// Decode a document body.
///
/// An empty byte slice decodes to an empty body; any other root that is not
/// a dictionary is rejected.
pub fn decode_body(bytes: &[u8]) -> CodecResult<Dict> {
    if bytes.is_empty() {
        return Ok(Dict::new());
    }
    match decode_value(bytes)? {
        Value::Dict(d) => Ok(d),
        _ => Err(CodecError::invalid_structure(
            "document body root must be a dictionary",
        )),
    }
}

/// Serialize any serde type to CBOR.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(out)
}

/// Deserialize any serde type from CBOR.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

fn lower(value: &Value) -> Cbor {
    match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Integer(n) => Cbor::Integer(Integer::from(*n)),
        Value::Text(s) => Cbor::Text(s.clone()),
        Value::Bytes(b) => Cbor::Bytes(b.clone()),
        Value::Array(items) => Cbor::Array(items.iter().map(lower).collect()),
        Value::Dict(d) => lower_dict(d),
    }
}

fn lower_dict(dict: &Dict) -> Cbor {
    let mut keys: Vec<&String> = dict.keys().collect();
    keys.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.as_bytes().cmp(b.as_bytes())));
    Cbor::Map(
        keys.into_iter()
            .map(|k| (Cbor::Text(k.clone()), lower(&dict[k])))
            .collect(),
    )
}

fn raise(raw: Cbor) -> CodecResult<Value> {
    match raw {
        Cbor::Null => Ok(Value::Null),
        Cbor::Bool(b) => Ok(Value::Bool(b)),
        Cbor::Integer(n) => i64::try_from(i128::from(n))
            .map(Value::Integer)
            .map_err(|_| CodecError::IntegerOverflow),
        Cbor::Float(_) => Err(CodecError::FloatForbidden),
        Cbor::Text(s) => Ok(Value::Text(s)),
        Cbor::Bytes(b) => Ok(Value::Bytes(b)),
        Cbor::Array(items) => items
            .into_iter()
            .map(raise)
            .collect::<CodecResult<Vec<_>>>()
            .map(Value::Array),
        Cbor::Map(pairs) => {
            let mut dict = Dict::new();
            for (key, value) in pairs {
                let Cbor::Text(key) = key else {
                    return Err(CodecError::invalid_structure(
                        "dictionary keys must be text",
                    ));
                };
                let value = raise(value)?;
                if dict.insert(key.clone(), value).is_some() {
                    return Err(CodecError::invalid_structure(format!(
                        "duplicate dictionary key: {key}"
                    )));
                }
            }
            Ok(Value::Dict(dict))
        }
        // Tags carry no meaning for document bodies.
        Cbor::Tag(_, inner) => raise(*inner),
        _ => Err(CodecError::invalid_structure("unsupported CBOR item")),
    }
}
