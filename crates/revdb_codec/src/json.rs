//! JSON interop for document values.
//!
//! JSON has no byte strings, so bytes are rendered as blob metadata
//! (`{"@type": "blob", "length": n}`). JSON numbers must be integral.

use crate::error::{CodecError, CodecResult};
use crate::value::{Dict, Value, BLOB_TYPE, BLOB_TYPE_KEY};
use serde_json::{Map, Number, Value as Json};

/// Convert a value to JSON.
pub fn to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(n) => Json::Number(Number::from(*n)),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(b) => {
            let mut meta = Map::new();
            meta.insert(BLOB_TYPE_KEY.into(), Json::String(BLOB_TYPE.into()));
            meta.insert("length".into(), Json::Number(Number::from(b.len())));
            Json::Object(meta)
        }
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Dict(d) => body_to_json(d),
    }
}

/// Convert a document body to a JSON object.
pub fn body_to_json(body: &Dict) -> Json {
    Json::Object(body.iter().map(|(k, v)| (k.clone(), to_json(v))).collect())
}

/// Convert JSON to a value.
///
/// # Errors
///
/// Fractional numbers fail with [`CodecError::FloatForbidden`]; unsigned
/// numbers above `i64::MAX` fail with [`CodecError::IntegerOverflow`].
pub fn from_json(json: Json) -> CodecResult<Value> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(b)),
        Json::Number(n) => number_to_value(&n),
        Json::String(s) => Ok(Value::Text(s)),
        Json::Array(items) => items
            .into_iter()
            .map(from_json)
            .collect::<CodecResult<Vec<_>>>()
            .map(Value::Array),
        Json::Object(map) => map
            .into_iter()
            .map(|(k, v)| from_json(v).map(|v| (k, v)))
            .collect::<CodecResult<Dict>>()
            .map(Value::Dict),
    }
}

/// Parse a JSON object string into a document body.
pub fn body_from_json_str(text: &str) -> CodecResult<Dict> {
    let json: Json =
        serde_json::from_str(text).map_err(|e| CodecError::decoding_failed(e.to_string()))?;
    match from_json(json)? {
        Value::Dict(d) => Ok(d),
        _ => Err(CodecError::invalid_structure(
            "document JSON must be an object",
        )),
    }
}

fn number_to_value(n: &Number) -> CodecResult<Value> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::Integer(i));
    }
    if n.is_u64() {
        return Err(CodecError::IntegerOverflow);
    }
    match n.as_f64() {
        #[allow(clippy::cast_possible_truncation)]
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
            Ok(Value::Integer(f as i64))
        }
        _ => Err(CodecError::FloatForbidden),
    }
}
