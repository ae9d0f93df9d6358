use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value as JsonValue};

use crate::error::SidecarError;
use crate::results::ResultSet;
use crate::types::{text_requires_envelope, ParamValues, RowValues};

const ENVELOPE_KEY: &str = "base64";

/// Wrap raw bytes for transport through the text protocol.
#[must_use]
pub fn blob_envelope(bytes: &[u8]) -> JsonValue {
    json!({ ENVELOPE_KEY: BASE64.encode(bytes) })
}

/// Detect and decode the blob envelope.
///
/// Returns None for any value that is not the envelope shape; the decode
/// error is surfaced so the two sides can classify it differently (soft
/// binding failure in the worker, terminal framing failure in the parent).
#[must_use]
pub fn decode_envelope(value: &JsonValue) -> Option<Result<Vec<u8>, base64::DecodeError>> {
    let JsonValue::Object(fields) = value else {
        return None;
    };
    if fields.len() != 1 {
        return None;
    }
    let JsonValue::String(encoded) = fields.get(ENVELOPE_KEY)? else {
        return None;
    };
    Some(BASE64.decode(encoded))
}

/// Encode an outbound parameter value.
///
/// Text containing bytes that cannot travel as JSON-safe text is rewrapped
/// as the blob envelope; it surfaces on the far side as a blob, which is
/// the intended one-way coercion. Non-finite floats have no JSON form and
/// degrade to null.
#[must_use]
pub fn to_wire(value: &RowValues) -> JsonValue {
    match value {
        RowValues::Null => JsonValue::Null,
        RowValues::Int(i) => json!(i),
        RowValues::Float(f) => serde_json::Number::from_f64(*f)
            .map_or(JsonValue::Null, JsonValue::Number),
        RowValues::Bool(b) => JsonValue::Bool(*b),
        RowValues::Text(s) => {
            if text_requires_envelope(s) {
                blob_envelope(s.as_bytes())
            } else {
                JsonValue::String(s.clone())
            }
        }
        RowValues::Blob(bytes) => blob_envelope(bytes),
    }
}

/// Decode an inbound result cell.
///
/// # Errors
///
/// Any shape the worker never legitimately emits (arrays, non-envelope
/// objects, undecodable envelopes) is a terminal protocol violation.
pub fn cell_from_wire(value: &JsonValue) -> Result<RowValues, SidecarError> {
    if let Some(decoded) = decode_envelope(value) {
        return decoded
            .map(RowValues::Blob)
            .map_err(|_| SidecarError::InvalidMessage);
    }
    match value {
        JsonValue::Null => Ok(RowValues::Null),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(RowValues::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(RowValues::Float(f))
            } else {
                Err(SidecarError::InvalidMessage)
            }
        }
        JsonValue::String(s) => Ok(RowValues::Text(s.clone())),
        _ => Err(SidecarError::InvalidMessage),
    }
}

impl ParamValues {
    /// Encode parameters as the second `query` argument: a list for
    /// positional placeholders, an object for named ones.
    #[must_use]
    pub fn to_wire(&self) -> JsonValue {
        match self {
            ParamValues::Empty => JsonValue::Array(Vec::new()),
            ParamValues::Positional(values) => {
                JsonValue::Array(values.iter().map(to_wire).collect())
            }
            ParamValues::Named(values) => {
                let mut map = Map::new();
                for (name, value) in values {
                    map.insert(name.clone(), to_wire(value));
                }
                JsonValue::Object(map)
            }
        }
    }
}

impl ResultSet {
    /// Decode the result payload of an `exec`/`query` response.
    ///
    /// # Errors
    ///
    /// Returns `SidecarError::InvalidMessage` when the payload deviates
    /// from the documented shape.
    pub fn from_wire(payload: &JsonValue) -> Result<ResultSet, SidecarError> {
        let JsonValue::Object(fields) = payload else {
            return Err(SidecarError::InvalidMessage);
        };

        let insert_id = match fields.get("insertId") {
            Some(value) => value.as_i64().ok_or(SidecarError::InvalidMessage)?,
            None => 0,
        };
        let changed = match fields.get("changed") {
            Some(value) => value.as_u64().ok_or(SidecarError::InvalidMessage)?,
            None => 0,
        };

        let columns = fields.get("columns");
        let rows = fields.get("rows");
        let mut result_set = match (columns, rows) {
            (None, None) => ResultSet::with_capacity(0),
            (Some(JsonValue::Array(columns)), Some(JsonValue::Array(rows))) => {
                let names = columns
                    .iter()
                    .map(|c| c.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or(SidecarError::InvalidMessage)?;
                let names = Arc::new(names);
                let mut result_set = ResultSet::with_capacity(rows.len());
                result_set.set_column_names(names.clone());
                for row in rows {
                    let JsonValue::Object(cells) = row else {
                        return Err(SidecarError::InvalidMessage);
                    };
                    let mut values = Vec::with_capacity(names.len());
                    for name in names.iter() {
                        let cell = cells.get(name).unwrap_or(&JsonValue::Null);
                        values.push(cell_from_wire(cell)?);
                    }
                    result_set.add_row_values(values);
                }
                result_set
            }
            // columns/rows travel together or not at all
            _ => return Err(SidecarError::InvalidMessage),
        };

        result_set.insert_id = insert_id;
        result_set.changed = changed;
        Ok(result_set)
    }
}
