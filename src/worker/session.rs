use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, Statement};
use serde_json::{json, Map, Value as JsonValue};

use crate::protocol::envelope::{result_payload, Method, WireError};
use crate::protocol::values::{blob_envelope, decode_envelope};
use crate::types::text_requires_envelope;

/// The engine-facing half of the worker: at most one SQLite handle,
/// driven strictly serially.
///
/// Every failure here is soft: the caller gets an error response and the
/// session keeps serving. Envelope-level failures are decided before a
/// request ever reaches this type.
pub struct SqliteSession {
    conn: Option<Connection>,
}

impl SqliteSession {
    #[must_use]
    pub fn new() -> Self {
        Self { conn: None }
    }

    /// Dispatch one request.
    ///
    /// # Errors
    ///
    /// Returns the wire error to send back; the session stays usable.
    pub fn handle(&mut self, method: &str, params: &[JsonValue]) -> Result<JsonValue, WireError> {
        match Method::from_name(method) {
            Some(Method::Open) => self.open(params),
            Some(Method::Exec) => self.exec(params),
            Some(Method::Query) => self.query(params),
            Some(Method::Close) => self.close(),
            None => Err(WireError::invalid_method_call()),
        }
    }

    fn open(&mut self, params: &[JsonValue]) -> Result<JsonValue, WireError> {
        if self.conn.is_some() {
            return Err(WireError::invalid_method_call());
        }
        let filename = params
            .first()
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WireError::new("open requires a filename", None))?;
        let flags = parse_open_flags(params.get(1))?;

        let conn = Connection::open_with_flags(filename, flags).map_err(|e| engine_error(&e))?;
        self.conn = Some(conn);
        Ok(JsonValue::Null)
    }

    fn exec(&mut self, params: &[JsonValue]) -> Result<JsonValue, WireError> {
        let conn = self.live_handle()?;
        let sql = params
            .first()
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WireError::new("exec requires a statement", None))?;

        conn.execute_batch(sql).map_err(|e| engine_error(&e))?;
        Ok(result_payload(
            conn.last_insert_rowid(),
            conn.changes(),
            None,
        ))
    }

    fn query(&mut self, params: &[JsonValue]) -> Result<JsonValue, WireError> {
        let conn = self.live_handle()?;
        let sql = params
            .first()
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WireError::new("query requires a statement", None))?;

        let mut stmt = conn.prepare(sql).map_err(|e| engine_error(&e))?;
        match params.get(1) {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::Array(values)) => bind_positional(&mut stmt, values)?,
            Some(JsonValue::Object(entries)) => bind_named(&mut stmt, entries)?,
            Some(_) => {
                return Err(WireError::new(
                    "query parameters must be a list or an object",
                    None,
                ));
            }
        }

        let column_count = stmt.column_count();
        let mut columns = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            let name = stmt.column_name(idx).map_err(|e| engine_error(&e))?;
            columns.push(name.to_string());
        }

        let mut out_rows = Vec::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next().map_err(|e| engine_error(&e))? {
            let mut cells = Map::new();
            for (idx, name) in columns.iter().enumerate() {
                let value = row.get_ref(idx).map_err(|e| engine_error(&e))?;
                cells.insert(name.clone(), cell_to_wire(value));
            }
            out_rows.push(JsonValue::Object(cells));
        }
        drop(rows);
        drop(stmt);

        Ok(result_payload(
            conn.last_insert_rowid(),
            conn.changes(),
            Some((columns, out_rows)),
        ))
    }

    fn close(&mut self) -> Result<JsonValue, WireError> {
        let conn = self
            .conn
            .take()
            .ok_or_else(WireError::invalid_method_call)?;
        if let Err((conn, err)) = conn.close() {
            // Handle survives a failed close.
            let wire = engine_error(&err);
            self.conn = Some(conn);
            return Err(wire);
        }
        Ok(JsonValue::Null)
    }

    fn live_handle(&self) -> Result<&Connection, WireError> {
        self.conn.as_ref().ok_or_else(WireError::invalid_method_call)
    }
}

impl Default for SqliteSession {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_open_flags(value: Option<&JsonValue>) -> Result<OpenFlags, WireError> {
    match value {
        None | Some(JsonValue::Null) => Ok(OpenFlags::default()),
        Some(value) => {
            let bits = value
                .as_i64()
                .and_then(|bits| i32::try_from(bits).ok())
                .ok_or_else(|| WireError::new("open flags must be an integer", None))?;
            OpenFlags::from_bits(bits)
                .ok_or_else(|| WireError::new("unrecognized open flags", None))
        }
    }
}

fn engine_error(err: &rusqlite::Error) -> WireError {
    let code = match err {
        rusqlite::Error::SqliteFailure(cause, _) => Some(i64::from(cause.extended_code)),
        _ => None,
    };
    WireError::new(err.to_string(), code)
}

fn bind_positional(stmt: &mut Statement<'_>, values: &[JsonValue]) -> Result<(), WireError> {
    for (idx, value) in values.iter().enumerate() {
        let value = wire_to_sql(value)?;
        stmt.raw_bind_parameter(idx + 1, value)
            .map_err(|e| engine_error(&e))?;
    }
    Ok(())
}

fn bind_named(stmt: &mut Statement<'_>, entries: &Map<String, JsonValue>) -> Result<(), WireError> {
    for (name, value) in entries {
        let index = named_parameter_index(stmt, name)?;
        let value = wire_to_sql(value)?;
        stmt.raw_bind_parameter(index, value)
            .map_err(|e| engine_error(&e))?;
    }
    Ok(())
}

// Accept keys with or without the placeholder sigil.
fn named_parameter_index(stmt: &Statement<'_>, name: &str) -> Result<usize, WireError> {
    if name.starts_with([':', '@', '$']) {
        if let Some(index) = stmt.parameter_index(name).map_err(|e| engine_error(&e))? {
            return Ok(index);
        }
    } else {
        for sigil in [':', '@', '$'] {
            let candidate = format!("{sigil}{name}");
            if let Some(index) = stmt
                .parameter_index(&candidate)
                .map_err(|e| engine_error(&e))?
            {
                return Ok(index);
            }
        }
    }
    Err(WireError::new(
        format!("unknown named parameter: {name}"),
        None,
    ))
}

/// Infer the SQLite binding type of a wire value.
fn wire_to_sql(value: &JsonValue) -> Result<SqlValue, WireError> {
    if let Some(decoded) = decode_envelope(value) {
        return decoded
            .map(SqlValue::Blob)
            .map_err(|e| WireError::new(format!("invalid blob parameter: {e}"), None));
    }
    match value {
        JsonValue::Null => Ok(SqlValue::Null),
        JsonValue::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(SqlValue::Real(f))
            } else {
                Err(WireError::new("unrepresentable numeric parameter", None))
            }
        }
        JsonValue::String(s) => Ok(SqlValue::Text(s.clone())),
        other => Ok(SqlValue::Text(other.to_string())),
    }
}

fn cell_to_wire(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => {
            serde_json::Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number)
        }
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) if !text_requires_envelope(text) => JsonValue::String(text.to_string()),
            _ => blob_envelope(bytes),
        },
        ValueRef::Blob(bytes) => blob_envelope(bytes),
    }
}
