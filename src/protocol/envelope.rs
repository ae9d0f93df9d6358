use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

/// Stream decode failure; terminal, emitted without an id.
pub const PARSE_ERROR: i64 = -32700;
/// Malformed request envelope; terminal, emitted without an id.
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown method, or a method unavailable in the current state; soft.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// The four operations the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Open,
    Exec,
    Query,
    Close,
}

impl Method {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Method> {
        match name {
            "open" => Some(Method::Open),
            "exec" => Some(Method::Exec),
            "query" => Some(Method::Query),
            "close" => Some(Method::Close),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Method::Open => "open",
            Method::Exec => "exec",
            Method::Query => "query",
            Method::Close => "close",
        }
    }
}

/// Error payload carried inside a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl WireError {
    #[must_use]
    pub fn new(message: impl Into<String>, code: Option<i64>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    /// The soft rejection for a method that is unknown or unavailable in
    /// the current worker state.
    #[must_use]
    pub fn invalid_method_call() -> Self {
        Self::new("invalid method call", Some(METHOD_NOT_FOUND))
    }
}

/// A validated request as the worker sees it.
///
/// The id is echoed back verbatim, whatever scalar the client chose.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub id: JsonValue,
    pub method: String,
    pub params: Vec<JsonValue>,
}

/// A decoded response as the dispatcher sees it.
#[derive(Debug, Clone)]
pub enum ResponseFrame {
    Result { id: u64, result: JsonValue },
    Error { id: u64, error: WireError },
    /// Stream-level failure the worker emits before closing; carries no id.
    Terminal { error: WireError },
}

/// Build a request frame with a numeric correlation id.
#[must_use]
pub fn request(id: u64, method: Method, params: Vec<JsonValue>) -> JsonValue {
    json!({
        "id": id,
        "method": method.name(),
        "params": params,
    })
}

/// Build a success response echoing the request id.
#[must_use]
pub fn result_frame(id: &JsonValue, result: JsonValue) -> JsonValue {
    json!({
        "id": id,
        "result": result,
    })
}

/// Build an error response echoing the request id.
#[must_use]
pub fn error_frame(id: &JsonValue, error: &WireError) -> JsonValue {
    json!({
        "id": id,
        "error": error,
    })
}

/// Build the final id-less frame the worker writes before closing the
/// stream on a terminal failure.
#[must_use]
pub fn terminal_error_frame(code: i64, message: &str) -> JsonValue {
    json!({
        "error": { "code": code, "message": message },
    })
}

fn is_scalar(value: &JsonValue) -> bool {
    value.is_number() || value.is_string()
}

/// Validate an incoming frame as a request.
///
/// # Errors
///
/// Returns the terminal `WireError` (code `INVALID_REQUEST`) when the
/// `(id, method, params)` triple is missing or badly typed; the caller is
/// expected to emit it and close the stream.
pub fn parse_request(frame: JsonValue) -> Result<RequestFrame, WireError> {
    let JsonValue::Object(mut fields) = frame else {
        return Err(WireError::new("request is not an object", Some(INVALID_REQUEST)));
    };

    let id = fields
        .remove("id")
        .filter(is_scalar)
        .ok_or_else(|| WireError::new("request id missing or not a scalar", Some(INVALID_REQUEST)))?;

    let method = match fields.remove("method") {
        Some(JsonValue::String(name)) => name,
        _ => {
            return Err(WireError::new(
                "request method missing or not a string",
                Some(INVALID_REQUEST),
            ));
        }
    };

    let params = match fields.remove("params") {
        Some(JsonValue::Array(values)) => values,
        _ => {
            return Err(WireError::new(
                "request params missing or not a list",
                Some(INVALID_REQUEST),
            ));
        }
    };

    Ok(RequestFrame { id, method, params })
}

fn parse_wire_error(value: JsonValue) -> Option<WireError> {
    let JsonValue::Object(mut fields) = value else {
        return None;
    };
    let message = match fields.remove("message") {
        Some(JsonValue::String(message)) => message,
        _ => return None,
    };
    let code = match fields.remove("code") {
        Some(JsonValue::Number(code)) => Some(code.as_i64()?),
        None => None,
        Some(_) => return None,
    };
    Some(WireError { message, code })
}

/// Decode a frame from the worker into a response.
///
/// # Errors
///
/// Returns a description of the malformation; the dispatcher treats any
/// such frame as terminal.
pub fn parse_response(frame: JsonValue) -> Result<ResponseFrame, String> {
    let JsonValue::Object(mut fields) = frame else {
        return Err("response is not an object".to_string());
    };

    let id = fields.remove("id");
    let result = fields.remove("result");
    let error = fields.remove("error");

    match (id, result, error) {
        (None, None, Some(error)) => {
            let error =
                parse_wire_error(error).ok_or_else(|| "malformed error payload".to_string())?;
            Ok(ResponseFrame::Terminal { error })
        }
        (Some(id), result, error) => {
            let id = id
                .as_u64()
                .ok_or_else(|| "response id is not an unsigned integer".to_string())?;
            match (result, error) {
                (Some(result), None) => Ok(ResponseFrame::Result { id, result }),
                (None, Some(error)) => {
                    let error = parse_wire_error(error)
                        .ok_or_else(|| "malformed error payload".to_string())?;
                    Ok(ResponseFrame::Error { id, error })
                }
                _ => Err("response must carry exactly one of result/error".to_string()),
            }
        }
        _ => Err("response carries neither id nor error".to_string()),
    }
}

/// Build the result payload shared by `exec` and `query` responses.
#[must_use]
pub fn result_payload(
    insert_id: i64,
    changed: u64,
    columns_and_rows: Option<(Vec<String>, Vec<JsonValue>)>,
) -> JsonValue {
    let mut payload = Map::new();
    payload.insert("insertId".to_string(), json!(insert_id));
    payload.insert("changed".to_string(), json!(changed));
    if let Some((columns, rows)) = columns_and_rows {
        payload.insert("columns".to_string(), json!(columns));
        payload.insert("rows".to_string(), JsonValue::Array(rows));
    }
    JsonValue::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let frame = request(7, Method::Query, vec![json!("SELECT 1"), json!([])]);
        let parsed = parse_request(frame).unwrap();
        assert_eq!(parsed.id, json!(7));
        assert_eq!(parsed.method, "query");
        assert_eq!(parsed.params.len(), 2);
    }

    #[test]
    fn request_without_id_is_invalid() {
        let err = parse_request(json!({"method": "exec", "params": []})).unwrap_err();
        assert_eq!(err.code, Some(INVALID_REQUEST));
    }

    #[test]
    fn request_with_object_params_is_invalid() {
        let err =
            parse_request(json!({"id": 1, "method": "exec", "params": {}})).unwrap_err();
        assert_eq!(err.code, Some(INVALID_REQUEST));
    }

    #[test]
    fn response_variants_parse() {
        let ok = parse_response(json!({"id": 3, "result": null})).unwrap();
        assert!(matches!(ok, ResponseFrame::Result { id: 3, .. }));

        let err = parse_response(json!({"id": 3, "error": {"message": "no", "code": -32601}}))
            .unwrap();
        match err {
            ResponseFrame::Error { id, error } => {
                assert_eq!(id, 3);
                assert_eq!(error.code, Some(METHOD_NOT_FOUND));
            }
            other => panic!("unexpected response: {other:?}"),
        }

        let terminal =
            parse_response(json!({"error": {"message": "bad", "code": -32700}})).unwrap();
        assert!(matches!(terminal, ResponseFrame::Terminal { .. }));
    }

    #[test]
    fn response_with_both_result_and_error_is_malformed() {
        assert!(parse_response(json!({"id": 1, "result": 1, "error": {"message": "x"}})).is_err());
    }
}
