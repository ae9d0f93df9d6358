//! The worker side of the wire protocol: a single-threaded RPC loop that
//! owns at most one SQLite handle and blocks for the duration of every
//! statement. The parent keeps its event loop responsive by running this
//! in a child process.

pub mod io;
pub mod session;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

use tracing::{debug, error, info};

use crate::protocol::envelope::{self, INVALID_REQUEST, PARSE_ERROR};
use io::{BlockingFrameReader, BlockingFrameWriter};
use session::SqliteSession;

/// Serve requests until the input stream ends or a terminal failure.
///
/// Returns the process exit code: 0 for an orderly shutdown (EOF on
/// input), non-zero after a terminal protocol failure. Terminal failures
/// are reported as a final id-less error frame before the stream closes.
pub fn serve<R: Read, W: Write>(input: R, output: W) -> i32 {
    let mut reader = BlockingFrameReader::new(input);
    let mut writer = BlockingFrameWriter::new(output);
    let mut session = SqliteSession::new();

    loop {
        let frame = match reader.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("input stream ended, shutting down");
                return 0;
            }
            Err(err) => {
                error!("fatal frame decode failure: {err}");
                let frame = envelope::terminal_error_frame(PARSE_ERROR, &err.to_string());
                let _ = writer.write_frame(&frame);
                return 1;
            }
        };

        let request = match envelope::parse_request(frame) {
            Ok(request) => request,
            Err(wire_err) => {
                error!("malformed request envelope: {}", wire_err.message);
                let frame = envelope::terminal_error_frame(INVALID_REQUEST, &wire_err.message);
                let _ = writer.write_frame(&frame);
                return 1;
            }
        };

        debug!(method = %request.method, "dispatching request");
        let response = match session.handle(&request.method, &request.params) {
            Ok(result) => envelope::result_frame(&request.id, result),
            Err(wire_err) => envelope::error_frame(&request.id, &wire_err),
        };

        if let Err(err) = writer.write_frame(&response) {
            error!("response write failed: {err}");
            return 1;
        }
    }
}

/// Worker entrypoint: serve the standard streams, or connect back to the
/// parent's loopback listener when an endpoint argument is given.
#[must_use]
pub fn run(endpoint: Option<&str>) -> i32 {
    match endpoint {
        None => {
            info!("serving on standard streams");
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            serve(stdin.lock(), stdout.lock())
        }
        Some(addr) => match TcpStream::connect(addr) {
            Ok(stream) => {
                info!("connected back to {addr}");
                let reader = match stream.try_clone() {
                    Ok(reader) => reader,
                    Err(err) => {
                        error!("failed to clone socket: {err}");
                        return 2;
                    }
                };
                let code = serve(reader, &stream);
                let _ = stream.shutdown(Shutdown::Both);
                code
            }
            Err(err) => {
                error!("failed to connect back to {addr}: {err}");
                2
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};

    fn run_script(lines: &[JsonValue]) -> (i32, Vec<JsonValue>) {
        let mut input = Vec::new();
        for line in lines {
            input.extend_from_slice(serde_json::to_string(line).unwrap().as_bytes());
            input.push(b'\n');
        }
        let mut output = Vec::new();
        let code = serve(&input[..], &mut output);
        let frames = output
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect();
        (code, frames)
    }

    #[test]
    fn open_query_close_round_trip() {
        let (code, frames) = run_script(&[
            json!({"id": 1, "method": "open", "params": [":memory:"]}),
            json!({"id": 2, "method": "query", "params": ["SELECT 1 AS value", []]}),
            json!({"id": 3, "method": "close", "params": []}),
        ]);
        assert_eq!(code, 0);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], json!({"id": 1, "result": null}));
        assert_eq!(frames[1]["result"]["rows"], json!([{"value": 1}]));
        assert_eq!(frames[2], json!({"id": 3, "result": null}));
    }

    #[test]
    fn responses_follow_receipt_order() {
        let (code, frames) = run_script(&[
            json!({"id": 10, "method": "open", "params": [":memory:"]}),
            json!({"id": 11, "method": "exec", "params": ["CREATE TABLE t (v)"]}),
            json!({"id": 12, "method": "exec", "params": ["INSERT INTO t VALUES (1)"]}),
            json!({"id": 13, "method": "query", "params": ["SELECT v FROM t", []]}),
        ]);
        assert_eq!(code, 0);
        let ids: Vec<_> = frames.iter().map(|f| f["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![10, 11, 12, 13]);
    }

    #[test]
    fn malformed_envelope_terminates_with_final_error() {
        let (code, frames) = run_script(&[
            json!({"id": 1, "method": "open", "params": [":memory:"]}),
            json!({"method": "exec", "params": ["SELECT 1"]}),
            // Never reached.
            json!({"id": 3, "method": "close", "params": []}),
        ]);
        assert_eq!(code, 1);
        assert_eq!(frames.len(), 2);
        assert!(frames[1].get("id").is_none());
        assert_eq!(frames[1]["error"]["code"], json!(INVALID_REQUEST));
    }

    #[test]
    fn malformed_json_terminates_with_parse_error() {
        let mut input = Vec::new();
        input.extend_from_slice(b"{\"id\":1,\"method\":\"open\",\"params\":[\":memory:\"]}\n");
        input.extend_from_slice(b"not json\n");
        let mut output = Vec::new();
        let code = serve(&input[..], &mut output);
        assert_eq!(code, 1);
        let last = output
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .next_back()
            .unwrap();
        let frame: JsonValue = serde_json::from_slice(last).unwrap();
        assert_eq!(frame["error"]["code"], json!(PARSE_ERROR));
    }

    #[test]
    fn soft_errors_keep_the_loop_alive() {
        let (code, frames) = run_script(&[
            json!({"id": 1, "method": "exec", "params": ["SELECT 1"]}),
            json!({"id": 2, "method": "open", "params": [":memory:"]}),
            json!({"id": 3, "method": "query", "params": ["SELECT 2 AS v", []]}),
        ]);
        assert_eq!(code, 0);
        assert_eq!(frames[0]["error"]["message"], json!("invalid method call"));
        assert_eq!(frames[2]["result"]["rows"], json!([{"v": 2}]));
    }
}
