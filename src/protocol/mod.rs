// Wire protocol: newline-delimited JSON frames carrying a small JSON-RPC
// dialect, plus the value encoding that smuggles SQLite's type domain
// (including blobs) through the text transport.
//
// - codec: framing (one JSON object per line, bounded buffer)
// - envelope: request/response frames and error codes
// - values: RowValues <-> wire value conversion, blob envelope

pub mod codec;
pub mod envelope;
pub mod values;

pub use codec::{FrameCodec, MAX_FRAME_BYTES};
pub use envelope::{
    Method, RequestFrame, ResponseFrame, WireError, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};
