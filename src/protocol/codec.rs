use serde_json::Value as JsonValue;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::SidecarError;

/// Ceiling on a single frame, terminator included.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Newline-delimited JSON frames.
///
/// One compact JSON object per line, separated by a single `\n`; no length
/// prefix. The decoder buffers up to `max_frame` bytes and yields one
/// decoded object per separator. An oversized or malformed frame is fatal:
/// the codec is poisoned and every later decode fails the same way.
///
/// The type is sans-io so the async side can drive it through
/// `FramedRead`/`FramedWrite` while the worker feeds it from a blocking
/// read loop.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame: usize,
    // Offset already scanned for a separator, so partial reads do not rescan.
    scanned: usize,
    poisoned: bool,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_BYTES)
    }

    #[must_use]
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame,
            scanned: 0,
            poisoned: false,
        }
    }

    fn poison(&mut self, message: String) -> SidecarError {
        self.poisoned = true;
        SidecarError::Protocol(message)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = JsonValue;
    type Error = SidecarError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<JsonValue>, SidecarError> {
        if self.poisoned {
            return Err(SidecarError::Protocol("frame decoder closed".to_string()));
        }

        let Some(offset) = src[self.scanned..].iter().position(|&b| b == b'\n') else {
            if src.len() > self.max_frame {
                return Err(self.poison(format!(
                    "frame exceeds {} byte limit",
                    self.max_frame
                )));
            }
            self.scanned = src.len();
            return Ok(None);
        };

        let line_end = self.scanned + offset;
        self.scanned = 0;
        if line_end > self.max_frame {
            return Err(self.poison(format!(
                "frame exceeds {} byte limit",
                self.max_frame
            )));
        }

        let line = src.split_to(line_end + 1);
        let frame = &line[..line_end];
        match serde_json::from_slice(frame) {
            Ok(value) => Ok(Some(value)),
            Err(err) => Err(self.poison(format!("malformed frame: {err}"))),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<JsonValue>, SidecarError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(self.poison("truncated frame at end of stream".to_string())),
        }
    }
}

impl Encoder<JsonValue> for FrameCodec {
    type Error = SidecarError;

    fn encode(&mut self, item: JsonValue, dst: &mut BytesMut) -> Result<(), SidecarError> {
        Encoder::<&JsonValue>::encode(self, &item, dst)
    }
}

impl Encoder<&JsonValue> for FrameCodec {
    type Error = SidecarError;

    fn encode(&mut self, item: &JsonValue, dst: &mut BytesMut) -> Result<(), SidecarError> {
        let bytes = serde_json::to_vec(item)
            .map_err(|err| SidecarError::Protocol(format!("unencodable frame: {err}")))?;
        dst.reserve(bytes.len() + 1);
        dst.put_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<JsonValue> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) = codec.decode(buf) {
            out.push(frame);
        }
        out
    }

    #[test]
    fn splits_frames_on_newline() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\n{\"b\":2}\n"[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![json!({"a": 1}), json!({"b": 2})]);
        assert!(buf.is_empty());
    }

    #[test]
    fn buffers_partial_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"1}\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"a": 1})));
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut codec = FrameCodec::with_max_frame(8);
        let mut buf = BytesMut::from(&b"{\"aaaaaaaaaa\":1}"[..]);
        assert!(codec.decode(&mut buf).is_err());
        // Poisoned: even a well-formed follow-up fails.
        let mut ok = BytesMut::from(&b"{}\n"[..]);
        assert!(codec.decode(&mut ok).is_err());
    }

    #[test]
    fn malformed_json_is_fatal() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"nope{\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
        let mut ok = BytesMut::from(&b"{}\n"[..]);
        assert!(codec.decode(&mut ok).is_err());
    }

    #[test]
    fn zero_float_survives_round_trip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        Encoder::<JsonValue>::encode(&mut codec, json!({"v": 0.0}), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"v\":0.0}\n");

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame["v"].is_f64());
    }

    #[test]
    fn eof_with_partial_frame_errors() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}"[..]);
        assert!(codec.decode_eof(&mut buf).is_err());
    }

    #[test]
    fn eof_with_empty_buffer_is_clean() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
