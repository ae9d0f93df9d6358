use std::io::{ErrorKind, Read, Write};

use serde_json::Value as JsonValue;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::SidecarError;
use crate::protocol::codec::FrameCodec;

const READ_CHUNK: usize = 8 * 1024;

/// Drives the shared frame codec from a blocking input stream.
///
/// Input is accumulated in an intermediate buffer, so a decode failure can
/// still be reported on the output stream before the worker exits.
pub struct BlockingFrameReader<R> {
    inner: R,
    codec: FrameCodec,
    buf: BytesMut,
    eof: bool,
}

impl<R: Read> BlockingFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            codec: FrameCodec::new(),
            buf: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
        }
    }

    /// Block until one frame is available, the stream ends, or decoding
    /// fails.
    ///
    /// # Errors
    ///
    /// Propagates read failures and fatal decode failures (oversized or
    /// malformed frames, a truncated tail at EOF).
    pub fn next_frame(&mut self) -> Result<Option<JsonValue>, SidecarError> {
        loop {
            if self.eof {
                return self.codec.decode_eof(&mut self.buf);
            }
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.inner.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Serialises frames onto a blocking output stream, one flush per frame.
pub struct BlockingFrameWriter<W> {
    inner: W,
    codec: FrameCodec,
    buf: BytesMut,
}

impl<W: Write> BlockingFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            codec: FrameCodec::new(),
            buf: BytesMut::new(),
        }
    }

    /// # Errors
    ///
    /// Propagates encoding and write failures.
    pub fn write_frame(&mut self, frame: &JsonValue) -> Result<(), SidecarError> {
        self.buf.clear();
        Encoder::<&JsonValue>::encode(&mut self.codec, frame, &mut self.buf)?;
        self.inner.write_all(&self.buf)?;
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_frames_from_a_blocking_stream() {
        let input: &[u8] = b"{\"id\":1,\"method\":\"close\",\"params\":[]}\n{\"id\":2}\n";
        let mut reader = BlockingFrameReader::new(input);
        assert_eq!(reader.next_frame().unwrap().unwrap()["id"], json!(1));
        assert_eq!(reader.next_frame().unwrap().unwrap()["id"], json!(2));
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn truncated_tail_is_an_error() {
        let input: &[u8] = b"{\"id\":1}";
        let mut reader = BlockingFrameReader::new(input);
        assert!(reader.next_frame().is_err());
    }

    #[test]
    fn writer_emits_one_line_per_frame() {
        let mut out = Vec::new();
        {
            let mut writer = BlockingFrameWriter::new(&mut out);
            writer.write_frame(&json!({"id": 1, "result": null})).unwrap();
            writer.write_frame(&json!({"id": 2, "result": 0.0})).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "{\"id\":1,\"result\":null}\n{\"id\":2,\"result\":0.0}\n");
    }
}
