//! Newline framing for worker communication.
//!
//! The bridge protocol is line-delimited: one UTF-8 JSON object per
//! `\n`-terminated line. The codec reassembles arbitrary byte chunks into
//! complete lines, buffering any unterminated tail across reads, and works
//! over any AsyncRead/AsyncWrite (child stdio here).

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Hard cap on a single framed line.
///
/// A minute of synthesized audio is a few megabytes of base64; 64 MiB leaves
/// ample headroom. A line exceeding the cap is a fatal channel error, never a
/// silent truncation.
pub const MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A single line exceeded the configured cap.
    #[error("frame exceeds maximum line length of {limit} bytes")]
    LineTooLong { limit: usize },

    /// A complete line was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Codec that frames messages as newline-terminated UTF-8 lines.
///
/// Decoding strips the trailing `\n` (and an optional `\r`); UTF-8 is
/// validated only on complete lines, so a multi-byte sequence split across
/// reads reassembles correctly. Encoding appends exactly one `\n`.
pub struct LineCodec {
    max_length: usize,
    /// Offset already scanned for a newline, to avoid rescanning the head of
    /// the buffer on every partial read.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src[self.next_index..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline_index = self.next_index + offset;
                self.next_index = 0;

                if newline_index > self.max_length {
                    return Err(FrameError::LineTooLong {
                        limit: self.max_length,
                    });
                }

                let mut line = src.split_to(newline_index + 1);
                line.truncate(newline_index);
                if line.last() == Some(&b'\r') {
                    line.truncate(newline_index - 1);
                }

                let line = std::str::from_utf8(&line)?;
                tracing::trace!(len = line.len(), "Decoded frame");
                Ok(Some(line.to_string()))
            }
            None if src.len() > self.max_length => Err(FrameError::LineTooLong {
                limit: self.max_length,
            }),
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            // The worker exited mid-line; the fragment cannot be a complete
            // message.
            tracing::warn!(len = src.len(), "Discarding unterminated frame at EOF");
            src.clear();
            self.next_index = 0;
        }
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
