//! Framed codecs for the upstream channel and peer sockets.
//!
//! Reading uses AnyDelimiterCodec split on `\n` so payloads stay raw bytes.
//! Writing encodes one [`Event`] per line. Works over any AsyncRead/AsyncWrite.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::protocol::{Event, NEWLINE};

/// Upper bound on a single line unless configured otherwise.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// One decoded line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Line content with `\n` (and a preceding `\r`) stripped.
    Complete(Bytes),
    /// A line exceeded the length bound and was discarded up to its terminator.
    TooLong,
}

/// Newline-delimited decoder that survives over-long lines.
///
/// FramedRead ends the stream after the first decoder error, so an
/// over-long line is reported as [`Line::TooLong`] instead of an error.
pub struct LineCodec {
    inner: AnyDelimiterCodec,
    max_length: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                vec![NEWLINE],
                vec![NEWLINE],
                max_length,
            ),
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn finish(
        result: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Line>, io::Error> {
        match result {
            Ok(Some(chunk)) => Ok(Some(Line::Complete(strip_cr(chunk)))),
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(Line::TooLong)),
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::finish(self.inner.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::finish(self.inner.decode_eof(src))
    }
}

fn strip_cr(chunk: Bytes) -> Bytes {
    match chunk.last() {
        Some(b'\r') => chunk.slice(..chunk.len() - 1),
        _ => chunk,
    }
}

/// Encoder writing one event line per item.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventCodec;

impl Encoder<Event> for EventCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Event, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
