//! Newline-delimited line codec
//!
//! Frames the byte stream into UTF-8 text lines for `FramedRead` and
//! writes `\n`-terminated lines for `FramedWrite`. Unlike
//! `tokio_util::codec::LinesCodec`, an oversized line is not a stream
//! error: its bytes are discarded up to the next newline and a single
//! [`Inbound::TooLong`] marker is produced, so the connection survives.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One decoded unit of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A line without its terminator (`\n` or `\r\n`)
    Line(String),
    /// A line longer than the limit was dropped
    TooLong,
}

/// Line codec with a per-line byte limit
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline
    next_index: usize,
    /// Inside an oversized line, dropping until the next newline
    discarding: bool,
}

impl LineCodec {
    /// Create a codec that accepts lines of at most `max_length` bytes,
    /// terminator excluded
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

/// Line content without a trailing `\r`
fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl Decoder for LineCodec {
    type Item = Inbound;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        loop {
            if self.discarding {
                match buf.iter().position(|b| *b == b'\n') {
                    Some(offset) => {
                        buf.advance(offset + 1);
                        self.discarding = false;
                        return Ok(Some(Inbound::TooLong));
                    }
                    None => {
                        buf.clear();
                        return Ok(None);
                    }
                }
            }

            // A trailing '\r' does not count against the limit, so the search
            // window is two bytes wider than it.
            let read_to = buf.len().min(self.max_length.saturating_add(2));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match newline {
                Some(index) => {
                    self.next_index = 0;
                    let line = buf.split_to(index + 1);
                    let line = &line[..index];
                    let content = strip_cr(line);
                    if content.len() > self.max_length {
                        return Ok(Some(Inbound::TooLong));
                    }
                    let text = String::from_utf8_lossy(content).into_owned();
                    return Ok(Some(Inbound::Line(text)));
                }
                None if buf.len() > self.max_length.saturating_add(1) => {
                    self.next_index = 0;
                    self.discarding = true;
                }
                None => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if self.discarding {
            buf.clear();
            self.discarding = false;
            return Ok(Some(Inbound::TooLong));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // Unterminated last line
        self.next_index = 0;
        let line = buf.split();
        let content = strip_cr(&line);
        if content.len() > self.max_length {
            return Ok(Some(Inbound::TooLong));
        }
        Ok(Some(Inbound::Line(String::from_utf8_lossy(content).into_owned())))
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, buf: &mut BytesMut) -> Result<(), io::Error> {
        buf.reserve(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
        Ok(())
    }
}
