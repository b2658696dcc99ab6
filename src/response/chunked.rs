//! Chunked transfer coding.
//!
//! [`encode_chunk`] frames one body chunk as `<hex-length>\r\n<bytes>\r\n`, [`encode_last`] writes
//! the terminating zero length chunk. [`decode`] reverses the framing over a possibly incomplete
//! buffer.
use bytes::{BufMut, BytesMut};
use std::ops::Range;

use crate::common::ParseResult;

const MAX_CHUNK_SIZE: u64 = u64::MAX >> 1;

/// Longest accepted size or trailer line, separator excluded.
pub const MAX_LINE: usize = 0x400;

/// Terminating chunk with an empty trailer section.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frame `chunk` into `dst`.
///
/// An empty chunk writes nothing, since a zero length chunk terminates the body.
pub fn encode_chunk(chunk: &[u8], dst: &mut BytesMut) {
    if chunk.is_empty() {
        return;
    }
    dst.reserve(chunk.len() + 20);
    put_hex(dst, chunk.len() as u64);
    dst.put_slice(b"\r\n");
    dst.put_slice(chunk);
    dst.put_slice(b"\r\n");
}

/// Write the terminating chunk into `dst`.
#[inline]
pub fn encode_last(dst: &mut BytesMut) {
    dst.put_slice(LAST_CHUNK);
}

fn put_hex(dst: &mut BytesMut, mut value: u64) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    let mut buf = [0u8; 16];
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = DIGITS[(value & 0xf) as usize];
        value >>= 4;
        if value == 0 {
            break;
        }
    }
    dst.put_slice(&buf[start..]);
}

/// Decode a chunked body.
///
/// Returns the concatenated chunk payloads and the number of bytes consumed from `src`, including
/// the last chunk and trailer section. Chunk extensions and trailer fields are discarded.
pub fn decode(src: &[u8]) -> ParseResult<(BytesMut, usize), ChunkError> {
    let mut payload = BytesMut::new();
    let mut offset = 0;

    loop {
        let rest = &src[offset..];
        match frame(rest) {
            ParseResult::Pending => return ParseResult::Pending,
            ParseResult::Err(err) => return ParseResult::Err(err),
            ParseResult::Ok(Frame::Data { data, consumed }) => {
                payload.extend_from_slice(&rest[data]);
                offset += consumed;
            }
            ParseResult::Ok(Frame::Last { consumed }) => {
                return ParseResult::Ok((payload, offset + consumed));
            }
        }
    }
}

/// One complete frame at the start of a chunked body.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// Data chunk, `data` is the payload range within the frame.
    Data { data: Range<usize>, consumed: usize },
    /// Last chunk together with the trailer section.
    Last { consumed: usize },
}

/// Parse the frame at the start of `src`.
///
/// Only the frame itself is inspected, so a body arriving in pieces can be decoded frame by
/// frame without rescanning what was already consumed.
pub fn frame(src: &[u8]) -> ParseResult<Frame, ChunkError> {
    let mut state = src;

    let line = match split_line(&mut state) {
        ParseResult::Ok(line) => line,
        ParseResult::Pending => return ParseResult::Pending,
        ParseResult::Err(err) => return ParseResult::Err(err),
    };
    let digits = match line.iter().position(|&b| b == b';') {
        Some(ext) => &line[..ext],
        None => line,
    };
    let size = match parse_hex(digits) {
        Some(size) if size > MAX_CHUNK_SIZE => return ParseResult::Err(ChunkError::TooLarge),
        Some(size) => size as usize,
        None => return ParseResult::Err(ChunkError::InvalidSize),
    };

    if size == 0 {
        loop {
            match split_line(&mut state) {
                ParseResult::Ok([]) => {
                    return ParseResult::Ok(Frame::Last { consumed: src.len() - state.len() });
                }
                ParseResult::Ok(_trailer) => continue,
                ParseResult::Pending => return ParseResult::Pending,
                ParseResult::Err(err) => return ParseResult::Err(err),
            }
        }
    }

    if state.len() < size {
        return ParseResult::Pending;
    }
    let start = src.len() - state.len();
    state = match &state[size..] {
        [b'\r', b'\n', rest @ ..] | [b'\n', rest @ ..] => rest,
        [] | [b'\r'] => return ParseResult::Pending,
        _ => return ParseResult::Err(ChunkError::MissingDelimiter),
    };
    ParseResult::Ok(Frame::Data { data: start..start + size, consumed: src.len() - state.len() })
}

/// Split one line off `state`, separator excluded.
fn split_line<'a>(state: &mut &'a [u8]) -> ParseResult<&'a [u8], ChunkError> {
    let window = &state[..state.len().min(MAX_LINE + 1)];
    let Some(lf) = window.iter().position(|&b| b == b'\n') else {
        if window.len() > MAX_LINE {
            return ParseResult::Err(ChunkError::LineTooLong);
        }
        return ParseResult::Pending;
    };
    let line = &state[..lf];
    *state = &state[lf + 1..];
    ParseResult::Ok(line.strip_suffix(b"\r").unwrap_or(line))
}

fn parse_hex(digits: &[u8]) -> Option<u64> {
    let digits = std::str::from_utf8(digits).ok()?.trim();
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

// ===== Error =====

/// Chunked body decoding error.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkError {
    /// Chunk size is not a hex number.
    InvalidSize,
    /// Chunk size is larger than supported.
    TooLarge,
    /// Chunk data is not followed by CRLF.
    MissingDelimiter,
    /// Size or trailer line exceeds [`MAX_LINE`].
    LineTooLong,
}

impl std::error::Error for ChunkError {}

impl std::fmt::Display for ChunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::InvalidSize => f.write_str("invalid chunk size"),
            Self::TooLarge => f.write_str("chunk too large"),
            Self::MissingDelimiter => f.write_str("missing chunk delimiter"),
            Self::LineTooLong => f.write_str("chunk line too long"),
        }
    }
}
