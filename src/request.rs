//! HTTP Request.
//!
//! [`Request`] owns the raw input buffer of a connection together with everything derived from it
//! by [`parse`]. Derived fields are only populated once the header terminator has been seen.
use bytes::{Bytes, BytesMut};
use std::cell::OnceCell;

use crate::common::ParseResult;
use crate::headers::HeaderMap;
use crate::http::{Method, Version};
use crate::response::chunked;

mod parser;
mod params;

pub use parser::{ParseError, parse};
pub use params::{ParamValue, Params, decode_component, decode_form};


/// Default limit of the request head, request line and header fields included.
pub const DEFAULT_MAX_HEADER: usize = 0x2000;

/// Default limit of the request body, after chunked decoding.
pub const DEFAULT_MAX_BODY: usize = 0x40_0000;

/// Progress of the request parser.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParseState {
    /// Header terminator has not been seen yet.
    #[default]
    AwaitingHeader,
    /// Request line and header fields are available.
    HeaderParsed,
}

/// Incrementally parsed HTTP request.
#[derive(Debug)]
pub struct Request {
    buffer: BytesMut,
    max_header: usize,
    max_body: usize,
    state: ParseState,
    /// Offset of the first body byte in `buffer`.
    body_offset: usize,
    /// Set once `body` holds the complete body.
    complete: bool,
    /// Bytes of chunked framing past `body_offset` already decoded into `decoded`.
    chunk_scanned: usize,
    decoded: BytesMut,
    method: Method,
    version: Version,
    target: String,
    path: String,
    query: String,
    headers: HeaderMap,
    body: Bytes,
    params: OnceCell<Params>,
}

impl Default for Request {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_HEADER, DEFAULT_MAX_BODY)
    }
}

impl Request {
    /// Create empty request that rejects heads larger than `max_header` bytes.
    pub fn with_max_header(max_header: usize) -> Self {
        Self::with_limits(max_header, DEFAULT_MAX_BODY)
    }

    /// Create empty request that rejects heads larger than `max_header` bytes and bodies larger
    /// than `max_body` bytes.
    pub fn with_limits(max_header: usize, max_body: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            max_header,
            max_body,
            state: ParseState::AwaitingHeader,
            body_offset: 0,
            complete: false,
            chunk_scanned: 0,
            decoded: BytesMut::new(),
            method: Method::GET,
            version: Version::Http11,
            target: String::new(),
            path: String::new(),
            query: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            params: OnceCell::new(),
        }
    }

    /// Append raw bytes read from the transport.
    #[inline]
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns all bytes received so far.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.buffer
    }

    #[inline]
    pub fn state(&self) -> ParseState {
        self.state
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the request target exactly as received, e.g: `/a%20b?x=1`.
    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the percent-decoded path.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string without the leading `?`, empty if there is none.
    #[inline]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Case-insensitive header lookup.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns the `Host` header, or empty string.
    #[inline]
    pub fn host(&self) -> &str {
        self.headers.get("host").unwrap_or_default()
    }

    /// Returns body bytes received so far.
    ///
    /// After the runtime dispatches the request, this is the complete body with any chunked
    /// framing removed.
    pub fn body(&self) -> &[u8] {
        if self.complete {
            &self.body
        } else if self.state == ParseState::HeaderParsed {
            &self.buffer[self.body_offset..]
        } else {
            &[]
        }
    }

    /// Returns request parameters, computed once on first access.
    ///
    /// See [`Params::from_request`] for the merge policy.
    pub fn params(&self) -> &Params {
        self.params.get_or_init(|| Params::from_request(self))
    }

    /// Returns the first value of the parameter `name`.
    #[inline]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params().get(name).map(ParamValue::first)
    }

    /// Wait until the whole body is buffered.
    ///
    /// The body is complete when `Content-Length` bytes arrived, or when the terminating chunk
    /// of a chunked body arrived. Without either header, whatever follows the head is the body.
    /// On completion the body is trimmed to its declared length or decoded from chunked framing.
    ///
    /// A body declared or decoded past the body limit fails with [`ParseError::BodyTooLarge`].
    pub fn finish_body(&mut self) -> ParseResult<(), ParseError> {
        debug_assert_eq!(self.state, ParseState::HeaderParsed);

        if self.complete {
            return ParseResult::Ok(());
        }

        let is_chunked = self
            .headers
            .get("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));

        if is_chunked {
            return self.decode_chunks();
        }

        let len = match self.headers.get("content-length") {
            Some(len) => match len.trim().parse::<usize>() {
                Ok(len) if len > self.max_body => return ParseResult::Err(ParseError::BodyTooLarge),
                Ok(len) => len,
                Err(_) => return ParseResult::Err(ParseError::InvalidContentLength),
            },
            None => self.buffer.len() - self.body_offset,
        };
        if self.buffer.len() - self.body_offset < len {
            return ParseResult::Pending;
        }
        let start = self.body_offset;
        self.body = Bytes::copy_from_slice(&self.buffer[start..start + len]);
        self.complete = true;
        ParseResult::Ok(())
    }

    /// Decode every complete chunk that arrived since the last call.
    fn decode_chunks(&mut self) -> ParseResult<(), ParseError> {
        loop {
            let rest = &self.buffer[self.body_offset + self.chunk_scanned..];
            match chunked::frame(rest) {
                ParseResult::Pending => {
                    let pending = self.decoded.len() + rest.len();
                    if pending > self.max_body + chunked::MAX_LINE + 2 {
                        return ParseResult::Err(ParseError::BodyTooLarge);
                    }
                    return ParseResult::Pending;
                }
                ParseResult::Err(_) => return ParseResult::Err(ParseError::InvalidChunked),
                ParseResult::Ok(chunked::Frame::Data { data, consumed }) => {
                    if self.decoded.len() + data.len() > self.max_body {
                        return ParseResult::Err(ParseError::BodyTooLarge);
                    }
                    self.decoded.extend_from_slice(&rest[data]);
                    self.chunk_scanned += consumed;
                }
                ParseResult::Ok(chunked::Frame::Last { .. }) => {
                    self.body = std::mem::take(&mut self.decoded).freeze();
                    self.complete = true;
                    return ParseResult::Ok(());
                }
            }
        }
    }
}
