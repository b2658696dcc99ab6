use bytes::{BufMut, BytesMut};
use std::io;
use std::rc::Rc;

use super::chunked;
use crate::headers::HeaderMap;
use crate::http::{ReasonTable, StatusCode, Version};
use crate::log::warning;
use crate::transport::{Transport, TransportStatus};

/// Progress of a response.
///
/// Transitions only go forward: `NotStarted` -> `Started` -> `Ended`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResponseState {
    #[default]
    NotStarted,
    Started,
    Ended,
}

/// Chunked response writer bound to a connection transport.
///
/// ```text
/// NotStarted --start--> Started --send*--> Started --end--> Ended
/// ```
///
/// Every misuse is rejected with a [`ResponseError`] and leaves the response unchanged.
#[derive(Debug)]
pub struct ResponseWriter {
    transport: Box<dyn Transport>,
    reasons: Rc<ReasonTable>,
    state: ResponseState,
    status: Option<StatusCode>,
    /// Headers set before `start`.
    pending: HeaderMap,
    /// Headers actually written by `start`.
    headers: HeaderMap,
    bytes_written: u64,
    write_buffer: BytesMut,
}

impl ResponseWriter {
    pub fn new(transport: Box<dyn Transport>, reasons: Rc<ReasonTable>) -> Self {
        Self {
            transport,
            reasons,
            state: ResponseState::NotStarted,
            status: None,
            pending: HeaderMap::new(),
            headers: HeaderMap::new(),
            bytes_written: 0,
            write_buffer: BytesMut::with_capacity(512),
        }
    }

    #[inline]
    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Returns the status written by `start`.
    #[inline]
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Returns the merged header fields written by `start`, excluding `Transfer-Encoding`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the total payload bytes sent, chunk framing excluded.
    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Returns the reason phrase written for `status`.
    #[inline]
    pub fn reason(&self, status: StatusCode) -> &str {
        self.reasons.phrase(status)
    }

    #[inline]
    pub fn transport_status(&self) -> TransportStatus {
        self.transport.status()
    }

    /// Set a header field to be written by `start`.
    ///
    /// Fields set here are written before the fields given to `start`.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), ResponseError> {
        if self.state != ResponseState::NotStarted {
            return Err(self.misuse(ResponseError::AlreadyStarted));
        }
        self.pending.append(name, value);
        Ok(())
    }

    /// Write the status line and header section.
    ///
    /// `Transfer-Encoding: chunked` is always written first, followed by fields from
    /// [`set_header`][Self::set_header], then `headers`. A field in `headers` whose name was
    /// already set before `start` is skipped.
    pub fn start<I, N, V>(&mut self, status: StatusCode, headers: I) -> Result<(), ResponseError>
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: AsRef<str>,
    {
        if self.state != ResponseState::NotStarted {
            return Err(self.misuse(ResponseError::AlreadyStarted));
        }

        let mut merged = std::mem::take(&mut self.pending);
        let preset = merged.len();
        for (name, value) in headers {
            let (name, value) = (name.as_ref(), value.as_ref());
            if merged.iter().take(preset).any(|f| f.name().eq_ignore_ascii_case(name)) {
                continue;
            }
            merged.append(name, value);
        }

        let mut itoa = itoa::Buffer::new();
        let buf = &mut self.write_buffer;
        buf.put_slice(Version::Http11.as_str().as_bytes());
        buf.put_slice(b" ");
        buf.put_slice(itoa.format(status.as_u16()).as_bytes());
        buf.put_slice(b" ");
        buf.put_slice(self.reasons.phrase(status).as_bytes());
        buf.put_slice(b"\r\nTransfer-Encoding: chunked\r\n");
        for field in &merged {
            buf.put_slice(field.name().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(field.value().as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");

        self.state = ResponseState::Started;
        self.status = Some(status);
        self.headers = merged;
        self.flush()
    }

    /// Send one body chunk.
    ///
    /// An empty `data` is a no-op flush.
    pub fn send(&mut self, data: &[u8]) -> Result<(), ResponseError> {
        match self.state {
            ResponseState::NotStarted => return Err(self.misuse(ResponseError::NotStarted)),
            ResponseState::Ended => return Err(self.misuse(ResponseError::AlreadyEnded)),
            ResponseState::Started => {}
        }
        if data.is_empty() {
            return Ok(());
        }
        chunked::encode_chunk(data, &mut self.write_buffer);
        self.flush()?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Send optional last bytes, the terminating chunk, then close the write side.
    ///
    /// The response is `Ended` even if writing fails, the write side is closed exactly once.
    pub fn end(&mut self, data: Option<&[u8]>) -> Result<(), ResponseError> {
        match self.state {
            ResponseState::NotStarted => return Err(self.misuse(ResponseError::NotStarted)),
            ResponseState::Ended => return Err(self.misuse(ResponseError::AlreadyEnded)),
            ResponseState::Started => {}
        }

        let last = data.unwrap_or_default();
        chunked::encode_chunk(last, &mut self.write_buffer);
        chunked::encode_last(&mut self.write_buffer);

        let result = self.flush();
        if result.is_ok() {
            self.bytes_written += last.len() as u64;
        }
        self.state = ResponseState::Ended;
        self.transport.close();
        result
    }

    /// Close the write side without finishing the body.
    ///
    /// Used when a partially written response cannot be completed. Does nothing once ended.
    pub fn abort(&mut self) {
        if self.state == ResponseState::Ended {
            return;
        }
        self.state = ResponseState::Ended;
        self.write_buffer.clear();
        self.transport.close();
    }

    fn flush(&mut self) -> Result<(), ResponseError> {
        let data = self.write_buffer.split().freeze();
        self.transport.send(data).map_err(ResponseError::Transport)
    }

    fn misuse(&self, err: ResponseError) -> ResponseError {
        warning!("response misuse: {err}");
        err
    }
}

// ===== Error =====

/// Rejected response operation.
#[derive(Debug)]
pub enum ResponseError {
    /// `start` or `set_header` after the response started.
    AlreadyStarted,
    /// `send` or `end` before `start`.
    NotStarted,
    /// `send` or `end` after `end`.
    AlreadyEnded,
    /// Transport refused the bytes.
    Transport(io::Error),
}

impl std::error::Error for ResponseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::AlreadyStarted => f.write_str("response already started"),
            Self::NotStarted => f.write_str("response not started"),
            Self::AlreadyEnded => f.write_str("response already ended"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}
