//! Per connection state.
//!
//! A [`Connection`] exists from accept until its response ended and nothing references it
//! anymore. It owns the [`Request`] parsed from the transport, the [`ResponseWriter`] writing
//! to it, the captures of the matched route, and at most one bound worker.
use std::rc::Rc;

use crate::common::ParseResult;
use crate::http::{Method, ReasonTable, StatusCode};
use crate::request::{self, DEFAULT_MAX_BODY, Params, ParseError, Request};
use crate::response::{ResponseError, ResponseState, ResponseWriter};
use crate::transport::{Transport, TransportStatus};
use crate::worker::{WorkerBinding, WorkerExit};

/// Connection identifier, unique within a runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

impl ConnId {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One accepted transport stream with its request and response.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    request: Request,
    response: ResponseWriter,
    captures: Vec<Option<String>>,
    pub(crate) worker: Option<WorkerBinding>,
    worker_exit: Option<WorkerExit>,
    pub(crate) deferred: bool,
    pub(crate) dispatched: bool,
}

impl Connection {
    pub fn new(
        id: ConnId,
        transport: Box<dyn Transport>,
        reasons: Rc<ReasonTable>,
        max_header: usize,
    ) -> Self {
        Self::with_limits(id, transport, reasons, max_header, DEFAULT_MAX_BODY)
    }

    /// Create connection whose request rejects heads past `max_header` and bodies past
    /// `max_body` bytes.
    pub fn with_limits(
        id: ConnId,
        transport: Box<dyn Transport>,
        reasons: Rc<ReasonTable>,
        max_header: usize,
        max_body: usize,
    ) -> Self {
        Self {
            id,
            request: Request::with_limits(max_header, max_body),
            response: ResponseWriter::new(transport, reasons),
            captures: Vec::new(),
            worker: None,
            worker_exit: None,
            deferred: false,
            dispatched: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    // ===== Request =====

    /// Append bytes read from the transport.
    #[inline]
    pub fn feed(&mut self, data: &[u8]) {
        self.request.extend(data);
    }

    /// Parse the buffered request head.
    ///
    /// Returns [`ParseResult::Pending`] until the header terminator arrives. See [`request::parse`].
    #[inline]
    pub fn parse(&mut self) -> ParseResult<(), ParseError> {
        request::parse(&mut self.request)
    }

    /// Parse the buffered bytes, ready only once the head and the whole body arrived.
    pub(crate) fn poll_request(&mut self) -> ParseResult<(), ParseError> {
        match self.parse() {
            ParseResult::Ok(()) => self.request.finish_body(),
            other => other,
        }
    }

    #[inline]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.request.method()
    }

    #[inline]
    pub fn path(&self) -> &str {
        self.request.path()
    }

    #[inline]
    pub fn query(&self) -> &str {
        self.request.query()
    }

    #[inline]
    pub fn host(&self) -> &str {
        self.request.host()
    }

    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        self.request.body()
    }

    #[inline]
    pub fn params(&self) -> &Params {
        self.request.params()
    }

    /// Returns the first value of request parameter `name`.
    #[inline]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.request.param(name)
    }

    // ===== Captures =====

    /// Returns capture group `index` of the matched route, `0` is the whole match.
    ///
    /// Returns `None` for an out of range index or a group that did not participate.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.captures.get(index)?.as_deref()
    }

    #[inline]
    pub fn args(&self) -> &[Option<String>] {
        &self.captures
    }

    /// Replace captures of the previous match.
    pub(crate) fn set_captures(&mut self, captures: Vec<Option<String>>) {
        self.captures = captures;
    }

    // ===== Response =====

    #[inline]
    pub fn response(&self) -> &ResponseWriter {
        &self.response
    }

    #[inline]
    pub(crate) fn response_mut(&mut self) -> &mut ResponseWriter {
        &mut self.response
    }

    #[inline]
    pub fn transport_status(&self) -> TransportStatus {
        self.response.transport_status()
    }

    /// See [`ResponseWriter::set_header`].
    #[inline]
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), ResponseError> {
        self.response.set_header(name, value)
    }

    /// See [`ResponseWriter::start`].
    #[inline]
    pub fn start<I, N, V>(&mut self, status: StatusCode, headers: I) -> Result<(), ResponseError>
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: AsRef<str>,
    {
        self.response.start(status, headers)
    }

    /// See [`ResponseWriter::send`].
    #[inline]
    pub fn send(&mut self, data: impl AsRef<[u8]>) -> Result<(), ResponseError> {
        self.response.send(data.as_ref())
    }

    /// See [`ResponseWriter::end`].
    #[inline]
    pub fn end(&mut self, data: Option<&[u8]>) -> Result<(), ResponseError> {
        self.response.end(data)
    }

    /// Respond with `status` and its reason phrase as a plain text body.
    pub fn respond(&mut self, status: StatusCode) -> Result<(), ResponseError> {
        self.response.start(status, [("Content-Type", "text/plain")])?;
        let phrase = self.response.reason(status).to_owned();
        self.response.end(Some(phrase.as_bytes()))
    }

    /// Respond with `302` to `location`.
    pub fn redirect(&mut self, location: &str) -> Result<(), ResponseError> {
        self.response.start(StatusCode::FOUND, [("Location", location)])?;
        self.response.end(None)
    }

    // ===== Worker =====

    /// Returns `true` while a worker process is bound.
    #[inline]
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Returns the exit of the last worker bound to this connection.
    #[inline]
    pub fn worker_exit(&self) -> Option<WorkerExit> {
        self.worker_exit
    }

    pub(crate) fn set_worker_exit(&mut self, exit: WorkerExit) {
        self.worker_exit = Some(exit);
    }

    /// Returns `true` while a continuation of this connection is pending.
    #[inline]
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Returns `true` when nothing will write to the connection anymore.
    pub(crate) fn is_finished(&self) -> bool {
        self.response.state() == ResponseState::Ended && self.worker.is_none() && !self.deferred
    }
}
