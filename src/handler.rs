//! Request handlers.
//!
//! A [`Handler`] receives the dispatched connection through a [`Context`] and reports what
//! happened to the request with a [`Flow`]:
//!
//! - [`Flow::Done`], the handler finished with the connection. The response is expected to be
//!   ended, or handed to a worker.
//! - [`Flow::Defer`], the handler cannot complete yet. The runtime stores the returned
//!   [`Continuation`] and resumes it later, see [`defer`][crate::defer].
//!
//! Any error returned from a handler, or a panic inside it, is a handler fault.
use std::ffi::OsStr;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use crate::connection::Connection;
use crate::error::{BoxError, catch_panic};
use crate::worker::{Job, OutputTarget, WorkerBridge, WorkerError, WorkerHandle};

/// Result of a handler or continuation.
pub type HandlerResult = Result<Flow, BoxError>;

/// Outcome of a successful handler call.
#[derive(Debug)]
pub enum Flow {
    /// Handler is done with the connection.
    Done,
    /// Suspend and resume later.
    ///
    /// With `None`, the same callable is resumed again: a handler is re-run, a continuation is
    /// resumed itself.
    Defer(Option<Continuation>),
}

impl Flow {
    /// Suspend and resume with `f`.
    pub fn defer<F>(f: F) -> Flow
    where
        F: FnMut(&mut Context<'_>) -> HandlerResult + 'static,
    {
        Flow::Defer(Some(Continuation::new(f)))
    }
}

// ===== Handler =====

/// Shared request handler.
#[derive(Clone)]
pub struct Handler(Rc<dyn Fn(&mut Context<'_>) -> HandlerResult>);

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Context<'_>) -> HandlerResult + 'static,
    {
        Self(Rc::new(f))
    }

    /// Call the handler, a panic is returned as an error.
    pub fn call(&self, cx: &mut Context<'_>) -> HandlerResult {
        guarded(|| (self.0)(cx))
    }

    /// Returns a continuation that calls this handler again.
    pub(crate) fn retry(&self) -> Continuation {
        let handler = self.clone();
        Continuation::new(move |cx| (handler.0)(cx))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Handler")
    }
}

// ===== Continuation =====

/// Suspended rest of a handler.
pub struct Continuation(Box<dyn FnMut(&mut Context<'_>) -> HandlerResult>);

impl Continuation {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(&mut Context<'_>) -> HandlerResult + 'static,
    {
        Self(Box::new(f))
    }

    /// Resume the continuation, a panic is returned as an error.
    pub fn call(&mut self, cx: &mut Context<'_>) -> HandlerResult {
        guarded(|| (self.0)(cx))
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Continuation")
    }
}

fn guarded(f: impl FnOnce() -> HandlerResult) -> HandlerResult {
    catch_panic(f)?
}

// ===== Context =====

/// Handler view of a dispatched connection.
///
/// Dereferences to [`Connection`], and additionally gives access to worker processes.
pub struct Context<'a> {
    conn: &'a mut Connection,
    workers: &'a mut WorkerBridge,
}

impl<'a> Context<'a> {
    pub(crate) fn new(conn: &'a mut Connection, workers: &'a mut WorkerBridge) -> Self {
        Self { conn, workers }
    }

    /// Spawn `program` and stream its standard output as response chunks.
    ///
    /// The response is ended when the process exits. Fails if a worker is already bound.
    pub fn start_worker<I, S>(&mut self, program: &str, args: I) -> Result<WorkerHandle, WorkerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.workers.start_worker(self.conn, program, args)
    }

    /// Spawn `program`, write `job` to its standard input, and route its output to `target`.
    ///
    /// See [`WorkerBridge::start_job`].
    pub fn start_job<I, S>(
        &mut self,
        program: &str,
        args: I,
        job: &Job,
        target: OutputTarget,
    ) -> Result<WorkerHandle, WorkerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.workers.start_job(self.conn, program, args, job, target)
    }
}

impl Deref for Context<'_> {
    type Target = Connection;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl DerefMut for Context<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.conn
    }
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("conn", &self.conn.id()).finish_non_exhaustive()
    }
}
