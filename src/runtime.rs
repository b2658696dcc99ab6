//! Event loop state.
//!
//! A [`Runtime`] owns every connection of a server together with the defer queue and the worker
//! bridge. It is driven by a single task: transport reads and worker output are delivered as
//! [`Event`]s through the [`Inbox`], and [`Runtime::tick`] is called periodically to resume
//! deferred handlers. Nothing in here is shared between threads.
//!
//! # Handler faults
//!
//! An error or panic from a handler or continuation is a fault. If the response has not started
//! and no worker is bound, the client receives a `500`. Otherwise the connection is closed, since
//! a partial response cannot be taken back.
//!
//! A handler that returns [`Flow::Done`] without ending its response, and without a bound worker,
//! is finished by the runtime: `500` if nothing was written yet, otherwise the body is terminated.
use bytes::Bytes;
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::common::ParseResult;
use crate::config::Config;
use crate::connection::{ConnId, Connection};
use crate::defer::{DeferHost, DeferMode, DeferScheduler, FailureReason};
use crate::error::BoxError;
use crate::handler::{Context, Continuation, Flow, HandlerResult};
use crate::http::{ReasonTable, StatusCode};
use crate::log::{debug, error, warning};
use crate::request::ParseError;
use crate::response::ResponseState;
use crate::routing::{self, HandlerLookup};
use crate::transport::Transport;
use crate::worker::{self, WorkerBridge, WorkerExit, WorkerId};

#[cfg(test)]
mod test;

/// Input of the event loop.
#[derive(Debug)]
pub enum Event {
    /// Bytes read from a connection.
    Data(ConnId, Bytes),
    /// Peer closed the connection.
    Closed(ConnId),
    /// Reading from the connection failed.
    Failed(ConnId),
    /// Standard output of a worker.
    WorkerOutput { conn: ConnId, worker: WorkerId, data: Bytes },
    /// Worker process exited.
    WorkerExit { conn: ConnId, worker: WorkerId, exit: WorkerExit },
}

/// Sending half of the event loop inbox.
pub type EventSender = UnboundedSender<Event>;

/// Receiving half of the event loop inbox.
pub type Inbox = UnboundedReceiver<Event>;

/// Connection arena, defer queue and worker bridge of one server.
pub struct Runtime {
    core: Core,
    scheduler: DeferScheduler,
}

struct Core {
    connections: HashMap<ConnId, Connection>,
    lookup: Box<dyn HandlerLookup>,
    workers: WorkerBridge,
    events: EventSender,
    config: Config,
    reasons: Rc<ReasonTable>,
    next_id: u64,
}

impl Runtime {
    /// Create runtime dispatching requests to handlers selected by `lookup`.
    ///
    /// Events must be read from the returned [`Inbox`] and passed to [`handle`][Self::handle].
    pub fn new(lookup: impl HandlerLookup + 'static, config: Config) -> (Runtime, Inbox) {
        let (events, inbox) = unbounded_channel();
        let core = Core {
            connections: HashMap::new(),
            lookup: Box::new(lookup),
            workers: WorkerBridge::new(events.clone()),
            events,
            reasons: Rc::new(config.reasons.clone()),
            config,
            next_id: 0,
        };
        let runtime = Runtime { core, scheduler: DeferScheduler::new() };
        (runtime, inbox)
    }

    /// Returns a sender into the inbox of this runtime.
    pub fn events(&self) -> EventSender {
        self.core.events.clone()
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Register a newly accepted connection.
    pub fn connect(&mut self, transport: Box<dyn Transport>) -> ConnId {
        let core = &mut self.core;
        let id = ConnId(core.next_id);
        core.next_id += 1;

        let conn = Connection::with_limits(
            id,
            transport,
            core.reasons.clone(),
            core.config.max_header,
            core.config.max_body,
        );
        core.connections.insert(id, conn);
        debug!("{id} connected");
        id
    }

    /// Returns the connection `id`, if it is still alive.
    #[inline]
    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.core.connections.get(&id)
    }

    /// Returns the number of live connections.
    #[inline]
    pub fn len(&self) -> usize {
        self.core.connections.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.core.connections.is_empty()
    }

    /// Returns the number of queued continuations.
    #[inline]
    pub fn deferred(&self) -> usize {
        self.scheduler.len()
    }

    /// Register a hook called when a deferred connection is observed closed or failed.
    pub fn on_failure<F>(&mut self, hook: F)
    where
        F: FnMut(&Connection, FailureReason) + 'static,
    {
        self.scheduler.on_failure(hook);
    }

    /// Process one event.
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Data(id, data) => self.feed(id, &data),
            Event::Closed(id) | Event::Failed(id) => self.disconnect(id),
            Event::WorkerOutput { conn, worker, data } => self.core.worker_output(conn, worker, &data),
            Event::WorkerExit { conn, worker, exit } => self.core.worker_exit(conn, worker, exit),
        }
    }

    /// Feed bytes read from connection `id`, dispatching the request once it is complete.
    pub fn feed(&mut self, id: ConnId, data: &[u8]) {
        let Some(conn) = self.core.connections.get_mut(&id) else {
            debug!("{id} data for released connection");
            return;
        };
        if conn.dispatched {
            debug!("{id} ignoring {} bytes after dispatch", data.len());
            return;
        }

        conn.feed(data);
        match conn.poll_request() {
            ParseResult::Pending => {}
            ParseResult::Err(err) => self.core.reject(id, err),
            ParseResult::Ok(()) => self.dispatch(id),
        }
    }

    /// Resume every deferred continuation once.
    pub fn tick(&mut self) {
        self.scheduler.tick(&mut self.core);
    }

    fn dispatch(&mut self, id: ConnId) {
        let core = &mut self.core;
        let Some(conn) = core.connections.get_mut(&id) else {
            return;
        };
        conn.dispatched = true;
        debug!("{id} {} {}", conn.method(), conn.request().target());

        if core.config.redirect_directories {
            if let Some(location) = routing::directory_redirect(conn) {
                if let Err(err) = conn.redirect(&location) {
                    debug!("{id} failed to redirect: {err}");
                }
                core.reap(id);
                return;
            }
        }

        let handler = core.lookup.lookup(conn);
        let result = handler.call(&mut Context::new(conn, &mut core.workers));
        self.settle(id, result, || handler.retry());
    }

    fn settle(&mut self, id: ConnId, result: HandlerResult, retry: impl FnOnce() -> Continuation) {
        match result {
            Ok(Flow::Done) => self.core.finish(id),
            Ok(Flow::Defer(next)) => self.defer(id, next.unwrap_or_else(retry)),
            Err(err) => self.core.fault(id, err),
        }
    }

    fn defer(&mut self, id: ConnId, continuation: Continuation) {
        let Some(conn) = self.core.connections.get_mut(&id) else {
            return;
        };
        conn.deferred = true;

        let continuation = match self.core.config.defer_mode {
            DeferMode::Managed => continuation,
            DeferMode::Immediate => match self.core.resume(id, continuation) {
                Some(continuation) => continuation,
                None => return,
            },
        };
        self.scheduler.push(id, continuation);
    }

    fn disconnect(&mut self, id: ConnId) {
        let Some(conn) = self.core.connections.get(&id) else {
            return;
        };
        // observed by the next tick
        if conn.deferred {
            debug!("{id} closed while deferred");
            return;
        }
        debug!("{id} closed by peer");
        self.core.destroy(id);
    }
}

impl Core {
    fn resume(&mut self, id: ConnId, mut continuation: Continuation) -> Option<Continuation> {
        let conn = self.connections.get_mut(&id)?;
        let result = continuation.call(&mut Context::new(conn, &mut self.workers));
        match result {
            Ok(Flow::Defer(next)) => Some(next.unwrap_or(continuation)),
            Ok(Flow::Done) => {
                conn.deferred = false;
                self.finish(id);
                None
            }
            Err(err) => {
                conn.deferred = false;
                self.fault(id, err);
                None
            }
        }
    }

    /// Complete a handler that returned without deferring.
    fn finish(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.worker.is_none() && !conn.deferred {
            let result = match conn.response().state() {
                ResponseState::NotStarted => {
                    warning!("{id} handler returned without a response");
                    conn.respond(StatusCode::INTERNAL_SERVER_ERROR)
                }
                ResponseState::Started => {
                    warning!("{id} handler returned without ending the response");
                    conn.end(None)
                }
                ResponseState::Ended => Ok(()),
            };
            if let Err(err) = result {
                debug!("{id} failed to finish response: {err}");
            }
        }
        self.reap(id);
    }

    fn fault(&mut self, id: ConnId, err: BoxError) {
        error!("{id} handler fault: {err}");
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.deferred = false;
        if conn.response().state() == ResponseState::NotStarted && conn.worker.is_none() {
            if let Err(err) = conn.respond(StatusCode::INTERNAL_SERVER_ERROR) {
                debug!("{id} failed to send error response: {err}");
            }
        }
        self.destroy(id);
    }

    fn reject(&mut self, id: ConnId, err: ParseError) {
        debug!("{id} malformed request: {err}");
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.dispatched = true;
            if let Err(err) = conn.respond(StatusCode::BAD_REQUEST) {
                debug!("{id} failed to send error response: {err}");
            }
        }
        self.destroy(id);
    }

    fn worker_output(&mut self, id: ConnId, worker: WorkerId, data: &[u8]) {
        match self.connections.get_mut(&id) {
            Some(conn) => worker::deliver(conn, worker, data),
            None => {
                debug!("{id} output of worker {worker:?} after release");
            }
        }
    }

    fn worker_exit(&mut self, id: ConnId, worker: WorkerId, exit: WorkerExit) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !worker::complete(conn, worker, exit) {
            return;
        }
        if conn.response().state() == ResponseState::NotStarted && !conn.deferred {
            self.finish(id);
        } else {
            self.reap(id);
        }
    }

    /// Release the connection once nothing writes to it anymore.
    fn reap(&mut self, id: ConnId) {
        if self.connections.get(&id).is_some_and(Connection::is_finished) {
            self.destroy(id);
        }
    }

    /// Release the connection, closing its transport and killing its worker.
    fn destroy(&mut self, id: ConnId) {
        if let Some(mut conn) = self.connections.remove(&id) {
            conn.response_mut().abort();
            debug!("{id} released");
        }
    }
}

impl DeferHost for Core {
    #[inline]
    fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    #[inline]
    fn resume(&mut self, id: ConnId, continuation: Continuation) -> Option<Continuation> {
        Core::resume(self, id, continuation)
    }

    #[inline]
    fn release(&mut self, id: ConnId) {
        self.destroy(id);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("connections", &self.core.connections.len())
            .field("deferred", &self.scheduler.len())
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}
