//! Deferred handlers.
//!
//! A handler that cannot complete yet returns [`Flow::Defer`] with a [`Continuation`]. The
//! runtime queues it into a [`DeferScheduler`], whose [`tick`][DeferScheduler::tick] resumes
//! every queued continuation once per period:
//!
//! - transport `Open`, the continuation is resumed and requeued if it defers again,
//! - transport `Closed` or `Failed`, the entry is dropped and every [`FailureHook`] is called,
//! - transport `Connecting`, the entry is requeued untouched.
//!
//! Entries queued while a tick runs are only resumed on the next tick.
//!
//! There is no timeout, a continuation that keeps deferring is kept until its connection closes.
use crate::connection::{ConnId, Connection};
use crate::handler::{Context, Continuation, Flow, HandlerResult};
use crate::error::catch_panic;
use crate::log::{debug, error};
use crate::transport::TransportStatus;


/// What the runtime does with a continuation returned by a handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeferMode {
    /// Queue the continuation for the next tick.
    #[default]
    Managed,
    /// Resume the continuation immediately once, queue it only if it defers again.
    Immediate,
}

/// Reason passed to failure hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// Peer closed the connection.
    Closed,
    /// Connection reported an IO error.
    Failed,
}

/// Callback invoked when a deferred connection is observed closed or failed.
pub type FailureHook = Box<dyn FnMut(&Connection, FailureReason)>;

/// Queued continuation of a connection.
#[derive(Debug)]
pub struct DeferEntry {
    conn: ConnId,
    continuation: Continuation,
}

impl DeferEntry {
    #[inline]
    pub fn conn(&self) -> ConnId {
        self.conn
    }
}

/// Connection store the scheduler resumes continuations against.
pub trait DeferHost {
    /// Returns the connection `id`, if it is still alive.
    fn connection(&self, id: ConnId) -> Option<&Connection>;

    /// Resume `continuation` on connection `id`.
    ///
    /// Returns the continuation to requeue if it deferred again.
    fn resume(&mut self, id: ConnId, continuation: Continuation) -> Option<Continuation>;

    /// Release connection `id` after its transport went away.
    fn release(&mut self, id: ConnId);
}

/// Queue of deferred continuations.
#[derive(Default)]
pub struct DeferScheduler {
    queue: Vec<DeferEntry>,
    hooks: Vec<FailureHook>,
}

impl DeferScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `continuation` of connection `conn` for the next tick.
    pub fn push(&mut self, conn: ConnId, continuation: Continuation) {
        self.queue.push(DeferEntry { conn, continuation });
    }

    /// Register a hook called when a deferred connection is closed or failed.
    pub fn on_failure<F>(&mut self, hook: F)
    where
        F: FnMut(&Connection, FailureReason) + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns `true` if a continuation of `conn` is queued.
    pub fn contains(&self, conn: ConnId) -> bool {
        self.queue.iter().any(|entry| entry.conn == conn)
    }

    /// Resume every queued continuation once.
    pub fn tick(&mut self, host: &mut impl DeferHost) {
        let mut fresh = Vec::with_capacity(self.queue.len());

        for entry in std::mem::take(&mut self.queue) {
            let Some(status) = host.connection(entry.conn).map(Connection::transport_status) else {
                debug!("dropping deferred entry of released connection {}", entry.conn);
                continue;
            };

            let reason = match status {
                TransportStatus::Open => {
                    if let Some(continuation) = host.resume(entry.conn, entry.continuation) {
                        fresh.push(DeferEntry { conn: entry.conn, continuation });
                    }
                    continue;
                }
                TransportStatus::Connecting => {
                    fresh.push(entry);
                    continue;
                }
                TransportStatus::Closed => FailureReason::Closed,
                TransportStatus::Failed => FailureReason::Failed,
            };

            debug!("dropping deferred entry of {}: {reason:?}", entry.conn);
            if let Some(conn) = host.connection(entry.conn) {
                for hook in &mut self.hooks {
                    if let Err(err) = catch_panic(|| hook(conn, reason)) {
                        error!("failure hook of {} panicked: {}", entry.conn, err.0);
                    }
                }
            }
            host.release(entry.conn);
        }

        self.queue = fresh;
    }
}

impl std::fmt::Debug for DeferScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferScheduler")
            .field("queue", &self.queue)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

// ===== Combinators =====

/// Returns a continuation that defers until `guard` holds, then runs `body`.
///
/// The guard is re-evaluated on every resume until it first returns `true`. From then on the
/// guard is not consulted again, and `body` runs on each resume for as long as it returns
/// [`Flow::Defer(None)`](Flow::Defer).
pub fn until<G, B>(mut guard: G, mut body: B) -> Continuation
where
    G: FnMut(&mut Context<'_>) -> bool + 'static,
    B: FnMut(&mut Context<'_>) -> HandlerResult + 'static,
{
    let mut passed = false;
    Continuation::new(move |cx| {
        if !passed {
            if !guard(cx) {
                return Ok(Flow::Defer(None));
            }
            passed = true;
        }
        body(cx)
    })
}

/// Run `body` now if `guard` holds, otherwise defer with [`until`].
///
/// ```no_run
/// # use comet::defer::wait;
/// # use comet::handler::{Flow, Handler};
/// # use comet::http::StatusCode;
/// let handler = Handler::new(|cx| {
///     wait(cx, |cx| cx.param("ready").is_some(), |cx| {
///         cx.start(StatusCode::OK, None::<(&str, &str)>)?;
///         cx.send("ready")?;
///         cx.end(None)?;
///         Ok(Flow::Done)
///     })
/// });
/// ```
///
/// When `body` runs immediately and defers without a continuation, `body` itself is deferred,
/// so the handler is not re-run.
pub fn wait<G, B>(cx: &mut Context<'_>, mut guard: G, mut body: B) -> HandlerResult
where
    G: FnMut(&mut Context<'_>) -> bool + 'static,
    B: FnMut(&mut Context<'_>) -> HandlerResult + 'static,
{
    if !guard(cx) {
        return Ok(Flow::Defer(Some(until(guard, body))));
    }
    match body(cx)? {
        Flow::Defer(None) => Ok(Flow::Defer(Some(Continuation::new(body)))),
        flow => Ok(flow),
    }
}
