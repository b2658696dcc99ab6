//! External worker processes bound to a connection.
//!
//! [`WorkerBridge::start_worker`] spawns a process whose standard output is streamed to the
//! response of a connection. [`WorkerBridge::start_job`] additionally writes a serialized [`Job`]
//! to the standard input of the process, and routes its output to an [`OutputTarget`].
//!
//! The process is watched by a task on the tokio runtime, which forwards output and exit back to
//! the event loop as [`Event`]s. A connection binds at most one worker at a time. Dropping the
//! [`WorkerBinding`], when the connection is destroyed, kills the process.
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io;
use std::process::Stdio;
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;

use crate::connection::{ConnId, Connection};
use crate::error::catch_panic;
use crate::log::{debug, error, warning};
use crate::response::ResponseState;
use crate::runtime::{Event, EventSender};


const READ_CAP: usize = 0x1000;

/// Worker identifier, unique within a runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

/// Handle of a spawned worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerHandle {
    id: WorkerId,
    pid: Option<u32>,
}

impl WorkerHandle {
    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Returns the OS process id, if the process was still running when spawned.
    #[inline]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// How a worker process terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    code: Option<i32>,
}

impl WorkerExit {
    pub(crate) fn new(code: Option<i32>) -> Self {
        Self { code }
    }

    /// Returns the exit code, `None` if the process was terminated by a signal.
    #[inline]
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Destination of worker output.
pub enum OutputTarget {
    /// Send every output as a response chunk.
    Connection,
    /// Append output to a shared buffer.
    Buffer(Rc<RefCell<BytesMut>>),
    /// Call a function with every output.
    Callback(Box<dyn FnMut(&[u8])>),
}

impl std::fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection => f.write_str("Connection"),
            Self::Buffer(buf) => f.debug_tuple("Buffer").field(&buf.borrow().len()).finish(),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Job payload written to the standard input of a worker, as a JSON line.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// What the worker should run.
    pub entry: String,
    /// Named values available to the job.
    #[serde(default)]
    pub bindings: BTreeMap<String, serde_json::Value>,
}

impl Job {
    pub fn new(entry: impl Into<String>) -> Self {
        Self { entry: entry.into(), bindings: BTreeMap::new() }
    }

    /// Bind `name` to the serialized `value`.
    pub fn bind(mut self, name: impl Into<String>, value: impl Serialize) -> Result<Self, serde_json::Error> {
        self.bindings.insert(name.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Returns the payload written to the worker.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut payload = serde_json::to_vec(self)?;
        payload.push(b'\n');
        Ok(payload)
    }
}

/// Worker process bound to a connection.
#[derive(Debug)]
pub struct WorkerBinding {
    id: WorkerId,
    pid: Option<u32>,
    target: OutputTarget,
    /// Dropping the sender kills the process.
    _kill: oneshot::Sender<()>,
}

impl WorkerBinding {
    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

// ===== Bridge =====

/// Spawns workers and wires them to the event loop.
#[derive(Debug)]
pub struct WorkerBridge {
    events: EventSender,
    next_id: u64,
}

impl WorkerBridge {
    pub(crate) fn new(events: EventSender) -> Self {
        Self { events, next_id: 0 }
    }

    /// Spawn `program` with `args`, streaming its standard output to the response of `conn`.
    ///
    /// When the process exits, the response is ended. A nonzero exit is logged, the client still
    /// receives a complete response.
    ///
    /// Must be called within a tokio runtime.
    pub fn start_worker<I, S>(
        &mut self,
        conn: &mut Connection,
        program: &str,
        args: I,
    ) -> Result<WorkerHandle, WorkerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.spawn(conn, program, args, None, OutputTarget::Connection)
    }

    /// Spawn `program` with `args`, write `job` to its standard input, and route its standard
    /// output to `target`.
    ///
    /// Exit is handled as in [`start_worker`][Self::start_worker].
    pub fn start_job<I, S>(
        &mut self,
        conn: &mut Connection,
        program: &str,
        args: I,
        job: &Job,
        target: OutputTarget,
    ) -> Result<WorkerHandle, WorkerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        if conn.worker.is_some() {
            return Err(already_bound(conn));
        }
        let payload = job.to_payload().map_err(WorkerError::Payload)?;
        self.spawn(conn, program, args, Some(payload), target)
    }

    fn spawn<I, S>(
        &mut self,
        conn: &mut Connection,
        program: &str,
        args: I,
        input: Option<Vec<u8>>,
        target: OutputTarget,
    ) -> Result<WorkerHandle, WorkerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        if conn.worker.is_some() {
            return Err(already_bound(conn));
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(WorkerError::Spawn)?;
        let id = WorkerId(self.next_id);
        let pid = child.id();
        self.next_id += 1;

        debug!("worker {id:?} spawned for {}: {program}, pid {pid:?}", conn.id());

        if let (Some(payload), Some(mut stdin)) = (input, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&payload).await {
                    debug!("failed to write job payload: {err}");
                }
            });
        }

        let (kill, killed) = oneshot::channel();
        tokio::spawn(watch(child, conn.id(), id, self.events.clone(), killed));

        conn.worker = Some(WorkerBinding { id, pid, target, _kill: kill });
        Ok(WorkerHandle { id, pid })
    }
}

fn already_bound(conn: &Connection) -> WorkerError {
    warning!("worker already bound to {}", conn.id());
    WorkerError::AlreadyBound
}

/// Forward output of `child`, then report its exit.
async fn watch(
    mut child: Child,
    conn: ConnId,
    worker: WorkerId,
    events: EventSender,
    mut kill: oneshot::Receiver<()>,
) {
    let stdout = child.stdout.take();

    let killed = tokio::select! {
        _ = forward(stdout, conn, worker, &events) => false,
        _ = &mut kill => true,
    };

    let status = if killed {
        let _ = child.start_kill();
        child.wait().await
    } else {
        tokio::select! {
            status = child.wait() => status,
            _ = &mut kill => {
                let _ = child.start_kill();
                child.wait().await
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            debug!("failed to wait worker {worker:?}: {err}");
            None
        }
    };
    let _ = events.send(Event::WorkerExit { conn, worker, exit: WorkerExit::new(code) });
}

async fn forward(stdout: Option<ChildStdout>, conn: ConnId, worker: WorkerId, events: &EventSender) {
    let Some(mut stdout) = stdout else {
        return;
    };
    let mut buffer = BytesMut::with_capacity(READ_CAP);
    loop {
        if buffer.capacity() < 0x100 {
            buffer.reserve(READ_CAP);
        }
        match stdout.read_buf(&mut buffer).await {
            Ok(0) => return,
            Ok(_) => {
                let data = buffer.split().freeze();
                if events.send(Event::WorkerOutput { conn, worker, data }).is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!("failed to read worker {worker:?} output: {err}");
                return;
            }
        }
    }
}

// ===== Event Handling =====

/// Route worker output to the target of the binding.
///
/// Output of a worker that is no longer bound is ignored.
pub(crate) fn deliver(conn: &mut Connection, worker: WorkerId, data: &[u8]) {
    let to_response = match conn.worker.as_mut() {
        Some(binding) if binding.id == worker => match &mut binding.target {
            OutputTarget::Connection => true,
            OutputTarget::Buffer(buffer) => {
                buffer.borrow_mut().extend_from_slice(data);
                false
            }
            OutputTarget::Callback(callback) => {
                if let Err(err) = catch_panic(|| callback(data)) {
                    error!("output callback of worker {worker:?} panicked: {}", err.0);
                }
                false
            }
        },
        _ => {
            debug!("ignoring output of stale worker {worker:?}");
            return;
        }
    };

    if to_response {
        if let Err(err) = conn.send(data) {
            debug!("dropping worker output for {}: {err}", conn.id());
        }
    }
}

/// Release the binding of an exited worker, and end a started response.
///
/// Returns `false` if `worker` is not bound to `conn`.
pub(crate) fn complete(conn: &mut Connection, worker: WorkerId, exit: WorkerExit) -> bool {
    if !conn.worker.as_ref().is_some_and(|binding| binding.id == worker) {
        return false;
    }
    conn.worker = None;
    conn.set_worker_exit(exit);

    match exit.code() {
        Some(0) => {
            debug!("worker {worker:?} of {} exited", conn.id());
        }
        Some(code) => {
            error!("worker {worker:?} of {} exited with code {code}", conn.id());
        }
        None => {
            error!("worker {worker:?} of {} terminated by signal", conn.id());
        }
    }

    if conn.response().state() == ResponseState::Started {
        let result = if exit.success() {
            conn.send(b"").and_then(|_| conn.end(None))
        } else {
            conn.end(None)
        };
        if let Err(err) = result {
            debug!("failed to end response of {}: {err}", conn.id());
        }
    }
    true
}

// ===== Error =====

/// Worker spawn error.
#[derive(Debug)]
pub enum WorkerError {
    /// The connection already has a bound worker.
    AlreadyBound,
    /// Failed to spawn the process.
    Spawn(io::Error),
    /// Failed to serialize the job payload.
    Payload(serde_json::Error),
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AlreadyBound => None,
            Self::Spawn(err) => Some(err),
            Self::Payload(err) => Some(err),
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::AlreadyBound => f.write_str("connection already has a bound worker"),
            Self::Spawn(err) => write!(f, "failed to spawn worker: {err}"),
            Self::Payload(err) => write!(f, "failed to serialize job: {err}"),
        }
    }
}
