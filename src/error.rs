//! Error types shared across the crate.
use std::io;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Type-erased error returned by handlers and continuations.
///
/// Any error type can be propagated from a handler with `?`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Server lifecycle error.
#[derive(Debug)]
pub enum Error {
    /// Failed to bind the listening address.
    Bind(io::Error),
    /// A server is already registered on the address.
    AlreadyRunning(SocketAddr),
    /// Failed to create the event loop.
    Io(io::Error),
    /// Server thread terminated before reporting its address.
    Thread,
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(err) | Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Bind(err) => write!(f, "failed to bind: {err}"),
            Self::AlreadyRunning(addr) => write!(f, "server already running on {addr}"),
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Thread => f.write_str("server thread terminated unexpectedly"),
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Error raised when a handler panics.
#[derive(Debug)]
pub struct Panicked(pub(crate) String);

impl std::error::Error for Panicked {}

impl std::fmt::Display for Panicked {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "handler panicked: {}", self.0)
    }
}

/// Run `f`, turning a panic into [`Panicked`] with the panic message.
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, Panicked> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let msg = if let Some(msg) = payload.downcast_ref::<&str>() {
            (*msg).to_owned()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            String::from("unknown panic")
        };
        Panicked(msg)
    })
}
