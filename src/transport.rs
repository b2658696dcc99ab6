//! Connection transport.
//!
//! [`Transport`] is the write capability of a connection. The runtime only ever pushes framed
//! bytes and a single close through it, and inspects its [`TransportStatus`] when resuming
//! deferred handlers.
//!
//! - [`StreamTransport`] forwards writes to a task owning the write half of a socket.
//! - [`MemoryTransport`] records writes in memory.
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::connection::ConnId;
use crate::log::debug;
use crate::runtime::{Event, EventSender};

const READ_CAP: usize = 0x1000;

/// Observable state of the underlying stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    /// Stream is not established yet.
    Connecting,
    /// Stream is usable.
    Open,
    /// Peer closed the stream.
    Closed,
    /// Stream reported an IO error.
    Failed,
}

/// Write side of a connection.
pub trait Transport {
    /// Returns the current stream status.
    fn status(&self) -> TransportStatus;

    /// Queue bytes to be written in order.
    fn send(&mut self, data: Bytes) -> io::Result<()>;

    /// Close the write side.
    ///
    /// The runtime calls this at most once per connection.
    fn close(&mut self);
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("status", &self.status()).finish_non_exhaustive()
    }
}

// ===== Shared Status =====

/// [`TransportStatus`] shared between a transport and the tasks driving its stream.
#[derive(Clone, Debug)]
pub struct SharedStatus(Arc<AtomicU8>);

impl SharedStatus {
    pub fn new(status: TransportStatus) -> Self {
        Self(Arc::new(AtomicU8::new(status as u8)))
    }

    pub fn get(&self) -> TransportStatus {
        match self.0.load(Ordering::Acquire) {
            0 => TransportStatus::Connecting,
            1 => TransportStatus::Open,
            2 => TransportStatus::Closed,
            _ => TransportStatus::Failed,
        }
    }

    /// Update status, `Failed` is final.
    pub fn set(&self, status: TransportStatus) {
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current != TransportStatus::Failed as u8).then_some(status as u8)
        });
    }
}

// ===== Stream Transport =====

enum WriteOp {
    Data(Bytes),
    Close,
}

/// Transport over any async writer, typically the write half of a TCP stream.
///
/// Writes are queued to a spawned task so that sending never blocks the event loop.
#[derive(Debug)]
pub struct StreamTransport {
    tx: UnboundedSender<WriteOp>,
    status: SharedStatus,
}

impl StreamTransport {
    /// Spawn the writer task on the current tokio runtime.
    pub fn new<W>(io: W, status: SharedStatus) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = unbounded_channel();
        tokio::spawn(write_task(io, rx, status.clone()));
        Self { tx, status }
    }
}

impl Transport for StreamTransport {
    #[inline]
    fn status(&self) -> TransportStatus {
        self.status.get()
    }

    fn send(&mut self, data: Bytes) -> io::Result<()> {
        if self.status.get() == TransportStatus::Failed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.tx
            .send(WriteOp::Data(data))
            .map_err(|_| io::ErrorKind::ConnectionAborted.into())
    }

    fn close(&mut self) {
        let _ = self.tx.send(WriteOp::Close);
    }
}

impl std::fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data(data) => f.debug_tuple("Data").field(&data.len()).finish(),
            Self::Close => f.write_str("Close"),
        }
    }
}

async fn write_task<W>(mut io: W, mut rx: UnboundedReceiver<WriteOp>, status: SharedStatus)
where
    W: AsyncWrite + Unpin,
{
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Data(mut data) => {
                if let Err(err) = io.write_all_buf(&mut data).await {
                    debug!("write failed: {err}");
                    status.set(TransportStatus::Failed);
                    return;
                }
            }
            WriteOp::Close => break,
        }
    }
    let _ = io.shutdown().await;
}

/// Read from `io` until EOF, forwarding every read to the event loop.
///
/// EOF marks the status `Closed`, a read error marks it `Failed`.
pub(crate) async fn read_task<R>(mut io: R, id: ConnId, status: SharedStatus, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(READ_CAP);
    loop {
        if buffer.capacity() < 0x100 {
            buffer.reserve(READ_CAP);
        }
        match io.read_buf(&mut buffer).await {
            Ok(0) => {
                status.set(TransportStatus::Closed);
                let _ = events.send(Event::Closed(id));
                return;
            }
            Ok(_) => {
                if events.send(Event::Data(id, buffer.split().freeze())).is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!("read failed on {id:?}: {err}");
                status.set(TransportStatus::Failed);
                let _ = events.send(Event::Failed(id));
                return;
            }
        }
    }
}

// ===== Memory Transport =====

/// In memory transport.
///
/// Clones share the same state, keep one to inspect what the runtime wrote.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    inner: Rc<RefCell<Memory>>,
}

#[derive(Debug)]
struct Memory {
    written: BytesMut,
    status: TransportStatus,
    closes: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create open transport.
    pub fn new() -> Self {
        Self::with_status(TransportStatus::Open)
    }

    pub fn with_status(status: TransportStatus) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Memory {
                written: BytesMut::new(),
                status,
                closes: 0,
            })),
        }
    }

    pub fn set_status(&self, status: TransportStatus) {
        self.inner.borrow_mut().status = status;
    }

    /// Returns every byte written so far.
    pub fn written(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.borrow().written)
    }

    /// Returns written bytes as lossy UTF-8.
    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.inner.borrow().written).into_owned()
    }

    /// Returns how many times the write side was closed.
    pub fn close_count(&self) -> usize {
        self.inner.borrow().closes
    }
}

impl Transport for MemoryTransport {
    fn status(&self) -> TransportStatus {
        self.inner.borrow().status
    }

    fn send(&mut self, data: Bytes) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.status, TransportStatus::Failed) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        inner.written.extend_from_slice(&data);
        Ok(())
    }

    fn close(&mut self) {
        self.inner.borrow_mut().closes += 1;
    }
}
