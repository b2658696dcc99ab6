//! TCP server.
//!
//! [`serve`] drives one [`Runtime`] from a listener: it accepts connections, pumps the event
//! inbox, and ticks the defer scheduler. The runtime is not `Send`, so the future must be run on
//! a current-thread runtime or a `LocalSet`.
//!
//! [`Server`] runs [`serve`] on a dedicated thread, and [`Registry`] keeps the running servers
//! by address.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::error::Error;
use crate::log::{debug, error, info};
use crate::routing::HandlerLookup;
use crate::runtime::Runtime;
use crate::transport::{SharedStatus, StreamTransport, TransportStatus, read_task};

#[cfg(test)]
mod test;

/// Serve connections from `listener` until `shutdown` resolves.
///
/// Dropping the sender of `shutdown` also stops the server.
pub async fn serve(
    listener: TcpListener,
    lookup: impl HandlerLookup + 'static,
    config: Config,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (mut runtime, mut inbox) = Runtime::new(lookup, config);

    let mut tick = tokio::time::interval(runtime.config().tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    if let Ok(addr) = listener.local_addr() {
        info!("listening on {addr}");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => accept(&mut runtime, stream, peer),
                Err(err) => {
                    error!("failed to accept: {err}");
                }
            },
            Some(event) = inbox.recv() => runtime.handle(event),
            _ = tick.tick() => runtime.tick(),
            _ = &mut shutdown => break,
        }
    }

    info!("server stopped, dropping {} connections", runtime.len());
}

fn accept(runtime: &mut Runtime, stream: TcpStream, peer: SocketAddr) {
    let (read, write) = stream.into_split();
    let status = SharedStatus::new(TransportStatus::Open);

    let id = runtime.connect(Box::new(StreamTransport::new(write, status.clone())));
    debug!("{id} accepted from {peer}");

    tokio::spawn(read_task(read, id, status, runtime.events()));
}

// ===== Server =====

/// Server running on its own thread.
///
/// The server is stopped when the handle is dropped.
#[derive(Debug)]
pub struct Server {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind `addr` and serve it on a new thread.
    ///
    /// `make_lookup` is called on the server thread, so the handlers it builds need not be
    /// `Send`. Returns once the listener is bound.
    pub fn spawn<F, L>(addr: SocketAddr, make_lookup: F, config: Config) -> Result<Server, Error>
    where
        F: FnOnce() -> L + Send + 'static,
        L: HandlerLookup + 'static,
    {
        let (ready, bound) = mpsc::channel();
        let (shutdown, shutdown_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name(format!("comet {addr}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = ready.send(Err(Error::Io(err)));
                        return;
                    }
                };
                rt.block_on(async move {
                    let listener = match TcpListener::bind(addr).await {
                        Ok(listener) => listener,
                        Err(err) => {
                            let _ = ready.send(Err(Error::Bind(err)));
                            return;
                        }
                    };
                    match listener.local_addr() {
                        Ok(local) => {
                            let _ = ready.send(Ok(local));
                        }
                        Err(err) => {
                            let _ = ready.send(Err(Error::Io(err)));
                            return;
                        }
                    }
                    serve(listener, make_lookup(), config, shutdown_rx).await;
                });
            })?;

        let addr = bound.recv().map_err(|_| Error::Thread)??;
        Ok(Server { addr, shutdown: Some(shutdown), thread: Some(thread) })
    }

    /// Returns the bound address.
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the server and wait for its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("server thread of {} panicked", self.addr);
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ===== Registry =====

/// Running servers by listening address.
#[derive(Debug, Default)]
pub struct Registry {
    servers: HashMap<SocketAddr, Server>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a server on `addr`, returning the bound address.
    ///
    /// Binding port `0` picks a free port, the server is registered under the bound address.
    pub fn start<F, L>(&mut self, addr: SocketAddr, make_lookup: F, config: Config) -> Result<SocketAddr, Error>
    where
        F: FnOnce() -> L + Send + 'static,
        L: HandlerLookup + 'static,
    {
        if self.servers.contains_key(&addr) {
            return Err(Error::AlreadyRunning(addr));
        }
        let server = Server::spawn(addr, make_lookup, config)?;
        let bound = server.addr();
        self.servers.insert(bound, server);
        Ok(bound)
    }

    /// Stop the server on `addr`.
    ///
    /// Returns `false` if no server runs on `addr`.
    pub fn stop(&mut self, addr: SocketAddr) -> bool {
        match self.servers.remove(&addr) {
            Some(server) => {
                server.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every server.
    pub fn stop_all(&mut self) {
        for (_, server) in self.servers.drain() {
            server.stop();
        }
    }

    #[inline]
    pub fn is_running(&self, addr: SocketAddr) -> bool {
        self.servers.contains_key(&addr)
    }

    /// Returns the addresses of running servers.
    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.servers.keys().copied()
    }
}
