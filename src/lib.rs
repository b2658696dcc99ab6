//! Embedded HTTP server toolkit with deferred handlers and worker processes.
//!
//! Requests are routed by regex to [`Handler`]s that write a chunked response through the
//! [`Connection`]. A handler may defer itself to be resumed on every scheduler tick, or bind a
//! worker process whose output is streamed to the client.
//!
//! ```no_run
//! use comet::{Config, Flow, Handler, Registry, RouteTable, Router, StatusCode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = Registry::new();
//! registry.start("127.0.0.1:3000".parse()?, || {
//!     let hello = Handler::new(|cx| {
//!         cx.start(StatusCode::OK, [("Content-Type", "text/plain")])?;
//!         cx.end(Some(b"hello".as_slice()))?;
//!         Ok(Flow::Done)
//!     });
//!     Router::new(RouteTable::new().route("^/$", hello).expect("valid pattern"))
//! }, Config::from_env())?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_debug_implementations)]

mod log;

pub mod common;
pub mod config;
pub mod error;
pub mod http;
pub mod headers;
pub mod request;
pub mod response;
pub mod transport;
pub mod connection;
pub mod routing;
pub mod handler;
pub mod defer;
pub mod worker;
pub mod runtime;
pub mod server;

pub use config::Config;
pub use connection::{ConnId, Connection};
pub use error::{BoxError, Error};
pub use handler::{Context, Flow, Handler, HandlerResult};
pub use http::{Method, StatusCode};
pub use routing::{RouteTable, Router};
pub use runtime::Runtime;
pub use server::{Registry, Server, serve};
