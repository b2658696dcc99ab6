//! Regex routing.
//!
//! A [`RouteTable`] is an ordered list of regex patterns and handlers. Matching walks the table in
//! insertion order and picks the first pattern found anywhere in the subject, so a broad pattern
//! placed early shadows every later route:
//!
//! ```no_run
//! # use comet::routing::{RouteTable, match_path};
//! # use comet::handler::{Flow, Handler};
//! # fn main() -> Result<(), regex::Error> {
//! let any = Handler::new(|_| Ok(Flow::Done));
//! let exact = Handler::new(|_| Ok(Flow::Done));
//! let table = RouteTable::new()
//!     .route("^/.*", any)?
//!     .route("^/x$", exact)?;
//! assert_eq!(match_path("/x", &table).unwrap().index, 0);
//! # Ok(())
//! # }
//! ```
//!
//! Patterns are not anchored unless they anchor themselves.
use regex::Regex;

use crate::connection::Connection;
use crate::handler::{Flow, Handler};
use crate::http::StatusCode;


/// Handler selection for a parsed request.
pub trait HandlerLookup {
    /// Select the handler of `conn`, storing any route captures on it.
    fn lookup(&self, conn: &mut Connection) -> Handler;
}

impl<F> HandlerLookup for F
where
    F: Fn(&mut Connection) -> Handler,
{
    #[inline]
    fn lookup(&self, conn: &mut Connection) -> Handler {
        self(conn)
    }
}

// ===== Route Table =====

/// Pattern and handler pair.
#[derive(Debug)]
pub struct RouteEntry {
    pattern: Regex,
    handler: Handler,
}

impl RouteEntry {
    #[inline]
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    #[inline]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

/// Ordered route table.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route, builder style.
    pub fn route(mut self, pattern: &str, handler: Handler) -> Result<Self, regex::Error> {
        self.push(pattern, handler)?;
        Ok(self)
    }

    /// Append a route.
    pub fn push(&mut self, pattern: &str, handler: Handler) -> Result<(), regex::Error> {
        let pattern = Regex::new(pattern)?;
        self.entries.push(RouteEntry { pattern, handler });
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter()
    }
}

/// Successful route match.
#[derive(Debug)]
pub struct Match<'a> {
    /// Position of the matching entry in the table.
    pub index: usize,
    pub handler: &'a Handler,
    /// Capture groups, `0` is the whole match.
    pub captures: Vec<Option<String>>,
}

/// Match `path` against `table`.
pub fn match_path<'a>(path: &str, table: &'a RouteTable) -> Option<Match<'a>> {
    find(path, table)
}

/// Match `host/path` against `table`.
///
/// The subject is the host followed by the path, joined by a single slash, e.g: `example.com/a`.
pub fn match_hostpath<'a>(host: &str, path: &str, table: &'a RouteTable) -> Option<Match<'a>> {
    let path = path.strip_prefix('/').unwrap_or(path);
    find(&format!("{host}/{path}"), table)
}

fn find<'a>(subject: &str, table: &'a RouteTable) -> Option<Match<'a>> {
    table.entries.iter().enumerate().find_map(|(index, entry)| {
        let captures = entry.pattern.captures(subject)?;
        Some(Match {
            index,
            handler: &entry.handler,
            captures: captures
                .iter()
                .map(|group| group.map(|m| m.as_str().to_owned()))
                .collect(),
        })
    })
}

// ===== Router =====

/// Routing subject.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Subject {
    /// Request path.
    #[default]
    Path,
    /// `host/path`.
    HostPath,
}

/// Route table with a fallback for unmatched requests.
#[derive(Debug)]
pub struct Router {
    table: RouteTable,
    subject: Subject,
    fallback: Handler,
}

impl Router {
    /// Route on the request path, with a `404` fallback.
    pub fn new(table: RouteTable) -> Self {
        Self { table, subject: Subject::Path, fallback: not_found() }
    }

    /// Route on `host/path`, with a `404` fallback.
    pub fn hostpath(table: RouteTable) -> Self {
        Self { table, subject: Subject::HostPath, fallback: not_found() }
    }

    /// Replace the handler of unmatched requests.
    pub fn fallback(mut self, handler: Handler) -> Self {
        self.fallback = handler;
        self
    }

    #[inline]
    pub fn table(&self) -> &RouteTable {
        &self.table
    }
}

impl HandlerLookup for Router {
    fn lookup(&self, conn: &mut Connection) -> Handler {
        let found = match self.subject {
            Subject::Path => match_path(conn.path(), &self.table),
            Subject::HostPath => match_hostpath(conn.host(), conn.path(), &self.table),
        };
        match found {
            Some(Match { handler, captures, .. }) => {
                conn.set_captures(captures);
                handler.clone()
            }
            None => {
                conn.set_captures(Vec::new());
                self.fallback.clone()
            }
        }
    }
}

/// Handler responding `404`.
pub fn not_found() -> Handler {
    Handler::new(|cx| {
        cx.respond(StatusCode::NOT_FOUND)?;
        Ok(Flow::Done)
    })
}

/// Returns the location a directory-style request should be redirected to.
///
/// A path without trailing slash whose last segment has no extension is redirected to the same
/// path with a trailing slash, keeping the query string.
pub fn directory_redirect(conn: &Connection) -> Option<String> {
    let path = conn.path();
    if !path.starts_with('/') || path.ends_with('/') {
        return None;
    }
    if path.rsplit('/').next().is_some_and(|segment| segment.contains('.')) {
        return None;
    }

    let target = conn.request().target();
    let raw_path = target.split_once('?').map_or(target, |(path, _)| path);
    let location = match conn.query() {
        "" => format!("{raw_path}/"),
        query => format!("{raw_path}/?{query}"),
    };
    Some(location)
}
