//! HTTP/1.1 request head parser.
//!
//! [`parse`] works on the accumulated bytes of a connection. If the blank line terminating the
//! header section is not found yet, it returns [`ParseResult::Pending`] and leaves the request
//! untouched, so it can be called again each time more bytes arrive.
//!
//! [`ParseResult::Pending`]: crate::common::ParseResult::Pending
use super::{ParseState, Request, params::decode_path};
use crate::common::ParseResult;
use crate::headers::HeaderMap;
use crate::http::{Method, UnknownMethod, UnsupportedVersion, Version};

/// Parse the request head buffered in `req`.
///
/// Once the head has been parsed, subsequent calls return immediately. Body bytes stay in the
/// buffer until [`Request::finish_body`] completes.
pub fn parse(req: &mut Request) -> ParseResult<(), ParseError> {
    if req.state == ParseState::HeaderParsed {
        return ParseResult::Ok(());
    }

    let Some((head_len, body_offset)) = find_terminator(&req.buffer) else {
        if req.buffer.len() > req.max_header {
            return ParseResult::Err(ParseError::TooLarge);
        }
        return ParseResult::Pending;
    };

    if head_len > req.max_header {
        return ParseResult::Err(ParseError::TooLarge);
    }

    let head = String::from_utf8_lossy(&req.buffer[..head_len]);
    let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

    let reqline = match lines.next() {
        Some(line) => parse_reqline(line),
        None => Err(ParseError::InvalidRequestLine),
    };
    let (method, target, version) = match reqline {
        Ok(ok) => ok,
        Err(err) => return ParseResult::Err(err),
    };

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return ParseResult::Err(ParseError::InvalidHeader);
        };
        if name.is_empty() || name.contains([' ', '\t']) {
            return ParseResult::Err(ParseError::InvalidHeader);
        }
        headers.append(name, value.trim_start_matches([' ', '\t']));
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    if !path.starts_with('/') && path != "*" {
        return ParseResult::Err(ParseError::InvalidTarget);
    }

    req.path = decode_path(path);
    req.query = query.to_owned();
    req.target = target.to_owned();
    req.method = method;
    req.version = version;
    req.headers = headers;
    req.body_offset = body_offset;
    req.state = ParseState::HeaderParsed;

    ParseResult::Ok(())
}

/// Find the empty line ending the header section.
///
/// Returns the length of the head, last line separator included, and the offset of the body.
/// Both `\r\n` and bare `\n` are accepted as line separator.
fn find_terminator(bytes: &[u8]) -> Option<(usize, usize)> {
    let mut offset = 0;
    while let Some(pos) = bytes[offset..].iter().position(|&b| b == b'\n') {
        let lf = offset + pos;
        match &bytes[lf + 1..] {
            [b'\r', b'\n', ..] => return Some((lf + 1, lf + 3)),
            [b'\n', ..] => return Some((lf + 1, lf + 2)),
            _ => offset = lf + 1,
        }
    }
    None
}

fn parse_reqline(line: &str) -> Result<(Method, &str, Version), ParseError> {
    let mut tokens = line.split(' ').filter(|t| !t.is_empty());

    let (Some(method), Some(target), Some(version), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(ParseError::InvalidRequestLine);
    };

    let method = Method::from_bytes(method.as_bytes()).ok_or(UnknownMethod)?;
    let version = Version::from_bytes(version.as_bytes()).ok_or(UnsupportedVersion)?;

    Ok((method, target, version))
}

// ===== Error =====

/// HTTP Parsing error.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Request head exceeds the configured limit.
    TooLarge,
    /// Request line is not `method SP target SP version`.
    InvalidRequestLine,
    /// Unknown Method.
    UnknownMethod,
    /// Request target is not an origin-form path.
    InvalidTarget,
    /// Unsupported version.
    UnsupportedVersion,
    /// Header line without colon or with invalid name.
    InvalidHeader,
    /// `Content-Length` is not a decimal number.
    InvalidContentLength,
    /// Malformed chunked request body.
    InvalidChunked,
    /// Request body exceeds the configured limit.
    BodyTooLarge,
}

impl std::error::Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::TooLarge => f.write_str("request head too large"),
            Self::InvalidRequestLine => f.write_str("invalid request line"),
            Self::UnknownMethod => f.write_str("unknown method"),
            Self::InvalidTarget => f.write_str("invalid request target"),
            Self::UnsupportedVersion => f.write_str("unsupported version"),
            Self::InvalidHeader => f.write_str("invalid header"),
            Self::InvalidContentLength => f.write_str("invalid content-length"),
            Self::InvalidChunked => f.write_str("invalid chunked body"),
            Self::BodyTooLarge => f.write_str("request body too large"),
        }
    }
}

impl From<UnknownMethod> for ParseError {
    #[inline]
    fn from(_: UnknownMethod) -> Self {
        Self::UnknownMethod
    }
}

impl From<UnsupportedVersion> for ParseError {
    #[inline]
    fn from(_: UnsupportedVersion) -> Self {
        Self::UnsupportedVersion
    }
}
