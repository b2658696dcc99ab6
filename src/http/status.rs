use std::collections::HashMap;

/// HTTP [Status Code][rfc].
///
/// Only the numeric value is carried, the reason phrase written on the wire is looked up in a
/// [`ReasonTable`].
///
/// [rfc]: <https://datatracker.ietf.org/doc/html/rfc9110#name-status-codes>
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u16);

impl Default for StatusCode {
    #[inline]
    fn default() -> Self {
        Self::OK
    }
}

impl StatusCode {
    /// `200`. The request succeeded.
    pub const OK: Self = Self(200);
    /// `302`. The URI of requested resource has been changed temporarily.
    pub const FOUND: Self = Self(302);
    /// `400`. The request is perceived to be a client error.
    pub const BAD_REQUEST: Self = Self(400);
    /// `401`. The client must authenticate itself.
    pub const UNAUTHORIZED: Self = Self(401);
    /// `404`. The server cannot find the requested resource.
    pub const NOT_FOUND: Self = Self(404);
    /// `500`. The server has encountered a situation it does not know how to handle.
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);

    /// Create status code from its numeric value.
    ///
    /// Returns `None` if `code` is outside `100..=999`.
    #[inline]
    pub const fn from_u16(code: u16) -> Option<Self> {
        if code >= 100 && code <= 999 {
            Some(Self(code))
        } else {
            None
        }
    }

    /// Returns status code value, e.g: `200`.
    #[inline]
    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl From<StatusCode> for u16 {
    #[inline]
    fn from(value: StatusCode) -> Self {
        value.0
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("StatusCode").field(&self.0).finish()
    }
}

// ===== Reason Table =====

/// Status code to reason phrase mapping used when writing the status line.
///
/// Codes missing from the table are written with the phrase `Unknown`.
#[derive(Clone, Debug)]
pub struct ReasonTable {
    phrases: HashMap<u16, String>,
}

impl Default for ReasonTable {
    fn default() -> Self {
        let mut me = Self { phrases: HashMap::new() };
        me.set(StatusCode::OK, "Ok");
        me.set(StatusCode::FOUND, "Redirect");
        me.set(StatusCode::BAD_REQUEST, "Bad Request");
        me.set(StatusCode::UNAUTHORIZED, "Authenticate");
        me.set(StatusCode::NOT_FOUND, "Not Found");
        me.set(StatusCode::INTERNAL_SERVER_ERROR, "Server Error");
        me
    }
}

impl ReasonTable {
    /// Insert or replace the phrase for `status`.
    pub fn set(&mut self, status: StatusCode, phrase: impl Into<String>) {
        self.phrases.insert(status.0, phrase.into());
    }

    /// Returns the reason phrase for `status`.
    pub fn phrase(&self, status: StatusCode) -> &str {
        self.phrases.get(&status.0).map(String::as_str).unwrap_or("Unknown")
    }
}
