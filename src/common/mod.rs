//! Shared primitives.

/// Outcome of an incremental parse over a possibly incomplete buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<T, E> {
    /// Bytes is not sufficient for parsing, more IO read is required.
    Pending,
    /// Parse success.
    Ok(T),
    /// Parse failed.
    Err(E),
}

impl<T, E> ParseResult<T, E> {
    /// Returns `true` if the parse result is [`Pending`].
    ///
    /// [`Pending`]: ParseResult::Pending
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns `true` if the parse result is [`Ok`].
    ///
    /// [`Ok`]: ParseResult::Ok
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(..))
    }

    /// Returns `true` if the parse result is [`Err`].
    ///
    /// [`Err`]: ParseResult::Err
    #[inline]
    pub const fn is_err(&self) -> bool {
        matches!(self, Self::Err(..))
    }

    /// Maps the success value, keeping `Pending` and `Err` untouched.
    #[inline]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseResult<U, E> {
        match self {
            Self::Pending => ParseResult::Pending,
            Self::Ok(ok) => ParseResult::Ok(f(ok)),
            Self::Err(err) => ParseResult::Err(err),
        }
    }
}
