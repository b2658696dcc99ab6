//! HTTP Response.
//!
//! - [`chunked`] contains the chunked transfer coding.
//! - [`ResponseWriter`] is the per connection response state machine.
pub mod chunked;
mod writer;

pub use writer::{ResponseError, ResponseState, ResponseWriter};

#[cfg(test)]
mod test;
