//! HTTP Header Map.
//!
//! Fields keep the name exactly as received or inserted, lookups are case-insensitive.
mod map;

pub use map::{HeaderField, HeaderMap, Iter};
