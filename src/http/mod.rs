//! HTTP Protocol primitives.
mod method;
mod status;
mod version;

pub use method::{Method, UnknownMethod};
pub use status::{ReasonTable, StatusCode};
pub use version::{UnsupportedVersion, Version};
