//! Logging shims.
//!
//! Every macro here forwards to the [`log`] facade when the `log` feature is enabled and expands
//! to nothing otherwise. The macros must be used in statement position.
//!
//! [`log`]: https://docs.rs/log
#![allow(unused, reason = "logger")]

macro_rules! info {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        ::log::info!(target: "comet", $($tt)*);
    };
}

macro_rules! debug {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        ::log::debug!(target: "comet", $($tt)*);
    };
}

macro_rules! warning {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        ::log::warn!(target: "comet", $($tt)*);
    };
}

macro_rules! error {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        ::log::error!(target: "comet", $($tt)*);
    };
}

pub(crate) use {debug, error, info, warning};
