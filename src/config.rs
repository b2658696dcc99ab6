//! Runtime configuration.
//!
//! [`Config`] carries the per-server knobs of the event loop. It can be built in code, starting
//! from [`Config::default`], or loaded from the environment with [`Config::from_env`].
//!
//! # Environment Variables
//!
//! | Variable | Value | Default |
//! |---|---|---|
//! | `COMET_DEFER_MODE` | `managed` or `immediate` | `managed` |
//! | `COMET_TICK_MS` | scheduler tick period in milliseconds | `2000` |
//! | `COMET_MAX_HEADER` | request head limit in bytes, decimal or `0x` hex | `0x2000` |
//! | `COMET_MAX_BODY` | request body limit in bytes, decimal or `0x` hex | `0x400000` |
//! | `COMET_REDIRECT_DIRS` | `1` or `true` to redirect directory-style paths | off |
//!
//! Invalid values fall back to the default.
use std::env;
use std::time::Duration;

use crate::defer::DeferMode;
use crate::http::{ReasonTable, StatusCode};
use crate::request::{DEFAULT_MAX_BODY, DEFAULT_MAX_HEADER};

const DEFAULT_TICK_MS: u64 = 2000;

/// Event loop configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// What happens to a continuation when a handler defers.
    pub defer_mode: DeferMode,
    /// Period of the defer scheduler tick.
    pub tick: Duration,
    /// Largest accepted request head, request line and header fields included.
    pub max_header: usize,
    /// Largest accepted request body, after chunked decoding.
    pub max_body: usize,
    /// Redirect paths without trailing slash and without extension to `path/`.
    pub redirect_directories: bool,
    /// Reason phrases written in status lines.
    pub reasons: ReasonTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            defer_mode: DeferMode::Managed,
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            max_header: DEFAULT_MAX_HEADER,
            max_body: DEFAULT_MAX_BODY,
            redirect_directories: false,
            reasons: ReasonTable::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        if let Some(mode) = lookup("COMET_DEFER_MODE") {
            match mode.trim().to_ascii_lowercase().as_str() {
                "immediate" => config.defer_mode = DeferMode::Immediate,
                "managed" => config.defer_mode = DeferMode::Managed,
                _ => {}
            }
        }

        if let Some(ms) = lookup("COMET_TICK_MS").and_then(|val| val.trim().parse::<u64>().ok()) {
            if ms > 0 {
                config.tick = Duration::from_millis(ms);
            }
        }

        if let Some(size) = lookup("COMET_MAX_HEADER").and_then(|val| parse_size(&val)) {
            config.max_header = size;
        }

        if let Some(size) = lookup("COMET_MAX_BODY").and_then(|val| parse_size(&val)) {
            config.max_body = size;
        }

        if let Some(flag) = lookup("COMET_REDIRECT_DIRS") {
            config.redirect_directories = matches!(flag.trim(), "1" | "true" | "TRUE" | "yes");
        }

        config
    }

    /// Override the reason phrase written for `status`.
    pub fn with_reason(mut self, status: StatusCode, phrase: impl Into<String>) -> Self {
        self.reasons.set(status, phrase);
        self
    }
}

fn parse_size(val: &str) -> Option<usize> {
    let val = val.trim();
    match val.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => val.parse().ok(),
    }
}
