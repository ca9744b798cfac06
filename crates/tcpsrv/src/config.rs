//! Manager configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use tcpsrv::ManagerConfig;
//!
//! // Defaults with env overrides
//! let config = ManagerConfig::from_env();
//!
//! // Or customize programmatically
//! let config = ManagerConfig::from_env()
//!     .events_capacity(256)
//!     .default_backlog(128);
//! ```

use std::str::FromStr;

use tcpsrv_core::{Result, ServerSocketError};

/// Library defaults
pub mod defaults {
    /// Readiness events fetched per wait
    pub const EVENTS_CAPACITY: usize = 64;
    /// Backlog used when `listen` gets none (or a non-positive one)
    pub const DEFAULT_BACKLOG: i32 = 50;
    /// Set SO_REUSEADDR before bind
    pub const REUSE_ADDRESS: bool = true;
    /// Name of the event loop thread
    pub const LOOP_THREAD_NAME: &str = "tcpsrv-loop";
}

/// Server-socket manager configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Readiness events fetched per wait
    pub events_capacity: usize,
    /// Backlog for `listen` calls without an explicit positive backlog
    pub default_backlog: i32,
    /// Set SO_REUSEADDR on freshly opened channels
    pub reuse_address: bool,
    /// Event loop thread name
    pub loop_thread_name: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ManagerConfig {
    /// Create config from defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `TCPSRV_EVENTS_CAPACITY` - Events fetched per readiness wait
    /// - `TCPSRV_DEFAULT_BACKLOG` - Backlog when none is given
    /// - `TCPSRV_REUSE_ADDRESS` - Set SO_REUSEADDR (0/1, true/false)
    /// - `TCPSRV_LOOP_THREAD_NAME` - Event loop thread name
    pub fn from_env() -> Self {
        Self {
            events_capacity: env_get("TCPSRV_EVENTS_CAPACITY", defaults::EVENTS_CAPACITY),
            default_backlog: env_get("TCPSRV_DEFAULT_BACKLOG", defaults::DEFAULT_BACKLOG),
            reuse_address: env_get_bool("TCPSRV_REUSE_ADDRESS", defaults::REUSE_ADDRESS),
            loop_thread_name: std::env::var("TCPSRV_LOOP_THREAD_NAME")
                .unwrap_or_else(|_| defaults::LOOP_THREAD_NAME.to_string()),
        }
    }

    /// Create config with explicit defaults (no env override).
    pub fn new() -> Self {
        Self {
            events_capacity: defaults::EVENTS_CAPACITY,
            default_backlog: defaults::DEFAULT_BACKLOG,
            reuse_address: defaults::REUSE_ADDRESS,
            loop_thread_name: defaults::LOOP_THREAD_NAME.to_string(),
        }
    }

    // Builder methods

    pub fn events_capacity(mut self, n: usize) -> Self {
        self.events_capacity = n;
        self
    }

    pub fn default_backlog(mut self, backlog: i32) -> Self {
        self.default_backlog = backlog;
        self
    }

    pub fn reuse_address(mut self, enable: bool) -> Self {
        self.reuse_address = enable;
        self
    }

    pub fn loop_thread_name(mut self, name: impl Into<String>) -> Self {
        self.loop_thread_name = name.into();
        self
    }

    /// Backlog actually passed to listen(2).
    pub fn effective_backlog(&self, requested: Option<i32>) -> i32 {
        match requested {
            Some(backlog) if backlog > 0 => backlog,
            _ => self.default_backlog,
        }
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.events_capacity == 0 {
            return Err(invalid("events_capacity must be > 0"));
        }
        if self.default_backlog <= 0 {
            return Err(invalid("default_backlog must be > 0"));
        }
        if self.loop_thread_name.is_empty() {
            return Err(invalid("loop_thread_name must not be empty"));
        }
        if self.loop_thread_name.contains('\0') {
            return Err(invalid("loop_thread_name must not contain NUL"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ServerSocketError {
    ServerSocketError::InvalidArgument(format!("config: {}", msg))
}

fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
