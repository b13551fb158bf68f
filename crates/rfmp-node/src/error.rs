//! Node runtime error types.

use std::fmt;

use rfmp_core::{EngineError, StoreError};

/// Errors that can occur in the node runtime.
#[derive(Debug)]
pub enum NodeError {
    /// Configuration error (bad callsign, out-of-range option).
    ///
    /// Fatal at startup; fix the configuration and relaunch.
    Config(String),

    /// Storage failure opening or using the database.
    ///
    /// Fatal at startup (file permissions, path). At runtime the engine
    /// already retried once before this surfaced.
    Store(StoreError),

    /// Protocol engine error.
    ///
    /// Includes backpressure rejections for `submit_message`; those are
    /// retryable once the queue drains.
    Engine(EngineError),

    /// The runtime is shutting down and stopped accepting work.
    ShuttingDown,
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Store(err) => write!(f, "storage error: {err}"),
            Self::Engine(err) => write!(f, "engine error: {err}"),
            Self::ShuttingDown => write!(f, "node is shutting down"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Engine(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<EngineError> for NodeError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

impl From<rfmp_core::ConfigError> for NodeError {
    fn from(err: rfmp_core::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
