//! Crate-wide error taxonomy.
//!
//! Reads that fail after retrying degrade to empty/default values inside the
//! store, so the variants here mostly surface from mutating commands,
//! validation and transport problems.

use thiserror::Error;

use crate::window::WindowId;

/// Errors produced by the coordination layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// A remote read failed (retried with backoff before surfacing).
    #[error("failed to read '{resource}': {message}")]
    TransientFetch {
        /// Name of the resource being read
        resource: &'static str,
        /// Underlying failure
        message: String,
    },

    /// A mutating engine command failed. Never retried.
    #[error("command '{command}' failed: {message}")]
    Command {
        /// Name of the engine command
        command: &'static str,
        /// Underlying failure
        message: String,
    },

    /// The window behind a registry handle is already gone.
    #[error("window {0} was already destroyed")]
    StaleHandle(WindowId),

    /// Malformed input (hostname, key, delay value). No state was mutated.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A cancel was requested for a key that has no active countdown.
    #[error("no countdown is active for '{0}'")]
    NotDelaying(String),

    /// The engine could not be reached or answered with garbage.
    #[error("engine transport error: {0}")]
    Transport(String),

    /// Local persistence failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl GuardError {
    /// Shorthand for a failed read.
    pub fn fetch(resource: &'static str, message: impl Into<String>) -> Self {
        Self::TransientFetch {
            resource,
            message: message.into(),
        }
    }

    /// Shorthand for a failed mutating command.
    pub fn command(command: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            command,
            message: message.into(),
        }
    }

    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns true for failures that a retry may fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch { .. } | Self::Transport(_))
    }

    /// Returns true if the caller supplied bad input.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if a mutating command was rejected.
    #[must_use]
    pub fn is_command(&self) -> bool {
        matches!(self, Self::Command { .. })
    }
}

impl From<std::io::Error> for GuardError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
