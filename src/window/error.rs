//! Window host errors.

use thiserror::Error;

use super::WindowId;
use crate::error::GuardError;

/// Errors reported by a [`WindowHost`](super::WindowHost).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WindowError {
    /// The window was destroyed before the operation reached it.
    #[error("window {0} no longer exists")]
    Stale(WindowId),

    /// The native layer refused the operation.
    #[error("native window error: {0}")]
    Native(String),
}

impl WindowError {
    /// Returns true if the handle should be dropped and the window recreated.
    pub fn is_stale(&self) -> bool {
        matches!(self, WindowError::Stale(_))
    }
}

impl From<WindowError> for GuardError {
    fn from(err: WindowError) -> Self {
        match err {
            WindowError::Stale(id) => GuardError::StaleHandle(id),
            WindowError::Native(message) => GuardError::command("window", message),
        }
    }
}
