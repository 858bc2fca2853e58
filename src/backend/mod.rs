//! Command surface of the enforcement engine.
//!
//! Every window talks to the engine through [`EngineBackend`]. The daemon's
//! IPC client implements it over a Unix socket; [`MockEngineBackend`] runs the
//! same countdown engine in-process for tests.

pub mod mock;

pub use mock::MockEngineBackend;

use serde_json::Value;

use crate::error::GuardError;
use crate::types::{BlockData, ChangeStatus, InstalledApp, ItemKind, SettingKey};

/// Commands consumed from the engine that owns timers and persistence.
///
/// Reads are idempotent and may be retried by callers. Mutating commands
/// must not be retried.
#[allow(async_fn_in_trait)]
pub trait EngineBackend {
    /// Reads the block list document.
    async fn read_block_data(&self) -> Result<BlockData, GuardError>;

    /// Replaces the block list document.
    async fn write_block_data(&self, data: &BlockData) -> Result<(), GuardError>;

    /// Enumerates installed applications.
    async fn list_installed_apps(&self) -> Result<Vec<InstalledApp>, GuardError>;

    /// Queries the countdown for `key`.
    async fn get_change_status(&self, key: &SettingKey) -> Result<ChangeStatus, GuardError>;

    /// Starts a countdown, or joins the one already running for `key`.
    ///
    /// `remaining_ms` defaults to the configured delay; `target` is the value
    /// committed on expiry for keys that carry one.
    async fn start_countdown(
        &self,
        key: &SettingKey,
        remaining_ms: Option<u64>,
        target: Option<u64>,
    ) -> Result<(), GuardError>;

    /// Cancels the countdown for `key`. The pending change is discarded.
    async fn cancel_countdown(&self, key: &SettingKey) -> Result<(), GuardError>;

    /// Begins the delay that must pass before an item may be unblocked.
    async fn prime_for_deletion(&self, kind: ItemKind, name: &str) -> Result<(), GuardError>;

    /// Reads a preference; absent keys read as `null`.
    async fn read_preference(&self, key: &str) -> Result<Value, GuardError>;

    /// Saves a preference.
    async fn save_preference(&self, key: &str, value: &Value) -> Result<(), GuardError>;

    /// Asks every window to close its confirmation dialog.
    async fn close_confirmation_dialog(&self) -> Result<(), GuardError>;

    /// Asks every window to close the overlay.
    async fn close_overlay_window(&self) -> Result<(), GuardError>;

    /// Terminates a process by exact name. Returns whether one was killed.
    async fn close_app(&self, process_name: &str) -> Result<bool, GuardError>;
}
