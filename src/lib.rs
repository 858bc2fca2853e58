//! Eagle Guard Library
//!
//! This library provides the coordination layer between the windows of a
//! parental-control app and the engine that enforces it. Weakening a
//! protection is deferred: it needs confirmation and a countdown the engine
//! owns. It includes:
//! - Cache & coalescing store for engine reads
//! - Deferred commit coordinator
//! - Window registry with confirmation dialog and overlay view-models
//! - Cross-window event bus
//! - Progress rendering for running countdowns
//! - Block list editing
//! - Reference countdown engine daemon with a Unix socket IPC surface
//! - CLI command parsing and display utilities

pub mod backend;
pub mod blocklist;
pub mod bus;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod progress;
pub mod retry;
pub mod types;
pub mod window;

// Re-export commonly used types for convenience
pub use backend::{EngineBackend, MockEngineBackend};
pub use bus::{BusMessage, EventBus};
pub use cache::{CoalescingCache, SharedStateStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GuardConfig;
pub use coordinator::{ChangeOutcome, DeferredCommitCoordinator, DelaySelection, DnsStrictness, Phase};
pub use error::GuardError;
pub use progress::{Countdown, ProgressView};
pub use types::{
    BlockData, ChangeStatus, InstalledApp, IpcRequest, IpcResponse, ItemKind, SettingKey,
};
pub use window::{WindowContext, WindowRegistry, WindowRole, WindowSpec};
