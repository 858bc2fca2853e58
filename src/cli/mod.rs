//! CLI module for the guard.
//!
//! This module provides the command-line interface:
//! - `commands`: Command definitions using clap derive
//! - `client`: IPC client for daemon communication
//! - `display`: Output formatting and display logic
//! - `session`: store, coordinator and dialog wiring for one invocation

pub mod client;
pub mod commands;
pub mod display;
pub mod session;

pub use client::{EventStream, IpcClient};
pub use commands::{Cli, Commands, KindArg, SetDelayArgs};
pub use display::Display;
pub use session::Session;
