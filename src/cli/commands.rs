//! Command definitions for the guard CLI.
//!
//! Uses clap derive macro for argument parsing.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

use crate::coordinator::{DelaySelection, DnsStrictness};
use crate::types::{ItemKind, SettingKey};

// ============================================================================
// CLI Structure
// ============================================================================

/// Eagle Guard - delayed changes for parental-control protections
#[derive(Parser, Debug)]
#[command(
    name = "eagle-guard",
    version,
    about = "Parental-control protections that only weaken after a delay",
    long_about = "Weakening a protection (turning off a switch, shortening the delay, \
                  unblocking an app or website) is deferred: it must be confirmed and only \
                  takes effect once the configured delay has passed.",
    propagate_version = true
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose output for debugging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the daemon socket
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

// ============================================================================
// Subcommands
// ============================================================================

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the engine daemon
    Daemon,

    /// Show the countdown state of a setting, or of every protection
    Status {
        /// Setting key, e.g. enableProtectiveDNS or allowedForUnblockApps-->steam
        key: Option<SettingKey>,
    },

    /// Request a change to a setting
    Request {
        /// Setting key
        key: SettingKey,
        /// Proposed value (JSON; bare words are strings)
        #[arg(value_parser = parse_value)]
        value: Value,
        /// Start the delay right away if the setting is protected
        #[arg(short, long)]
        yes: bool,
    },

    /// Start (or join) the delay for a setting and watch it
    Confirm {
        /// Setting key
        key: SettingKey,
    },

    /// Cancel a running delay
    Cancel {
        /// Setting key
        key: SettingKey,
    },

    /// Watch a running delay until it finishes
    Watch {
        /// Setting key
        key: SettingKey,
    },

    /// Start the unblock delay for a list item
    Prime {
        /// Kind of item
        #[arg(value_enum)]
        kind: KindArg,
        /// Process name or website
        name: String,
    },

    /// Add a website to the block list
    BlockWebsite {
        /// Website or URL
        url: String,
    },

    /// Add an app to the block list
    BlockApp {
        /// Process name
        process: String,
        /// Display name (defaults to the installed app's name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Remove an item whose unblock delay has passed
    Unblock {
        /// Kind of item
        #[arg(value_enum)]
        kind: KindArg,
        /// Process name or website
        name: String,
    },

    /// Show a block list
    List {
        /// Which list
        #[arg(value_enum)]
        kind: KindArg,
    },

    /// Show installed apps that are not blocked yet
    AvailableApps {
        /// Filter by display name
        #[arg(short, long)]
        search: Option<String>,
    },

    /// Change the delay timeout
    SetDelay(SetDelayArgs),

    /// Turn on protective DNS
    EnableDns {
        /// Use strict filtering instead of lenient
        #[arg(long)]
        strict: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell type for completion script
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ============================================================================
// Arguments
// ============================================================================

/// Block list kind as accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    #[value(alias = "apps")]
    App,
    #[value(alias = "websites")]
    Website,
}

impl From<KindArg> for ItemKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::App => ItemKind::App,
            KindArg::Website => ItemKind::Website,
        }
    }
}

/// Arguments for the set-delay command
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct SetDelayArgs {
    /// New delay in milliseconds
    #[arg(long)]
    pub ms: Option<u64>,

    /// New delay in days
    #[arg(long)]
    pub days: Option<f64>,
}

impl SetDelayArgs {
    /// The selection the arguments describe.
    pub fn selection(&self) -> DelaySelection {
        match (self.ms, self.days) {
            (Some(ms), _) => DelaySelection::Millis(ms),
            (None, Some(days)) => DelaySelection::Days(days),
            (None, None) => DelaySelection::Millis(0),
        }
    }
}

impl Commands {
    /// Strictness chosen by `enable-dns`.
    pub fn dns_strictness(strict: bool) -> DnsStrictness {
        if strict {
            DnsStrictness::Strict
        } else {
            DnsStrictness::Lenient
        }
    }
}

// ============================================================================
// Validation Functions
// ============================================================================

/// Parses a JSON value, falling back to a plain string.
fn parse_value(s: &str) -> Result<Value, String> {
    if s.trim().is_empty() {
        return Err("value cannot be empty".to_string());
    }
    Ok(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())))
}

// ============================================================================
// Tests
// ============================================================================
