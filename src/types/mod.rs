//! Core data types shared by the coordinator, the engine and the IPC layer.
//!
//! This module defines:
//! - Namespaced setting keys
//! - Change status reported by the timer engine
//! - Block list documents and installed app entries
//! - IPC request/response serialization

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GuardError;

// ============================================================================
// Constants
// ============================================================================

/// Preference key holding the configured delay in milliseconds.
pub const DELAY_TIMEOUT_KEY: &str = "delayTimeOut";

/// Delay used when no timeout has been configured yet (3 minutes).
pub const DEFAULT_DELAY_TIMEOUT_MS: u64 = 180_000;

/// Overlay shown on top of restricted content.
pub const OVERLAY_RESTRICTED_CONTENT_KEY: &str = "overlayRestrictedContent";

/// Protective DNS resolver switch.
pub const PROTECTIVE_DNS_KEY: &str = "enableProtectiveDNS";

/// Strictness chosen when protective DNS was turned on.
pub const DNS_STRICTNESS_KEY: &str = "dnsStrictness";

/// Settings and app protection switch.
pub const SETTINGS_PROTECTION_KEY: &str = "blockSettingsSwitch";

/// Safe-search enforcement switch.
pub const SAFE_SEARCH_KEY: &str = "enforceSafeSearch";

/// Protected boolean preferences shown on the main screen.
pub const PROTECTED_PREFERENCES: [&str; 4] = [
    OVERLAY_RESTRICTED_CONTENT_KEY,
    PROTECTIVE_DNS_KEY,
    SETTINGS_PROTECTION_KEY,
    SAFE_SEARCH_KEY,
];

/// Separator between a list namespace and an item in a composite key.
const KEY_SEPARATOR: &str = "-->";

const UNBLOCK_APPS_NAMESPACE: &str = "allowedForUnblockApps";
const UNBLOCK_WEBSITES_NAMESPACE: &str = "allowedForUnblockWebsites";

// ============================================================================
// ItemKind
// ============================================================================

/// The two kinds of block list items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// A desktop application, identified by process name
    App,
    /// A website, identified by hostname
    Website,
}

impl ItemKind {
    /// Returns the wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::App => "app",
            ItemKind::Website => "website",
        }
    }

    fn unblock_namespace(&self) -> &'static str {
        match self {
            ItemKind::App => UNBLOCK_APPS_NAMESPACE,
            ItemKind::Website => UNBLOCK_WEBSITES_NAMESPACE,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app" | "apps" => Ok(ItemKind::App),
            "website" | "websites" | "site" => Ok(ItemKind::Website),
            other => Err(GuardError::validation(format!("unknown item type '{other}'"))),
        }
    }
}

// ============================================================================
// SettingKey
// ============================================================================

/// Identifies a protected setting or a block list item awaiting unblock.
///
/// Composite keys carry a namespace prefix so that app keys, website keys and
/// scalar preference keys can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SettingKey {
    /// The delay timeout itself (`delayTimeOut`)
    DelayTimeout,
    /// A boolean protection preference
    Preference(String),
    /// An app to be moved to the allowed-for-unblock list
    UnblockApp(String),
    /// A website to be moved to the allowed-for-unblock list
    UnblockWebsite(String),
}

impl SettingKey {
    /// Creates a preference key.
    pub fn preference(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == DELAY_TIMEOUT_KEY {
            SettingKey::DelayTimeout
        } else {
            SettingKey::Preference(name)
        }
    }

    /// Creates the unblock key for a list item. The item should already be
    /// normalized to its identity.
    pub fn unblock(kind: ItemKind, identity: impl Into<String>) -> Self {
        match kind {
            ItemKind::App => SettingKey::UnblockApp(identity.into()),
            ItemKind::Website => SettingKey::UnblockWebsite(identity.into()),
        }
    }

    /// Returns the list item this key refers to, if any.
    pub fn unblock_item(&self) -> Option<(ItemKind, &str)> {
        match self {
            SettingKey::UnblockApp(name) => Some((ItemKind::App, name)),
            SettingKey::UnblockWebsite(host) => Some((ItemKind::Website, host)),
            _ => None,
        }
    }

    /// Returns true if this key guards the protective DNS switch.
    pub fn is_protective_dns(&self) -> bool {
        matches!(self, SettingKey::Preference(name) if name == PROTECTIVE_DNS_KEY)
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingKey::DelayTimeout => f.write_str(DELAY_TIMEOUT_KEY),
            SettingKey::Preference(name) => f.write_str(name),
            SettingKey::UnblockApp(name) => {
                write!(f, "{UNBLOCK_APPS_NAMESPACE}{KEY_SEPARATOR}{name}")
            }
            SettingKey::UnblockWebsite(host) => {
                write!(f, "{UNBLOCK_WEBSITES_NAMESPACE}{KEY_SEPARATOR}{host}")
            }
        }
    }
}

impl FromStr for SettingKey {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(GuardError::validation("setting key must not be empty"));
        }

        let Some((namespace, item)) = s.split_once(KEY_SEPARATOR) else {
            return Ok(SettingKey::preference(s));
        };

        let item = item.trim();
        if item.is_empty() {
            return Err(GuardError::validation(format!("setting key '{s}' has no item")));
        }

        if namespace == ItemKind::App.unblock_namespace() {
            Ok(SettingKey::UnblockApp(item.to_string()))
        } else if namespace == ItemKind::Website.unblock_namespace() {
            Ok(SettingKey::UnblockWebsite(item.to_string()))
        } else {
            Err(GuardError::validation(format!(
                "unknown setting namespace '{namespace}'"
            )))
        }
    }
}

impl TryFrom<String> for SettingKey {
    type Error = GuardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SettingKey> for String {
    fn from(key: SettingKey) -> Self {
        key.to_string()
    }
}

// ============================================================================
// ChangeStatus
// ============================================================================

/// Authoritative state of a deferred commit, as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStatus {
    /// Whether a countdown is active for the key
    pub is_changing: bool,
    /// Milliseconds left on the countdown
    #[serde(default)]
    pub time_remaining: u64,
    /// Delay that was configured when the countdown started
    #[serde(default)]
    pub delay_time_out_at_time_of_change: Option<u64>,
    /// Delay configured right now
    #[serde(default)]
    pub current_timeout: Option<u64>,
    /// Value to be committed on expiry, if the key carries one
    #[serde(default)]
    pub new_value: Option<u64>,
}

impl ChangeStatus {
    /// Status for a key without an active countdown.
    pub fn idle(current_timeout: Option<u64>) -> Self {
        Self {
            current_timeout,
            ..Self::default()
        }
    }

    /// Time left on the countdown.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.time_remaining)
    }

    /// Full length of the countdown, never shorter than what remains.
    pub fn total(&self) -> Duration {
        let total = self
            .delay_time_out_at_time_of_change
            .filter(|ms| *ms > 0)
            .or(self.current_timeout.filter(|ms| *ms > 0))
            .unwrap_or(DEFAULT_DELAY_TIMEOUT_MS);
        Duration::from_millis(total.max(self.time_remaining))
    }
}

// ============================================================================
// Block data
// ============================================================================

/// An installed (or blocked) application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    /// Executable name, e.g. `firefox`
    #[serde(default)]
    pub process_name: String,
    /// Human readable name
    #[serde(default)]
    pub display_name: String,
}

impl InstalledApp {
    /// Creates a new app entry.
    pub fn new(process_name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            display_name: display_name.into(),
        }
    }
}

/// The block list document owned by the engine.
///
/// Unknown fields are carried through untouched so that a write never drops
/// data written by a newer engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockData {
    /// Blocked applications
    #[serde(default)]
    pub blocked_apps: Vec<InstalledApp>,
    /// Blocked hostnames
    #[serde(default)]
    pub blocked_websites: Vec<String>,
    /// Process names whose unblock delay has elapsed
    #[serde(default)]
    pub allowed_for_unblock_apps: Vec<String>,
    /// Hostnames whose unblock delay has elapsed
    #[serde(default)]
    pub allowed_for_unblock_websites: Vec<String>,
    /// Fields this version does not know about
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl BlockData {
    /// Returns the allowed-for-unblock list for a kind.
    pub fn allowed_list(&self, kind: ItemKind) -> &[String] {
        match kind {
            ItemKind::App => &self.allowed_for_unblock_apps,
            ItemKind::Website => &self.allowed_for_unblock_websites,
        }
    }

    /// Returns the mutable allowed-for-unblock list for a kind.
    pub fn allowed_list_mut(&mut self, kind: ItemKind) -> &mut Vec<String> {
        match kind {
            ItemKind::App => &mut self.allowed_for_unblock_apps,
            ItemKind::Website => &mut self.allowed_for_unblock_websites,
        }
    }

    /// Returns true if the item may be removed from the block list.
    pub fn is_allowed_for_unblock(&self, kind: ItemKind, identity: &str) -> bool {
        self.allowed_list(kind)
            .iter()
            .any(|entry| entry.trim().eq_ignore_ascii_case(identity))
    }

    /// Marks the item as allowed for unblock. Returns false if it already was.
    pub fn allow_unblock(&mut self, kind: ItemKind, identity: &str) -> bool {
        if self.is_allowed_for_unblock(kind, identity) {
            return false;
        }
        self.allowed_list_mut(kind).push(identity.to_string());
        true
    }
}

/// Interprets a stored preference as an on/off switch.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ============================================================================
// IPC Types
// ============================================================================

/// IPC request from a window (client) to the engine daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum IpcRequest {
    /// Read the block list document
    ReadBlockData,
    /// Replace the block list document
    WriteBlockData {
        /// New document
        data: BlockData,
    },
    /// Enumerate installed applications
    ListInstalledApps,
    /// Query the countdown state of a key
    GetChangeStatus {
        /// Key to query
        setting_id: SettingKey,
    },
    /// Start (or join) a countdown
    StartCountdown {
        /// Key to start
        setting_id: SettingKey,
        /// Countdown length in ms; the configured delay if absent
        #[serde(default)]
        remaining_time: Option<u64>,
        /// Value to commit on expiry
        #[serde(default)]
        target_timeout: Option<u64>,
    },
    /// Cancel a countdown
    CancelCountdown {
        /// Key to cancel
        setting_id: SettingKey,
    },
    /// Begin the unblock delay for a list item
    PrimeForDeletion {
        /// Kind of item
        item_type: ItemKind,
        /// Item identity
        name: String,
    },
    /// Read a preference
    ReadPreference {
        /// Preference key
        key: String,
    },
    /// Save a preference
    SavePreference {
        /// Preference key
        key: String,
        /// New value
        value: Value,
    },
    /// Ask every window to close the confirmation dialog
    CloseConfirmationDialog,
    /// Ask every window to close the overlay
    CloseOverlayWindow,
    /// Terminate a flagged process
    CloseApp {
        /// Process to terminate
        process_name: String,
    },
    /// Keep the connection open and stream bus messages over it
    Subscribe,
}

impl IpcRequest {
    /// Returns true for requests that only read state.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            IpcRequest::ReadBlockData
                | IpcRequest::ListInstalledApps
                | IpcRequest::GetChangeStatus { .. }
                | IpcRequest::ReadPreference { .. }
                | IpcRequest::Subscribe
        )
    }
}

/// IPC response from the engine daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Response status ("success" or "error")
    pub status: String,
    /// Human-readable message
    pub message: String,
    /// Optional response payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl IpcResponse {
    /// Creates a success response.
    pub fn success(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
            data,
        }
    }

    /// Creates an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            data: None,
        }
    }

    /// Returns true if this is an error response.
    pub fn is_error(&self) -> bool {
        self.status == "error"
    }

    /// Encodes `err` so the client can rebuild its kind.
    pub fn from_error(err: &GuardError) -> Self {
        let (kind, detail) = match err {
            GuardError::Validation(detail) => ("validation", detail.clone()),
            GuardError::NotDelaying(key) => ("not_delaying", key.clone()),
            GuardError::TransientFetch { message, .. } => ("fetch", message.clone()),
            other => ("command", other.to_string()),
        };
        Self {
            data: Some(serde_json::json!({ "kind": kind, "detail": detail })),
            ..Self::error(err.to_string())
        }
    }

    /// Rebuilds the error carried by an error response to `command`.
    pub fn to_error(&self, command: &'static str, is_read: bool) -> GuardError {
        let field = |name: &str| {
            self.data
                .as_ref()
                .and_then(|d| d.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let detail = field("detail").unwrap_or_else(|| self.message.clone());

        match field("kind").as_deref() {
            Some("validation") => GuardError::Validation(detail),
            Some("not_delaying") => GuardError::NotDelaying(detail),
            _ if is_read => GuardError::fetch(command, detail),
            _ => GuardError::command(command, detail),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
