//! Singleton windows: the registry, its native host seam, and the
//! confirmation dialog and overlay view-models.

pub mod dialog;
pub mod error;
pub mod mock;
pub mod overlay;
pub mod registry;

pub use dialog::{ConfirmDialog, DialogMode};
pub use error::WindowError;
pub use mock::MockWindowHost;
pub use overlay::{OverlayReason, OverlayView};
pub use registry::{DestroyNotifier, OpenOutcome, WindowHandle, WindowHost, WindowRegistry};

use url::form_urlencoded;
use uuid::Uuid;

use crate::types::SettingKey;

/// Identifier of a native window.
pub type WindowId = Uuid;

/// The singleton roles a window can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowRole {
    ConfirmDialog,
    DnsStrictnessDialog,
    Overlay,
}

impl WindowRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowRole::ConfirmDialog => "confirmDialog",
            WindowRole::DnsStrictnessDialog => "dnsConfirmationModal",
            WindowRole::Overlay => "overlay",
        }
    }
}

impl std::fmt::Display for WindowRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a window is opened for. Also pushed to an already open window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowContext {
    /// Confirm a deferred change to `key`
    Confirm { key: SettingKey },
    /// Pick a DNS strictness level
    DnsStrictness,
    /// Cover a flagged app
    Overlay {
        display_name: String,
        process_name: String,
    },
}

impl WindowContext {
    pub fn role(&self) -> WindowRole {
        match self {
            WindowContext::Confirm { .. } => WindowRole::ConfirmDialog,
            WindowContext::DnsStrictness => WindowRole::DnsStrictnessDialog,
            WindowContext::Overlay { .. } => WindowRole::Overlay,
        }
    }
}

/// Everything a host needs to create a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub id: WindowId,
    pub role: WindowRole,
    /// Unique native label
    pub label: String,
    /// Page plus query string
    pub url: String,
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub always_on_top: bool,
    pub decorations: bool,
}

impl WindowSpec {
    /// Builds the spec for `context` with a fresh id.
    pub fn for_context(context: &WindowContext) -> Self {
        let id = Uuid::new_v4();
        let role = context.role();
        let label = format!("{}-{}", role.as_str(), id);

        match context {
            WindowContext::Confirm { key } => Self {
                id,
                role,
                label,
                url: format!("confirmDialog.html?key={}", encode(&key.to_string())),
                title: "Configuration Change".to_string(),
                width: 450,
                height: 250,
                always_on_top: true,
                decorations: true,
            },
            WindowContext::DnsStrictness => Self {
                id,
                role,
                label,
                url: "dnsConfirmationModal.html".to_string(),
                title: "Choose DNS strictness level".to_string(),
                width: 450,
                height: 250,
                always_on_top: true,
                decorations: true,
            },
            WindowContext::Overlay {
                display_name,
                process_name,
            } => Self {
                id,
                role,
                label,
                url: format!(
                    "overlayWindow.html?displayName={}&processName={}",
                    encode(display_name),
                    encode(process_name)
                ),
                title: "Overlay".to_string(),
                width: 800,
                height: 600,
                always_on_top: true,
                decorations: false,
            },
        }
    }
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
