//! Overlay view-model.

use crate::backend::EngineBackend;
use crate::error::GuardError;

/// Why the overlay is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayReason {
    /// A blocked app was launched
    FlaggedApp,
    /// Task manager, control panel or similar is open
    ProtectedSystemApp,
    /// A browser is running behind a proxy, VPN or TOR
    BrowserWithProxy,
    /// The uninstaller is open
    UninstallerWindowDetected,
}

impl OverlayReason {
    /// Parses a reason code; anything else is a flagged app.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "protected-system-app" => OverlayReason::ProtectedSystemApp,
            "browser-with-proxy" => OverlayReason::BrowserWithProxy,
            "uninstaller-window-detected" => OverlayReason::UninstallerWindowDetected,
            _ => OverlayReason::FlaggedApp,
        }
    }

    pub fn code(&self) -> Option<&'static str> {
        match self {
            OverlayReason::FlaggedApp => None,
            OverlayReason::ProtectedSystemApp => Some("protected-system-app"),
            OverlayReason::BrowserWithProxy => Some("browser-with-proxy"),
            OverlayReason::UninstallerWindowDetected => Some("uninstaller-window-detected"),
        }
    }
}

/// State of the overlay window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayView {
    display_name: String,
    process_name: String,
    reason: OverlayReason,
}

impl OverlayView {
    /// Builds the view from a `flag-process-for-overlay` payload. The process
    /// name may carry a reason code instead.
    pub fn new(display_name: impl Into<String>, process_name: impl Into<String>) -> Self {
        let process_name = process_name.into();
        Self {
            reason: OverlayReason::from_code(&process_name),
            display_name: display_name.into(),
            process_name,
        }
    }

    pub fn reason(&self) -> OverlayReason {
        self.reason
    }

    /// Name shown to the user.
    pub fn app_name(&self) -> &str {
        [self.display_name.trim(), self.process_name.trim()]
            .into_iter()
            .find(|name| !name.is_empty())
            .unwrap_or("the application")
    }

    pub fn message(&self) -> String {
        match self.reason {
            OverlayReason::FlaggedApp => format!(
                "{} is blocked. Close it to continue.",
                self.app_name()
            ),
            OverlayReason::ProtectedSystemApp => "We noticed a protected system app is open \
                (Task Manager, Task Scheduler, or Control Panel). Please close that window \
                to allow this overlay to close automatically."
                .to_string(),
            OverlayReason::BrowserWithProxy => "We noticed a browser application running while \
                TOR, a VPN, or Proxy is active on your system. For your safety, please close \
                the browser to allow this overlay to close automatically."
                .to_string(),
            OverlayReason::UninstallerWindowDetected => "We detected that the uninstaller window \
                is open. Please close the uninstaller window to allow this overlay to close \
                automatically."
                .to_string(),
        }
    }

    /// Whether the "close app" button is offered. Reason codes hide it.
    pub fn shows_close_button(&self) -> bool {
        self.reason == OverlayReason::FlaggedApp
    }

    /// Terminates the flagged app, closing the overlay only if the engine
    /// reports the app was closed.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the overlay shows a reason code, or
    /// the engine error.
    pub async fn close_flagged_app<B: EngineBackend>(&self, backend: &B) -> Result<bool, GuardError> {
        if !self.shows_close_button() {
            return Err(GuardError::validation(
                "this overlay closes once the flagged window is gone",
            ));
        }

        let closed = backend.close_app(self.process_name.trim()).await?;
        if closed {
            backend.close_overlay_window().await?;
        } else {
            tracing::warn!(process = %self.process_name, "app did not close, overlay stays");
        }
        Ok(closed)
    }

    /// Asks for the overlay to be torn down.
    ///
    /// # Errors
    ///
    /// Returns the engine error.
    pub async fn dismiss<B: EngineBackend>(&self, backend: &B) -> Result<(), GuardError> {
        backend.close_overlay_window().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockEngineBackend;
    use crate::bus::{BusMessage, EventBus};
    use crate::clock::SystemClock;
    use std::sync::Arc;

    #[test]
    fn test_reason_codes_hide_close_button() {
        let view = OverlayView::new("", "browser-with-proxy");
        assert_eq!(view.reason(), OverlayReason::BrowserWithProxy);
        assert!(!view.shows_close_button());
        assert!(view.message().contains("VPN"));

        let app = OverlayView::new("Steam", "steam");
        assert!(app.shows_close_button());
        assert_eq!(app.reason().code(), None);
    }

    #[test]
    fn test_app_name_fallbacks() {
        assert_eq!(OverlayView::new("Steam", "steam").app_name(), "Steam");
        assert_eq!(OverlayView::new(" ", "steam").app_name(), "steam");
        assert_eq!(OverlayView::new("", "").app_name(), "the application");
    }

    #[tokio::test]
    async fn test_close_flagged_app_closes_overlay_on_success() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let backend = MockEngineBackend::new(Arc::new(SystemClock)).with_bus(bus);

        let closed = OverlayView::new("Steam", "steam")
            .close_flagged_app(&backend)
            .await
            .unwrap();

        assert!(closed);
        assert_eq!(backend.closed_apps(), vec!["steam".to_string()]);
        assert_eq!(sub.try_recv(), Some(BusMessage::OverlayCloseRequested));
    }

    #[tokio::test]
    async fn test_overlay_stays_when_app_survives() {
        let backend = MockEngineBackend::new(Arc::new(SystemClock));
        backend.set_close_app_result(false);

        let closed = OverlayView::new("Steam", "steam")
            .close_flagged_app(&backend)
            .await
            .unwrap();

        assert!(!closed);
        assert_eq!(backend.call_count("close_overlay_window"), 0);
    }

    #[tokio::test]
    async fn test_reason_overlay_cannot_kill() {
        let backend = MockEngineBackend::new(Arc::new(SystemClock));
        let result = OverlayView::new("", "protected-system-app")
            .close_flagged_app(&backend)
            .await;
        assert!(result.unwrap_err().is_validation());
        assert_eq!(backend.call_count("close_app"), 0);
    }
}
