//! Role-keyed registry of singleton windows.
//!
//! At most one live window exists per [`WindowRole`]. Opening a role that is
//! already open focuses it and pushes the new context instead of creating a
//! second window; overlays ignore the request. Native destroy callbacks run
//! on the UI thread and reach the registry through a channel, which is
//! drained before every operation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{WindowContext, WindowError, WindowId, WindowRole, WindowSpec};
use crate::bus::BusHandler;
use crate::types::SettingKey;

/// Native window operations.
pub trait WindowHost: Send + Sync {
    /// Creates a window from `spec`.
    fn create(&self, spec: &WindowSpec) -> Result<(), WindowError>;

    /// Raises the window and gives it input focus.
    fn focus(&self, id: WindowId) -> Result<(), WindowError>;

    /// Pushes a new context to an open window.
    fn send_update(&self, id: WindowId, context: &WindowContext) -> Result<(), WindowError>;

    /// Returns false once the native window is gone.
    fn is_live(&self, id: WindowId) -> bool;

    /// Closes the window.
    fn close(&self, id: WindowId) -> Result<(), WindowError>;
}

/// Handle to a registered window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowHandle {
    pub id: WindowId,
    pub role: WindowRole,
    pub destroyed: bool,
}

/// Result of [`WindowRegistry::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new window was created
    Created(WindowId),
    /// The open window was focused and updated
    Focused(WindowId),
    /// An overlay is already showing; nothing happened
    Ignored(WindowId),
}

impl OpenOutcome {
    pub fn id(&self) -> WindowId {
        match self {
            OpenOutcome::Created(id) | OpenOutcome::Focused(id) | OpenOutcome::Ignored(id) => *id,
        }
    }
}

/// Sending side of the destroy channel, handed to the native layer.
#[derive(Debug, Clone)]
pub struct DestroyNotifier {
    tx: Sender<WindowId>,
}

impl DestroyNotifier {
    /// Reports that window `id` was destroyed.
    pub fn notify(&self, id: WindowId) {
        if self.tx.send(id).is_err() {
            tracing::debug!(%id, "window registry gone, destroy notification dropped");
        }
    }
}

/// Registry of singleton windows.
pub struct WindowRegistry<H> {
    host: H,
    slots: Mutex<HashMap<WindowRole, WindowHandle>>,
    destroyed_tx: Sender<WindowId>,
    destroyed_rx: Receiver<WindowId>,
}

impl<H> std::fmt::Debug for WindowRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowRegistry")
            .field("slots", &*self.slots())
            .finish_non_exhaustive()
    }
}

impl<H> WindowRegistry<H> {
    fn slots(&self) -> MutexGuard<'_, HashMap<WindowRole, WindowHandle>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H: WindowHost> WindowRegistry<H> {
    /// Creates an empty registry over `host`.
    pub fn new(host: H) -> Self {
        let (destroyed_tx, destroyed_rx) = unbounded();
        Self {
            host,
            slots: Mutex::new(HashMap::new()),
            destroyed_tx,
            destroyed_rx,
        }
    }

    /// The native host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Notifier for the native layer's destroy callbacks.
    pub fn destroy_notifier(&self) -> DestroyNotifier {
        DestroyNotifier {
            tx: self.destroyed_tx.clone(),
        }
    }

    /// Marks handles whose destroy notification arrived, then clears their
    /// slots.
    fn drain_destroyed(&self, slots: &mut HashMap<WindowRole, WindowHandle>) {
        for id in self.destroyed_rx.try_iter() {
            if let Some(handle) = slots.values_mut().find(|handle| handle.id == id) {
                handle.destroyed = true;
            }
        }
        Self::clear_destroyed(slots);
    }

    fn clear_destroyed(slots: &mut HashMap<WindowRole, WindowHandle>) {
        slots.retain(|role, handle| {
            if handle.destroyed {
                tracing::debug!(%role, id = %handle.id, "window destroyed, slot cleared");
            }
            !handle.destroyed
        });
    }

    /// Live handle for `role`, if any.
    pub fn handle(&self, role: WindowRole) -> Option<WindowHandle> {
        let mut slots = self.slots();
        self.drain_destroyed(&mut slots);
        slots.get(&role).cloned()
    }

    pub fn is_open(&self, role: WindowRole) -> bool {
        self.handle(role).is_some()
    }

    /// Shows the window for `context`, reusing the open one for its role.
    ///
    /// # Errors
    ///
    /// Returns the host error if the window could not be created (the slot
    /// stays empty so the next request retries) or focused.
    pub fn open(&self, context: WindowContext) -> Result<OpenOutcome, WindowError> {
        let role = context.role();
        let mut slots = self.slots();
        self.drain_destroyed(&mut slots);

        if role == WindowRole::Overlay {
            if let Some(handle) = slots.get_mut(&role) {
                if self.host.is_live(handle.id) {
                    tracing::debug!(id = %handle.id, "overlay already showing");
                    return Ok(OpenOutcome::Ignored(handle.id));
                }
                tracing::info!(id = %handle.id, "overlay vanished without notice, recreating");
                handle.destroyed = true;
            }
            Self::clear_destroyed(&mut slots);
        }

        if let Some(handle) = slots.get(&role).cloned() {

            let reused = self
                .host
                .focus(handle.id)
                .and_then(|()| self.host.send_update(handle.id, &context));
            match reused {
                Ok(()) => {
                    tracing::debug!(%role, id = %handle.id, "focused open window");
                    return Ok(OpenOutcome::Focused(handle.id));
                }
                Err(e) if e.is_stale() => {
                    tracing::info!(%role, id = %handle.id, "stale window handle, recreating");
                    slots.remove(&role);
                }
                Err(e) => return Err(e),
            }
        }

        let spec = WindowSpec::for_context(&context);
        if let Err(e) = self.host.create(&spec) {
            tracing::warn!(%role, error = %e, "window creation failed");
            return Err(e);
        }

        tracing::info!(%role, id = %spec.id, "window created");
        slots.insert(
            role,
            WindowHandle {
                id: spec.id,
                role,
                destroyed: false,
            },
        );
        Ok(OpenOutcome::Created(spec.id))
    }

    /// Closes the window for `role`. Returns whether one was open.
    ///
    /// # Errors
    ///
    /// Returns a native host error. A window that is already gone is not an
    /// error.
    pub fn close(&self, role: WindowRole) -> Result<bool, WindowError> {
        let mut slots = self.slots();
        self.drain_destroyed(&mut slots);

        let Some(handle) = slots.remove(&role) else {
            return Ok(false);
        };

        match self.host.close(handle.id) {
            Ok(()) => {
                tracing::info!(%role, id = %handle.id, "window closed");
                Ok(true)
            }
            Err(e) if e.is_stale() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn log_failure<T>(&self, action: &str, result: Result<T, WindowError>) {
        if let Err(e) = result {
            tracing::warn!(action, error = %e, "window operation failed");
        }
    }
}

impl<H: WindowHost> BusHandler for WindowRegistry<H> {
    fn on_preferences_updated(&self) {
        self.log_failure("close confirm dialog", self.close(WindowRole::ConfirmDialog));
    }

    fn on_delay_requires_confirmation(&self, setting_id: &SettingKey) {
        self.log_failure(
            "open confirm dialog",
            self.open(WindowContext::Confirm {
                key: setting_id.clone(),
            }),
        );
    }

    fn on_flag_process_for_overlay(&self, display_name: &str, process_name: &str) {
        self.log_failure(
            "open overlay",
            self.open(WindowContext::Overlay {
                display_name: display_name.to_string(),
                process_name: process_name.to_string(),
            }),
        );
    }

    fn on_overlay_close_requested(&self) {
        self.log_failure("close overlay", self.close(WindowRole::Overlay));
    }

    fn on_confirm_dialog_close_requested(&self) {
        self.log_failure("close confirm dialog", self.close(WindowRole::ConfirmDialog));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{dispatch, BusMessage};
    use crate::window::MockWindowHost;
    use crate::types::{ItemKind, PROTECTIVE_DNS_KEY};

    fn confirm(key: SettingKey) -> WindowContext {
        WindowContext::Confirm { key }
    }

    fn overlay(name: &str) -> WindowContext {
        WindowContext::Overlay {
            display_name: name.into(),
            process_name: name.to_lowercase(),
        }
    }

    mod open_tests {
        use super::*;

        #[test]
        fn test_second_open_focuses_and_updates() {
            let registry = WindowRegistry::new(MockWindowHost::new());
            let first = registry
                .open(confirm(SettingKey::preference(PROTECTIVE_DNS_KEY)))
                .unwrap();
            let second = registry
                .open(confirm(SettingKey::DelayTimeout))
                .unwrap();

            assert!(matches!(first, OpenOutcome::Created(_)));
            assert_eq!(second, OpenOutcome::Focused(first.id()));
            assert_eq!(registry.host().created().len(), 1);
            assert_eq!(
                registry.host().updates(first.id()),
                vec![confirm(SettingKey::DelayTimeout)]
            );
        }

        #[test]
        fn test_overlays_do_not_stack() {
            let registry = WindowRegistry::new(MockWindowHost::new());
            let first = registry.open(overlay("Steam")).unwrap();
            let second = registry.open(overlay("Discord")).unwrap();

            assert_eq!(second, OpenOutcome::Ignored(first.id()));
            assert_eq!(registry.host().created().len(), 1);
            assert!(registry.host().updates(first.id()).is_empty());
        }

        #[test]
        fn test_vanished_overlay_is_recreated() {
            let registry = WindowRegistry::new(MockWindowHost::new());
            let first = registry.open(overlay("Steam")).unwrap();
            registry.host().destroy_silently(first.id());

            let second = registry.open(overlay("Discord")).unwrap();

            assert!(matches!(second, OpenOutcome::Created(_)));
            assert_ne!(first.id(), second.id());
            assert_eq!(registry.host().live().len(), 1);
            assert_eq!(registry.handle(WindowRole::Overlay).map(|h| h.id), Some(second.id()));
        }

        #[test]
        fn test_destroyed_window_is_recreated() {
            let registry = WindowRegistry::new(MockWindowHost::new());
            let notifier = registry.destroy_notifier();
            let first = registry.open(WindowContext::DnsStrictness).unwrap();

            notifier.notify(first.id());
            assert!(!registry.is_open(WindowRole::DnsStrictnessDialog));

            let second = registry.open(WindowContext::DnsStrictness).unwrap();
            assert!(matches!(second, OpenOutcome::Created(_)));
            assert_ne!(first.id(), second.id());
        }

        #[test]
        fn test_stale_handle_is_recreated() {
            let registry = WindowRegistry::new(MockWindowHost::new());
            let first = registry
                .open(confirm(SettingKey::DelayTimeout))
                .unwrap();
            registry.host().destroy_silently(first.id());

            let second = registry
                .open(confirm(SettingKey::DelayTimeout))
                .unwrap();

            assert!(matches!(second, OpenOutcome::Created(_)));
            assert_eq!(registry.host().live().len(), 1);
        }

        #[test]
        fn test_failed_create_leaves_slot_empty() {
            let registry = WindowRegistry::new(MockWindowHost::new());
            registry.host().fail_next_create();

            assert!(registry.open(WindowContext::DnsStrictness).is_err());
            assert!(!registry.is_open(WindowRole::DnsStrictnessDialog));

            let retry = registry.open(WindowContext::DnsStrictness).unwrap();
            assert!(matches!(retry, OpenOutcome::Created(_)));
        }

        #[test]
        fn test_roles_are_independent() {
            let registry = WindowRegistry::new(MockWindowHost::new());
            registry.open(confirm(SettingKey::DelayTimeout)).unwrap();
            registry.open(WindowContext::DnsStrictness).unwrap();
            registry.open(overlay("Steam")).unwrap();
            assert_eq!(registry.host().live().len(), 3);
        }
    }

    mod close_tests {
        use super::*;

        #[test]
        fn test_close_clears_slot() {
            let registry = WindowRegistry::new(MockWindowHost::new());
            registry.open(overlay("Steam")).unwrap();

            assert!(registry.close(WindowRole::Overlay).unwrap());
            assert!(!registry.close(WindowRole::Overlay).unwrap());
            assert!(registry.host().live().is_empty());
        }

        #[test]
        fn test_close_of_vanished_window_is_not_an_error() {
            let registry = WindowRegistry::new(MockWindowHost::new());
            let opened = registry.open(overlay("Steam")).unwrap();
            registry.host().destroy_silently(opened.id());

            assert!(!registry.close(WindowRole::Overlay).unwrap());
        }
    }

    mod bus_tests {
        use super::*;

        #[test]
        fn test_bus_messages_drive_windows() {
            let registry = WindowRegistry::new(MockWindowHost::new());
            let key = SettingKey::unblock(ItemKind::App, "steam");

            dispatch(
                &registry,
                &BusMessage::DelayRequiresConfirmation {
                    setting_id: key.clone(),
                },
            );
            dispatch(
                &registry,
                &BusMessage::FlagProcessForOverlay {
                    display_name: "Steam".into(),
                    process_name: "steam".into(),
                },
            );
            assert!(registry.is_open(WindowRole::ConfirmDialog));
            assert!(registry.is_open(WindowRole::Overlay));

            dispatch(&registry, &BusMessage::PreferencesUpdated);
            dispatch(&registry, &BusMessage::OverlayCloseRequested);
            assert!(!registry.is_open(WindowRole::ConfirmDialog));
            assert!(!registry.is_open(WindowRole::Overlay));
        }
    }
}
