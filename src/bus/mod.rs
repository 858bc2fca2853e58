//! Cross-window event bus.
//!
//! This module provides:
//! - `BusMessage`: the closed vocabulary of cross-window notifications
//! - `EventBus`: fire-and-forget publish/subscribe over a broadcast channel
//! - `BusHandler` + `dispatch`: the single dispatch table for receivers
//!
//! Delivery is best-effort. A subscriber that falls behind loses the oldest
//! messages, and a window that subscribes late never sees earlier ones, so
//! every window also re-polls the engine when it loads.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::SettingKey;

/// Messages buffered per subscriber before the oldest are dropped.
pub const BUS_CAPACITY: usize = 64;

// ============================================================================
// BusMessage
// ============================================================================

/// A cross-window notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum BusMessage {
    /// A block list changed; re-fetch and re-render.
    ListUpdated,
    /// A protected preference changed; close confirmation dialogs and refresh.
    PreferencesUpdated,
    /// A countdown changed state; re-poll and re-render.
    TimerUpdated,
    /// A deferred action needs a visible confirmation dialog.
    DelayRequiresConfirmation {
        /// Key awaiting confirmation
        setting_id: SettingKey,
    },
    /// An enforcement event requires the overlay.
    FlagProcessForOverlay {
        /// Name shown to the user
        display_name: String,
        /// Flagged process, or a reason code
        process_name: String,
    },
    /// Tear down the overlay window.
    OverlayCloseRequested,
    /// Tear down the confirmation dialog.
    ConfirmDialogCloseRequested,
    /// Re-target an open confirmation dialog.
    ConfirmDialogKeyUpdated {
        /// New key
        key: SettingKey,
    },
}

impl BusMessage {
    /// Returns the wire name of the message.
    pub fn name(&self) -> &'static str {
        match self {
            BusMessage::ListUpdated => "list-updated",
            BusMessage::PreferencesUpdated => "preferences-updated",
            BusMessage::TimerUpdated => "timer-updated",
            BusMessage::DelayRequiresConfirmation { .. } => "delay-requires-confirmation",
            BusMessage::FlagProcessForOverlay { .. } => "flag-process-for-overlay",
            BusMessage::OverlayCloseRequested => "overlay-close-requested",
            BusMessage::ConfirmDialogCloseRequested => "confirm-dialog-close-requested",
            BusMessage::ConfirmDialogKeyUpdated { .. } => "confirm-dialog-key-updated",
        }
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Fire-and-forget publish/subscribe.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusMessage>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with [`BUS_CAPACITY`] slots per subscriber.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes a message. Having no subscribers is not an error.
    pub fn publish(&self, message: BusMessage) {
        tracing::debug!(event = message.name(), "publishing");
        if self.tx.send(message).is_err() {
            tracing::trace!("no subscribers");
        }
    }

    /// Subscribes to messages published from now on.
    pub fn subscribe(&self) -> BusSubscriber {
        BusSubscriber {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving end of the bus.
#[derive(Debug)]
pub struct BusSubscriber {
    rx: broadcast::Receiver<BusMessage>,
}

impl BusSubscriber {
    /// Waits for the next message. Lost messages are skipped; returns `None`
    /// once every publisher is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "bus subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "bus subscriber lagged, messages dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Receiver side of the bus. Every method defaults to ignoring the message.
pub trait BusHandler {
    fn on_list_updated(&self) {}
    fn on_preferences_updated(&self) {}
    fn on_timer_updated(&self) {}
    fn on_delay_requires_confirmation(&self, _setting_id: &SettingKey) {}
    fn on_flag_process_for_overlay(&self, _display_name: &str, _process_name: &str) {}
    fn on_overlay_close_requested(&self) {}
    fn on_confirm_dialog_close_requested(&self) {}
    fn on_confirm_dialog_key_updated(&self, _key: &SettingKey) {}
}

/// Routes `message` to the matching handler method.
pub fn dispatch<H: BusHandler + ?Sized>(handler: &H, message: &BusMessage) {
    match message {
        BusMessage::ListUpdated => handler.on_list_updated(),
        BusMessage::PreferencesUpdated => handler.on_preferences_updated(),
        BusMessage::TimerUpdated => handler.on_timer_updated(),
        BusMessage::DelayRequiresConfirmation { setting_id } => {
            handler.on_delay_requires_confirmation(setting_id)
        }
        BusMessage::FlagProcessForOverlay {
            display_name,
            process_name,
        } => handler.on_flag_process_for_overlay(display_name, process_name),
        BusMessage::OverlayCloseRequested => handler.on_overlay_close_requested(),
        BusMessage::ConfirmDialogCloseRequested => handler.on_confirm_dialog_close_requested(),
        BusMessage::ConfirmDialogKeyUpdated { key } => handler.on_confirm_dialog_key_updated(key),
    }
}
