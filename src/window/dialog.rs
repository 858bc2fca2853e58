//! Confirmation dialog view-model.
//!
//! A dialog is bound to one setting key. On load it asks the engine whether a
//! countdown is already running and, if so, shows its progress instead of
//! the confirm prompt. Closing and reopening therefore never restarts a delay.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::backend::EngineBackend;
use crate::bus::BusMessage;
use crate::clock::Clock;
use crate::coordinator::{DeferredCommitCoordinator, Phase};
use crate::error::GuardError;
use crate::progress::{Countdown, ProgressEvent, ProgressTicker, ProgressView, TickerHandle};
use crate::types::SettingKey;

/// What the dialog shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogMode {
    /// The confirm prompt
    Confirming,
    /// A running countdown
    Delaying(ProgressView),
    /// The countdown ran out and the change took effect; confirm is disabled
    Finished,
    /// The countdown ended elsewhere without the change taking effect
    Cancelled,
}

struct Ticking {
    handle: TickerHandle,
    events: UnboundedReceiver<ProgressEvent>,
}

/// The confirmation dialog of one window.
pub struct ConfirmDialog<B> {
    key: SettingKey,
    coordinator: Arc<DeferredCommitCoordinator<B>>,
    clock: Arc<dyn Clock>,
    mode: DialogMode,
    confirm_enabled: bool,
    close_requested: bool,
    ticking: Option<Ticking>,
}

impl<B> std::fmt::Debug for ConfirmDialog<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmDialog")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("confirm_enabled", &self.confirm_enabled)
            .field("close_requested", &self.close_requested)
            .field("ticking", &self.ticking.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: EngineBackend> ConfirmDialog<B> {
    pub fn new(
        key: SettingKey,
        coordinator: Arc<DeferredCommitCoordinator<B>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key,
            coordinator,
            clock,
            mode: DialogMode::Confirming,
            confirm_enabled: true,
            close_requested: false,
            ticking: None,
        }
    }

    pub fn key(&self) -> &SettingKey {
        &self.key
    }

    pub fn mode(&self) -> &DialogMode {
        &self.mode
    }

    pub fn confirm_enabled(&self) -> bool {
        self.confirm_enabled
    }

    /// Whether the dialog asked to be closed.
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Re-polls the engine and shows whatever it holds for the key.
    ///
    /// # Errors
    ///
    /// Returns the read error; the dialog keeps its current mode.
    pub async fn load(&mut self) -> Result<&DialogMode, GuardError> {
        match self.coordinator.resume(&self.key).await? {
            Phase::Delaying { countdown } => self.show_progress(countdown),
            Phase::Committed => self.finish(),
            _ => {
                self.stop_ticking();
                self.mode = DialogMode::Confirming;
                self.confirm_enabled = true;
            }
        }
        Ok(&self.mode)
    }

    /// Re-polls the engine after the countdown may have ended. A countdown
    /// that vanished without its change taking effect shows as
    /// [`DialogMode::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns the read error; the dialog keeps its current mode.
    pub async fn refresh(&mut self) -> Result<&DialogMode, GuardError> {
        let was_delaying = matches!(self.mode, DialogMode::Delaying(_));
        self.load().await?;
        if was_delaying && self.mode == DialogMode::Confirming {
            tracing::info!(key = %self.key, "countdown ended elsewhere, nothing changed");
            self.stop_ticking();
            self.mode = DialogMode::Cancelled;
            self.confirm_enabled = false;
            self.close_requested = true;
        }
        Ok(&self.mode)
    }

    /// Starts the delay, or joins the one already running.
    ///
    /// # Errors
    ///
    /// Returns the engine error; the dialog then shows the engine's state.
    pub async fn confirm(&mut self) -> Result<&DialogMode, GuardError> {
        if !self.confirm_enabled {
            return Ok(&self.mode);
        }
        match self.coordinator.start_delay(&self.key, None, None).await {
            Ok(countdown) => {
                self.show_progress(countdown);
                Ok(&self.mode)
            }
            Err(e) => {
                if let Some(reload) = self.load().await.err() {
                    tracing::warn!(key = %self.key, error = %reload, "reload after failed start");
                }
                Err(e)
            }
        }
    }

    /// Cancels the countdown, or dismisses the prompt if none is running.
    /// Ticking stops at once; the dialog closes once the engine acknowledges.
    ///
    /// # Errors
    ///
    /// Returns the engine error; the dialog then shows the engine's state.
    pub async fn cancel(&mut self) -> Result<(), GuardError> {
        if !matches!(self.mode, DialogMode::Delaying(_)) {
            self.teardown();
            return Ok(());
        }

        self.stop_ticking();
        self.confirm_enabled = false;
        match self.coordinator.cancel_delay(&self.key).await {
            Ok(()) => {
                self.mode = DialogMode::Confirming;
                self.teardown();
                Ok(())
            }
            Err(e) => {
                if let Some(reload) = self.load().await.err() {
                    tracing::warn!(key = %self.key, error = %reload, "reload after failed cancel");
                }
                Err(e)
            }
        }
    }

    /// Waits for the next tick and applies it. Returns `None` when no
    /// countdown is being shown.
    ///
    /// Once the deadline passes the engine is re-polled; the dialog only
    /// shows [`DialogMode::Finished`] if the change actually took effect.
    pub async fn next_tick(&mut self) -> Option<&DialogMode> {
        let event = self.ticking.as_mut()?.events.recv().await;
        match event {
            Some(ProgressEvent::Tick(view)) => self.mode = DialogMode::Delaying(view),
            Some(ProgressEvent::Finished) | None => {
                self.stop_ticking();
                if let Err(e) = self.refresh().await {
                    tracing::warn!(key = %self.key, error = %e, "could not confirm the outcome");
                    self.teardown();
                }
            }
        }
        Some(&self.mode)
    }

    /// Reacts to a bus message.
    ///
    /// # Errors
    ///
    /// Returns the read error from re-polling the engine.
    pub async fn handle(&mut self, message: &BusMessage) -> Result<(), GuardError> {
        match message {
            BusMessage::ConfirmDialogKeyUpdated { key } => {
                tracing::info!(from = %self.key, to = %key, "dialog re-targeted");
                self.stop_ticking();
                self.key = key.clone();
                self.close_requested = false;
                self.load().await?;
            }
            BusMessage::TimerUpdated => {
                self.refresh().await?;
            }
            BusMessage::PreferencesUpdated | BusMessage::ConfirmDialogCloseRequested => {
                self.teardown();
            }
            _ => {}
        }
        Ok(())
    }

    /// Stops ticking and asks to close.
    pub fn teardown(&mut self) {
        self.stop_ticking();
        self.close_requested = true;
    }

    fn show_progress(&mut self, countdown: Countdown) {
        self.stop_ticking();
        self.mode = DialogMode::Delaying(countdown.view(self.clock.now()));
        self.confirm_enabled = false;
        let (handle, events) = ProgressTicker::spawn(countdown, self.clock.clone());
        self.ticking = Some(Ticking { handle, events });
    }

    fn finish(&mut self) {
        self.stop_ticking();
        self.mode = DialogMode::Finished;
        self.confirm_enabled = false;
        self.close_requested = true;
    }

    fn stop_ticking(&mut self) {
        if let Some(ticking) = self.ticking.take() {
            ticking.handle.cancel();
        }
    }
}
