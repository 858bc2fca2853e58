//! Client-side wiring for one CLI invocation.
//!
//! A CLI process is a window like any other: it builds its own store,
//! coordinator and bus once, talks to the daemon through [`IpcClient`], and
//! drops everything on exit. While following a delay it subscribes to the
//! daemon's bus and relays every message into its own.

use std::path::PathBuf;
use std::sync::Arc;

use crate::blocklist::BlockListEditor;
use crate::bus::{dispatch, BusMessage, EventBus};
use crate::cache::SharedStateStore;
use crate::cli::{Display, EventStream, IpcClient};
use crate::clock::{Clock, SystemClock};
use crate::config::GuardConfig;
use crate::coordinator::DeferredCommitCoordinator;
use crate::error::GuardError;
use crate::types::SettingKey;
use crate::window::{ConfirmDialog, DialogMode};

/// Everything a command needs to talk to the daemon.
pub struct Session {
    clock: Arc<dyn Clock>,
    bus: EventBus,
    store: Arc<SharedStateStore<IpcClient>>,
    coordinator: Arc<DeferredCommitCoordinator<IpcClient>>,
}

impl Session {
    /// Builds the session for `socket_path`.
    pub fn connect(config: &GuardConfig, socket_path: PathBuf) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let bus = EventBus::new();
        let client = Arc::new(IpcClient::with_socket_path(socket_path));
        let store = Arc::new(SharedStateStore::new(client, config, clock.clone()));
        let coordinator = Arc::new(DeferredCommitCoordinator::new(
            store.clone(),
            bus.clone(),
            clock.clone(),
        ));
        Self {
            clock,
            bus,
            store,
            coordinator,
        }
    }

    pub fn store(&self) -> &SharedStateStore<IpcClient> {
        &self.store
    }

    pub fn coordinator(&self) -> &DeferredCommitCoordinator<IpcClient> {
        &self.coordinator
    }

    pub fn editor(&self) -> BlockListEditor<IpcClient> {
        BlockListEditor::new(self.store.clone(), self.bus.clone())
    }

    fn dialog(&self, key: SettingKey) -> ConfirmDialog<IpcClient> {
        ConfirmDialog::new(key, self.coordinator.clone(), self.clock.clone())
    }

    /// Starts (or joins) the delay for `key` and follows it.
    ///
    /// # Errors
    ///
    /// Returns the engine error if the delay could not be started.
    pub async fn confirm(&self, key: SettingKey) -> Result<(), GuardError> {
        let mut dialog = self.dialog(key);
        if let Some(e) = dialog.load().await.err() {
            tracing::warn!(error = %e, "could not read countdown state");
        }
        dialog.confirm().await?;
        self.follow(&mut dialog).await;
        Ok(())
    }

    /// Follows the delay running for `key`. Returns false if none is.
    ///
    /// # Errors
    ///
    /// Returns the read error.
    pub async fn watch(&self, key: SettingKey) -> Result<bool, GuardError> {
        let mut dialog = self.dialog(key);
        if !matches!(dialog.load().await?, DialogMode::Delaying(_)) {
            return Ok(false);
        }
        self.follow(&mut dialog).await;
        Ok(true)
    }

    /// Renders ticks until the countdown ends or Ctrl-C. Interrupting only
    /// stops watching; the countdown keeps running in the daemon.
    async fn follow(&self, dialog: &mut ConfirmDialog<IpcClient>) {
        if let DialogMode::Delaying(view) = dialog.mode() {
            Display::show_progress(view);
        }
        let mut remote = self.remote_events().await;

        let interrupted = loop {
            tokio::select! {
                mode = async { dialog.next_tick().await.cloned() } => match mode {
                    Some(DialogMode::Delaying(view)) => Display::show_progress(&view),
                    _ => break false,
                },
                message = next_remote(&mut remote) => {
                    self.relay(dialog, message).await;
                    if dialog.should_close() {
                        break false;
                    }
                }
                _ = tokio::signal::ctrl_c() => break true,
            }
        };

        if interrupted {
            dialog.teardown();
            println!();
            println!("Stopped watching; the delay keeps running");
            return;
        }
        match dialog.mode() {
            DialogMode::Finished => Display::show_finished(dialog.key()),
            DialogMode::Cancelled => Display::show_cancelled_elsewhere(dialog.key()),
            DialogMode::Delaying(_) => Display::show_unfollowed(dialog.key()),
            DialogMode::Confirming => {}
        }
    }

    async fn remote_events(&self) -> Option<EventStream> {
        match self.store.backend().subscribe().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(error = %e, "live updates unavailable");
                None
            }
        }
    }

    /// Applies a message from the daemon to this process.
    async fn relay(&self, dialog: &mut ConfirmDialog<IpcClient>, message: BusMessage) {
        tracing::debug!(event = message.name(), "daemon event");
        dispatch(&*self.store, &message);
        self.bus.publish(message.clone());
        let applied = match message {
            // Re-poll instead of closing so a commit is still reported.
            BusMessage::PreferencesUpdated => dialog.refresh().await.map(drop),
            other => dialog.handle(&other).await,
        };
        if let Err(e) = applied {
            tracing::warn!(error = %e, "could not apply daemon event");
        }
    }
}

/// Next message from the daemon. Pends forever without a stream, or once
/// the stream has ended.
async fn next_remote(remote: &mut Option<EventStream>) -> BusMessage {
    let message = match remote.as_mut() {
        Some(stream) => stream.next().await,
        None => None,
    };
    match message {
        Some(message) => message,
        None => {
            if remote.take().is_some() {
                tracing::warn!("daemon event stream closed");
            }
            std::future::pending().await
        }
    }
}
