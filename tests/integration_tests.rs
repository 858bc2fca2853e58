//! Integration tests for window ↔ daemon IPC communication.
//!
//! These tests run the real countdown engine behind the IPC server and talk
//! to it through the CLI client, the shared store and the coordinator:
//! - Countdown start, join, status and cancel over the socket
//! - Protected preference flow end to end
//! - Block list editing and unblock priming
//! - Error kinds surviving the wire
//! - Bus messages forwarded to subscribed windows
//! - Degraded reads when the daemon is down

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::time::Duration;

use eagle_guard::backend::EngineBackend;
use eagle_guard::blocklist::{self, BlockListEditor, BlockListItem, RowAction};
use eagle_guard::bus::{BusMessage, EventBus};
use eagle_guard::cache::SharedStateStore;
use eagle_guard::cli::client::IpcClient;
use eagle_guard::clock::{Clock, SystemClock};
use eagle_guard::config::GuardConfig;
use eagle_guard::coordinator::{ChangeOutcome, DeferredCommitCoordinator, Phase};
use eagle_guard::daemon::engine::{CountdownEngine, LocalEngine};
use eagle_guard::daemon::ipc::{IpcServer, RequestHandler};
use eagle_guard::error::GuardError;
use eagle_guard::types::{ItemKind, SettingKey, DEFAULT_DELAY_TIMEOUT_MS, PROTECTIVE_DNS_KEY};

// ============================================================================
// Test Helpers
// ============================================================================

/// Creates a temporary socket path for testing.
fn create_temp_socket_path() -> PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("integration_test.sock");
    // Keep the directory so it's not deleted
    std::mem::forget(dir);
    path
}

/// A daemon with an in-memory engine listening on a fresh socket.
struct TestDaemon {
    server: IpcServer,
    handler: RequestHandler<LocalEngine>,
    engine: Arc<LocalEngine>,
}

impl TestDaemon {
    fn start() -> Self {
        let socket_path = create_temp_socket_path();
        Self::start_with_apps(&socket_path, Vec::new())
    }

    fn start_with_apps(socket_path: &Path, app_dirs: Vec<PathBuf>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let bus = EventBus::new();
        let engine = Arc::new(
            LocalEngine::new(
                CountdownEngine::in_memory(DEFAULT_DELAY_TIMEOUT_MS, clock),
                bus.clone(),
            )
            .with_app_dirs(app_dirs),
        );
        Self {
            server: IpcServer::new(socket_path).unwrap(),
            handler: RequestHandler::new(engine.clone()).with_events(bus),
            engine,
        }
    }

    fn client(&self) -> IpcClient {
        IpcClient::with_socket_path(self.server.socket_path().to_path_buf())
    }

    /// Serves requests until the test body completes.
    async fn serve(&self) {
        loop {
            if let Ok(stream) = self.server.accept().await {
                let _ = self.handler.serve(stream).await;
            }
        }
    }
}

/// Runs `body` while `daemon` answers requests.
macro_rules! with_daemon {
    ($daemon:expr, $body:expr) => {
        tokio::select! {
            _ = $daemon.serve() => unreachable!("server loop never ends"),
            out = $body => out,
        }
    };
}

fn fast_retry_config() -> GuardConfig {
    GuardConfig {
        retry_attempts: 2,
        retry_base_delay_ms: 1,
        ..GuardConfig::default()
    }
}

fn window(
    client: IpcClient,
) -> (
    Arc<SharedStateStore<IpcClient>>,
    DeferredCommitCoordinator<IpcClient>,
    EventBus,
) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = EventBus::new();
    let store = Arc::new(SharedStateStore::new(
        Arc::new(client),
        &fast_retry_config(),
        clock.clone(),
    ));
    let coordinator = DeferredCommitCoordinator::new(store.clone(), bus.clone(), clock);
    (store, coordinator, bus)
}

// ============================================================================
// Countdown round trips
// ============================================================================

#[tokio::test]
async fn test_start_status_cancel_over_ipc() {
    let daemon = TestDaemon::start();
    let client = daemon.client();
    let key = SettingKey::preference(PROTECTIVE_DNS_KEY);

    with_daemon!(daemon, async {
        client.start_countdown(&key, Some(60_000), None).await.unwrap();

        let status = client.get_change_status(&key).await.unwrap();
        assert!(status.is_changing);
        assert!(status.time_remaining <= 60_000);
        assert!(status.time_remaining > 55_000);

        client.cancel_countdown(&key).await.unwrap();
        let status = client.get_change_status(&key).await.unwrap();
        assert!(!status.is_changing);
    });

    assert!(daemon.engine.active_keys().await.is_empty());
}

#[tokio::test]
async fn test_second_start_joins_running_countdown() {
    let daemon = TestDaemon::start();
    let client = daemon.client();
    let key = SettingKey::unblock(ItemKind::App, "steam");

    with_daemon!(daemon, async {
        client.start_countdown(&key, Some(60_000), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.start_countdown(&key, Some(600_000), None).await.unwrap();

        let status = client.get_change_status(&key).await.unwrap();
        assert!(status.time_remaining <= 60_000);
    });
}

#[tokio::test]
async fn test_cancel_without_countdown_is_not_delaying() {
    let daemon = TestDaemon::start();
    let client = daemon.client();

    let err = with_daemon!(daemon, async {
        client
            .cancel_countdown(&SettingKey::DelayTimeout)
            .await
            .unwrap_err()
    });

    assert!(matches!(err, GuardError::NotDelaying(_)));
}

// ============================================================================
// Coordinator over IPC
// ============================================================================

#[tokio::test]
async fn test_protected_preference_flow() {
    let daemon = TestDaemon::start();
    let (store, coordinator, _bus) = window(daemon.client());
    let key = SettingKey::preference(PROTECTIVE_DNS_KEY);

    with_daemon!(daemon, async {
        store
            .save_preference(PROTECTIVE_DNS_KEY, Value::Bool(true))
            .await
            .unwrap();

        let outcome = coordinator
            .request_change(&key, Value::Bool(false))
            .await
            .unwrap();
        assert_eq!(outcome, ChangeOutcome::ConfirmationRequired);

        let countdown = coordinator.start_delay(&key, None, None).await.unwrap();
        assert_eq!(
            countdown.total(),
            Duration::from_millis(DEFAULT_DELAY_TIMEOUT_MS)
        );
        assert!(coordinator.phase(&key).is_delaying());

        coordinator.cancel_delay(&key).await.unwrap();
        assert_eq!(coordinator.phase(&key), Phase::Idle);
    });

    // Cancelling discards the change
    assert_eq!(
        daemon.engine.read_preference(PROTECTIVE_DNS_KEY).await.unwrap(),
        Value::Bool(true)
    );
}

#[tokio::test]
async fn test_weak_preference_applies_immediately() {
    let daemon = TestDaemon::start();
    let (_store, coordinator, bus) = window(daemon.client());
    let mut events = bus.subscribe();

    let outcome = with_daemon!(daemon, async {
        coordinator
            .request_change(&SettingKey::preference("enforceSafeSearch"), Value::Bool(true))
            .await
            .unwrap()
    });

    assert_eq!(outcome, ChangeOutcome::Applied);
    assert_eq!(
        events.try_recv().map(|m| m.name()),
        Some("preferences-updated")
    );
    assert_eq!(
        daemon.engine.read_preference("enforceSafeSearch").await.unwrap(),
        Value::Bool(true)
    );
}

// ============================================================================
// Block lists over IPC
// ============================================================================

#[tokio::test]
async fn test_block_and_prime_website() {
    let daemon = TestDaemon::start();
    let (store, _coordinator, bus) = window(daemon.client());
    let editor = BlockListEditor::new(store.clone(), bus);

    let rows = with_daemon!(daemon, async {
        let (hostname, added) = editor.add_website("https://www.Example.com/x").await.unwrap();
        assert_eq!(hostname, "example.com");
        assert!(added);

        editor
            .prime(&BlockListItem::Website { hostname })
            .await
            .unwrap();

        blocklist::rows(&store, ItemKind::Website).await
    });

    assert_eq!(rows.len(), 1);
    assert!(matches!(rows[0].action, RowAction::Delaying { .. }));
}

#[tokio::test]
async fn test_validation_error_survives_wire() {
    let daemon = TestDaemon::start();
    let client = daemon.client();

    let err = with_daemon!(daemon, async {
        client
            .prime_for_deletion(ItemKind::Website, "not a url")
            .await
            .unwrap_err()
    });

    assert!(err.is_validation());
    assert!(daemon.engine.active_keys().await.is_empty());
}

#[tokio::test]
async fn test_installed_apps_from_desktop_entries() {
    let apps_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        apps_dir.path().join("steam.desktop"),
        "[Desktop Entry]\nType=Application\nName=Steam\nExec=/usr/bin/steam %U\n",
    )
    .unwrap();

    let socket_path = create_temp_socket_path();
    let daemon = TestDaemon::start_with_apps(&socket_path, vec![apps_dir.path().to_path_buf()]);
    let (store, _coordinator, _bus) = window(daemon.client());

    let apps = with_daemon!(daemon, store.installed_apps());

    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].process_name, "steam");
    assert_eq!(apps[0].display_name, "Steam");
}

// ============================================================================
// Events over IPC
// ============================================================================

#[tokio::test]
async fn test_cancel_in_one_window_reaches_another() {
    let daemon = TestDaemon::start();
    let (store, watcher, _bus) = window(daemon.client());
    let (_other_store, canceller, _other_bus) = window(daemon.client());
    let key = SettingKey::preference(PROTECTIVE_DNS_KEY);

    let (received, phase) = with_daemon!(daemon, async {
        store
            .save_preference(PROTECTIVE_DNS_KEY, Value::Bool(true))
            .await
            .unwrap();
        let mut events = daemon.client().subscribe().await.unwrap();

        watcher.start_delay(&key, None, None).await.unwrap();
        canceller.cancel_delay(&key).await.unwrap();

        let received = vec![events.next().await, events.next().await];
        (received, watcher.resume(&key).await.unwrap())
    });

    assert_eq!(received, vec![Some(BusMessage::TimerUpdated); 2]);
    assert_eq!(phase, Phase::Idle);
    assert_eq!(
        daemon.engine.read_preference(PROTECTIVE_DNS_KEY).await.unwrap(),
        Value::Bool(true)
    );
}

// ============================================================================
// Daemon down
// ============================================================================

#[tokio::test]
async fn test_reads_degrade_when_daemon_is_down() {
    let client = IpcClient::with_socket_path(PathBuf::from(
        "/tmp/nonexistent_eagle_guard_integration.sock",
    ));
    let (store, coordinator, _bus) = window(client);

    assert!(store.block_data().await.blocked_websites.is_empty());
    assert!(store.installed_apps().await.is_empty());

    // Protection checks fail closed
    let err = coordinator
        .request_change(
            &SettingKey::preference(PROTECTIVE_DNS_KEY),
            Value::Bool(false),
        )
        .await
        .unwrap_err();
    assert!(err.is_transient());
}
