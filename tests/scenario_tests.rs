//! Scenario tests for the coordination layer.
//!
//! Each test wires a window the way a process does at start-up (store,
//! coordinator, bus, registry) against the in-process mock engine, and runs
//! a complete user flow on tokio's paused clock.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::{advance, Duration};

use eagle_guard::backend::{EngineBackend, MockEngineBackend};
use eagle_guard::blocklist::{self, BlockListEditor, BlockListItem, RowAction};
use eagle_guard::bus::{dispatch, EventBus};
use eagle_guard::cache::SharedStateStore;
use eagle_guard::clock::{Clock, SystemClock};
use eagle_guard::config::GuardConfig;
use eagle_guard::coordinator::{
    ChangeOutcome, DeferredCommitCoordinator, DelaySelection, DnsStrictness, Phase,
};
use eagle_guard::types::{
    BlockData, InstalledApp, ItemKind, SettingKey, DELAY_TIMEOUT_KEY, PROTECTIVE_DNS_KEY,
};
use eagle_guard::window::{
    ConfirmDialog, DialogMode, MockWindowHost, WindowRegistry, WindowRole,
};

// ============================================================================
// Test Helpers
// ============================================================================

struct Window {
    clock: Arc<dyn Clock>,
    bus: EventBus,
    backend: Arc<MockEngineBackend>,
    store: Arc<SharedStateStore<MockEngineBackend>>,
    coordinator: Arc<DeferredCommitCoordinator<MockEngineBackend>>,
}

fn window() -> Window {
    window_over(Arc::new(MockEngineBackend::new(Arc::new(SystemClock))))
}

/// A window with its own store and bus over `backend`.
fn window_over(backend: Arc<MockEngineBackend>) -> Window {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = EventBus::new();
    let store = Arc::new(SharedStateStore::new(
        backend.clone(),
        &GuardConfig::default(),
        clock.clone(),
    ));
    let coordinator = Arc::new(DeferredCommitCoordinator::new(
        store.clone(),
        bus.clone(),
        clock.clone(),
    ));
    Window {
        clock,
        bus,
        backend,
        store,
        coordinator,
    }
}

fn dns() -> SettingKey {
    SettingKey::preference(PROTECTIVE_DNS_KEY)
}

// ============================================================================
// Protected switch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_disabling_protective_dns_waits_for_the_delay() {
    let w = window();
    w.backend.seed_preference(PROTECTIVE_DNS_KEY, Value::Bool(true));

    let outcome = w.coordinator.request_change(&dns(), Value::Bool(false)).await.unwrap();
    assert_eq!(outcome, ChangeOutcome::ConfirmationRequired);

    let countdown = w.coordinator.start_delay(&dns(), None, None).await.unwrap();
    let view = countdown.view(w.clock.now());
    assert_eq!(view.time_text, "180s");
    assert_eq!(view.percent, 0);

    advance(Duration::from_secs(90)).await;
    let view = countdown.view(w.clock.now());
    assert_eq!(view.time_text, "90s");
    assert_eq!(view.percent_text, "50%");

    // Still protected half way through
    assert_eq!(w.backend.preference(PROTECTIVE_DNS_KEY), Some(Value::Bool(true)));

    advance(Duration::from_millis(90_001)).await;
    let view = countdown.view(w.clock.now());
    assert_eq!(view.time_text, "0s");
    assert_eq!(view.percent, 100);

    let status = w.backend.get_change_status(&dns()).await.unwrap();
    assert!(!status.is_changing);
    assert_eq!(w.backend.preference(PROTECTIVE_DNS_KEY), Some(Value::Bool(false)));
}

#[tokio::test(start_paused = true)]
async fn test_enabling_protective_dns_asks_for_strictness() {
    let w = window();

    let outcome = w.coordinator.request_change(&dns(), Value::Bool(true)).await.unwrap();
    assert_eq!(outcome, ChangeOutcome::StrictnessChoiceRequired);
    assert_eq!(w.backend.preference(PROTECTIVE_DNS_KEY), None);

    w.coordinator
        .enable_protective_dns(DnsStrictness::Strict)
        .await
        .unwrap();
    assert_eq!(w.backend.preference(PROTECTIVE_DNS_KEY), Some(Value::Bool(true)));
    assert_eq!(w.backend.preference("dnsStrictness"), Some(Value::from("strict")));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_confirms_share_one_start() {
    let w = window();
    w.backend.set_latency(Duration::from_millis(50));
    w.backend.seed_preference(PROTECTIVE_DNS_KEY, Value::Bool(true));

    let key = dns();
    let (a, b) = tokio::join!(
        w.coordinator.start_delay(&key, None, None),
        w.coordinator.start_delay(&key, None, None),
    );

    assert_eq!(a.unwrap().deadline(), b.unwrap().deadline());
    assert_eq!(w.backend.call_count("start_countdown"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_in_another_window_is_not_reported_as_committed() {
    let a = window();
    let b = window_over(a.backend.clone());
    a.backend.seed_preference(PROTECTIVE_DNS_KEY, Value::Bool(true));

    let mut watching = ConfirmDialog::new(dns(), a.coordinator.clone(), a.clock.clone());
    watching.confirm().await.unwrap();
    advance(Duration::from_secs(60)).await;

    b.coordinator.cancel_delay(&dns()).await.unwrap();

    // Window A never hears about the cancel and ticks out to the deadline.
    let mut saw_finished = false;
    while let Some(mode) = watching.next_tick().await {
        saw_finished |= *mode == DialogMode::Finished;
    }

    assert!(!saw_finished);
    assert_eq!(watching.mode(), &DialogMode::Cancelled);
    assert_eq!(a.coordinator.phase(&dns()), Phase::Idle);
    assert_eq!(a.backend.preference(PROTECTIVE_DNS_KEY), Some(Value::Bool(true)));
}

// ============================================================================
// Delay timeout
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_shortening_the_delay_commits_the_target() {
    let w = window();

    let outcome = w
        .coordinator
        .change_delay_timeout(DelaySelection::Millis(60_000))
        .await
        .unwrap();
    assert_eq!(outcome, ChangeOutcome::ConfirmationRequired);

    let countdown = w
        .coordinator
        .start_delay(&SettingKey::DelayTimeout, None, None)
        .await
        .unwrap();
    assert_eq!(countdown.total(), Duration::from_secs(180));

    advance(Duration::from_millis(180_001)).await;
    w.backend
        .get_change_status(&SettingKey::DelayTimeout)
        .await
        .unwrap();
    assert_eq!(w.backend.preference(DELAY_TIMEOUT_KEY), Some(Value::from(60_000u64)));
}

#[tokio::test(start_paused = true)]
async fn test_lengthening_the_delay_applies_at_once() {
    let w = window();

    let outcome = w
        .coordinator
        .change_delay_timeout(DelaySelection::Days(1.0))
        .await
        .unwrap();

    assert_eq!(outcome, ChangeOutcome::Applied);
    assert_eq!(
        w.backend.preference(DELAY_TIMEOUT_KEY),
        Some(Value::from(86_400_000u64))
    );
    assert_eq!(w.backend.call_count("start_countdown"), 0);
}

// ============================================================================
// Windows
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_confirmation_request_opens_dialog_window() {
    let w = window();
    let registry = WindowRegistry::new(MockWindowHost::new());
    let mut events = w.bus.subscribe();
    w.backend.seed_preference(PROTECTIVE_DNS_KEY, Value::Bool(true));

    w.coordinator.request_change(&dns(), Value::Bool(false)).await.unwrap();
    while let Some(message) = events.try_recv() {
        dispatch(&registry, &message);
    }

    assert!(registry.is_open(WindowRole::ConfirmDialog));
    let created = registry.host().created();
    assert_eq!(created.len(), 1);
    assert!(created[0].url.contains("enableProtectiveDNS"));

    // A preference change elsewhere closes it
    w.coordinator
        .enable_protective_dns(DnsStrictness::Lenient)
        .await
        .unwrap();
    while let Some(message) = events.try_recv() {
        dispatch(&registry, &message);
    }
    assert!(!registry.is_open(WindowRole::ConfirmDialog));
}

// ============================================================================
// Store
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_installed_apps_reads_coalesce() {
    let w = window();
    w.backend.set_latency(Duration::from_millis(100));

    let (a, b, c) = tokio::join!(
        w.store.installed_apps(),
        w.store.installed_apps(),
        w.store.installed_apps(),
    );

    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(w.backend.call_count("list_installed_apps"), 1);

    // Served from cache until the TTL passes
    w.store.installed_apps().await;
    assert_eq!(w.backend.call_count("list_installed_apps"), 1);
}

// ============================================================================
// Unblocking
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unblocking_an_app_after_its_delay() {
    let w = window();
    let editor = BlockListEditor::new(w.store.clone(), w.bus.clone());
    w.backend.seed_block_data(BlockData {
        blocked_apps: vec![InstalledApp::new("steam", "Steam")],
        ..BlockData::default()
    });

    let steam = BlockListItem::App {
        process_name: "Steam".into(),
        display_name: "Steam".into(),
    };
    assert!(editor.remove(&steam).await.unwrap_err().is_validation());

    editor.prime(&steam).await.unwrap();
    let rows = blocklist::rows(&w.store, ItemKind::App).await;
    assert!(matches!(rows[0].action, RowAction::Delaying { .. }));

    advance(Duration::from_millis(180_001)).await;
    w.store.invalidate_block_data();
    w.store.invalidate_statuses();
    let rows = blocklist::rows(&w.store, ItemKind::App).await;
    assert_eq!(rows[0].action, RowAction::Delete);

    editor.remove(&steam).await.unwrap();
    let data = w.backend.block_data();
    assert!(data.blocked_apps.is_empty());
    assert!(data.allowed_for_unblock_apps.is_empty());
}
