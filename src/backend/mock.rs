//! In-process engine for tests.
//!
//! Runs the real [`CountdownEngine`] behind the [`EngineBackend`] trait with
//! injectable latency, per-command failures and call counting.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;

use super::EngineBackend;
use crate::bus::{BusMessage, EventBus};
use crate::clock::Clock;
use crate::daemon::engine::CountdownEngine;
use crate::error::GuardError;
use crate::types::{
    BlockData, ChangeStatus, InstalledApp, ItemKind, SettingKey, DEFAULT_DELAY_TIMEOUT_MS,
};

/// Mock engine for testing.
#[derive(Debug)]
pub struct MockEngineBackend {
    engine: Mutex<CountdownEngine>,
    bus: Option<EventBus>,
    installed_apps: Mutex<Vec<InstalledApp>>,
    latency: Mutex<Duration>,
    calls: Mutex<HashMap<String, u32>>,
    failing: Mutex<HashSet<String>>,
    close_app_result: AtomicBool,
    closed_apps: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockEngineBackend {
    /// Creates a mock with the default delay and no bus.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            engine: Mutex::new(CountdownEngine::in_memory(DEFAULT_DELAY_TIMEOUT_MS, clock)),
            bus: None,
            installed_apps: Mutex::new(vec![
                InstalledApp::new("firefox", "Firefox"),
                InstalledApp::new("steam", "Steam"),
                InstalledApp::new("discord", "Discord"),
            ]),
            latency: Mutex::new(Duration::ZERO),
            calls: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            close_app_result: AtomicBool::new(true),
            closed_apps: Mutex::new(Vec::new()),
        }
    }

    /// Publishes engine events on `bus`.
    #[must_use]
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replaces the installed apps reported.
    pub fn set_installed_apps(&self, apps: Vec<InstalledApp>) {
        *lock(&self.installed_apps) = apps;
    }

    /// Delays every command by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Makes `method` fail (reads with a fetch error, commands with a command
    /// error).
    pub fn set_should_fail(&self, method: &str, fail: bool) {
        let mut failing = lock(&self.failing);
        if fail {
            failing.insert(method.to_string());
        } else {
            failing.remove(method);
        }
    }

    /// Result reported by `close_app`.
    pub fn set_close_app_result(&self, killed: bool) {
        self.close_app_result.store(killed, Ordering::SeqCst);
    }

    /// Number of times `method` was invoked.
    pub fn call_count(&self, method: &str) -> u32 {
        lock(&self.calls).get(method).copied().unwrap_or(0)
    }

    /// Processes passed to `close_app`.
    pub fn closed_apps(&self) -> Vec<String> {
        lock(&self.closed_apps).clone()
    }

    /// Stored preference, bypassing counters; `None` if unset.
    pub fn preference(&self, key: &str) -> Option<Value> {
        let value = lock(&self.engine).preference(key);
        (!value.is_null()).then_some(value)
    }

    /// Stored block data, bypassing counters.
    pub fn block_data(&self) -> BlockData {
        lock(&self.engine).block_data().clone()
    }

    /// Seeds the block data.
    pub fn seed_block_data(&self, data: BlockData) {
        if let Err(e) = lock(&self.engine).set_block_data(data) {
            tracing::warn!(error = %e, "mock seed failed");
        }
    }

    /// Seeds a preference.
    pub fn seed_preference(&self, key: &str, value: Value) {
        if let Err(e) = lock(&self.engine).save_preference(key, value) {
            tracing::warn!(error = %e, "mock seed failed");
        }
    }

    /// Number of running countdowns, after committing expired ones.
    pub fn active_countdowns(&self) -> usize {
        let mut engine = lock(&self.engine);
        let events = engine.expire_due();
        let count = engine.active_keys().len();
        drop(engine);
        self.publish(events);
        count
    }

    async fn enter(&self, method: &'static str, is_read: bool) -> Result<(), GuardError> {
        *lock(&self.calls).entry(method.to_string()).or_insert(0) += 1;

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if lock(&self.failing).contains(method) {
            return Err(if is_read {
                GuardError::fetch(method, "mock failure")
            } else {
                GuardError::command(method, "mock failure")
            });
        }
        Ok(())
    }

    fn with_engine<T>(
        &self,
        op: impl FnOnce(&mut CountdownEngine) -> Result<(T, Vec<BusMessage>), GuardError>,
    ) -> Result<T, GuardError> {
        let (value, events) = {
            let mut engine = lock(&self.engine);
            let mut events = engine.expire_due();
            let result = op(&mut engine);
            match result {
                Ok((value, more)) => {
                    events.extend(more);
                    (Ok(value), events)
                }
                Err(e) => (Err(e), events),
            }
        };
        self.publish(events);
        value
    }

    fn publish(&self, events: Vec<BusMessage>) {
        if let Some(bus) = &self.bus {
            for event in events {
                bus.publish(event);
            }
        }
    }
}

impl EngineBackend for MockEngineBackend {
    async fn read_block_data(&self) -> Result<BlockData, GuardError> {
        self.enter("read_block_data", true).await?;
        self.with_engine(|e| Ok((e.block_data().clone(), Vec::new())))
    }

    async fn write_block_data(&self, data: &BlockData) -> Result<(), GuardError> {
        self.enter("write_block_data", false).await?;
        let data = data.clone();
        self.with_engine(|e| Ok(((), e.set_block_data(data)?)))
    }

    async fn list_installed_apps(&self) -> Result<Vec<InstalledApp>, GuardError> {
        self.enter("list_installed_apps", true).await?;
        Ok(lock(&self.installed_apps).clone())
    }

    async fn get_change_status(&self, key: &SettingKey) -> Result<ChangeStatus, GuardError> {
        self.enter("get_change_status", true).await?;
        self.with_engine(|e| Ok((e.status(key), Vec::new())))
    }

    async fn start_countdown(
        &self,
        key: &SettingKey,
        remaining_ms: Option<u64>,
        target: Option<u64>,
    ) -> Result<(), GuardError> {
        self.enter("start_countdown", false).await?;
        self.with_engine(|e| Ok(((), e.start(key.clone(), remaining_ms, target)?)))
    }

    async fn cancel_countdown(&self, key: &SettingKey) -> Result<(), GuardError> {
        self.enter("cancel_countdown", false).await?;
        self.with_engine(|e| Ok(((), e.cancel(key)?)))
    }

    async fn prime_for_deletion(&self, kind: ItemKind, name: &str) -> Result<(), GuardError> {
        self.enter("prime_for_deletion", false).await?;
        self.with_engine(|e| Ok(((), e.prime(kind, name)?)))
    }

    async fn read_preference(&self, key: &str) -> Result<Value, GuardError> {
        self.enter("read_preference", true).await?;
        self.with_engine(|e| Ok((e.preference(key), Vec::new())))
    }

    async fn save_preference(&self, key: &str, value: &Value) -> Result<(), GuardError> {
        self.enter("save_preference", false).await?;
        let value = value.clone();
        self.with_engine(|e| Ok(((), e.save_preference(key, value)?)))
    }

    async fn close_confirmation_dialog(&self) -> Result<(), GuardError> {
        self.enter("close_confirmation_dialog", false).await?;
        self.publish(vec![BusMessage::ConfirmDialogCloseRequested]);
        Ok(())
    }

    async fn close_overlay_window(&self) -> Result<(), GuardError> {
        self.enter("close_overlay_window", false).await?;
        self.publish(vec![BusMessage::OverlayCloseRequested]);
        Ok(())
    }

    async fn close_app(&self, process_name: &str) -> Result<bool, GuardError> {
        self.enter("close_app", false).await?;
        lock(&self.closed_apps).push(process_name.to_string());
        Ok(self.close_app_result.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::PROTECTIVE_DNS_KEY;

    fn mock() -> (MockEngineBackend, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (MockEngineBackend::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_counts_calls() {
        let (mock, _clock) = mock();
        mock.read_block_data().await.unwrap();
        mock.read_block_data().await.unwrap();
        assert_eq!(mock.call_count("read_block_data"), 2);
        assert_eq!(mock.call_count("write_block_data"), 0);
    }

    #[tokio::test]
    async fn test_failure_kind_follows_command() {
        let (mock, _clock) = mock();
        mock.set_should_fail("read_preference", true);
        mock.set_should_fail("save_preference", true);

        let read = mock.read_preference("x").await.unwrap_err();
        let write = mock.save_preference("x", &Value::Bool(true)).await.unwrap_err();

        assert!(read.is_transient());
        assert!(write.is_command());
        assert_eq!(mock.preference("x"), None);
    }

    #[tokio::test]
    async fn test_expiry_commits_before_next_command() {
        let (mock, clock) = mock();
        let bus = EventBus::new();
        let mock = mock.with_bus(bus.clone());
        let mut sub = bus.subscribe();
        let key = SettingKey::preference(PROTECTIVE_DNS_KEY);
        mock.seed_preference(PROTECTIVE_DNS_KEY, Value::Bool(true));

        mock.start_countdown(&key, Some(1_000), None).await.unwrap();
        clock.advance(Duration::from_millis(1_000));
        let status = mock.get_change_status(&key).await.unwrap();

        assert!(!status.is_changing);
        assert_eq!(mock.preference(PROTECTIVE_DNS_KEY), Some(Value::Bool(false)));
        assert_eq!(sub.try_recv(), Some(BusMessage::TimerUpdated));
        assert_eq!(sub.try_recv(), Some(BusMessage::PreferencesUpdated));
        assert_eq!(sub.try_recv(), Some(BusMessage::TimerUpdated));
    }

    #[tokio::test]
    async fn test_close_app_records_name() {
        let (mock, _clock) = mock();
        mock.set_close_app_result(false);
        assert!(!mock.close_app("steam").await.unwrap());
        assert_eq!(mock.closed_apps(), vec!["steam".to_string()]);
    }
}
