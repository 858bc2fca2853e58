//! Countdown engine for the guard daemon.
//!
//! This module provides the authoritative side of every deferred commit:
//! - Per-key countdowns with absolute deadlines (start joins, cancel removes)
//! - Commit on expiry (delay timeout, unblock lists, protection switches)
//! - JSON persistence with corrupted-file backup
//! - Reactivation of persisted countdowns on start-up
//! - Installed app discovery and process termination
//! - `LocalEngine`: the engine behind the [`EngineBackend`] trait

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::backend::EngineBackend;
use crate::blocklist::{app_identity, normalize_hostname};
use crate::bus::{BusMessage, EventBus};
use crate::clock::Clock;
use crate::error::GuardError;
use crate::types::{
    BlockData, ChangeStatus, InstalledApp, ItemKind, SettingKey, DELAY_TIMEOUT_KEY,
};

// ============================================================================
// Constants
// ============================================================================

/// Preferences document (values plus persisted countdowns).
pub const PREFERENCES_FILE: &str = "savedPreferences.json";

/// Block list document.
pub const BLOCK_DATA_FILE: &str = "blockData.json";

/// Reserved preference key holding persisted countdowns.
const TIMER_INFO_KEY: &str = "timerInfo";

// ============================================================================
// Persisted documents
// ============================================================================

/// A persisted countdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerInfo {
    /// Wall-clock start in ms since the epoch
    pub start_time_stamp: u64,
    /// Countdown length in ms
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Value committed on expiry
    #[serde(default)]
    pub target_timeout: Option<u64>,
    /// Delay configured when the countdown started
    #[serde(default)]
    pub delay_time_out_at_time_of_change: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferencesDocument {
    #[serde(default)]
    timer_info: BTreeMap<String, TimerInfo>,
    #[serde(flatten)]
    values: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
struct ActiveTimer {
    deadline: Instant,
    info: TimerInfo,
}

// ============================================================================
// CountdownEngine
// ============================================================================

/// Owns countdowns, preferences and block data.
///
/// Mutating methods return the bus messages the change implies; callers
/// publish them.
#[derive(Debug)]
pub struct CountdownEngine {
    clock: Arc<dyn Clock>,
    data_dir: Option<PathBuf>,
    default_delay_ms: u64,
    preferences: PreferencesDocument,
    block_data: BlockData,
    timers: HashMap<SettingKey, ActiveTimer>,
}

impl CountdownEngine {
    /// Creates an engine that keeps everything in memory.
    pub fn in_memory(default_delay_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            data_dir: None,
            default_delay_ms,
            preferences: PreferencesDocument::default(),
            block_data: BlockData::default(),
            timers: HashMap::new(),
        }
    }

    /// Opens the engine on `data_dir`, reactivating persisted countdowns.
    /// Countdowns that expired while nothing was running commit right away;
    /// the messages for those commits are returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be created or written.
    pub fn open(
        data_dir: &Path,
        default_delay_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, Vec<BusMessage>), GuardError> {
        std::fs::create_dir_all(data_dir)?;

        let preferences: PreferencesDocument =
            load_document(&data_dir.join(PREFERENCES_FILE), clock.wall_millis());
        let block_data: BlockData =
            load_document(&data_dir.join(BLOCK_DATA_FILE), clock.wall_millis());

        let mut engine = Self {
            clock,
            data_dir: Some(data_dir.to_path_buf()),
            default_delay_ms,
            preferences,
            block_data,
            timers: HashMap::new(),
        };
        let events = engine.reactivate();
        engine.persist()?;
        Ok((engine, events))
    }

    fn reactivate(&mut self) -> Vec<BusMessage> {
        let now = self.clock.now();
        let wall_now = self.clock.wall_millis();
        let current = self.current_timeout();
        let mut events = Vec::new();

        let persisted = std::mem::take(&mut self.preferences.timer_info);
        for (raw_key, info) in persisted {
            let key = match raw_key.parse::<SettingKey>() {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(key = %raw_key, error = %e, "dropping unparsable countdown");
                    continue;
                }
            };

            let duration = info
                .duration_ms
                .or(info.delay_time_out_at_time_of_change)
                .unwrap_or(current);
            if info.start_time_stamp == 0 || duration == 0 {
                tracing::warn!(%key, "dropping malformed countdown");
                continue;
            }

            let elapsed = wall_now.saturating_sub(info.start_time_stamp);
            if elapsed >= duration {
                tracing::info!(%key, "countdown expired while stopped, committing");
                events.extend(self.apply_commit(&key, info.target_timeout));
                continue;
            }

            let remaining = duration - elapsed;
            tracing::info!(%key, remaining_ms = remaining, "reactivating countdown");
            self.preferences.timer_info.insert(raw_key, info.clone());
            self.timers.insert(
                key,
                ActiveTimer {
                    deadline: now + Duration::from_millis(remaining),
                    info,
                },
            );
        }

        events
    }

    /// Delay currently configured, in ms.
    pub fn current_timeout(&self) -> u64 {
        self.preferences
            .values
            .get(DELAY_TIMEOUT_KEY)
            .and_then(Value::as_u64)
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_delay_ms)
    }

    /// Countdown status of `key`. A countdown whose deadline passed reads as
    /// finished even before [`expire_due`](Self::expire_due) commits it.
    pub fn status(&self, key: &SettingKey) -> ChangeStatus {
        let current = Some(self.current_timeout());
        let Some(timer) = self.timers.get(key) else {
            return ChangeStatus::idle(current);
        };

        let remaining = timer.deadline.saturating_duration_since(self.clock.now());
        if remaining.is_zero() {
            return ChangeStatus::idle(current);
        }

        ChangeStatus {
            is_changing: true,
            time_remaining: remaining.as_millis() as u64,
            delay_time_out_at_time_of_change: timer.info.delay_time_out_at_time_of_change,
            current_timeout: current,
            new_value: timer.info.target_timeout,
        }
    }

    /// Keys with a running countdown.
    pub fn active_keys(&self) -> Vec<SettingKey> {
        let now = self.clock.now();
        let mut keys: Vec<(Instant, SettingKey)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline > now)
            .map(|(k, t)| (t.deadline, k.clone()))
            .collect();
        keys.sort_by_key(|(deadline, _)| *deadline);
        keys.into_iter().map(|(_, k)| k).collect()
    }

    /// Starts a countdown. If one is already running for `key` this is a
    /// join: nothing changes and no messages are returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the countdown could not be persisted; no
    /// countdown is left running in that case.
    pub fn start(
        &mut self,
        key: SettingKey,
        remaining_ms: Option<u64>,
        target: Option<u64>,
    ) -> Result<Vec<BusMessage>, GuardError> {
        if self.status(&key).is_changing {
            tracing::info!(%key, "countdown already running, joining");
            return Ok(Vec::new());
        }

        let current = self.current_timeout();
        let duration = remaining_ms.unwrap_or(current);
        let info = TimerInfo {
            start_time_stamp: self.clock.wall_millis(),
            duration_ms: Some(duration),
            target_timeout: target,
            delay_time_out_at_time_of_change: Some(current),
        };

        self.preferences
            .timer_info
            .insert(key.to_string(), info.clone());
        self.timers.insert(
            key.clone(),
            ActiveTimer {
                deadline: self.clock.now() + Duration::from_millis(duration),
                info,
            },
        );

        if let Err(e) = self.persist() {
            self.preferences.timer_info.remove(&key.to_string());
            self.timers.remove(&key);
            return Err(e);
        }

        tracing::info!(%key, duration_ms = duration, ?target, "countdown started");
        let mut events = vec![BusMessage::TimerUpdated];
        if duration == 0 {
            events.extend(self.expire_due());
        }
        Ok(events)
    }

    /// Cancels the countdown for `key`; the pending change is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::NotDelaying`] if no countdown is running, or an
    /// I/O error (with the countdown restored) if persisting failed.
    pub fn cancel(&mut self, key: &SettingKey) -> Result<Vec<BusMessage>, GuardError> {
        if !self.status(key).is_changing {
            return Err(GuardError::NotDelaying(key.to_string()));
        }
        let Some(timer) = self.timers.remove(key) else {
            return Err(GuardError::NotDelaying(key.to_string()));
        };
        let info = self.preferences.timer_info.remove(&key.to_string());

        if let Err(e) = self.persist() {
            self.timers.insert(key.clone(), timer);
            if let Some(info) = info {
                self.preferences.timer_info.insert(key.to_string(), info);
            }
            return Err(e);
        }

        tracing::info!(%key, "countdown cancelled");
        Ok(vec![BusMessage::TimerUpdated])
    }

    /// Starts the unblock delay for a list item. Items already allowed for
    /// unblock need no delay.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty or malformed name, or the
    /// error from [`start`](Self::start).
    pub fn prime(&mut self, kind: ItemKind, name: &str) -> Result<Vec<BusMessage>, GuardError> {
        let identity = match kind {
            ItemKind::App => app_identity(name),
            ItemKind::Website => normalize_hostname(name)?,
        };
        if identity.is_empty() {
            return Err(GuardError::validation("item name must not be empty"));
        }
        if self.block_data.is_allowed_for_unblock(kind, &identity) {
            tracing::debug!(%kind, item = %identity, "already allowed for unblock");
            return Ok(Vec::new());
        }
        self.start(SettingKey::unblock(kind, identity), None, None)
    }

    /// Commits every countdown whose deadline has passed.
    pub fn expire_due(&mut self) -> Vec<BusMessage> {
        let now = self.clock.now();
        let mut due: Vec<(Instant, SettingKey)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(k, t)| (t.deadline, k.clone()))
            .collect();
        if due.is_empty() {
            return Vec::new();
        }
        due.sort_by_key(|(deadline, _)| *deadline);

        let mut events = Vec::new();
        for (_, key) in due {
            let Some(timer) = self.timers.remove(&key) else {
                continue;
            };
            self.preferences.timer_info.remove(&key.to_string());
            tracing::info!(%key, "countdown expired, committing");
            events.extend(self.apply_commit(&key, timer.info.target_timeout));
        }

        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to persist committed changes");
        }
        events
    }

    fn apply_commit(&mut self, key: &SettingKey, target: Option<u64>) -> Vec<BusMessage> {
        let mut events = Vec::new();
        match key {
            SettingKey::DelayTimeout => match target {
                Some(ms) if ms > 0 => {
                    self.preferences
                        .values
                        .insert(DELAY_TIMEOUT_KEY.to_string(), Value::from(ms));
                    events.push(BusMessage::PreferencesUpdated);
                }
                _ => tracing::warn!("delay countdown finished without a target, keeping timeout"),
            },
            SettingKey::UnblockApp(_) | SettingKey::UnblockWebsite(_) => {
                if let Some((kind, item)) = key.unblock_item() {
                    let item = item.to_string();
                    self.block_data.allow_unblock(kind, &item);
                }
                events.push(BusMessage::ListUpdated);
            }
            SettingKey::Preference(name) => {
                self.preferences
                    .values
                    .insert(name.clone(), Value::Bool(false));
                events.push(BusMessage::PreferencesUpdated);
            }
        }
        events.push(BusMessage::TimerUpdated);
        events
    }

    /// The block list document.
    pub fn block_data(&self) -> &BlockData {
        &self.block_data
    }

    /// Replaces the block list document.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if persisting failed; the previous document is
    /// kept.
    pub fn set_block_data(&mut self, data: BlockData) -> Result<Vec<BusMessage>, GuardError> {
        let previous = std::mem::replace(&mut self.block_data, data);
        if let Err(e) = self.persist() {
            self.block_data = previous;
            return Err(e);
        }
        Ok(vec![BusMessage::ListUpdated])
    }

    /// Reads a preference. `delayTimeOut` always reads as a number.
    pub fn preference(&self, key: &str) -> Value {
        if key == DELAY_TIMEOUT_KEY {
            return Value::from(self.current_timeout());
        }
        self.preferences
            .values
            .get(key)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Saves a preference.
    ///
    /// # Errors
    ///
    /// Returns a validation error for reserved keys or a non-positive delay,
    /// or an I/O error (with the old value restored) if persisting failed.
    pub fn save_preference(&mut self, key: &str, value: Value) -> Result<Vec<BusMessage>, GuardError> {
        if key.trim().is_empty() || key == TIMER_INFO_KEY || key.contains("-->") {
            return Err(GuardError::validation(format!("'{key}' cannot be saved")));
        }
        if key == DELAY_TIMEOUT_KEY && !value.as_u64().is_some_and(|ms| ms > 0) {
            return Err(GuardError::validation(
                "delayTimeOut must be a positive number of milliseconds",
            ));
        }

        let previous = self.preferences.values.insert(key.to_string(), value);
        if let Err(e) = self.persist() {
            match previous {
                Some(old) => self.preferences.values.insert(key.to_string(), old),
                None => self.preferences.values.remove(key),
            };
            return Err(e);
        }
        Ok(vec![BusMessage::PreferencesUpdated])
    }

    fn persist(&self) -> Result<(), GuardError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        write_document(&dir.join(PREFERENCES_FILE), &self.preferences)?;
        write_document(&dir.join(BLOCK_DATA_FILE), &self.block_data)?;
        Ok(())
    }
}

// ============================================================================
// Persistence helpers
// ============================================================================

fn load_document<T: DeserializeOwned + Default>(path: &Path, wall_millis: u64) -> T {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable document, starting empty");
            return T::default();
        }
    };

    if raw.trim().is_empty() {
        return T::default();
    }

    match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            let backup = backup_path(path, wall_millis);
            match std::fs::rename(path, &backup) {
                Ok(()) => tracing::warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "corrupted document backed up"
                ),
                Err(io) => tracing::warn!(
                    path = %path.display(),
                    error = %io,
                    "corrupted document could not be backed up"
                ),
            }
            T::default()
        }
    }
}

fn backup_path(path: &Path, wall_millis: u64) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    path.with_file_name(format!("{name}.corrupted-{wall_millis}"))
}

fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<(), GuardError> {
    let json = serde_json::to_vec_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ============================================================================
// Installed apps and process control
// ============================================================================

/// Directories searched for `.desktop` entries.
pub fn desktop_entry_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![
        PathBuf::from("/usr/share/applications"),
        PathBuf::from("/usr/local/share/applications"),
        PathBuf::from("/var/lib/flatpak/exports/share/applications"),
    ];
    if let Some(data) = dirs::data_dir() {
        dirs.push(data.join("applications"));
    }
    dirs
}

/// Enumerates applications from `.desktop` files, one per process name,
/// sorted by display name.
pub fn scan_installed_apps(dirs: &[PathBuf]) -> Vec<InstalledApp> {
    let mut by_process: BTreeMap<String, InstalledApp> = BTreeMap::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("desktop") {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            if let Some(app) = parse_desktop_entry(&contents) {
                by_process
                    .entry(app_identity(&app.process_name))
                    .or_insert(app);
            }
        }
    }

    let mut apps: Vec<InstalledApp> = by_process.into_values().collect();
    apps.sort_by_key(|app| app.display_name.to_lowercase());
    apps
}

/// Parses the `[Desktop Entry]` group of a `.desktop` file.
pub fn parse_desktop_entry(contents: &str) -> Option<InstalledApp> {
    let mut in_entry = false;
    let mut name = None;
    let mut exec = None;
    let mut is_app = false;

    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_entry = line == "[Desktop Entry]";
            continue;
        }
        if !in_entry {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k.trim() {
            "Name" => name = Some(v.trim().to_string()),
            "Exec" => exec = Some(v.trim().to_string()),
            "Type" => is_app = v.trim() == "Application",
            "NoDisplay" | "Hidden" if v.trim().eq_ignore_ascii_case("true") => return None,
            _ => {}
        }
    }

    if !is_app {
        return None;
    }
    let process = exec_process_name(&exec?)?;
    let display = name.filter(|n| !n.is_empty()).unwrap_or_else(|| process.clone());
    Some(InstalledApp::new(process, display))
}

fn exec_process_name(exec: &str) -> Option<String> {
    let mut tokens = exec.split_whitespace().filter(|t| !t.contains('='));
    let mut program = tokens.next()?;
    if program == "env" {
        program = tokens.next()?;
    }
    let base = program.trim_matches('"').rsplit('/').next()?;
    (!base.is_empty() && !base.starts_with('%')).then(|| base.to_string())
}

/// Terminates processes with exactly `process_name`. Returns whether any
/// process was signalled.
///
/// # Errors
///
/// Returns a validation error for names that are empty or contain a path,
/// or a command error if `pkill` could not be run.
pub async fn terminate_process(process_name: &str) -> Result<bool, GuardError> {
    let name = process_name.trim();
    if name.is_empty() || name.contains('/') {
        return Err(GuardError::validation(format!(
            "'{process_name}' is not a process name"
        )));
    }

    let status = tokio::process::Command::new("pkill")
        .arg("-x")
        .arg(name)
        .status()
        .await
        .map_err(|e| GuardError::command("close_app", e.to_string()))?;

    tracing::info!(process = name, killed = status.success(), "close app");
    Ok(status.success())
}

// ============================================================================
// LocalEngine
// ============================================================================

/// The countdown engine exposed through [`EngineBackend`], publishing the
/// messages its changes imply on a bus.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    engine: Arc<Mutex<CountdownEngine>>,
    bus: EventBus,
    app_dirs: Vec<PathBuf>,
}

impl LocalEngine {
    /// Wraps an engine.
    pub fn new(engine: CountdownEngine, bus: EventBus) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            bus,
            app_dirs: desktop_entry_dirs(),
        }
    }

    /// Overrides where installed apps are discovered.
    #[must_use]
    pub fn with_app_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.app_dirs = dirs;
        self
    }

    /// Bus the engine publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Commits expired countdowns and publishes the resulting messages.
    pub async fn tick(&self) {
        let events = self.engine.lock().await.expire_due();
        self.publish(events);
    }

    /// Keys with a running countdown.
    pub async fn active_keys(&self) -> Vec<SettingKey> {
        self.engine.lock().await.active_keys()
    }

    fn publish(&self, events: Vec<BusMessage>) {
        for event in events {
            self.bus.publish(event);
        }
    }

    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut CountdownEngine) -> Result<(T, Vec<BusMessage>), GuardError>,
    ) -> Result<T, GuardError> {
        let (value, events) = {
            let mut engine = self.engine.lock().await;
            // Expiry commits stand even when `op` fails and must be announced.
            let mut events = engine.expire_due();
            match op(&mut engine) {
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
}

impl EngineBackend for LocalEngine {
    async fn read_block_data(&self) -> Result<BlockData, GuardError> {
        self.mutate(|e| Ok((e.block_data().clone(), Vec::new()))).await
    }

    async fn write_block_data(&self, data: &BlockData) -> Result<(), GuardError> {
        let data = data.clone();
        self.mutate(|e| Ok(((), e.set_block_data(data)?))).await
    }

    async fn list_installed_apps(&self) -> Result<Vec<InstalledApp>, GuardError> {
        let dirs = self.app_dirs.clone();
        tokio::task::spawn_blocking(move || scan_installed_apps(&dirs))
            .await
            .map_err(|e| GuardError::fetch("installedApps", e.to_string()))
    }

    async fn get_change_status(&self, key: &SettingKey) -> Result<ChangeStatus, GuardError> {
        self.mutate(|e| Ok((e.status(key), Vec::new()))).await
    }

    async fn start_countdown(
        &self,
        key: &SettingKey,
        remaining_ms: Option<u64>,
        target: Option<u64>,
    ) -> Result<(), GuardError> {
        self.mutate(|e| Ok(((), e.start(key.clone(), remaining_ms, target)?)))
            .await
    }

    async fn cancel_countdown(&self, key: &SettingKey) -> Result<(), GuardError> {
        self.mutate(|e| Ok(((), e.cancel(key)?))).await
    }

    async fn prime_for_deletion(&self, kind: ItemKind, name: &str) -> Result<(), GuardError> {
        self.mutate(|e| Ok(((), e.prime(kind, name)?))).await
    }

    async fn read_preference(&self, key: &str) -> Result<Value, GuardError> {
        self.mutate(|e| Ok((e.preference(key), Vec::new()))).await
    }

    async fn save_preference(&self, key: &str, value: &Value) -> Result<(), GuardError> {
        let value = value.clone();
        self.mutate(|e| Ok(((), e.save_preference(key, value)?))).await
    }

    async fn close_confirmation_dialog(&self) -> Result<(), GuardError> {
        self.bus.publish(BusMessage::ConfirmDialogCloseRequested);
        Ok(())
    }

    async fn close_overlay_window(&self) -> Result<(), GuardError> {
        self.bus.publish(BusMessage::OverlayCloseRequested);
        Ok(())
    }

    async fn close_app(&self, process_name: &str) -> Result<bool, GuardError> {
        terminate_process(process_name).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::PROTECTIVE_DNS_KEY;

    fn engine() -> (CountdownEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (CountdownEngine::in_memory(180_000, clock.clone()), clock)
    }

    fn dns() -> SettingKey {
        SettingKey::preference(PROTECTIVE_DNS_KEY)
    }

    // ------------------------------------------------------------------------
    // Countdown Tests
    // ------------------------------------------------------------------------

    mod countdown_tests {
        use super::*;

        #[test]
        fn test_idle_status_reports_current_timeout() {
            let (engine, _clock) = engine();
            let status = engine.status(&dns());
            assert!(!status.is_changing);
            assert_eq!(status.current_timeout, Some(180_000));
        }

        #[test]
        fn test_start_reports_remaining() {
            let (mut engine, clock) = engine();
            let events = engine.start(dns(), Some(180_000), None).unwrap();
            assert_eq!(events, vec![BusMessage::TimerUpdated]);

            clock.advance(Duration::from_secs(30));
            let status = engine.status(&dns());
            assert!(status.is_changing);
            assert_eq!(status.time_remaining, 150_000);
            assert_eq!(status.delay_time_out_at_time_of_change, Some(180_000));
        }

        #[test]
        fn test_second_start_joins() {
            let (mut engine, clock) = engine();
            engine.start(dns(), Some(180_000), None).unwrap();
            clock.advance(Duration::from_secs(60));

            let events = engine.start(dns(), Some(180_000), None).unwrap();
            assert!(events.is_empty());
            assert_eq!(engine.status(&dns()).time_remaining, 120_000);
            assert_eq!(engine.active_keys(), vec![dns()]);
        }

        #[test]
        fn test_cancel_discards_change() {
            let (mut engine, clock) = engine();
            engine
                .save_preference(PROTECTIVE_DNS_KEY, Value::Bool(true))
                .unwrap();
            engine.start(dns(), None, None).unwrap();
            engine.cancel(&dns()).unwrap();

            clock.advance(Duration::from_secs(600));
            assert!(engine.expire_due().is_empty());
            assert_eq!(engine.preference(PROTECTIVE_DNS_KEY), Value::Bool(true));
        }

        #[test]
        fn test_cancel_without_countdown_fails() {
            let (mut engine, _clock) = engine();
            let result = engine.cancel(&dns());
            assert!(matches!(result, Err(GuardError::NotDelaying(_))));
        }

        #[test]
        fn test_expired_countdown_reads_idle_before_commit() {
            let (mut engine, clock) = engine();
            engine.start(dns(), Some(1_000), None).unwrap();
            clock.advance(Duration::from_millis(1_000));
            assert!(!engine.status(&dns()).is_changing);
        }
    }

    // ------------------------------------------------------------------------
    // Commit Tests
    // ------------------------------------------------------------------------

    mod commit_tests {
        use super::*;

        #[test]
        fn test_preference_commit_turns_switch_off() {
            let (mut engine, clock) = engine();
            engine
                .save_preference(PROTECTIVE_DNS_KEY, Value::Bool(true))
                .unwrap();
            engine.start(dns(), Some(180_000), None).unwrap();

            clock.advance(Duration::from_millis(180_001));
            let events = engine.expire_due();

            assert_eq!(
                events,
                vec![BusMessage::PreferencesUpdated, BusMessage::TimerUpdated]
            );
            assert_eq!(engine.preference(PROTECTIVE_DNS_KEY), Value::Bool(false));
            assert!(!engine.status(&dns()).is_changing);
        }

        #[test]
        fn test_delay_commit_saves_target() {
            let (mut engine, clock) = engine();
            engine
                .start(SettingKey::DelayTimeout, None, Some(60_000))
                .unwrap();
            assert_eq!(
                engine.status(&SettingKey::DelayTimeout).new_value,
                Some(60_000)
            );

            clock.advance(Duration::from_millis(180_000));
            engine.expire_due();
            assert_eq!(engine.current_timeout(), 60_000);
        }

        #[test]
        fn test_prime_commit_allows_unblock() {
            let (mut engine, clock) = engine();
            engine.prime(ItemKind::App, " Steam ").unwrap();
            let key = SettingKey::unblock(ItemKind::App, "steam");
            assert!(engine.status(&key).is_changing);

            clock.advance(Duration::from_millis(180_000));
            let events = engine.expire_due();

            assert!(events.contains(&BusMessage::ListUpdated));
            assert!(engine
                .block_data()
                .is_allowed_for_unblock(ItemKind::App, "steam"));
        }

        #[test]
        fn test_prime_already_allowed_is_noop() {
            let (mut engine, _clock) = engine();
            let mut data = BlockData::default();
            data.allow_unblock(ItemKind::Website, "example.com");
            engine.set_block_data(data).unwrap();

            let events = engine.prime(ItemKind::Website, "www.example.com").unwrap();
            assert!(events.is_empty());
            assert!(engine.active_keys().is_empty());
        }

        #[test]
        fn test_prime_rejects_bad_hostname() {
            let (mut engine, _clock) = engine();
            let result = engine.prime(ItemKind::Website, "not a url");
            assert!(matches!(result, Err(GuardError::Validation(_))));
        }

        #[test]
        fn test_zero_length_countdown_commits_at_once() {
            let (mut engine, _clock) = engine();
            let events = engine
                .start(SettingKey::DelayTimeout, Some(0), Some(30_000))
                .unwrap();
            assert!(events.contains(&BusMessage::PreferencesUpdated));
            assert_eq!(engine.current_timeout(), 30_000);
        }
    }

    // ------------------------------------------------------------------------
    // Preference Tests
    // ------------------------------------------------------------------------

    mod preference_tests {
        use super::*;

        #[test]
        fn test_delay_reads_as_number() {
            let (engine, _clock) = engine();
            assert_eq!(engine.preference(DELAY_TIMEOUT_KEY), Value::from(180_000u64));
            assert_eq!(engine.preference("missing"), Value::Null);
        }

        #[test]
        fn test_rejects_reserved_and_invalid() {
            let (mut engine, _clock) = engine();
            assert!(engine.save_preference("timerInfo", Value::Null).is_err());
            assert!(engine
                .save_preference(DELAY_TIMEOUT_KEY, Value::from(0))
                .is_err());
            assert!(engine
                .save_preference(DELAY_TIMEOUT_KEY, Value::from("soon"))
                .is_err());
        }
    }

    // ------------------------------------------------------------------------
    // Persistence Tests
    // ------------------------------------------------------------------------

    mod persistence_tests {
        use super::*;

        #[test]
        fn test_reopen_resumes_countdown() {
            let dir = tempfile::tempdir().unwrap();
            let clock = Arc::new(ManualClock::with_wall_millis(1_700_000_000_000));

            let (mut engine, _) = CountdownEngine::open(dir.path(), 180_000, clock.clone()).unwrap();
            engine.start(dns(), Some(180_000), None).unwrap();
            drop(engine);

            clock.advance(Duration::from_secs(60));
            let (engine, events) = CountdownEngine::open(dir.path(), 180_000, clock).unwrap();

            assert!(events.is_empty());
            let status = engine.status(&dns());
            assert!(status.is_changing);
            assert_eq!(status.time_remaining, 120_000);
        }

        #[test]
        fn test_reopen_commits_expired_countdown() {
            let dir = tempfile::tempdir().unwrap();
            let clock = Arc::new(ManualClock::with_wall_millis(1_700_000_000_000));

            let (mut engine, _) = CountdownEngine::open(dir.path(), 180_000, clock.clone()).unwrap();
            engine
                .save_preference(PROTECTIVE_DNS_KEY, Value::Bool(true))
                .unwrap();
            engine.start(dns(), None, None).unwrap();
            drop(engine);

            clock.advance(Duration::from_secs(181));
            let (engine, events) = CountdownEngine::open(dir.path(), 180_000, clock).unwrap();

            assert!(events.contains(&BusMessage::PreferencesUpdated));
            assert_eq!(engine.preference(PROTECTIVE_DNS_KEY), Value::Bool(false));
            assert!(engine.active_keys().is_empty());
        }

        #[test]
        fn test_corrupted_file_is_backed_up() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join(BLOCK_DATA_FILE), "{oops").unwrap();
            let clock = Arc::new(ManualClock::with_wall_millis(42));

            let (engine, _) = CountdownEngine::open(dir.path(), 180_000, clock).unwrap();

            assert_eq!(engine.block_data(), &BlockData::default());
            assert!(dir.path().join("blockData.json.corrupted-42").exists());
        }

        #[test]
        fn test_timer_info_file_format() {
            let dir = tempfile::tempdir().unwrap();
            let clock = Arc::new(ManualClock::with_wall_millis(5_000));

            let (mut engine, _) = CountdownEngine::open(dir.path(), 180_000, clock).unwrap();
            engine
                .start(SettingKey::DelayTimeout, None, Some(60_000))
                .unwrap();

            let raw = std::fs::read_to_string(dir.path().join(PREFERENCES_FILE)).unwrap();
            let json: Value = serde_json::from_str(&raw).unwrap();
            let info = &json["timerInfo"]["delayTimeOut"];
            assert_eq!(info["startTimeStamp"], 5_000);
            assert_eq!(info["targetTimeout"], 60_000);
            assert_eq!(info["delayTimeOutAtTimeOfChange"], 180_000);
        }
    }

    // ------------------------------------------------------------------------
    // Desktop Entry Tests
    // ------------------------------------------------------------------------

    mod desktop_entry_tests {
        use super::*;

        #[test]
        fn test_parse_basic_entry() {
            let entry = "[Desktop Entry]\nType=Application\nName=Firefox Web Browser\nExec=/usr/lib/firefox/firefox %u\n";
            let app = parse_desktop_entry(entry).unwrap();
            assert_eq!(app.process_name, "firefox");
            assert_eq!(app.display_name, "Firefox Web Browser");
        }

        #[test]
        fn test_parse_env_prefix() {
            let entry = "[Desktop Entry]\nType=Application\nName=Tool\nExec=env FOO=1 tool --flag\n";
            assert_eq!(parse_desktop_entry(entry).unwrap().process_name, "tool");
        }

        #[test]
        fn test_skip_hidden_and_non_apps() {
            assert!(parse_desktop_entry(
                "[Desktop Entry]\nType=Application\nName=X\nExec=x\nNoDisplay=true\n"
            )
            .is_none());
            assert!(parse_desktop_entry("[Desktop Entry]\nType=Link\nName=X\nURL=x\n").is_none());
        }

        #[test]
        fn test_ignores_action_groups() {
            let entry = "[Desktop Entry]\nType=Application\nName=Main\nExec=main\n[Desktop Action New]\nName=Other\nExec=other\n";
            let app = parse_desktop_entry(entry).unwrap();
            assert_eq!(app.process_name, "main");
            assert_eq!(app.display_name, "Main");
        }

        #[test]
        fn test_scan_dedups_by_process() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(
                dir.path().join("a.desktop"),
                "[Desktop Entry]\nType=Application\nName=Zed\nExec=zed\n",
            )
            .unwrap();
            std::fs::write(
                dir.path().join("b.desktop"),
                "[Desktop Entry]\nType=Application\nName=Zed Preview\nExec=/opt/zed\n",
            )
            .unwrap();
            std::fs::write(
                dir.path().join("c.desktop"),
                "[Desktop Entry]\nType=Application\nName=Atom\nExec=atom\n",
            )
            .unwrap();

            let apps = scan_installed_apps(&[dir.path().to_path_buf()]);
            let names: Vec<&str> = apps.iter().map(|a| a.process_name.as_str()).collect();
            assert_eq!(names, vec!["atom", "zed"]);
        }
    }

    // ------------------------------------------------------------------------
    // LocalEngine Tests
    // ------------------------------------------------------------------------

    mod local_engine_tests {
        use super::*;

        #[tokio::test]
        async fn test_backend_publishes_changes() {
            let clock = Arc::new(ManualClock::new());
            let bus = EventBus::new();
            let mut sub = bus.subscribe();
            let local = LocalEngine::new(CountdownEngine::in_memory(1_000, clock.clone()), bus);

            local.start_countdown(&dns(), None, None).await.unwrap();
            assert_eq!(sub.try_recv(), Some(BusMessage::TimerUpdated));

            clock.advance(Duration::from_secs(2));
            local.tick().await;
            assert_eq!(sub.try_recv(), Some(BusMessage::PreferencesUpdated));
            assert_eq!(sub.try_recv(), Some(BusMessage::TimerUpdated));
        }

        #[tokio::test]
        async fn test_expiry_is_announced_when_command_fails() {
            let clock = Arc::new(ManualClock::new());
            let bus = EventBus::new();
            let local = LocalEngine::new(
                CountdownEngine::in_memory(1_000, clock.clone()),
                bus.clone(),
            );
            local
                .save_preference(PROTECTIVE_DNS_KEY, &Value::Bool(true))
                .await
                .unwrap();
            local.start_countdown(&dns(), None, None).await.unwrap();
            let mut sub = bus.subscribe();

            clock.advance(Duration::from_millis(1_500));
            let result = local.cancel_countdown(&dns()).await;

            assert!(matches!(result, Err(GuardError::NotDelaying(_))));
            assert_eq!(
                local.read_preference(PROTECTIVE_DNS_KEY).await.unwrap(),
                Value::Bool(false)
            );
            assert_eq!(sub.try_recv(), Some(BusMessage::PreferencesUpdated));
            assert_eq!(sub.try_recv(), Some(BusMessage::TimerUpdated));
        }

        #[tokio::test]
        async fn test_close_requests_are_broadcast() {
            let clock = Arc::new(ManualClock::new());
            let bus = EventBus::new();
            let mut sub = bus.subscribe();
            let local = LocalEngine::new(CountdownEngine::in_memory(1_000, clock), bus);

            local.close_overlay_window().await.unwrap();
            local.close_confirmation_dialog().await.unwrap();

            assert_eq!(sub.try_recv(), Some(BusMessage::OverlayCloseRequested));
            assert_eq!(sub.try_recv(), Some(BusMessage::ConfirmDialogCloseRequested));
        }

        #[tokio::test]
        async fn test_close_app_rejects_paths() {
            let clock = Arc::new(ManualClock::new());
            let local = LocalEngine::new(CountdownEngine::in_memory(1_000, clock), EventBus::new());
            let result = local.close_app("/usr/bin/steam").await;
            assert!(matches!(result, Err(GuardError::Validation(_))));
        }
    }
}
