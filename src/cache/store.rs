//! Typed shared-state store built on [`CoalescingCache`].
//!
//! One store is constructed per window process. Reads are retried with
//! backoff and degrade to empty values; saves write through so the next read
//! never races a stale refetch.

use std::sync::Arc;

use serde_json::Value;

use super::CoalescingCache;
use crate::backend::EngineBackend;
use crate::bus::BusHandler;
use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::error::GuardError;
use crate::retry::RetryPolicy;
use crate::types::{BlockData, ChangeStatus, InstalledApp, SettingKey};

/// Cached view of the engine's block data, installed apps, preferences and
/// countdown statuses.
#[derive(Debug)]
pub struct SharedStateStore<B> {
    backend: Arc<B>,
    retry: RetryPolicy,
    block_data: CoalescingCache<(), BlockData>,
    installed_apps: CoalescingCache<(), Vec<InstalledApp>>,
    preferences: CoalescingCache<String, Value>,
    statuses: CoalescingCache<SettingKey, ChangeStatus>,
}

impl<B: EngineBackend> SharedStateStore<B> {
    /// Creates a store using the TTLs and retry policy from `config`.
    pub fn new(backend: Arc<B>, config: &GuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            retry: config.retry_policy(),
            block_data: CoalescingCache::new("blockData", config.cache_ttl(), clock.clone()),
            installed_apps: CoalescingCache::new(
                "installedApps",
                config.cache_ttl(),
                clock.clone(),
            ),
            preferences: CoalescingCache::new("preferences", config.preference_ttl(), clock.clone()),
            // Statuses are owned by the engine's clock; only coalesce them.
            statuses: CoalescingCache::new("changeStatus", std::time::Duration::ZERO, clock),
        }
    }

    /// The engine this store reads from.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Block list document, or an empty one if the engine is unreachable.
    pub async fn block_data(&self) -> BlockData {
        self.block_data
            .get_with(&(), move || {
                self.retry
                    .run("blockData", move || self.backend.read_block_data())
            })
            .await
    }

    /// Block list document; a failed read is an error. Edits read through
    /// this so an unreachable engine never turns into an empty list on save.
    ///
    /// # Errors
    ///
    /// Returns the read error after retries are exhausted.
    pub async fn try_block_data(&self) -> Result<BlockData, GuardError> {
        self.block_data
            .try_get_with(&(), move || {
                self.retry
                    .run("blockData", move || self.backend.read_block_data())
            })
            .await
    }

    /// Installed applications, or none if enumeration failed.
    pub async fn installed_apps(&self) -> Vec<InstalledApp> {
        self.installed_apps
            .get_with(&(), move || {
                self.retry
                    .run("installedApps", move || self.backend.list_installed_apps())
            })
            .await
    }

    /// Preference value, or `null` if it could not be read.
    pub async fn preference(&self, key: &str) -> Value {
        self.preferences
            .get_with(&key.to_string(), move || self.fetch_preference(key))
            .await
    }

    /// Preference value; a failed read is an error.
    ///
    /// # Errors
    ///
    /// Returns the read error after retries are exhausted.
    pub async fn try_preference(&self, key: &str) -> Result<Value, GuardError> {
        self.preferences
            .try_get_with(&key.to_string(), move || self.fetch_preference(key))
            .await
    }

    async fn fetch_preference(&self, key: &str) -> Result<Value, GuardError> {
        self.retry
            .run("preference", move || self.backend.read_preference(key))
            .await
    }

    /// Authoritative countdown status for `key`. Concurrent callers share one
    /// engine round trip.
    ///
    /// # Errors
    ///
    /// Returns the read error after retries are exhausted.
    pub async fn change_status(&self, key: &SettingKey) -> Result<ChangeStatus, GuardError> {
        self.statuses
            .try_get_with(key, move || {
                self.retry
                    .run("changeStatus", move || self.backend.get_change_status(key))
            })
            .await
    }

    /// Persists the block list, then writes it through to the cache.
    ///
    /// # Errors
    ///
    /// Returns the engine error; the cached value is left untouched.
    pub async fn save_block_data(&self, data: BlockData) -> Result<(), GuardError> {
        self.backend.write_block_data(&data).await?;
        self.block_data.put((), data);
        Ok(())
    }

    /// Persists a preference, then writes it through to the cache.
    ///
    /// # Errors
    ///
    /// Returns the engine error; the cached value is left untouched.
    pub async fn save_preference(&self, key: &str, value: Value) -> Result<(), GuardError> {
        self.backend.save_preference(key, &value).await?;
        self.preferences.put(key.to_string(), value);
        Ok(())
    }

    /// Forgets the cached block list.
    pub fn invalidate_block_data(&self) {
        self.block_data.invalidate(&());
    }

    /// Forgets the cached installed apps.
    pub fn invalidate_installed_apps(&self) {
        self.installed_apps.invalidate(&());
    }

    /// Forgets every cached preference.
    pub fn invalidate_preferences(&self) {
        self.preferences.invalidate_all();
    }

    /// Drops any in-flight status poll so the next read reaches the engine.
    pub fn invalidate_statuses(&self) {
        self.statuses.invalidate_all();
    }
}

impl<B: EngineBackend> BusHandler for SharedStateStore<B> {
    fn on_list_updated(&self) {
        self.invalidate_block_data();
    }

    fn on_preferences_updated(&self) {
        self.invalidate_preferences();
    }

    fn on_timer_updated(&self) {
        self.invalidate_statuses();
    }
}
