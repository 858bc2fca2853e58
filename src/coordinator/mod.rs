//! Deferred commit coordination.
//!
//! Every weakening of a protection goes through
//! `Idle → PendingConfirmation → Delaying → Committed | Idle`. The engine owns
//! the countdown; this side keeps a provisional phase per key and reconciles
//! it with the engine's status after every command.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;

use crate::backend::EngineBackend;
use crate::bus::{BusMessage, EventBus};
use crate::cache::{CoalescingCache, SharedStateStore};
use crate::clock::Clock;
use crate::error::GuardError;
use crate::progress::Countdown;
use crate::types::{
    is_truthy, ChangeStatus, SettingKey, DELAY_TIMEOUT_KEY, DEFAULT_DELAY_TIMEOUT_MS,
    DNS_STRICTNESS_KEY, PROTECTIVE_DNS_KEY,
};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

// ============================================================================
// Types
// ============================================================================

/// Local view of a key's deferred commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// Nothing pending
    Idle,
    /// Waiting for the user to confirm
    PendingConfirmation {
        /// Value to commit once the delay has passed
        proposed: Value,
    },
    /// The engine is counting down
    Delaying {
        /// Deadline captured from the engine
        countdown: Countdown,
    },
    /// A cancel was sent and not yet acknowledged
    Cancelling,
    /// The countdown ran out and the change took effect
    Committed,
}

impl Phase {
    pub fn is_delaying(&self) -> bool {
        matches!(self, Phase::Delaying { .. })
    }
}

/// Result of [`DeferredCommitCoordinator::request_change`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    /// The setting was weak; the value was saved immediately.
    Applied,
    /// The proposed value equals the current one.
    Unchanged,
    /// The setting is protected; a confirmation dialog was requested.
    ConfirmationRequired,
    /// A countdown is already running for the key.
    AlreadyDelaying(Countdown),
    /// Protective DNS is being enabled; the caller must ask for a strictness.
    StrictnessChoiceRequired,
}

/// A delay choice from the settings screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelaySelection {
    /// A preset, in milliseconds
    Millis(u64),
    /// A custom number of days
    Days(f64),
}

impl DelaySelection {
    /// The delay in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a zero, negative or non-finite delay.
    pub fn to_millis(self) -> Result<u64, GuardError> {
        let ms = match self {
            DelaySelection::Millis(ms) => ms,
            DelaySelection::Days(days) => {
                if !days.is_finite() || days <= 0.0 {
                    return Err(GuardError::validation(format!(
                        "'{days}' is not a positive number of days"
                    )));
                }
                (days * MILLIS_PER_DAY).round() as u64
            }
        };
        if ms == 0 {
            return Err(GuardError::validation("delay must be positive"));
        }
        Ok(ms)
    }
}

/// Protective DNS strictness level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsStrictness {
    Strict,
    Lenient,
}

impl DnsStrictness {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsStrictness::Strict => "strict",
            DnsStrictness::Lenient => "lenient",
        }
    }
}

#[derive(Debug, Clone)]
struct CommitRecord {
    phase: Phase,
    authoritative: Option<ChangeStatus>,
}

impl Default for CommitRecord {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            authoritative: None,
        }
    }
}

// ============================================================================
// DeferredCommitCoordinator
// ============================================================================

/// Drives deferred commits for one window.
#[derive(Debug)]
pub struct DeferredCommitCoordinator<B> {
    store: Arc<SharedStateStore<B>>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<SettingKey, CommitRecord>>,
    starts: CoalescingCache<SettingKey, ChangeStatus>,
}

impl<B: EngineBackend> DeferredCommitCoordinator<B> {
    /// Creates a coordinator.
    pub fn new(store: Arc<SharedStateStore<B>>, bus: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            starts: CoalescingCache::new("startDelay", Duration::ZERO, clock.clone()),
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// The store this coordinator reads through.
    pub fn store(&self) -> &Arc<SharedStateStore<B>> {
        &self.store
    }

    fn records(&self) -> MutexGuard<'_, HashMap<SettingKey, CommitRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current local phase of `key`.
    pub fn phase(&self, key: &SettingKey) -> Phase {
        self.records()
            .get(key)
            .map(|r| r.phase.clone())
            .unwrap_or(Phase::Idle)
    }

    fn set_phase(&self, key: &SettingKey, phase: Phase) {
        tracing::debug!(%key, ?phase, "phase");
        self.records().entry(key.clone()).or_default().phase = phase;
    }

    fn record_status(&self, key: &SettingKey, status: &ChangeStatus) {
        self.records().entry(key.clone()).or_default().authoritative = Some(status.clone());
    }

    /// Requests that `key` take `proposed`.
    ///
    /// Weak settings are applied at once. Protected ones move to
    /// [`Phase::PendingConfirmation`] and `delay-requires-confirmation` is
    /// published.
    ///
    /// # Errors
    ///
    /// Returns the read error if the protection state cannot be determined,
    /// a validation error for a malformed proposal, or the save error.
    pub async fn request_change(
        &self,
        key: &SettingKey,
        proposed: Value,
    ) -> Result<ChangeOutcome, GuardError> {
        let status = self.store.change_status(key).await?;
        self.record_status(key, &status);
        if status.is_changing {
            let countdown = Countdown::from_status(key.clone(), &status, self.clock.now());
            self.set_phase(
                key,
                Phase::Delaying {
                    countdown: countdown.clone(),
                },
            );
            return Ok(ChangeOutcome::AlreadyDelaying(countdown));
        }

        match key {
            SettingKey::Preference(name) => {
                let current = is_truthy(&self.store.try_preference(name).await?);
                let wanted = is_truthy(&proposed);
                if current == wanted {
                    return Ok(ChangeOutcome::Unchanged);
                }
                if current {
                    return Ok(self.require_confirmation(key, proposed));
                }
                if key.is_protective_dns() {
                    return Ok(ChangeOutcome::StrictnessChoiceRequired);
                }
                self.apply_preference(name, Value::Bool(wanted)).await?;
                Ok(ChangeOutcome::Applied)
            }
            SettingKey::DelayTimeout => {
                let wanted = proposed
                    .as_u64()
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| GuardError::validation("delay must be a positive number of milliseconds"))?;
                let current = self.current_delay(&status).await?;
                if wanted == current {
                    Ok(ChangeOutcome::Unchanged)
                } else if wanted > current {
                    self.apply_preference(DELAY_TIMEOUT_KEY, Value::from(wanted))
                        .await?;
                    Ok(ChangeOutcome::Applied)
                } else {
                    Ok(self.require_confirmation(key, Value::from(wanted)))
                }
            }
            SettingKey::UnblockApp(_) | SettingKey::UnblockWebsite(_) => {
                let Some((kind, identity)) = key.unblock_item() else {
                    return Err(GuardError::validation(format!("'{key}' is not an item key")));
                };
                let data = self.store.block_data().await;
                if data.is_allowed_for_unblock(kind, identity) {
                    Ok(ChangeOutcome::Unchanged)
                } else {
                    Ok(self.require_confirmation(key, Value::Null))
                }
            }
        }
    }

    async fn current_delay(&self, status: &ChangeStatus) -> Result<u64, GuardError> {
        let stored = self.store.try_preference(DELAY_TIMEOUT_KEY).await?;
        Ok(stored
            .as_u64()
            .filter(|ms| *ms > 0)
            .or(status.current_timeout.filter(|ms| *ms > 0))
            .unwrap_or(DEFAULT_DELAY_TIMEOUT_MS))
    }

    async fn apply_preference(&self, key: &str, value: Value) -> Result<(), GuardError> {
        self.store.save_preference(key, value).await?;
        self.bus.publish(BusMessage::PreferencesUpdated);
        tracing::info!(key, "weak setting applied");
        Ok(())
    }

    fn require_confirmation(&self, key: &SettingKey, proposed: Value) -> ChangeOutcome {
        tracing::info!(%key, "protected setting, confirmation required");
        self.set_phase(key, Phase::PendingConfirmation { proposed });
        self.bus.publish(BusMessage::DelayRequiresConfirmation {
            setting_id: key.clone(),
        });
        ChangeOutcome::ConfirmationRequired
    }

    /// Changes the unlock delay.
    ///
    /// # Errors
    ///
    /// See [`request_change`](Self::request_change).
    pub async fn change_delay_timeout(
        &self,
        selection: DelaySelection,
    ) -> Result<ChangeOutcome, GuardError> {
        let ms = selection.to_millis()?;
        self.request_change(&SettingKey::DelayTimeout, Value::from(ms))
            .await
    }

    /// Enables protective DNS at `strictness`. Strengthening needs no delay.
    ///
    /// # Errors
    ///
    /// Returns the save error.
    pub async fn enable_protective_dns(&self, strictness: DnsStrictness) -> Result<(), GuardError> {
        self.store
            .save_preference(DNS_STRICTNESS_KEY, Value::from(strictness.as_str()))
            .await?;
        self.store
            .save_preference(PROTECTIVE_DNS_KEY, Value::Bool(true))
            .await?;
        self.set_phase(&SettingKey::preference(PROTECTIVE_DNS_KEY), Phase::Idle);
        self.bus.publish(BusMessage::PreferencesUpdated);
        tracing::info!(strictness = strictness.as_str(), "protective DNS enabled");
        Ok(())
    }

    /// Starts the countdown for `key`, or joins the one already running.
    ///
    /// `remaining` defaults to the configured delay and `total` to the
    /// engine's reported length. Concurrent calls for one key share a single
    /// start command.
    ///
    /// # Errors
    ///
    /// Returns the engine error. The phase is then reconciled with whatever
    /// the engine actually holds.
    pub async fn start_delay(
        &self,
        key: &SettingKey,
        remaining: Option<Duration>,
        total: Option<Duration>,
    ) -> Result<Countdown, GuardError> {
        let status = self
            .starts
            .try_get_with(key, move || self.issue_start(key, remaining))
            .await?;

        let now = self.clock.now();
        let total = total.unwrap_or_else(|| status.total());
        let countdown = Countdown::starting(key.clone(), status.remaining(), total, now);
        self.set_phase(
            key,
            if status.is_changing {
                Phase::Delaying {
                    countdown: countdown.clone(),
                }
            } else {
                Phase::Committed
            },
        );
        Ok(countdown)
    }

    async fn issue_start(
        &self,
        key: &SettingKey,
        remaining: Option<Duration>,
    ) -> Result<ChangeStatus, GuardError> {
        let status = self.store.change_status(key).await?;
        self.record_status(key, &status);
        if status.is_changing {
            tracing::info!(%key, remaining_ms = status.time_remaining, "countdown running, joining");
            return Ok(status);
        }

        let target = match self.phase(key) {
            Phase::PendingConfirmation { proposed } => proposed.as_u64(),
            _ => None,
        };
        let remaining_ms = remaining.map(|d| d.as_millis() as u64);

        let provisional = Countdown::starting(
            key.clone(),
            remaining.unwrap_or_else(|| status.total()),
            status.total(),
            self.clock.now(),
        );
        self.set_phase(
            key,
            Phase::Delaying {
                countdown: provisional,
            },
        );

        if let Err(e) = self
            .store
            .backend()
            .start_countdown(key, remaining_ms, target)
            .await
        {
            tracing::warn!(%key, error = %e, "start failed, reconciling");
            self.reconcile(key).await;
            return Err(e);
        }

        self.store.invalidate_statuses();
        self.bus.publish(BusMessage::TimerUpdated);
        tracing::info!(%key, ?remaining_ms, ?target, "countdown started");

        let status = self.store.change_status(key).await?;
        self.record_status(key, &status);
        Ok(status)
    }

    /// Cancels the countdown for `key`. The proposed value is discarded.
    ///
    /// # Errors
    ///
    /// Returns the engine error. The phase is then reconciled with whatever
    /// the engine actually holds.
    pub async fn cancel_delay(&self, key: &SettingKey) -> Result<(), GuardError> {
        self.set_phase(key, Phase::Cancelling);

        if let Err(e) = self.store.backend().cancel_countdown(key).await {
            tracing::warn!(%key, error = %e, "cancel failed, reconciling");
            self.reconcile(key).await;
            return Err(e);
        }

        self.set_phase(key, Phase::Idle);
        self.store.invalidate_statuses();
        self.bus.publish(BusMessage::TimerUpdated);
        tracing::info!(%key, "countdown cancelled");
        Ok(())
    }

    /// Re-polls the engine and rebuilds the phase of `key` from it.
    ///
    /// A countdown this window was showing that has since ended reads as
    /// [`Phase::Committed`] only if the engine now holds the new value. One
    /// that ended without the value changing (cancelled elsewhere) reads as
    /// [`Phase::Idle`], whether or not its deadline had passed.
    ///
    /// # Errors
    ///
    /// Returns the read error; the local phase is left unchanged.
    pub async fn resume(&self, key: &SettingKey) -> Result<Phase, GuardError> {
        let previous = self.records().get(key).and_then(|r| r.authoritative.clone());
        let status = self.store.change_status(key).await?;
        let now = self.clock.now();

        let phase = if status.is_changing {
            Phase::Delaying {
                countdown: Countdown::from_status(key.clone(), &status, now),
            }
        } else {
            match self.phase(key) {
                Phase::Delaying { .. } => {
                    let target = previous.and_then(|s| s.new_value);
                    if self.took_effect(key, target).await? {
                        Phase::Committed
                    } else {
                        tracing::info!(%key, "countdown ended without a commit");
                        Phase::Idle
                    }
                }
                Phase::Committed => Phase::Committed,
                pending @ Phase::PendingConfirmation { .. } => pending,
                _ => Phase::Idle,
            }
        };

        self.record_status(key, &status);
        self.set_phase(key, phase.clone());
        Ok(phase)
    }

    /// Whether the engine now holds the weakened value for `key`.
    async fn took_effect(&self, key: &SettingKey, target: Option<u64>) -> Result<bool, GuardError> {
        match key {
            SettingKey::Preference(name) => {
                self.store.invalidate_preferences();
                Ok(!is_truthy(&self.store.try_preference(name).await?))
            }
            SettingKey::DelayTimeout => {
                let Some(target) = target else {
                    return Ok(true);
                };
                self.store.invalidate_preferences();
                let stored = self.store.try_preference(DELAY_TIMEOUT_KEY).await?;
                Ok(stored.as_u64() == Some(target))
            }
            SettingKey::UnblockApp(_) | SettingKey::UnblockWebsite(_) => {
                let Some((kind, identity)) = key.unblock_item() else {
                    return Ok(false);
                };
                self.store.invalidate_block_data();
                let data = self.store.try_block_data().await?;
                Ok(data.is_allowed_for_unblock(kind, identity))
            }
        }
    }

    async fn reconcile(&self, key: &SettingKey) {
        self.store.invalidate_statuses();
        match self.store.change_status(key).await {
            Ok(status) => {
                self.record_status(key, &status);
                let phase = if status.is_changing {
                    Phase::Delaying {
                        countdown: Countdown::from_status(key.clone(), &status, self.clock.now()),
                    }
                } else {
                    Phase::Idle
                };
                self.set_phase(key, phase);
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "engine unreachable, restoring last known state");
                let last = self.records().get(key).and_then(|r| r.authoritative.clone());
                let phase = match last {
                    Some(status) if status.is_changing => Phase::Delaying {
                        countdown: Countdown::from_status(key.clone(), &status, self.clock.now()),
                    },
                    _ => Phase::Idle,
                };
                self.set_phase(key, phase);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
