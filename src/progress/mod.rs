//! Countdown progress rendering.
//!
//! This module provides:
//! - `percent` / `render`: pure conversion of remaining/total into display text
//! - `Countdown`: a captured absolute deadline for one key
//! - `ProgressTicker`: a cancellable 1 Hz task that reports progress until the
//!   deadline passes
//!
//! Remaining time is always recomputed from the deadline, so a late or
//! skipped tick never drifts from the engine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::clock::Clock;
use crate::types::{ChangeStatus, SettingKey};

/// Interval between ticks.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Rendering
// ============================================================================

/// Share of the countdown that has elapsed, in `0..=100`.
///
/// ```
/// use std::time::Duration;
/// use eagle_guard::progress::percent;
///
/// assert_eq!(percent(Duration::from_secs(180), Duration::from_secs(180)), 0);
/// assert_eq!(percent(Duration::from_secs(90), Duration::from_secs(180)), 50);
/// assert_eq!(percent(Duration::ZERO, Duration::from_secs(180)), 100);
/// ```
pub fn percent(remaining: Duration, total: Duration) -> u8 {
    let total_ms = total.as_millis();
    if total_ms == 0 {
        return 100;
    }
    let remaining_ms = remaining.as_millis().min(total_ms);
    let left = remaining_ms * 100 / total_ms;
    (100 - left) as u8
}

/// What a progress bar shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressView {
    /// Whole seconds left, rounded up, e.g. `"42s"`
    pub time_text: String,
    /// Bar fill
    pub percent: u8,
    /// Bar fill as text, e.g. `"76%"`
    pub percent_text: String,
}

impl ProgressView {
    /// Whether the countdown has run out.
    pub fn is_done(&self) -> bool {
        self.percent == 100
    }
}

/// Renders a remaining/total pair.
pub fn render(remaining: Duration, total: Duration) -> ProgressView {
    let percent = percent(remaining, total);
    ProgressView {
        time_text: format!("{}s", remaining.as_millis().div_ceil(1000)),
        percent,
        percent_text: format!("{percent}%"),
    }
}

// ============================================================================
// Countdown
// ============================================================================

/// A countdown bound to an absolute deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    key: SettingKey,
    deadline: Instant,
    total: Duration,
}

impl Countdown {
    /// Creates a countdown ending `remaining` after `now`.
    pub fn starting(key: SettingKey, remaining: Duration, total: Duration, now: Instant) -> Self {
        Self {
            key,
            deadline: now + remaining,
            total: total.max(remaining),
        }
    }

    /// Captures the deadline reported by an engine poll taken at `now`.
    pub fn from_status(key: SettingKey, status: &ChangeStatus, now: Instant) -> Self {
        Self::starting(key, status.remaining(), status.total(), now)
    }

    pub fn key(&self) -> &SettingKey {
        &self.key
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    /// Time left at `now`, never negative.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn is_finished(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }

    /// Renders the countdown at `now`.
    pub fn view(&self, now: Instant) -> ProgressView {
        render(self.remaining(now), self.total)
    }
}

// ============================================================================
// Ticker
// ============================================================================

/// Output of a running ticker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Progress at this tick
    Tick(ProgressView),
    /// The deadline passed; sent once, after the final tick
    Finished,
}

/// Spawns the per-window progress task.
#[derive(Debug)]
pub struct ProgressTicker;

impl ProgressTicker {
    /// Starts ticking `countdown` immediately and then once per second.
    ///
    /// Must be called within a tokio runtime. The task stops after sending
    /// [`ProgressEvent::Finished`], when the receiver is dropped, or when the
    /// handle is cancelled or dropped.
    pub fn spawn(
        countdown: Countdown,
        clock: Arc<dyn Clock>,
    ) -> (TickerHandle, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = countdown.key().clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let now = clock.now();
                if tx.send(ProgressEvent::Tick(countdown.view(now))).is_err() {
                    tracing::debug!(key = %countdown.key(), "progress receiver gone");
                    return;
                }
                if countdown.is_finished(now) {
                    tracing::debug!(key = %countdown.key(), "countdown finished");
                    let _ = tx.send(ProgressEvent::Finished);
                    return;
                }
            }
        });

        (TickerHandle { key, task }, rx)
    }
}

/// Owner of a running ticker. Dropping it stops the task.
#[derive(Debug)]
pub struct TickerHandle {
    key: SettingKey,
    task: JoinHandle<()>,
}

impl TickerHandle {
    /// Key being ticked.
    pub fn key(&self) -> &SettingKey {
        &self.key
    }

    /// Stops ticking. Idempotent.
    pub fn cancel(&self) {
        if !self.task.is_finished() {
            tracing::debug!(key = %self.key, "ticker cancelled");
        }
        self.task.abort();
    }

    /// Whether the task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
