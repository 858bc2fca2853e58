//! Display utilities for the guard CLI.
//!
//! This module provides formatted output for:
//! - Success and error messages
//! - Countdown status and progress
//! - Block lists and installed apps

use std::io::Write;

use crate::blocklist::{BlockListRow, RowAction};
use crate::coordinator::ChangeOutcome;
use crate::progress::ProgressView;
use crate::types::{ChangeStatus, InstalledApp, ItemKind, SettingKey};

/// Width of the progress bar in characters.
const BAR_WIDTH: usize = 30;

// ============================================================================
// Display
// ============================================================================

/// Display utilities for CLI output.
pub struct Display;

impl Display {
    /// Shows a plain success message.
    pub fn show_success(message: &str) {
        println!("* {message}");
    }

    /// Shows the countdown state of a key.
    pub fn show_status(key: &SettingKey, status: &ChangeStatus) {
        println!("{key}");
        println!("─────────────────────────────");
        if status.is_changing {
            let view = crate::progress::render(status.remaining(), status.total());
            println!("State:     delaying");
            println!("Remaining: {}", view.time_text);
            println!("Progress:  {}", Self::progress_line(&view));
            if let Some(target) = status.new_value {
                println!("Commits:   {target}");
            }
        } else {
            println!("State:     idle");
        }
        if let Some(timeout) = status.current_timeout {
            println!("Delay:     {}", Self::format_millis(timeout));
        }
    }

    /// Shows what a change request led to.
    pub fn show_outcome(key: &SettingKey, outcome: &ChangeOutcome) {
        match outcome {
            ChangeOutcome::Applied => println!("* {key} changed"),
            ChangeOutcome::Unchanged => println!("= {key} already has that value"),
            ChangeOutcome::ConfirmationRequired => {
                println!("! {key} is protected; the change needs a delay");
                println!("  Run 'eagle-guard confirm {key}' to start it");
            }
            ChangeOutcome::AlreadyDelaying(_) => {
                println!("~ A delay is already running for {key}");
                println!("  Run 'eagle-guard watch {key}' to follow it");
            }
            ChangeOutcome::StrictnessChoiceRequired => {
                println!("? Choose a strictness: 'eagle-guard enable-dns [--strict]'");
            }
        }
    }

    /// Redraws the progress line in place.
    pub fn show_progress(view: &ProgressView) {
        print!("\r{} {:>6}", Self::progress_line(view), view.time_text);
        let _ = std::io::stdout().flush();
    }

    /// Ends the progress line once the countdown is done.
    pub fn show_finished(key: &SettingKey) {
        println!();
        println!("* Delay finished, {key} changed");
    }

    /// Shows a cancelled delay.
    pub fn show_cancelled(key: &SettingKey) {
        println!("[] Delay cancelled for {key}");
    }

    /// Ends the progress line when another window cancelled the delay.
    pub fn show_cancelled_elsewhere(key: &SettingKey) {
        println!();
        println!("[] Delay for {key} was cancelled elsewhere, nothing changed");
    }

    /// Ends the progress line when following stopped before an outcome.
    pub fn show_unfollowed(key: &SettingKey) {
        println!();
        println!("! Stopped following the delay for {key}; run 'status' to see where it stands");
    }

    /// Shows the rows of a block list.
    pub fn show_rows(kind: ItemKind, rows: &[BlockListRow]) {
        if rows.is_empty() {
            println!("No blocked {kind}s");
            return;
        }
        for row in rows {
            let action = match &row.action {
                RowAction::Delete => "can be unblocked".to_string(),
                RowAction::Delaying { remaining } => {
                    format!("unblock delay, {}s left", remaining.as_millis().div_ceil(1000))
                }
                RowAction::PrepareForDeletion => "blocked".to_string(),
            };
            println!("{:<32} {}", row.item.label(), action);
        }
    }

    /// Shows installed apps.
    pub fn show_apps(apps: &[InstalledApp]) {
        if apps.is_empty() {
            println!("No apps found");
            return;
        }
        for app in apps {
            println!("{:<32} {}", app.display_name, app.process_name);
        }
    }

    /// Shows an error message.
    pub fn show_error(message: &str) {
        eprintln!("error: {message}");
    }

    /// `[#####-----]  50%`
    fn progress_line(view: &ProgressView) -> String {
        format!("[{}] {}", Self::bar(view.percent), view.percent_text)
    }

    fn bar(percent: u8) -> String {
        let filled = BAR_WIDTH * usize::from(percent.min(100)) / 100;
        format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
    }

    /// Formats milliseconds as the largest whole unit that fits.
    fn format_millis(ms: u64) -> String {
        const MINUTE: u64 = 60_000;
        const HOUR: u64 = 60 * MINUTE;
        const DAY: u64 = 24 * HOUR;

        match ms {
            ms if ms >= DAY && ms % DAY == 0 => format!("{} day(s)", ms / DAY),
            ms if ms >= HOUR && ms % HOUR == 0 => format!("{} hour(s)", ms / HOUR),
            ms if ms >= MINUTE && ms % MINUTE == 0 => format!("{} minute(s)", ms / MINUTE),
            ms => format!("{}s", ms.div_ceil(1000)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
