//! Block lists: item identity, hostname normalization, row actions and
//! editing.
//!
//! This module provides:
//! - `BlockListItem` and its identity rules
//! - `normalize_hostname`: the only way a website enters a block list
//! - `rows`: deduplicated rows with their delete / delaying / prime action
//! - `available_apps` / `filter_apps`: the app picker
//! - `BlockListEditor`: write-through edits that publish `list-updated`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use url::{Host, Url};

use crate::backend::EngineBackend;
use crate::bus::{BusMessage, EventBus};
use crate::cache::SharedStateStore;
use crate::error::GuardError;
use crate::types::{BlockData, InstalledApp, ItemKind, SettingKey};

// ============================================================================
// BlockListItem
// ============================================================================

/// An entry of a block list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockListItem {
    /// A blocked application
    App {
        /// Executable name
        process_name: String,
        /// Human readable name
        display_name: String,
    },
    /// A blocked website
    Website {
        /// Normalized hostname
        hostname: String,
    },
}

impl BlockListItem {
    /// Kind of the item.
    pub fn kind(&self) -> ItemKind {
        match self {
            BlockListItem::App { .. } => ItemKind::App,
            BlockListItem::Website { .. } => ItemKind::Website,
        }
    }

    /// Identity used for dedup and unblock bookkeeping.
    pub fn identity(&self) -> String {
        match self {
            BlockListItem::App { process_name, .. } => app_identity(process_name),
            BlockListItem::Website { hostname } => {
                normalize_hostname(hostname).unwrap_or_else(|_| hostname.trim().to_lowercase())
            }
        }
    }

    /// Text shown to the user.
    pub fn label(&self) -> &str {
        match self {
            BlockListItem::App {
                process_name,
                display_name,
            } => {
                if display_name.trim().is_empty() {
                    process_name
                } else {
                    display_name
                }
            }
            BlockListItem::Website { hostname } => hostname,
        }
    }

    /// Key of the unblock countdown for this item.
    pub fn setting_key(&self) -> SettingKey {
        SettingKey::unblock(self.kind(), self.identity())
    }
}

impl From<&InstalledApp> for BlockListItem {
    fn from(app: &InstalledApp) -> Self {
        BlockListItem::App {
            process_name: app.process_name.clone(),
            display_name: app.display_name.clone(),
        }
    }
}

/// Identity of an app: trimmed, lower-cased process name.
pub fn app_identity(process_name: &str) -> String {
    process_name.trim().to_lowercase()
}

/// Normalizes user input into a bare hostname.
///
/// Adds `http://` when no scheme is given, lower-cases, and strips a leading
/// `www.`. Paths, ports and credentials are discarded.
///
/// # Errors
///
/// Returns a validation error if the input does not contain a dotted domain
/// name or an IPv4 address.
///
/// # Example
///
/// ```
/// use eagle_guard::blocklist::normalize_hostname;
///
/// assert_eq!(normalize_hostname("HTTP://WWW.Example.COM/path").unwrap(), "example.com");
/// assert!(normalize_hostname("not a url").is_err());
/// ```
pub fn normalize_hostname(input: &str) -> Result<String, GuardError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(GuardError::validation("hostname must not be empty"));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let url = Url::parse(&candidate)
        .map_err(|e| GuardError::validation(format!("'{trimmed}' is not a valid address: {e}")))?;

    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.trim_end_matches('.').to_ascii_lowercase(),
        Some(Host::Ipv4(ip)) => return Ok(ip.to_string()),
        _ => {
            return Err(GuardError::validation(format!(
                "'{trimmed}' has no usable hostname"
            )))
        }
    };

    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if !is_domain(&host) {
        return Err(GuardError::validation(format!(
            "'{trimmed}' is not a domain name"
        )));
    }
    Ok(host)
}

fn is_domain(host: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

// ============================================================================
// Listing
// ============================================================================

/// Blocked items of one kind, in stored order.
pub fn items(data: &BlockData, kind: ItemKind) -> Vec<BlockListItem> {
    let raw: Vec<BlockListItem> = match kind {
        ItemKind::App => data.blocked_apps.iter().map(BlockListItem::from).collect(),
        ItemKind::Website => data
            .blocked_websites
            .iter()
            .map(|hostname| BlockListItem::Website {
                hostname: hostname.clone(),
            })
            .collect(),
    };
    dedup(raw)
}

/// Removes later duplicates of the same identity, keeping the first.
pub fn dedup(items: Vec<BlockListItem>) -> Vec<BlockListItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.identity().is_empty() && seen.insert(item.identity()))
        .collect()
}

/// What a row offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowAction {
    /// The unblock delay has passed; the item may be removed.
    Delete,
    /// The unblock delay is running.
    Delaying {
        /// Time left
        remaining: Duration,
    },
    /// The unblock delay has not been started.
    PrepareForDeletion,
}

/// A rendered block list row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockListRow {
    /// The item
    pub item: BlockListItem,
    /// Available action
    pub action: RowAction,
}

/// Builds the rows for one list, deduplicated by identity.
///
/// A row whose countdown status cannot be read offers priming rather than
/// deletion.
pub async fn rows<B: EngineBackend>(store: &SharedStateStore<B>, kind: ItemKind) -> Vec<BlockListRow> {
    let data = store.block_data().await;
    let mut rows = Vec::new();

    for item in items(&data, kind) {
        let identity = item.identity();
        let action = if data.is_allowed_for_unblock(kind, &identity) {
            RowAction::Delete
        } else {
            match store.change_status(&item.setting_key()).await {
                Ok(status) if status.is_changing => RowAction::Delaying {
                    remaining: status.remaining(),
                },
                Ok(_) => RowAction::PrepareForDeletion,
                Err(e) => {
                    tracing::warn!(item = %identity, error = %e, "status unavailable");
                    RowAction::PrepareForDeletion
                }
            }
        };
        rows.push(BlockListRow { item, action });
    }

    rows
}

/// Installed apps that are not blocked yet, sorted by display name.
pub fn available_apps(installed: &[InstalledApp], data: &BlockData) -> Vec<InstalledApp> {
    let blocked: HashSet<String> = data
        .blocked_apps
        .iter()
        .map(|app| app_identity(&app.process_name))
        .collect();

    let mut seen = HashSet::new();
    let mut apps: Vec<InstalledApp> = installed
        .iter()
        .filter(|app| {
            let identity = app_identity(&app.process_name);
            !identity.is_empty() && !blocked.contains(&identity) && seen.insert(identity)
        })
        .cloned()
        .collect();
    apps.sort_by_key(|app| app.display_name.to_lowercase());
    apps
}

/// Case-insensitive display-name search. An empty keyword matches all.
pub fn filter_apps(apps: &[InstalledApp], keyword: &str) -> Vec<InstalledApp> {
    let needle = keyword.trim().to_lowercase();
    apps.iter()
        .filter(|app| needle.is_empty() || app.display_name.to_lowercase().contains(&needle))
        .cloned()
        .collect()
}

// ============================================================================
// BlockListEditor
// ============================================================================

/// Edits block lists through the store and announces the change.
#[derive(Debug)]
pub struct BlockListEditor<B> {
    store: Arc<SharedStateStore<B>>,
    bus: EventBus,
}

impl<B: EngineBackend> BlockListEditor<B> {
    /// Creates an editor.
    pub fn new(store: Arc<SharedStateStore<B>>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Blocks a website. Returns the normalized hostname and whether it was
    /// newly added.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed input (nothing is written),
    /// or the engine error if the list could not be read or saved.
    pub async fn add_website(&self, input: &str) -> Result<(String, bool), GuardError> {
        let hostname = normalize_hostname(input)?;
        let mut data = self.store.try_block_data().await?;

        let exists = data
            .blocked_websites
            .iter()
            .any(|h| normalize_hostname(h).is_ok_and(|n| n == hostname));
        if exists {
            return Ok((hostname, false));
        }

        data.blocked_websites.push(hostname.clone());
        self.save(data).await?;
        tracing::info!(%hostname, "website blocked");
        Ok((hostname, true))
    }

    /// Blocks the selected apps, skipping ones already blocked. Returns how
    /// many were added.
    ///
    /// # Errors
    ///
    /// Returns the engine error if the list could not be read or saved.
    pub async fn add_apps(&self, selected: &[InstalledApp]) -> Result<usize, GuardError> {
        let mut data = self.store.try_block_data().await?;
        let mut known: HashSet<String> = data
            .blocked_apps
            .iter()
            .map(|app| app_identity(&app.process_name))
            .collect();

        let mut added = 0;
        for app in selected {
            let identity = app_identity(&app.process_name);
            if identity.is_empty() || !known.insert(identity) {
                continue;
            }
            data.blocked_apps.push(InstalledApp::new(
                app.process_name.trim(),
                app.display_name.trim(),
            ));
            added += 1;
        }

        if added > 0 {
            self.save(data).await?;
            tracing::info!(added, "apps blocked");
        }
        Ok(added)
    }

    /// Removes an item whose unblock delay has passed. Every entry with the
    /// same identity is removed from both the blocked and the allowed list.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the item has not been allowed for
    /// unblock, or the engine error if the list could not be read or saved.
    pub async fn remove(&self, item: &BlockListItem) -> Result<(), GuardError> {
        let kind = item.kind();
        let identity = item.identity();
        let mut data = self.store.try_block_data().await?;

        if !data.is_allowed_for_unblock(kind, &identity) {
            return Err(GuardError::validation(format!(
                "'{}' must finish its unblock delay before removal",
                item.label()
            )));
        }

        match kind {
            ItemKind::App => data
                .blocked_apps
                .retain(|app| app_identity(&app.process_name) != identity),
            ItemKind::Website => data.blocked_websites.retain(|h| {
                BlockListItem::Website {
                    hostname: h.clone(),
                }
                .identity()
                    != identity
            }),
        }
        data.allowed_list_mut(kind)
            .retain(|entry| !entry.trim().eq_ignore_ascii_case(&identity));

        self.save(data).await?;
        tracing::info!(kind = %kind, item = %identity, "item unblocked");
        Ok(())
    }

    /// Starts the unblock delay for an item.
    ///
    /// # Errors
    ///
    /// Returns the engine error; the command is not retried.
    pub async fn prime(&self, item: &BlockListItem) -> Result<(), GuardError> {
        let identity = item.identity();
        self.store
            .backend()
            .prime_for_deletion(item.kind(), &identity)
            .await?;
        self.store.invalidate_statuses();
        self.bus.publish(BusMessage::TimerUpdated);
        tracing::info!(kind = %item.kind(), item = %identity, "unblock delay started");
        Ok(())
    }

    async fn save(&self, data: BlockData) -> Result<(), GuardError> {
        self.store.save_block_data(data).await?;
        self.bus.publish(BusMessage::ListUpdated);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
