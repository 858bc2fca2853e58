//! Eagle Guard CLI - parental-control protections that only weaken after a delay
//!
//! Turning a protection off, shortening the delay, or unblocking an app or
//! website has to be confirmed and only takes effect once the delay passes:
//! - `eagle-guard daemon` runs the engine that owns the countdowns
//! - every other command talks to it over a Unix socket

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser};

use eagle_guard::blocklist::{self, normalize_hostname, BlockListItem};
use eagle_guard::cli::{Cli, Commands, Display, Session};
use eagle_guard::config::GuardConfig;
use eagle_guard::coordinator::ChangeOutcome;
use eagle_guard::daemon;
use eagle_guard::types::{InstalledApp, ItemKind, SettingKey, PROTECTED_PREFERENCES};

/// Main entry point
#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Parse command line arguments
    let cli = Cli::parse();

    let config = match GuardConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            Display::show_error(&format!("failed to load configuration: {e}"));
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_tracing(&config, cli.verbose);

    // Execute command
    if let Err(e) = execute(cli, config).await {
        Display::show_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

/// Initializes the tracing subscriber for logging.
fn init_tracing(config: &GuardConfig, verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

/// Executes the CLI command.
async fn execute(cli: Cli, config: GuardConfig) -> Result<()> {
    if cli.verbose {
        tracing::info!("Verbose mode enabled");
    }

    let socket_path = cli
        .socket
        .clone()
        .unwrap_or_else(|| config.resolved_socket_path());

    let Some(command) = cli.command else {
        // No command provided, show help
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Commands::Daemon => {
            daemon::run(&config, &socket_path).await?;
        }
        Commands::Completions { shell } => {
            generate_completions(shell);
        }
        command => {
            let session = Session::connect(&config, socket_path);
            run_client(&session, command).await?;
        }
    }

    Ok(())
}

/// Runs a command against the daemon.
async fn run_client(session: &Session, command: Commands) -> Result<()> {
    let coordinator = session.coordinator();
    let store = session.store();

    match command {
        Commands::Status { key } => {
            let keys = match key {
                Some(key) => vec![key],
                None => protection_keys(),
            };
            for key in keys {
                let status = store.change_status(&key).await?;
                Display::show_status(&key, &status);
            }
        }
        Commands::Request { key, value, yes } => {
            let outcome = coordinator.request_change(&key, value).await?;
            Display::show_outcome(&key, &outcome);
            if yes {
                follow_outcome(session, key, &outcome).await?;
            }
        }
        Commands::Confirm { key } => {
            if key == SettingKey::DelayTimeout {
                bail!("the new delay is chosen with 'eagle-guard set-delay'");
            }
            session.confirm(key).await?;
        }
        Commands::Cancel { key } => {
            coordinator.cancel_delay(&key).await?;
            Display::show_cancelled(&key);
        }
        Commands::Watch { key } => {
            if !session.watch(key.clone()).await? {
                println!("No delay is running for {key}");
            }
        }
        Commands::Prime { kind, name } => {
            let item = list_item(session, kind.into(), &name).await?;
            session.editor().prime(&item).await?;
            Display::show_success(&format!(
                "Unblock delay started for {}; run 'eagle-guard unblock' once it has passed",
                item.label()
            ));
        }
        Commands::BlockWebsite { url } => {
            let (hostname, added) = session.editor().add_website(&url).await?;
            if added {
                Display::show_success(&format!("Blocked {hostname}"));
            } else {
                println!("{hostname} is already blocked");
            }
        }
        Commands::BlockApp { process, name } => {
            let display_name = match name {
                Some(name) => name,
                None => installed_name(session, &process).await,
            };
            let added = session
                .editor()
                .add_apps(&[InstalledApp::new(process.trim(), display_name)])
                .await?;
            if added > 0 {
                Display::show_success(&format!("Blocked {}", process.trim()));
            } else {
                println!("{} is already blocked", process.trim());
            }
        }
        Commands::Unblock { kind, name } => {
            let item = list_item(session, kind.into(), &name).await?;
            session.editor().remove(&item).await?;
            Display::show_success(&format!("Unblocked {}", item.label()));
        }
        Commands::List { kind } => {
            let kind = ItemKind::from(kind);
            let rows = blocklist::rows(store, kind).await;
            Display::show_rows(kind, &rows);
        }
        Commands::AvailableApps { search } => {
            let installed = store.installed_apps().await;
            let data = store.block_data().await;
            let apps = blocklist::available_apps(&installed, &data);
            let apps = match search {
                Some(keyword) => blocklist::filter_apps(&apps, &keyword),
                None => apps,
            };
            Display::show_apps(&apps);
        }
        Commands::SetDelay(args) => {
            let outcome = coordinator.change_delay_timeout(args.selection()).await?;
            Display::show_outcome(&SettingKey::DelayTimeout, &outcome);
            follow_outcome(session, SettingKey::DelayTimeout, &outcome).await?;
        }
        Commands::EnableDns { strict } => {
            let strictness = Commands::dns_strictness(strict);
            coordinator.enable_protective_dns(strictness).await?;
            Display::show_success(&format!(
                "Protective DNS enabled ({})",
                strictness.as_str()
            ));
        }
        Commands::Daemon | Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Starts or follows the delay a change request asked for.
async fn follow_outcome(session: &Session, key: SettingKey, outcome: &ChangeOutcome) -> Result<()> {
    match outcome {
        ChangeOutcome::ConfirmationRequired => session.confirm(key).await?,
        ChangeOutcome::AlreadyDelaying(_) => {
            session.watch(key).await?;
        }
        _ => {}
    }
    Ok(())
}

/// The delay timeout followed by every protected switch.
fn protection_keys() -> Vec<SettingKey> {
    std::iter::once(SettingKey::DelayTimeout)
        .chain(PROTECTED_PREFERENCES.iter().map(|name| SettingKey::preference(*name)))
        .collect()
}

/// Looks up a block list entry by process name or website.
async fn list_item(session: &Session, kind: ItemKind, name: &str) -> Result<BlockListItem> {
    let item = match kind {
        ItemKind::App => {
            let identity = blocklist::app_identity(name);
            session
                .store()
                .block_data()
                .await
                .blocked_apps
                .iter()
                .find(|app| blocklist::app_identity(&app.process_name) == identity)
                .map(BlockListItem::from)
                .unwrap_or(BlockListItem::App {
                    process_name: identity,
                    display_name: String::new(),
                })
        }
        ItemKind::Website => BlockListItem::Website {
            hostname: normalize_hostname(name)?,
        },
    };
    Ok(item)
}

/// Display name of an installed app, or the process name.
async fn installed_name(session: &Session, process: &str) -> String {
    let identity = blocklist::app_identity(process);
    session
        .store()
        .installed_apps()
        .await
        .into_iter()
        .find(|app| blocklist::app_identity(&app.process_name) == identity)
        .map(|app| app.display_name)
        .unwrap_or_else(|| process.trim().to_string())
}

/// Generates shell completion scripts.
fn generate_completions(shell: clap_complete::Shell) {
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();
    generate(shell, &mut cmd, bin_name, &mut io::stdout());
}

// ============================================================================
// Tests
// ============================================================================
