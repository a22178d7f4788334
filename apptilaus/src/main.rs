//! apptilaus - host harness for the Apptilaus analytics client
//!
//! This tool provides commands for:
//! - Checking client configuration and session state
//! - Registering an install/session
//! - Reporting a purchase
//! - Sending an opt-out request
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/apptilaus/config.toml (~/.config/apptilaus/config.toml)
//! - Markers: $XDG_DATA_HOME/apptilaus/markers.json (~/.local/share/apptilaus/markers.json)
//! - Logs: $XDG_STATE_HOME/apptilaus/apptilaus.log.YYYY-MM-DD (~/.local/state/apptilaus/)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use apptilaus_core::session::SessionGate;
use apptilaus_core::store::LAST_SESSION_KEY;
use apptilaus_core::{
    Apptilaus, Config, DispatchHandle, DispatchStatus, FileMarkerStore, MarkerStore, Product,
    StaticDeviceProvider,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "apptilaus")]
#[command(about = "Send Apptilaus analytics events from the command line")]
#[command(version)]
struct Args {
    /// Write logs to the state directory and echo them to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show client configuration and session state
    Status,

    /// Register an install or session (at most once per UTC day)
    Session,

    /// Report a completed purchase
    Purchase {
        /// Localized price
        #[arg(long)]
        price: f64,

        /// ISO 4217 currency code
        #[arg(long)]
        currency: String,

        /// Store product identifier
        #[arg(long)]
        item: String,

        /// Store transaction identifier
        #[arg(long)]
        transaction: String,

        /// File containing the unified receipt JSON
        #[arg(long)]
        receipt: Option<PathBuf>,

        /// Custom parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Ask Apptilaus to forget this device
    Optout,

    /// Forget the last session registration
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(
            apptilaus_core::logging::init(&config.logging, true)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };
    tracing::debug!(path = %Config::config_path().display(), "Configuration loaded");

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Session => cmd_session(&config).await,
        Command::Purchase {
            price,
            currency,
            item,
            transaction,
            receipt,
            params,
        } => {
            let receipt = match receipt {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read receipt {}", path.display()))?,
                ),
                None => None,
            };
            let product = Product {
                localized_price: price,
                iso_currency_code: currency,
                store_specific_id: item,
                transaction_id: transaction,
                receipt,
            };
            cmd_purchase(&config, product, params).await
        }
        Command::Optout => cmd_optout(&config).await,
        Command::Reset => cmd_reset(),
    }
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

/// Build a client from config, set up when credentials are present.
fn build_client(
    config: &Config,
    session_tracking: bool,
) -> Result<(Apptilaus, Option<DispatchHandle>)> {
    let store =
        FileMarkerStore::open(Config::marker_path()).context("failed to open marker store")?;
    let provider = StaticDeviceProvider::from_config(&config.device);

    let client = Apptilaus::builder(config.client.clone())
        .device_provider(Arc::new(provider))
        .marker_store(Arc::new(store))
        .build()
        .context("failed to create client")?;

    if !config.client.has_credentials() {
        println!("Client is not set up: app_id and app_token are missing from config.toml");
        return Ok((client, None));
    }

    let session = client
        .setup(&config.client.app_id, &config.client.app_token, session_tracking)
        .context("failed to set up client")?;
    Ok((client, session))
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Apptilaus Client Configuration");
    println!("==============================");
    println!();

    let client = &config.client;

    println!("Base URL:        {}", client.base_url);
    println!("Session URL:     {}", client.session_url);
    println!("Platform:        {:?}", client.platform);
    println!(
        "App ID:          {}",
        if client.app_id.is_empty() {
            "<not set>"
        } else {
            client.app_id.as_str()
        }
    );
    println!(
        "App Token:       {}",
        if client.app_token.is_empty() {
            "<not set>"
        } else {
            "<set>"
        }
    );
    println!(
        "User ID:         {}",
        client.user_id.as_deref().unwrap_or("<not set>")
    );
    println!("Max Retries:     {}", client.max_retry_count);
    println!("SDK Version:     {}", client.sdk_version);
    println!("Log Directory:   {}", Config::state_dir().display());

    println!();
    if client.has_credentials() {
        println!("Status: Ready");
    } else {
        println!("Status: Not ready (missing app_id or app_token)");
    }

    let marker_path = Config::marker_path();
    let store = FileMarkerStore::open(&marker_path).context("failed to open marker store")?;
    let last_session = SessionGate::new(Arc::new(store))
        .last_registered()
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    match last_session {
        Some(ts) => println!(
            "Last Session:    {}",
            ts.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("Last Session:    never"),
    }

    Ok(())
}

async fn cmd_session(config: &Config) -> Result<()> {
    let (_client, session) = build_client(config, true)?;

    if let Some(handle) = session {
        report(handle.wait().await);
    }
    Ok(())
}

async fn cmd_purchase(
    config: &Config,
    product: Product,
    params: Vec<(String, String)>,
) -> Result<()> {
    let (client, _) = build_client(config, false)?;

    println!(
        "Reporting purchase {} ({:.2} {})",
        product.transaction_id, product.localized_price, product.iso_currency_code
    );
    report(client.purchase(product, params).wait().await);
    Ok(())
}

async fn cmd_optout(config: &Config) -> Result<()> {
    let (client, _) = build_client(config, false)?;

    let status = client
        .opt_out(Some(Box::new(|success, error| {
            if success {
                println!("Opt-out accepted");
            } else {
                println!("Opt-out failed: {}", error);
            }
        })))
        .wait()
        .await;
    report(status);
    Ok(())
}

fn cmd_reset() -> Result<()> {
    let marker_path = Config::marker_path();
    if !marker_path.exists() {
        println!("No session marker at {}", marker_path.display());
        return Ok(());
    }

    let store = FileMarkerStore::open(&marker_path).context("failed to open marker store")?;
    store.remove(LAST_SESSION_KEY);
    store.flush().context("failed to write marker store")?;

    println!("Session marker cleared; the next session registers again");
    Ok(())
}

fn report(status: DispatchStatus) {
    match status {
        DispatchStatus::Sent { attempts } => println!("Result: sent ({} attempt(s))", attempts),
        DispatchStatus::Skipped => println!("Result: skipped (already registered today)"),
        DispatchStatus::Rejected { reason } => println!("Result: rejected: {}", reason),
        DispatchStatus::Dropped { attempts, reason } => {
            println!("Result: dropped after {} attempt(s): {}", attempts, reason)
        }
        DispatchStatus::NotReady => println!("Result: not sent (client is not set up)"),
    }
}
