use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use olmdev_crypto::{ExportedDevice, InitOptions, OlmDevice};
use olmdev_store::{CryptoStore, EncryptedFileBackend};
use serde::Serialize;
use tracing::info;
use zeroize::Zeroizing;

mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "olmdev", about = "Provision and inspect an end-to-end encryption device")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the encrypted store file, overrides config
    #[arg(long)]
    store: Option<String>,

    /// Passphrase protecting the store file
    #[arg(long, env = "OLMDEV_PASSPHRASE", hide_env_values = true)]
    passphrase: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or load the device and top up its one-time keys
    Init,
    /// Print the device identity keys
    Identity,
    /// Print unpublished one-time keys
    OneTimeKeys {
        /// Generate this many new keys first
        #[arg(long)]
        generate: Option<usize>,
    },
    /// Mark all current one-time and fallback keys as published
    MarkPublished,
    /// Print, rotate or forget the fallback key
    FallbackKey(FallbackArgs),
    /// Sign a message with the device Ed25519 key
    Sign { message: String },
    /// Write the account and pairwise sessions to a JSON file
    ExportDevice { file: PathBuf },
    /// Restore the account and pairwise sessions from a JSON file
    ImportDevice { file: PathBuf },
    /// Write every inbound group session to a JSON file
    ExportRoomKeys { file: PathBuf },
}

#[derive(ClapArgs)]
#[group(multiple = false)]
struct FallbackArgs {
    /// Generate a new fallback key
    #[arg(long)]
    rotate: bool,

    /// Forget the previous fallback key
    #[arg(long)]
    forget: bool,
}

#[derive(Serialize)]
struct Identity<'a> {
    curve25519: &'a str,
    ed25519: &'a str,
    max_one_time_keys: usize,
}

impl<'a> Identity<'a> {
    fn of(device: &'a OlmDevice) -> Self {
        Self {
            curve25519: device.curve25519_key(),
            ed25519: device.ed25519_key(),
            max_one_time_keys: device.max_one_time_keys(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    };

    // CLI overrides
    if let Some(store) = args.store {
        config.store_path = store;
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let passphrase = Zeroizing::new(args.passphrase);

    match args.command {
        Command::Init => {
            let device = open_device(&config, &passphrase, None).await?;
            let unpublished = device.one_time_keys().await?.len();
            let target = config.one_time_key_target.min(device.max_one_time_keys());
            let missing = target.saturating_sub(unpublished);
            if missing > 0 {
                device.generate_one_time_keys(missing).await?;
                info!(generated = missing, "topped up one-time keys");
            }
            print_json(&Identity::of(&device))?;
        }
        Command::Identity => {
            let device = open_device(&config, &passphrase, None).await?;
            print_json(&Identity::of(&device))?;
        }
        Command::OneTimeKeys { generate } => {
            let device = open_device(&config, &passphrase, None).await?;
            if let Some(count) = generate {
                device.generate_one_time_keys(count).await?;
            }
            print_json(&device.one_time_keys().await?)?;
        }
        Command::MarkPublished => {
            let device = open_device(&config, &passphrase, None).await?;
            device.mark_keys_as_published().await?;
            info!("marked keys as published");
        }
        Command::FallbackKey(fallback) => {
            let device = open_device(&config, &passphrase, None).await?;
            if fallback.rotate {
                device.generate_fallback_key().await?;
            }
            if fallback.forget {
                let forgotten = device.forget_old_fallback_key().await?;
                info!(forgotten, "forgot previous fallback key");
            }
            print_json(&device.fallback_key().await?)?;
        }
        Command::Sign { message } => {
            let device = open_device(&config, &passphrase, None).await?;
            println!("{}", device.sign(&message).await?);
        }
        Command::ExportDevice { file } => {
            let device = open_device(&config, &passphrase, None).await?;
            let exported = device.export_device().await?;
            write_json(&file, &exported)?;
            info!(path = %file.display(), sessions = exported.sessions.len(), "device exported");
        }
        Command::ImportDevice { file } => {
            let exported: ExportedDevice = read_json(&file)?;
            let device = open_device(&config, &passphrase, Some(exported)).await?;
            print_json(&Identity::of(&device))?;
        }
        Command::ExportRoomKeys { file } => {
            let device = open_device(&config, &passphrase, None).await?;
            let keys = device.export_room_keys().await?;
            write_json(&file, &keys)?;
            info!(path = %file.display(), count = keys.len(), "room keys exported");
        }
    }

    Ok(())
}

async fn open_device(
    config: &CliConfig,
    passphrase: &str,
    exported_device: Option<ExportedDevice>,
) -> Result<OlmDevice> {
    let backend = EncryptedFileBackend::open_with_iterations(
        &config.store_path,
        passphrase,
        config.pbkdf2_iterations,
    )
    .with_context(|| format!("failed to open store: {}", config.store_path))?;
    let store = CryptoStore::open(backend)
        .with_context(|| format!("failed to load store: {}", config.store_path))?;

    let options = InitOptions {
        pickle_key: config.pickle_key.clone(),
        exported_device,
    };
    OlmDevice::initialize(Arc::new(store), options)
        .await
        .context("failed to initialize device")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}
