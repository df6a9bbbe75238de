//! Machine storage CLI - inspect and edit a SQLite storage file.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use machine_storage::{Settings, StorageBackend};
use machine_storage_sqlite::{SqliteBackend, SETTING_PATH};

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "mstore")]
#[command(about = "Machine storage CLI - Inspect and edit plugin storage")]
#[command(version)]
struct Cli {
    /// SQLite database file (overrides SQLITE_PATH from settings)
    #[arg(long, env = "MSTORE_PATH")]
    path: Option<PathBuf>,

    /// JSON file holding backend settings
    #[arg(long, env = "MSTORE_SETTINGS")]
    settings: Option<PathBuf>,

    /// Setting override as KEY=VALUE (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the value stored under a key
    Get {
        /// Fully namespaced key
        key: String,
        /// Print the value base64-encoded
        #[arg(long)]
        base64: bool,
    },
    /// Store a value under a key
    Set {
        /// Fully namespaced key
        key: String,
        /// Value to store
        value: String,
        /// Expiration in seconds
        #[arg(long)]
        expires: Option<u64>,
        /// Decode the value from base64 before storing
        #[arg(long)]
        base64: bool,
    },
    /// Delete a key
    Delete {
        /// Fully namespaced key
        key: String,
    },
    /// Check whether a key holds a live value
    Has {
        /// Fully namespaced key
        key: String,
    },
    /// Print the total storage size in bytes
    Size,
}

// ============================================================================
// Settings
// ============================================================================

/// Builds backend settings: file first, then `--path`, then `--set` overrides.
fn load_settings(
    file: Option<&Path>,
    path: Option<&Path>,
    overrides: &[String],
) -> Result<Settings> {
    let mut settings = match file {
        Some(file) => {
            let raw = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read settings file {}", file.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse settings file {}", file.display()))?;
            Settings::from_json(value)?
        }
        None => Settings::default(),
    };

    if let Some(path) = path {
        let value = serde_json::Value::from(path.to_string_lossy().into_owned());
        let layer: Settings = [(SETTING_PATH, value)].into_iter().collect();
        settings = settings.merged(&layer);
    }

    if !overrides.is_empty() {
        let layer = overrides
            .iter()
            .map(|spec| Settings::parse_override(spec))
            .collect::<Result<Settings, _>>()?;
        settings = settings.merged(&layer);
    }

    Ok(settings)
}

// ============================================================================
// Command Handlers
// ============================================================================

/// Whether the command found what it looked for.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Found,
    Missing,
}

/// Exit status for a missing key, distinct from a storage failure.
const EXIT_MISSING: u8 = 1;

/// Exit status for any error: bad settings, unreachable storage, failed query.
const EXIT_ERROR: u8 = 2;

fn exit_status(result: &Result<Outcome>) -> u8 {
    match result {
        Ok(Outcome::Found) => 0,
        Ok(Outcome::Missing) => EXIT_MISSING,
        Err(_) => EXIT_ERROR,
    }
}

async fn cmd_get(
    backend: &dyn StorageBackend,
    out: &mut impl Write,
    key: &str,
    base64: bool,
) -> Result<Outcome> {
    let Some(value) = backend.get(key).await? else {
        return Ok(Outcome::Missing);
    };

    if base64 {
        writeln!(out, "{}", STANDARD.encode(&value))?;
    } else {
        out.write_all(&value)?;
        writeln!(out)?;
    }

    Ok(Outcome::Found)
}

async fn cmd_set(
    backend: &dyn StorageBackend,
    key: &str,
    value: &str,
    expires: Option<u64>,
    base64: bool,
) -> Result<Outcome> {
    let bytes = if base64 {
        STANDARD
            .decode(value.trim())
            .context("Value is not valid base64")?
    } else {
        value.as_bytes().to_vec()
    };

    backend.set(key, &bytes, expires).await?;
    tracing::info!(key, len = bytes.len(), ?expires, "Value stored");

    Ok(Outcome::Found)
}

async fn cmd_delete(backend: &dyn StorageBackend, key: &str) -> Result<Outcome> {
    backend.delete(key).await?;
    tracing::info!(key, "Key deleted");
    Ok(Outcome::Found)
}

async fn cmd_has(
    backend: &dyn StorageBackend,
    out: &mut impl Write,
    key: &str,
) -> Result<Outcome> {
    let present = backend.has(key).await?;
    writeln!(out, "{present}")?;
    Ok(Outcome::Found)
}

async fn cmd_size(backend: &dyn StorageBackend, out: &mut impl Write) -> Result<Outcome> {
    let size = backend.size().await?;
    writeln!(out, "{size}")?;
    Ok(Outcome::Found)
}

async fn run(backend: &dyn StorageBackend, command: Commands) -> Result<Outcome> {
    let mut out = io::stdout().lock();

    match command {
        Commands::Get { key, base64 } => cmd_get(backend, &mut out, &key, base64).await,
        Commands::Set {
            key,
            value,
            expires,
            base64,
        } => cmd_set(backend, &key, &value, expires, base64).await,
        Commands::Delete { key } => cmd_delete(backend, &key).await,
        Commands::Has { key } => cmd_has(backend, &mut out, &key).await,
        Commands::Size => cmd_size(backend, &mut out).await,
    }
}

// ============================================================================
// Main
// ============================================================================

async fn execute(cli: Cli) -> Result<Outcome> {
    let settings = load_settings(
        cli.settings.as_deref(),
        cli.path.as_deref(),
        &cli.overrides,
    )?;
    if settings.get_str(SETTING_PATH)?.is_none() {
        bail!("No database given. Use --path, MSTORE_PATH or a settings file with SQLITE_PATH");
    }

    let backend = SqliteBackend::open(settings)
        .await
        .context("Failed to open storage")?;

    let result = run(&backend, cli.command).await;
    backend.close().await?;

    result
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout carries only values
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = execute(cli).await;
    if let Err(err) = &result {
        eprintln!("Error: {err:#}");
    }

    ExitCode::from(exit_status(&result))
}
