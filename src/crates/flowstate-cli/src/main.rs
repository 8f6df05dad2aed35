//! # flowstate-cli
//!
//! Inspect checkpoints and client-side tokens, and check storage settings.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowstate::{
    inspect, inspect_with_limit, CheckpointSummary, CompressionLevel, StorageSettings, TokenStore,
};
use std::path::{Path, PathBuf};
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "flowstate")]
#[command(about = "Inspect flowstate checkpoints and storage settings", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "FLOWSTATE_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a checkpoint file
    Inspect {
        /// Path to the raw checkpoint bytes
        file: PathBuf,
    },

    /// Open a client-side token and summarize the checkpoint inside
    Token {
        /// The token as issued to the client
        token: String,

        /// Settings file the token's transforms are taken from
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Compression level, when no settings file is given
        #[arg(long)]
        compression: Option<String>,

        /// Environment variable holding the base64 integrity key
        #[arg(long)]
        integrity_key_env: Option<String>,
    },

    /// Validate a settings file and print the effective settings
    Config {
        /// Path to YAML or JSON settings
        file: PathBuf,
    },

    /// Create the checkpoint table of a durable backend
    InitDb {
        /// Path to YAML or JSON settings
        file: PathBuf,
    },
}

fn log_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(log_level(&cli.log_level))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            print_summary(&inspect(&bytes)?);
        }
        Commands::Token {
            token,
            config,
            compression,
            integrity_key_env,
        } => {
            let settings = token_settings(config.as_deref(), compression, integrity_key_env)?;
            let mut store = TokenStore::new();
            if let Some(pipeline) = settings.build_pipeline()? {
                debug!(transforms = ?pipeline.names(), "Opening token");
                store = store.with_pipeline(pipeline);
            }
            let Some((scope, state)) = store.open(&token)? else {
                bail!("Not a checkpoint token");
            };
            println!("scope: {}", scope);
            print_summary(&inspect_with_limit(&state, settings.max_checkpoint_bytes)?);
        }
        Commands::Config { file } => {
            let settings = StorageSettings::load(&file)?;
            print!("{}", serde_yaml::to_string(&settings)?);
        }
        Commands::InitDb { file } => {
            let settings = StorageSettings::load(&file)?;
            if settings.backend != flowstate::Backend::Durable {
                bail!("{} does not configure a durable backend", file.display());
            }
            settings.open_store().await?;
            println!("Table {} is ready", settings.table_name);
        }
    }

    Ok(())
}

fn token_settings(
    config: Option<&Path>,
    compression: Option<String>,
    integrity_key_env: Option<String>,
) -> Result<StorageSettings> {
    let mut settings = match config {
        Some(path) => StorageSettings::load(path)?,
        None => StorageSettings::default(),
    };
    if let Some(level) = compression {
        let level: CompressionLevel = serde_yaml::from_str(&level)
            .with_context(|| format!("Unknown compression level {:?}", level))?;
        settings.transforms.compression = Some(level);
    }
    if let Some(var) = integrity_key_env {
        settings.transforms.integrity_key_env = Some(var);
    }
    Ok(settings)
}

fn print_summary(summary: &CheckpointSummary) {
    println!("format version: {}", summary.version);
    println!("size: {} bytes", summary.size);
    println!("frames (innermost first):");
    for fingerprint in &summary.fingerprints {
        println!("  {}", fingerprint);
    }
    println!("stubs:");
    for stub in &summary.stubs {
        println!("  {}", stub);
    }
    if !summary.excluded.is_empty() {
        println!("excluded: {}", summary.excluded.join(", "));
    }
}
