//! devicepool CLI - inspect fastboot devices and manage configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use devicepool::config::{self, Config};
use devicepool::device::FastbootProbe;
use devicepool::device::fastboot::{FastbootCli, parse_fastboot_serials};

#[derive(Parser)]
#[command(name = "devicepool")]
#[command(about = "Device allocation and recovery for test harnesses", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "devicepool.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fastboot probe once and list devices in the bootloader
    Probe {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Validate configuration file
    Validate,

    /// Write a configuration file with every default spelled out
    Init,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Serialize)]
struct ProbeReport {
    command: String,
    serials: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `probe --format json` stays parseable.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Probe { format } => probe(&cli.config, format).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

/// Loads the config file, falling back to defaults when it does not exist.
fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    } else {
        debug!("{} not found, using defaults", path.display());
        Ok(Config::default())
    }
}

async fn probe(config_path: &Path, format: Format) -> Result<()> {
    let config = load_or_default(config_path)?;
    let cli = FastbootCli::from_config(&config.fastboot);

    let result = cli
        .list_devices(Duration::from_secs(config.fastboot.probe_timeout_secs))
        .await
        .context("Fastboot probe failed")?;
    if !result.success() {
        anyhow::bail!(
            "Fastboot probe exited with code {}: {}",
            result.exit_code,
            result.stderr.trim()
        );
    }

    let mut serials: Vec<String> = parse_fastboot_serials(&result.stdout).into_iter().collect();
    serials.sort();

    match format {
        Format::Json => {
            let report = ProbeReport {
                command: cli.command().to_shell_string(),
                serials,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Format::Text => {
            println!("{} device(s) in fastboot:", serials.len());
            for serial in &serials {
                println!("  {}", serial);
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!(
        "  Default recovery mode: {:?}",
        config.pool.default_recovery_mode
    );
    println!("  Log capture lines: {}", config.pool.log_capture_lines);
    if config.fastboot.enabled {
        println!(
            "  Fastboot probe: {} (every {}ms)",
            config.fastboot.command, config.fastboot.poll_interval_ms
        );
    } else {
        println!("  Fastboot probe: disabled");
    }
    println!("  Retry attempts: {}", config.session.retry_attempts);
    println!(
        "  Aggregate metrics: {}",
        config.results.aggregate_metrics
    );

    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    let body = config::to_toml_string(&Config::default())?;
    let content = format!("# devicepool configuration file\n\n{}", body);
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  devicepool -c {} validate", path.display());

    Ok(())
}
