//! Configuration loading and schema definitions for devicepool.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. The file format is described on [`Config`].

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or does
/// not match the schema.
///
/// # Example
///
/// ```no_run
/// use devicepool::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("devicepool.toml"))?;
/// println!("Retries: {}", config.session.retry_attempts);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// # Example
///
/// ```
/// use devicepool::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [session]
///     retry_attempts = 5
///
///     [fastboot]
///     poll_interval_ms = 1000
/// "#)?;
///
/// assert_eq!(config.session.retry_attempts, 5);
/// assert_eq!(config.fastboot.poll_interval_ms, 1000);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Renders `config` as TOML.
pub fn to_toml_string(config: &Config) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize config")
}
