//! Configuration schema definitions for devicepool.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── PoolConfig        - Allocation defaults and background log capture
//! ├── FastbootConfig    - Fastboot probe command and polling
//! ├── SessionConfig     - Command retries and wait timeouts
//! ├── RecoveryConfig    - Deadlines for the wait-for-device recovery
//! └── ResultsConfig     - Run result aggregation
//! ```

use serde::{Deserialize, Serialize};

use crate::device::RecoveryMode;

/// Root configuration structure.
///
/// Every section is optional.
///
/// # TOML Structure
///
/// ```toml
/// [pool]
/// default_recovery_mode = "available"
/// log_capture_lines = 2000
///
/// [fastboot]
/// command = "fastboot devices"
/// poll_interval_ms = 5000
///
/// [session]
/// retry_attempts = 2
/// max_silence_secs = 120
///
/// [recovery]
/// online_timeout_secs = 480
///
/// [results]
/// aggregate_metrics = true
/// ```
///
/// # Example
///
/// ```
/// use devicepool::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [pool]
///     default_recovery_mode = "none"
/// "#).unwrap();
/// assert_eq!(config.fastboot.command, "fastboot devices");
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub fastboot: FastbootConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub results: ResultsConfig,
}

impl Config {
    /// Checks values that parse but cannot work.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fastboot.enabled {
            if self.fastboot.command.trim().is_empty() {
                anyhow::bail!("fastboot.command must not be empty");
            }
            if self.fastboot.poll_interval_ms == 0 {
                anyhow::bail!("fastboot.poll_interval_ms must be greater than zero");
            }
        }
        if self.pool.log_capture_lines > 0 && self.pool.log_capture_command.trim().is_empty() {
            anyhow::bail!("pool.log_capture_command must not be empty when capture is enabled");
        }
        if self.session.boot_poll_interval_ms == 0 {
            anyhow::bail!("session.boot_poll_interval_ms must be greater than zero");
        }
        Ok(())
    }
}

/// Allocation defaults.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `default_recovery_mode` | `"available"` |
/// | `log_capture_lines` | 2000 (0 disables capture) |
/// | `log_capture_command` | `"logcat -v threadtime"` |
/// | `log_capture_restart_ms` | 2000 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Recovery mode every newly allocated session starts with.
    #[serde(default)]
    pub default_recovery_mode: RecoveryMode,

    /// Lines of device log kept per allocated session.
    #[serde(default = "default_log_capture_lines")]
    pub log_capture_lines: usize,

    /// Device command streamed into the log capture.
    #[serde(default = "default_log_capture_command")]
    pub log_capture_command: String,

    /// Pause before restarting the log command after it exits.
    #[serde(default = "default_log_capture_restart")]
    pub log_capture_restart_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_recovery_mode: RecoveryMode::default(),
            log_capture_lines: default_log_capture_lines(),
            log_capture_command: default_log_capture_command(),
            log_capture_restart_ms: default_log_capture_restart(),
        }
    }
}

fn default_log_capture_lines() -> usize {
    2000
}

fn default_log_capture_command() -> String {
    "logcat -v threadtime".to_string()
}

fn default_log_capture_restart() -> u64 {
    2000
}

/// Fastboot detection.
///
/// # Example
///
/// ```toml
/// [fastboot]
/// command = "/opt/platform-tools/fastboot devices"
/// poll_interval_ms = 5000
/// probe_timeout_secs = 60
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FastbootConfig {
    /// Whether the pool runs the fastboot reconciler at all.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Command line that lists devices in the bootloader.
    ///
    /// Default: `"fastboot devices"`
    #[serde(default = "default_fastboot_command")]
    pub command: String,

    /// Pause between probes.
    ///
    /// Default: 5000
    #[serde(default = "default_fastboot_poll_interval")]
    pub poll_interval_ms: u64,

    /// Deadline for one probe.
    ///
    /// Default: 60
    #[serde(default = "default_fastboot_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for FastbootConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_fastboot_command(),
            poll_interval_ms: default_fastboot_poll_interval(),
            probe_timeout_secs: default_fastboot_probe_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_fastboot_command() -> String {
    "fastboot devices".to_string()
}

fn default_fastboot_poll_interval() -> u64 {
    5000
}

fn default_fastboot_probe_timeout() -> u64 {
    60
}

/// Command retries and the timeouts used by session waits and reboots.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `retry_attempts` | 2 |
/// | `max_silence_secs` | 120 |
/// | `online_timeout_secs` | 60 |
/// | `available_timeout_secs` | 360 |
/// | `bootloader_timeout_secs` | 90 |
/// | `recovery_timeout_secs` | 120 |
/// | `not_available_timeout_secs` | 60 |
/// | `boot_poll_interval_ms` | 5000 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Retries for `execute_shell_command`; a command gets this many plus one
    /// attempts before recovery.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Longest a command may go without output. Zero disables the limit.
    #[serde(default = "default_max_silence")]
    pub max_silence_secs: u64,

    #[serde(default = "default_online_timeout")]
    pub online_timeout_secs: u64,

    #[serde(default = "default_available_timeout")]
    pub available_timeout_secs: u64,

    #[serde(default = "default_bootloader_timeout")]
    pub bootloader_timeout_secs: u64,

    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    #[serde(default = "default_not_available_timeout")]
    pub not_available_timeout_secs: u64,

    /// Pause between boot-completed probes while waiting for availability.
    #[serde(default = "default_boot_poll_interval")]
    pub boot_poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            max_silence_secs: default_max_silence(),
            online_timeout_secs: default_online_timeout(),
            available_timeout_secs: default_available_timeout(),
            bootloader_timeout_secs: default_bootloader_timeout(),
            recovery_timeout_secs: default_recovery_timeout(),
            not_available_timeout_secs: default_not_available_timeout(),
            boot_poll_interval_ms: default_boot_poll_interval(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_max_silence() -> u64 {
    120
}

fn default_online_timeout() -> u64 {
    60
}

fn default_available_timeout() -> u64 {
    360 // 6 minutes
}

fn default_bootloader_timeout() -> u64 {
    90
}

fn default_recovery_timeout() -> u64 {
    120
}

fn default_not_available_timeout() -> u64 {
    60
}

fn default_boot_poll_interval() -> u64 {
    5000
}

/// Deadlines for [`WaitDeviceRecovery`](crate::device::WaitDeviceRecovery).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
    /// Default: 480 (8 minutes)
    #[serde(default = "default_recovery_online_timeout")]
    pub online_timeout_secs: u64,

    /// Default: 360 (6 minutes)
    #[serde(default = "default_available_timeout")]
    pub available_timeout_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            online_timeout_secs: default_recovery_online_timeout(),
            available_timeout_secs: default_available_timeout(),
        }
    }
}

fn default_recovery_online_timeout() -> u64 {
    480
}

/// Run result aggregation.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResultsConfig {
    /// Sum numeric run metrics across re-runs instead of overwriting them.
    ///
    /// Default: `false`
    #[serde(default)]
    pub aggregate_metrics: bool,
}
