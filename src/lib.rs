//! devicepool: device allocation and run-result tracking for test harnesses.
//!
//! The crate hands a fleet of test devices out to test runs one at a time,
//! keeps their connectivity state in line with what the device bridge and a
//! fastboot probe report, recovers them when commands stop working, and
//! aggregates per-test outcomes for reporting.
//!
//! # Architecture
//!
//! - **Device pool** ([`device::DevicePool`]): FIFO allocation queue plus
//!   background reconcilers fed by the bridge and the fastboot probe
//! - **Sessions** ([`device::DeviceSession`]): retrying command execution,
//!   state waits, reboots and pluggable recovery
//! - **Results** ([`result::TestRunResult`]): ordered per-test outcomes with
//!   cached counts and metric aggregation across re-runs
//! - **Checkers** ([`checker`]): health checks run around a test module
//!
//! The device bridge itself (adb or an equivalent) is injected through the
//! [`device::DeviceBridge`] and [`device::DeviceHandle`] traits.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use devicepool::config::load_config;
//! use devicepool::device::{DeviceBridge, DevicePool, FastbootCli, WaitDeviceRecovery};
//!
//! async fn run(bridge: Arc<dyn DeviceBridge>) -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("devicepool.toml"))?;
//!     let probe = Arc::new(FastbootCli::from_config(&config.fastboot));
//!     let pool = DevicePool::start(bridge, probe, &config).await?;
//!
//!     let recovery = Arc::new(WaitDeviceRecovery::from_config(&config.recovery));
//!     if let Some(session) = pool.allocate(recovery).await {
//!         let build = session.execute_shell_command("getprop ro.build.id").await?;
//!         println!("{}: {}", session.serial(), build.trim());
//!         pool.free(session);
//!     }
//!     pool.terminate().await;
//!     Ok(())
//! }
//! ```

pub mod checker;
pub mod config;
pub mod device;
pub mod result;

// Re-export commonly used types
pub use checker::{SystemServerStatusChecker, SystemStatusChecker};
pub use config::{Config, load_config};
pub use device::{DeviceError, DevicePool, DeviceResult, DeviceSession, DeviceState, RecoveryMode};
pub use result::{TestDescription, TestRunResult, TestStatus};
