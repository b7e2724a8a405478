//! Recovery strategies run once a session's command retries are exhausted.
//!
//! A strategy never drives the device state itself beyond issuing a reboot:
//! it waits on the session's [`DeviceStateMonitor`] for transitions pushed by
//! the change reactor or the fastboot reconciler.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::handle::RebootTarget;
use super::state::{DeviceState, DeviceStateMonitor, RecoveryMode};
use super::{DeviceError, DeviceResult};
use crate::config::RecoveryConfig;

/// A policy for bringing a device back to a usable state.
#[async_trait]
pub trait DeviceRecovery: Send + Sync {
    /// Blocks until the device reaches the level required by `mode`, or
    /// gives up with [`DeviceError::RecoveryExhausted`].
    async fn recover(&self, monitor: &DeviceStateMonitor, mode: RecoveryMode)
    -> DeviceResult<()>;
}

/// A strategy that never recovers anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecovery;

#[async_trait]
impl DeviceRecovery for NoRecovery {
    async fn recover(
        &self,
        monitor: &DeviceStateMonitor,
        _mode: RecoveryMode,
    ) -> DeviceResult<()> {
        Err(DeviceError::recovery_exhausted(
            monitor.serial(),
            "recovery is disabled",
        ))
    }
}

/// Waits for the bridge to bring the device back, rebooting out of the
/// bootloader or recovery image first if needed.
#[derive(Debug, Clone)]
pub struct WaitDeviceRecovery {
    online_timeout: Duration,
    available_timeout: Duration,
}

impl WaitDeviceRecovery {
    pub fn new(online_timeout: Duration, available_timeout: Duration) -> Self {
        Self {
            online_timeout,
            available_timeout,
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(
            Duration::from_secs(config.online_timeout_secs),
            Duration::from_secs(config.available_timeout_secs),
        )
    }
}

impl Default for WaitDeviceRecovery {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

#[async_trait]
impl DeviceRecovery for WaitDeviceRecovery {
    async fn recover(
        &self,
        monitor: &DeviceStateMonitor,
        mode: RecoveryMode,
    ) -> DeviceResult<()> {
        let serial = monitor.serial();
        if mode == RecoveryMode::None {
            return Ok(());
        }

        info!(serial = %serial, ?mode, "Attempting device recovery");

        let current = monitor.state();
        if matches!(current, DeviceState::Fastboot | DeviceState::Recovery) {
            warn!(serial = %serial, state = %current, "Device stuck outside system image, rebooting");
            monitor
                .handle()
                .reboot(RebootTarget::System)
                .await
                .map_err(|e| {
                    DeviceError::recovery_exhausted(
                        serial,
                        format!("reboot out of {} failed: {}", current, e),
                    )
                })?;
        }

        if !monitor.wait_for_online(self.online_timeout).await {
            return Err(DeviceError::recovery_exhausted(
                serial,
                format!("device not online after {:?}", self.online_timeout),
            ));
        }

        if mode == RecoveryMode::Available && !monitor.wait_for_available(self.available_timeout).await
        {
            return Err(DeviceError::recovery_exhausted(
                serial,
                format!("device not available after {:?}", self.available_timeout),
            ));
        }

        info!(serial = %serial, "Device recovered");
        Ok(())
    }
}
