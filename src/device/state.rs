//! Connectivity state of an allocated device and the monitor that waits on it.
//!
//! State is pushed into a [`DeviceStateMonitor`] by the change reactor, the
//! fastboot reconciler, or a reboot/recovery operation. Anything that needs
//! to block until the device reaches a state subscribes to the monitor's
//! `watch` channel, so a push that lands between "check" and "wait" is never
//! lost.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::handle::{BridgeDeviceState, Command, DeviceHandle, collect_output};

/// How long a single boot-completed probe may stay silent.
const BOOT_PROBE_SILENCE: Duration = Duration::from_secs(5);

/// Connectivity state of a device as tracked by the pool.
///
/// ```text
///            ┌──────────── reboot / disconnect ─────────────┐
///            ▼                                               │
///      NotAvailable ──► Online ──► Available ────────────────┤
///            │                                               │
///            ├──► Fastboot  (reconciler)  ───────────────────┤
///            └──► Recovery  (reactor)     ───────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Not visible, or visible but unusable.
    NotAvailable,
    /// Visible to the bridge and accepting commands.
    Online,
    /// Online and fully booted.
    Available,
    /// Sitting in the bootloader.
    Fastboot,
    /// Booted into the recovery image.
    Recovery,
}

impl DeviceState {
    /// Translates a bridge-level state.
    ///
    /// The bridge never reports [`DeviceState::Available`] or
    /// [`DeviceState::Fastboot`] on its own; the first is established by a
    /// boot probe, the second is usually learned from the fastboot reconciler.
    pub fn from_bridge(state: BridgeDeviceState) -> Self {
        match state {
            BridgeDeviceState::Online => DeviceState::Online,
            BridgeDeviceState::Bootloader => DeviceState::Fastboot,
            BridgeDeviceState::Recovery => DeviceState::Recovery,
            BridgeDeviceState::Offline | BridgeDeviceState::Unauthorized => {
                DeviceState::NotAvailable
            }
        }
    }

    /// Returns `true` if a device in this state meets `target`.
    ///
    /// A fully available device also counts as online.
    pub fn satisfies(self, target: DeviceState) -> bool {
        self == target || (target == DeviceState::Online && self == DeviceState::Available)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::NotAvailable => "not_available",
            DeviceState::Online => "online",
            DeviceState::Available => "available",
            DeviceState::Fastboot => "fastboot",
            DeviceState::Recovery => "recovery",
        };
        f.write_str(s)
    }
}

/// The state recovery must restore after command retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    /// Do not attempt recovery; fail as soon as retries run out.
    None,
    /// Recover until the device is online.
    Online,
    /// Recover until the device is online and fully booted.
    #[default]
    Available,
}

/// Tracks one device's connectivity state and current handle.
///
/// The monitor is the per-serial condition variable of the pool: writers call
/// [`set_state`](Self::set_state), waiters park on the watch channel.
pub struct DeviceStateMonitor {
    serial: String,
    handle: RwLock<Arc<dyn DeviceHandle>>,
    state: watch::Sender<DeviceState>,
    boot_poll_interval: Duration,
}

impl DeviceStateMonitor {
    /// Creates a monitor seeded with the handle's current bridge state.
    pub fn new(handle: Arc<dyn DeviceHandle>, boot_poll_interval: Duration) -> Self {
        let serial = handle.serial().to_string();
        let (state, _) = watch::channel(DeviceState::from_bridge(handle.state()));
        Self {
            serial,
            handle: RwLock::new(handle),
            state,
            boot_poll_interval,
        }
    }

    /// Serial of the monitored device.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The handle currently backing this device.
    pub fn handle(&self) -> Arc<dyn DeviceHandle> {
        let guard = self.handle.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swaps in a fresh handle after the bridge re-enumerated the device.
    pub(crate) fn set_handle(&self, handle: Arc<dyn DeviceHandle>) {
        let mut guard = self.handle.write().unwrap_or_else(|e| e.into_inner());
        *guard = handle;
    }

    /// Current state.
    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Pushes a new state and wakes every waiter.
    pub fn set_state(&self, new_state: DeviceState) {
        let old = self.state.send_replace(new_state);
        if old != new_state {
            debug!(serial = %self.serial, from = %old, to = %new_state, "Device state changed");
        }
    }

    /// Waits until the device is exactly in `target`.
    ///
    /// Returns `false` on timeout; never errors.
    pub async fn wait_for_state(&self, target: DeviceState, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s == target).await
    }

    /// Waits until the device is online (or better).
    pub async fn wait_for_online(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.satisfies(DeviceState::Online))
            .await
    }

    /// Waits until the device drops off.
    pub async fn wait_for_not_available(&self, timeout: Duration) -> bool {
        self.wait_for_state(DeviceState::NotAvailable, timeout).await
    }

    /// Waits until the device shows up in the bootloader.
    pub async fn wait_for_bootloader(&self, timeout: Duration) -> bool {
        self.wait_for_state(DeviceState::Fastboot, timeout).await
    }

    /// Waits until the device is in recovery.
    pub async fn wait_for_recovery(&self, timeout: Duration) -> bool {
        self.wait_for_state(DeviceState::Recovery, timeout).await
    }

    /// Waits until the device is online and reports boot completion.
    ///
    /// On success the monitor is moved to [`DeviceState::Available`]. If the
    /// device drops off while being probed, the wait resumes for the time
    /// remaining.
    pub async fn wait_for_available(&self, timeout: Duration) -> bool {
        // No deadline when `timeout` is too large to add to now.
        let deadline = Instant::now().checked_add(timeout);
        let remaining =
            move || deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));

        loop {
            if !self.wait_for_online(remaining()).await {
                return false;
            }
            if self.state() == DeviceState::Available {
                return true;
            }
            let completed = match tokio::time::timeout(remaining(), self.boot_completed()).await {
                Ok(completed) => completed,
                Err(_) => {
                    debug!(serial = %self.serial, "Boot probe outlived the wait");
                    return false;
                }
            };
            if completed {
                self.state.send_if_modified(|s| {
                    if *s == DeviceState::Online {
                        *s = DeviceState::Available;
                        true
                    } else {
                        false
                    }
                });
                if self.state() == DeviceState::Available {
                    debug!(serial = %self.serial, "Device is available");
                    return true;
                }
                continue;
            }

            let remaining = remaining();
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(self.boot_poll_interval.min(remaining)).await;
        }
    }

    async fn wait_until(&self, timeout: Duration, mut pred: impl FnMut(DeviceState) -> bool) -> bool {
        let mut rx = self.state.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| pred(*s))).await,
            Ok(Ok(_))
        )
    }

    async fn boot_completed(&self) -> bool {
        let handle = self.handle();
        let cmd = Command::new("getprop").arg("sys.boot_completed");
        let stream = match handle.exec_stream(&cmd).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(serial = %self.serial, "Boot probe failed to start: {}", e);
                return false;
            }
        };
        match collect_output(stream, &self.serial, Some(BOOT_PROBE_SILENCE), None).await {
            Ok(result) => result.stdout.trim() == "1",
            Err(e) => {
                debug!(serial = %self.serial, "Boot probe failed: {}", e);
                false
            }
        }
    }
}

impl std::fmt::Debug for DeviceStateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStateMonitor")
            .field("serial", &self.serial)
            .field("state", &self.state())
            .finish()
    }
}
