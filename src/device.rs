//! Device allocation, connectivity tracking and recovery.
//!
//! This module owns the fleet of test devices for one process. Devices come
//! from an injected [`DeviceBridge`]; callers borrow them exclusively through
//! a [`DevicePool`] and talk to them through a [`DeviceSession`].
//!
//! # Architecture
//!
//! ```text
//!  DeviceBridge ──events──► DeviceChangeReactor ─┐
//!                                                ├──► DevicePool { queue, allocated }
//!  FastbootProbe ──poll───► FastbootReconciler ──┘            │
//!                                                             ▼ allocate / free
//!                                                      DeviceSession
//!                                                 ┌───────────┼─────────────┐
//!                                                 ▼           ▼             ▼
//!                                        DeviceStateMonitor  DeviceRecovery  LogCapture
//! ```
//!
//! - [`DevicePool`] - FIFO queue of idle handles plus the map of allocated
//!   sessions, guarded together so a serial is never in both
//! - the change reactor - applies bridge connect/disconnect/state events
//! - [`FastbootReconciler`] - polls `fastboot devices` and pushes
//!   [`DeviceState::Fastboot`] into allocated sessions
//! - [`DeviceSession`] - retrying command execution, reboots and recovery
//! - [`DeviceRecovery`] - pluggable policy run once retries are exhausted
//!
//! # Error Handling
//!
//! Session operations return [`DeviceResult<T>`]. The pool and its background
//! tasks never raise [`DeviceError`]; they log and keep running so other
//! devices stay usable.

pub mod fastboot;
pub mod handle;
pub mod logcat;
pub mod pool;
mod reactor;
pub mod recovery;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use fastboot::{FastbootCli, FastbootProbe, FastbootReconciler, ProbeError, ProbeResult};
pub use handle::{
    BridgeDeviceState, BridgeError, BridgeEvent, ChangeMask, Command, DeviceBridge, DeviceHandle,
    ExecResult, ListenerId, OutputCallback, OutputLine, OutputStream, RebootTarget,
    TransportError, TransportResult,
};
pub use logcat::LogCapture;
pub use pool::{DevicePool, PoolError, PoolResult};
pub use recovery::{DeviceRecovery, NoRecovery, WaitDeviceRecovery};
pub use session::{DeviceSession, SessionOptions};
pub use state::{DeviceState, DeviceStateMonitor, RecoveryMode};

/// Result type for device session operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors surfaced by [`DeviceSession`] operations.
///
/// Both variants mean the device is unusable for the current operation.
/// [`DeviceError::RecoveryExhausted`] is the narrower case where a recovery
/// strategy ran and could not reach its target state in time.
///
/// # Example
///
/// ```
/// use devicepool::device::DeviceError;
///
/// let err = DeviceError::recovery_exhausted("emulator-5554", "not online after 30s");
/// assert!(err.is_unavailable());
/// assert!(err.is_recovery_exhausted());
/// assert_eq!(err.serial(), "emulator-5554");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Transport failed and recovery, if configured, did not help.
    #[error("Device {serial} not available: {reason}")]
    Unavailable { serial: String, reason: String },

    /// The recovery strategy could not restore the required state.
    #[error("Recovery of device {serial} failed: {reason}")]
    RecoveryExhausted { serial: String, reason: String },
}

impl DeviceError {
    pub fn unavailable(serial: impl Into<String>, reason: impl Into<String>) -> Self {
        DeviceError::Unavailable {
            serial: serial.into(),
            reason: reason.into(),
        }
    }

    pub fn recovery_exhausted(serial: impl Into<String>, reason: impl Into<String>) -> Self {
        DeviceError::RecoveryExhausted {
            serial: serial.into(),
            reason: reason.into(),
        }
    }

    /// Serial of the device the error refers to.
    pub fn serial(&self) -> &str {
        match self {
            DeviceError::Unavailable { serial, .. } => serial,
            DeviceError::RecoveryExhausted { serial, .. } => serial,
        }
    }

    /// Always `true`: every device error means the device is unavailable.
    pub fn is_unavailable(&self) -> bool {
        true
    }

    /// Returns `true` if a recovery strategy gave up.
    pub fn is_recovery_exhausted(&self) -> bool {
        matches!(self, DeviceError::RecoveryExhausted { .. })
    }
}
