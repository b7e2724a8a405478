//! Device health checks run around each test module.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::device::{DeviceResult, DeviceSession};

/// A check run before and after a test module on the same device.
///
/// Both hooks return `Ok(false)` when the device is in a bad state and
/// `Err` only when the device could not be reached at all.
#[async_trait]
pub trait SystemStatusChecker: Send {
    async fn pre_execution_check(&mut self, session: &DeviceSession) -> DeviceResult<bool>;

    async fn post_execution_check(&mut self, session: &DeviceSession) -> DeviceResult<bool>;
}

/// Detects runtime restarts by comparing the `system_server` pid before and
/// after a module.
#[derive(Debug, Default)]
pub struct SystemServerStatusChecker {
    pid: Option<String>,
}

impl SystemServerStatusChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pid recorded by the last pre-execution check, if valid.
    pub fn recorded_pid(&self) -> Option<&str> {
        self.pid.as_deref()
    }

    async fn system_server_pid(session: &DeviceSession) -> DeviceResult<String> {
        let output = session.execute_shell_command("pidof system_server").await?;
        Ok(output.trim().to_string())
    }
}

fn is_valid_pid(output: &str) -> bool {
    !output.is_empty() && output.parse::<u32>().is_ok()
}

#[async_trait]
impl SystemStatusChecker for SystemServerStatusChecker {
    async fn pre_execution_check(&mut self, session: &DeviceSession) -> DeviceResult<bool> {
        self.pid = None;
        let pid = Self::system_server_pid(session).await?;
        if is_valid_pid(&pid) {
            self.pid = Some(pid);
        } else {
            warn!(
                serial = %session.serial(),
                "Invalid pid response found: '{}'. Skipping the system checker.",
                pid
            );
        }
        Ok(true)
    }

    async fn post_execution_check(&mut self, session: &DeviceSession) -> DeviceResult<bool> {
        let Some(before) = self.pid.as_deref() else {
            debug!(serial = %session.serial(), "No known system_server pid, skipping check");
            return Ok(true);
        };
        let after = Self::system_server_pid(session).await?;
        if before == after {
            return Ok(true);
        }
        warn!(
            serial = %session.serial(),
            "system_server has a different pid after the module run. from {} to {}",
            before,
            after
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::recovery::NoRecovery;
    use crate::device::session::SessionOptions;
    use crate::device::testing::{FakeDevice, FakeResponse};
    use crate::device::RecoveryMode;

    fn session(device: &Arc<FakeDevice>) -> DeviceSession {
        let mut options = SessionOptions::default();
        options.log_capture.max_lines = 0;
        options.retry_attempts = 0;
        options.recovery_mode = RecoveryMode::None;
        DeviceSession::new(device.clone(), Arc::new(NoRecovery), options)
    }

    #[test]
    fn test_is_valid_pid() {
        assert!(is_valid_pid("914"));
        assert!(!is_valid_pid(""));
        assert!(!is_valid_pid("914 1022"));
        assert!(!is_valid_pid("not found"));
    }

    #[tokio::test]
    async fn test_same_pid_passes() {
        let device = FakeDevice::new("S1");
        device.push_stdout("914");
        device.push_stdout("914");
        let session = session(&device);

        let mut checker = SystemServerStatusChecker::new();
        assert!(checker.pre_execution_check(&session).await.unwrap());
        assert_eq!(checker.recorded_pid(), Some("914"));
        assert!(checker.post_execution_check(&session).await.unwrap());
    }

    #[tokio::test]
    async fn test_changed_pid_fails() {
        let device = FakeDevice::new("S1");
        device.push_stdout("914");
        device.push_stdout("2231");
        let session = session(&device);

        let mut checker = SystemServerStatusChecker::new();
        assert!(checker.pre_execution_check(&session).await.unwrap());
        assert!(!checker.post_execution_check(&session).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_pid_skips_post_check() {
        let device = FakeDevice::new("S1");
        device.push_stdout("");
        let session = session(&device);

        let mut checker = SystemServerStatusChecker::new();
        assert!(checker.pre_execution_check(&session).await.unwrap());
        assert!(checker.recorded_pid().is_none());
        assert!(checker.post_execution_check(&session).await.unwrap());
        assert_eq!(device.exec_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_device_is_an_error() {
        let device = FakeDevice::new("S1");
        device.set_default_response(FakeResponse::Fail);
        let session = session(&device);

        let mut checker = SystemServerStatusChecker::new();
        let err = checker.pre_execution_check(&session).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
