//! Fastboot detection.
//!
//! The bridge cannot see a device sitting in the bootloader, so a background
//! [`FastbootReconciler`] polls an external `fastboot devices` probe and pushes
//! [`DeviceState::Fastboot`] into allocated sessions that show up there.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::{Command, ExecResult};
use super::pool::PoolShared;
use super::state::DeviceState;
use crate::config::FastbootConfig;

static FASTBOOT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)\s+fastboot\s*$").expect("fastboot line pattern is valid")
});

/// Result type for fastboot probes.
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Errors raised by a [`FastbootProbe`].
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Fastboot probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to run fastboot probe: {0}")]
    ExecFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lists devices currently in the bootloader.
#[async_trait]
pub trait FastbootProbe: Send + Sync {
    /// Runs the probe, giving up after `timeout`.
    async fn list_devices(&self, timeout: Duration) -> ProbeResult<ExecResult>;
}

/// Runs the host `fastboot` binary.
#[derive(Debug, Clone)]
pub struct FastbootCli {
    command: Command,
}

impl FastbootCli {
    /// Creates a probe from a shell-style command line such as
    /// `"fastboot devices"`.
    pub fn new(command_line: &str) -> Self {
        Self {
            command: Command::parse(command_line),
        }
    }

    pub fn from_config(config: &FastbootConfig) -> Self {
        Self::new(&config.command)
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

impl Default for FastbootCli {
    fn default() -> Self {
        Self::new("fastboot devices")
    }
}

#[async_trait]
impl FastbootProbe for FastbootCli {
    async fn list_devices(&self, timeout: Duration) -> ProbeResult<ExecResult> {
        let start = Instant::now();
        let child = tokio::process::Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProbeError::ExecFailed(format!("{}: {}", self.command.to_shell_string(), e))
            })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ProbeError::Timeout(timeout))??;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }
}

/// Extracts the serials listed as `<serial>  fastboot` in probe output.
///
/// # Example
///
/// ```
/// use devicepool::device::fastboot::parse_fastboot_serials;
///
/// let serials = parse_fastboot_serials("0123456789ABCDEF\tfastboot\nnoise\n");
/// assert!(serials.contains("0123456789ABCDEF"));
/// assert_eq!(serials.len(), 1);
/// ```
pub fn parse_fastboot_serials(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| FASTBOOT_LINE.captures(line.trim_start()))
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Keeps allocated sessions' fastboot state in line with the probe.
pub struct FastbootReconciler {
    shared: Arc<PoolShared>,
    probe: Arc<dyn FastbootProbe>,
    poll_interval: Duration,
    probe_timeout: Duration,
}

impl FastbootReconciler {
    pub(crate) fn new(
        shared: Arc<PoolShared>,
        probe: Arc<dyn FastbootProbe>,
        poll_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            shared,
            probe,
            poll_interval,
            probe_timeout,
        }
    }

    /// Polls until `cancel` fires.
    pub(crate) fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.poll_interval, "Fastboot reconciler started");
            while !cancel.is_cancelled() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.reconcile_once() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
            debug!("Fastboot reconciler stopped");
        })
    }

    /// Runs one probe and applies it. Returns `false` if the probe failed, in
    /// which case no session was touched.
    pub(crate) async fn reconcile_once(&self) -> bool {
        let result = match self.probe.list_devices(self.probe_timeout).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Fastboot probe failed: {}", e);
                return false;
            }
        };
        if !result.success() {
            debug!(exit_code = result.exit_code, "Fastboot probe exited non-zero");
            return false;
        }

        self.apply(&parse_fastboot_serials(&result.stdout));
        true
    }

    fn apply(&self, in_fastboot: &HashSet<String>) {
        for session in self.shared.allocated_sessions() {
            let listed = in_fastboot.contains(session.serial());
            match (listed, session.state()) {
                (true, DeviceState::Fastboot) => {}
                (true, _) => {
                    info!(serial = %session.serial(), "Device entered fastboot");
                    session.set_state(DeviceState::Fastboot);
                }
                (false, DeviceState::Fastboot) => {
                    info!(serial = %session.serial(), "Device left fastboot");
                    session.set_state(DeviceState::NotAvailable);
                }
                (false, _) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::recovery::{DeviceRecovery, NoRecovery};
    use crate::device::session::{DeviceSession, SessionOptions};
    use crate::device::testing::{FakeDevice, ScriptedProbe, eventually};

    fn shared_with(serials: &[&str]) -> Arc<PoolShared> {
        let mut options = SessionOptions::default();
        options.log_capture.max_lines = 0;
        let shared = Arc::new(PoolShared::new(options));
        for serial in serials {
            shared.enqueue(FakeDevice::new(serial));
        }
        shared
    }

    fn allocate(shared: &PoolShared) -> DeviceSession {
        let recovery: Arc<dyn DeviceRecovery> = Arc::new(NoRecovery);
        shared.try_allocate(&recovery).unwrap()
    }

    fn reconciler(shared: &Arc<PoolShared>, probe: &Arc<ScriptedProbe>) -> FastbootReconciler {
        FastbootReconciler::new(
            Arc::clone(shared),
            probe.clone(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_parse_fastboot_serials() {
        let output = "ABC123\tfastboot\n\
                      emulator-5554   fastboot  \n\
                      XYZ\tdevice\n\
                      fastboot\n\
                      \n";
        let serials = parse_fastboot_serials(output);
        assert_eq!(serials.len(), 2);
        assert!(serials.contains("ABC123"));
        assert!(serials.contains("emulator-5554"));
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_fastboot_serials("").is_empty());
    }

    #[tokio::test]
    async fn test_listed_session_enters_fastboot_then_leaves() {
        let shared = shared_with(&["S", "T"]);
        let s = allocate(&shared);
        let t = allocate(&shared);
        let probe = ScriptedProbe::new("S\tfastboot\n");
        let reconciler = reconciler(&shared, &probe);

        assert!(reconciler.reconcile_once().await);
        assert_eq!(s.state(), DeviceState::Fastboot);
        assert_eq!(t.state(), DeviceState::Online);

        probe.set_stdout("");
        assert!(reconciler.reconcile_once().await);
        assert_eq!(s.state(), DeviceState::NotAvailable);
        assert_eq!(t.state(), DeviceState::Online);
    }

    #[tokio::test]
    async fn test_probe_failure_leaves_state_untouched() {
        let shared = shared_with(&["S"]);
        let s = allocate(&shared);
        s.set_state(DeviceState::Fastboot);
        let probe = ScriptedProbe::new("");
        probe.fail();
        let reconciler = reconciler(&shared, &probe);

        assert!(!reconciler.reconcile_once().await);
        assert_eq!(s.state(), DeviceState::Fastboot);
    }

    #[tokio::test]
    async fn test_idle_devices_are_not_touched() {
        let shared = shared_with(&["S"]);
        let probe = ScriptedProbe::new("S fastboot\n");

        assert!(reconciler(&shared, &probe).reconcile_once().await);
        assert!(shared.allocated_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_background_loop_polls_and_stops() {
        let shared = shared_with(&["S"]);
        let s = allocate(&shared);
        let probe = ScriptedProbe::new("S fastboot\n");
        let cancel = CancellationToken::new();
        let task = reconciler(&shared, &probe).spawn(cancel.clone());

        assert!(eventually(|| s.state() == DeviceState::Fastboot).await);

        probe.fail();
        let calls = probe.calls();
        assert!(eventually(|| probe.calls() > calls + 1).await);
        assert_eq!(s.state(), DeviceState::Fastboot);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cli_probe_reports_missing_binary() {
        let probe = FastbootCli::new("definitely-not-a-fastboot-binary devices");
        let err = probe
            .list_devices(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ExecFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_probe_captures_stdout() {
        let probe = FastbootCli::new("echo 'SER1\tfastboot'");
        let result = probe.list_devices(Duration::from_secs(5)).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "SER1\tfastboot");
    }
}
