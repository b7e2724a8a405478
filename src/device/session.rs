//! The per-device wrapper handed out by the pool.
//!
//! A [`DeviceSession`] exclusively owns one device while it is allocated. It
//! runs commands with retries and recovery, waits on pushed connectivity
//! state, reboots the device and keeps a bounded log capture alive.
//!
//! # Command execution
//!
//! ```text
//! attempt 1 ─fail─► attempt 2 ─fail─► ... attempt N+1 ─fail─┐
//!     │ ok                                                   ▼
//!     ▼                                     RecoveryMode::None ─► Unavailable
//!  ExecResult                                         │ otherwise
//!                                                     ▼
//!                                           recovery.recover(mode)
//!                                                     │ ok
//!                                                     ▼
//!                                      one more attempt ─fail─► Unavailable
//! ```
//!
//! A command that exits non-zero is a result, not a failed attempt.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handle::{
    Command, DeviceHandle, ExecResult, OutputCallback, RebootTarget, TransportResult,
    collect_output,
};
use super::logcat::{LogCapture, LogCaptureOptions};
use super::recovery::DeviceRecovery;
use super::state::{DeviceState, DeviceStateMonitor, RecoveryMode};
use super::{DeviceError, DeviceResult};
use crate::config::Config;

/// Per-session defaults derived from configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Retries used by [`DeviceSession::execute_shell_command`].
    pub retry_attempts: u32,
    /// Silence limit used by [`DeviceSession::execute_shell_command`].
    /// Zero means no limit.
    pub max_silence: Duration,
    pub online_timeout: Duration,
    pub available_timeout: Duration,
    pub bootloader_timeout: Duration,
    pub recovery_timeout: Duration,
    pub not_available_timeout: Duration,
    /// Pause between boot-completed probes.
    pub boot_poll_interval: Duration,
    /// Recovery mode a fresh session starts with.
    pub recovery_mode: RecoveryMode,
    pub log_capture: LogCaptureOptions,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        let session = &config.session;
        let pool = &config.pool;
        Self {
            retry_attempts: session.retry_attempts,
            max_silence: Duration::from_secs(session.max_silence_secs),
            online_timeout: Duration::from_secs(session.online_timeout_secs),
            available_timeout: Duration::from_secs(session.available_timeout_secs),
            bootloader_timeout: Duration::from_secs(session.bootloader_timeout_secs),
            recovery_timeout: Duration::from_secs(session.recovery_timeout_secs),
            not_available_timeout: Duration::from_secs(session.not_available_timeout_secs),
            boot_poll_interval: Duration::from_millis(session.boot_poll_interval_ms),
            recovery_mode: pool.default_recovery_mode,
            log_capture: LogCaptureOptions {
                command: Command::parse(&pool.log_capture_command),
                max_lines: pool.log_capture_lines,
                restart_delay: Duration::from_millis(pool.log_capture_restart_ms),
            },
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// An allocated device.
///
/// Cloning is cheap and every clone refers to the same session; the pool keeps
/// one clone in its allocated map.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    monitor: Arc<DeviceStateMonitor>,
    recovery: RwLock<Arc<dyn DeviceRecovery>>,
    recovery_mode: RwLock<RecoveryMode>,
    log_capture: Mutex<Option<LogCapture>>,
    options: SessionOptions,
}

impl DeviceSession {
    pub(crate) fn new(
        handle: Arc<dyn DeviceHandle>,
        recovery: Arc<dyn DeviceRecovery>,
        options: SessionOptions,
    ) -> Self {
        let monitor = Arc::new(DeviceStateMonitor::new(handle, options.boot_poll_interval));
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                monitor,
                recovery: RwLock::new(recovery),
                recovery_mode: RwLock::new(options.recovery_mode),
                log_capture: Mutex::new(None),
                options,
            }),
        }
    }

    /// Unique id of this allocation.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn serial(&self) -> &str {
        self.inner.monitor.serial()
    }

    /// Current connectivity state.
    pub fn state(&self) -> DeviceState {
        self.inner.monitor.state()
    }

    /// The handle currently backing this session.
    pub fn handle(&self) -> Arc<dyn DeviceHandle> {
        self.inner.monitor.handle()
    }

    pub fn monitor(&self) -> &Arc<DeviceStateMonitor> {
        &self.inner.monitor
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn recovery_mode(&self) -> RecoveryMode {
        *self
            .inner
            .recovery_mode
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_recovery_mode(&self, mode: RecoveryMode) {
        *self
            .inner
            .recovery_mode
            .write()
            .unwrap_or_else(|e| e.into_inner()) = mode;
    }

    /// Replaces the recovery strategy.
    pub fn set_recovery(&self, recovery: Arc<dyn DeviceRecovery>) {
        *self
            .inner
            .recovery
            .write()
            .unwrap_or_else(|e| e.into_inner()) = recovery;
    }

    fn recovery(&self) -> Arc<dyn DeviceRecovery> {
        let guard = self.inner.recovery.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub(crate) fn set_state(&self, state: DeviceState) {
        self.inner.monitor.set_state(state);
    }

    pub(crate) fn set_handle(&self, handle: Arc<dyn DeviceHandle>) {
        self.inner.monitor.set_handle(handle);
    }

    pub(crate) fn start_log_capture(&self) {
        let mut capture = self
            .inner
            .log_capture
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if capture.is_none() {
            *capture = Some(LogCapture::start(
                Arc::clone(&self.inner.monitor),
                self.inner.options.log_capture.clone(),
            ));
        }
    }

    pub(crate) fn stop_log_capture(&self) {
        let mut capture = self
            .inner
            .log_capture
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(capture) = capture.as_mut() {
            capture.stop();
        }
    }

    /// Snapshot of the background log capture; empty if none is running.
    pub fn log_capture(&self) -> String {
        let capture = self
            .inner
            .log_capture
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        capture.as_ref().map(LogCapture::snapshot).unwrap_or_default()
    }

    /// Runs `cmd`, retrying and recovering as described in the module docs.
    ///
    /// `max_silence` bounds the wait for each output line; zero disables it.
    pub async fn execute_command(
        &self,
        cmd: &Command,
        retry_attempts: u32,
        max_silence: Duration,
    ) -> DeviceResult<ExecResult> {
        self.run_with_recovery(cmd, None, retry_attempts, max_silence)
            .await
    }

    /// Like [`execute_command`](Self::execute_command), streaming every
    /// output line into `sink` as it arrives.
    pub async fn execute_command_with_sink(
        &self,
        cmd: &Command,
        sink: &OutputCallback,
        retry_attempts: u32,
        max_silence: Duration,
    ) -> DeviceResult<ExecResult> {
        self.run_with_recovery(cmd, Some(sink), retry_attempts, max_silence)
            .await
    }

    /// Runs a shell command line with the configured defaults and returns its
    /// stdout.
    pub async fn execute_shell_command(&self, line: &str) -> DeviceResult<String> {
        let cmd = Command::parse(line);
        let result = self
            .execute_command(
                &cmd,
                self.inner.options.retry_attempts,
                self.inner.options.max_silence,
            )
            .await?;
        Ok(result.stdout)
    }

    async fn run_with_recovery(
        &self,
        cmd: &Command,
        sink: Option<&OutputCallback>,
        retry_attempts: u32,
        max_silence: Duration,
    ) -> DeviceResult<ExecResult> {
        let serial = self.serial();
        let line = cmd.to_shell_string();
        let mut last_error = String::new();

        for attempt in 1..=retry_attempts.saturating_add(1) {
            match self.attempt(cmd, sink, max_silence).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(
                        serial = %serial,
                        session = %self.inner.id,
                        attempt,
                        "Command '{}' failed: {}",
                        line,
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        let mode = self.recovery_mode();
        if mode == RecoveryMode::None {
            return Err(DeviceError::unavailable(
                serial,
                format!(
                    "'{}' failed after {} attempts: {}",
                    line,
                    retry_attempts.saturating_add(1),
                    last_error
                ),
            ));
        }

        info!(serial = %serial, ?mode, "Retries exhausted for '{}', recovering", line);
        self.recovery()
            .recover(&self.inner.monitor, mode)
            .await?;

        self.attempt(cmd, sink, max_silence).await.map_err(|e| {
            DeviceError::unavailable(serial, format!("'{}' failed after recovery: {}", line, e))
        })
    }

    async fn attempt(
        &self,
        cmd: &Command,
        sink: Option<&OutputCallback>,
        max_silence: Duration,
    ) -> TransportResult<ExecResult> {
        let handle = self.handle();
        let stream = handle.exec_stream(cmd).await?;
        let silence = (!max_silence.is_zero()).then_some(max_silence);
        collect_output(stream, self.serial(), silence, sink).await
    }

    /// Waits until the device is exactly in `target`. Never errors.
    pub async fn wait_for_state(&self, target: DeviceState, timeout: Duration) -> bool {
        self.inner.monitor.wait_for_state(target, timeout).await
    }

    pub async fn wait_for_device_online(&self, timeout: Duration) -> DeviceResult<()> {
        if self.inner.monitor.wait_for_online(timeout).await {
            Ok(())
        } else {
            Err(DeviceError::unavailable(
                self.serial(),
                format!("not online after {:?}", timeout),
            ))
        }
    }

    /// Waits until the device is online and has finished booting.
    pub async fn wait_for_device_available(&self, timeout: Duration) -> DeviceResult<()> {
        if self.inner.monitor.wait_for_available(timeout).await {
            Ok(())
        } else {
            Err(DeviceError::unavailable(
                self.serial(),
                format!("not available after {:?}", timeout),
            ))
        }
    }

    pub async fn wait_for_device_not_available(&self, timeout: Duration) -> bool {
        self.inner.monitor.wait_for_not_available(timeout).await
    }

    /// Waits up to the configured not-available timeout for the device to
    /// drop off, e.g. after a reboot issued outside the session.
    pub async fn wait_for_device_shutdown(&self) -> bool {
        self.wait_for_device_not_available(self.inner.options.not_available_timeout)
            .await
    }

    pub async fn wait_for_device_in_recovery(&self, timeout: Duration) -> bool {
        self.inner.monitor.wait_for_recovery(timeout).await
    }

    /// Reboots into the bootloader and waits for the fastboot reconciler to
    /// see it there.
    pub async fn reboot_into_bootloader(&self) -> DeviceResult<()> {
        self.issue_reboot(RebootTarget::Bootloader).await?;
        let timeout = self.inner.options.bootloader_timeout;
        if self.inner.monitor.wait_for_bootloader(timeout).await {
            Ok(())
        } else {
            Err(DeviceError::unavailable(
                self.serial(),
                format!("not in bootloader after {:?}", timeout),
            ))
        }
    }

    /// Reboots into the system image and waits until fully available.
    pub async fn reboot(&self) -> DeviceResult<()> {
        self.issue_reboot(RebootTarget::System).await?;
        self.wait_for_device_available(self.inner.options.available_timeout)
            .await
    }

    pub async fn reboot_into_recovery(&self) -> DeviceResult<()> {
        self.issue_reboot(RebootTarget::Recovery).await?;
        let timeout = self.inner.options.recovery_timeout;
        if self.inner.monitor.wait_for_recovery(timeout).await {
            Ok(())
        } else {
            Err(DeviceError::unavailable(
                self.serial(),
                format!("not in recovery after {:?}", timeout),
            ))
        }
    }

    /// Reboots and returns as soon as the device is online, without waiting
    /// for boot completion.
    pub async fn reboot_until_online(&self) -> DeviceResult<()> {
        self.issue_reboot(RebootTarget::System).await?;
        self.wait_for_device_online(self.inner.options.online_timeout)
            .await
    }

    /// Issues a reboot and returns immediately.
    pub async fn non_blocking_reboot(&self) -> DeviceResult<()> {
        self.issue_reboot(RebootTarget::System).await
    }

    async fn issue_reboot(&self, target: RebootTarget) -> DeviceResult<()> {
        info!(serial = %self.serial(), ?target, "Rebooting device");
        self.set_state(DeviceState::NotAvailable);
        self.handle().reboot(target).await.map_err(|e| {
            DeviceError::unavailable(
                self.serial(),
                format!("reboot into {:?} failed: {}", target, e),
            )
        })?;
        debug!(serial = %self.serial(), ?target, "Reboot issued");
        Ok(())
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.inner.id)
            .field("serial", &self.serial())
            .field("state", &self.state())
            .field("recovery_mode", &self.recovery_mode())
            .finish()
    }
}
