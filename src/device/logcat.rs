//! Bounded background log capture for an allocated device.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::handle::{Command, OutputLine};
use super::state::DeviceStateMonitor;

/// How a [`LogCapture`] runs.
#[derive(Debug, Clone)]
pub struct LogCaptureOptions {
    /// Long-running command whose stdout is captured.
    pub command: Command,
    /// Lines kept; older lines are dropped. Zero disables capture.
    pub max_lines: usize,
    /// Pause before restarting the command after it exits or fails.
    pub restart_delay: Duration,
}

impl Default for LogCaptureOptions {
    fn default() -> Self {
        Self {
            command: Command::parse("logcat -v threadtime"),
            max_lines: 2000,
            restart_delay: Duration::from_secs(2),
        }
    }
}

/// Captures the tail of a device log while the device is allocated.
///
/// The capture follows handle swaps: every restart asks the monitor for the
/// current handle. Dropping the capture stops it.
pub struct LogCapture {
    serial: String,
    lines: Arc<Mutex<VecDeque<String>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LogCapture {
    /// Starts capturing in a background task.
    pub fn start(monitor: Arc<DeviceStateMonitor>, options: LogCaptureOptions) -> Self {
        let serial = monitor.serial().to_string();
        let lines = Arc::new(Mutex::new(VecDeque::new()));
        let cancel = CancellationToken::new();

        let task = if options.max_lines == 0 {
            None
        } else {
            Some(tokio::spawn(capture_loop(
                monitor,
                options,
                Arc::clone(&lines),
                cancel.clone(),
            )))
        };

        Self {
            serial,
            lines,
            cancel,
            task,
        }
    }

    /// Serial of the captured device.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Captured lines, oldest first, joined with newlines.
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// Number of lines currently held.
    pub fn line_count(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns `true` until [`stop`](Self::stop) is called.
    pub fn is_running(&self) -> bool {
        self.task.is_some() && !self.cancel.is_cancelled()
    }

    /// Stops the background task. Captured lines stay readable.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(serial = %self.serial, "Log capture stopped");
        }
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LogCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCapture")
            .field("serial", &self.serial)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn capture_loop(
    monitor: Arc<DeviceStateMonitor>,
    options: LogCaptureOptions,
    lines: Arc<Mutex<VecDeque<String>>>,
    cancel: CancellationToken,
) {
    let serial = monitor.serial().to_string();

    while !cancel.is_cancelled() {
        let handle = monitor.handle();
        let started = tokio::select! {
            _ = cancel.cancelled() => break,
            started = handle.exec_stream(&options.command) => started,
        };

        match started {
            Ok(mut stream) => loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(OutputLine::Stdout(line)) => {
                        let mut lines = lines.lock().unwrap_or_else(|e| e.into_inner());
                        if lines.len() == options.max_lines {
                            lines.pop_front();
                        }
                        lines.push_back(line);
                    }
                    Some(OutputLine::Stderr(_)) => {}
                    Some(OutputLine::ExitCode(_)) | None => break,
                }
            },
            Err(e) => debug!(serial = %serial, "Log capture failed to start: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(options.restart_delay) => {}
        }
    }
}
