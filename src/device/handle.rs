//! Boundary types for the device bridge and the per-device transport.
//!
//! Nothing in this module talks to a real device. The traits here are the
//! seams where an adb/fastboot backend plugs in:
//!
//! - [`DeviceBridge`] - enumerates handles and pushes connect, disconnect and
//!   state-change notifications
//! - [`DeviceHandle`] - one visible device: its serial, its bridge-level state,
//!   and the transport used to run commands and reboot it
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       DeviceBridge                            │
//! │                                                               │
//! │  devices() ───────────────► Vec<Arc<dyn DeviceHandle>>        │
//! │  add_listener(tx) ────────► BridgeEvent stream                │
//! └────────────────────────────────┬──────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       DeviceHandle                            │
//! │                                                               │
//! │  exec_stream(Command) ───► OutputStream                       │
//! │  reboot(RebootTarget)                                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by a [`DeviceHandle`] transport.
///
/// Every variant counts as one failed attempt for
/// [`DeviceSession::execute_command`](super::DeviceSession::execute_command).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The command produced no output within the allowed silence window.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The command could not be started on the device.
    ///
    /// Note: a command that runs and exits non-zero is NOT an error.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// The connection to the device dropped mid-command.
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// I/O error on the host side of the transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while bringing up a [`DeviceBridge`].
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to initialize device bridge: {0}")]
    InitFailed(String),

    #[error("Bridge error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A command to run on a device.
///
/// # Example
///
/// ```
/// use devicepool::device::Command;
///
/// let cmd = Command::new("getprop").arg("ro.build.id");
/// assert_eq!(cmd.to_shell_string(), "getprop ro.build.id");
///
/// let parsed = Command::parse("pm list packages -f");
/// assert_eq!(parsed.program, "pm");
/// assert_eq!(parsed.args, vec!["list", "packages", "-f"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program to run.
    pub program: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Splits a shell-style command line into program and arguments.
    ///
    /// Unbalanced quotes fall back to treating the whole line as the program.
    pub fn parse(line: &str) -> Self {
        let mut parts = shell_words::split(line)
            .unwrap_or_else(|_| vec![line.to_string()])
            .into_iter();
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
        }
    }

    /// Adds a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Renders the command as a single escaped shell line.
    pub fn to_shell_string(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }
}

/// Result of a command that ran to completion on a device.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code reported by the device.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time spent collecting the output.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A single item of streamed command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// A line from standard output.
    Stdout(String),
    /// A line from standard error.
    Stderr(String),
    /// The exit code of the command (yielded last).
    ExitCode(i32),
}

/// A stream of output lines from a running command.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// Receives each output line as it arrives, tagged with the device serial.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use devicepool::device::{OutputCallback, OutputLine};
///
/// let sink: OutputCallback = Arc::new(|serial, line| {
///     if let OutputLine::Stdout(s) = line {
///         println!("[{}] {}", serial, s);
///     }
/// });
/// ```
pub type OutputCallback = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;

/// Drains an [`OutputStream`] into an [`ExecResult`].
///
/// `max_silence` bounds the wait for each individual line, not the whole
/// command. A stream that ends before yielding [`OutputLine::ExitCode`] is
/// reported as [`TransportError::Disconnected`].
pub async fn collect_output(
    mut stream: OutputStream,
    serial: &str,
    max_silence: Option<Duration>,
    sink: Option<&OutputCallback>,
) -> TransportResult<ExecResult> {
    let start = Instant::now();
    let mut stdout = String::new();
    let mut stderr = String::new();

    loop {
        let next = match max_silence {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| TransportError::Timeout(format!("no output for {:?}", limit)))?,
            None => stream.next().await,
        };

        let Some(line) = next else {
            return Err(TransportError::Disconnected(
                "output stream ended without an exit code".to_string(),
            ));
        };

        if let Some(sink) = sink {
            sink(serial, &line);
        }

        match line {
            OutputLine::Stdout(s) => {
                stdout.push_str(&s);
                stdout.push('\n');
            }
            OutputLine::Stderr(s) => {
                stderr.push_str(&s);
                stderr.push('\n');
            }
            OutputLine::ExitCode(exit_code) => {
                return Ok(ExecResult {
                    exit_code,
                    stdout,
                    stderr,
                    duration: start.elapsed(),
                });
            }
        }
    }
}

/// Connection state as reported by the bridge, before translation into a
/// [`DeviceState`](super::DeviceState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeDeviceState {
    Offline,
    Online,
    Bootloader,
    Recovery,
    Unauthorized,
}

/// Where a reboot should land the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebootTarget {
    /// Normal boot into the OS.
    System,
    /// Boot into the bootloader (fastboot).
    Bootloader,
    /// Boot into the recovery image.
    Recovery,
}

/// A device visible to the bridge.
///
/// Handles are owned by the bridge. The pool only holds references to them and
/// may be handed a fresh handle for the same serial when the bridge
/// re-enumerates a device.
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    /// Serial number; the identity key used throughout the pool.
    fn serial(&self) -> &str;

    /// Current bridge-level state.
    fn state(&self) -> BridgeDeviceState;

    /// Starts a command and streams its output.
    ///
    /// The stream must end with [`OutputLine::ExitCode`] when the command
    /// completes normally.
    async fn exec_stream(&self, cmd: &Command) -> TransportResult<OutputStream>;

    /// Issues a platform reboot. Returns once the request has been accepted,
    /// not when the device is back.
    async fn reboot(&self, target: RebootTarget) -> TransportResult<()>;
}

/// Which properties changed in a [`BridgeEvent::StateChanged`] notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeMask(u32);

impl ChangeMask {
    /// Connection state changed.
    pub const STATE: ChangeMask = ChangeMask(0x0001);
    /// The list of debuggable clients changed.
    pub const CLIENT_LIST: ChangeMask = ChangeMask(0x0002);
    /// Build properties were (re)read.
    pub const BUILD_INFO: ChangeMask = ChangeMask(0x0004);

    /// Builds a mask from raw bridge bits.
    pub fn from_bits(bits: u32) -> Self {
        ChangeMask(bits)
    }

    /// Raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit in `other` is set.
    pub fn contains(self, other: ChangeMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ChangeMask {
    type Output = ChangeMask;

    fn bitor(self, rhs: ChangeMask) -> ChangeMask {
        ChangeMask(self.0 | rhs.0)
    }
}

/// A notification pushed by the bridge.
#[derive(Clone)]
pub enum BridgeEvent {
    /// Properties of a known device changed.
    StateChanged {
        handle: Arc<dyn DeviceHandle>,
        mask: ChangeMask,
    },
    /// A device appeared (or reappeared with a fresh handle).
    Connected(Arc<dyn DeviceHandle>),
    /// A device went away.
    Disconnected(Arc<dyn DeviceHandle>),
}

impl BridgeEvent {
    /// Serial of the device the event refers to.
    pub fn serial(&self) -> &str {
        match self {
            BridgeEvent::StateChanged { handle, .. } => handle.serial(),
            BridgeEvent::Connected(handle) => handle.serial(),
            BridgeEvent::Disconnected(handle) => handle.serial(),
        }
    }
}

impl std::fmt::Debug for BridgeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeEvent::StateChanged { handle, mask } => f
                .debug_struct("StateChanged")
                .field("serial", &handle.serial())
                .field("mask", mask)
                .finish(),
            BridgeEvent::Connected(handle) => {
                f.debug_tuple("Connected").field(&handle.serial()).finish()
            }
            BridgeEvent::Disconnected(handle) => {
                f.debug_tuple("Disconnected").field(&handle.serial()).finish()
            }
        }
    }
}

/// Identifies a registered bridge listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// The external device bridge (adb or an equivalent).
///
/// Listeners are channels: the bridge sends every notification to each
/// registered sender and should drop senders whose receiver has closed.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Starts the bridge.
    async fn init(&self) -> Result<(), BridgeError>;

    /// Handles for every currently visible device.
    fn devices(&self) -> Vec<Arc<dyn DeviceHandle>>;

    /// Registers a listener for bridge notifications.
    fn add_listener(&self, tx: mpsc::UnboundedSender<BridgeEvent>) -> ListenerId;

    /// Unregisters a listener. Unknown ids are ignored.
    fn remove_listener(&self, id: ListenerId);

    /// Shuts the bridge down.
    async fn terminate(&self);
}
