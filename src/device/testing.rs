//! In-memory doubles for the bridge, device transport and fastboot probe.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tokio::sync::mpsc;

use super::fastboot::{FastbootProbe, ProbeError, ProbeResult};
use super::handle::{
    BridgeDeviceState, BridgeError, BridgeEvent, Command, DeviceBridge, DeviceHandle, ExecResult,
    ListenerId, OutputLine, OutputStream, RebootTarget, TransportError, TransportResult,
};

/// Polls `cond` for up to two seconds.
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// What a [`FakeDevice`] does for one `exec_stream` call.
#[derive(Debug, Clone)]
pub enum FakeResponse {
    /// Yields the lines then the exit code.
    Output { lines: Vec<String>, exit_code: i32 },
    /// `exec_stream` itself fails.
    Fail,
    /// Yields nothing, ever.
    Hang,
    /// Ends without an exit code.
    Disconnect,
}

impl FakeResponse {
    pub fn output(lines: &[&str], exit_code: i32) -> Self {
        FakeResponse::Output {
            lines: lines.iter().map(|s| s.to_string()).collect(),
            exit_code,
        }
    }
}

type RebootHook = Box<dyn Fn(RebootTarget) + Send + Sync>;

/// A scripted device.
///
/// Commands pop responses from a queue, falling back to a default. `logcat`
/// is handled separately so log capture never consumes scripted responses.
pub struct FakeDevice {
    serial: String,
    state: Mutex<BridgeDeviceState>,
    responses: Mutex<VecDeque<FakeResponse>>,
    default_response: Mutex<FakeResponse>,
    log_lines: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
    reboots: Mutex<Vec<RebootTarget>>,
    reboot_hook: Mutex<Option<RebootHook>>,
    fail_reboots: Mutex<bool>,
}

impl FakeDevice {
    pub fn new(serial: &str) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.to_string(),
            state: Mutex::new(BridgeDeviceState::Online),
            responses: Mutex::new(VecDeque::new()),
            default_response: Mutex::new(FakeResponse::output(&[], 0)),
            log_lines: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            reboots: Mutex::new(Vec::new()),
            reboot_hook: Mutex::new(None),
            fail_reboots: Mutex::new(false),
        })
    }

    pub fn set_bridge_state(&self, state: BridgeDeviceState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn push_response(&self, response: FakeResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_stdout(&self, line: &str) {
        self.push_response(FakeResponse::output(&[line], 0));
    }

    pub fn set_default_response(&self, response: FakeResponse) {
        *self.default_response.lock().unwrap() = response;
    }

    pub fn set_default_stdout(&self, line: &str) {
        self.set_default_response(FakeResponse::output(&[line], 0));
    }

    pub fn set_log_lines(&self, lines: &[&str]) {
        *self.log_lines.lock().unwrap() = lines.iter().map(|s| s.to_string()).collect();
    }

    /// Non-logcat commands run so far.
    pub fn exec_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn reboots(&self) -> Vec<RebootTarget> {
        self.reboots.lock().unwrap().clone()
    }

    pub fn on_reboot(&self, hook: impl Fn(RebootTarget) + Send + Sync + 'static) {
        *self.reboot_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fail_reboots(&self) {
        *self.fail_reboots.lock().unwrap() = true;
    }
}

#[async_trait]
impl DeviceHandle for FakeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn state(&self) -> BridgeDeviceState {
        *self.state.lock().unwrap()
    }

    async fn exec_stream(&self, cmd: &Command) -> TransportResult<OutputStream> {
        if cmd.program == "logcat" {
            let lines: Vec<OutputLine> = self
                .log_lines
                .lock()
                .unwrap()
                .iter()
                .cloned()
                .map(OutputLine::Stdout)
                .collect();
            return Ok(Box::pin(stream::iter(lines).chain(stream::pending())));
        }

        self.commands.lock().unwrap().push(cmd.to_shell_string());
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_response.lock().unwrap().clone());

        match response {
            FakeResponse::Output { lines, exit_code } => {
                let items: Vec<OutputLine> = lines
                    .into_iter()
                    .map(OutputLine::Stdout)
                    .chain(std::iter::once(OutputLine::ExitCode(exit_code)))
                    .collect();
                Ok(Box::pin(stream::iter(items)))
            }
            FakeResponse::Fail => Err(TransportError::ExecFailed("scripted failure".into())),
            FakeResponse::Hang => Ok(Box::pin(stream::pending())),
            FakeResponse::Disconnect => Ok(Box::pin(stream::empty())),
        }
    }

    async fn reboot(&self, target: RebootTarget) -> TransportResult<()> {
        if *self.fail_reboots.lock().unwrap() {
            return Err(TransportError::Disconnected("scripted reboot failure".into()));
        }
        self.reboots.lock().unwrap().push(target);
        if let Some(hook) = self.reboot_hook.lock().unwrap().as_ref() {
            hook(target);
        }
        Ok(())
    }
}

/// A bridge whose events are emitted by the test.
#[derive(Default)]
pub struct FakeBridge {
    devices: Mutex<Vec<Arc<dyn DeviceHandle>>>,
    listeners: Mutex<HashMap<u64, mpsc::UnboundedSender<BridgeEvent>>>,
    next_id: AtomicU64,
    terminated: AtomicUsize,
}

impl FakeBridge {
    pub fn with_devices(devices: Vec<Arc<FakeDevice>>) -> Arc<Self> {
        let bridge = Self::default();
        *bridge.devices.lock().unwrap() = devices
            .into_iter()
            .map(|d| d as Arc<dyn DeviceHandle>)
            .collect();
        Arc::new(bridge)
    }

    pub fn emit(&self, event: BridgeEvent) {
        for tx in self.listeners.lock().unwrap().values() {
            let _ = tx.send(event.clone());
        }
    }

    pub fn connect(&self, device: &Arc<FakeDevice>) {
        self.emit(BridgeEvent::Connected(device.clone()));
    }

    pub fn disconnect(&self, device: &Arc<FakeDevice>) {
        self.emit(BridgeEvent::Disconnected(device.clone()));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn terminate_count(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceBridge for FakeBridge {
    async fn init(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    fn devices(&self) -> Vec<Arc<dyn DeviceHandle>> {
        self.devices.lock().unwrap().clone()
    }

    fn add_listener(&self, tx: mpsc::UnboundedSender<BridgeEvent>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().insert(id, tx);
        ListenerId(id)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().remove(&id.0);
    }

    async fn terminate(&self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

/// A fastboot probe returning scripted output.
pub struct ScriptedProbe {
    output: Mutex<ProbeResult<String>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(stdout: &str) -> Arc<Self> {
        Arc::new(Self {
            output: Mutex::new(Ok(stdout.to_string())),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_stdout(&self, stdout: &str) {
        *self.output.lock().unwrap() = Ok(stdout.to_string());
    }

    pub fn fail(&self) {
        *self.output.lock().unwrap() = Err(ProbeError::ExecFailed("scripted failure".into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FastbootProbe for ScriptedProbe {
    async fn list_devices(&self, _timeout: Duration) -> ProbeResult<ExecResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stdout = match &*self.output.lock().unwrap() {
            Ok(stdout) => stdout.clone(),
            Err(e) => return Err(ProbeError::ExecFailed(e.to_string())),
        };
        Ok(ExecResult {
            exit_code: 0,
            stdout,
            stderr: String::new(),
            duration: Duration::ZERO,
        })
    }
}
