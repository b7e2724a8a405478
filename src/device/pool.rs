//! The device pool: exclusive allocation of bridge-visible devices.
//!
//! The pool holds a FIFO queue of idle handles and a map of allocated
//! sessions keyed by serial. Both live behind one mutex so a serial is
//! never idle and allocated at the same time. Waiters park on a [`Notify`]
//! that is signalled whenever a handle is queued.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fastboot::{FastbootProbe, FastbootReconciler};
use super::handle::{BridgeError, DeviceBridge, DeviceHandle, ListenerId};
use super::reactor::DeviceChangeReactor;
use super::recovery::DeviceRecovery;
use super::session::{DeviceSession, SessionOptions};
use crate::config::Config;

/// Result type for pool start-up.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors raised while starting a [`DevicePool`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Outcome of handing a handle to the pool.
pub(crate) enum Enqueued {
    /// Appended to the back of the queue.
    Added,
    /// An idle handle with the same serial was replaced in place.
    Replaced,
    /// The serial is allocated; the queue was left alone.
    Allocated(DeviceSession),
}

#[derive(Default)]
struct PoolState {
    available: VecDeque<Arc<dyn DeviceHandle>>,
    allocated: HashMap<String, DeviceSession>,
}

impl PoolState {
    fn position(&self, serial: &str) -> Option<usize> {
        self.available.iter().position(|h| h.serial() == serial)
    }

    fn enqueue(&mut self, handle: Arc<dyn DeviceHandle>) -> Enqueued {
        let serial = handle.serial();
        if let Some(session) = self.allocated.get(serial) {
            return Enqueued::Allocated(session.clone());
        }
        match self.position(serial) {
            Some(index) => {
                self.available[index] = handle;
                Enqueued::Replaced
            }
            None => {
                self.available.push_back(handle);
                Enqueued::Added
            }
        }
    }
}

/// State shared between the pool front end and its background tasks.
pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    available: Notify,
    options: SessionOptions,
}

impl PoolShared {
    pub(crate) fn new(options: SessionOptions) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues `handle` unless its serial is allocated, waking one waiter.
    pub(crate) fn enqueue(&self, handle: Arc<dyn DeviceHandle>) -> Enqueued {
        let outcome = self.lock().enqueue(handle);
        if matches!(outcome, Enqueued::Added | Enqueued::Replaced) {
            self.available.notify_one();
        }
        outcome
    }

    /// Drops an idle handle. Returns `true` if one was queued.
    pub(crate) fn remove_available(&self, serial: &str) -> bool {
        let mut state = self.lock();
        match state.position(serial) {
            Some(index) => {
                state.available.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn allocated(&self, serial: &str) -> Option<DeviceSession> {
        self.lock().allocated.get(serial).cloned()
    }

    pub(crate) fn allocated_sessions(&self) -> Vec<DeviceSession> {
        self.lock().allocated.values().cloned().collect()
    }

    pub(crate) fn try_allocate(&self, recovery: &Arc<dyn DeviceRecovery>) -> Option<DeviceSession> {
        let mut state = self.lock();
        let handle = state.available.pop_front()?;
        let session = DeviceSession::new(handle, Arc::clone(recovery), self.options.clone());
        state
            .allocated
            .insert(session.serial().to_string(), session.clone());
        let more = !state.available.is_empty();
        drop(state);

        // pass the wake-up on so a stored permit is not swallowed
        if more {
            self.available.notify_one();
        }
        Some(session)
    }
}

/// Hands out devices exclusively and takes them back.
///
/// Construct one per process with [`DevicePool::start`] and pass it to
/// whatever drives the tests.
pub struct DevicePool {
    shared: Arc<PoolShared>,
    bridge: Arc<dyn DeviceBridge>,
    listener: Mutex<Option<ListenerId>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DevicePool {
    /// Initializes the bridge, queues every visible device and starts the
    /// change reactor and the fastboot reconciler.
    pub async fn start(
        bridge: Arc<dyn DeviceBridge>,
        probe: Arc<dyn FastbootProbe>,
        config: &Config,
    ) -> PoolResult<Self> {
        bridge.init().await?;

        let shared = Arc::new(PoolShared::new(SessionOptions::from_config(config)));
        let cancel = CancellationToken::new();

        // Listen before enumerating so a device connecting in between is not lost.
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = bridge.add_listener(tx);

        for handle in bridge.devices() {
            shared.enqueue(handle);
        }

        let mut tasks =
            vec![DeviceChangeReactor::new(Arc::clone(&shared)).spawn(rx, cancel.child_token())];
        if config.fastboot.enabled {
            tasks.push(
                FastbootReconciler::new(
                    Arc::clone(&shared),
                    probe,
                    Duration::from_millis(config.fastboot.poll_interval_ms),
                    Duration::from_secs(config.fastboot.probe_timeout_secs),
                )
                .spawn(cancel.child_token()),
            );
        }

        let pool = Self {
            shared,
            bridge,
            listener: Mutex::new(Some(listener)),
            cancel,
            tasks: Mutex::new(tasks),
        };
        info!(
            available = pool.available_serials().len(),
            "Device pool started"
        );
        Ok(pool)
    }

    /// Waits until a device is free and allocates it.
    ///
    /// Returns `None` only if the pool is terminated while waiting.
    pub async fn allocate(&self, recovery: Arc<dyn DeviceRecovery>) -> Option<DeviceSession> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(session) = self.shared.try_allocate(&recovery) {
                info!(serial = %session.serial(), session = %session.id(), "Allocated device");
                session.start_log_capture();
                return Some(session);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = self.shared.available.notified() => {}
            }
        }
    }

    /// Like [`allocate`](Self::allocate), giving up after `timeout`.
    pub async fn allocate_timeout(
        &self,
        recovery: Arc<dyn DeviceRecovery>,
        timeout: Duration,
    ) -> Option<DeviceSession> {
        match tokio::time::timeout(timeout, self.allocate(recovery)).await {
            Ok(session) => session,
            Err(_) => {
                debug!(?timeout, "No device became available");
                None
            }
        }
    }

    /// Returns a session's device to the back of the queue.
    ///
    /// Freeing a session the pool does not track only logs a warning.
    pub fn free(&self, session: DeviceSession) {
        session.stop_log_capture();
        let serial = session.serial().to_string();

        let mut state = self.shared.lock();
        match state.allocated.remove(&serial) {
            Some(tracked) if tracked.id() == session.id() => {
                state.enqueue(session.handle());
                drop(state);
                self.shared.available.notify_one();
                info!(serial = %serial, session = %session.id(), "Freed device");
            }
            Some(tracked) => {
                state.allocated.insert(serial.clone(), tracked);
                warn!(serial = %serial, session = %session.id(), "Ignoring free of a stale session");
            }
            None => {
                warn!(serial = %serial, "Freed device was not allocated");
            }
        }
    }

    /// Serials waiting in the queue, head first.
    pub fn available_serials(&self) -> Vec<String> {
        self.shared
            .lock()
            .available
            .iter()
            .map(|h| h.serial().to_string())
            .collect()
    }

    /// Serials currently allocated, sorted.
    pub fn allocated_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.shared.lock().allocated.keys().cloned().collect();
        serials.sort();
        serials
    }

    /// The live session for `serial`, if allocated.
    pub fn session(&self, serial: &str) -> Option<DeviceSession> {
        self.shared.allocated(serial)
    }

    /// Stops background tasks, detaches from the bridge and wakes every
    /// waiter with `None`. Safe to call more than once.
    pub async fn terminate(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(id) = listener {
            self.bridge.remove_listener(id);
        }
        self.bridge.terminate().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Pool background task ended abnormally: {}", e);
            }
        }
        info!("Device pool terminated");
    }
}

impl Drop for DevicePool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::device::handle::BridgeEvent;
    use crate::device::recovery::NoRecovery;
    use crate::device::testing::{FakeBridge, FakeDevice, ScriptedProbe, eventually};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.fastboot.enabled = false;
        config.pool.log_capture_lines = 0;
        config
    }

    async fn pool_with(serials: &[&str]) -> (DevicePool, Arc<FakeBridge>, Vec<Arc<FakeDevice>>) {
        let devices: Vec<_> = serials.iter().map(|s| FakeDevice::new(s)).collect();
        let bridge = FakeBridge::with_devices(devices.clone());
        let pool = DevicePool::start(bridge.clone(), ScriptedProbe::new(""), &test_config())
            .await
            .unwrap();
        (pool, bridge, devices)
    }

    fn no_recovery() -> Arc<dyn DeviceRecovery> {
        Arc::new(NoRecovery)
    }

    fn assert_exclusive(pool: &DevicePool) {
        let available: HashSet<_> = pool.available_serials().into_iter().collect();
        let allocated: HashSet<_> = pool.allocated_serials().into_iter().collect();
        assert!(available.is_disjoint(&allocated));
    }

    #[tokio::test]
    async fn test_start_enqueues_visible_devices_in_order() {
        let (pool, bridge, _) = pool_with(&["A", "B", "C"]).await;
        assert_eq!(pool.available_serials(), vec!["A", "B", "C"]);
        assert_eq!(bridge.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_allocate_and_free_cycle() {
        let (pool, _, _) = pool_with(&["A", "B"]).await;

        let a = pool.allocate(no_recovery()).await.unwrap();
        assert_eq!(a.serial(), "A");
        assert_eq!(pool.available_serials(), vec!["B"]);
        assert_eq!(pool.allocated_serials(), vec!["A"]);
        assert_exclusive(&pool);

        pool.free(a);
        assert_eq!(pool.available_serials(), vec!["B", "A"]);
        assert!(pool.allocated_serials().is_empty());
    }

    #[tokio::test]
    async fn test_allocate_timeout_on_empty_pool() {
        let (pool, _, _) = pool_with(&[]).await;

        let start = std::time::Instant::now();
        let session = pool
            .allocate_timeout(no_recovery(), Duration::from_millis(100))
            .await;
        let elapsed = start.elapsed();

        assert!(session.is_none());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_waiter_woken_by_free() {
        let (pool, _, _) = pool_with(&["A"]).await;
        let pool = Arc::new(pool);

        let held = pool.allocate(no_recovery()).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.allocate_timeout(no_recovery(), Duration::from_secs(5))
                    .await
                    .map(|s| s.serial().to_string())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.free(held);
        assert_eq!(waiter.await.unwrap().as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_waiter_woken_by_connect() {
        let (pool, bridge, _) = pool_with(&[]).await;
        let pool = Arc::new(pool);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.allocate_timeout(no_recovery(), Duration::from_secs(5))
                    .await
                    .map(|s| s.serial().to_string())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.connect(&FakeDevice::new("NEW"));
        assert_eq!(waiter.await.unwrap().as_deref(), Some("NEW"));
    }

    #[tokio::test]
    async fn test_free_untracked_session_is_not_requeued() {
        let (pool, _, _) = pool_with(&["A"]).await;
        let (other, _, _) = pool_with(&["X"]).await;

        let foreign = other.allocate(no_recovery()).await.unwrap();
        pool.free(foreign);
        assert_eq!(pool.available_serials(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_free_stale_session_keeps_live_one() {
        let (pool, _, _) = pool_with(&["A"]).await;

        let first = pool.allocate(no_recovery()).await.unwrap();
        let stale = first.clone();
        pool.free(first);
        let second = pool.allocate(no_recovery()).await.unwrap();

        pool.free(stale);
        assert_eq!(pool.allocated_serials(), vec!["A"]);
        assert!(pool.available_serials().is_empty());
        assert_eq!(pool.session("A").unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_duplicate_enumeration_is_deduplicated() {
        let device = FakeDevice::new("A");
        let bridge = FakeBridge::with_devices(vec![device.clone(), device.clone()]);
        let pool = DevicePool::start(bridge.clone(), ScriptedProbe::new(""), &test_config())
            .await
            .unwrap();
        assert_eq!(pool.available_serials(), vec!["A"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_stay_exclusive() {
        let (pool, _, _) = pool_with(&["A", "B", "C"]).await;
        let pool = Arc::new(pool);
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let mut workers = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            workers.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let session = pool.allocate(no_recovery()).await.unwrap();
                    let serial = session.serial().to_string();
                    assert!(in_use.lock().unwrap().insert(serial.clone()));
                    tokio::task::yield_now().await;
                    assert!(in_use.lock().unwrap().remove(&serial));
                    pool.free(session);
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(pool.available_serials().len(), 3);
        assert!(pool.allocated_serials().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_releases_waiters() {
        let (pool, bridge, _) = pool_with(&[]).await;
        let pool = Arc::new(pool);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.allocate(no_recovery()).await.is_none() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.terminate().await;
        pool.terminate().await;

        assert!(waiter.await.unwrap());
        assert_eq!(bridge.listener_count(), 0);
        assert_eq!(bridge.terminate_count(), 1);
        assert!(pool.allocate(no_recovery()).await.is_none());
    }

    #[tokio::test]
    async fn test_allocation_starts_log_capture() {
        let device = FakeDevice::new("A");
        device.set_log_lines(&["init: started"]);
        let bridge = FakeBridge::with_devices(vec![device.clone()]);
        let mut config = test_config();
        config.pool.log_capture_lines = 10;
        let pool = DevicePool::start(bridge, ScriptedProbe::new(""), &config)
            .await
            .unwrap();

        let session = pool.allocate(no_recovery()).await.unwrap();
        assert!(eventually(|| session.log_capture() == "init: started").await);
        pool.free(session);
    }

    #[tokio::test]
    async fn test_reconnect_while_idle_replaces_handle() {
        let (pool, bridge, devices) = pool_with(&["A"]).await;

        let fresh = FakeDevice::new("A");
        bridge.emit(BridgeEvent::Connected(fresh.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.available_serials(), vec!["A"]);

        fresh.push_stdout("fresh");
        let session = pool.allocate(no_recovery()).await.unwrap();
        let out = session.execute_shell_command("id").await.unwrap();
        assert_eq!(out, "fresh\n");
        assert_eq!(devices[0].exec_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_drops_idle_and_marks_allocated() {
        let (pool, bridge, devices) = pool_with(&["A", "B"]).await;
        let held = pool.allocate(no_recovery()).await.unwrap();
        assert_eq!(held.serial(), "A");

        bridge.disconnect(&devices[1]);
        assert!(eventually(|| pool.available_serials().is_empty()).await);

        bridge.disconnect(&devices[0]);
        assert!(eventually(|| held.state() == crate::device::DeviceState::NotAvailable).await);
        assert_eq!(pool.allocated_serials(), vec!["A"]);
    }
}
