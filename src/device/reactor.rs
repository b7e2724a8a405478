//! Applies bridge notifications to the pool and its sessions.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::handle::{BridgeEvent, ChangeMask, DeviceHandle};
use super::pool::{Enqueued, PoolShared};
use super::state::DeviceState;

/// Consumes [`BridgeEvent`]s for one pool.
///
/// Never fails: unknown serials and irrelevant changes are logged and
/// skipped.
pub(crate) struct DeviceChangeReactor {
    shared: Arc<PoolShared>,
}

impl DeviceChangeReactor {
    pub(crate) fn new(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    /// Runs until `cancel` fires or the bridge drops the sender.
    pub(crate) fn spawn(
        self,
        mut events: mpsc::UnboundedReceiver<BridgeEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("Bridge closed the event channel");
                        break;
                    }
                }
            }
            debug!("Device change reactor stopped");
        })
    }

    pub(crate) fn handle_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::StateChanged { handle, mask } => self.device_changed(handle, mask),
            BridgeEvent::Connected(handle) => self.device_connected(handle),
            BridgeEvent::Disconnected(handle) => self.device_disconnected(handle),
        }
    }

    fn device_changed(&self, handle: Arc<dyn DeviceHandle>, mask: ChangeMask) {
        if !mask.contains(ChangeMask::STATE) {
            return;
        }
        let Some(session) = self.shared.allocated(handle.serial()) else {
            return;
        };
        session.set_state(DeviceState::from_bridge(handle.state()));
    }

    fn device_connected(&self, handle: Arc<dyn DeviceHandle>) {
        let serial = handle.serial().to_string();
        let state = DeviceState::from_bridge(handle.state());

        match self.shared.enqueue(Arc::clone(&handle)) {
            Enqueued::Added => info!(serial = %serial, "Device connected"),
            Enqueued::Replaced => debug!(serial = %serial, "Refreshed idle device handle"),
            Enqueued::Allocated(session) => {
                debug!(serial = %serial, %state, "Allocated device reconnected");
                session.set_handle(handle);
                session.set_state(state);
            }
        }
    }

    fn device_disconnected(&self, handle: Arc<dyn DeviceHandle>) {
        let serial = handle.serial();
        if self.shared.remove_available(serial) {
            info!(serial = %serial, "Idle device disconnected");
        }
        if let Some(session) = self.shared.allocated(serial) {
            info!(serial = %serial, "Allocated device disconnected");
            session.set_state(DeviceState::NotAvailable);
        }
    }
}
