use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace};

use crate::device::{DeviceContext, DeviceError, FwDevice};

/// Shared state between the orchestration thread and the device layer's
/// notification thread. Only the devices-changed callback fills the slots;
/// only the waiting thread takes them, both under the one mutex in
/// [NotificationBridge].
#[derive(Default)]
struct UpdateSession {
    /// Firmware-update id of the unit we expect to reappear. Arrivals with
    /// any other id are ignored.
    expected_update_id: Option<String>,
    /// A matching device that arrived in its update-mode identity.
    new_update_device: Option<Arc<dyn FwDevice>>,
    /// A matching device that arrived back in its normal identity.
    new_device: Option<Arc<dyn FwDevice>>,
}

/// Bridges the device layer's asynchronous devices-changed callback to
/// bounded condvar waits on the orchestration thread.
///
/// One mutex/condvar pair serves both logically distinct waits ("unit came
/// back in update mode" and "unit came back as a normal device"): only one
/// wait is ever outstanding, and the two are told apart by separate slots in
/// [UpdateSession].
pub struct NotificationBridge {
    session: Mutex<UpdateSession>,
    reconnect: Condvar,
}

impl NotificationBridge {
    /// Create a bridge and register it as `ctx`'s devices-changed callback.
    /// The callback only classifies arrivals, stores a handle, and signals;
    /// it never blocks on the notification thread.
    pub fn subscribe(ctx: &dyn DeviceContext) -> Result<Arc<Self>, DeviceError> {
        let bridge = Arc::new(Self::new());

        let handler = Arc::clone(&bridge);
        ctx.set_devices_changed_callback(Box::new(move |arrived| {
            handler.on_devices_changed(arrived);
        }))?;

        Ok(bridge)
    }

    fn new() -> Self {
        Self {
            session: Mutex::new(UpdateSession::default()),
            reconnect: Condvar::new(),
        }
    }

    /// Start watching for `update_id`. Clears anything left over from a
    /// previous wait so stale arrivals cannot satisfy a new one.
    pub fn arm(&self, update_id: &str) {
        let mut session = self.session.lock().unwrap();
        session.expected_update_id = Some(update_id.to_owned());
        session.new_update_device = None;
        session.new_device = None;
        debug!("watching for firmware-update id {update_id}");
    }

    /// Classify one batch of newly appeared devices. Wakes the waiter at
    /// most once per batch, not once per device.
    fn on_devices_changed(&self, arrived: &[Arc<dyn FwDevice>]) {
        if arrived.is_empty() {
            return;
        }

        let mut session = self.session.lock().unwrap();
        let Some(expected) = session.expected_update_id.clone() else {
            return;
        };

        let mut matched = false;
        for dev in arrived {
            let record = dev.record();
            trace!("device arrived: {record}");
            if record.firmware_update_id.as_deref() != Some(expected.as_str()) {
                continue;
            }
            if record.is_update_mode {
                session.new_update_device = Some(Arc::clone(dev));
            } else {
                session.new_device = Some(Arc::clone(dev));
            }
            matched = true;
        }

        if matched {
            drop(session);
            self.reconnect.notify_one();
        }
    }

    /// Block until a matching update-mode device has arrived or `timeout`
    /// elapses. Returns immediately if one arrived before the call.
    pub fn wait_for_update_device(&self, timeout: Duration) -> Option<Arc<dyn FwDevice>> {
        let session = self.session.lock().unwrap();
        let (mut session, _) = self
            .reconnect
            .wait_timeout_while(session, timeout, |s| s.new_update_device.is_none())
            .unwrap();
        session.new_update_device.take()
    }

    /// Block until the unit has come back under its normal identity or
    /// `timeout` elapses. Returns immediately if it already has.
    pub fn wait_for_new_device(&self, timeout: Duration) -> Option<Arc<dyn FwDevice>> {
        let session = self.session.lock().unwrap();
        let (mut session, _) = self
            .reconnect
            .wait_timeout_while(session, timeout, |s| s.new_device.is_none())
            .unwrap();
        session.new_device.take()
    }
}
