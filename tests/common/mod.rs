//! Fake device layer used by the orchestration tests: an in-memory device
//! population with a pluggable arrival callback, standing in for the vendor
//! SDK behind the `DeviceContext`/`FwDevice` traits.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use depthcam_fwup::device::{
    DeviceContext, DeviceError, DeviceRecord, DevicesChangedCallback, FwDevice, ProductLine,
    ProgressFn,
};

/// One-shot action a test hangs off a device call, typically to plug in the
/// device's next identity the way real hardware reappears after a command.
pub type Hook = Box<dyn FnOnce() + Send>;

pub struct FakeDevice {
    pub record: DeviceRecord,
    pub compatible: bool,
    pub flash: Vec<u8>,
    pub calls: Mutex<Vec<&'static str>>,
    pub on_enter_update_mode: Mutex<Option<Hook>>,
    pub on_update: Mutex<Option<Hook>>,
}

impl FakeDevice {
    pub fn new(record: DeviceRecord) -> Self {
        Self {
            record,
            compatible: true,
            flash: vec![],
            calls: Mutex::new(vec![]),
            on_enter_update_mode: Mutex::new(None),
            on_update: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn run_hook(hook: &Mutex<Option<Hook>>) {
        if let Some(hook) = hook.lock().unwrap().take() {
            hook();
        }
    }
}

impl FwDevice for FakeDevice {
    fn record(&self) -> DeviceRecord {
        self.record.clone()
    }

    fn enter_update_mode(&self) -> Result<(), DeviceError> {
        self.log("enter_update_mode");
        Self::run_hook(&self.on_enter_update_mode);
        Ok(())
    }

    fn update(&self, _image: &[u8], progress: ProgressFn) -> Result<(), DeviceError> {
        self.log("update");
        progress(0.5);
        progress(1.0);
        Self::run_hook(&self.on_update);
        Ok(())
    }

    fn update_unsigned(&self, _image: &[u8], progress: ProgressFn) -> Result<(), DeviceError> {
        self.log("update_unsigned");
        progress(1.0);
        Ok(())
    }

    fn check_firmware_compatibility(&self, _image: &[u8]) -> Result<bool, DeviceError> {
        self.log("check_firmware_compatibility");
        Ok(self.compatible)
    }

    fn create_flash_backup(&self, progress: ProgressFn) -> Result<Vec<u8>, DeviceError> {
        self.log("create_flash_backup");
        progress(1.0);
        Ok(self.flash.clone())
    }
}

#[derive(Default)]
pub struct FakeContext {
    devices: Mutex<Vec<Arc<FakeDevice>>>,
    callback: Mutex<Option<DevicesChangedCallback>>,
}

impl FakeContext {
    pub fn with_devices(devices: Vec<Arc<FakeDevice>>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
            callback: Mutex::new(None),
        })
    }

    /// Attach a device without delivering an arrival, as if it was present
    /// before the tool started.
    pub fn attach(&self, device: Arc<FakeDevice>) {
        self.devices.lock().unwrap().push(device);
    }

    /// Attach a device and deliver the arrival through the registered
    /// callback, like a hotplug event.
    pub fn plug(&self, device: Arc<FakeDevice>) {
        self.devices.lock().unwrap().push(Arc::clone(&device));
        if let Some(callback) = &*self.callback.lock().unwrap() {
            callback(&[device as Arc<dyn FwDevice>]);
        }
    }

    /// Deliver the arrival from another thread after `delay`, like hardware
    /// that takes a moment to re-enumerate.
    pub fn plug_later(self: &Arc<Self>, device: Arc<FakeDevice>, delay: Duration) {
        let ctx = Arc::clone(self);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            ctx.plug(device);
        });
    }
}

impl DeviceContext for FakeContext {
    fn query_devices(&self, _product_line: ProductLine) -> Result<Vec<Arc<dyn FwDevice>>, DeviceError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|dev| Arc::clone(dev) as Arc<dyn FwDevice>)
            .collect())
    }

    fn set_devices_changed_callback(
        &self,
        callback: DevicesChangedCallback,
    ) -> Result<(), DeviceError> {
        *self.callback.lock().unwrap() = Some(callback);
        Ok(())
    }
}

pub fn normal_device(serial: &str) -> DeviceRecord {
    DeviceRecord {
        name: "Depth Camera 435".to_owned(),
        serial_number: Some(serial.to_owned()),
        firmware_update_id: Some(format!("fw-{serial}")),
        firmware_version: Some("5.13.0.50".to_owned()),
        usb_type: Some("3.2".to_owned()),
        product_id: "0B07".to_owned(),
        is_update_mode: false,
        supports_update: true,
        mipi_path: None,
    }
}

pub fn recovery_device(update_id: &str) -> DeviceRecord {
    DeviceRecord {
        name: "Depth Camera 435 Recovery".to_owned(),
        serial_number: None,
        firmware_update_id: Some(update_id.to_owned()),
        firmware_version: None,
        usb_type: Some("3.2".to_owned()),
        product_id: "0ADB".to_owned(),
        is_update_mode: true,
        supports_update: false,
        mipi_path: None,
    }
}

pub fn mipi_device(serial: &str, dfu_path: PathBuf) -> DeviceRecord {
    DeviceRecord {
        name: "Depth Camera 457".to_owned(),
        serial_number: Some(serial.to_owned()),
        firmware_update_id: Some(format!("fw-{serial}")),
        firmware_version: Some("5.13.0.50".to_owned()),
        usb_type: None,
        product_id: "ABCD".to_owned(),
        is_update_mode: false,
        supports_update: true,
        mipi_path: Some(dfu_path),
    }
}
