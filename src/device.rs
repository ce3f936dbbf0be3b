use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Product code reported by the MIPI-attached camera variant. That variant is
/// the only one flashed through a raw file write instead of the USB transfer
/// call, and it identifies itself by this code combined with an unreported
/// USB type. This is a fixed rule of the hardware's attribute model, not a
/// transport-detection heuristic.
const MIPI_PRODUCT_ID: &str = "ABCD";

/// Device families the enumeration can be restricted to.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProductLine {
    /// Every attached device, regardless of family.
    Any,
    /// Depth camera family (the only one this tool updates).
    Depth,
}

/// A read-only view of one attached device, captured at enumeration time.
/// Attributes the device does not support are `None` and render as
/// "unknown". Records are never mutated; the population is re-queried
/// instead.
#[derive(Clone, Debug, Default)]
pub struct DeviceRecord {
    pub name: String,
    pub serial_number: Option<String>,
    /// Identity that stays stable across the normal and update-mode
    /// personalities of one physical unit. Present only for devices that can
    /// be correlated across a disconnect.
    pub firmware_update_id: Option<String>,
    pub firmware_version: Option<String>,
    pub usb_type: Option<String>,
    pub product_id: String,
    /// The device is currently presenting its recovery/update identity
    /// rather than its normal operating identity.
    pub is_update_mode: bool,
    /// The device accepts the enter-update-mode/transfer sequence.
    pub supports_update: bool,
    /// Raw firmware sink exposed by MIPI-attached variants.
    pub mipi_path: Option<PathBuf>,
}

impl DeviceRecord {
    pub fn mode(&self) -> DeviceMode {
        if self.is_update_mode {
            DeviceMode::Recovery
        } else {
            DeviceMode::Normal
        }
    }

    pub fn usb_type(&self) -> &str {
        self.usb_type.as_deref().unwrap_or("unknown")
    }

    /// MIPI-attached variant: the fixed product code plus no USB descriptor.
    pub fn is_mipi(&self) -> bool {
        self.product_id == MIPI_PRODUCT_ID && self.usb_type.is_none()
    }

    /// The link is USB 2. Updates over USB 2 are known to fail sporadically,
    /// so callers warn before proceeding.
    pub fn is_usb2(&self) -> bool {
        self.usb_type().contains("2.")
    }

    /// A device we can start an update on: it must advertise the update
    /// capability and expose both identities so the reconnect can be
    /// correlated.
    pub fn is_update_candidate(&self) -> bool {
        self.supports_update && self.serial_number.is_some() && self.firmware_update_id.is_some()
    }
}

impl Display for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Name: {}, serial number: {}, update serial number: {}, firmware version: {}, USB type: {}",
            self.name,
            self.serial_number.as_deref().unwrap_or("unknown"),
            self.firmware_update_id.as_deref().unwrap_or("unknown"),
            self.firmware_version.as_deref().unwrap_or("unknown"),
            self.usb_type(),
        )
    }
}

/// Identities a device can present. A unit in recovery identity only accepts
/// a raw transfer; a unit in normal identity must be commanded into update
/// mode first.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DeviceMode {
    Normal,
    Recovery,
}

impl Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceMode::Normal => write!(f, "normal"),
            DeviceMode::Recovery => write!(f, "recovery"),
        }
    }
}

/// Progress fractions in `[0, 1]`, delivered on the calling thread for the
/// full duration of a transfer call.
pub type ProgressFn<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// One attached device, as handed out by [DeviceContext::query_devices] or
/// the devices-changed callback. The handle stays usable while the unit is
/// attached under the identity it was enumerated with; a disconnect
/// invalidates it and a fresh handle arrives through the callback.
pub trait FwDevice: Send + Sync {
    fn record(&self) -> DeviceRecord;

    /// Command the device to drop its normal identity and reappear in update
    /// mode. Returns once the command is accepted; the reappearance is
    /// observed through the devices-changed callback.
    fn enter_update_mode(&self) -> Result<(), DeviceError>;

    /// Transfer a signed firmware image. Blocks for the full transfer.
    fn update(&self, image: &[u8], progress: ProgressFn) -> Result<(), DeviceError>;

    /// Transfer an unsigned image, bypassing the device's authenticity
    /// check. The device performs the whole update cycle within this call.
    fn update_unsigned(&self, image: &[u8], progress: ProgressFn) -> Result<(), DeviceError>;

    /// Whether the device accepts this image at all.
    fn check_firmware_compatibility(&self, image: &[u8]) -> Result<bool, DeviceError>;

    /// Dump the device flash. An empty buffer means the device cannot back
    /// up its flash, which is not an error.
    fn create_flash_backup(&self, progress: ProgressFn) -> Result<Vec<u8>, DeviceError>;
}

/// Callback invoked with each batch of newly appeared devices. Runs on a
/// thread owned by the device layer and must not block.
pub type DevicesChangedCallback = Box<dyn Fn(&[Arc<dyn FwDevice>]) + Send + Sync>;

/// Entry point into the device layer: a live view of the attached device
/// population plus arrival notifications.
pub trait DeviceContext {
    /// Snapshot of the currently attached devices. Not live-updating; call
    /// again for a fresh view.
    fn query_devices(&self, product_line: ProductLine) -> Result<Vec<Arc<dyn FwDevice>>, DeviceError>;

    /// Register the single devices-changed callback, replacing any previous
    /// one.
    fn set_devices_changed_callback(
        &self,
        callback: DevicesChangedCallback,
    ) -> Result<(), DeviceError>;
}

/// A failed call into the device layer, keeping the call's name and
/// arguments so the failure can be reported precisely.
#[derive(Error, Debug)]
#[error("device error calling {call}({args}): {message}")]
pub struct DeviceError {
    pub call: &'static str,
    pub args: String,
    pub message: String,
}

impl DeviceError {
    pub fn new(call: &'static str, args: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call,
            args: args.into(),
            message: message.into(),
        }
    }
}
