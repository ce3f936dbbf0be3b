use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use thiserror::Error;

use crate::device::{DeviceContext, DeviceError, DeviceRecord, FwDevice, ProductLine};
use crate::image::{FirmwareImage, ImageError};
use crate::notify::NotificationBridge;
use crate::progress::{ProgressMode, ProgressTicker};

/// How long to wait for a device to disappear and come back under another
/// identity before giving up on that stage.
pub const WAIT_FOR_DEVICE_TIMEOUT: Duration = Duration::from_secs(15);

/// Ways device selection can fail before anything is touched.
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum SelectionError {
    #[error("no devices were found")]
    NoDevices,

    #[error("no recovery devices were found")]
    NoRecoveryDevices,

    #[error("more than one device is connected; a serial number must be specified")]
    MultipleDevices,

    #[error("couldn't find a device with serial number {0}")]
    SerialNotFound(String),

    #[error("device is in recovery mode; run a recovery to flash it")]
    InRecoveryMode,
}

/// All ways an update operation can fail. Every variant is terminal: the
/// operation is reported and the tool exits, leaving a re-run to the
/// operator. Retrying a half-completed firmware write automatically is not
/// safe.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpdateError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("this firmware version is not compatible with {device}")]
    Incompatible { device: String },

    #[error("failed to locate device in update mode")]
    UpdateModeWaitTimeout,

    #[error("timed out waiting for the recovered device to reconnect")]
    RecoveryWaitTimeout,

    #[error("only signed firmware is supported for MIPI devices")]
    UnsignedOverMipi,

    #[error("device exposes no firmware write path")]
    MipiPathMissing,

    #[error("firmware write to {} failed", path.display())]
    MipiWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to create backup file {}", path.display())]
    BackupWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Which device an operation should act on. With no serial number set, any
/// single eligible device matches.
#[derive(Clone, Debug, Default)]
pub struct DeviceSelector {
    pub serial: Option<String>,
}

impl DeviceSelector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
        }
    }

    /// Match against whichever identity the caller keys on: normal serial
    /// numbers for attached devices, firmware-update ids for recovery
    /// devices.
    fn matches(&self, id: Option<&str>) -> bool {
        match &self.serial {
            None => true,
            Some(want) => id == Some(want.as_str()),
        }
    }
}

/// Where the orchestration currently is. Failures are error returns, not
/// phases; `Done` is only reached by a completed operation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Phase {
    Idle,
    Discovering,
    Selected,
    Backup,
    EnterUpdateMode,
    WaitFlashDevice,
    Flashing,
    WaitReconnect,
    RecoveryWait,
    MipiFlash,
    UnsignedFlash,
    Done,
}

/// What an update run should do once a device is selected.
#[derive(Default)]
pub struct UpdateRequest {
    /// Firmware to flash. Absent for backup-only runs.
    pub image: Option<FirmwareImage>,
    /// Use the device's unsigned entry point, bypassing its authenticity
    /// check. Rejected for MIPI devices.
    pub unsigned_fw: bool,
    /// Dump the device flash to this path before flashing.
    pub backup_path: Option<PathBuf>,
}

/// Drives one device through discovery, optional backup, and one of the
/// four update paths (signed, unsigned, MIPI, recovery), waiting on the
/// [NotificationBridge] whenever the device has to vanish and come back.
pub struct UpdateOrchestrator<'ctx> {
    ctx: &'ctx dyn DeviceContext,
    bridge: Arc<NotificationBridge>,
    progress: ProgressMode,
    wait_timeout: Duration,
    phase: Phase,
}

impl<'ctx> UpdateOrchestrator<'ctx> {
    /// Wire up an orchestrator, registering its reconnect bridge as `ctx`'s
    /// devices-changed callback.
    pub fn new(ctx: &'ctx dyn DeviceContext, progress: ProgressMode) -> Result<Self, DeviceError> {
        let bridge = NotificationBridge::subscribe(ctx)?;
        Ok(Self {
            ctx,
            bridge,
            progress,
            wait_timeout: WAIT_FOR_DEVICE_TIMEOUT,
            phase: Phase::Idle,
        })
    }

    /// Shorten the reconnect waits. Meant for tests driving a fake device
    /// layer.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!("phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Print every attached device, indexed from 1. Returns how many were
    /// listed.
    pub fn list_devices(&self) -> Result<usize, DeviceError> {
        let devs = self.ctx.query_devices(ProductLine::Any)?;

        if devs.is_empty() {
            println!("\nThere are no connected devices");
            return Ok(0);
        }

        println!("\nConnected devices:");
        for (index, dev) in devs.iter().enumerate() {
            println!("{}) {}", index + 1, dev.record());
        }

        Ok(devs.len())
    }

    /// Flash a device that is already presenting its recovery identity. The
    /// transfer starts immediately; success is the unit reappearing as a
    /// normal device with the same firmware-update id.
    pub fn recover(
        &mut self,
        selector: &DeviceSelector,
        image: &FirmwareImage,
    ) -> Result<(), UpdateError> {
        self.set_phase(Phase::Discovering);
        println!("\nUpdate to FW: {}", image.path().display());

        let devs = self.ctx.query_devices(ProductLine::Depth)?;
        let mut selected = None;
        for dev in &devs {
            let record = dev.record();
            if !record.is_update_mode {
                continue;
            }
            let Some(update_id) = record.firmware_update_id.clone() else {
                continue;
            };
            // Recovery devices expose no normal serial number; a serial
            // filter matches their firmware-update id instead.
            if !selector.matches(Some(&update_id)) {
                continue;
            }
            if selected.is_some() {
                return Err(SelectionError::MultipleDevices.into());
            }
            selected = Some((Arc::clone(dev), update_id, record));
        }
        let Some((device, update_id, record)) = selected else {
            return Err(SelectionError::NoRecoveryDevices.into());
        };

        self.bridge.arm(&update_id);

        println!("\nRecovering device:");
        println!("{record}");
        self.set_phase(Phase::Flashing);
        self.transfer(&device, image)?;

        self.set_phase(Phase::RecoveryWait);
        println!("Waiting for new device...");
        self.bridge
            .wait_for_new_device(self.wait_timeout)
            .ok_or(UpdateError::RecoveryWaitTimeout)?;

        println!("\nRecovery done");
        self.set_phase(Phase::Done);
        Ok(())
    }

    /// Back up and/or flash one selected device.
    pub fn update(
        &mut self,
        selector: &DeviceSelector,
        request: &UpdateRequest,
    ) -> Result<(), UpdateError> {
        let device = self.select_target(selector)?;
        let record = device.record();

        if let Some(update_id) = record.firmware_update_id.as_deref() {
            self.bridge.arm(update_id);
        }

        if let Some(path) = request.backup_path.clone() {
            self.set_phase(Phase::Backup);
            let backup = self.backup_flash(&device, &path);
            self.set_phase(Phase::Selected);
            match backup {
                // A failed backup is reported but does not abort the flash
                // that follows.
                Err(err) if request.image.is_some() => error!("{err}"),
                other => other?,
            }
        }

        let Some(image) = &request.image else {
            return Ok(());
        };

        println!("\nUpdating device FW:");
        println!("{record}");

        if record.is_mipi() {
            if request.unsigned_fw {
                return Err(UpdateError::UnsignedOverMipi);
            }
            return self.write_mipi(&record, image);
        }

        if request.unsigned_fw {
            self.flash_unsigned(&device, image)
        } else {
            self.flash_signed(&device, &record, image)
        }
    }

    /// Pick the device to act on. Eligibility requires the update capability
    /// plus both identities; ambiguity without a serial filter is fatal.
    fn select_target(
        &mut self,
        selector: &DeviceSelector,
    ) -> Result<Arc<dyn FwDevice>, UpdateError> {
        self.set_phase(Phase::Discovering);
        if let Some(serial) = &selector.serial {
            println!("\nSearch for device with serial number: {serial}");
        }

        let devs = self.ctx.query_devices(ProductLine::Depth)?;
        let mut candidates = devs.iter().filter(|dev| {
            let record = dev.record();
            record.is_update_candidate() && selector.matches(record.serial_number.as_deref())
        });

        let selected = match candidates.next() {
            None => {
                let err = if let Some(serial) = selector.serial.clone() {
                    SelectionError::SerialNotFound(serial)
                } else if devs.iter().any(|dev| dev.record().is_update_mode) {
                    SelectionError::InRecoveryMode
                } else {
                    SelectionError::NoDevices
                };
                return Err(err.into());
            }
            Some(dev) => {
                if candidates.next().is_some() {
                    return Err(SelectionError::MultipleDevices.into());
                }
                Arc::clone(dev)
            }
        };

        if selected.record().is_usb2() {
            warn!(
                "the camera is connected via a USB 2 port; if the update fails, connect it to a USB 3 port and try again"
            );
        }

        self.set_phase(Phase::Selected);
        Ok(selected)
    }

    /// Dump the device flash to `path`. An empty dump means the device
    /// cannot back up its flash, which is reported and is not a failure.
    fn backup_flash(&self, device: &Arc<dyn FwDevice>, path: &Path) -> Result<(), UpdateError> {
        println!("\nTrying to back up the device flash");

        let sink = self.progress.start("Flash backup progress");
        let flash = device.create_flash_backup(&|fraction| sink.report(fraction))?;
        sink.finish();

        if flash.is_empty() {
            println!("\nFlash backup is not supported by this device");
            return Ok(());
        }

        std::fs::write(path, &flash).map_err(|source| UpdateError::BackupWrite {
            path: path.to_owned(),
            source,
        })
    }

    /// Signed path: compatibility check, switch to update mode, wait for
    /// the update-mode identity, flash it, then wait for the unit to come
    /// back only so the final firmware version can be reported.
    fn flash_signed(
        &mut self,
        device: &Arc<dyn FwDevice>,
        record: &DeviceRecord,
        image: &FirmwareImage,
    ) -> Result<(), UpdateError> {
        if !device.check_firmware_compatibility(image.bytes())? {
            return Err(UpdateError::Incompatible {
                device: record.name.clone(),
            });
        }

        self.set_phase(Phase::EnterUpdateMode);
        device.enter_update_mode()?;

        self.set_phase(Phase::WaitFlashDevice);
        let update_device = self
            .bridge
            .wait_for_update_device(self.wait_timeout)
            .ok_or(UpdateError::UpdateModeWaitTimeout)?;

        self.set_phase(Phase::Flashing);
        self.transfer(&update_device, image)?;

        self.set_phase(Phase::WaitReconnect);
        println!("\nWaiting for the device to reconnect...");
        match self.bridge.wait_for_new_device(self.wait_timeout) {
            Some(_) => self.report_final_version(record),
            // The flash itself already succeeded; a missed reconnect only
            // costs the final version report.
            None => warn!("device did not reconnect in time; new firmware version not confirmed"),
        }

        self.set_phase(Phase::Done);
        Ok(())
    }

    /// Unsigned path: the device performs the whole cycle inside the call,
    /// so there is no identity switch to wait for.
    fn flash_unsigned(
        &mut self,
        device: &Arc<dyn FwDevice>,
        image: &FirmwareImage,
    ) -> Result<(), UpdateError> {
        self.set_phase(Phase::UnsignedFlash);

        println!("\nFirmware update started. Please don't disconnect the device!");
        let sink = self.progress.start("Firmware update progress");
        device.update_unsigned(image.bytes(), &|fraction| sink.report(fraction))?;
        sink.finish();
        println!("\nFirmware update done");

        self.set_phase(Phase::Done);
        Ok(())
    }

    /// MIPI path: the firmware goes through a raw write to the device's
    /// exposed path instead of the transfer API. The percentage shown while
    /// writing is a fixed-duration estimate, not real progress.
    fn write_mipi(&mut self, record: &DeviceRecord, image: &FirmwareImage) -> Result<(), UpdateError> {
        self.set_phase(Phase::MipiFlash);
        let path = record.mipi_path.as_ref().ok_or(UpdateError::MipiPathMissing)?;

        println!("\nUpdate can take up to 2 minutes");
        let ticker = ProgressTicker::start(self.progress, "Firmware update progress");
        let result = std::fs::write(path, image.bytes());
        ticker.finish();

        result.map_err(|source| UpdateError::MipiWrite {
            path: path.clone(),
            source,
        })?;

        println!("\nFirmware update done");
        self.set_phase(Phase::Done);
        Ok(())
    }

    fn transfer(&self, device: &Arc<dyn FwDevice>, image: &FirmwareImage) -> Result<(), UpdateError> {
        println!("\nFirmware update started. Please don't disconnect the device!");
        let sink = self.progress.start("Firmware update progress");
        device.update(image.bytes(), &|fraction| sink.report(fraction))?;
        sink.finish();
        println!("\nFirmware update done");
        Ok(())
    }

    /// Report what firmware the reconnected unit now runs. Best effort; the
    /// update has already succeeded by the time this runs.
    fn report_final_version(&self, target: &DeviceRecord) {
        let devs = match self.ctx.query_devices(ProductLine::Any) {
            Ok(devs) => devs,
            Err(err) => {
                warn!("could not re-enumerate devices for the final report: {err}");
                return;
            }
        };

        for dev in devs {
            let record = dev.record();
            if record.serial_number != target.serial_number {
                continue;
            }
            println!(
                "\nDevice {} successfully updated to FW: {}",
                record.serial_number.as_deref().unwrap_or("unknown"),
                record.firmware_version.as_deref().unwrap_or("unknown"),
            );
        }
    }
}
