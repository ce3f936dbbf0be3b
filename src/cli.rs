use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::device::DeviceContext;
use crate::image::FirmwareImage;
use crate::orchestrator::{DeviceSelector, UpdateOrchestrator, UpdateRequest};
use crate::progress::ProgressMode;

#[derive(Parser, Debug)]
#[command(name = "depthcam-fwup", about = "Firmware update tool for depth camera devices")]
pub struct Cli {
    /// List all connected devices
    #[arg(short = 'l', long)]
    pub list_devices: bool,

    /// Recover a device that is in recovery mode
    #[arg(short = 'r', long)]
    pub recover: bool,

    /// Update unsigned firmware, available only for unlocked cameras
    #[arg(short = 'u', long = "unsigned")]
    pub unsigned_fw: bool,

    /// Back up the device flash to the given path before updating
    #[arg(short = 'b', long, value_name = "PATH")]
    pub backup: Option<PathBuf>,

    /// Path of the firmware image file
    #[arg(short = 'f', long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Serial number of the device to update; mandatory when more than one
    /// device is connected
    #[arg(short = 's', long, value_name = "SERIAL")]
    pub serial_number: Option<String>,
}

impl Cli {
    fn requests_nothing(&self) -> bool {
        !self.list_devices
            && !self.recover
            && !self.unsigned_fw
            && self.backup.is_none()
            && self.file.is_none()
            && self.serial_number.is_none()
    }
}

pub fn init_logging() {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("DEPTHCAM_FWUP_LOG", "info")
            .write_style("DEPTHCAM_FWUP_LOG_STYLE"),
    )
    .init();
}

/// Complete front end for a vendor binary: parse arguments, initialize
/// logging, run the requested operation, and fold every failure into a
/// non-zero exit status with a single human-readable message.
pub fn main_with_context(ctx: &dyn DeviceContext) -> ExitCode {
    init_logging();

    let cli = Cli::parse();
    match run(ctx, &cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Dispatch one parsed invocation against the device layer.
pub fn run(ctx: &dyn DeviceContext, cli: &Cli) -> Result<()> {
    let mut orchestrator = UpdateOrchestrator::new(ctx, ProgressMode::for_stdout())?;

    if cli.requests_nothing() {
        println!("\nNothing to do, run again with -h for help");
        if orchestrator.list_devices()? == 0 {
            bail!("no action requested and no devices are connected");
        }
        return Ok(());
    }

    if cli.list_devices {
        orchestrator.list_devices()?;
        return Ok(());
    }

    if cli.file.is_none() && cli.backup.is_none() {
        bail!("nothing to do, run again with -h for help");
    }

    let selector = match &cli.serial_number {
        Some(serial) => DeviceSelector::with_serial(serial),
        None => DeviceSelector::any(),
    };

    if cli.recover {
        let path = cli
            .file
            .as_deref()
            .context("a firmware file must be selected")?;
        let image = FirmwareImage::load(path)?;
        orchestrator.recover(&selector, &image)?;
        return Ok(());
    }

    // The image is read and checked up front, before any call that could
    // change device state.
    let image = cli.file.as_deref().map(FirmwareImage::load).transpose()?;
    let request = UpdateRequest {
        image,
        unsigned_fw: cli.unsigned_fw,
        backup_path: cli.backup.clone(),
    };
    orchestrator.update(&selector, &request)?;
    Ok(())
}
