/// Describe attached devices, classify their identities, and define the
/// boundary traits implemented by the vendor device layer.
pub mod device;

/// Load firmware images from disk into memory.
pub mod image;

/// Bridge the device layer's asynchronous arrival callbacks to bounded
/// condvar waits.
pub mod notify;

/// Drive a device through discovery, backup, and the update paths.
pub mod orchestrator;

/// Render transfer progress when stdout is an interactive terminal.
pub mod progress;

/// Command-line front end for vendor binaries.
pub mod cli;
