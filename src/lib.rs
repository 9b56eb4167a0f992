//! A library and application for manipulating MicroPython ESP32 firmware
//!
//! `espimage` works on firmware artifacts in two forms: image files on the
//! local disk, and the live flash storage of a serial-attached device. In
//! both it can inspect and rewrite the bootloader header and the partition
//! table; resize, add, delete and rename partitions; read, write and erase
//! partition contents; perform an OTA firmware upgrade through the device
//! bootloader; and operate on a LittleFS filesystem inside a data
//! partition.
//!
//! ## As an application
//!
//! ```bash
//! $ espimage ESP32_GENERIC-20231005-v1.21.0.bin
//! $ espimage firmware.bin -f 8M --resize vfs=0
//! $ espimage u0 --ota-update micropython.app-bin
//! ```
//!
//! ## As a library
//!
//! The [firmware::Firmware] facade opens either target and exposes the
//! same operations the command line offers; [layout::plan] computes table
//! changes without touching storage, so callers can inspect the outcome
//! (and the partitions it invalidates) before committing it.

pub mod cli;
pub mod device;
pub mod directive;
pub mod error;
pub mod firmware;
pub mod flash;
pub mod image_format;
pub mod layout;
pub mod lfs;
pub mod ota;
pub mod partition;
pub mod partition_table;
pub mod progress;

pub use error::{Error, LayoutError};

/// Logging utilities
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
