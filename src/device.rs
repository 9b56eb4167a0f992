//! Serial bootloader client interface
//!
//! The wire protocol to the ROM loader and its RAM stub lives outside this
//! crate; this module defines the client surface the flash layer drives
//! (connect, read, write, erase, reset, flash-size query) and a RAM-backed
//! simulator that stands in for a chip. Concrete serial transports plug in
//! as further [Bootloader] implementations.

use std::{fs, path::PathBuf};

use log::{debug, info};

use crate::{
    error::{Error, ResultExt},
    progress::ProgressCallbacks,
};

/// How often the progress callback fires, in bytes.
const PROGRESS_CHUNK: usize = 0x4000;

/// A connected chip in bootloader mode, with the flasher stub running.
pub trait Bootloader {
    /// Detected chip, e.g. `esp32` or `esp32s3`.
    fn chip_name(&self) -> String;

    /// Physical flash size in bytes, as reported by the flash chip.
    fn flash_size(&self) -> u64;

    fn read_flash(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error>;

    /// Write whole blocks. Offset and length must be multiples of 0x1000.
    fn write_flash(
        &mut self,
        offset: u64,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error>;

    /// Erase whole blocks. Offset and length must be multiples of 0x1000.
    fn erase_region(&mut self, offset: u64, len: u64) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error>;

    /// Reset the chip out of bootloader mode.
    fn hard_reset(&mut self) -> Result<(), Error>;
}

/// Expand the short serial-port forms: `u0` is `/dev/ttyUSB0`, `a0` is
/// `/dev/ttyACM0` and `c1` is `COM1` (the last only on Windows).
pub fn expand_device_name(name: &str) -> String {
    let mut chars = name.chars();
    let (prefix, rest) = (chars.next(), chars.as_str());
    if let Some(prefix) = prefix {
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
            match prefix {
                'u' => return format!("/dev/ttyUSB{rest}"),
                'a' => return format!("/dev/ttyACM{rest}"),
                'c' if cfg!(windows) => return format!("COM{rest}"),
                _ => {}
            }
        }
    }
    name.to_string()
}

/// True when `filename` names a serial device rather than an image file.
pub fn is_device(filename: &str) -> bool {
    filename.starts_with("/dev/") || filename.starts_with("COM")
}

/// A [Bootloader] backed by RAM, optionally persisted to a raw flash dump.
///
/// Exercises every device-only code path (block-granular writes, erase
/// plans, OTA) without hardware; the test-suite and `--method sim` use it.
pub struct SimBootloader {
    chip_name: String,
    flash: Vec<u8>,
    backing: Option<PathBuf>,
}

impl SimBootloader {
    pub fn in_memory(chip_name: &str, flash_size: usize) -> Self {
        SimBootloader {
            chip_name: chip_name.to_string(),
            flash: vec![0xFF; flash_size],
            backing: None,
        }
    }

    /// Load a raw flash dump (addressed from 0). The simulated flash size
    /// is the file length rounded up to a whole number of megabytes.
    pub fn open(path: PathBuf) -> Result<Self, Error> {
        let display = path.display().to_string();
        let mut flash = fs::read(&path).at_path(&display)?;
        let size = (flash.len() as u64).next_multiple_of(0x10_0000).max(0x10_0000);
        flash.resize(size as usize, 0xFF);

        let chip_name = Self::detect_chip(&flash);
        info!("Simulated {chip_name} device with {}MB flash at '{display}'", size / 0x10_0000);

        Ok(SimBootloader {
            chip_name,
            flash,
            backing: Some(path),
        })
    }

    fn detect_chip(flash: &[u8]) -> String {
        use crate::image_format::ImageHeader;
        for offset in [0x1000usize, 0] {
            if let Ok(header) = ImageHeader::from_bytes(&flash[offset..offset + ImageHeader::SIZE]) {
                return header.chip_name().to_string();
            }
        }
        "esp32".to_string()
    }

    fn check_blocks(&self, what: &str, offset: u64, len: u64) -> Result<(), Error> {
        if offset % 0x1000 != 0 || len % 0x1000 != 0 {
            return Err(Error::Device(format!(
                "{what} at {offset:#x}+{len:#x} is not block aligned"
            )));
        }
        if offset + len > self.flash.len() as u64 {
            return Err(Error::Device(format!(
                "{what} at {offset:#x}+{len:#x} is outside the flash"
            )));
        }
        Ok(())
    }
}

impl Bootloader for SimBootloader {
    fn chip_name(&self) -> String {
        self.chip_name.clone()
    }

    fn flash_size(&self) -> u64 {
        self.flash.len() as u64
    }

    fn read_flash(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let end = offset as usize + buf.len();
        if end > self.flash.len() {
            return Err(Error::Device(format!(
                "read at {offset:#x}+{:#x} is outside the flash",
                buf.len()
            )));
        }
        progress.init(offset, buf.len());
        for (i, chunk) in buf.chunks_mut(PROGRESS_CHUNK).enumerate() {
            let at = offset as usize + i * PROGRESS_CHUNK;
            chunk.copy_from_slice(&self.flash[at..at + chunk.len()]);
            progress.update(at - offset as usize + chunk.len());
        }
        progress.finish();
        Ok(())
    }

    fn write_flash(
        &mut self,
        offset: u64,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.check_blocks("write", offset, data.len() as u64)?;
        progress.init(offset, data.len());
        for (i, chunk) in data.chunks(PROGRESS_CHUNK).enumerate() {
            let at = offset as usize + i * PROGRESS_CHUNK;
            self.flash[at..at + chunk.len()].copy_from_slice(chunk);
            progress.update(at - offset as usize + chunk.len());
        }
        progress.finish();
        Ok(())
    }

    fn erase_region(&mut self, offset: u64, len: u64) -> Result<(), Error> {
        self.check_blocks("erase", offset, len)?;
        self.flash[offset as usize..(offset + len) as usize].fill(0xFF);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        if let Some(path) = &self.backing {
            let display = path.display().to_string();
            fs::write(path, &self.flash).at_path(&display)?;
        }
        Ok(())
    }

    fn hard_reset(&mut self) -> Result<(), Error> {
        debug!("Simulated hard reset");
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;

    #[test]
    fn short_names_expand() {
        assert_eq!(expand_device_name("u0"), "/dev/ttyUSB0");
        assert_eq!(expand_device_name("a12"), "/dev/ttyACM12");
        assert_eq!(expand_device_name("firmware.bin"), "firmware.bin");
        assert_eq!(expand_device_name("u"), "u");
        if cfg!(windows) {
            assert_eq!(expand_device_name("c3"), "COM3");
        } else {
            assert_eq!(expand_device_name("c3"), "c3");
        }
    }

    #[test]
    fn sim_write_then_read() {
        let mut sim = SimBootloader::in_memory("esp32", 0x4000);
        sim.write_flash(0x1000, &[0xAB; 0x1000], &mut NoProgress).unwrap();

        let mut buf = [0u8; 8];
        sim.read_flash(0x1004, &mut buf, &mut NoProgress).unwrap();
        assert_eq!(buf, [0xAB; 8]);
    }

    #[test]
    fn sim_rejects_unaligned_writes() {
        let mut sim = SimBootloader::in_memory("esp32", 0x4000);
        assert!(sim.write_flash(0x800, &[0u8; 0x1000], &mut NoProgress).is_err());
        assert!(sim.write_flash(0x1000, &[0u8; 0x800], &mut NoProgress).is_err());
    }

    #[test]
    fn sim_progress_reports_to_total() {
        struct Last(u64, usize, usize);
        impl ProgressCallbacks for Last {
            fn init(&mut self, addr: u64, total: usize) {
                self.0 = addr;
                self.1 = total;
            }
            fn update(&mut self, current: usize) {
                self.2 = current;
            }
            fn finish(&mut self) {}
        }

        let mut sim = SimBootloader::in_memory("esp32", 0x20000);
        let mut progress = Last(0, 0, 0);
        let mut buf = vec![0u8; 0x9000];
        sim.read_flash(0x1000, &mut buf, &mut progress).unwrap();
        assert_eq!(progress.0, 0x1000);
        assert_eq!(progress.1, 0x9000);
        assert_eq!(progress.2, 0x9000);
    }
}
