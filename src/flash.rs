//! Flash I/O abstraction: one byte-addressed device over files and chips
//!
//! Addresses are flash addresses. Firmware files for the esp32 and esp32s2
//! begin at the bootloader offset (0x1000), so the file backend shifts file
//! positions by that amount; everything above this layer works in flash
//! addresses only.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use log::debug;

use crate::{
    device::Bootloader,
    error::{Error, ResultExt},
    progress::{NoProgress, ProgressCallbacks},
};

/// One flash block: erase granularity and write alignment on devices.
pub const BLOCK_SIZE: u64 = 0x1000;

/// A random-access byte device over an image file or an attached chip.
pub trait FlashIo {
    /// Total addressable size in bytes.
    fn size(&self) -> u64;

    /// True when the backend is an attached device rather than a file.
    fn is_device(&self) -> bool {
        false
    }

    fn read_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error>;

    fn write_at(
        &mut self,
        offset: u64,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error>;

    /// Reset `len` bytes at `offset` to the erased state (0xFF).
    fn erase(&mut self, offset: u64, len: u64) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error>;

    /// Flush and release the backend. On devices this resets the chip out
    /// of the bootloader unless reset was suppressed at open time.
    fn close(&mut self) -> Result<(), Error>;

    /// Read `len` bytes at `offset` into a fresh buffer, without progress
    /// reporting.
    fn read_vec(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf, &mut NoProgress)?;
        Ok(buf)
    }

    /// End of the stored content. Equal to [FlashIo::size] on devices; on
    /// files it is the end of the backing file, which partitions may
    /// extend past.
    fn content_end(&mut self) -> Result<u64, Error> {
        Ok(self.size())
    }

    /// Drop everything at and after `at`. Only image files support this.
    fn truncate(&mut self, at: u64) -> Result<(), Error> {
        let _ = at;
        Err(Error::Range("truncate is only supported on image files".into()))
    }

    /// Adopt a new flash size after the bootloader header changed. Devices
    /// ignore this; their size is physical.
    fn set_size_hint(&mut self, size: u64) {
        let _ = size;
    }
}

/// Byte-range check shared by both backends.
fn check_range(what: &str, offset: u64, len: u64, size: u64) -> Result<(), Error> {
    if offset + len > size {
        return Err(Error::Range(format!(
            "{what} of {len:#x} bytes at {offset:#x} exceeds flash size {size:#x}"
        )));
    }
    Ok(())
}

/// Random access over a local firmware image file.
///
/// `base_offset` is the flash address of the first file byte (the
/// bootloader offset of the chip the image was built for).
pub struct FileFlash {
    file: File,
    path: String,
    base_offset: u64,
    reported_size: u64,
}

impl FileFlash {
    pub fn open(path: &Path, base_offset: u64) -> Result<Self, Error> {
        let display = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .at_path(&display)?;
        let len = file.metadata().at_path(&display)?.len();

        Ok(FileFlash {
            file,
            path: display,
            base_offset,
            reported_size: base_offset + len,
        })
    }

    /// Override the reported size with the flash size the header declares.
    /// Partitions may extend past the end of the file itself.
    pub fn set_reported_size(&mut self, size: u64) {
        self.reported_size = size;
    }

    /// Length of the backing file, as a flash address.
    pub fn file_end(&self) -> Result<u64, Error> {
        let len = self.file.metadata().at_path(&self.path)?.len();
        Ok(self.base_offset + len)
    }

    fn seek_to(&mut self, offset: u64) -> Result<(), Error> {
        if offset < self.base_offset {
            return Err(Error::Range(format!(
                "access at {offset:#x} is below the bootloader offset ({:#x})",
                self.base_offset
            )));
        }
        self.file
            .seek(SeekFrom::Start(offset - self.base_offset))
            .at_path(&self.path)?;
        Ok(())
    }
}

impl FlashIo for FileFlash {
    fn size(&self) -> u64 {
        self.reported_size
    }

    fn read_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        _progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        check_range("read", offset, buf.len() as u64, self.size())?;
        self.seek_to(offset)?;
        // Reads past the end of the file observe the erased state.
        let available = self.file_end()?.saturating_sub(offset).min(buf.len() as u64) as usize;
        self.file.read_exact(&mut buf[..available]).at_path(&self.path)?;
        buf[available..].fill(0xFF);
        Ok(())
    }

    fn write_at(
        &mut self,
        offset: u64,
        data: &[u8],
        _progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        check_range("write", offset, data.len() as u64, self.size())?;
        debug!("Writing {:#x} bytes at {:#x}", data.len(), offset);
        self.seek_to(offset)?;
        self.file.write_all(data).at_path(&self.path)
    }

    fn erase(&mut self, offset: u64, len: u64) -> Result<(), Error> {
        check_range("erase", offset, len, self.size())?;
        debug!("Erasing {len:#x} bytes at {offset:#x}");
        self.seek_to(offset)?;
        let blank = vec![0xFFu8; len as usize];
        self.file.write_all(&blank).at_path(&self.path)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.file.flush().at_path(&self.path)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.flush()
    }

    fn content_end(&mut self) -> Result<u64, Error> {
        self.file_end()
    }

    fn set_size_hint(&mut self, size: u64) {
        self.reported_size = size;
    }

    fn truncate(&mut self, at: u64) -> Result<(), Error> {
        if at < self.base_offset {
            return Err(Error::Range(format!(
                "cannot truncate below the bootloader offset ({:#x})",
                self.base_offset
            )));
        }
        self.file.set_len(at - self.base_offset).at_path(&self.path)
    }
}

/// Flash storage of a serial-attached chip, mediated by a [Bootloader]
/// client.
///
/// Writes and erases are carried out a block at a time; a write that does
/// not cover whole blocks is widened by reading the surrounding block
/// content first.
pub struct DeviceFlash {
    client: Box<dyn Bootloader>,
    size: u64,
    reset_on_close: bool,
    closed: bool,
}

impl DeviceFlash {
    pub fn new(client: Box<dyn Bootloader>, reset_on_close: bool) -> Self {
        let size = client.flash_size();
        DeviceFlash {
            client,
            size,
            reset_on_close,
            closed: false,
        }
    }

    pub fn chip_name(&self) -> String {
        self.client.chip_name()
    }
}

impl FlashIo for DeviceFlash {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_device(&self) -> bool {
        true
    }

    fn read_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        check_range("read", offset, buf.len() as u64, self.size)?;
        debug!("Reading {:#x} bytes from {:#x}", buf.len(), offset);
        self.client.read_flash(offset, buf, progress)
    }

    fn write_at(
        &mut self,
        offset: u64,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        check_range("write", offset, data.len() as u64, self.size)?;
        if data.is_empty() {
            return Ok(());
        }
        debug!("Writing {:#x} bytes at {:#x}", data.len(), offset);

        let start = offset / BLOCK_SIZE * BLOCK_SIZE;
        let end = (offset + data.len() as u64).next_multiple_of(BLOCK_SIZE);

        if start == offset && end == offset + data.len() as u64 {
            return self.client.write_flash(offset, data, progress);
        }

        // Widen to whole blocks, merging with the existing content.
        let mut block = self.read_vec(start, (end - start) as usize)?;
        let lead = (offset - start) as usize;
        block[lead..lead + data.len()].copy_from_slice(data);
        self.client.erase_region(start, end - start)?;
        self.client.write_flash(start, &block, progress)
    }

    fn erase(&mut self, offset: u64, len: u64) -> Result<(), Error> {
        check_range("erase", offset, len, self.size)?;
        if offset % BLOCK_SIZE != 0 || len % BLOCK_SIZE != 0 {
            return Err(Error::Range(format!(
                "erase at {offset:#x}+{len:#x} is not block aligned"
            )));
        }
        debug!("Erasing {len:#x} bytes at {offset:#x}");
        self.client.erase_region(offset, len)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.client.flush()
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.client.flush()?;
        if self.reset_on_close {
            debug!("Resetting out of bootloader mode");
            self.client.hard_reset()
        } else {
            log::info!("Leaving device in bootloader mode");
            Ok(())
        }
    }
}

impl Drop for DeviceFlash {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                log::warn!("Error while closing device: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimBootloader;

    #[test]
    fn file_read_after_write() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0u8; 0x4000]).unwrap();
        let mut flash = FileFlash::open(tmp.path(), 0x1000).unwrap();

        flash
            .write_at(0x2000, b"hello", &mut NoProgress)
            .unwrap();
        let back = flash.read_vec(0x2000, 5).unwrap();
        assert_eq!(&back, b"hello");
    }

    #[test]
    fn file_reads_past_end_are_erased() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0u8; 0x1000]).unwrap();
        let mut flash = FileFlash::open(tmp.path(), 0x1000).unwrap();
        flash.set_reported_size(0x4000);

        let back = flash.read_vec(0x1800, 0x1000).unwrap();
        assert!(back[..0x800].iter().all(|&b| b == 0));
        assert!(back[0x800..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn file_erase_writes_ff() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0u8; 0x3000]).unwrap();
        let mut flash = FileFlash::open(tmp.path(), 0x1000).unwrap();

        flash.erase(0x2000, 0x1000).unwrap();
        let back = flash.read_vec(0x2000, 0x1000).unwrap();
        assert!(back.iter().all(|&b| b == 0xFF));
        let untouched = flash.read_vec(0x1000, 0x1000).unwrap();
        assert!(untouched.iter().all(|&b| b == 0));
    }

    #[test]
    fn file_access_below_base_offset_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0u8; 0x1000]).unwrap();
        let mut flash = FileFlash::open(tmp.path(), 0x1000).unwrap();

        assert!(matches!(
            flash.read_at(0x800, &mut [0u8; 16], &mut NoProgress),
            Err(Error::Range(_))
        ));
    }

    #[test]
    fn device_sub_block_write_preserves_neighbors() {
        let client = SimBootloader::in_memory("esp32", 0x10000);
        let mut flash = DeviceFlash::new(Box::new(client), false);

        flash
            .write_at(0x1000, &vec![0xAA; 0x1000], &mut NoProgress)
            .unwrap();
        // Write 16 bytes in the middle of the block
        flash.write_at(0x1800, &[0x55; 16], &mut NoProgress).unwrap();

        let back = flash.read_vec(0x1000, 0x1000).unwrap();
        assert!(back[..0x800].iter().all(|&b| b == 0xAA));
        assert_eq!(&back[0x800..0x810], &[0x55; 16]);
        assert!(back[0x810..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn device_unaligned_erase_rejected() {
        let client = SimBootloader::in_memory("esp32", 0x10000);
        let mut flash = DeviceFlash::new(Box::new(client), false);
        assert!(matches!(flash.erase(0x800, 0x1000), Err(Error::Range(_))));
        assert!(matches!(flash.erase(0x1000, 0x800), Err(Error::Range(_))));
    }
}
