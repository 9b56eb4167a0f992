//! Bounded I/O over a single partition
//!
//! A [PartitionIo] is a window onto the backing flash, clamped to the
//! partition's byte range. Writes are block aligned and padded to a block
//! with 0xFF, except into the tail partition of a firmware file, which may
//! end short of the partition size.

use log::{debug, warn};

use crate::{
    error::Error,
    flash::{FlashIo, BLOCK_SIZE},
    image_format::{self, ImageHeader},
    progress::{NoProgress, ProgressCallbacks},
};

pub struct PartitionIo<'a> {
    dev: &'a mut dyn FlashIo,
    name: String,
    offset: u64,
    size: u64,
    is_app: bool,
}

impl<'a> PartitionIo<'a> {
    pub(crate) fn new(
        dev: &'a mut dyn FlashIo,
        name: &str,
        offset: u64,
        size: u64,
        is_app: bool,
    ) -> Self {
        PartitionIo {
            dev,
            name: name.to_string(),
            offset,
            size,
            is_app,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn check(&self, what: &str, rel: u64, len: u64) -> Result<(), Error> {
        if rel + len > self.size {
            return Err(Error::Range(format!(
                "partition '{}': {what} of {len:#x} bytes at {rel:#x} (size {:#x})",
                self.name, self.size
            )));
        }
        Ok(())
    }

    pub fn read(&mut self, rel: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.check("read", rel, len as u64)?;
        self.dev.read_vec(self.offset + rel, len)
    }

    pub fn read_all(&mut self, progress: &mut dyn ProgressCallbacks) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; self.size as usize];
        self.dev.read_at(self.offset, &mut buf, progress)?;
        Ok(buf)
    }

    /// Write `data` at the block-aligned partition offset `rel`, padding to
    /// a whole block with 0xFF. An app image gets its header validated and
    /// its trailing SHA-256 refreshed.
    pub fn write(
        &mut self,
        rel: u64,
        data: &[u8],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<usize, Error> {
        self.check("write", rel, data.len() as u64)?;
        if rel % BLOCK_SIZE != 0 {
            return Err(Error::Range(format!(
                "partition '{}': write at {rel:#x} is not block aligned",
                self.name
            )));
        }
        if self.is_app && rel == 0 {
            ImageHeader::from_bytes(data)?;
        }

        let pad = if self.is_file_tail()? {
            // The tail partition of an image file may end short.
            0
        } else {
            (BLOCK_SIZE - data.len() as u64 % BLOCK_SIZE) % BLOCK_SIZE
        } as usize;

        let mut padded;
        let out = if pad == 0 {
            data
        } else {
            padded = Vec::with_capacity(data.len() + pad);
            padded.extend_from_slice(data);
            padded.resize(data.len() + pad, 0xFF);
            &padded[..]
        };
        self.dev.write_at(self.offset + rel, out, progress)?;

        if self.is_app && rel == 0 {
            self.refresh_image_hash()?;
        }
        Ok(data.len())
    }

    /// Recompute and store the appended SHA-256 of the app image starting
    /// at the head of this partition.
    fn refresh_image_hash(&mut self) -> Result<(), Error> {
        let header = ImageHeader::from_bytes(&self.dev.read_vec(self.offset, ImageHeader::SIZE)?)?;
        let extent = image_format::image_extent(self.dev, self.offset, &header)?;
        if extent.total_end > self.offset + self.size {
            return Err(Error::InvalidImage(format!(
                "image size ({:#x}) exceeds partition '{}' ({:#x} bytes)",
                extent.total_end - self.offset,
                self.name,
                self.size
            )));
        }
        image_format::rehash(self.dev, self.offset)?;
        Ok(())
    }

    pub fn erase(&mut self, rel: u64, len: u64) -> Result<(), Error> {
        self.check("erase", rel, len)?;
        self.dev.erase(self.offset + rel, len)
    }

    pub fn erase_all(&mut self) -> Result<(), Error> {
        self.erase(0, self.size)
    }

    /// Discard contents from `rel` to the end of the partition. The tail
    /// partition of an image file shrinks the file; everything else is
    /// erased a block at a time.
    pub fn truncate(&mut self, rel: u64) -> Result<(), Error> {
        let rel = rel.min(self.size);
        if self.is_file_tail()? {
            debug!("Truncating '{}' at {rel:#x}", self.name);
            return self.dev.truncate(self.offset + rel);
        }
        let from = rel.next_multiple_of(BLOCK_SIZE);
        if from < self.size {
            debug!("Erasing '{}' from {from:#x}", self.name);
            self.erase(from, self.size - from)?;
        }
        Ok(())
    }

    /// True when this partition covers the end of a backing image file.
    fn is_file_tail(&mut self) -> Result<bool, Error> {
        Ok(!self.dev.is_device() && self.offset + self.size >= self.dev.content_end()?)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.dev.flush()
    }
}

impl Drop for PartitionIo<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.dev.flush() {
            warn!("Error while flushing partition '{}': {err}", self.name);
        }
    }
}

/// Drop trailing 0xFF bytes, keeping a multiple of `boundary` bytes.
pub fn trim(mut data: Vec<u8>, boundary: usize) -> Vec<u8> {
    let mut n = data.len();
    while n > 0 && data[n - 1] == 0xFF {
        n -= 1;
    }
    let end = n.div_ceil(boundary) * boundary;
    data.truncate(end.min(data.len()));
    data
}

/// [trim] to the 4 KiB block boundary.
pub fn trim_blocks(data: Vec<u8>) -> Vec<u8> {
    trim(data, BLOCK_SIZE as usize)
}
