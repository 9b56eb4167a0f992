//! ESP-IDF application image header
//!
//! Every bootloader and app image starts with this 24-byte header; images
//! built with `hash_appended` carry a trailing SHA-256 of everything up to
//! the padded checksum byte. See:
//! <https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/firmware-image-format.html>

use std::mem::size_of;

use bytemuck::{bytes_of, from_bytes, Pod, Zeroable};
use log::debug;
use sha2::{Digest, Sha256};

use crate::{error::Error, flash::FlashIo};

pub const IMAGE_MAGIC: u8 = 0xE9;

const SEG_HEADER_LEN: u64 = 8;
const HASH_LEN: usize = 32;
const MB: u64 = 0x10_0000;
const HASH_CHUNK: usize = 0x10000;

/// Firmware header used by the ESP-IDF bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ImageHeader {
    magic: u8,
    num_segments: u8,
    spi_mode: u8,
    /// Low nibble is the SPI speed, high nibble the flash-size id.
    spi_speed_size: u8,
    entry_addr: u32,
    wp_pin: u8,
    spi_pin_drv: [u8; 3],
    chip_id: u16,
    min_chip_rev: u8,
    min_chip_rev_full: u16,
    max_chip_rev_full: u16,
    reserved: [u8; 4],
    hash_appended: u8,
}

impl ImageHeader {
    pub const SIZE: usize = size_of::<ImageHeader>();

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::SIZE {
            return Err(Error::InvalidImage(format!(
                "header is {} bytes, expected {}",
                data.len(),
                Self::SIZE
            )));
        }
        let header: ImageHeader = *from_bytes(&data[..Self::SIZE]);
        if header.magic != IMAGE_MAGIC {
            return Err(Error::InvalidImage("magic bytes not found".into()));
        }
        if chip_id_name(header.chip_id).is_none() {
            let id = header.chip_id;
            return Err(Error::InvalidImage(format!("unknown chip id {id:#x}")));
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(bytes_of(self));
        out
    }

    pub fn chip_name(&self) -> &'static str {
        chip_id_name(self.chip_id).unwrap_or("invalid")
    }

    /// Flash offset of the bootloader for this chip. The esp32 and esp32s2
    /// boot from 0x1000; later chips boot from 0.
    pub fn bootloader_offset(&self) -> u64 {
        bootloader_offset_for(self.chip_name())
    }

    pub fn num_segments(&self) -> u8 {
        self.num_segments
    }

    pub fn hash_appended(&self) -> bool {
        self.hash_appended == 1
    }

    /// Flash size declared in the header.
    pub fn flash_size(&self) -> u64 {
        (1 << (self.spi_speed_size >> 4)) * MB
    }

    /// Rewrite the flash-size nibble. `size` must be a power-of-two number
    /// of megabytes between 1MB and 128MB.
    pub fn set_flash_size(&mut self, size: u64) -> Result<(), Error> {
        let mb = size / MB;
        if size % MB != 0 || !mb.is_power_of_two() || !(1..=128).contains(&mb) {
            return Err(Error::User(format!("invalid flash size {size:#x}")));
        }
        let id = mb.trailing_zeros() as u8;
        self.spi_speed_size = (id << 4) | (self.spi_speed_size & 0x0F);
        Ok(())
    }

    /// A stand-in header for a device whose flash holds no bootloader yet.
    pub fn synthetic(chip_name: &str, flash_size: u64) -> Self {
        let mut header: ImageHeader = Zeroable::zeroed();
        header.magic = IMAGE_MAGIC;
        header.chip_id = chip_name_id(chip_name);
        let mb = (flash_size / MB).max(1).next_power_of_two().min(128);
        let _ = header.set_flash_size(mb * MB);
        header
    }
}

fn chip_id_name(chip_id: u16) -> Option<&'static str> {
    Some(match chip_id {
        0x00 => "esp32",
        0x02 => "esp32s2",
        0x05 => "esp32c3",
        0x09 => "esp32s3",
        0x0C => "esp32c2",
        0x0D => "esp32c6",
        0x10 => "esp32h2",
        0x12 => "esp32p4",
        _ => return None,
    })
}

fn chip_name_id(chip_name: &str) -> u16 {
    match chip_name {
        "esp32" => 0x00,
        "esp32s2" => 0x02,
        "esp32c3" => 0x05,
        "esp32s3" => 0x09,
        "esp32c2" => 0x0C,
        "esp32c6" => 0x0D,
        "esp32h2" => 0x10,
        "esp32p4" => 0x12,
        _ => 0x00,
    }
}

/// Flash offset of the bootloader for a chip: 0x1000 on the esp32 and
/// esp32s2, 0 everywhere else.
pub fn bootloader_offset_for(chip_name: &str) -> u64 {
    match chip_name {
        "esp32" | "esp32s2" => 0x1000,
        _ => 0,
    }
}

/// True when the region holds only erased flash (all 0xFF).
pub fn is_erased(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0xFF)
}

/// Byte extents of an image: the hashed payload and the full image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageExtent {
    /// End of the payload (segments + padded checksum byte); the stored
    /// SHA-256, when present, begins here.
    pub data_end: u64,
    /// End of the image including the appended hash.
    pub total_end: u64,
}

/// Walk the segment chain of the image at `start` and return its extent.
pub fn image_extent(
    dev: &mut dyn FlashIo,
    start: u64,
    header: &ImageHeader,
) -> Result<ImageExtent, Error> {
    let mut pos = start + ImageHeader::SIZE as u64;
    for _ in 0..header.num_segments() {
        let seg = dev.read_vec(pos, SEG_HEADER_LEN as usize)?;
        let len = u32::from_le_bytes(seg[4..8].try_into().unwrap()) as u64;
        pos += SEG_HEADER_LEN + len;
        if pos > dev.size() {
            return Err(Error::InvalidImage(format!(
                "segment at {pos:#x} exceeds the available size ({:#x})",
                dev.size()
            )));
        }
    }
    pos += 1; // checksum byte
    pos = pos.next_multiple_of(16);

    let data_end = pos;
    let total_end = if header.hash_appended() {
        pos + HASH_LEN as u64
    } else {
        pos
    };
    Ok(ImageExtent { data_end, total_end })
}

/// Total size in bytes of the image at `start`.
pub fn image_size(dev: &mut dyn FlashIo, start: u64) -> Result<u64, Error> {
    let header = ImageHeader::from_bytes(&dev.read_vec(start, ImageHeader::SIZE)?)?;
    let extent = image_extent(dev, start, &header)?;
    Ok(extent.total_end - start)
}

/// SHA-256 over `[start, data_end)`.
fn compute_hash(dev: &mut dyn FlashIo, start: u64, data_end: u64) -> Result<[u8; 32], Error> {
    let mut hasher = Sha256::new();
    let mut pos = start;
    while pos < data_end {
        let n = ((data_end - pos) as usize).min(HASH_CHUNK);
        hasher.update(&dev.read_vec(pos, n)?);
        pos += n as u64;
    }
    Ok(hasher.finalize().into())
}

/// Outcome of verifying an image's trailing SHA-256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCheck {
    pub size: u64,
    pub computed: [u8; 32],
    pub stored: Option<[u8; 32]>,
}

impl HashCheck {
    pub fn is_valid(&self) -> bool {
        self.stored.map_or(true, |stored| stored == self.computed)
    }
}

/// Recompute the SHA-256 of the image at `start` and compare it to the
/// stored digest (when the header declares one).
pub fn check_hash(dev: &mut dyn FlashIo, start: u64) -> Result<HashCheck, Error> {
    let header = ImageHeader::from_bytes(&dev.read_vec(start, ImageHeader::SIZE)?)?;
    let extent = image_extent(dev, start, &header)?;
    let computed = compute_hash(dev, start, extent.data_end)?;
    let stored = if header.hash_appended() {
        let bytes = dev.read_vec(extent.data_end, HASH_LEN)?;
        Some(bytes.try_into().unwrap())
    } else {
        None
    };

    Ok(HashCheck {
        size: extent.total_end - start,
        computed,
        stored,
    })
}

/// Rewrite the trailing SHA-256 of the image at `start`. Returns the flash
/// offset of the digest, or `None` when the header declares no hash.
pub fn rehash(dev: &mut dyn FlashIo, start: u64) -> Result<Option<u64>, Error> {
    let header = ImageHeader::from_bytes(&dev.read_vec(start, ImageHeader::SIZE)?)?;
    if !header.hash_appended() {
        return Ok(None);
    }
    let extent = image_extent(dev, start, &header)?;
    let digest = compute_hash(dev, start, extent.data_end)?;
    debug!(
        "Updating image SHA-256 at {:#x} to {}",
        extent.data_end,
        hex::encode(digest)
    );
    dev.write_at(extent.data_end, &digest, &mut crate::progress::NoProgress)?;
    Ok(Some(extent.data_end))
}

#[cfg(test)]
pub(crate) mod test_image {
    //! Synthetic image construction shared by the unit tests.

    use super::*;

    /// Build a minimal valid image: header, one segment of `payload`, the
    /// XOR checksum byte on a 16-byte boundary and an appended SHA-256.
    pub fn build(chip_id: u16, flash_size_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut image = vec![
            IMAGE_MAGIC,
            1,    // num_segments
            0x02, // dio
            flash_size_id << 4,
        ];
        image.extend_from_slice(&0x4008_0000u32.to_le_bytes()); // entry
        image.push(0xEE); // wp_pin
        image.extend_from_slice(&[0, 0, 0]); // spi_pin_drv
        image.extend_from_slice(&chip_id.to_le_bytes());
        image.push(0); // min_chip_rev
        image.extend_from_slice(&[0, 0]); // min_chip_rev_full
        image.extend_from_slice(&[0xFF, 0xFF]); // max_chip_rev_full
        image.extend_from_slice(&[0; 4]); // reserved
        image.push(1); // hash_appended
        assert_eq!(image.len(), ImageHeader::SIZE);

        image.extend_from_slice(&0x3F40_0000u32.to_le_bytes()); // segment addr
        image.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        image.extend_from_slice(payload);

        let checksum = payload.iter().fold(0xEFu8, |acc, b| acc ^ b);
        while (image.len() + 1) % 16 != 0 {
            image.push(0);
        }
        image.push(checksum);

        let digest: [u8; 32] = Sha256::digest(&image).into();
        image.extend_from_slice(&digest);
        image
    }
}
