//! Open firmware images and orchestrate changes to them
//!
//! A [Firmware] owns the backing flash (an image file or an attached
//! device), the parsed bootloader header and the partition table, and
//! exposes every operation of the tool: table rewrites, partition reads
//! and writes, app extraction, flashing and OTA updates.

use std::{
    fs,
    io::Read,
    path::Path,
};

use log::{info, warn};

use crate::{
    device::Bootloader,
    error::{Error, ResultExt},
    flash::{DeviceFlash, FileFlash, FlashIo, BLOCK_SIZE},
    image_format::{self, bootloader_offset_for, is_erased, ImageHeader},
    layout::Plan,
    partition::{self, PartitionIo},
    partition_table::{PartitionTable, TABLE_OFFSET, TABLE_SIZE},
    progress::{NoProgress, ProgressCallbacks},
};

/// Synthetic partition name for the bootloader region before the table.
pub const BOOTLOADER_NAME: &str = "bootloader";
/// Synthetic partition name for the table region itself.
pub const PARTITION_TABLE_NAME: &str = "partition_table";

/// How to filter partition contents read back to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trim {
    /// The whole partition, byte for byte.
    #[default]
    Raw,
    /// Up to the 16-byte boundary after the last non-0xFF byte.
    Bytes,
    /// Up to the 4 KiB block boundary after the last non-0xFF byte.
    Blocks,
}

impl Trim {
    fn apply(self, data: Vec<u8>) -> Vec<u8> {
        match self {
            Trim::Raw => data,
            Trim::Bytes => partition::trim(data, 16),
            Trim::Blocks => partition::trim_blocks(data),
        }
    }
}

/// An open firmware image or device.
pub struct Firmware {
    name: String,
    dev: Box<dyn FlashIo>,
    header: ImageHeader,
    bootloader_offset: u64,
    table: PartitionTable,
}

impl Firmware {
    /// Open a firmware image file. The file's first byte is the start of
    /// the bootloader image.
    pub fn open_file(path: &Path) -> Result<Self, Error> {
        let name = path.display().to_string();
        let mut head = [0u8; ImageHeader::SIZE];
        fs::File::open(path)
            .and_then(|mut f| f.read_exact(&mut head))
            .at_path(&name)?;
        let header = ImageHeader::from_bytes(&head)?;
        let bootloader_offset = header.bootloader_offset();

        let mut file = FileFlash::open(path, bootloader_offset)?;
        let file_end = file.file_end()?;
        let flash_size = header.flash_size();
        if flash_size < file_end {
            warn!(
                "Image file extends past the declared flash size ({:#x})",
                flash_size
            );
        }
        file.set_reported_size(flash_size.max(file_end));

        Self::finish_open(name, Box::new(file), header, bootloader_offset, flash_size, false)
    }

    /// Open the flash storage of an attached device through a bootloader
    /// client.
    pub fn open_device(
        name: &str,
        client: Box<dyn Bootloader>,
        reset_on_close: bool,
        check: bool,
    ) -> Result<Self, Error> {
        let chip = client.chip_name();
        let reported_size = client.flash_size();
        let bootloader_offset = bootloader_offset_for(&chip);
        let mut dev = DeviceFlash::new(client, reset_on_close);

        let head = dev.read_vec(bootloader_offset, ImageHeader::SIZE)?;
        let header = if check {
            if is_erased(&head) {
                return Err(Error::Device(
                    "no bootloader found on flash; use '--flash' to write firmware".into(),
                ));
            }
            let header = ImageHeader::from_bytes(&head)?;
            if header.chip_name() != chip {
                warn!(
                    "Detected chip type ({}) differs from the firmware bootloader ({})",
                    chip,
                    header.chip_name()
                );
            }
            if header.flash_size() != reported_size {
                warn!(
                    "Detected flash size ({}MB) differs from the bootloader header ({}MB); \
                     use '-f' to change the header",
                    reported_size / 0x10_0000,
                    header.flash_size() / 0x10_0000
                );
            }
            header
        } else {
            ImageHeader::from_bytes(&head)
                .unwrap_or_else(|_| ImageHeader::synthetic(&chip, reported_size))
        };

        Self::finish_open(
            name.to_string(),
            Box::new(dev),
            header,
            bootloader_offset,
            reported_size,
            !check,
        )
    }

    fn finish_open(
        name: String,
        mut dev: Box<dyn FlashIo>,
        header: ImageHeader,
        bootloader_offset: u64,
        flash_size: u64,
        lenient: bool,
    ) -> Result<Self, Error> {
        let table_bytes = dev.read_vec(TABLE_OFFSET, TABLE_SIZE)?;
        let table = match PartitionTable::from_bytes(&table_bytes, flash_size as u32) {
            Ok(table) => table,
            Err(err) if lenient => {
                warn!("No usable partition table: {err}");
                PartitionTable::new(vec![], flash_size as u32)
            }
            Err(err) => return Err(err),
        };

        Ok(Firmware {
            name,
            dev,
            header,
            bootloader_offset,
            table,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    pub fn is_device(&self) -> bool {
        self.dev.is_device()
    }

    pub fn flash_size(&self) -> u64 {
        self.table.flash_size() as u64
    }

    /// Open a bounded view of a partition, by table name or one of the
    /// synthetic names [BOOTLOADER_NAME] and [PARTITION_TABLE_NAME].
    pub fn partition(&mut self, name: &str) -> Result<PartitionIo<'_>, Error> {
        let (offset, size, is_app) = match name {
            BOOTLOADER_NAME => (
                self.bootloader_offset,
                TABLE_OFFSET - self.bootloader_offset,
                true,
            ),
            PARTITION_TABLE_NAME => (TABLE_OFFSET, TABLE_SIZE as u64, false),
            _ => {
                let part = self
                    .table
                    .find(name)
                    .ok_or_else(|| Error::NotFound(name.to_string()))?;
                (part.offset() as u64, part.size() as u64, part.is_app())
            }
        };
        if !self.dev.is_device() && offset >= self.dev.content_end()? {
            return Err(Error::Range(format!(
                "partition '{name}' is not in the firmware file"
            )));
        }
        Ok(PartitionIo::new(self.dev.as_mut(), name, offset, size, is_app))
    }

    /// Size of the app image in the boot partition, or 0 when none is
    /// recognized.
    pub fn app_image_size(&mut self) -> u64 {
        let offset = match self.table.app_part() {
            Ok(part) => part.offset() as u64,
            Err(_) => return 0,
        };
        image_format::image_size(self.dev.as_mut(), offset).unwrap_or(0)
    }

    /// Write the app image from the boot partition to `output`, trimmed to
    /// the 16-byte boundary after its last content byte.
    pub fn extract_app(&mut self, output: &Path) -> Result<u64, Error> {
        let name = self.table.app_part()?.name().to_string();
        let data = {
            let mut part = self.partition(&name)?;
            partition::trim(part.read_all(&mut NoProgress)?, 16)
        };
        let display = output.display().to_string();
        fs::write(output, &data).at_path(&display)?;
        Ok(data.len() as u64)
    }

    /// Copy a partition's contents to a file.
    pub fn read_part(
        &mut self,
        name: &str,
        output: &Path,
        trim: Trim,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<u64, Error> {
        let data = {
            let mut part = self.partition(name)?;
            trim.apply(part.read_all(progress)?)
        };
        let display = output.display().to_string();
        fs::write(output, &data).at_path(&display)?;
        Ok(data.len() as u64)
    }

    /// Write a file's contents into a partition.
    pub fn write_part(
        &mut self,
        name: &str,
        input: &Path,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<u64, Error> {
        let display = input.display().to_string();
        let data = fs::read(input).at_path(&display)?;
        let mut part = self.partition(name)?;
        let written = part.write(0, &data, progress)?;
        Ok(written as u64)
    }

    /// Erase a whole partition.
    pub fn erase_part(&mut self, name: &str) -> Result<(), Error> {
        info!("Erasing partition '{name}'...");
        self.partition(name)?.erase_all()
    }

    /// Erase the head of a filesystem partition (the filesystem metadata),
    /// leaving the rest untouched.
    pub fn erase_fs(&mut self, name: &str) -> Result<(), Error> {
        let part = self
            .table
            .find(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if !part.is_filesystem() {
            return Err(Error::User(format!(
                "partition '{name}' is not a filesystem partition"
            )));
        }
        info!("Erasing filesystem on partition '{name}'...");
        let mut io = self.partition(name)?;
        let len = (4 * BLOCK_SIZE).min(io.size());
        io.erase(0, len)
    }

    /// Apply a planned table change: update the bootloader header, carry
    /// file contents to moved ranges, write the new table and erase
    /// invalidated data partitions on devices.
    pub fn apply_plan(&mut self, plan: &Plan) -> Result<(), Error> {
        let mut header = self.header;
        if plan.flash_size_changed {
            header.set_flash_size(plan.table.flash_size() as u64)?;
        }

        if header != self.header {
            info!(
                "Updating flash size ({}MB) in bootloader header...",
                header.flash_size() / 0x10_0000
            );
            self.dev.set_size_hint(header.flash_size());
            self.dev
                .write_at(self.bootloader_offset, &header.to_bytes(), &mut NoProgress)?;
            image_format::rehash(self.dev.as_mut(), self.bootloader_offset)?;
            self.header = header;
        }

        if !self.dev.is_device() {
            self.carry_over(plan)?;
        }

        info!("Writing partition table...");
        let bytes = plan.table.to_bytes();
        self.partition(PARTITION_TABLE_NAME)?
            .write(0, &bytes, &mut NoProgress)?;
        self.table = plan.table.clone();

        if self.dev.is_device() {
            for name in &plan.touched_data {
                info!("Erasing data partition: {name}...");
                let mut part = self.partition(name)?;
                let len = BLOCK_SIZE.min(part.size());
                part.erase(0, len)?;
            }
        }

        for name in &plan.grown_fs {
            warn!(
                "Filesystem partition '{name}' has grown in place; \
                 use '--fs grow {name}' to grow the filesystem to match"
            );
        }
        for name in &plan.moved_apps {
            warn!("Partition '{name}' moved; the app image there is stale");
        }

        self.check_app_partitions(false, false)
    }

    /// Copy the contents of moved data partitions from their old byte
    /// ranges to the new ones. Bytes without a carried source are left in
    /// the erased state.
    fn carry_over(&mut self, plan: &Plan) -> Result<(), Error> {
        let content_end = self.dev.content_end()?;
        for mv in &plan.carried {
            if mv.old_offset >= content_end {
                continue;
            }
            info!("Moving data partition '{}' to {:#x}...", mv.name, mv.new_offset);
            let len = mv.old_size.min(mv.new_size).min(content_end - mv.old_offset);
            let data = self.dev.read_vec(mv.old_offset, len as usize)?;
            if mv.new_size > len {
                self.dev.erase(mv.new_offset + len, mv.new_size - len)?;
            }
            self.dev.write_at(mv.new_offset, &data, &mut NoProgress)?;
        }
        Ok(())
    }

    /// Check the bootloader and app partitions for app image signatures
    /// and, optionally, verify their SHA-256 digests. With `strict`, a
    /// missing signature or digest mismatch is fatal.
    pub fn check_app_partitions(&mut self, verify_hashes: bool, strict: bool) -> Result<(), Error> {
        let content_end = self.dev.content_end()?;
        let mut names = vec![BOOTLOADER_NAME.to_string()];
        names.extend(
            self.table
                .partitions()
                .iter()
                .filter(|p| p.is_app() && (p.offset() as u64) < content_end)
                .map(|p| p.name().to_string()),
        );

        for name in names {
            let offset = match name.as_str() {
                BOOTLOADER_NAME => self.bootloader_offset,
                _ => self.table.find(&name).map(|p| p.offset() as u64).unwrap_or(0),
            };
            let head = self.dev.read_vec(offset, ImageHeader::SIZE)?;
            let header = match ImageHeader::from_bytes(&head) {
                Ok(header) => header,
                Err(err) => {
                    warn!("Partition '{name}': App image signature not found.");
                    if strict {
                        return Err(err);
                    }
                    continue;
                }
            };
            if header.chip_name() != self.header.chip_name() {
                warn!(
                    "Partition '{name}': app image chip type ({}) does not match bootloader ({})",
                    header.chip_name(),
                    self.header.chip_name()
                );
                continue;
            }
            info!("Partition '{name}': App image signature found.");

            if !verify_hashes {
                continue;
            }
            let check = image_format::check_hash(self.dev.as_mut(), offset)?;
            if check.is_valid() {
                info!("Partition '{name}': Hash confirmed (size={}).", check.size);
            } else {
                warn!(
                    "Partition '{name}': Hash mismatch (size={} computed={} stored={})",
                    check.size,
                    hex::encode(check.computed),
                    check.stored.map(hex::encode).unwrap_or_default()
                );
                if strict {
                    return Err(Error::InvalidImage(format!(
                        "partition '{name}': image hash mismatch"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The whole firmware, from the bootloader to the last content byte,
    /// trimmed to a 16-byte boundary.
    pub fn read_firmware(&mut self, progress: &mut dyn ProgressCallbacks) -> Result<Vec<u8>, Error> {
        let end = self.dev.content_end()?;
        let len = (end - self.bootloader_offset) as usize;
        let mut data = vec![0u8; len];
        self.dev.read_at(self.bootloader_offset, &mut data, progress)?;
        Ok(partition::trim(data, 16))
    }

    /// Write the firmware in `src` to this device, starting at the
    /// bootloader offset, and erase the remainder of the partition the
    /// image ends in.
    pub fn write_firmware(
        &mut self,
        src: &mut Firmware,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<u64, Error> {
        if !self.is_device() {
            return Err(Error::User("firmware must be flashed to a device".into()));
        }
        if src.header.flash_size() != self.header.flash_size() {
            warn!(
                "Destination flash size ({}MB) differs from source flash size ({}MB)",
                self.header.flash_size() / 0x10_0000,
                src.header.flash_size() / 0x10_0000
            );
        }

        let mut data = src.read_firmware(&mut NoProgress)?;
        let pad = (BLOCK_SIZE - data.len() as u64 % BLOCK_SIZE) % BLOCK_SIZE;
        data.resize(data.len() + pad as usize, 0xFF);

        info!("Writing {:#x} bytes of firmware...", data.len());
        self.dev
            .write_at(self.bootloader_offset, &data, progress)?;

        // Erase the rest of the partition the image ends in.
        let end = (self.bootloader_offset + data.len() as u64) as u32;
        if let Some(part) = src
            .table
            .partitions()
            .iter()
            .find(|p| p.end() >= end && p.offset() < end)
        {
            info!("Erasing remainder of partition '{}'...", part.name());
            self.dev.erase(end as u64, (part.end() - end) as u64)?;
        }

        // The device now holds the source's header and table.
        self.header = src.header;
        self.table = src.table.clone();
        Ok(data.len() as u64)
    }

    /// Flush and release the backing device; devices leave bootloader mode
    /// unless reset was suppressed at open time.
    pub fn close(&mut self) -> Result<(), Error> {
        self.dev.close()
    }
}
