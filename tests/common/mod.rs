//! Synthetic firmware fixtures for the integration tests
//!
//! Builds a MicroPython-style ESP32 firmware: a bootloader image with an
//! appended SHA-256, the binary partition table at 0x8000 and a factory
//! app image at 0x10000. Image files start at the bootloader (flash
//! 0x1000); raw flash dumps start at address 0 and stand in for a device
//! behind `--method sim`.

#![allow(dead_code)]

use std::path::Path;

use espimage::{
    ota::{OtaRecord, OtaState},
    partition_table::{AppType, DataType, Partition, PartitionTable, SubType, Type},
};
use sha2::{Digest, Sha256};

pub const MB: u32 = 0x10_0000;
pub const BOOTLOADER_OFFSET: usize = 0x1000;

/// Build a minimal valid app image: header, one segment, padded checksum
/// and appended SHA-256.
pub fn app_image(flash_size_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut image = vec![
        0xE9, // magic
        1,    // num_segments
        0x02, // spi mode dio
        flash_size_id << 4,
    ];
    image.extend_from_slice(&0x4008_0000u32.to_le_bytes()); // entry
    image.push(0xEE); // wp_pin
    image.extend_from_slice(&[0, 0, 0]); // spi_pin_drv
    image.extend_from_slice(&0u16.to_le_bytes()); // chip_id: esp32
    image.push(0); // min_chip_rev
    image.extend_from_slice(&[0, 0]); // min_chip_rev_full
    image.extend_from_slice(&[0xFF, 0xFF]); // max_chip_rev_full
    image.extend_from_slice(&[0; 4]); // reserved
    image.push(1); // hash_appended
    assert_eq!(image.len(), 24);

    image.extend_from_slice(&0x3F40_0000u32.to_le_bytes());
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

fn flash_size_id(flash_size: u32) -> u8 {
    (flash_size / MB).trailing_zeros() as u8
}

/// The stock MicroPython table: nvs + phy_init + factory + vfs.
pub fn default_table(flash_size: u32) -> PartitionTable {
    PartitionTable::new(
        vec![
            Partition::new("nvs", Type::Data, SubType::Data(DataType::Nvs), 0x9000, 0x6000),
            Partition::new("phy_init", Type::Data, SubType::Data(DataType::Phy), 0xf000, 0x1000),
            Partition::new(
                "factory",
                Type::App,
                SubType::App(AppType::Factory),
                0x10000,
                0x1f0000,
            ),
            Partition::new(
                "vfs",
                Type::Data,
                SubType::Data(DataType::Fat),
                0x200000,
                flash_size - 0x200000,
            ),
        ],
        flash_size,
    )
}

/// An OTA table with two app slots of `app_size` bytes.
pub fn ota_table(flash_size: u32, app_size: u32) -> PartitionTable {
    PartitionTable::new(
        vec![
            Partition::new("nvs", Type::Data, SubType::Data(DataType::Nvs), 0x9000, 0x5000),
            Partition::new("otadata", Type::Data, SubType::Data(DataType::Ota), 0xe000, 0x2000),
            Partition::new("ota_0", Type::App, SubType::App(AppType::Ota0), 0x10000, app_size),
            Partition::new(
                "ota_1",
                Type::App,
                SubType::App(AppType::Ota1),
                0x10000 + app_size,
                app_size,
            ),
            Partition::new(
                "vfs",
                Type::Data,
                SubType::Data(DataType::Fat),
                0x10000 + 2 * app_size,
                flash_size - (0x10000 + 2 * app_size),
            ),
        ],
        flash_size,
    )
}

pub struct Fixture {
    pub bootloader: Vec<u8>,
    pub app: Vec<u8>,
    pub table: PartitionTable,
}

fn varied_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect()
}

fn render(table: &PartitionTable, flash_size: u32, base: usize) -> (Vec<u8>, Fixture) {
    let id = flash_size_id(flash_size);
    let bootloader = app_image(id, &varied_payload(0x5e0));
    let app = app_image(id, &varied_payload(0x12345));

    let mut buf = vec![0xFFu8; flash_size as usize - base];
    let at = |flash_addr: usize| flash_addr - base;

    buf[at(BOOTLOADER_OFFSET)..at(BOOTLOADER_OFFSET) + bootloader.len()]
        .copy_from_slice(&bootloader);
    let table_bytes = table.to_bytes();
    buf[at(0x8000)..at(0x8000) + table_bytes.len()].copy_from_slice(&table_bytes);
    let app_offset = table.app_part().unwrap().offset() as usize;
    buf[at(app_offset)..at(app_offset) + app.len()].copy_from_slice(&app);

    (
        buf,
        Fixture {
            bootloader,
            app,
            table: table.clone(),
        },
    )
}

/// Write a firmware image file (first byte = start of the bootloader).
pub fn build_image_file(path: &Path, flash_size: u32) -> Fixture {
    let table = default_table(flash_size);
    let (buf, fixture) = render(&table, flash_size, BOOTLOADER_OFFSET);
    std::fs::write(path, buf).unwrap();
    fixture
}

/// Write a raw flash dump (first byte = flash address 0) with an OTA
/// table and boot-selection records declaring sequence `seq`.
pub fn build_ota_dump(path: &Path, flash_size: u32, app_size: u32, seq: u32) -> Fixture {
    let table = ota_table(flash_size, app_size);
    let (mut buf, fixture) = render(&table, flash_size, 0);

    let otadata = table.find("otadata").unwrap().offset() as usize;
    buf[otadata..otadata + 32].copy_from_slice(&OtaRecord::to_bytes(seq, OtaState::Valid));

    std::fs::write(path, buf).unwrap();
    fixture
}

/// A rendered row of the partition-table listing, in the fixed format the
/// fixtures rely on.
pub fn table_row(name: &str, ty: &str, subtype: &str, offset: u32, size: u32, flags: u32) -> String {
    let size_str = if size < MB / 2 {
        format!("({:.1} kB)", size as f64 / 1024.0)
    } else {
        format!("({:.1} MB)", size as f64 / MB as f64)
    };
    format!(
        "  {:16} {:8} {:8} {:>#10x} {:>#10x} {:>#10x} {:>#4x} {:>10}",
        name,
        ty,
        subtype,
        offset,
        size,
        offset + size,
        flags,
        size_str,
    )
}
