//! End-to-end tests for device-only behavior, driven through the
//! simulated bootloader transport (`--method sim` on a raw flash dump).

mod common;

use std::{path::PathBuf, process::Command};

use assert_cmd::prelude::*;
use common::{build_ota_dump, MB};
use espimage::{
    image_format,
    ota::{ota_crc, OtaRecord},
    partition_table::PartitionTable,
};
use predicates::prelude::*;
use tempfile::TempDir;

const APP_SIZE: u32 = 0x200000;

fn espimage(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("espimage").unwrap();
    cmd.current_dir(dir.path());
    cmd
}

fn dump(dir: &TempDir, seq: u32) -> (PathBuf, common::Fixture) {
    let path = dir.path().join("flash.bin");
    let fixture = build_ota_dump(&path, 8 * MB, APP_SIZE, seq);
    (path, fixture)
}

fn record_at(bytes: &[u8], offset: usize) -> OtaRecord {
    OtaRecord::from_bytes(&bytes[offset..offset + 0x20])
}

#[test]
fn ota_update_writes_the_inactive_slot_and_bumps_the_sequence() {
    let dir = TempDir::new().unwrap();
    // Active sequence 3: slot (3 - 1) % 2 = 0, so ota_0 is running
    let (path, fixture) = dump(&dir, 3);

    let new_app = common::app_image(3, b"replacement app firmware payload");
    std::fs::write(dir.path().join("new.app-bin"), &new_app).unwrap();

    let before = std::fs::read(&path).unwrap();

    espimage(&dir)
        .arg(&path)
        .args(["--method", "sim", "--ota-update", "new.app-bin"])
        .assert()
        .success();

    let after = std::fs::read(&path).unwrap();
    let table = fixture.table;
    let ota_0 = table.find("ota_0").unwrap();
    let ota_1 = table.find("ota_1").unwrap();
    let otadata = table.find("otadata").unwrap().offset() as usize;

    // The active slot is untouched, byte for byte
    let r0 = ota_0.offset() as usize..ota_0.end() as usize;
    assert_eq!(&after[r0.clone()], &before[r0]);

    // The inactive slot holds the new image, rest of the slot erased
    let at = ota_1.offset() as usize;
    assert_eq!(&after[at..at + new_app.len()], &new_app[..]);
    let tail = at + new_app.len().next_multiple_of(0x1000);
    assert!(after[tail..ota_1.end() as usize].iter().all(|&b| b == 0xFF));

    // The new image's trailing SHA-256 verifies in place
    let mut flash = espimage::flash::FileFlash::open(&path, 0).unwrap();
    assert!(image_format::check_hash(&mut flash, ota_1.offset() as u64)
        .unwrap()
        .is_valid());

    // otadata: first record selects slot 1 with seq 4, second still has 3
    let first = record_at(&after, otadata);
    let second = record_at(&after, otadata + 0x1000);
    assert_eq!(first.seq, 4);
    assert_eq!(first.crc, ota_crc(4));
    assert!(first.is_valid());
    assert_eq!(second.seq, 3);
    assert!(second.is_valid());
}

#[test]
fn ota_update_twice_returns_to_slot_zero() {
    let dir = TempDir::new().unwrap();
    let (path, fixture) = dump(&dir, 3);

    let new_app = common::app_image(3, b"first replacement");
    std::fs::write(dir.path().join("new.app-bin"), &new_app).unwrap();
    espimage(&dir)
        .arg(&path)
        .args(["--method", "sim", "--ota-update", "new.app-bin"])
        .assert()
        .success();

    let second_app = common::app_image(3, b"second replacement");
    std::fs::write(dir.path().join("second.app-bin"), &second_app).unwrap();
    espimage(&dir)
        .arg(&path)
        .args(["--method", "sim", "--ota-update", "second.app-bin"])
        .assert()
        .success();

    let after = std::fs::read(&path).unwrap();
    let table = fixture.table;
    let otadata = table.find("otadata").unwrap().offset() as usize;
    assert_eq!(record_at(&after, otadata).seq, 5);
    // Sequence 5 selects slot (5 - 1) % 2 = 0 again
    let at = table.find("ota_0").unwrap().offset() as usize;
    assert_eq!(&after[at..at + second_app.len()], &second_app[..]);
}

#[test]
fn oversized_ota_image_is_rejected_without_touching_otadata() {
    let dir = TempDir::new().unwrap();
    let (path, fixture) = dump(&dir, 3);
    let before = std::fs::read(&path).unwrap();

    // An "image" larger than the 2MB slot
    let huge = vec![0xAB; (APP_SIZE + 0x1000) as usize];
    std::fs::write(dir.path().join("huge.bin"), huge).unwrap();

    espimage(&dir)
        .arg(&path)
        .args(["--method", "sim", "--ota-update", "huge.bin"])
        .assert()
        .failure();

    let after = std::fs::read(&path).unwrap();
    let otadata = fixture.table.find("otadata").unwrap().offset() as usize;
    assert_eq!(
        &after[otadata..otadata + 0x2000],
        &before[otadata..otadata + 0x2000]
    );
}

#[test]
fn table_rewrite_erases_invalidated_data_partitions() {
    let dir = TempDir::new().unwrap();
    let (path, fixture) = dump(&dir, 3);

    // Plant recognizable content in nvs
    let mut bytes = std::fs::read(&path).unwrap();
    let nvs = fixture.table.find("nvs").unwrap().offset() as usize;
    bytes[nvs..nvs + 0x100].fill(0x5A);
    std::fs::write(&path, bytes).unwrap();

    espimage(&dir)
        .arg(&path)
        .args(["--method", "sim", "--resize", "nvs=0x4000"])
        .assert()
        .success();

    let after = std::fs::read(&path).unwrap();
    // The resized nvs partition had its first block erased on the device
    assert!(after[nvs..nvs + 0x1000].iter().all(|&b| b == 0xFF));

    let table =
        PartitionTable::from_bytes(&after[0x8000..0x8C00], 8 * MB).unwrap();
    assert_eq!(table.find("nvs").unwrap().size(), 0x4000);
}

#[test]
fn flash_writes_a_firmware_file_to_the_device() {
    let dir = TempDir::new().unwrap();

    // Source: a 4MB firmware image file; target: a blank 4MB flash dump
    let image = dir.path().join("firmware.bin");
    let fixture = common::build_image_file(&image, 4 * MB);
    let target = dir.path().join("blank.bin");
    std::fs::write(&target, vec![0xFFu8; (4 * MB) as usize]).unwrap();

    espimage(&dir)
        .arg(&image)
        .args(["--method", "sim", "--flash"])
        .arg(&target)
        .assert()
        .success();

    let flashed = std::fs::read(&target).unwrap();
    // The bootloader landed at its boot offset
    assert_eq!(
        &flashed[0x1000..0x1000 + fixture.bootloader.len()],
        &fixture.bootloader[..]
    );
    // The table region is byte-identical to the source's
    let table = PartitionTable::from_bytes(&flashed[0x8000..0x8C00], 4 * MB).unwrap();
    assert_eq!(&table, &fixture.table);
    // And the factory app is in place
    let app_at = fixture.table.find("factory").unwrap().offset() as usize;
    assert_eq!(&flashed[app_at..app_at + fixture.app.len()], &fixture.app[..]);
}

#[test]
fn missing_bootloader_on_device_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blank.bin");
    std::fs::write(&path, vec![0xFFu8; (4 * MB) as usize]).unwrap();

    espimage(&dir)
        .arg(&path)
        .args(["--method", "sim"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no bootloader"));
}
