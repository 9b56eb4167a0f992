//! End-to-end tests driving the espimage binary against synthetic
//! firmware image files.

mod common;

use std::{path::PathBuf, process::Command};

use assert_cmd::prelude::*;
use common::{build_image_file, table_row, MB};
use espimage::{image_format, partition_table::PartitionTable};
use predicates::prelude::*;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const TABLE_FILE_OFFSET: usize = 0x7000;

fn espimage(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("espimage").unwrap();
    cmd.current_dir(dir.path());
    cmd
}

fn fixture(dir: &TempDir, flash_size: u32) -> (PathBuf, common::Fixture) {
    let path = dir.path().join("firmware.bin");
    let fixture = build_image_file(&path, flash_size);
    (path, fixture)
}

fn read_table(path: &PathBuf) -> PartitionTable {
    let bytes = std::fs::read(path).unwrap();
    PartitionTable::from_bytes(&bytes[TABLE_FILE_OFFSET..TABLE_FILE_OFFSET + 0xC00], 0).unwrap()
}

#[test]
fn prints_the_partition_table() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 4 * MB);

    espimage(&dir)
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Chip type: esp32"))
        .stdout(predicate::str::contains("Flash size: 4MB"))
        .stdout(predicate::str::contains(table_row(
            "nvs", "data", "nvs", 0x9000, 0x6000, 0,
        )))
        .stdout(predicate::str::contains(table_row(
            "phy_init", "data", "phy", 0xf000, 0x1000, 0,
        )))
        .stdout(predicate::str::contains(table_row(
            "factory", "app", "factory", 0x10000, 0x1f0000, 0,
        )))
        .stdout(predicate::str::contains(table_row(
            "vfs", "data", "fat", 0x200000, 0x200000, 0,
        )));
}

#[test]
fn resize_flash_grows_vfs_and_rewrites_the_header() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 4 * MB);

    espimage(&dir)
        .arg(&path)
        .args(["-f", "8M", "--resize", "vfs=0"])
        .assert()
        .success();

    let table = read_table(&path);
    let vfs = table.find("vfs").unwrap();
    assert_eq!(vfs.offset(), 0x200000);
    assert_eq!(vfs.size(), 0x600000);
    // Everything before vfs is untouched
    assert_eq!(table.find("nvs").unwrap().size(), 0x6000);
    assert_eq!(table.find("factory").unwrap().offset(), 0x10000);

    // The header flash-size nibble now encodes 8MB (id 3)
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes[3] >> 4, 3);

    // The bootloader image hash was recomputed for the new header
    let mut flash = espimage::flash::FileFlash::open(&path, 0x1000).unwrap();
    let check = image_format::check_hash(&mut flash, 0x1000).unwrap();
    assert!(check.is_valid());
}

#[test]
fn ota_template_layout_on_8mb() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 8 * MB);

    espimage(&dir)
        .arg(&path)
        .args(["--table", "ota"])
        .assert()
        .success();

    let table = read_table(&path);
    let entries: Vec<(String, u32, u32)> = table
        .partitions()
        .iter()
        .map(|p| (p.name().to_string(), p.offset(), p.size()))
        .collect();
    assert_eq!(
        entries,
        vec![
            ("nvs".into(), 0x9000, 0x5000),
            ("otadata".into(), 0xe000, 0x2000),
            ("ota_0".into(), 0x10000, 0x200000),
            ("ota_1".into(), 0x210000, 0x200000),
            ("vfs".into(), 0x410000, 0x3f0000),
        ]
    );
}

#[test]
fn delete_then_grow_into_the_gap() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 4 * MB);

    espimage(&dir)
        .arg(&path)
        .args(["--delete", "phy_init", "--resize", "nvs=0"])
        .assert()
        .success();

    // Parsing verifies the rewritten MD5 record
    let table = read_table(&path);
    assert!(table.find("phy_init").is_none());
    let nvs = table.find("nvs").unwrap();
    assert_eq!((nvs.offset(), nvs.size()), (0x9000, 0x7000));
    assert_eq!(table.find("factory").unwrap().offset(), 0x10000);
}

#[test]
fn adding_an_overlapping_partition_fails() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 4 * MB);
    let before = std::fs::read(&path).unwrap();

    espimage(&dir)
        .arg(&path)
        .args(["--add", "vfs2=fat:2M:1M"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("overlap"));

    // Planner errors surface before anything is written
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn resizing_back_restores_the_identical_file() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 4 * MB);

    let sha = |p: &PathBuf| -> [u8; 32] { Sha256::digest(std::fs::read(p).unwrap()).into() };
    let sha1 = sha(&path);

    espimage(&dir)
        .arg(&path)
        .args(["-f", "8M", "--resize", "vfs=0"])
        .assert()
        .success();
    let sha2 = sha(&path);

    espimage(&dir)
        .arg(&path)
        .args(["-f", "4M", "--resize", "vfs=0"])
        .assert()
        .success();
    let sha3 = sha(&path);

    assert_ne!(sha1, sha2);
    assert_eq!(sha1, sha3);
}

#[test]
fn write_read_and_erase_a_partition() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 4 * MB);

    let input: Vec<u8> = (0..32u8).cycle().take(256).collect();
    std::fs::write(dir.path().join("input.bin"), &input).unwrap();

    espimage(&dir)
        .arg(&path)
        .args(["--write", "phy_init=input.bin"])
        .assert()
        .success();
    espimage(&dir)
        .arg(&path)
        .args(["--read", "phy_init=output1.bin"])
        .assert()
        .success();

    let output1 = std::fs::read(dir.path().join("output1.bin")).unwrap();
    assert_eq!(output1.len(), 4096);
    assert_eq!(&output1[..input.len()], &input[..]);
    assert!(output1[input.len()..].iter().all(|&b| b == 0xFF));

    espimage(&dir)
        .arg(&path)
        .args(["--erase", "phy_init"])
        .assert()
        .success();
    espimage(&dir)
        .arg(&path)
        .args(["--read", "phy_init=output2.bin"])
        .assert()
        .success();

    let output2 = std::fs::read(dir.path().join("output2.bin")).unwrap();
    assert_eq!(output2.len(), 4096);
    assert!(output2.iter().all(|&b| b == 0xFF));
}

#[test]
fn extract_app_writes_the_exact_image() {
    let dir = TempDir::new().unwrap();
    let (path, fixture) = fixture(&dir, 4 * MB);

    espimage(&dir).arg(&path).arg("--extract-app").assert().success();

    let output = std::fs::read(dir.path().join("firmware.app-bin")).unwrap();
    assert_eq!(output.len(), fixture.app.len());
    assert_eq!(output, fixture.app);
}

#[test]
fn read_bootloader_with_and_without_trim() {
    let dir = TempDir::new().unwrap();
    let (path, fixture) = fixture(&dir, 4 * MB);

    espimage(&dir)
        .arg(&path)
        .args(["--read", "bootloader=out.bin"])
        .assert()
        .success();
    let raw = std::fs::read(dir.path().join("out.bin")).unwrap();
    assert_eq!(raw.len(), 0x7000);
    assert_eq!(&raw[..fixture.bootloader.len()], &fixture.bootloader[..]);

    espimage(&dir)
        .arg(&path)
        .args(["--read", "bootloader=out.bin", "--trim"])
        .assert()
        .success();
    let trimmed = std::fs::read(dir.path().join("out.bin")).unwrap();
    assert_eq!(trimmed.len(), fixture.bootloader.len());
    assert_eq!(trimmed, fixture.bootloader);
}

#[test]
fn write_back_a_read_keeps_the_file_identical() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 4 * MB);
    let before = std::fs::read(&path).unwrap();

    espimage(&dir)
        .arg(&path)
        .args(["--read", "bootloader=bootloader.bin"])
        .assert()
        .success();
    assert_eq!(std::fs::read(&path).unwrap(), before);

    espimage(&dir)
        .arg(&path)
        .args(["--write", "bootloader=bootloader.bin"])
        .assert()
        .success();
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn check_app_verifies_hashes() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 4 * MB);

    espimage(&dir).arg(&path).arg("--check-app").assert().success();

    // Corrupt a byte of the factory app payload: --check-app now fails
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0xf000 + 0x40] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    espimage(&dir)
        .arg(&path)
        .arg("--check-app")
        .assert()
        .failure()
        .stderr(predicate::str::contains("hash mismatch"));
}

#[test]
fn output_file_leaves_the_input_untouched() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 4 * MB);
    let before = std::fs::read(&path).unwrap();

    espimage(&dir)
        .arg(&path)
        .args(["--resize", "vfs=1M", "-o", "modified.bin"])
        .assert()
        .success();

    assert_eq!(std::fs::read(&path).unwrap(), before);
    let table = read_table(&dir.path().join("modified.bin"));
    assert_eq!(table.find("vfs").unwrap().size(), 0x100000);
}

#[test]
fn unknown_partition_name_fails() {
    let dir = TempDir::new().unwrap();
    let (path, _) = fixture(&dir, 4 * MB);

    espimage(&dir)
        .arg(&path)
        .args(["--erase", "bogus"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bogus"));
}
