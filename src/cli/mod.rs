//! Command-line interface: argument surface, option routing, table
//! rendering and progress display

use std::{fs, path::PathBuf};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, LevelFilter};

use crate::{
    device::{expand_device_name, is_device, Bootloader, SimBootloader},
    directive::{self, Directive, TableSelector},
    error::{Error, ResultExt},
    firmware::{Firmware, Trim},
    layout,
    lfs::{BlockDevice, FsCommands, Vfs, VfsProvider},
    ota,
    partition_table::PartitionTable,
    progress::ProgressCallbacks,
};

const MB: u64 = 0x10_0000;
const KB: u64 = 0x400;

/// Manipulate MicroPython ESP32 firmware images and device flash storage.
#[derive(Debug, Parser)]
#[command(name = "espimage", version, max_term_width = 100)]
pub struct Cli {
    /// Image file, or serial device of an attached ESP32 (short forms:
    /// u0=/dev/ttyUSB0, a0=/dev/ttyACM0, c0=COM0)
    pub filename: String,

    /// Size of the flash for the new partition table (eg. 8M, 0x800000)
    #[arg(short = 'f', long, value_name = "SIZE")]
    pub flash_size: Option<String>,

    /// Size of the app partitions (factory and OTA slots)
    #[arg(short = 'a', long, value_name = "SIZE")]
    pub app_size: Option<String>,

    /// Rebuild the partition table: 'default', 'original', 'ota' or an
    /// explicit layout such as 'nvs=7B,factory=2M,vfs=0'
    #[arg(long, value_name = "LAYOUT")]
    pub table: Option<String>,

    /// Load a new partition table from a CSV file
    #[arg(long, value_name = "FILE")]
    pub from_csv: Option<PathBuf>,

    /// Delete the named partitions
    #[arg(long, value_name = "NAME1[,NAME2]")]
    pub delete: Option<String>,

    /// Add partitions, eg. 'vfs2=fat:1M:1M'
    #[arg(long, value_name = "NAME=SUBTYPE:OFFSET:SIZE[,...]")]
    pub add: Option<String>,

    /// Resize partitions, eg. 'factory=2M,vfs=0' (0 fills the free space)
    #[arg(short = 'r', long, value_name = "NAME1=SIZE1[,...]")]
    pub resize: Option<String>,

    /// Rename partitions, eg. 'vfs=data0'
    #[arg(long, value_name = "OLD=NEW[,...]")]
    pub rename: Option<String>,

    /// Erase the named partitions
    #[arg(long, value_name = "NAME1[,NAME2]")]
    pub erase: Option<String>,

    /// Erase the first blocks of the named filesystem partitions
    #[arg(long, value_name = "NAME1[,NAME2]")]
    pub erase_fs: Option<String>,

    /// Copy partitions into files, eg. 'vfs=backup.bin'
    #[arg(long, value_name = "NAME1=FILE1[,...]")]
    pub read: Option<String>,

    /// Write files into partitions, eg. 'vfs=backup.bin'
    #[arg(long, value_name = "NAME1=FILE1[,...]")]
    pub write: Option<String>,

    /// Extract the app image from the firmware
    #[arg(short = 'x', long)]
    pub extract_app: bool,

    /// Perform an OTA update with the given app image
    #[arg(long, value_name = "FILE")]
    pub ota_update: Option<PathBuf>,

    /// Flash this firmware image to the given device
    #[arg(long, value_name = "DEVICE")]
    pub flash: Option<String>,

    /// Trim '--read' output at the 16-byte boundary after the content
    #[arg(long)]
    pub trim: bool,

    /// Trim '--read' output at the 4 KiB block boundary after the content
    #[arg(long)]
    pub trimblocks: bool,

    /// Run a filesystem command:
    /// ls/cat/get/put/mkdir/rm/rename/mkfs/grow/df/info
    #[arg(long, value_name = "CMD", num_args = 1..)]
    pub fs: Option<Vec<String>>,

    /// Verify the SHA-256 of the bootloader and app images (mismatches
    /// are fatal)
    #[arg(long)]
    pub check_app: bool,

    /// Write the OTA update without the bootloader rollback safety
    #[arg(long)]
    pub no_rollback: bool,

    /// Leave the device in the bootloader on close (no hard reset)
    #[arg(long)]
    pub no_reset: bool,

    /// Baud rate for the serial connection
    #[arg(short = 'b', long)]
    pub baud: Option<u32>,

    /// Bootloader transport: 'stub' (serial flasher stub) or 'sim' (treat
    /// the file as a raw flash dump on a simulated device)
    #[arg(long, default_value = "stub", value_name = "METHOD")]
    pub method: String,

    /// Write the modified image to this file instead of in place
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Mute program output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Print additional info
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Log level: error, warn, info, debug or trace (overrides -q and -d)
    #[arg(long, value_name = "LEVEL")]
    pub log: Option<String>,
}

impl Cli {
    pub fn log_level(&self) -> LevelFilter {
        if let Some(level) = &self.log {
            return level.parse().unwrap_or(LevelFilter::Info);
        }
        if self.debug {
            LevelFilter::Debug
        } else if self.quiet {
            LevelFilter::Warn
        } else {
            LevelFilter::Info
        }
    }

    fn trim_mode(&self) -> Trim {
        if self.trimblocks {
            Trim::Blocks
        } else if self.trim {
            Trim::Bytes
        } else {
            Trim::Raw
        }
    }

    /// The table directives, in their fixed application order.
    fn table_directives(&self) -> Result<Vec<Directive>, Error> {
        let mut directives = vec![];
        if let Some(size) = &self.flash_size {
            directives.push(Directive::ResizeFlash(directive::parse_size(size)?));
        }
        if let Some(table) = &self.table {
            directives.push(Directive::Table(TableSelector::parse(table)?));
        }
        if let Some(path) = &self.from_csv {
            directives.push(Directive::FromCsv(path.clone()));
        }
        if let Some(names) = &self.delete {
            directives.push(Directive::Delete(directive::parse_names(names)?));
        }
        if let Some(specs) = &self.add {
            directives.push(Directive::Add(directive::parse_part_list(specs)?));
        }
        if let Some(entries) = &self.resize {
            directives.push(Directive::Resize(directive::parse_resize_list(entries)?));
        }
        if let Some(entries) = &self.rename {
            directives.push(Directive::Rename(directive::parse_pairs(entries)?));
        }
        if let Some(size) = &self.app_size {
            let size = directive::parse_size(size)?;
            if size > 0 {
                directives.push(Directive::AppSize(size));
            }
        }
        Ok(directives)
    }

    /// The I/O directives, in their fixed application order.
    fn io_directives(&self) -> Result<Vec<Directive>, Error> {
        let mut ops = vec![];
        if self.extract_app {
            ops.push(Directive::ExtractApp);
        }
        if let Some(arg) = &self.read {
            ops.push(Directive::Read(directive::parse_pairs(arg)?));
        }
        if let Some(arg) = &self.write {
            ops.push(Directive::Write(directive::parse_pairs(arg)?));
        }
        if let Some(arg) = &self.erase {
            ops.push(Directive::Erase(directive::parse_names(arg)?));
        }
        if let Some(arg) = &self.erase_fs {
            ops.push(Directive::EraseFs(directive::parse_names(arg)?));
        }
        if let Some(path) = &self.ota_update {
            ops.push(Directive::OtaUpdate(path.clone()));
        }
        if let Some(device) = &self.flash {
            ops.push(Directive::Flash(device.clone()));
        }
        if let Some(args) = &self.fs {
            ops.push(Directive::Fs(args.clone()));
        }
        Ok(ops)
    }
}

/// Build a bootloader client for `port` according to `--method`.
pub fn connect(port: &str, baud: Option<u32>, method: &str) -> Result<Box<dyn Bootloader>, Error> {
    match method {
        "sim" => {
            if let Some(baud) = baud {
                log::debug!("Simulated device ignores baud rate {baud}");
            }
            Ok(Box::new(SimBootloader::open(PathBuf::from(port))?))
        }
        "stub" => Err(Error::Device(format!(
            "no serial transport is linked into this build for '{port}'; \
             use '--method sim' with a raw flash dump, or operate on an image file"
        ))),
        other => Err(Error::User(format!("unknown method '{other}'"))),
    }
}

/// Entry point for a parsed command line.
pub fn run(cli: Cli) -> Result<(), Error> {
    let filename = expand_device_name(&cli.filename);
    // With '--flash' the input is the source image; the method selects the
    // transport of the flashed device instead.
    if cli.flash.is_some() && is_device(&filename) {
        return Err(Error::User(
            "'--flash' writes an image file to a device; the input must be a file".into(),
        ));
    }
    let use_device = cli.flash.is_none() && (cli.method == "sim" || is_device(&filename));

    let mut firmware = if use_device {
        info!("Opening esp32 device at: {filename}...");
        let client = connect(&filename, cli.baud, &cli.method)?;
        Firmware::open_device(&filename, client, !cli.no_reset, true)?
    } else {
        info!("Opening image file: {filename}...");
        Firmware::open_file(std::path::Path::new(&filename))?
    };

    let result = run_with(&cli, &mut firmware);
    let closed = firmware.close();
    result?;
    closed
}

fn run_with(cli: &Cli, firmware: &mut Firmware) -> Result<(), Error> {
    println!("Chip type: {}", firmware.header().chip_name());
    println!("Flash size: {}MB", firmware.flash_size() / MB);
    let app_size = firmware.app_image_size();
    if app_size > 0 {
        println!("Micropython App size: {app_size:#x} bytes ({} KB)", app_size / KB);
    }
    print_table(firmware.table(), app_size);

    // Table-changing directives are planned as one batch and written once.
    let directives = cli.table_directives()?;
    if !directives.is_empty() {
        let plan = layout::plan(firmware.table(), &directives)?;

        if let (Some(output), false) = (&cli.output, firmware.is_device()) {
            let display = output.display().to_string();
            info!("Writing output file: {display}...");
            fs::copy(&cli.filename, output).at_path(&display)?;
            *firmware = Firmware::open_file(output)?;
        } else {
            info!("Writing new table to: {}...", firmware.name());
        }

        firmware.apply_plan(&plan)?;
        let app_size = firmware.app_image_size();
        print_table(firmware.table(), app_size);
    }

    for op in cli.io_directives()? {
        execute(cli, firmware, op, directives.is_empty())?;
    }

    if cli.check_app {
        firmware.check_app_partitions(true, true)?;
    }

    Ok(())
}

/// Carry out one I/O directive against the open firmware.
fn execute(
    cli: &Cli,
    firmware: &mut Firmware,
    op: Directive,
    table_unchanged: bool,
) -> Result<(), Error> {
    match op {
        Directive::ExtractApp => {
            let output = match (&cli.output, table_unchanged) {
                (Some(output), true) => output.clone(),
                _ => app_image_name(&cli.filename),
            };
            info!("Writing micropython app image file: {}...", output.display());
            firmware.extract_app(&output)?;
        }
        Directive::Read(pairs) => {
            for (name, file) in pairs {
                info!("Saving partition '{name}' into '{file}'...");
                let n =
                    firmware.read_part(&name, std::path::Path::new(&file), cli.trim_mode(), &mut bar())?;
                info!("Wrote {n:#x} bytes to '{file}'.");
            }
        }
        Directive::Write(pairs) => {
            for (name, file) in pairs {
                info!("Writing partition '{name}' from '{file}'...");
                let n = firmware.write_part(&name, std::path::Path::new(&file), &mut bar())?;
                info!("Wrote {n:#x} bytes to '{name}'.");
            }
        }
        Directive::Erase(names) => {
            for name in names {
                firmware.erase_part(&name)?;
            }
        }
        Directive::EraseFs(names) => {
            for name in names {
                firmware.erase_fs(&name)?;
            }
        }
        Directive::OtaUpdate(path) => {
            info!("Performing OTA firmware upgrade from '{}'...", path.display());
            ota::ota_update(firmware, &path, cli.no_rollback, &mut bar())?;
        }
        Directive::Flash(device) => {
            let port = expand_device_name(&device);
            info!("Flashing firmware to device at {port}...");
            let client = connect(&port, cli.baud, &cli.method)?;
            let mut target = Firmware::open_device(&port, client, !cli.no_reset, false)?;
            let result = target.write_firmware(firmware, &mut bar());
            let closed = target.close();
            result?;
            closed?;
        }
        Directive::Fs(args) => {
            FsCommands::new(firmware, &UnboundLittleFs).run(&args)?;
        }
        _ => unreachable!("not an I/O directive"),
    }
    Ok(())
}

/// `firmware.bin` -> `firmware.app-bin`
fn app_image_name(input: &str) -> PathBuf {
    let base = PathBuf::from(input);
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "firmware".into());
    PathBuf::from(format!("{stem}.app-bin"))
}

/// Render a partition table in the fixed fixture format.
pub fn print_table(table: &PartitionTable, app_size: u64) {
    println!("Partition table (flash size: {}MB):", table.flash_size() as u64 / MB);
    println!("# Name             Type     SubType      Offset       Size      (End)  Flags");
    for p in table.partitions() {
        let size_str = if (p.size() as u64) < MB / 2 {
            format!("({:.1} kB)", p.size() as f64 / KB as f64)
        } else {
            format!("({:.1} MB)", p.size() as f64 / MB as f64)
        };
        println!(
            "  {:16} {:8} {:8} {:>#10x} {:>#10x} {:>#10x} {:>#4x} {:>10}",
            p.name(),
            p.ty().to_string(),
            p.sub_type().to_string(),
            p.offset(),
            p.size(),
            p.end(),
            p.flags(),
            size_str,
        );
    }

    if app_size > 0 {
        if let Ok(app) = table.app_part() {
            println!(
                "Micropython app fills {:.1}% of {} partition ({} kB free)",
                100.0 * app_size as f64 / app.size() as f64,
                app.name(),
                (app.size() as u64).saturating_sub(app_size) / KB
            );
        }
    }
}

/// An [indicatif] progress bar driven through [ProgressCallbacks].
pub struct CliProgress {
    bar: Option<ProgressBar>,
}

pub fn bar() -> CliProgress {
    CliProgress { bar: None }
}

impl ProgressCallbacks for CliProgress {
    fn init(&mut self, addr: u64, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40.cyan/blue} {bytes:>9}/{total_bytes:9} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
        );
        bar.set_message(format!("0x{addr:X}"));
        self.bar = Some(bar);
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// Placeholder for the littlefs binding, which links in through
/// [VfsProvider].
struct UnboundLittleFs;

impl VfsProvider for UnboundLittleFs {
    fn mount<'a>(&self, dev: BlockDevice<'a>) -> Result<Box<dyn Vfs + 'a>, Error> {
        Err(no_littlefs(dev.partition_name()))
    }

    fn format(&self, dev: &mut BlockDevice<'_>, _block_count: u64) -> Result<(), Error> {
        Err(no_littlefs(dev.partition_name()))
    }

    fn grow(&self, dev: &mut BlockDevice<'_>, _block_count: u64) -> Result<(), Error> {
        Err(no_littlefs(dev.partition_name()))
    }
}

fn no_littlefs(part: &str) -> Error {
    Error::Fs(format!(
        "no littlefs binding is linked into this build (while mounting '{part}'); \
         link one through espimage::lfs::VfsProvider"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition_table::{DataType, Partition, SubType, Type};

    #[test]
    fn rendered_table_is_stable() {
        let table = PartitionTable::new(
            vec![
                Partition::new("nvs", Type::Data, SubType::Data(DataType::Nvs), 0x9000, 0x6000),
                Partition::new("vfs", Type::Data, SubType::Data(DataType::Fat), 0x200000, 0x200000),
            ],
            0x400000,
        );

        // Exercises the fixed column layout the fixtures rely on
        let p = table.partitions();
        assert_eq!(p[0].end(), 0xf000);
        let line = format!(
            "  {:16} {:8} {:8} {:>#10x} {:>#10x} {:>#10x} {:>#4x} {:>10}",
            p[0].name(),
            p[0].ty().to_string(),
            p[0].sub_type().to_string(),
            p[0].offset(),
            p[0].size(),
            p[0].end(),
            p[0].flags(),
            "(24.0 kB)",
        );
        assert_eq!(
            line,
            "  nvs              data     nvs          0x9000     0x6000     0xf000  0x0  (24.0 kB)"
        );
    }

    #[test]
    fn app_image_names() {
        assert_eq!(
            app_image_name("ESP32_GENERIC-20231005-v1.21.0.bin"),
            PathBuf::from("ESP32_GENERIC-20231005-v1.21.0.app-bin")
        );
        assert_eq!(app_image_name("firmware"), PathBuf::from("firmware.app-bin"));
    }
}
