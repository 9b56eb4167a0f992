//! LittleFS support: block device binding and filesystem commands
//!
//! A data partition is presented to the filesystem as a block device with
//! 4 KiB read, program and erase sizes, behind a write-back block cache
//! that coalesces programs into whole-block writes (serial links pay per
//! block). The littlefs implementation itself binds through [VfsProvider];
//! the command processor here implements the `--fs` surface on top of the
//! mounted [Vfs].

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::{
    error::{Error, ResultExt},
    firmware::Firmware,
    partition::PartitionIo,
    progress::NoProgress,
};

/// Filesystem block size: one flash block.
pub const FS_BLOCK_SIZE: u64 = 0x1000;

/// Default partition for unqualified `--fs` paths.
const DEFAULT_FS_PART: &str = "vfs";

/// `boot.py` written to a freshly formatted filesystem.
const BOOT_PY: &str = "\
# This file is executed on every boot (including wake-boot from deepsleep)
#import esp
#esp.osdebug(None)
#import webrepl
#webrepl.start()
";

/// A partition viewed as a block device, with a write-back block cache.
///
/// The cache holds dirty blocks until [BlockDevice::sync]; the device owns
/// its partition window exclusively, so no external write can invalidate
/// cached content while it is mounted.
pub struct BlockDevice<'a> {
    part: PartitionIo<'a>,
    dirty: BTreeMap<u64, Vec<u8>>,
    block_count: u64,
}

impl<'a> BlockDevice<'a> {
    pub fn new(part: PartitionIo<'a>) -> Self {
        let block_count = part.size() / FS_BLOCK_SIZE;
        BlockDevice {
            part,
            dirty: BTreeMap::new(),
            block_count,
        }
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn partition_name(&self) -> &str {
        self.part.name()
    }

    fn check_block(&self, block: u64, off: u64, len: u64) -> Result<(), Error> {
        if block >= self.block_count || off + len > FS_BLOCK_SIZE {
            return Err(Error::Fs(format!(
                "block access out of range: block {block} offset {off:#x} len {len:#x}"
            )));
        }
        Ok(())
    }

    pub fn read(&mut self, block: u64, off: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.check_block(block, off, buf.len() as u64)?;
        if let Some(cached) = self.dirty.get(&block) {
            buf.copy_from_slice(&cached[off as usize..off as usize + buf.len()]);
            return Ok(());
        }
        let data = self.part.read(block * FS_BLOCK_SIZE + off, buf.len())?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Program part of a block. Buffered until [BlockDevice::sync].
    pub fn prog(&mut self, block: u64, off: u64, data: &[u8]) -> Result<(), Error> {
        self.check_block(block, off, data.len() as u64)?;
        debug!("LFS prog: block {block} offset {off:#x} len {:#x}", data.len());
        let cached = match self.dirty.get_mut(&block) {
            Some(cached) => cached,
            None => {
                let current = self.part.read(block * FS_BLOCK_SIZE, FS_BLOCK_SIZE as usize)?;
                self.dirty.entry(block).or_insert(current)
            }
        };
        cached[off as usize..off as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn erase(&mut self, block: u64) -> Result<(), Error> {
        self.check_block(block, 0, 0)?;
        debug!("LFS erase: block {block}");
        self.dirty.insert(block, vec![0xFF; FS_BLOCK_SIZE as usize]);
        Ok(())
    }

    /// Write out all dirty blocks.
    pub fn sync(&mut self) -> Result<(), Error> {
        for (block, data) in std::mem::take(&mut self.dirty) {
            self.part.write(block * FS_BLOCK_SIZE, &data, &mut NoProgress)?;
        }
        self.part.flush()
    }
}

impl Drop for BlockDevice<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            log::warn!("Error while flushing filesystem blocks: {err}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u64,
    pub block_count: u64,
    pub used_blocks: u64,
    pub name_max: u64,
    pub disk_version: String,
}

/// A mounted filesystem. Paths are absolute, `/`-separated.
pub trait Vfs {
    fn list_dir(&mut self, path: &str) -> Result<Vec<(String, FileStat)>, Error>;
    fn metadata(&mut self, path: &str) -> Result<FileStat, Error>;
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, Error>;
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), Error>;
    fn mkdir(&mut self, path: &str) -> Result<(), Error>;
    fn remove(&mut self, path: &str, recursive: bool) -> Result<(), Error>;
    fn rename(&mut self, from: &str, to: &str) -> Result<(), Error>;
    fn stats(&mut self) -> Result<FsStats, Error>;
}

/// Binds the littlefs implementation to a [BlockDevice].
///
/// The filesystem code itself is an external collaborator; implementations
/// of this trait adapt it to the block device above.
pub trait VfsProvider {
    /// Mount the filesystem on `dev`.
    fn mount<'a>(&self, dev: BlockDevice<'a>) -> Result<Box<dyn Vfs + 'a>, Error>;

    /// Create a fresh filesystem spanning `block_count` blocks.
    fn format(&self, dev: &mut BlockDevice<'_>, block_count: u64) -> Result<(), Error>;

    /// Grow the filesystem to `block_count` blocks without erasing its
    /// contents.
    fn grow(&self, dev: &mut BlockDevice<'_>, block_count: u64) -> Result<(), Error>;
}

/// A `part:path` argument: `vfs2:/lib` names `/lib` on partition `vfs2`.
fn split_qualified(arg: &str, default_part: &str) -> (String, String) {
    match arg.rsplit_once(':') {
        Some((part, path)) if !part.is_empty() => (part.to_string(), path.to_string()),
        _ => (default_part.to_string(), arg.to_string()),
    }
}

fn fs_basename(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

fn fs_join(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// The `--fs CMD ARGS...` processor.
pub struct FsCommands<'f, 'p> {
    firmware: &'f mut Firmware,
    provider: &'p dyn VfsProvider,
}

impl<'f, 'p> FsCommands<'f, 'p> {
    pub fn new(firmware: &'f mut Firmware, provider: &'p dyn VfsProvider) -> Self {
        FsCommands { firmware, provider }
    }

    pub fn run(&mut self, args: &[String]) -> Result<(), Error> {
        let (command, args) = args
            .split_first()
            .ok_or_else(|| Error::User("'--fs' requires a command".into()))?;

        match command.as_str() {
            "info" => self.info(args),
            "df" => self.df(args),
            "ls" => self.ls(args),
            "cat" => self.cat(args),
            "mkdir" => self.mkdir(args),
            "rm" => self.rm(args),
            "rename" => self.rename(args),
            "get" => self.get(args),
            "put" => self.put(args),
            "mkfs" => self.mkfs(args),
            "grow" => self.grow(args),
            other => Err(Error::User(format!("unknown '--fs' command '{other}'"))),
        }
    }

    /// Mount the filesystem holding each argument and hand `(vfs, path)`
    /// to `op`. The partition qualifier carries over to later arguments.
    fn for_each_path<F>(&mut self, args: &[String], mut op: F) -> Result<(), Error>
    where
        F: FnMut(&mut dyn Vfs, &str, &str) -> Result<(), Error>,
    {
        let mut part_name = DEFAULT_FS_PART.to_string();
        for arg in args {
            let (part, path) = split_qualified(arg, &part_name);
            part_name = part.clone();
            let io = self.firmware.partition(&part)?;
            let mut vfs = self.provider.mount(BlockDevice::new(io))?;
            op(vfs.as_mut(), &path, &part)?;
        }
        Ok(())
    }

    fn info(&mut self, args: &[String]) -> Result<(), Error> {
        let args = default_args(args, &["/"]);
        self.for_each_path(&args, |vfs, _, _| {
            let stats = vfs.stats()?;
            println!("LittleFS Configuration:");
            println!("  Block Size:  {:9}  /  0x{:X}", stats.block_size, stats.block_size);
            let size = stats.block_size * stats.block_count;
            println!("  Image Size:  {size:9}  /  0x{size:X}");
            println!("  Block Count: {:9}", stats.block_count);
            println!("  Name Max:    {:9}", stats.name_max);
            println!("  Disk Version:{:>9}", stats.disk_version);
            Ok(())
        })
    }

    fn df(&mut self, args: &[String]) -> Result<(), Error> {
        let args = default_args(args, &["/"]);
        self.for_each_path(&args, |vfs, _, part| {
            let stats = vfs.stats()?;
            let total = stats.block_size * stats.block_count;
            let used = stats.block_size * stats.used_blocks;
            println!(
                "{part}: total {total} bytes, used {used} bytes, free {} bytes",
                total - used
            );
            Ok(())
        })
    }

    fn ls(&mut self, args: &[String]) -> Result<(), Error> {
        let args = default_args(args, &["/"]);
        self.for_each_path(&args, |vfs, path, part| {
            info!("ls '{part}:{path}':");
            walk(vfs, path, &mut |entry, stat| {
                let rel = entry.strip_prefix(path).unwrap_or(entry).trim_start_matches('/');
                if stat.is_dir {
                    println!("{rel}/");
                } else {
                    println!("{rel}");
                }
                Ok(())
            })
        })
    }

    fn cat(&mut self, args: &[String]) -> Result<(), Error> {
        self.for_each_path(args, |vfs, path, part| {
            info!("cat '{part}:{path}':");
            if vfs.metadata(path)?.is_dir {
                return Err(Error::Fs(format!("'{path}' is not a file")));
            }
            let data = vfs.read_file(path)?;
            print!("{}", String::from_utf8_lossy(&data));
            Ok(())
        })
    }

    fn mkdir(&mut self, args: &[String]) -> Result<(), Error> {
        self.for_each_path(args, |vfs, path, part| {
            info!("mkdir '{part}:{path}':");
            mkdir_checked(vfs, path)
        })
    }

    fn rm(&mut self, args: &[String]) -> Result<(), Error> {
        self.for_each_path(args, |vfs, path, part| {
            info!("rm '{part}:{path}':");
            vfs.remove(path, true)
        })
    }

    fn rename(&mut self, args: &[String]) -> Result<(), Error> {
        let [from, to] = args else {
            return Err(Error::User("'--fs rename' requires two arguments".into()));
        };
        let (part_a, from) = split_qualified(from, DEFAULT_FS_PART);
        let (part_b, to) = split_qualified(to, &part_a);
        if part_a != part_b {
            return Err(Error::User(
                "'--fs rename' cannot move between partitions".into(),
            ));
        }
        info!("rename '{part_a}:{from}' -> '{to}':");
        let io = self.firmware.partition(&part_a)?;
        let mut vfs = self.provider.mount(BlockDevice::new(io))?;
        vfs.rename(&from, &to)
    }

    /// Copy files or directories out of the filesystem, with `cp -r`
    /// semantics: a directory destination gets the source basename.
    fn get(&mut self, args: &[String]) -> Result<(), Error> {
        let mut args = args.to_vec();
        let dest = if args.len() > 1 {
            args.pop().unwrap()
        } else {
            ".".to_string()
        };

        self.for_each_path(&args, |vfs, path, part| {
            info!("get '{part}:{path}' -> '{dest}':");
            let dest = PathBuf::from(&dest);
            let stat = vfs.metadata(path)?;

            if !stat.is_dir {
                let target = if dest.is_dir() {
                    dest.join(fs_basename(path))
                } else {
                    dest.clone()
                };
                return write_local(&target, &vfs.read_file(path)?);
            }

            fs::create_dir_all(&dest).at_path(&dest.display().to_string())?;
            let mut entries = vec![];
            walk(vfs, path, &mut |entry, stat| {
                entries.push((entry.to_string(), stat));
                Ok(())
            })?;
            for (entry, stat) in entries {
                let rel = entry.strip_prefix(path).unwrap_or(&entry).trim_start_matches('/');
                let target = dest.join(rel);
                if stat.is_dir {
                    fs::create_dir_all(&target).at_path(&target.display().to_string())?;
                } else {
                    write_local(&target, &vfs.read_file(&entry)?)?;
                }
            }
            Ok(())
        })
    }

    /// Copy local files or directories into the filesystem, with `cp -r`
    /// semantics.
    fn put(&mut self, args: &[String]) -> Result<(), Error> {
        let mut sources: Vec<String> = args.to_vec();
        let dest = if sources.len() > 1 {
            sources.pop().unwrap()
        } else {
            ".".to_string()
        };
        let (part, dest) = split_qualified(&dest, DEFAULT_FS_PART);

        let io = self.firmware.partition(&part)?;
        let mut vfs = self.provider.mount(BlockDevice::new(io))?;
        let vfs = vfs.as_mut();
        info!("put '{}' -> '{part}:{dest}':", sources.join(" "));

        for source in &sources {
            let source = Path::new(source);
            let display = source.display().to_string();

            if source.is_file() {
                let target = match vfs.metadata(&dest) {
                    Ok(stat) if stat.is_dir => fs_join(&dest, &local_basename(source)?),
                    _ => dest.clone(),
                };
                let data = fs::read(source).at_path(&display)?;
                vfs.write_file(&target, &data)?;
                continue;
            }

            let root = fs_join(&dest, &local_basename(source)?);
            mkdir_checked(vfs, &root)?;
            put_tree(vfs, source, &root)?;
        }
        Ok(())
    }

    /// Format a partition and seed it with a `boot.py`.
    fn mkfs(&mut self, args: &[String]) -> Result<(), Error> {
        let args = default_args(args, &[DEFAULT_FS_PART]);
        for name in &args {
            info!("mkfs on partition '{name}'...");
            let mut io = self.firmware.partition(name)?;
            io.truncate(0)?;
            let mut dev = BlockDevice::new(io);
            let block_count = dev.block_count();
            self.provider.format(&mut dev, block_count)?;
            let mut vfs = self.provider.mount(dev)?;
            vfs.write_file("boot.py", BOOT_PY.as_bytes())?;
        }
        Ok(())
    }

    /// Grow the filesystem to its partition size (or to `NAME=BLOCKS`).
    fn grow(&mut self, args: &[String]) -> Result<(), Error> {
        let args = default_args(args, &[DEFAULT_FS_PART]);
        for arg in &args {
            let (name, blocks) = match arg.split_once('=') {
                Some((name, blocks)) => (
                    name.to_string(),
                    Some(blocks.parse::<u64>().map_err(|_| {
                        Error::User(format!("invalid block count '{blocks}'"))
                    })?),
                ),
                None => (arg.clone(), None),
            };
            let io = self.firmware.partition(&name)?;
            let mut dev = BlockDevice::new(io);
            let target = blocks.unwrap_or_else(|| dev.block_count());
            info!("Growing filesystem on '{name}' to {target} blocks...");
            self.provider.grow(&mut dev, target)?;
        }
        Ok(())
    }
}

fn default_args(args: &[String], default: &[&str]) -> Vec<String> {
    if args.is_empty() {
        default.iter().map(|s| s.to_string()).collect()
    } else {
        args.to_vec()
    }
}

/// Depth-first walk over a filesystem tree rooted at `path`.
fn walk(
    vfs: &mut dyn Vfs,
    path: &str,
    visit: &mut dyn FnMut(&str, FileStat) -> Result<(), Error>,
) -> Result<(), Error> {
    let entries = vfs.list_dir(path)?;
    for (name, stat) in entries {
        let child = fs_join(path, &name);
        visit(&child, stat)?;
        if stat.is_dir {
            walk(vfs, &child, visit)?;
        }
    }
    Ok(())
}

fn mkdir_checked(vfs: &mut dyn Vfs, path: &str) -> Result<(), Error> {
    if let Err(err) = vfs.mkdir(path) {
        let exists_as_dir = vfs.metadata(path).map(|s| s.is_dir).unwrap_or(false);
        if !exists_as_dir {
            return Err(err);
        }
    }
    Ok(())
}

fn put_tree(vfs: &mut dyn Vfs, source: &Path, dest: &str) -> Result<(), Error> {
    let display = source.display().to_string();
    for entry in fs::read_dir(source).at_path(&display)? {
        let entry = entry.at_path(&display)?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let target = fs_join(dest, &name);
        if path.is_dir() {
            mkdir_checked(vfs, &target)?;
            put_tree(vfs, &path, &target)?;
        } else {
            let data = fs::read(&path).at_path(&path.display().to_string())?;
            vfs.write_file(&target, &data)?;
        }
    }
    Ok(())
}

fn write_local(path: &Path, data: &[u8]) -> Result<(), Error> {
    let display = path.display().to_string();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).at_path(&display)?;
        }
    }
    fs::write(path, data).at_path(&display)
}

fn local_basename(path: &Path) -> Result<String, Error> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::User(format!("'{}' has no file name", path.display())))
}
