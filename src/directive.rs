//! Parsing of size literals and partition directive strings
//!
//! Command arguments are comma-separated lists of entries; inside an entry
//! the fields are separated by `=` or `:` (never `-`, which may appear in
//! file names). Sizes are decimal or `0x`-hex integers with an optional
//! unit suffix: `B` (flash block, 0x1000), `K`/`KB` (1024) or `M`/`MB`
//! (1024 * 1024), case-insensitive.

use std::{path::PathBuf, sync::OnceLock};

use regex::Regex;

use crate::error::Error;

/// 1 Megabyte
pub const MB: u64 = 0x10_0000;
/// 1 Kilobyte
pub const KB: u64 = 0x400;
/// 1 flash block (4096 bytes)
pub const B: u64 = 0x1000;

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(0X[0-9A-F]+|[0-9]+)$").unwrap())
}

/// Parse a size literal such as `8M`, `0x1f0B` or `4096`.
///
/// The unit suffix binds tighter than a trailing hex digit: `0x1fB` is
/// 0x1f blocks, not 0x1FB bytes.
pub fn parse_size(arg: &str) -> Result<u64, Error> {
    let trimmed = arg.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    let upper = trimmed.to_ascii_uppercase();
    let (digits, unit) = if let Some(s) = upper.strip_suffix("MB") {
        (s, MB)
    } else if let Some(s) = upper.strip_suffix('M') {
        (s, MB)
    } else if let Some(s) = upper.strip_suffix("KB") {
        (s, KB)
    } else if let Some(s) = upper.strip_suffix('K') {
        (s, KB)
    } else if let Some(s) = upper.strip_suffix('B') {
        (s, B)
    } else {
        (upper.as_str(), 1)
    };

    if !digits_re().is_match(digits) {
        return Err(Error::User(format!("invalid size '{arg}'")));
    }
    let value = if let Some(hex) = digits.strip_prefix("0X") {
        u64::from_str_radix(hex, 16)
    } else {
        digits.parse::<u64>()
    }
    .map_err(|_| Error::User(format!("invalid size '{arg}'")))?;

    Ok(value * unit)
}

/// Split a list argument on commas, then each entry on `=` or `:`.
///
/// `"nvs=nvs.bin,vfs=vfs.bin"` becomes `[["nvs", "nvs.bin"], ["vfs", "vfs.bin"]]`.
pub fn split_list(arg: &str) -> Vec<Vec<String>> {
    arg.trim()
        .split(',')
        .map(|entry| {
            entry
                .split(['=', ':'])
                .map(|field| field.trim().to_string())
                .collect()
        })
        .collect()
}

/// One entry of a partition list: `NAME[=SUBTYPE][:OFFSET]:SIZE`.
///
/// Subtype and offset may be omitted, in that order:
/// `"factory=factory:7B:2M,vfs=1M"` yields
/// `("factory", Some("factory"), Some(0x7000), 0x200000)` and
/// `("vfs", None, None, 0x100000)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSpec {
    pub name: String,
    pub sub_type: Option<String>,
    pub offset: Option<u64>,
    pub size: u64,
}

/// Parse a comma-separated list of [PartSpec] entries.
pub fn parse_part_list(arg: &str) -> Result<Vec<PartSpec>, Error> {
    split_list(arg)
        .into_iter()
        .map(|entry| {
            let (name, rest) = entry
                .split_first()
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| Error::User(format!("empty partition entry in '{arg}'")))?;
            if rest.is_empty() {
                return Err(Error::User(format!("missing size for partition '{name}'")));
            }
            let sub_type = if rest.len() >= 2 {
                Some(rest[0].clone()).filter(|s| !s.is_empty())
            } else {
                None
            };
            let offset = if rest.len() >= 3 {
                Some(parse_size(&rest[1])?).filter(|&o| o != 0)
            } else {
                None
            };
            let size = parse_size(rest.last().unwrap())?;

            Ok(PartSpec {
                name: name.clone(),
                sub_type,
                offset,
                size,
            })
        })
        .collect()
}

/// Parse a comma-separated `NAME=VALUE` list, e.g. for `--read nvs=nvs.bin`.
pub fn parse_pairs(arg: &str) -> Result<Vec<(String, String)>, Error> {
    arg.trim()
        .split(',')
        .map(|entry| {
            let (name, value) = entry
                .split_once(['=', ':'])
                .ok_or_else(|| Error::User(format!("expected NAME=VALUE, got '{entry}'")))?;
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() || value.is_empty() {
                return Err(Error::User(format!("expected NAME=VALUE, got '{entry}'")));
            }
            Ok((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse a comma-separated `NAME=SIZE` list, e.g. for `--resize vfs=0x200B`.
pub fn parse_resize_list(arg: &str) -> Result<Vec<(String, u64)>, Error> {
    parse_pairs(arg)?
        .into_iter()
        .map(|(name, size)| Ok((name, parse_size(&size)?)))
        .collect()
}

/// Parse a comma-separated list of partition names.
pub fn parse_names(arg: &str) -> Result<Vec<String>, Error> {
    let names: Vec<String> = arg
        .trim()
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();
    if names.iter().any(|n| n.is_empty()) {
        return Err(Error::User(format!("empty partition name in '{arg}'")));
    }
    Ok(names)
}

/// The canned table templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TableTemplate {
    /// nvs + factory + vfs
    Default,
    /// nvs + phy_init + factory + vfs, the stock MicroPython layout
    Original,
    /// nvs + otadata + ota_0 + ota_1 + vfs
    Ota,
}

/// Argument of `--table`: a canned template or an explicit layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSelector {
    Template(TableTemplate),
    Layout(Vec<PartSpec>),
}

impl TableSelector {
    pub fn parse(arg: &str) -> Result<Self, Error> {
        let trimmed = arg.trim();
        if let Ok(template) = trimmed.parse::<TableTemplate>() {
            Ok(TableSelector::Template(template))
        } else if !trimmed.contains(['=', ':', ',']) {
            // A bare word that is not a known template
            Err(crate::error::LayoutError::UnknownTemplate(trimmed.into()).into())
        } else {
            Ok(TableSelector::Layout(parse_part_list(arg)?))
        }
    }
}

/// A structured command, parsed from one command-line option.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    ResizeFlash(u64),
    Table(TableSelector),
    FromCsv(PathBuf),
    Add(Vec<PartSpec>),
    Delete(Vec<String>),
    Resize(Vec<(String, u64)>),
    Rename(Vec<(String, String)>),
    AppSize(u64),
    Read(Vec<(String, String)>),
    Write(Vec<(String, String)>),
    Erase(Vec<String>),
    EraseFs(Vec<String>),
    ExtractApp,
    OtaUpdate(PathBuf),
    Flash(String),
    Fs(Vec<String>),
}

impl Directive {
    /// True for directives the layout planner consumes; the rest are I/O
    /// operations executed by the firmware facade.
    pub fn is_table_op(&self) -> bool {
        matches!(
            self,
            Directive::ResizeFlash(_)
                | Directive::Table(_)
                | Directive::FromCsv(_)
                | Directive::Add(_)
                | Directive::Delete(_)
                | Directive::Resize(_)
                | Directive::Rename(_)
                | Directive::AppSize(_)
        )
    }
}
