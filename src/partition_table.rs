//! ESP-IDF partition table: records, binary codec and validation
//!
//! The table lives at flash offset 0x8000 and is a sequence of 32-byte
//! records terminated by an MD5 record and 0xFF padding. For the format see:
//! <https://docs.espressif.com/projects/esp-idf/en/latest/esp32/api-guides/partition-tables.html>

use std::{
    cmp::{max, min},
    fmt::{Display, Formatter},
    io::Write,
};

use log::warn;
use md5::{Context, Digest};
use serde::{Deserialize, Serialize};

use crate::{
    directive::parse_size,
    error::{Error, LayoutError},
};

/// Flash offset of the partition table region.
pub const TABLE_OFFSET: u64 = 0x8000;
/// Size of the partition table region in flash.
pub const TABLE_SIZE: usize = 0xC00;
/// Offset of the first partition, directly after the table region.
pub const FIRST_PART_OFFSET: u32 = 0x9000;
/// Conventional offset of the first app partition.
pub const APP_PART_OFFSET: u32 = 0x10000;
/// Required size of an otadata partition.
pub const OTADATA_SIZE: u32 = 0x2000;

/// One flash block, the erase granularity and minimum partition alignment.
pub const BLOCK_SIZE: u32 = 0x1000;
/// Offset alignment required for app partitions.
pub const APP_ALIGNMENT: u32 = 0x10000;

const RECORD_SIZE: usize = 32;
const PART_MAGIC: [u8; 2] = [0xAA, 0x50];
const MD5_MAGIC: [u8; 2] = [0xEB, 0xEB];
const MAX_NAME_LEN: usize = 15;

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    App = 0x00,
    Data = 0x01,
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", serde_plain::to_string(self).unwrap())
    }
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Factory = 0x00,
    #[serde(rename = "ota_0")]
    Ota0 = 0x10,
    #[serde(rename = "ota_1")]
    Ota1 = 0x11,
    #[serde(rename = "ota_2")]
    Ota2 = 0x12,
    #[serde(rename = "ota_3")]
    Ota3 = 0x13,
    #[serde(rename = "ota_4")]
    Ota4 = 0x14,
    #[serde(rename = "ota_5")]
    Ota5 = 0x15,
    #[serde(rename = "ota_6")]
    Ota6 = 0x16,
    #[serde(rename = "ota_7")]
    Ota7 = 0x17,
    #[serde(rename = "ota_8")]
    Ota8 = 0x18,
    #[serde(rename = "ota_9")]
    Ota9 = 0x19,
    #[serde(rename = "ota_10")]
    Ota10 = 0x1a,
    #[serde(rename = "ota_11")]
    Ota11 = 0x1b,
    #[serde(rename = "ota_12")]
    Ota12 = 0x1c,
    #[serde(rename = "ota_13")]
    Ota13 = 0x1d,
    #[serde(rename = "ota_14")]
    Ota14 = 0x1e,
    #[serde(rename = "ota_15")]
    Ota15 = 0x1f,
    Test = 0x20,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Ota = 0x00,
    Phy = 0x01,
    Nvs = 0x02,
    CoreDump = 0x03,
    NvsKeys = 0x04,
    EFuse = 0x05,
    EspHttpd = 0x80,
    Fat = 0x81,
    Spiffs = 0x82,
    #[serde(rename = "littlefs")]
    LittleFs = 0x83,
}

/// The subtype byte of a record, interpreted in the context of its type.
///
/// Unknown subtype values are preserved rather than rejected so that a table
/// written by a newer IDF still round-trips.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubType {
    App(AppType),
    Data(DataType),
    Unknown(u8),
}

impl SubType {
    pub fn from_raw(ty: Type, raw: u8) -> Self {
        let known = match ty {
            Type::App => serde_plain::from_str::<AppType>(&app_type_name(raw))
                .ok()
                .map(SubType::App),
            Type::Data => data_type_from_raw(raw).map(SubType::Data),
        };
        known.unwrap_or(SubType::Unknown(raw))
    }

    /// Resolve a subtype name. Subtype names are unique across the app and
    /// data namespaces, so the partition type follows from the name.
    pub fn from_name(name: &str) -> Result<(Type, Self), LayoutError> {
        if let Ok(app) = serde_plain::from_str::<AppType>(name) {
            return Ok((Type::App, SubType::App(app)));
        }
        if let Ok(data) = serde_plain::from_str::<DataType>(name) {
            return Ok((Type::Data, SubType::Data(data)));
        }
        Err(LayoutError::UnknownSubtype(name.into()))
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            SubType::App(ty) => *ty as u8,
            SubType::Data(ty) => *ty as u8,
            SubType::Unknown(raw) => *raw,
        }
    }

    pub fn is_ota_app(&self) -> bool {
        matches!(self, SubType::App(app) if (AppType::Ota0..=AppType::Ota15).contains(app))
    }
}

impl Display for SubType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SubType::App(sub) => write!(f, "{}", serde_plain::to_string(sub).unwrap()),
            SubType::Data(sub) => write!(f, "{}", serde_plain::to_string(sub).unwrap()),
            SubType::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}

fn app_type_name(raw: u8) -> String {
    match raw {
        0x00 => "factory".into(),
        0x10..=0x1f => format!("ota_{}", raw - 0x10),
        0x20 => "test".into(),
        other => other.to_string(),
    }
}

fn data_type_from_raw(raw: u8) -> Option<DataType> {
    Some(match raw {
        0x00 => DataType::Ota,
        0x01 => DataType::Phy,
        0x02 => DataType::Nvs,
        0x03 => DataType::CoreDump,
        0x04 => DataType::NvsKeys,
        0x05 => DataType::EFuse,
        0x80 => DataType::EspHttpd,
        0x81 => DataType::Fat,
        0x82 => DataType::Spiffs,
        0x83 => DataType::LittleFs,
        _ => return None,
    })
}

/// A single 32-byte partition record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    name: String,
    ty: Type,
    sub_type: SubType,
    offset: u32,
    size: u32,
    flags: u32,
}

impl Partition {
    pub fn new(name: impl Into<String>, ty: Type, sub_type: SubType, offset: u32, size: u32) -> Self {
        Partition {
            name: name.into(),
            ty,
            sub_type,
            offset,
            size,
            flags: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn sub_type(&self) -> SubType {
        self.sub_type
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_app(&self) -> bool {
        self.ty == Type::App
    }

    /// True for the data subtypes that hold a filesystem.
    pub fn is_filesystem(&self) -> bool {
        matches!(
            self.sub_type,
            SubType::Data(DataType::Fat) | SubType::Data(DataType::Spiffs) | SubType::Data(DataType::LittleFs)
        )
    }

    pub fn overlaps(&self, other: &Partition) -> bool {
        max(self.offset, other.offset) < min(self.end(), other.end())
    }

    pub(crate) fn set_offset(&mut self, offset: u32) {
        self.offset = offset;
    }

    pub(crate) fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn from_bytes(record: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(record.len(), RECORD_SIZE);
        let ty = match record[2] {
            0x00 => Type::App,
            0x01 => Type::Data,
            other => return Err(Error::BadTable(format!("unknown partition type {other:#x}"))),
        };
        let sub_type = SubType::from_raw(ty, record[3]);
        let offset = u32::from_le_bytes(record[4..8].try_into().unwrap());
        let size = u32::from_le_bytes(record[8..12].try_into().unwrap());
        let name_bytes = &record[12..28];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(16);
        let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
        let flags = u32::from_le_bytes(record[28..32].try_into().unwrap());

        Ok(Partition {
            name,
            ty,
            sub_type,
            offset,
            size,
            flags,
        })
    }

    pub fn write_bin<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&PART_MAGIC)?;
        writer.write_all(&[self.ty as u8, self.sub_type.as_u8()])?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.size.to_le_bytes())?;

        let mut name_bytes = [0u8; 16];
        for (source, dest) in self.name.bytes().take(MAX_NAME_LEN).zip(name_bytes.iter_mut()) {
            *dest = source;
        }
        writer.write_all(&name_bytes)?;
        writer.write_all(&self.flags.to_le_bytes())?;

        Ok(())
    }
}

/// The ordered partition table plus the flash size it is laid out for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    partitions: Vec<Partition>,
    flash_size: u32,
}

impl PartitionTable {
    pub fn new(partitions: Vec<Partition>, flash_size: u32) -> Self {
        PartitionTable {
            partitions,
            flash_size,
        }
    }

    /// Parse the 0xC00-byte table region.
    ///
    /// `flash_size` comes from the bootloader header; when zero it is
    /// inferred from the end of the last partition.
    pub fn from_bytes(data: &[u8], flash_size: u32) -> Result<Self, Error> {
        if data.len() < TABLE_SIZE {
            return Err(Error::BadTable(format!(
                "table region is {} bytes, expected {:#x}",
                data.len(),
                TABLE_SIZE
            )));
        }

        let mut partitions = vec![];
        let mut hasher = Context::new();
        let mut chunks = data[..TABLE_SIZE].chunks_exact(RECORD_SIZE);
        let mut seen_md5 = false;
        let mut terminator = None;

        for chunk in chunks.by_ref() {
            if chunk[..2] == PART_MAGIC {
                partitions.push(Partition::from_bytes(chunk)?);
                hasher.consume(chunk);
            } else if chunk[..2] == MD5_MAGIC {
                let stored = &chunk[16..32];
                let computed: Digest = hasher.clone().compute();
                if computed.0 != stored {
                    return Err(Error::BadTable(format!(
                        "MD5 mismatch: expected {}, computed {}",
                        hex::encode(stored),
                        hex::encode(computed.0)
                    )));
                }
                seen_md5 = true;
                terminator = chunks.next();
                break;
            } else {
                terminator = Some(chunk);
                break;
            }
        }

        if partitions.is_empty() {
            return Err(Error::BadTable("no partition records found".into()));
        }
        if !seen_md5 {
            warn!("Partition table has no MD5 record");
        }

        // An empty row must follow the records (and the MD5 record if any).
        if let Some(row) = terminator {
            if row.iter().any(|&b| b != 0xFF) {
                return Err(Error::BadTable(
                    "partition table does not end with an empty row".into(),
                ));
            }
        }

        partitions.sort_by_key(|p| p.offset);
        let flash_size = if flash_size != 0 {
            flash_size
        } else {
            partitions.last().map(|p| p.end()).unwrap_or(0)
        };

        Ok(PartitionTable {
            partitions,
            flash_size,
        })
    }

    /// Emit the 0xC00-byte table region: records in offset order, the MD5
    /// record, then 0xFF padding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(TABLE_SIZE);
        let mut hasher = HashWriter::new(&mut result);
        for partition in &self.partitions {
            // Writing to a Vec cannot fail
            partition.write_bin(&mut hasher).unwrap();
        }

        let (writer, hash) = hasher.compute();
        writer.extend_from_slice(&MD5_MAGIC);
        writer.extend_from_slice(&[0xFF; 14]);
        writer.extend_from_slice(&hash.0);
        writer.resize(TABLE_SIZE, 0xFF);

        result
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub(crate) fn partitions_mut(&mut self) -> &mut Vec<Partition> {
        &mut self.partitions
    }

    pub fn flash_size(&self) -> u32 {
        self.flash_size
    }

    pub(crate) fn set_flash_size(&mut self, flash_size: u32) {
        self.flash_size = flash_size;
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn find_by_subtype(&self, ty: Type, sub_type: SubType) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.ty == ty && p.sub_type == sub_type)
    }

    /// The partition the device boots from: `factory` or the first `ota_N`.
    pub fn app_part(&self) -> Result<&Partition, LayoutError> {
        self.partitions
            .iter()
            .find(|p| {
                matches!(
                    p.sub_type,
                    SubType::App(AppType::Factory) | SubType::App(AppType::Ota0)
                )
            })
            .ok_or(LayoutError::NoAppPartition)
    }

    /// All `ota_N` app partitions, ordered by slot number.
    pub fn ota_parts(&self) -> Vec<&Partition> {
        let mut parts: Vec<&Partition> = self
            .partitions
            .iter()
            .filter(|p| p.is_app() && p.sub_type.is_ota_app())
            .collect();
        parts.sort_by_key(|p| p.sub_type.as_u8());
        parts
    }

    /// Check the table against the layout invariants.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let mut names = std::collections::HashSet::new();
        for p in &self.partitions {
            if p.name.is_empty() || p.name.len() > MAX_NAME_LEN || !p.name.is_ascii() {
                return Err(LayoutError::BadName(p.name.clone()));
            }
            if !names.insert(p.name.clone()) {
                return Err(LayoutError::DuplicateName(p.name.clone()));
            }
            if p.offset % BLOCK_SIZE != 0 {
                return Err(LayoutError::Unaligned {
                    name: p.name.clone(),
                    offset: p.offset as u64,
                    align: BLOCK_SIZE as u64,
                });
            }
            if p.size % BLOCK_SIZE != 0 {
                return Err(LayoutError::Unaligned {
                    name: p.name.clone(),
                    offset: p.size as u64,
                    align: BLOCK_SIZE as u64,
                });
            }
            if p.is_app() && p.offset % APP_ALIGNMENT != 0 {
                return Err(LayoutError::Unaligned {
                    name: p.name.clone(),
                    offset: p.offset as u64,
                    align: APP_ALIGNMENT as u64,
                });
            }
            match (p.ty, p.sub_type) {
                (Type::App, SubType::Data(_)) | (Type::Data, SubType::App(_)) => {
                    return Err(LayoutError::SubtypeMismatch {
                        ty: p.ty.to_string(),
                        subtype: p.sub_type.to_string(),
                    })
                }
                _ => {}
            }
            if p.end() > self.flash_size {
                return Err(LayoutError::Overflow {
                    name: p.name.clone(),
                    end: p.end() as u64,
                    flash_size: self.flash_size as u64,
                });
            }
        }

        if let Some(first) = self.partitions.first() {
            if (first.offset as u64) < TABLE_OFFSET + TABLE_SIZE as u64 {
                return Err(LayoutError::BeforeFirstPartition(first.offset as u64));
            }
        }

        for pair in self.partitions.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(LayoutError::Overlap(
                    pair[0].name.clone(),
                    pair[1].name.clone(),
                ));
            }
            if pair[0].end() < pair[1].offset {
                warn!("Gap before partition '{}'", pair[1].name);
            }
        }

        if !self.partitions.iter().any(|p| p.is_app()) {
            return Err(LayoutError::NoAppPartition);
        }

        let otadata = self
            .partitions
            .iter()
            .filter(|p| p.sub_type == SubType::Data(DataType::Ota))
            .count();
        if otadata > 1 {
            return Err(LayoutError::MultipleOtadata);
        }
        if otadata == 0 && self.partitions.iter().any(|p| p.sub_type.is_ota_app()) {
            return Err(LayoutError::NoOtadata);
        }

        let end = self.partitions.last().map(|p| p.end()).unwrap_or(0);
        if end < self.flash_size {
            warn!(
                "End of last partition ({:#x}) < flash size ({:#x})",
                end, self.flash_size
            );
        }

        Ok(())
    }

    /// Parse a partition table in the ESP-IDF CSV format.
    ///
    /// Omitted offsets are assigned sequentially with the usual alignment
    /// rules.
    pub fn from_csv(data: &str, flash_size: u32) -> Result<Self, Error> {
        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .flexible(true)
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(data.as_bytes());

        let mut next_offset = FIRST_PART_OFFSET;
        let mut partitions = vec![];
        for record in reader.records() {
            let record = record.map_err(|e| Error::BadTable(format!("CSV: {e}")))?;
            if record.len() < 5 {
                return Err(Error::BadTable(format!(
                    "CSV row has {} fields, expected at least 5",
                    record.len()
                )));
            }
            let name = record[0].to_string();
            let ty = serde_plain::from_str::<Type>(&record[1])
                .map_err(|_| Error::BadTable(format!("unknown partition type '{}'", &record[1])))?;
            let sub_type = SubType::from_name(&record[2])
                .map(|(_, sub)| sub)
                .or_else(|_| {
                    record[2]
                        .parse::<u8>()
                        .map(|raw| SubType::from_raw(ty, raw))
                        .map_err(|_| LayoutError::UnknownSubtype(record[2].to_string()))
                })?;
            let offset = if record[3].is_empty() {
                let align = if ty == Type::App { APP_ALIGNMENT } else { BLOCK_SIZE };
                next_offset.next_multiple_of(align)
            } else {
                parse_size(&record[3])? as u32
            };
            let size = parse_size(&record[4])? as u32;
            let flags = 0;

            next_offset = offset + size;
            partitions.push(Partition {
                name,
                ty,
                sub_type,
                offset,
                size,
                flags,
            });
        }

        let table = PartitionTable::new(partitions, flash_size);
        table.validate()?;
        Ok(table)
    }

    /// Render the table in the ESP-IDF CSV format.
    pub fn to_csv(&self) -> String {
        let mut csv = String::new();
        csv.push_str("# Name,Type,SubType,Offset,Size,Flags\n");
        for p in &self.partitions {
            csv.push_str(&format!(
                "{},{},{},{:#x},{:#x},{:#x}\n",
                p.name, p.ty, p.sub_type, p.offset, p.size, p.flags
            ));
        }
        csv
    }
}

struct HashWriter<W: Write> {
    inner: W,
    hasher: Context,
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.write_all(buf)?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> HashWriter<W> {
    fn new(inner: W) -> Self {
        HashWriter {
            inner,
            hasher: Context::new(),
        }
    }

    fn compute(self) -> (W, Digest) {
        (self.inner, self.hasher.compute())
    }
}
