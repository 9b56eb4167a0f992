//! Partition-table planner
//!
//! Applies an ordered list of table directives to a [PartitionTable] and
//! produces a new table that satisfies the layout invariants, together with
//! the side effects the caller must carry out (data partitions to erase,
//! app partitions whose images went stale).

use std::collections::HashMap;

use log::{info, warn};

use crate::{
    directive::{Directive, PartSpec, TableSelector, TableTemplate},
    error::{Error, LayoutError},
    partition_table::{
        Partition, PartitionTable, SubType, Type, APP_ALIGNMENT, APP_PART_OFFSET, BLOCK_SIZE,
        FIRST_PART_OFFSET, OTADATA_SIZE,
    },
};

/// Recommended OTA app partition sizes, by flash size. These match the OTA
/// partition sizes in the MicroPython `partition-*-ota.csv` layouts.
const OTA_PART_SIZES: [(u32, u32); 3] = [
    (8 * 0x10_0000, 0x27_0000), // flash size > 8MB
    (4 * 0x10_0000, 0x20_0000), // flash size > 4MB
    (0, 0x18_0000),             // anything smaller
];

const DEFAULT_LAYOUT: [(&str, &str, u32); 3] = [
    ("nvs", "nvs", 0x7000),
    ("factory", "factory", 0x1f0000),
    ("vfs", "fat", 0),
];

const ORIGINAL_LAYOUT: [(&str, &str, u32); 4] = [
    ("nvs", "nvs", 0x6000),
    ("phy_init", "phy", 0x1000),
    ("factory", "factory", 0x1f0000),
    ("vfs", "fat", 0),
];

/// The recommended OTA app partition size for a flash size.
pub fn ota_part_size(flash_size: u32) -> u32 {
    OTA_PART_SIZES
        .iter()
        .find(|(fsize, _)| flash_size > *fsize)
        .map(|(_, psize)| *psize)
        .unwrap_or(0x18_0000)
}

/// A planned table change and the side effects applying it entails.
#[derive(Debug, Clone)]
pub struct Plan {
    pub table: PartitionTable,
    /// Data partitions whose byte range changed; their contents are invalid
    /// and devices must erase (at least) their first block.
    pub touched_data: Vec<String>,
    /// Data partitions present on both sides whose offset changed; image
    /// files copy their contents to the new range.
    pub carried: Vec<CarryOver>,
    /// Filesystem partitions grown in place; contents survive but the
    /// filesystem must be grown to match.
    pub grown_fs: Vec<String>,
    /// App partitions whose offset changed; the image there is stale.
    pub moved_apps: Vec<String>,
    pub flash_size_changed: bool,
}

/// A data partition that moved: where its bytes were and where they go.
#[derive(Debug, Clone)]
pub struct CarryOver {
    pub name: String,
    pub old_offset: u64,
    pub old_size: u64,
    pub new_offset: u64,
    pub new_size: u64,
}

/// Apply `directives` to `old` and return the resulting plan.
///
/// Planner errors surface before anything is written.
pub fn plan(old: &PartitionTable, directives: &[Directive]) -> Result<Plan, Error> {
    let mut table = old.clone();
    let mut ctx = PlanContext {
        zero_grow_used: false,
        renames: HashMap::new(),
        app_offset: old
            .app_part()
            .map(|p| p.offset())
            .unwrap_or(APP_PART_OFFSET),
        // A requested app size also sizes the slots of the OTA template.
        app_size_hint: directives.iter().find_map(|d| match d {
            Directive::AppSize(size) => Some(*size as u32),
            _ => None,
        }),
    };

    for directive in directives {
        debug_assert!(directive.is_table_op());
        apply(&mut table, directive, &mut ctx)?;
        normalize(&mut table);
        table.validate()?;
    }

    normalize(&mut table);
    table.validate()?;

    Ok(side_effects(old, table, &ctx.renames))
}

struct PlanContext {
    /// At most one resize-to-zero may apply per planning pass.
    zero_grow_used: bool,
    /// new name -> original name, for matching partitions across the change
    renames: HashMap<String, String>,
    /// App offset of the starting table, reused by the OTA template
    app_offset: u32,
    /// `--app-size`, when given alongside `--table ota`
    app_size_hint: Option<u32>,
}

fn apply(table: &mut PartitionTable, directive: &Directive, ctx: &mut PlanContext) -> Result<(), Error> {
    match directive {
        Directive::ResizeFlash(size) => resize_flash(table, to_u32(*size)?),
        Directive::Table(TableSelector::Template(template)) => {
            build_template(table, *template, ctx.app_offset, ctx.app_size_hint)
        }
        Directive::Table(TableSelector::Layout(specs)) => build_layout(table, specs),
        Directive::FromCsv(path) => {
            let display = path.display().to_string();
            let data = std::fs::read_to_string(path).map_err(|e| Error::io(&display, e))?;
            *table = PartitionTable::from_csv(&data, table.flash_size())?;
            Ok(())
        }
        Directive::Add(specs) => {
            for spec in specs {
                add_partition(table, spec)?;
            }
            Ok(())
        }
        Directive::Delete(names) => {
            for name in names {
                let parts = table.partitions_mut();
                let i = parts
                    .iter()
                    .position(|p| p.name() == name)
                    .ok_or_else(|| Error::NotFound(name.clone()))?;
                parts.remove(i);
            }
            Ok(())
        }
        Directive::Resize(entries) => {
            for (name, size) in entries {
                resize_partition(table, name, to_u32(*size)?, ctx)?;
            }
            Ok(())
        }
        Directive::Rename(entries) => {
            for (old_name, new_name) in entries {
                rename_partition(table, old_name, new_name, ctx)?;
            }
            Ok(())
        }
        Directive::AppSize(size) => app_size(table, to_u32(*size)?, ctx),
        _ => unreachable!("not a table directive"),
    }
}

fn resize_flash(table: &mut PartitionTable, flash_size: u32) -> Result<(), Error> {
    info!("Resizing flash to {:#x} bytes", flash_size);
    table.set_flash_size(flash_size);
    let parts = table.partitions_mut();
    let Some(last) = parts.last_mut() else {
        return Ok(());
    };
    if last.offset() >= flash_size {
        return Err(LayoutError::Overflow {
            name: last.name().to_string(),
            end: last.end() as u64,
            flash_size: flash_size as u64,
        }
        .into());
    }
    // The last partition absorbs the change in flash size.
    last.set_size(flash_size - last.offset());
    Ok(())
}

fn build_template(
    table: &mut PartitionTable,
    template: TableTemplate,
    app_offset: u32,
    app_size_hint: Option<u32>,
) -> Result<(), Error> {
    let ota_app_size = app_size_hint.unwrap_or_else(|| ota_part_size(table.flash_size()));
    let nvs_size = app_offset
        .checked_sub(FIRST_PART_OFFSET + OTADATA_SIZE)
        .unwrap_or(0x5000);
    let ota_layout = [
        ("nvs", "nvs", nvs_size),
        ("otadata", "ota", OTADATA_SIZE),
        ("ota_0", "ota_0", ota_app_size),
        ("ota_1", "ota_1", ota_app_size),
        ("vfs", "fat", 0),
    ];

    let layout: &[(&str, &str, u32)] = match template {
        TableTemplate::Default => &DEFAULT_LAYOUT,
        TableTemplate::Original => &ORIGINAL_LAYOUT,
        TableTemplate::Ota => &ota_layout,
    };

    table.partitions_mut().clear();
    let mut cursor = FIRST_PART_OFFSET;
    for (name, sub_type, size) in layout {
        let (ty, sub) = SubType::from_name(sub_type)?;
        push_partition(table, name, ty, sub, None, *size, &mut cursor)?;
    }
    Ok(())
}

fn build_layout(table: &mut PartitionTable, specs: &[PartSpec]) -> Result<(), Error> {
    table.partitions_mut().clear();
    let mut cursor = FIRST_PART_OFFSET;
    for spec in specs {
        let (ty, sub) = resolve_subtype(spec)?;
        let offset = spec.offset.map(to_u32).transpose()?;
        push_partition(table, &spec.name, ty, sub, offset, to_u32(spec.size)?, &mut cursor)?;
    }
    Ok(())
}

fn add_partition(table: &mut PartitionTable, spec: &PartSpec) -> Result<(), Error> {
    let (ty, sub) = resolve_subtype(spec)?;
    let offset = spec.offset.map(to_u32).transpose()?;
    let mut cursor = table
        .partitions()
        .last()
        .map(|p| p.end())
        .unwrap_or(FIRST_PART_OFFSET);
    info!("Adding partition '{}'", spec.name);
    push_partition(table, &spec.name, ty, sub, offset, to_u32(spec.size)?, &mut cursor)
}

/// Append one partition, assigning the next aligned offset when none is
/// given; `size` 0 takes all space up to the end of the flash.
fn push_partition(
    table: &mut PartitionTable,
    name: &str,
    ty: Type,
    sub_type: SubType,
    offset: Option<u32>,
    size: u32,
    cursor: &mut u32,
) -> Result<(), Error> {
    let align = if ty == Type::App { APP_ALIGNMENT } else { BLOCK_SIZE };
    let offset = offset.unwrap_or_else(|| cursor.next_multiple_of(align));
    let flash_size = table.flash_size();
    if offset >= flash_size {
        return Err(LayoutError::NoRoom {
            name: name.to_string(),
            size: size as u64,
        }
        .into());
    }
    let size = if size == 0 {
        flash_size - offset
    } else {
        size.next_multiple_of(BLOCK_SIZE)
    };
    if offset + size > flash_size {
        return Err(LayoutError::NoRoom {
            name: name.to_string(),
            size: size as u64,
        }
        .into());
    }

    table
        .partitions_mut()
        .push(Partition::new(name, ty, sub_type, offset, size));
    *cursor = offset + size;
    Ok(())
}

fn resolve_subtype(spec: &PartSpec) -> Result<(Type, SubType), Error> {
    // An omitted subtype is inferred from the partition name.
    let name = match spec.sub_type.as_deref() {
        Some(sub) => sub,
        None => match spec.name.as_str() {
            "otadata" => "ota",
            "vfs" | "ffat" => "fat",
            "phy_init" => "phy",
            other => other,
        },
    };
    Ok(SubType::from_name(name)?)
}

fn resize_partition(
    table: &mut PartitionTable,
    name: &str,
    size: u32,
    ctx: &mut PlanContext,
) -> Result<(), Error> {
    let flash_size = table.flash_size();
    let parts = table.partitions_mut();
    let i = parts
        .iter()
        .position(|p| p.name() == name)
        .ok_or_else(|| Error::NotFound(name.to_string()))?;

    let size = if size == 0 {
        // Fill the free space up to the next partition or the end of flash.
        if ctx.zero_grow_used {
            return Err(LayoutError::AmbiguousZeroGrow.into());
        }
        ctx.zero_grow_used = true;
        let upper = parts.get(i + 1).map(|p| p.offset()).unwrap_or(flash_size);
        upper
            .checked_sub(parts[i].offset())
            .filter(|&s| s > 0)
            .ok_or(LayoutError::NoRoom {
                name: name.to_string(),
                size: 0,
            })?
    } else {
        size
    };

    info!("Resizing partition '{name}' to {size:#x} bytes");
    parts[i].set_size(size);
    slide_following(parts, i, flash_size)
}

/// Push partitions after `i` forward when the resized one now overlaps
/// them, and shrink any that would run off the end of the flash.
fn slide_following(parts: &mut [Partition], i: usize, flash_size: u32) -> Result<(), Error> {
    for j in i + 1..parts.len() {
        let min_offset = parts[j - 1].end();
        if parts[j].offset() < min_offset {
            let align = if parts[j].is_app() { APP_ALIGNMENT } else { BLOCK_SIZE };
            parts[j].set_offset(min_offset.next_multiple_of(align));
        }
        if parts[j].end() > flash_size {
            if parts[j].offset() >= flash_size {
                return Err(LayoutError::Overflow {
                    name: parts[j].name().to_string(),
                    end: parts[j].end() as u64,
                    flash_size: flash_size as u64,
                }
                .into());
            }
            warn!(
                "Shrinking partition '{}' to fit the flash size",
                parts[j].name()
            );
            parts[j].set_size(flash_size - parts[j].offset());
        }
    }
    Ok(())
}

fn rename_partition(
    table: &mut PartitionTable,
    old_name: &str,
    new_name: &str,
    ctx: &mut PlanContext,
) -> Result<(), Error> {
    let parts = table.partitions_mut();
    let i = parts
        .iter()
        .position(|p| p.name() == old_name)
        .ok_or_else(|| Error::NotFound(old_name.to_string()))?;
    info!("Renaming partition '{old_name}' to '{new_name}'");
    parts[i].set_name(new_name.to_string());

    // Keep the chain back to the name in the starting table.
    let original = ctx
        .renames
        .remove(old_name)
        .unwrap_or_else(|| old_name.to_string());
    ctx.renames.insert(new_name.to_string(), original);
    Ok(())
}

fn app_size(table: &mut PartitionTable, size: u32, ctx: &mut PlanContext) -> Result<(), Error> {
    let flash_size = table.flash_size();
    let app_names: Vec<String> = table
        .partitions()
        .iter()
        .filter(|p| p.is_app())
        .map(|p| (p.name().to_string(), p.offset()))
        .map(|(name, offset)| {
            if offset as u64 + size as u64 > flash_size as u64 {
                Err(LayoutError::AppSizeExceeded {
                    name: name.clone(),
                    app_size: size as u64,
                })
            } else {
                Ok(name)
            }
        })
        .collect::<Result<_, _>>()?;

    for name in app_names {
        resize_partition(table, &name, size, ctx)?;
    }
    Ok(())
}

/// Round sizes up to a block, align app partitions, and restore offset
/// order.
fn normalize(table: &mut PartitionTable) {
    let parts = table.partitions_mut();
    for p in parts.iter_mut() {
        let size = p.size().next_multiple_of(BLOCK_SIZE);
        p.set_size(size);
        if p.is_app() {
            p.set_offset(p.offset().next_multiple_of(APP_ALIGNMENT));
        }
    }
    parts.sort_by_key(|p| p.offset());
}

fn side_effects(
    old: &PartitionTable,
    table: PartitionTable,
    renames: &HashMap<String, String>,
) -> Plan {
    let mut touched_data = vec![];
    let mut carried = vec![];
    let mut grown_fs = vec![];
    let mut moved_apps = vec![];

    for p in table.partitions() {
        let old_name = renames
            .get(p.name())
            .map(String::as_str)
            .unwrap_or(p.name());
        let previous = old.find(old_name);

        if p.is_app() {
            if let Some(o) = previous {
                if o.offset() != p.offset() {
                    moved_apps.push(p.name().to_string());
                }
            }
            continue;
        }

        match previous {
            Some(o)
                if o.offset() == p.offset()
                    && o.size() == p.size()
                    && o.sub_type() == p.sub_type() => {}
            Some(o)
                if p.is_filesystem()
                    && o.sub_type() == p.sub_type()
                    && o.offset() == p.offset()
                    && p.size() > o.size() =>
            {
                grown_fs.push(p.name().to_string());
            }
            other => {
                if let Some(o) = other.filter(|o| o.offset() != p.offset()) {
                    carried.push(CarryOver {
                        name: p.name().to_string(),
                        old_offset: o.offset() as u64,
                        old_size: o.size() as u64,
                        new_offset: p.offset() as u64,
                        new_size: p.size() as u64,
                    });
                }
                touched_data.push(p.name().to_string());
            }
        }
    }

    let flash_size_changed = old.flash_size() != table.flash_size();
    Plan {
        table,
        touched_data,
        carried,
        grown_fs,
        moved_apps,
        flash_size_changed,
    }
}

fn to_u32(value: u64) -> Result<u32, Error> {
    u32::try_from(value).map_err(|_| Error::User(format!("value {value:#x} is out of range")))
}
