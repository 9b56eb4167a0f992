//! Library and application errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid image: {0}")]
    #[diagnostic(
        code(espimage::invalid_image),
        help("The file does not start with a valid ESP32 application image header")
    )]
    InvalidImage(String),

    #[error("Invalid partition table: {0}")]
    #[diagnostic(
        code(espimage::bad_table),
        help("The partition table region is malformed or its MD5 record does not match")
    )]
    BadTable(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Layout(#[from] LayoutError),

    #[error("Partition '{0}' not found")]
    #[diagnostic(
        code(espimage::not_found),
        help("Use the bare command to list the partitions in this image")
    )]
    NotFound(String),

    #[error("Access outside partition or flash bounds: {0}")]
    #[diagnostic(code(espimage::range))]
    Range(String),

    #[error("Device error: {0}")]
    #[diagnostic(code(espimage::device))]
    Device(String),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(espimage::fs))]
    Fs(String),

    #[error("{0}")]
    #[diagnostic(code(espimage::user))]
    User(String),

    #[error("Cancelled by user")]
    #[diagnostic(code(espimage::cancelled))]
    Cancelled,

    #[error("IO error while accessing '{path}'")]
    #[diagnostic(code(espimage::io))]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// A partition layout rule violation, raised by the planner before anything
/// is written.
#[derive(Error, Debug, Diagnostic, PartialEq, Eq)]
#[non_exhaustive]
pub enum LayoutError {
    #[error("Partitions '{0}' and '{1}' overlap")]
    #[diagnostic(code(espimage::layout::overlap))]
    Overlap(String, String),

    #[error("End of partition '{name}' ({end:#x}) exceeds the flash size ({flash_size:#x})")]
    #[diagnostic(
        code(espimage::layout::overflow),
        help("Increase the flash size with '-f' or shrink earlier partitions")
    )]
    Overflow {
        name: String,
        end: u64,
        flash_size: u64,
    },

    #[error("Partition name '{0}' is repeated")]
    #[diagnostic(code(espimage::layout::duplicate_name))]
    DuplicateName(String),

    #[error("Partition name '{0}' is invalid")]
    #[diagnostic(
        code(espimage::layout::bad_name),
        help("Names must be 1 to 15 ASCII characters")
    )]
    BadName(String),

    #[error("Partition '{name}': {offset:#x} is not a multiple of {align:#x}")]
    #[diagnostic(code(espimage::layout::unaligned))]
    Unaligned { name: String, offset: u64, align: u64 },

    #[error("First partition at {0:#x} would overlap the partition table")]
    #[diagnostic(code(espimage::layout::before_first))]
    BeforeFirstPartition(u64),

    #[error("Subtype '{subtype}' is not valid for a {ty} partition")]
    #[diagnostic(code(espimage::layout::subtype))]
    SubtypeMismatch { ty: String, subtype: String },

    #[error("Unknown partition subtype '{0}'")]
    #[diagnostic(code(espimage::layout::unknown_subtype))]
    UnknownSubtype(String),

    #[error("Table has no app partition")]
    #[diagnostic(
        code(espimage::layout::no_app),
        help("A bootable table needs a 'factory' or 'ota_N' partition")
    )]
    NoAppPartition,

    #[error("Table has 'ota_N' app partitions but no 'otadata' partition")]
    #[diagnostic(code(espimage::layout::no_otadata))]
    NoOtadata,

    #[error("Table has more than one 'otadata' partition")]
    #[diagnostic(code(espimage::layout::multiple_otadata))]
    MultipleOtadata,

    #[error("Only one partition may be resized to 0 (fill available space) per run")]
    #[diagnostic(code(espimage::layout::zero_grow))]
    AmbiguousZeroGrow,

    #[error("No room on flash for partition '{name}' ({size:#x} bytes)")]
    #[diagnostic(code(espimage::layout::no_room))]
    NoRoom { name: String, size: u64 },

    #[error("App size {app_size:#x} exceeds the space available to '{name}'")]
    #[diagnostic(code(espimage::layout::app_size))]
    AppSizeExceeded { name: String, app_size: u64 },

    #[error("Unknown table template '{0}'")]
    #[diagnostic(
        code(espimage::layout::unknown_template),
        help("Known templates are 'default', 'original' and 'ota'")
    )]
    UnknownTemplate(String),
}

pub(crate) trait ResultExt<T> {
    /// Tag an `io::Error` with the path it occurred on.
    fn at_path(self, path: &str) -> Result<T, Error>;
}

impl<T> ResultExt<T> for Result<T, io::Error> {
    fn at_path(self, path: &str) -> Result<T, Error> {
        self.map_err(|e| Error::io(path, e))
    }
}
