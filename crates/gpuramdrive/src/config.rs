//! Drive descriptor and configuration value parsing

use crate::backend::{BackendKind, BackendSelector};
use crate::error::DriveError;
use std::fmt;
use std::str::FromStr;

/// Default service name for the shared memory objects
pub const DEFAULT_SERVICE_NAME: &str = "GpuRamDrive";

/// Device type announced to the driver
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriveType {
    /// Hard disk
    #[default]
    Hd = 0x10,
    /// Floppy disk
    Fd = 0x20,
    /// CD/DVD-ROM
    Cd = 0x30,
    /// Raw device with no storage stack on top
    Raw = 0x40,
}

impl DriveType {
    /// Flag bits for the driver's device type field
    pub fn flags(self) -> u32 {
        self as u32
    }
}

impl FromStr for DriveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HD" => Ok(DriveType::Hd),
            "FD" => Ok(DriveType::Fd),
            "CD" => Ok(DriveType::Cd),
            "RAW" => Ok(DriveType::Raw),
            _ => Err(format!("unknown drive type '{s}' (expected HD, FD, CD or RAW)")),
        }
    }
}

impl fmt::Display for DriveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriveType::Hd => "HD",
            DriveType::Fd => "FD",
            DriveType::Cd => "CD",
            DriveType::Raw => "RAW",
        })
    }
}

/// Post-mount volume preparation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatOptions {
    /// Arguments passed to the format utility after the mount point
    pub params: String,
    /// Volume label applied after formatting
    pub label: Option<String>,
    /// Point TEMP/TMP at a folder on the new volume
    pub temp_folder: bool,
}

/// Everything needed to create one virtual disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveDescriptor {
    pub drive_type: DriveType,
    pub removable: bool,
    pub backend: BackendKind,
    pub selector: BackendSelector,
    /// Requested disk size in bytes
    pub size: u64,
    pub service_name: String,
    /// Drive letter ("R:") or mount folder
    pub mount_point: String,
    pub format: Option<FormatOptions>,
}

impl DriveDescriptor {
    /// Host-memory hard disk with default settings
    pub fn new(size: u64, mount_point: impl Into<String>) -> Self {
        Self {
            drive_type: DriveType::Hd,
            removable: false,
            backend: BackendKind::Host,
            selector: BackendSelector::default(),
            size,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            mount_point: mount_point.into(),
            format: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), DriveError> {
        if self.size == 0 {
            return Err(DriveError::InvalidDescriptor("size must be non-zero".into()));
        }
        if self.service_name.is_empty() || self.service_name.contains('\\') {
            return Err(DriveError::InvalidDescriptor(format!(
                "invalid service name '{}'",
                self.service_name
            )));
        }
        if self.mount_point.is_empty() {
            return Err(DriveError::InvalidDescriptor("mount point is empty".into()));
        }
        Ok(())
    }
}

/// Parse a byte size with an optional K/M/G/T suffix (binary units)
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;

    let shift = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        other => return Err(format!("unknown size suffix '{other}'")),
    };

    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{s}' is too large"))
}
