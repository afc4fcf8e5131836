//! Block device identities and sysfs lookups.
//!
//! Everything here reads below a configurable sysfs root so it can be pointed
//! at a scratch directory in tests.

pub mod resolve;
pub mod syscalls;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub use resolve::Resolver;

/// Default device name prefixes tracked when no explicit filter is given.
pub const DEFAULT_DEVICE_PREFIXES: &[&str] = &["nvme", "sd"];

const MINOR_BITS: u32 = 20;
const MINOR_MASK: u32 = (1 << MINOR_BITS) - 1;

/// Kernel block device number, encoded as `major<<20 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self((major << MINOR_BITS) | (minor & MINOR_MASK))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn major(&self) -> u32 {
        self.0 >> MINOR_BITS
    }

    pub const fn minor(&self) -> u32 {
        self.0 & MINOR_MASK
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

/// Errors raised while turning user-supplied device specs into ids.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("invalid device: {spec}")]
    InvalidSpec { spec: String },

    #[error("invalid {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("device not found: {name}")]
    NotFound { name: String },

    #[error("device {name}: uevent has no {field}")]
    MissingField { name: String, field: &'static str },

    #[error("listing block devices under {}: {source}", path.display())]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A device selected on the command line, with its resolved id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedDevice {
    pub name: String,
    pub id: DeviceId,
}

/// Read-only view of a sysfs tree.
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    /// Creates a view rooted at `root` (normally `/sys`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory this view reads below.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the `inflight` pseudo-file for a block device.
    pub fn inflight_path(&self, name: &str) -> PathBuf {
        self.root.join("block").join(name).join("inflight")
    }

    /// Resolves a device name (e.g. `sdc`) to its id via `block/<name>/uevent`.
    pub fn device_id(&self, name: &str) -> Result<DeviceId, DeviceError> {
        let path = self.root.join("block").join(name).join("uevent");
        let content = fs::read_to_string(&path).map_err(|_| DeviceError::NotFound {
            name: name.to_string(),
        })?;

        let major = uevent_field(&content, "MAJOR").ok_or_else(|| DeviceError::MissingField {
            name: name.to_string(),
            field: "MAJOR",
        })?;
        let minor = uevent_field(&content, "MINOR").ok_or_else(|| DeviceError::MissingField {
            name: name.to_string(),
            field: "MINOR",
        })?;

        Ok(DeviceId::new(
            parse_number("major", major)?,
            parse_number("minor", minor)?,
        ))
    }

    /// Looks up the kernel name of a device via `dev/block/M:m/uevent`.
    pub fn device_name(&self, id: DeviceId) -> Option<String> {
        let path = self
            .root
            .join("dev/block")
            .join(id.to_string())
            .join("uevent");
        match fs::read_to_string(&path) {
            Ok(content) => uevent_field(&content, "DEVNAME").map(str::to_string),
            Err(e) => {
                debug!(device = %id, error = %e, "device name lookup failed");
                None
            }
        }
    }

    /// Lists entries of `block/`, sorted by name.
    pub fn block_devices(&self) -> std::io::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(self.root.join("block"))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Resolves every top-level block device whose name matches one of
    /// `prefixes`. Run once at startup; the result feeds the ingest filter.
    pub fn tracked_devices(&self, prefixes: &[String]) -> Result<Vec<SelectedDevice>, DeviceError> {
        let names = self.block_devices().map_err(|source| DeviceError::List {
            path: self.root.join("block"),
            source,
        })?;

        let mut devices = Vec::new();
        for name in names.into_iter().filter(|n| is_tracked(n, prefixes)) {
            let id = self.device_id(&name)?;
            devices.push(SelectedDevice { name, id });
        }
        Ok(devices)
    }
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/sys")
    }
}

/// Parses a comma-separated device filter: names (`sdc`) or `major:minor`.
///
/// An empty filter yields an empty list, meaning "no filter".
pub fn parse_device_filter(spec: &str, sysfs: &Sysfs) -> Result<Vec<SelectedDevice>, DeviceError> {
    let mut devices = Vec::new();

    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((major, minor)) = part.split_once(':') {
            if minor.contains(':') {
                return Err(DeviceError::InvalidSpec {
                    spec: part.to_string(),
                });
            }
            let id = DeviceId::new(parse_number("major", major)?, parse_number("minor", minor)?);
            devices.push(SelectedDevice {
                name: part.to_string(),
                id,
            });
            continue;
        }

        let id = sysfs.device_id(part)?;
        devices.push(SelectedDevice {
            name: part.to_string(),
            id,
        });
    }

    Ok(devices)
}

/// Whether a device name matches one of the tracked prefixes.
pub fn is_tracked(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p.as_str()))
}

fn uevent_field<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
            .map(str::trim)
    })
}

fn parse_number(field: &'static str, value: &str) -> Result<u32, DeviceError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| DeviceError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}
