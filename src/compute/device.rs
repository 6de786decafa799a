//! Compute device description and selection

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of compute-capable processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Gpu,
    Cpu,
    Other,
}

/// Vendor category a device is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Unknown,
}

impl Vendor {
    /// Classify a vendor from a PCI vendor id, falling back to the vendor name.
    #[must_use]
    pub fn classify(vendor_id: u32, name: &str) -> Self {
        match vendor_id {
            0x10de => return Self::Nvidia,
            0x1002 | 0x1022 => return Self::Amd,
            0x8086 => return Self::Intel,
            0x106b => return Self::Apple,
            _ => {}
        }

        let name = name.to_ascii_lowercase();
        if name.contains("nvidia") {
            Self::Nvidia
        } else if name.contains("amd") || name.contains("ati") || name.contains("radeon") {
            Self::Amd
        } else if name.contains("intel") {
            Self::Intel
        } else if name.contains("apple") {
            Self::Apple
        } else {
            Self::Unknown
        }
    }

    /// Build-option define appended for this vendor.
    #[must_use]
    pub const fn define(self) -> &'static str {
        match self {
            Self::Nvidia => "VENDOR_NVIDIA",
            Self::Amd => "VENDOR_AMD",
            Self::Intel => "VENDOR_INTEL",
            Self::Apple => "VENDOR_APPLE",
            Self::Unknown => "VENDOR_UNKNOWN",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nvidia => "NVIDIA",
            Self::Amd => "AMD",
            Self::Intel => "INTEL",
            Self::Apple => "APPLE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// One compute-capable processor. Immutable after enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: Vendor,
    pub kind: DeviceKind,
    /// Number of compute units
    pub units: u32,
    /// Clock rate in MHz
    pub clock: u32,
    /// Global memory size in bytes
    pub memory_size: u64,
    /// Largest single allocation in bytes
    pub max_alloc: u64,
    /// Largest 2D image (width, height)
    pub max_image_2d: (u32, u32),
    /// Largest 3D image (width, height, depth)
    pub max_image_3d: (u32, u32, u32),
    /// Maximum work-items in one work-group
    pub max_work_group_size: u32,
    /// Per-axis work-group limits
    pub max_work_item_sizes: [u32; 3],
    pub extensions: Vec<String>,
}

impl DeviceInfo {
    /// Speed estimate used by the "fastest device" heuristics.
    #[must_use]
    pub fn speed(&self) -> u64 {
        u64::from(self.units) * u64::from(self.clock)
    }
}

/// Symbolic active-device request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelector {
    FastestGpu,
    FastestCpu,
    /// First device of this vendor
    Vendor(Vendor),
    /// Explicit ordinal into the enumerated device list
    Ordinal(usize),
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self::FastestGpu
    }
}

/// Index of the fastest device of `kind`, by units x clock.
///
/// Returns `None` when no device of that kind exists. Ties keep the earlier device.
#[must_use]
pub fn fastest(devices: &[DeviceInfo], kind: DeviceKind) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (idx, dev) in devices.iter().enumerate() {
        if dev.kind != kind {
            continue;
        }
        let speed = dev.speed();
        if best.is_none_or(|(_, best_speed)| speed > best_speed) {
            best = Some((idx, speed));
        }
    }
    best.map(|(idx, _)| idx)
}

#[cfg(test)]
pub(crate) fn test_device(name: &str, kind: DeviceKind, units: u32, clock: u32) -> DeviceInfo {
    DeviceInfo {
        name: name.to_string(),
        vendor: Vendor::classify(0, name),
        kind,
        units,
        clock,
        memory_size: 1 << 30,
        max_alloc: 1 << 28,
        max_image_2d: (8192, 8192),
        max_image_3d: (2048, 2048, 2048),
        max_work_group_size: 256,
        max_work_item_sizes: [256, 256, 64],
        extensions: Vec::new(),
    }
}
