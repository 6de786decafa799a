//! Compute kernels, argument layouts and dispatch ranges

use std::collections::BTreeMap;
use std::path::PathBuf;

use super::buffer::{BufferHandle, GraphicsObject, MemoryKind};
use crate::core::PoolIndex;

/// Stable handle to a kernel registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelHandle(pub(crate) PoolIndex);

impl std::fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "kernel#{}", self.0)
    }
}

/// Where a kernel's source text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSource {
    Inline(String),
    /// Path relative to the kernel directory (absolute paths are used as is)
    File(PathBuf),
}

/// Lifecycle state of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    /// Not built, or the last build failed
    Uncompiled,
    Compiled,
    ArgumentsPartiallySet,
    ArgumentsFullySet,
    Destroyed,
}

impl KernelState {
    #[must_use]
    pub const fn is_dispatchable(self) -> bool {
        matches!(self, Self::ArgumentsFullySet)
    }
}

/// Binding kind of one kernel argument, as reflected from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    StorageBuffer { read_only: bool },
    /// Plain value argument of a fixed byte size
    Uniform { size: u32 },
    StorageImage { volume: bool },
    SampledImage { volume: bool },
    Sampler,
}

impl ArgKind {
    /// Check whether a memory object of `kind` may be bound to this slot.
    pub fn accepts_memory(self, kind: &MemoryKind) -> Result<(), String> {
        let is_volume = match kind {
            MemoryKind::Buffer | MemoryKind::Graphics(GraphicsObject::Buffer { .. }) => None,
            MemoryKind::Image2d { .. }
            | MemoryKind::Graphics(GraphicsObject::Texture2d(_))
            | MemoryKind::Graphics(GraphicsObject::Renderbuffer(_)) => Some(false),
            MemoryKind::Image3d { .. } | MemoryKind::Graphics(GraphicsObject::Texture3d(_)) => {
                Some(true)
            }
        };

        match (self, is_volume) {
            (Self::StorageBuffer { .. } | Self::Uniform { .. }, None) => Ok(()),
            (Self::StorageImage { volume } | Self::SampledImage { volume }, Some(v))
                if volume == v =>
            {
                Ok(())
            }
            _ => Err(format!("memory object of kind {kind:?} cannot bind to {self:?}")),
        }
    }

    /// Check whether a plain value of `len` bytes may be bound to this slot.
    pub fn accepts_value(self, len: usize) -> Result<(), String> {
        match self {
            Self::Uniform { size } if size as usize == len => Ok(()),
            Self::Uniform { size } => Err(format!("expected {size} bytes, got {len}")),
            other => Err(format!("{other:?} requires a memory object, got a value")),
        }
    }
}

/// Argument value handed to `set_argument`.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    Value(Vec<u8>),
}

impl KernelArg {
    /// Plain-old-data value argument.
    pub fn value<T: bytemuck::Pod>(value: &T) -> Self {
        Self::Value(bytemuck::bytes_of(value).to_vec())
    }
}

impl From<BufferHandle> for KernelArg {
    fn from(handle: BufferHandle) -> Self {
        Self::Buffer(handle)
    }
}

/// 1D, 2D or 3D work range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    dimensions: u8,
    sizes: [u32; 3],
}

impl NdRange {
    #[must_use]
    pub const fn one(x: u32) -> Self {
        Self {
            dimensions: 1,
            sizes: [x, 1, 1],
        }
    }

    #[must_use]
    pub const fn two(x: u32, y: u32) -> Self {
        Self {
            dimensions: 2,
            sizes: [x, y, 1],
        }
    }

    #[must_use]
    pub const fn three(x: u32, y: u32, z: u32) -> Self {
        Self {
            dimensions: 3,
            sizes: [x, y, z],
        }
    }

    #[must_use]
    pub const fn dimensions(&self) -> u8 {
        self.dimensions
    }

    #[must_use]
    pub const fn sizes(&self) -> [u32; 3] {
        self.sizes
    }

    /// Total number of work-items.
    #[must_use]
    pub fn product(&self) -> u64 {
        self.sizes.iter().map(|s| u64::from(*s)).product()
    }

    /// Number of `local`-sized groups needed to cover this range, per axis.
    #[must_use]
    pub fn groups(&self, local: &NdRange) -> [u32; 3] {
        let mut groups = [1; 3];
        for (axis, group) in groups.iter_mut().enumerate() {
            let l = local.sizes[axis].max(1);
            *group = self.sizes[axis].div_ceil(l);
        }
        groups
    }
}

/// Derive a work-group shape for `global` that fits the device limits.
///
/// The device's max work-group size is split evenly across the used axes (a power
/// of two per axis), then clamped to the per-axis item limit and to the global
/// size itself. The product never exceeds `max_work_group_size`.
#[must_use]
pub fn compute_local_range(
    global: &NdRange,
    max_work_group_size: u32,
    max_work_item_sizes: [u32; 3],
) -> NdRange {
    let dims = u32::from(global.dimensions.clamp(1, 3));
    let max = max_work_group_size.max(1);

    // largest power of two t with t^dims <= max
    let mut tile = 1u32;
    while (tile * 2).checked_pow(dims).is_some_and(|p| p <= max) {
        tile *= 2;
    }

    let mut sizes = [1u32; 3];
    for axis in 0..dims as usize {
        let axis_tile = if dims == 1 { max } else { tile };
        sizes[axis] = axis_tile
            .min(max_work_item_sizes[axis].max(1))
            .min(global.sizes[axis].max(1));
    }

    NdRange {
        dimensions: global.dimensions,
        sizes,
    }
}

/// Registry record of one kernel.
#[derive(Debug)]
pub(crate) struct Kernel<P> {
    pub identifier: String,
    pub source: KernelSource,
    pub entry_point: String,
    pub options: String,
    pub device: usize,
    /// `None` while uncompiled or after a failed build
    pub program: Option<P>,
    pub build_log: Option<String>,
    pub args: Vec<ArgKind>,
    /// Fixed work-group size declared by the kernel, if any
    pub workgroup_size: Option<[u32; 3]>,
    pub args_set: Vec<bool>,
    /// argument index -> buffer currently backing it
    pub buffer_args: BTreeMap<u32, BufferHandle>,
    pub global: Option<NdRange>,
    pub local: Option<NdRange>,
    pub has_graphics_buffers: bool,
    pub dispatch_count: u64,
}

impl<P> Kernel<P> {
    pub fn new(
        identifier: &str,
        source: KernelSource,
        entry_point: &str,
        options: &str,
        device: usize,
    ) -> Self {
        Self {
            identifier: identifier.to_string(),
            source,
            entry_point: entry_point.to_string(),
            options: options.to_string(),
            device,
            program: None,
            build_log: None,
            args: Vec::new(),
            workgroup_size: None,
            args_set: Vec::new(),
            buffer_args: BTreeMap::new(),
            global: None,
            local: None,
            has_graphics_buffers: false,
            dispatch_count: 0,
        }
    }

    pub fn state(&self) -> KernelState {
        if self.program.is_none() {
            return KernelState::Uncompiled;
        }
        let set = self.args_set.iter().filter(|s| **s).count();
        if set == self.args_set.len() {
            // also covers kernels without arguments
            KernelState::ArgumentsFullySet
        } else if set == 0 {
            KernelState::Compiled
        } else {
            KernelState::ArgumentsPartiallySet
        }
    }

    /// Indices that were never set.
    pub fn unset_args(&self) -> Vec<u32> {
        self.args_set
            .iter()
            .enumerate()
            .filter(|(_, set)| !**set)
            .map(|(idx, _)| idx as u32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_range_1d() {
        let local = compute_local_range(&NdRange::one(10_000), 256, [256, 256, 64]);
        assert_eq!(local.sizes(), [256, 1, 1]);

        let small = compute_local_range(&NdRange::one(32), 256, [256, 256, 64]);
        assert_eq!(small.sizes(), [32, 1, 1]);
    }

    #[test]
    fn test_local_range_2d_and_3d_respect_limit() {
        let local = compute_local_range(&NdRange::two(1920, 1080), 256, [256, 256, 64]);
        assert_eq!(local.sizes(), [16, 16, 1]);
        assert!(local.product() <= 256);

        let local = compute_local_range(&NdRange::three(64, 64, 64), 1024, [1024, 1024, 4]);
        assert_eq!(local.sizes(), [8, 8, 4]);
        assert!(local.product() <= 1024);

        let odd = compute_local_range(&NdRange::two(100, 100), 200, [200, 200, 200]);
        assert!(odd.product() <= 200);
    }

    #[test]
    fn test_groups_round_up() {
        let global = NdRange::two(100, 30);
        let local = NdRange::two(16, 16);
        assert_eq!(global.groups(&local), [7, 2, 1]);
    }

    #[test]
    fn test_arg_kind_compatibility() {
        let storage = ArgKind::StorageBuffer { read_only: false };
        assert!(storage.accepts_memory(&MemoryKind::Buffer).is_ok());
        assert!(storage.accepts_value(4).is_err());

        let uniform = ArgKind::Uniform { size: 16 };
        assert!(uniform.accepts_value(16).is_ok());
        assert!(uniform.accepts_value(4).is_err());

        let image = ArgKind::StorageImage { volume: false };
        let image_kind = MemoryKind::Image2d {
            width: 4,
            height: 4,
            format: super::super::buffer::ImageFormat::Rgba8Unorm,
        };
        assert!(image.accepts_memory(&image_kind).is_ok());
        assert!(image.accepts_memory(&MemoryKind::Buffer).is_err());
    }
}
