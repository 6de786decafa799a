//! Compute memory objects

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::kernel::KernelHandle;
use crate::core::PoolIndex;
use crate::rtt::TextureHandle;

bitflags! {
    /// Access mode and residency flags of a memory object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Write the initial data right after creation
        const INITIAL_COPY = 1 << 2;
        /// Write the staged host data before every dispatch using this buffer
        const COPY_ON_USE = 1 << 3;
        /// Back the buffer with host-visible memory
        const USE_HOST_MEMORY = 1 << 4;
        /// Delete the buffer after the first dispatch using it
        const DELETE_AFTER_USE = 1 << 5;
        const BLOCK_ON_READ = 1 << 6;
        const BLOCK_ON_WRITE = 1 << 7;
        /// Backed by a graphics-API object
        const GRAPHICS_INTEROP = 1 << 8;
        /// Read the buffer back into its host copy after every dispatch
        const READ_BACK_RESULT = 1 << 9;
    }
}

impl Default for BufferFlags {
    fn default() -> Self {
        Self::READ_WRITE | Self::BLOCK_ON_READ | Self::BLOCK_ON_WRITE
    }
}

/// Stable handle to a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) PoolIndex);

impl std::fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Texel format of image memory objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Float,
}

impl ImageFormat {
    #[must_use]
    pub const fn bytes_per_pixel(self) -> u64 {
        match self {
            Self::Rgba8Unorm | Self::R32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// Id of an application-owned graphics buffer registered for interop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphicsBufferId(pub u64);

/// Graphics-API object a memory object can wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphicsObject {
    Buffer { id: GraphicsBufferId, size: u64 },
    Texture2d(TextureHandle),
    Texture3d(TextureHandle),
    Renderbuffer(TextureHandle),
}

/// Shape of a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Buffer,
    Image2d {
        width: u32,
        height: u32,
        format: ImageFormat,
    },
    Image3d {
        width: u32,
        height: u32,
        depth: u32,
        format: ImageFormat,
    },
    Graphics(GraphicsObject),
}

/// Host access requested when mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    Read,
    Write,
    ReadWrite,
}

impl MapAccess {
    #[must_use]
    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Host view of a mapped memory object; hand it back to `unmap`.
#[derive(Debug)]
pub struct MappedRegion {
    pub(crate) buffer: BufferHandle,
    pub(crate) access: MapAccess,
    pub data: Vec<u8>,
}

impl MappedRegion {
    #[must_use]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    #[must_use]
    pub fn access(&self) -> MapAccess {
        self.access
    }
}

/// Registry record of one memory object.
#[derive(Debug)]
pub(crate) struct MemoryObject<M> {
    pub device: usize,
    pub memory: M,
    pub kind: MemoryKind,
    pub flags: BufferFlags,
    pub size: u64,
    /// Staged data for `COPY_ON_USE`, result data for `READ_BACK_RESULT`
    pub host_data: Option<Vec<u8>>,
    /// (kernel -> argument indices) currently bound to this object
    pub bound_to: FxHashMap<KernelHandle, SmallVec<[u32; 4]>>,
    pub manual_sharing: bool,
    pub acquired: bool,
    pub mapped: Option<MapAccess>,
}

impl<M> MemoryObject<M> {
    pub fn new(device: usize, memory: M, kind: MemoryKind, flags: BufferFlags, size: u64) -> Self {
        Self {
            device,
            memory,
            kind,
            flags,
            size,
            host_data: None,
            bound_to: FxHashMap::default(),
            manual_sharing: false,
            acquired: false,
            mapped: None,
        }
    }

    pub fn is_interop(&self) -> bool {
        self.flags.contains(BufferFlags::GRAPHICS_INTEROP)
    }

    pub fn add_binding(&mut self, kernel: KernelHandle, index: u32) {
        let indices = self.bound_to.entry(kernel).or_default();
        if !indices.contains(&index) {
            indices.push(index);
        }
    }

    pub fn remove_binding(&mut self, kernel: KernelHandle, index: u32) {
        if let Some(indices) = self.bound_to.get_mut(&kernel) {
            indices.retain(|i| *i != index);
            if indices.is_empty() {
                self.bound_to.remove(&kernel);
            }
        }
    }

    /// Whether `(kernel, index)` is in the back-reference set.
    pub fn is_bound(&self, kernel: KernelHandle, index: u32) -> bool {
        self.bound_to
            .get(&kernel)
            .is_some_and(|indices| indices.contains(&index))
    }
}
