//! Low-level compute device API driven by the registries

use super::buffer::{BufferFlags, GraphicsObject, MapAccess, MemoryKind};
use super::device::DeviceInfo;
use super::error::ComputeResult;
use super::kernel::NdRange;
use super::reflect::KernelLayout;

/// Argument handed to [`ComputeBackend::set_arg`].
#[derive(Debug, Clone, Copy)]
pub enum BackendArg<'a, M> {
    Memory(&'a M),
    Value(&'a [u8]),
}

/// A compute device API.
///
/// Every call either succeeds or reports a [`ComputeError`](super::ComputeError)
/// already translated into the compute taxonomy; implementations never panic
/// on device errors. Commands on one device execute in submission order.
pub trait ComputeBackend {
    /// Device memory allocation
    type Memory: std::fmt::Debug;
    /// Built kernel with its current argument bindings
    type Program: std::fmt::Debug;

    /// Enumerate every device of the selected platform(s).
    fn enumerate_devices(
        &mut self,
        use_platform_devices: bool,
        platform_index: usize,
    ) -> ComputeResult<Vec<DeviceInfo>>;

    /// Create one command queue per listed device.
    fn open_queues(&mut self, devices: &[usize]) -> ComputeResult<()>;

    /// Submit pending commands without waiting.
    fn flush(&mut self, device: usize) -> ComputeResult<()>;

    /// Block until every submitted command on `device` has completed.
    fn finish(&mut self, device: usize) -> ComputeResult<()>;

    /// Whether kernels carry a fixed work-group size chosen at build time.
    fn fixed_workgroup_size(&self) -> bool;

    fn create_buffer(
        &mut self,
        device: usize,
        size: u64,
        flags: BufferFlags,
    ) -> ComputeResult<Self::Memory>;

    fn create_image(
        &mut self,
        device: usize,
        kind: &MemoryKind,
        flags: BufferFlags,
    ) -> ComputeResult<Self::Memory>;

    /// Wrap a graphics object, returning the memory and its size in bytes.
    fn import_graphics(
        &mut self,
        device: usize,
        object: &GraphicsObject,
        flags: BufferFlags,
    ) -> ComputeResult<(Self::Memory, u64)>;

    /// Free memory once no enqueued command references it anymore.
    fn release_memory(&mut self, memory: Self::Memory);

    fn write(
        &mut self,
        memory: &Self::Memory,
        offset: u64,
        data: &[u8],
        blocking: bool,
    ) -> ComputeResult<()>;

    /// Read completed data. `blocking` additionally drains the whole queue first.
    fn read(
        &mut self,
        memory: &Self::Memory,
        offset: u64,
        dst: &mut [u8],
        blocking: bool,
    ) -> ComputeResult<()>;

    fn map(
        &mut self,
        memory: &Self::Memory,
        access: MapAccess,
        blocking: bool,
    ) -> ComputeResult<Vec<u8>>;

    fn unmap(&mut self, memory: &Self::Memory, access: MapAccess, data: &[u8])
    -> ComputeResult<()>;

    /// Take a graphics object away from the graphics API.
    fn acquire_graphics(&mut self, memory: &Self::Memory) -> ComputeResult<()>;

    /// Hand a graphics object back to the graphics API.
    fn release_graphics(&mut self, memory: &Self::Memory) -> ComputeResult<()>;

    /// Build a validated kernel source.
    fn compile(
        &mut self,
        device: usize,
        identifier: &str,
        source: &str,
        entry_point: &str,
        layout: &KernelLayout,
    ) -> ComputeResult<Self::Program>;

    fn destroy_program(&mut self, program: Self::Program);

    fn set_arg(
        &mut self,
        program: &mut Self::Program,
        index: u32,
        arg: BackendArg<'_, Self::Memory>,
    ) -> ComputeResult<()>;

    /// Enqueue one dispatch; returns once enqueued.
    fn dispatch(
        &mut self,
        program: &Self::Program,
        global: &NdRange,
        local: &NdRange,
    ) -> ComputeResult<()>;
}
