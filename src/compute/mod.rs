//! Compute subsystem
//!
//! Device discovery, memory objects and kernels. [`ComputeRegistry`] is the
//! entry point; it runs on any [`ComputeBackend`]:
//! - [`WgpuCompute`] executes WGSL kernels on wgpu adapters
//! - [`HeadlessCompute`] executes registered host functions on the CPU

mod backend;
pub(crate) mod buffer;
mod context;
pub(crate) mod device;
mod error;
mod gpu;
mod headless;
mod kernel;
mod reflect;
mod registry;

pub use backend::{BackendArg, ComputeBackend};
pub use buffer::{
    BufferFlags, BufferHandle, GraphicsBufferId, GraphicsObject, ImageFormat, MapAccess,
    MappedRegion, MemoryKind,
};
pub use context::{options_prelude, ComputeContext};
pub use device::{fastest, DeviceInfo, DeviceKind, DeviceSelector, Vendor};
pub use error::{ApiErrorCode, ComputeError, ComputeResult};
pub use gpu::{adapter_device_info, WgpuCompute, WgpuMemory, WgpuProgram};
pub use headless::{
    host_device_info, HeadlessCompute, HostArgData, HostDispatch, HostKernelFn, HostMemory,
    HostProgram, HostStats,
};
pub use kernel::{
    compute_local_range, ArgKind, KernelArg, KernelHandle, KernelSource, KernelState, NdRange,
};
pub use reflect::{reflect, KernelLayout};
pub use registry::ComputeRegistry;
