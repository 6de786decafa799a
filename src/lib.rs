//! An inferred-lighting 3D renderer with a general-purpose compute layer
//!
//! This crate provides:
//! - compute devices, buffers and kernels with graphics interop ([`compute`])
//! - offscreen render targets with antialiasing and shared depth ([`rtt`])
//! - the multi-pass scene renderer with alpha sorting ([`scene`])
//! - wgpu and headless backends for both
//!
//! The library never initialises a logger; binaries do.

pub mod compute;
pub mod core;
pub mod gpu;
pub mod rtt;
pub mod scene;

pub use glam;
pub use wgpu;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::compute::{
        BufferFlags, BufferHandle, ComputeBackend, ComputeRegistry, HeadlessCompute, KernelArg,
        KernelSource, NdRange, WgpuCompute,
    };
    pub use crate::core::{ComputeConfig, Engine, EngineConfig, FrameStats, ReloadFlags};
    pub use crate::gpu::GpuShare;
    pub use crate::rtt::{AntiAliasing, GraphicsBackend, HeadlessGraphics, Rtt, WgpuGraphics};
    pub use crate::scene::{
        AlphaDrawable, Camera, DrawContext, DrawMode, EmitterConfig, EmitterManager, ExtBBox,
        Light, Model, ParticleEmitter, Primitive, Scene, Shading, WgslShading,
    };
    pub use glam::{Mat4, Vec2, Vec3, Vec4};
}
