//! Render-to-texture subsystem
//!
//! [`Rtt`] owns every offscreen render target: attachments, antialiasing
//! storage, depth buffers shared between compatible targets, and the stack of
//! active passes. It draws through any [`GraphicsBackend`]:
//! - [`WgpuGraphics`] renders on the shared wgpu device
//! - [`HeadlessGraphics`] records calls for inspection

mod antialiasing;
mod backend;
mod gpu;
mod headless;
mod registry;
mod target;

pub use antialiasing::{resolution_for_scale, AntiAliasing, ParseAntiAliasingError};
pub use backend::{
    validate_framebuffer, BlendMode, ClearMask, CullFace, DepthFunc, FilterMode,
    FramebufferBinding, FramebufferStatus, GraphicsBackend, GraphicsError, GraphicsLimits,
    RenderState, TextureDesc, TextureFormat, TextureHandle, Winding, WrapMode,
};
pub use gpu::{compare_function, decode, pipeline_state, wgpu_format, RegisteredPipeline, WgpuGraphics};
pub use headless::{GraphicsCall, HeadlessGraphics, RecordedDraw};
pub use registry::Rtt;
pub use target::{
    AttachmentDesc, DepthAttachment, DepthMode, DepthSharing, RenderTarget, TargetDesc,
    TargetHandle,
};
