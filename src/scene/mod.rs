//! Scene module
//!
//! The inferred renderer: cameras and view state, drawables, lights,
//! particles, environment probes, alpha sorting, the shading interface and
//! the [`Scene`] that sequences the passes of a frame.

mod alpha;
mod camera;
mod drawable;
mod frame;
mod lights;
mod orchestrator;
mod particles;
mod probe;
mod shaders;
mod shading;

pub use alpha::{
    project, sort_alpha_objects, ExtBBox, ScreenRect, SortedAlpha, MASK_ID_OFFSCREEN, MAX_MASK_ID,
};
pub use camera::{Camera, MatrixStack, ViewGuard, ViewState};
pub use drawable::{AlphaDrawable, DrawCallback, DrawContext, DrawMode, IrBuffers, Model};
pub use frame::{inferred_size, FrameBuffers, FrameSettings};
pub use lights::{Light, LightType, LightUniforms};
pub use orchestrator::{
    AlphaHandle, LightHandle, ModelHandle, ParticleHandle, PostContext, PostHandle,
    PostProcessHandler, Scene,
};
pub use particles::{
    EmitterConfig, EmitterManager, Particle, ParticleClock, ParticleEmitter, ParticleManager,
    ParticleVertex,
};
pub use probe::{EnvironmentProbe, ProbeFrequency, ProbeHandle};
pub use shaders::{
    builtin_programs, register_builtin_pipelines, register_builtin_programs, DIRECTIONAL_OPTION,
    FXAA_PROGRAM, LIGHT_PROGRAM, LUMA_PROGRAM, PARTICLE_PROGRAM, SKYBOX_PROGRAM,
};
pub use shading::{
    DrawCall, Primitive, ProgramInfo, ShaderSource, ShaderSources, Shading, UniformLocation,
    UniformValue, WgslShading, DEFAULT_OPTION, LIGHT_VOLUME_VERTICES,
};
