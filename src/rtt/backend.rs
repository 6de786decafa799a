//! Graphics backend interface
//!
//! [`Rtt`](super::Rtt) and the scene drive rendering through [`GraphicsBackend`].
//! The trait covers what a deferred renderer needs from the device: texture
//! allocation, framebuffer binding, clears, resolves, fixed-function state and
//! draws issued by the shading layer.

use std::fmt;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::scene::DrawCall;

/// Opaque texture handle issued by a graphics backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(u64);

impl TextureHandle {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Texel format of a render-target attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFormat {
    #[default]
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    Rg16Float,
    R32Float,
    R32Uint,
    Depth24Plus,
    Depth32Float,
}

impl TextureFormat {
    #[must_use]
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::Depth24Plus | Self::Depth32Float)
    }

    /// Bytes per texel.
    #[must_use]
    pub const fn texel_size(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rg16Float | Self::R32Float | Self::R32Uint => 4,
            Self::Depth24Plus | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// Texture filtering. Mipmapped modes are stored but render targets have a
/// single level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Point,
    #[default]
    Linear,
    Bilinear,
    Trilinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirroredRepeat,
}

/// Everything a backend needs to allocate one texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// 1 for single-sampled storage.
    pub samples: u32,
    /// Whether shaders may sample it (depth renderbuffers may not).
    pub sampled: bool,
    pub filter: FilterMode,
    pub wrap: [WrapMode; 2],
}

/// Attachments bound for drawing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramebufferBinding {
    pub color: SmallVec<[TextureHandle; 4]>,
    pub depth: Option<TextureHandle>,
}

/// Device limits relevant to render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsLimits {
    pub max_texture_size: u32,
    pub max_samples: u32,
    pub max_color_attachments: u32,
    /// Whether coverage sampling (CSAA) is available.
    pub coverage_samples: bool,
}

impl Default for GraphicsLimits {
    fn default() -> Self {
        Self {
            max_texture_size: 8192,
            max_samples: 8,
            max_color_attachments: 8,
            coverage_samples: false,
        }
    }
}

bitflags! {
    /// Buffers affected by a clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearMask: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// `src * 1 + dst * (1 - src_color)`, used for light accumulation
    Additive,
    /// `src * 1 + dst * (1 - src_alpha)`
    PremultipliedAlpha,
}

/// Front-face winding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Winding {
    #[default]
    Ccw,
    Cw,
}

impl Winding {
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Ccw => Self::Cw,
            Self::Cw => Self::Ccw,
        }
    }
}

/// Which faces are culled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullFace {
    #[default]
    Back,
    Front,
    None,
}

/// Fixed-function state applied to subsequent draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderState {
    /// `None` disables depth testing.
    pub depth_func: Option<DepthFunc>,
    pub depth_write: bool,
    pub blend: Option<BlendMode>,
    pub front_face: Winding,
    pub cull: CullFace,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            depth_func: Some(DepthFunc::Less),
            depth_write: true,
            blend: None,
            front_face: Winding::Ccw,
            cull: CullFace::Back,
        }
    }
}

/// Completeness of the bound framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    Unsupported,
    IncompleteAttachment,
    MissingAttachment,
    IncompleteDrawBuffer,
    IncompleteReadBuffer,
    IncompleteLayerTargets,
    IncompleteMultisample,
    Unknown(u32),
}

impl FramebufferStatus {
    #[must_use]
    pub const fn is_complete(self) -> bool {
        matches!(self, Self::Complete)
    }

    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Complete => "framebuffer complete",
            Self::Unsupported => "unsupported framebuffer configuration",
            Self::IncompleteAttachment => "incomplete attachment",
            Self::MissingAttachment => "missing attachment",
            Self::IncompleteDrawBuffer => "incomplete draw buffer",
            Self::IncompleteReadBuffer => "incomplete read buffer",
            Self::IncompleteLayerTargets => "incomplete layer targets",
            Self::IncompleteMultisample => "incomplete multisample",
            Self::Unknown(_) => "unknown framebuffer error",
        }
    }
}

impl fmt::Display for FramebufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "{} ({code:#x})", self.reason()),
            other => f.write_str(other.reason()),
        }
    }
}

/// Decoded device error, reported after a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    InvalidEnum(String),
    InvalidValue(String),
    InvalidOperation(String),
    InvalidFramebufferOperation(String),
    OutOfMemory(String),
    Other(String),
}

impl GraphicsError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidEnum(_) => "invalid enum",
            Self::InvalidValue(_) => "invalid value",
            Self::InvalidOperation(_) => "invalid operation",
            Self::InvalidFramebufferOperation(_) => "invalid framebuffer operation",
            Self::OutOfMemory(_) => "out of memory",
            Self::Other(_) => "unknown error",
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidEnum(msg)
            | Self::InvalidValue(msg)
            | Self::InvalidOperation(msg)
            | Self::InvalidFramebufferOperation(msg)
            | Self::OutOfMemory(msg)
            | Self::Other(msg) => msg,
        }
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for GraphicsError {}

/// Low-level graphics device driven by the render-target registry and the scene.
pub trait GraphicsBackend {
    fn limits(&self) -> GraphicsLimits;

    /// # Errors
    ///
    /// Returns a [`GraphicsError`] if the device rejects the texture.
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle, GraphicsError>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Bind attachments for drawing. `None` binds the default framebuffer.
    fn bind_framebuffer(&mut self, binding: Option<&FramebufferBinding>);

    /// Completeness of the currently bound framebuffer.
    fn framebuffer_status(&self) -> FramebufferStatus;

    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32);

    fn clear(&mut self, mask: ClearMask, color: [f32; 4], depth: f32);

    /// Resolve multisampled `source` into single-sampled `destination`.
    fn resolve(&mut self, source: TextureHandle, destination: TextureHandle);

    fn set_state(&mut self, state: RenderState);

    fn state(&self) -> RenderState;

    fn draw(&mut self, call: &DrawCall);

    /// Submit recorded work without waiting.
    fn submit(&mut self);

    /// Block until the device is idle.
    fn finish(&mut self);

    /// Drain errors reported since the last call.
    fn take_errors(&mut self) -> Vec<GraphicsError>;

    fn set_depth_func(&mut self, func: Option<DepthFunc>) {
        let mut state = self.state();
        state.depth_func = func;
        self.set_state(state);
    }

    fn set_depth_write(&mut self, enabled: bool) {
        let mut state = self.state();
        state.depth_write = enabled;
        self.set_state(state);
    }

    fn set_blend(&mut self, blend: Option<BlendMode>) {
        let mut state = self.state();
        state.blend = blend;
        self.set_state(state);
    }

    fn set_front_face(&mut self, winding: Winding) {
        let mut state = self.state();
        state.front_face = winding;
        self.set_state(state);
    }

    fn set_cull(&mut self, cull: CullFace) {
        let mut state = self.state();
        state.cull = cull;
        self.set_state(state);
    }
}

/// Completeness of `binding` given the descriptors of its textures.
pub fn validate_framebuffer<'a>(
    binding: &FramebufferBinding,
    limits: &GraphicsLimits,
    lookup: impl Fn(TextureHandle) -> Option<&'a TextureDesc>,
) -> FramebufferStatus {
    if binding.color.is_empty() && binding.depth.is_none() {
        return FramebufferStatus::MissingAttachment;
    }
    if binding.color.len() > limits.max_color_attachments as usize {
        return FramebufferStatus::Unsupported;
    }

    let mut extent: Option<(u32, u32, u32)> = None;
    let attachments = binding
        .color
        .iter()
        .map(|&tex| (tex, false))
        .chain(binding.depth.map(|tex| (tex, true)));

    for (texture, is_depth) in attachments {
        let Some(desc) = lookup(texture) else {
            return FramebufferStatus::IncompleteAttachment;
        };
        if desc.format.is_depth() != is_depth {
            return FramebufferStatus::IncompleteAttachment;
        }
        match extent {
            None => extent = Some((desc.width, desc.height, desc.samples)),
            Some((w, h, samples)) => {
                if samples != desc.samples {
                    return FramebufferStatus::IncompleteMultisample;
                }
                if (w, h) != (desc.width, desc.height) {
                    return FramebufferStatus::IncompleteAttachment;
                }
            }
        }
    }
    FramebufferStatus::Complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;
    use smallvec::smallvec;

    fn desc(format: TextureFormat, size: u32, samples: u32) -> TextureDesc {
        TextureDesc {
            label: String::new(),
            width: size,
            height: size,
            format,
            samples,
            sampled: true,
            filter: FilterMode::Linear,
            wrap: [WrapMode::ClampToEdge; 2],
        }
    }

    fn status(textures: &FxHashMap<TextureHandle, TextureDesc>, binding: &FramebufferBinding) -> FramebufferStatus {
        validate_framebuffer(binding, &GraphicsLimits::default(), |t| textures.get(&t))
    }

    #[test]
    fn test_validate_framebuffer_reasons() {
        let (c0, c1, ms, depth) = (
            TextureHandle::from_raw(1),
            TextureHandle::from_raw(2),
            TextureHandle::from_raw(3),
            TextureHandle::from_raw(4),
        );
        let textures: FxHashMap<_, _> = [
            (c0, desc(TextureFormat::Rgba8Unorm, 64, 1)),
            (c1, desc(TextureFormat::Rgba16Float, 32, 1)),
            (ms, desc(TextureFormat::Rgba8Unorm, 64, 4)),
            (depth, desc(TextureFormat::Depth24Plus, 64, 1)),
        ]
        .into_iter()
        .collect();

        let complete = FramebufferBinding { color: smallvec![c0], depth: Some(depth) };
        assert_eq!(status(&textures, &complete), FramebufferStatus::Complete);

        let empty = FramebufferBinding::default();
        assert_eq!(status(&textures, &empty), FramebufferStatus::MissingAttachment);

        let sizes = FramebufferBinding { color: smallvec![c0, c1], depth: None };
        assert_eq!(status(&textures, &sizes), FramebufferStatus::IncompleteAttachment);

        let samples = FramebufferBinding { color: smallvec![ms], depth: Some(depth) };
        assert_eq!(status(&textures, &samples), FramebufferStatus::IncompleteMultisample);

        let swapped = FramebufferBinding { color: smallvec![depth], depth: None };
        assert_eq!(status(&textures, &swapped), FramebufferStatus::IncompleteAttachment);
    }

    #[test]
    fn test_error_display() {
        let err = GraphicsError::InvalidFramebufferOperation("draw to incomplete target".into());
        assert_eq!(
            err.to_string(),
            "invalid framebuffer operation: draw to incomplete target"
        );
        assert_eq!(FramebufferStatus::Unknown(0x8cdd).to_string(), "unknown framebuffer error (0x8cdd)");
    }
}
