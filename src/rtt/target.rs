//! Render-target descriptors and records

use smallvec::SmallVec;

use super::antialiasing::AntiAliasing;
use super::backend::{FilterMode, FramebufferBinding, TextureFormat, TextureHandle, WrapMode};
use crate::core::PoolIndex;

/// Stable handle to a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetHandle(pub(crate) PoolIndex);

impl std::fmt::Display for TargetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "target#{}", self.0)
    }
}

/// Depth backing of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepthMode {
    #[default]
    None,
    /// Depth storage that cannot be sampled.
    Renderbuffer,
    /// Sampleable depth texture, shareable between targets.
    Texture,
}

/// Whether a texture-backed depth buffer may be shared automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepthSharing {
    /// Always allocate new depth storage.
    Exclusive,
    /// Reuse existing texture depth of identical size and sample count.
    #[default]
    Reuse,
}

/// One color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachmentDesc {
    pub format: TextureFormat,
    pub filter: FilterMode,
    pub wrap: [WrapMode; 2],
    pub anti_aliasing: AntiAliasing,
}

impl AttachmentDesc {
    #[must_use]
    pub fn new(format: TextureFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_filter(mut self, filter: FilterMode) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub const fn with_wrap(mut self, s: WrapMode, t: WrapMode) -> Self {
        self.wrap = [s, t];
        self
    }

    #[must_use]
    pub const fn with_anti_aliasing(mut self, anti_aliasing: AntiAliasing) -> Self {
        self.anti_aliasing = anti_aliasing;
        self
    }
}

/// Request for a new render target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub attachments: SmallVec<[AttachmentDesc; 4]>,
    pub depth: DepthMode,
    pub depth_format: TextureFormat,
    pub depth_sharing: DepthSharing,
}

impl TargetDesc {
    #[must_use]
    pub fn new(label: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            attachments: SmallVec::new(),
            depth: DepthMode::None,
            depth_format: TextureFormat::Depth24Plus,
            depth_sharing: DepthSharing::Reuse,
        }
    }

    #[must_use]
    pub fn attachment(mut self, attachment: AttachmentDesc) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Add `count` copies of `attachment`.
    #[must_use]
    pub fn attachments(mut self, count: usize, attachment: AttachmentDesc) -> Self {
        self.attachments.extend(std::iter::repeat_n(attachment, count));
        self
    }

    #[must_use]
    pub const fn depth(mut self, depth: DepthMode) -> Self {
        self.depth = depth;
        self
    }

    #[must_use]
    pub const fn depth_format(mut self, format: TextureFormat) -> Self {
        self.depth_format = format;
        self
    }

    #[must_use]
    pub const fn sharing(mut self, sharing: DepthSharing) -> Self {
        self.depth_sharing = sharing;
        self
    }

    /// Apply `anti_aliasing` to every attachment added so far.
    #[must_use]
    pub fn anti_aliasing(mut self, anti_aliasing: AntiAliasing) -> Self {
        for attachment in &mut self.attachments {
            attachment.anti_aliasing = anti_aliasing;
        }
        self
    }
}

/// Depth storage of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthAttachment {
    pub texture: TextureHandle,
    pub mode: DepthMode,
    /// Whether the storage was first allocated by another target.
    pub shared: bool,
}

/// A created render target.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub(crate) label: String,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) draw_width: u32,
    pub(crate) draw_height: u32,
    pub(crate) attachments: SmallVec<[TextureHandle; 4]>,
    pub(crate) multisample: SmallVec<[TextureHandle; 4]>,
    pub(crate) anti_aliasing: SmallVec<[AntiAliasing; 4]>,
    pub(crate) samples: u32,
    pub(crate) depth: Option<DepthAttachment>,
}

impl RenderTarget {
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Requested size.
    #[must_use]
    pub const fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Allocated size, larger than [`size`](Self::size) when supersampled.
    #[must_use]
    pub const fn draw_size(&self) -> (u32, u32) {
        (self.draw_width, self.draw_height)
    }

    /// Sampled textures, one per attachment.
    #[must_use]
    pub fn textures(&self) -> &[TextureHandle] {
        &self.attachments
    }

    #[must_use]
    pub fn texture(&self, attachment: usize) -> Option<TextureHandle> {
        self.attachments.get(attachment).copied()
    }

    /// Multisample storage resolved into [`textures`](Self::textures) at the
    /// end of a pass. Empty for directly sampled modes.
    #[must_use]
    pub fn multisample_textures(&self) -> &[TextureHandle] {
        &self.multisample
    }

    /// Effective antialiasing of the first attachment.
    #[must_use]
    pub fn anti_aliasing(&self) -> AntiAliasing {
        self.anti_aliasing.first().copied().unwrap_or_default()
    }

    #[must_use]
    pub fn attachment_anti_aliasing(&self, attachment: usize) -> Option<AntiAliasing> {
        self.anti_aliasing.get(attachment).copied()
    }

    /// Color samples of the draw storage (1 when single-sampled).
    #[must_use]
    pub const fn samples(&self) -> u32 {
        self.samples
    }

    #[must_use]
    pub const fn depth(&self) -> Option<DepthAttachment> {
        self.depth
    }

    #[must_use]
    pub fn requires_resolve(&self) -> bool {
        !self.multisample.is_empty()
    }

    /// Attachments bound while drawing into this target.
    #[must_use]
    pub fn draw_binding(&self) -> FramebufferBinding {
        let color = if self.multisample.is_empty() {
            self.attachments.clone()
        } else {
            self.multisample.clone()
        };
        FramebufferBinding {
            color,
            depth: self.depth.map(|d| d.texture),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_builder() {
        let desc = TargetDesc::new("g", 64, 32)
            .attachments(2, AttachmentDesc::new(TextureFormat::Rgba16Float))
            .attachment(AttachmentDesc::new(TextureFormat::R32Uint))
            .anti_aliasing(AntiAliasing::Msaa4)
            .depth(DepthMode::Texture)
            .sharing(DepthSharing::Exclusive);

        assert_eq!(desc.attachments.len(), 3);
        assert!(desc.attachments.iter().all(|a| a.anti_aliasing == AntiAliasing::Msaa4));
        assert_eq!(desc.attachments[2].format, TextureFormat::R32Uint);
        assert_eq!(desc.depth, DepthMode::Texture);
        assert_eq!(desc.depth_sharing, DepthSharing::Exclusive);
    }

    #[test]
    fn test_draw_binding_prefers_multisample_storage() {
        let mut target = RenderTarget {
            label: "t".into(),
            width: 8,
            height: 8,
            draw_width: 8,
            draw_height: 8,
            attachments: SmallVec::from_slice(&[TextureHandle::from_raw(1)]),
            multisample: SmallVec::new(),
            anti_aliasing: SmallVec::from_slice(&[AntiAliasing::None]),
            samples: 1,
            depth: None,
        };
        assert_eq!(target.draw_binding().color[0], TextureHandle::from_raw(1));

        target.multisample.push(TextureHandle::from_raw(2));
        assert!(target.requires_resolve());
        assert_eq!(target.draw_binding().color[0], TextureHandle::from_raw(2));
    }
}
