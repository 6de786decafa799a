//! Per-frame render targets of the inferred renderer
//!
//! - g-buffer: normal + Nuv (RGBA16F) with a sampleable depth texture. The
//!   alpha variant adds a DSF attachment.
//! - l-buffer: diffuse and specular light (RGBA8), no depth.
//! - scene buffer: material pass output at screen size. It reuses the opaque
//!   g-buffer depth when both have the same size.
//! - fxaa buffer: luma intermediate for the FXAA resolve.

use crate::compute::BufferHandle;
use crate::rtt::{
    AntiAliasing, AttachmentDesc, DepthMode, DepthSharing, FilterMode, GraphicsBackend, Rtt,
    TargetDesc, TargetHandle, TextureFormat,
};

use super::drawable::IrBuffers;

/// Render settings the frame buffers depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSettings {
    pub anti_aliasing: AntiAliasing,
    /// 0-4; the inferred buffers are (scale * 12.5 + 50)% of the screen
    pub inferred_scale: u32,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            anti_aliasing: AntiAliasing::None,
            inferred_scale: 4,
        }
    }
}

/// Size of the g- and l-buffers for a screen of `size`, rounded up to even.
#[must_use]
pub fn inferred_size(size: (u32, u32), scale: u32) -> (u32, u32) {
    let factor = (scale.min(4) as f32 * 12.5 + 50.0) / 100.0;
    let even = |v: u32| {
        let scaled = (v as f32 * factor) as u32;
        scaled + scaled % 2
    };
    (even(size.0), even(size.1))
}

/// The target set one view renders into.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffers {
    pub size: (u32, u32),
    pub render_size: (u32, u32),
    /// opaque, alpha
    pub g_buffer: [Option<TargetHandle>; 2],
    /// opaque, alpha
    pub l_buffer: [Option<TargetHandle>; 2],
    pub scene_buffer: TargetHandle,
    pub fxaa_buffer: TargetHandle,
    /// Whether the scene buffer draws against the g-buffer depth.
    pub scene_depth_shared: bool,
    /// Compute views of the g/l-buffers, see `Scene::share_with_compute`.
    pub interop: Vec<BufferHandle>,
}

impl FrameBuffers {
    /// Create every target. Partially created sets are deleted again.
    pub fn create<G: GraphicsBackend>(
        rtt: &mut Rtt<G>,
        size: (u32, u32),
        settings: FrameSettings,
        alpha: bool,
    ) -> Option<Self> {
        let mut created: Vec<TargetHandle> = Vec::new();
        let result = Self::build(rtt, size, settings, alpha, &mut created);
        if result.is_none() {
            log::error!("failed to create frame buffers of {}x{}", size.0, size.1);
            for handle in created {
                rtt.delete_target(handle);
            }
        }
        result
    }

    fn build<G: GraphicsBackend>(
        rtt: &mut Rtt<G>,
        size: (u32, u32),
        settings: FrameSettings,
        alpha: bool,
        created: &mut Vec<TargetHandle>,
    ) -> Option<Self> {
        let aa = settings.anti_aliasing;
        let render_size = inferred_size(size, settings.inferred_scale);
        let (rw, rh) = render_size;

        fn make<B: GraphicsBackend>(
            rtt: &mut Rtt<B>,
            created: &mut Vec<TargetHandle>,
            desc: TargetDesc,
        ) -> Option<TargetHandle> {
            let handle = rtt.create_target(&desc)?;
            created.push(handle);
            Some(handle)
        }

        let geometry = AttachmentDesc::new(TextureFormat::Rgba16Float)
            .with_filter(FilterMode::Point)
            .with_anti_aliasing(aa);
        let light = AttachmentDesc::new(TextureFormat::Rgba8Unorm)
            .with_filter(FilterMode::Point)
            .with_anti_aliasing(aa);

        // the alpha pass must not clear the opaque depth, so no auto-sharing
        let g0 = make(
            rtt,
            created,
            TargetDesc::new("g_buffer", rw, rh)
                .attachment(geometry)
                .depth(DepthMode::Texture)
                .sharing(DepthSharing::Exclusive),
        )?;
        let g1 = if alpha {
            Some(make(
                rtt,
                created,
                TargetDesc::new("g_buffer_alpha", rw, rh)
                    .attachments(2, geometry)
                    .depth(DepthMode::Texture)
                    .sharing(DepthSharing::Exclusive),
            )?)
        } else {
            None
        };

        let l0 = make(rtt, created, TargetDesc::new("l_buffer", rw, rh).attachments(2, light))?;
        let l1 = if alpha {
            Some(make(rtt, created, TargetDesc::new("l_buffer_alpha", rw, rh).attachments(2, light))?)
        } else {
            None
        };

        let scene_filter = if aa.scale() > 1.0 {
            FilterMode::Linear
        } else {
            FilterMode::Point
        };
        let scene_attachment = AttachmentDesc::new(TextureFormat::Rgba8Unorm)
            .with_filter(scene_filter)
            .with_anti_aliasing(aa);
        let scene_depth_shared = render_size == size;
        let scene_buffer = if scene_depth_shared {
            let desc = TargetDesc::new("scene_buffer", size.0, size.1)
                .attachment(scene_attachment)
                .depth(DepthMode::Texture);
            let handle = rtt.create_target_sharing_depth(&desc, g0)?;
            created.push(handle);
            handle
        } else {
            make(
                rtt,
                created,
                TargetDesc::new("scene_buffer", size.0, size.1)
                    .attachment(scene_attachment)
                    .depth(DepthMode::Renderbuffer),
            )?
        };

        let fxaa_buffer = make(
            rtt,
            created,
            TargetDesc::new("fxaa_buffer", size.0, size.1).attachment(
                AttachmentDesc::new(TextureFormat::Rgba8Unorm)
                    .with_filter(FilterMode::Linear)
                    .with_anti_aliasing(aa),
            ),
        )?;

        // sharing only happens if the draw sizes and sample counts match too
        let scene_depth_shared =
            scene_depth_shared && rtt.depth_buffer(scene_buffer) == rtt.depth_buffer(g0);

        log::debug!("g/l-buffer @{rw}x{rh}");
        log::debug!("scene-buffer @{}x{}", size.0, size.1);

        Some(Self {
            size,
            render_size,
            g_buffer: [Some(g0), g1],
            l_buffer: [Some(l0), l1],
            scene_buffer,
            fxaa_buffer,
            scene_depth_shared,
            interop: Vec::new(),
        })
    }

    /// Every target of the set.
    pub fn targets(&self) -> impl Iterator<Item = TargetHandle> + '_ {
        self.g_buffer
            .iter()
            .chain(self.l_buffer.iter())
            .flatten()
            .copied()
            .chain([self.scene_buffer, self.fxaa_buffer])
    }

    /// Delete every target. Interop buffers must be released by the caller.
    pub fn delete<G: GraphicsBackend>(&self, rtt: &mut Rtt<G>) {
        // the scene buffer may hold a reference to the g-buffer depth
        for handle in self.targets() {
            rtt.delete_target(handle);
        }
    }

    /// Textures handed to drawables and the light pass.
    #[must_use]
    pub fn ir_buffers<G: GraphicsBackend>(&self, rtt: &Rtt<G>) -> IrBuffers {
        let texture = |target: Option<TargetHandle>, i: usize| target.and_then(|t| rtt.texture(t, i));
        let depth = |target: Option<TargetHandle>| target.and_then(|t| rtt.depth_buffer(t));
        IrBuffers {
            normal_nuv: [texture(self.g_buffer[0], 0), texture(self.g_buffer[1], 0)],
            depth: [depth(self.g_buffer[0]), depth(self.g_buffer[1])],
            dsf: texture(self.g_buffer[1], 1),
            diffuse: [texture(self.l_buffer[0], 0), texture(self.l_buffer[1], 0)],
            specular: [texture(self.l_buffer[0], 1), texture(self.l_buffer[1], 1)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt::HeadlessGraphics;

    #[test]
    fn test_inferred_size() {
        assert_eq!(inferred_size((1280, 720), 4), (1280, 720));
        assert_eq!(inferred_size((1280, 720), 0), (640, 360));
        // 62.5% of 1001 = 625.6 -> 625 -> 626
        assert_eq!(inferred_size((1001, 800), 1), (626, 500));
    }

    #[test]
    fn test_full_size_shares_depth() {
        let mut rtt = Rtt::new(HeadlessGraphics::new(), 320, 240);
        let frame = FrameBuffers::create(&mut rtt, (320, 240), FrameSettings::default(), true).unwrap();

        assert!(frame.scene_depth_shared);
        let g0 = frame.g_buffer[0].unwrap();
        let g1 = frame.g_buffer[1].unwrap();
        assert_eq!(rtt.depth_buffer(frame.scene_buffer), rtt.depth_buffer(g0));
        assert_ne!(rtt.depth_buffer(g1), rtt.depth_buffer(g0));
        assert!(rtt.depth_buffer(frame.l_buffer[0].unwrap()).is_none());
        assert_eq!(rtt.target(g1).unwrap().textures().len(), 2);

        let ir = frame.ir_buffers(&rtt);
        assert!(ir.dsf.is_some());
        assert!(ir.specular[1].is_some());

        frame.delete(&mut rtt);
        assert_eq!(rtt.target_count(), 0);
        assert_eq!(rtt.backend().live_textures(), 0);
    }

    #[test]
    fn test_inferred_scale_gets_own_depth() {
        let mut rtt = Rtt::new(HeadlessGraphics::new(), 320, 240);
        let settings = FrameSettings {
            inferred_scale: 2,
            ..FrameSettings::default()
        };
        let frame = FrameBuffers::create(&mut rtt, (320, 240), settings, false).unwrap();

        assert_eq!(frame.render_size, (240, 180));
        assert!(!frame.scene_depth_shared);
        assert!(frame.g_buffer[1].is_none());
        let depth = rtt.target(frame.scene_buffer).unwrap().depth().unwrap();
        assert_eq!(depth.mode, DepthMode::Renderbuffer);
    }

    #[test]
    fn test_failed_creation_cleans_up() {
        let limits = crate::rtt::GraphicsLimits {
            max_texture_size: 256,
            ..crate::rtt::GraphicsLimits::default()
        };
        let mut rtt = Rtt::new(HeadlessGraphics::with_limits(limits), 320, 240);
        let settings = FrameSettings {
            inferred_scale: 0,
            ..FrameSettings::default()
        };
        // the half-size g/l-buffers fit, the scene buffer does not
        assert!(FrameBuffers::create(&mut rtt, (320, 240), settings, true).is_none());
        assert_eq!(rtt.target_count(), 0);
        assert_eq!(rtt.backend().live_textures(), 0);
    }
}
