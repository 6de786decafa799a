//! Render-target registry
//!
//! Creates off-screen targets, degrades antialiasing to what the device can
//! allocate, shares depth storage between targets and brackets passes with
//! binding, viewport and multisample resolve.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::antialiasing::{resolution_for_scale, AntiAliasing};
use super::backend::{
    ClearMask, FilterMode, FramebufferStatus, GraphicsBackend, GraphicsLimits, TextureDesc,
    TextureFormat, TextureHandle,
};
use super::target::{
    AttachmentDesc, DepthAttachment, DepthMode, DepthSharing, RenderTarget, TargetDesc,
    TargetHandle,
};
use crate::core::Pool;

/// Reference-counted depth storage.
#[derive(Debug, Clone, Copy)]
struct DepthRecord {
    width: u32,
    height: u32,
    samples: u32,
    mode: DepthMode,
    format: TextureFormat,
    refs: u32,
}

/// Render-target registry.
pub struct Rtt<G: GraphicsBackend> {
    backend: G,
    targets: Pool<RenderTarget>,
    depth: FxHashMap<TextureHandle, DepthRecord>,
    stack: Vec<TargetHandle>,
    screen: (u32, u32),
    clear_color: [f32; 4],
    fallback_notices: u32,
}

impl<G: GraphicsBackend> Rtt<G> {
    pub fn new(backend: G, screen_width: u32, screen_height: u32) -> Self {
        let limits = backend.limits();
        log::info!(
            "render targets: max texture size {}, max samples {}, coverage sampling {}",
            limits.max_texture_size,
            limits.max_samples,
            if limits.coverage_samples { "available" } else { "unavailable" }
        );
        Self {
            backend,
            targets: Pool::new(),
            depth: FxHashMap::default(),
            stack: Vec::new(),
            screen: (screen_width, screen_height),
            clear_color: [0.0, 0.0, 0.0, 0.0],
            fallback_notices: 0,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &G {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut G {
        &mut self.backend
    }

    /// Create a render target, allocating or reusing depth storage per `desc`.
    ///
    /// Returns `None` (after logging) if the target cannot be created.
    pub fn create_target(&mut self, desc: &TargetDesc) -> Option<TargetHandle> {
        self.build_target(desc, None)
    }

    /// Create a render target whose depth storage is the depth of `source`.
    ///
    /// If `source` has no compatible depth, the new target gets its own.
    pub fn create_target_sharing_depth(
        &mut self,
        desc: &TargetDesc,
        source: TargetHandle,
    ) -> Option<TargetHandle> {
        self.build_target(desc, Some(source))
    }

    fn build_target(
        &mut self,
        desc: &TargetDesc,
        depth_source: Option<TargetHandle>,
    ) -> Option<TargetHandle> {
        if desc.width == 0 || desc.height == 0 {
            log::error!("render target \"{}\": zero size", desc.label);
            return None;
        }
        if desc.attachments.is_empty() && desc.depth == DepthMode::None {
            log::error!("render target \"{}\": no attachments", desc.label);
            return None;
        }

        let limits = self.backend.limits();
        let size = (desc.width, desc.height);
        let modes: SmallVec<[AntiAliasing; 4]> = desc
            .attachments
            .iter()
            .map(|a| self.effective_anti_aliasing(&desc.label, a.anti_aliasing, size, &limits))
            .collect();

        let scale = modes.iter().map(|aa| aa.scale()).fold(1.0_f32, f32::max);
        let (draw_width, draw_height) = resolution_for_scale(scale, size);

        let primary = modes.first().copied().unwrap_or_default();
        let samples = if primary.requires_resolve() {
            primary.samples()
        } else {
            1
        };

        let mut created: Vec<TextureHandle> = Vec::new();
        let mut attachments = SmallVec::new();
        let mut multisample = SmallVec::new();

        for (idx, attachment) in desc.attachments.iter().enumerate() {
            let texture = self.allocate(
                &mut created,
                &color_desc(desc, idx, attachment, (draw_width, draw_height), 1),
            )?;
            attachments.push(texture);

            if samples > 1 {
                let storage = self.allocate(
                    &mut created,
                    &color_desc(desc, idx, attachment, (draw_width, draw_height), samples),
                )?;
                multisample.push(storage);
            }
        }

        let depth = match desc.depth {
            DepthMode::None => None,
            mode => {
                let shared = depth_source
                    .and_then(|source| self.depth_of(source, (draw_width, draw_height), samples, mode))
                    .or_else(|| {
                        (depth_source.is_none()
                            && mode == DepthMode::Texture
                            && desc.depth_sharing == DepthSharing::Reuse)
                            .then(|| self.find_depth((draw_width, draw_height), samples, desc.depth_format))
                            .flatten()
                    });

                match shared {
                    Some(texture) => {
                        if let Some(record) = self.depth.get_mut(&texture) {
                            record.refs += 1;
                        }
                        log::debug!(
                            "render target \"{}\" shares depth texture {}",
                            desc.label,
                            texture.raw()
                        );
                        Some(DepthAttachment { texture, mode, shared: true })
                    }
                    None => {
                        if depth_source.is_some() {
                            log::warn!(
                                "render target \"{}\": source depth is not compatible, allocating new depth",
                                desc.label
                            );
                        }
                        let depth_desc = TextureDesc {
                            label: format!("{} depth", desc.label),
                            width: draw_width,
                            height: draw_height,
                            format: desc.depth_format,
                            samples,
                            sampled: mode == DepthMode::Texture,
                            filter: FilterMode::Point,
                            wrap: Default::default(),
                        };
                        let texture = self.allocate(&mut created, &depth_desc)?;
                        self.depth.insert(
                            texture,
                            DepthRecord {
                                width: draw_width,
                                height: draw_height,
                                samples,
                                mode,
                                format: desc.depth_format,
                                refs: 1,
                            },
                        );
                        Some(DepthAttachment { texture, mode, shared: false })
                    }
                }
            }
        };

        let target = RenderTarget {
            label: desc.label.clone(),
            width: desc.width,
            height: desc.height,
            draw_width,
            draw_height,
            attachments,
            multisample,
            anti_aliasing: modes,
            samples,
            depth,
        };

        let status = self.validate(&target);
        if !status.is_complete() {
            log::error!("render target \"{}\": {status}", desc.label);
        }

        log::debug!(
            "created render target \"{}\" {}x{} (draw {}x{}, {}, {} attachments)",
            desc.label,
            desc.width,
            desc.height,
            draw_width,
            draw_height,
            target.anti_aliasing(),
            target.attachments.len()
        );
        Some(TargetHandle(self.targets.insert(target)))
    }

    /// Allocate a texture, freeing everything in `created` on failure.
    fn allocate(&mut self, created: &mut Vec<TextureHandle>, desc: &TextureDesc) -> Option<TextureHandle> {
        match self.backend.create_texture(desc) {
            Ok(texture) => {
                created.push(texture);
                Some(texture)
            }
            Err(err) => {
                log::error!("failed to allocate \"{}\": {err}", desc.label);
                for texture in created.drain(..) {
                    self.backend.destroy_texture(texture);
                }
                None
            }
        }
    }

    /// Antialiasing `requested` reduced to what the device can allocate at `size`.
    fn effective_anti_aliasing(
        &mut self,
        label: &str,
        requested: AntiAliasing,
        size: (u32, u32),
        limits: &GraphicsLimits,
    ) -> AntiAliasing {
        let fits = |aa: AntiAliasing| {
            let (w, h) = resolution_for_scale(aa.scale(), size);
            w <= limits.max_texture_size && h <= limits.max_texture_size
        };

        let mut mode = requested;
        let mut fell_back = false;
        while mode.is_supersampled() && !fits(mode) {
            fell_back = true;
            match mode.halved() {
                Some(smaller) => {
                    log::warn!(
                        "render target \"{label}\": {} exceeds max texture size {}, falling back to {}",
                        mode.label(),
                        limits.max_texture_size,
                        smaller.label()
                    );
                    mode = smaller;
                }
                None => {
                    let degraded = mode.without_supersampling();
                    log::error!(
                        "render target \"{label}\": no supersample factor fits max texture size {}, using {}",
                        limits.max_texture_size,
                        degraded.label()
                    );
                    mode = degraded;
                }
            }
        }

        if mode.is_coverage_sampled() && !limits.coverage_samples {
            let msaa = mode.without_coverage();
            log::warn!(
                "render target \"{label}\": coverage sampling unsupported, using {}",
                msaa.label()
            );
            mode = msaa;
            fell_back = true;
        }

        if mode.samples() > limits.max_samples.max(1) {
            let clamped = AntiAliasing::msaa(limits.max_samples);
            log::warn!(
                "render target \"{label}\": {} exceeds {} samples, using {}",
                mode.label(),
                limits.max_samples,
                clamped.label()
            );
            mode = clamped;
            fell_back = true;
        }

        if fell_back {
            self.fallback_notices += 1;
        }
        mode
    }

    fn depth_of(
        &self,
        source: TargetHandle,
        size: (u32, u32),
        samples: u32,
        mode: DepthMode,
    ) -> Option<TextureHandle> {
        let depth = self.targets.get(source.0)?.depth?;
        let record = self.depth.get(&depth.texture)?;
        let compatible =
            (record.width, record.height) == size && record.samples == samples && record.mode == mode;
        compatible.then_some(depth.texture)
    }

    fn find_depth(&self, size: (u32, u32), samples: u32, format: TextureFormat) -> Option<TextureHandle> {
        self.depth
            .iter()
            .filter(|(_, r)| {
                r.mode == DepthMode::Texture
                    && (r.width, r.height) == size
                    && r.samples == samples
                    && r.format == format
            })
            .map(|(&texture, _)| texture)
            .min()
    }

    fn validate(&mut self, target: &RenderTarget) -> FramebufferStatus {
        self.backend.bind_framebuffer(Some(&target.draw_binding()));
        let status = self.backend.framebuffer_status();
        self.rebind_current();
        status
    }

    fn rebind_current(&mut self) {
        match self.stack.last().and_then(|h| self.targets.get(h.0)) {
            Some(current) => {
                let binding = current.draw_binding();
                self.backend.bind_framebuffer(Some(&binding));
            }
            None => self.backend.bind_framebuffer(None),
        }
    }

    /// Destroy a target and its textures. Shared depth is freed with its last holder.
    ///
    /// Refused while the target is being rendered to.
    pub fn delete_target(&mut self, handle: TargetHandle) -> bool {
        if self.stack.contains(&handle) {
            log::error!("cannot delete {handle}: a pass into it is active");
            return false;
        }
        let Some(target) = self.targets.remove(handle.0) else {
            log::warn!("delete_target: unknown {handle}");
            return false;
        };

        for &texture in target.attachments.iter().chain(target.multisample.iter()) {
            self.backend.destroy_texture(texture);
        }
        if let Some(depth) = target.depth {
            self.release_depth(depth.texture);
        }
        log::debug!("deleted render target \"{}\"", target.label);
        true
    }

    fn release_depth(&mut self, texture: TextureHandle) {
        let Some(record) = self.depth.get_mut(&texture) else {
            return;
        };
        record.refs = record.refs.saturating_sub(1);
        if record.refs == 0 {
            self.depth.remove(&texture);
            self.backend.destroy_texture(texture);
        }
    }

    /// Bind `handle` for drawing and set the viewport to its draw size.
    pub fn begin_pass(&mut self, handle: TargetHandle) -> bool {
        let Some(target) = self.targets.get(handle.0) else {
            log::error!("begin_pass: unknown {handle}");
            return false;
        };
        let binding = target.draw_binding();
        let (width, height) = target.draw_size();

        self.backend.bind_framebuffer(Some(&binding));
        let status = self.backend.framebuffer_status();
        if !status.is_complete() {
            log::error!("render target \"{}\": {status}", target.label);
        }
        self.backend.set_viewport(0, 0, width, height);
        self.stack.push(handle);
        true
    }

    /// Resolve the current target if needed, then restore the previous target
    /// (or the default framebuffer) and its viewport.
    pub fn end_pass(&mut self) -> bool {
        let Some(handle) = self.stack.pop() else {
            log::error!("end_pass without begin_pass");
            return false;
        };

        if let Some(target) = self.targets.get(handle.0) {
            for (&source, &destination) in target.multisample.iter().zip(target.attachments.iter()) {
                self.backend.resolve(source, destination);
            }
        }

        self.rebind_current();
        let (width, height) = self
            .current_target()
            .and_then(|h| self.targets.get(h.0))
            .map_or(self.screen, RenderTarget::draw_size);
        self.backend.set_viewport(0, 0, width, height);
        true
    }

    #[must_use]
    pub fn current_target(&self) -> Option<TargetHandle> {
        self.stack.last().copied()
    }

    /// Clear the bound target. Depth is only cleared if the target has depth.
    pub fn clear(&mut self, mask: ClearMask) {
        let mut mask = mask;
        let has_depth = match self.current_target().and_then(|h| self.targets.get(h.0)) {
            Some(target) => target.depth.is_some(),
            None => true,
        };
        if !has_depth {
            mask.remove(ClearMask::DEPTH | ClearMask::STENCIL);
        }
        if !mask.is_empty() {
            self.backend.clear(mask, self.clear_color, 1.0);
        }
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Completeness of `handle`'s attachments.
    pub fn check_target(&mut self, handle: TargetHandle) -> FramebufferStatus {
        let Some(target) = self.targets.get(handle.0).cloned() else {
            return FramebufferStatus::MissingAttachment;
        };
        let status = self.validate(&target);
        if !status.is_complete() {
            log::error!("render target \"{}\": {status}", target.label);
        }
        status
    }

    #[must_use]
    pub fn target(&self, handle: TargetHandle) -> Option<&RenderTarget> {
        self.targets.get(handle.0)
    }

    /// Depth storage of `handle`. Equal for targets that share depth.
    #[must_use]
    pub fn depth_buffer(&self, handle: TargetHandle) -> Option<TextureHandle> {
        self.targets.get(handle.0)?.depth.map(|d| d.texture)
    }

    #[must_use]
    pub fn texture(&self, handle: TargetHandle, attachment: usize) -> Option<TextureHandle> {
        self.targets.get(handle.0)?.texture(attachment)
    }

    pub fn set_screen_size(&mut self, width: u32, height: u32) {
        self.screen = (width, height);
        if self.stack.is_empty() {
            self.backend.set_viewport(0, 0, width, height);
        }
    }

    #[must_use]
    pub const fn screen_size(&self) -> (u32, u32) {
        self.screen
    }

    /// Targets whose antialiasing had to be reduced.
    #[must_use]
    pub const fn fallback_notices(&self) -> u32 {
        self.fallback_notices
    }

    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

impl<G: GraphicsBackend> Drop for Rtt<G> {
    fn drop(&mut self) {
        self.stack.clear();
        for index in self.targets.indices() {
            self.delete_target(TargetHandle(index));
        }
    }
}

fn color_desc(
    desc: &TargetDesc,
    idx: usize,
    attachment: &AttachmentDesc,
    (width, height): (u32, u32),
    samples: u32,
) -> TextureDesc {
    let kind = if samples > 1 { "multisample" } else { "color" };
    TextureDesc {
        label: format!("{} {kind} {idx}", desc.label),
        width,
        height,
        format: attachment.format,
        samples,
        sampled: samples == 1,
        filter: attachment.filter,
        wrap: attachment.wrap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt::headless::{GraphicsCall, HeadlessGraphics};

    fn rtt_with(limits: GraphicsLimits) -> Rtt<HeadlessGraphics> {
        Rtt::new(HeadlessGraphics::with_limits(limits), 640, 480)
    }

    fn opaque(label: &str, width: u32, height: u32) -> TargetDesc {
        TargetDesc::new(label, width, height)
            .attachment(AttachmentDesc::new(TextureFormat::Rgba8Unorm))
            .depth(DepthMode::Texture)
    }

    #[test]
    fn test_identical_targets_share_depth() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let a = rtt.create_target(&opaque("a", 640, 480)).unwrap();
        let b = rtt.create_target(&opaque("b", 640, 480)).unwrap();

        assert_eq!(rtt.depth_buffer(a), rtt.depth_buffer(b));
        assert!(rtt.target(b).unwrap().depth().unwrap().shared);
        // 2 color + 1 depth
        assert_eq!(rtt.backend().live_textures(), 3);
    }

    #[test]
    fn test_deleting_sharer_keeps_owner_depth() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let a = rtt.create_target(&opaque("a", 64, 64)).unwrap();
        let b = rtt.create_target(&opaque("b", 64, 64)).unwrap();
        let depth = rtt.depth_buffer(a).unwrap();

        assert!(rtt.delete_target(b));
        assert!(rtt.backend().texture(depth).is_some());
        assert!(rtt.backend_mut().take_errors().is_empty());

        assert!(rtt.delete_target(a));
        assert!(rtt.backend().texture(depth).is_none());
        assert_eq!(rtt.backend().live_textures(), 0);
    }

    #[test]
    fn test_exclusive_and_mismatched_depth_allocate() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let a = rtt.create_target(&opaque("a", 64, 64)).unwrap();
        let b = rtt
            .create_target(&opaque("b", 64, 64).sharing(DepthSharing::Exclusive))
            .unwrap();
        let c = rtt.create_target(&opaque("c", 32, 64)).unwrap();
        let d = rtt
            .create_target(&opaque("d", 64, 64).depth(DepthMode::Renderbuffer))
            .unwrap();

        assert_ne!(rtt.depth_buffer(a), rtt.depth_buffer(b));
        assert_ne!(rtt.depth_buffer(a), rtt.depth_buffer(c));
        assert_ne!(rtt.depth_buffer(a), rtt.depth_buffer(d));
    }

    #[test]
    fn test_explicit_depth_sharing() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let a = rtt
            .create_target(&opaque("g", 64, 64).sharing(DepthSharing::Exclusive))
            .unwrap();
        let renderbuffer = opaque("scene", 64, 64).depth(DepthMode::Renderbuffer);
        let b = rtt.create_target_sharing_depth(&renderbuffer, a).unwrap();
        assert_ne!(rtt.depth_buffer(a), rtt.depth_buffer(b));

        let c = rtt.create_target_sharing_depth(&opaque("scene", 64, 64), a).unwrap();
        assert_eq!(rtt.depth_buffer(a), rtt.depth_buffer(c));
    }

    #[test]
    fn test_supersample_falls_back_to_2x() {
        let mut rtt = rtt_with(GraphicsLimits {
            max_texture_size: 2048,
            ..GraphicsLimits::default()
        });
        let desc = opaque("ssaa", 640, 480).anti_aliasing(AntiAliasing::Ssaa4);
        let target = rtt.create_target(&desc).unwrap();
        let target = rtt.target(target).unwrap();

        assert_eq!(target.anti_aliasing(), AntiAliasing::Ssaa2);
        assert_eq!(target.draw_size(), (1280, 960));
        assert_eq!(target.size(), (640, 480));
        assert_eq!(rtt.fallback_notices(), 1);
    }

    #[test]
    fn test_supersample_degrades_to_none_or_fxaa() {
        let mut rtt = rtt_with(GraphicsLimits {
            max_texture_size: 1000,
            ..GraphicsLimits::default()
        });
        let plain = rtt
            .create_target(&opaque("a", 640, 480).anti_aliasing(AntiAliasing::Ssaa4))
            .unwrap();
        let fxaa = rtt
            .create_target(&opaque("b", 800, 480).anti_aliasing(AntiAliasing::Ssaa4_3Fxaa))
            .unwrap();

        assert_eq!(rtt.target(plain).unwrap().anti_aliasing(), AntiAliasing::None);
        assert_eq!(rtt.target(plain).unwrap().draw_size(), (640, 480));
        assert_eq!(rtt.target(fxaa).unwrap().anti_aliasing(), AntiAliasing::Fxaa);
        assert_eq!(rtt.fallback_notices(), 2);
    }

    #[test]
    fn test_fractional_supersample_size() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let handle = rtt
            .create_target(&opaque("s", 640, 480).anti_aliasing(AntiAliasing::Ssaa4_3Fxaa))
            .unwrap();
        let target = rtt.target(handle).unwrap();
        assert_eq!(target.draw_size(), (854, 640));
        assert!(target.multisample_textures().is_empty());
    }

    #[test]
    fn test_msaa_allocates_resolve_storage() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let desc = TargetDesc::new("msaa", 128, 128)
            .attachments(2, AttachmentDesc::new(TextureFormat::Rgba16Float))
            .anti_aliasing(AntiAliasing::Msaa4)
            .depth(DepthMode::Renderbuffer);
        let handle = rtt.create_target(&desc).unwrap();
        let target = rtt.target(handle).unwrap().clone();

        assert_eq!(target.samples(), 4);
        assert_eq!(target.multisample_textures().len(), 2);
        let depth = target.depth().unwrap().texture;
        assert_eq!(rtt.backend().texture(depth).unwrap().samples, 4);

        rtt.backend_mut().clear_calls();
        assert!(rtt.begin_pass(handle));
        assert!(rtt.end_pass());

        let resolves: Vec<_> = rtt
            .backend()
            .calls()
            .iter()
            .filter_map(|c| match c {
                GraphicsCall::Resolve { source, destination } => Some((*source, *destination)),
                _ => None,
            })
            .collect();
        assert_eq!(
            resolves,
            vec![
                (target.multisample_textures()[0], target.textures()[0]),
                (target.multisample_textures()[1], target.textures()[1]),
            ]
        );
        assert!(rtt.backend_mut().take_errors().is_empty());
    }

    #[test]
    fn test_csaa_without_coverage_support_uses_msaa() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let handle = rtt
            .create_target(&opaque("c", 64, 64).anti_aliasing(AntiAliasing::Csaa16Q))
            .unwrap();
        assert_eq!(rtt.target(handle).unwrap().anti_aliasing(), AntiAliasing::Msaa8);

        let mut rtt = rtt_with(GraphicsLimits {
            coverage_samples: true,
            ..GraphicsLimits::default()
        });
        let handle = rtt
            .create_target(&opaque("c", 64, 64).anti_aliasing(AntiAliasing::Csaa16Q))
            .unwrap();
        assert_eq!(rtt.target(handle).unwrap().anti_aliasing(), AntiAliasing::Csaa16Q);
        assert_eq!(rtt.target(handle).unwrap().samples(), 8);
    }

    #[test]
    fn test_sample_count_clamped_to_device() {
        let mut rtt = rtt_with(GraphicsLimits {
            max_samples: 4,
            ..GraphicsLimits::default()
        });
        let handle = rtt
            .create_target(&opaque("m", 64, 64).anti_aliasing(AntiAliasing::Msaa16))
            .unwrap();
        assert_eq!(rtt.target(handle).unwrap().samples(), 4);
        assert_eq!(rtt.fallback_notices(), 1);
    }

    #[test]
    fn test_nested_passes_restore_previous_target() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let outer = rtt.create_target(&opaque("outer", 320, 240)).unwrap();
        let inner = rtt
            .create_target(&opaque("inner", 64, 64).anti_aliasing(AntiAliasing::Ssaa2))
            .unwrap();

        rtt.begin_pass(outer);
        rtt.begin_pass(inner);
        assert_eq!(rtt.current_target(), Some(inner));
        assert_eq!(rtt.backend().viewport(), (0, 0, 128, 128));

        rtt.end_pass();
        assert_eq!(rtt.current_target(), Some(outer));
        assert_eq!(rtt.backend().viewport(), (0, 0, 320, 240));
        let outer_color = rtt.texture(outer, 0).unwrap();
        assert_eq!(rtt.backend().bound().unwrap().color[0], outer_color);

        rtt.end_pass();
        assert_eq!(rtt.current_target(), None);
        assert!(rtt.backend().bound().is_none());
        assert_eq!(rtt.backend().viewport(), (0, 0, 640, 480));
        assert!(!rtt.end_pass());
    }

    #[test]
    fn test_clear_skips_missing_depth() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let color_only = rtt
            .create_target(
                &TargetDesc::new("c", 16, 16).attachment(AttachmentDesc::new(TextureFormat::Rgba8Unorm)),
            )
            .unwrap();

        rtt.begin_pass(color_only);
        rtt.backend_mut().clear_calls();
        rtt.clear(ClearMask::COLOR | ClearMask::DEPTH);
        rtt.end_pass();

        let GraphicsCall::Clear { mask, .. } = rtt.backend().calls()[0] else {
            panic!("expected a clear");
        };
        assert_eq!(mask, ClearMask::COLOR);
    }

    #[test]
    fn test_delete_active_target_refused() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let handle = rtt.create_target(&opaque("a", 16, 16)).unwrap();
        rtt.begin_pass(handle);
        assert!(!rtt.delete_target(handle));
        rtt.end_pass();
        assert!(rtt.delete_target(handle));
        assert!(!rtt.delete_target(handle));
        assert_eq!(rtt.target_count(), 0);
    }

    #[test]
    fn test_oversized_target_fails() {
        let mut rtt = rtt_with(GraphicsLimits {
            max_texture_size: 256,
            ..GraphicsLimits::default()
        });
        assert!(rtt.create_target(&opaque("big", 512, 64)).is_none());
        assert_eq!(rtt.backend().live_textures(), 0);
        assert_eq!(rtt.target_count(), 0);
    }

    #[test]
    fn test_check_target_reports_status() {
        let mut rtt = rtt_with(GraphicsLimits::default());
        let handle = rtt.create_target(&opaque("a", 16, 16)).unwrap();
        assert_eq!(rtt.check_target(handle), FramebufferStatus::Complete);
        rtt.delete_target(handle);
        assert_eq!(rtt.check_target(handle), FramebufferStatus::MissingAttachment);
    }
}
