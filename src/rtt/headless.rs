//! Recording graphics backend
//!
//! Keeps texture descriptors and render state in memory and records every
//! call, so pass sequencing can be inspected without a GPU.

use rustc_hash::FxHashMap;

use super::backend::{
    validate_framebuffer, ClearMask, FramebufferBinding, FramebufferStatus, GraphicsBackend,
    GraphicsError, GraphicsLimits, RenderState, TextureDesc, TextureHandle,
};
use crate::scene::DrawCall;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphicsCall {
    Bind(Option<FramebufferBinding>),
    Viewport { width: u32, height: u32 },
    Clear { mask: ClearMask, target: Option<TextureHandle> },
    Resolve { source: TextureHandle, destination: TextureHandle },
    Draw(RecordedDraw),
    Submit,
    Finish,
}

/// A draw together with the state it was issued under.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDraw {
    pub call: DrawCall,
    pub state: RenderState,
    /// First attachment of the bound framebuffer, `None` for the default one.
    pub target: Option<TextureHandle>,
}

#[derive(Debug, Default)]
pub struct HeadlessGraphics {
    limits: GraphicsLimits,
    textures: FxHashMap<TextureHandle, TextureDesc>,
    next_texture: u64,
    created: u64,
    bound: Option<FramebufferBinding>,
    state: RenderState,
    viewport: (u32, u32, u32, u32),
    calls: Vec<GraphicsCall>,
    errors: Vec<GraphicsError>,
}

impl HeadlessGraphics {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(GraphicsLimits::default())
    }

    #[must_use]
    pub fn with_limits(limits: GraphicsLimits) -> Self {
        Self {
            limits,
            next_texture: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn texture(&self, texture: TextureHandle) -> Option<&TextureDesc> {
        self.textures.get(&texture)
    }

    /// Textures currently allocated.
    #[must_use]
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Textures allocated since creation, including destroyed ones.
    #[must_use]
    pub const fn created_textures(&self) -> u64 {
        self.created
    }

    #[must_use]
    pub fn calls(&self) -> &[GraphicsCall] {
        &self.calls
    }

    pub fn draws(&self) -> impl Iterator<Item = &RecordedDraw> {
        self.calls.iter().filter_map(|call| match call {
            GraphicsCall::Draw(draw) => Some(draw),
            _ => None,
        })
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    #[must_use]
    pub fn bound(&self) -> Option<&FramebufferBinding> {
        self.bound.as_ref()
    }

    #[must_use]
    pub const fn viewport(&self) -> (u32, u32, u32, u32) {
        self.viewport
    }

    /// Queue an error for the next [`take_errors`](GraphicsBackend::take_errors).
    pub fn inject_error(&mut self, error: GraphicsError) {
        self.errors.push(error);
    }

    fn bound_target(&self) -> Option<TextureHandle> {
        self.bound
            .as_ref()
            .and_then(|b| b.color.first().copied().or(b.depth))
    }
}

impl GraphicsBackend for HeadlessGraphics {
    fn limits(&self) -> GraphicsLimits {
        self.limits
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle, GraphicsError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GraphicsError::InvalidValue(format!(
                "texture \"{}\" has zero size",
                desc.label
            )));
        }
        if desc.width > self.limits.max_texture_size || desc.height > self.limits.max_texture_size
        {
            return Err(GraphicsError::InvalidValue(format!(
                "texture \"{}\" of {}x{} exceeds {}",
                desc.label, desc.width, desc.height, self.limits.max_texture_size
            )));
        }
        if desc.samples > self.limits.max_samples.max(1) {
            return Err(GraphicsError::InvalidValue(format!(
                "{} samples exceed {}",
                desc.samples, self.limits.max_samples
            )));
        }

        let handle = TextureHandle::from_raw(self.next_texture);
        self.next_texture += 1;
        self.created += 1;
        self.textures.insert(handle, desc.clone());
        Ok(handle)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture).is_none() {
            self.errors.push(GraphicsError::InvalidValue(format!(
                "destroying unknown texture {}",
                texture.raw()
            )));
        }
    }

    fn bind_framebuffer(&mut self, binding: Option<&FramebufferBinding>) {
        self.bound = binding.cloned();
        self.calls.push(GraphicsCall::Bind(self.bound.clone()));
    }

    fn framebuffer_status(&self) -> FramebufferStatus {
        match &self.bound {
            None => FramebufferStatus::Complete,
            Some(binding) => validate_framebuffer(binding, &self.limits, |t| self.textures.get(&t)),
        }
    }

    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.viewport = (x, y, width, height);
        self.calls.push(GraphicsCall::Viewport { width, height });
    }

    fn clear(&mut self, mask: ClearMask, _color: [f32; 4], _depth: f32) {
        let target = self.bound_target();
        self.calls.push(GraphicsCall::Clear { mask, target });
    }

    fn resolve(&mut self, source: TextureHandle, destination: TextureHandle) {
        let samples = |t: TextureHandle| self.textures.get(&t).map(|d| d.samples);
        match (samples(source), samples(destination)) {
            (Some(s), Some(1)) if s > 1 => {}
            _ => self.errors.push(GraphicsError::InvalidOperation(format!(
                "cannot resolve texture {} into {}",
                source.raw(),
                destination.raw()
            ))),
        }
        self.calls.push(GraphicsCall::Resolve { source, destination });
    }

    fn set_state(&mut self, state: RenderState) {
        self.state = state;
    }

    fn state(&self) -> RenderState {
        self.state
    }

    fn draw(&mut self, call: &DrawCall) {
        if !self.framebuffer_status().is_complete() {
            self.errors.push(GraphicsError::InvalidFramebufferOperation(format!(
                "draw with \"{}\" into an incomplete framebuffer",
                call.program
            )));
        }
        let recorded = RecordedDraw {
            call: call.clone(),
            state: self.state,
            target: self.bound_target(),
        };
        self.calls.push(GraphicsCall::Draw(recorded));
    }

    fn submit(&mut self) {
        self.calls.push(GraphicsCall::Submit);
    }

    fn finish(&mut self) {
        self.calls.push(GraphicsCall::Finish);
    }

    fn take_errors(&mut self) -> Vec<GraphicsError> {
        std::mem::take(&mut self.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt::backend::{FilterMode, TextureFormat, WrapMode};
    use smallvec::smallvec;

    fn color(size: u32, samples: u32) -> TextureDesc {
        TextureDesc {
            label: "color".into(),
            width: size,
            height: size,
            format: TextureFormat::Rgba8Unorm,
            samples,
            sampled: true,
            filter: FilterMode::Linear,
            wrap: [WrapMode::ClampToEdge; 2],
        }
    }

    #[test]
    fn test_texture_limits() {
        let mut gfx = HeadlessGraphics::with_limits(GraphicsLimits {
            max_texture_size: 128,
            ..GraphicsLimits::default()
        });
        assert!(gfx.create_texture(&color(128, 1)).is_ok());
        assert!(matches!(
            gfx.create_texture(&color(129, 1)),
            Err(GraphicsError::InvalidValue(_))
        ));
        assert!(gfx.create_texture(&color(16, 16)).is_err());
        assert_eq!(gfx.live_textures(), 1);
    }

    #[test]
    fn test_resolve_checks_sample_counts() {
        let mut gfx = HeadlessGraphics::new();
        let ms = gfx.create_texture(&color(16, 4)).unwrap();
        let single = gfx.create_texture(&color(16, 1)).unwrap();

        gfx.resolve(ms, single);
        assert!(gfx.take_errors().is_empty());

        gfx.resolve(single, ms);
        assert_eq!(gfx.take_errors().len(), 1);
    }

    #[test]
    fn test_draw_into_incomplete_framebuffer_reports_error() {
        let mut gfx = HeadlessGraphics::new();
        let a = gfx.create_texture(&color(16, 1)).unwrap();
        let b = gfx.create_texture(&color(32, 1)).unwrap();
        gfx.bind_framebuffer(Some(&FramebufferBinding {
            color: smallvec![a, b],
            depth: None,
        }));
        assert_eq!(gfx.framebuffer_status(), FramebufferStatus::IncompleteAttachment);

        gfx.draw(&DrawCall::fullscreen("FXAA"));
        let errors = gfx.take_errors();
        assert!(matches!(errors[0], GraphicsError::InvalidFramebufferOperation(_)));
        assert_eq!(gfx.draws().count(), 1);
    }
}
