//! What the scene draws and what it hands to drawables
//!
//! Models, alpha objects, draw callbacks and particle managers all draw
//! through a [`DrawContext`], which carries the shading system, the graphics
//! backend, the current view and the inferred-rendering buffers of the frame.

use bitflags::bitflags;
use glam::Vec3;

use super::alpha::ExtBBox;
use super::camera::ViewState;
use super::shading::{Primitive, Shading};
use crate::rtt::{GraphicsBackend, TextureHandle};

bitflags! {
    /// Pass a drawable is asked to draw for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DrawMode: u32 {
        const GEOMETRY_PASS = 1 << 0;
        const MATERIAL_PASS = 1 << 1;
        const GEOMETRY_ALPHA_PASS = 1 << 2;
        const MATERIAL_ALPHA_PASS = 1 << 3;
        /// Combined with one of the passes above while rendering a probe
        const ENVIRONMENT_PASS = 1 << 4;

        const GM_PASSES = Self::GEOMETRY_PASS.bits()
            | Self::MATERIAL_PASS.bits()
            | Self::GEOMETRY_ALPHA_PASS.bits()
            | Self::MATERIAL_ALPHA_PASS.bits();
    }
}

impl DrawMode {
    /// The pass without the environment flag.
    #[must_use]
    pub fn pass(self) -> Self {
        self & Self::GM_PASSES
    }

    #[must_use]
    pub fn is_environment(self) -> bool {
        self.contains(Self::ENVIRONMENT_PASS)
    }
}

/// Textures of the inferred-rendering buffers for the frame being drawn.
///
/// Index 0 is the opaque variant, index 1 the alpha variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrBuffers {
    pub normal_nuv: [Option<TextureHandle>; 2],
    pub depth: [Option<TextureHandle>; 2],
    /// Alpha variant only
    pub dsf: Option<TextureHandle>,
    pub diffuse: [Option<TextureHandle>; 2],
    pub specular: [Option<TextureHandle>; 2],
}

/// Everything a drawable needs to issue draws.
pub struct DrawContext<'a> {
    pub shading: &'a mut dyn Shading,
    pub gfx: &'a mut dyn GraphicsBackend,
    pub view: &'a ViewState,
    pub buffers: IrBuffers,
    /// Scene origin offset
    pub scene_position: Vec3,
}

impl DrawContext<'_> {
    /// Draw `primitive` with the program selected on the shading system.
    pub fn draw(&mut self, primitive: Primitive) {
        self.shading.draw(&mut *self.gfx, primitive);
    }
}

/// An opaque model.
pub trait Model {
    fn is_visible(&self) -> bool {
        true
    }

    fn draw(&mut self, mode: DrawMode, ctx: &mut DrawContext<'_>);

    /// Whether the model's physical representation is drawn as an overlay
    /// after the geometry pass.
    fn draws_physical_representation(&self) -> bool {
        false
    }

    fn draw_physical_representation(&mut self, _ctx: &mut DrawContext<'_>) {}
}

/// A transparent sub-object, sorted and masked every frame.
pub trait AlphaDrawable {
    /// Current bounds of `sub_object`.
    fn bbox(&self, sub_object: usize) -> ExtBBox;

    /// Draw `sub_object` with its overlap-resolution `mask_id`.
    fn draw(&mut self, mode: DrawMode, sub_object: usize, mask_id: u32, ctx: &mut DrawContext<'_>);
}

/// Named external draw hook, called in every geometry and material pass.
pub type DrawCallback = Box<dyn FnMut(DrawMode, &mut DrawContext<'_>)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_modes() {
        let mode = DrawMode::GEOMETRY_PASS | DrawMode::ENVIRONMENT_PASS;
        assert!(mode.is_environment());
        assert_eq!(mode.pass(), DrawMode::GEOMETRY_PASS);
        assert!(!DrawMode::MATERIAL_ALPHA_PASS.is_environment());
        assert!(DrawMode::GM_PASSES.contains(DrawMode::MATERIAL_ALPHA_PASS));
    }
}
