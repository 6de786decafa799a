//! Scene orchestration
//!
//! [`Scene`] owns everything that is drawn and runs the per-frame render
//! graph of the inferred renderer:
//!
//! 1. particle managers advance one step
//! 2. alpha objects are sorted and get mask ids
//! 3. due environment probes render into their own buffers
//! 4. geometry pass (opaque, then alpha into the second g-buffer)
//! 5. light pass into the l-buffers
//! 6. material pass into the scene buffer
//! 7. FXAA resolve
//! 8. post-processing handlers
//!
//! Nothing is propagated out of a frame; failures are logged and the frame
//! goes on with whatever could be drawn.

use std::collections::BTreeMap;

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};

use crate::compute::{BufferFlags, BufferHandle, ComputeBackend, ComputeRegistry, GraphicsObject};
use crate::core::{Pool, PoolIndex};
use crate::rtt::{
    AntiAliasing, BlendMode, ClearMask, DepthFunc, GraphicsBackend, RenderState, Rtt,
    TargetHandle, TextureHandle, Winding,
};

use super::alpha::{sort_alpha_objects, ExtBBox, SortedAlpha};
use super::camera::ViewState;
use super::drawable::{AlphaDrawable, DrawCallback, DrawContext, DrawMode, IrBuffers, Model};
use super::frame::{FrameBuffers, FrameSettings};
use super::lights::Light;
use super::particles::ParticleManager;
use super::probe::{EnvironmentProbe, ProbeHandle};
use super::shaders::{
    DIRECTIONAL_OPTION, FXAA_PROGRAM, LIGHT_PROGRAM, LUMA_PROGRAM, SKYBOX_PROGRAM,
};
use super::shading::{Primitive, Shading, DEFAULT_OPTION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelHandle(PoolIndex);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightHandle(PoolIndex);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticleHandle(PoolIndex);

/// One registered alpha drawable with its sub-objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlphaHandle(PoolIndex);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostHandle(u64);

/// What a post-processing handler works on.
pub struct PostContext<'a, G: GraphicsBackend> {
    pub rtt: &'a mut Rtt<G>,
    pub shading: &'a mut dyn Shading,
    /// Resolved scene buffer of the frame
    pub scene_buffer: TargetHandle,
}

pub type PostProcessHandler<G> = Box<dyn FnMut(&mut PostContext<'_, G>)>;

struct AlphaEntry {
    drawable: Box<dyn AlphaDrawable>,
    sub_objects: Vec<usize>,
}

/// A probe due this frame, with what it renders from.
struct ProbeCapture {
    buffers: FrameBuffers,
    position: Vec3,
    rotation: Vec2,
}

/// Depth test used outside of the passes that need something else.
fn base_state() -> RenderState {
    RenderState {
        depth_func: Some(DepthFunc::LessEqual),
        ..RenderState::default()
    }
}

pub struct Scene<G: GraphicsBackend> {
    enabled: bool,
    position: Vec3,
    lighting: bool,
    render_skybox: bool,
    skybox: Option<TextureHandle>,
    eye_distance: f32,
    size: (u32, u32),
    settings: FrameSettings,
    frame: Option<FrameBuffers>,
    /// Interop buffers of deleted frame buffers, freed on the next share
    stale_interop: Vec<BufferHandle>,

    models: Pool<Box<dyn Model>>,
    lights: Pool<Light>,
    particle_managers: Pool<Box<dyn ParticleManager>>,
    alpha_objects: Pool<AlphaEntry>,
    sorted_alpha: Vec<SortedAlpha<(AlphaHandle, usize)>>,
    probes: Pool<EnvironmentProbe>,
    draw_callbacks: BTreeMap<String, DrawCallback>,
    post_handlers: Vec<(PostHandle, PostProcessHandler<G>)>,
    next_post: u64,
}

impl<G: GraphicsBackend> Scene<G> {
    /// Scene rendering at `size`, with its frame buffers created on `rtt`.
    pub fn new(rtt: &mut Rtt<G>, size: (u32, u32), settings: FrameSettings) -> Self {
        let mut scene = Self {
            enabled: true,
            position: Vec3::ZERO,
            lighting: true,
            render_skybox: false,
            skybox: None,
            eye_distance: 0.0,
            size,
            settings,
            frame: None,
            stale_interop: Vec::new(),
            models: Pool::new(),
            lights: Pool::new(),
            particle_managers: Pool::new(),
            alpha_objects: Pool::new(),
            sorted_alpha: Vec::new(),
            probes: Pool::new(),
            draw_callbacks: BTreeMap::new(),
            post_handlers: Vec::new(),
            next_post: 0,
        };
        scene.recreate_buffers(rtt);
        scene
    }

    // ---- frame ----

    /// Render one frame with the camera and matrices of `view`.
    pub fn draw(&mut self, rtt: &mut Rtt<G>, shading: &mut dyn Shading, view: &mut ViewState) {
        if !self.enabled {
            return;
        }

        self.setup_scene();
        self.sort_alpha_objects(view);

        let captures = self.due_probes();
        if !captures.is_empty() {
            let mut probe_view = view.scoped();
            for capture in &captures {
                probe_view.camera.position = capture.position;
                probe_view.camera.set_rotation(capture.rotation);
                probe_view.apply_camera();
                self.render(&capture.buffers, rtt, shading, &probe_view, DrawMode::ENVIRONMENT_PASS);
            }
        }

        let Some(frame) = self.frame.clone() else {
            log::trace!("no frame buffers, frame skipped");
            return;
        };
        self.render(&frame, rtt, shading, view, DrawMode::empty());
        self.post_process(&frame, rtt, shading);
    }

    /// Advance every particle manager by one step.
    fn setup_scene(&mut self) {
        for (_, manager) in self.particle_managers.iter_mut() {
            manager.run();
        }
    }

    /// Re-sort the alpha sub-objects for the current view.
    pub fn sort_alpha_objects(&mut self, view: &ViewState) {
        let objects: Vec<((AlphaHandle, usize), ExtBBox)> = self
            .alpha_objects
            .iter()
            .flat_map(|(index, entry)| {
                entry
                    .sub_objects
                    .iter()
                    .map(move |&sub| ((AlphaHandle(index), sub), entry.drawable.bbox(sub)))
            })
            .collect();
        self.sorted_alpha =
            sort_alpha_objects(&objects, view.camera.position, view.mvp(), view.screen);
    }

    /// Sorted alpha sub-objects of the last frame, nearest first.
    #[must_use]
    pub fn sorted_alpha_objects(&self) -> &[SortedAlpha<(AlphaHandle, usize)>] {
        &self.sorted_alpha
    }

    fn due_probes(&mut self) -> Vec<ProbeCapture> {
        self.probes
            .iter_mut()
            .filter_map(|(_, probe)| {
                if !probe.tick() {
                    return None;
                }
                Some(ProbeCapture {
                    buffers: probe.buffers.clone()?,
                    position: probe.position,
                    rotation: probe.rotation,
                })
            })
            .collect()
    }

    fn render(
        &mut self,
        frame: &FrameBuffers,
        rtt: &mut Rtt<G>,
        shading: &mut dyn Shading,
        view: &ViewState,
        env: DrawMode,
    ) {
        let buffers = frame.ir_buffers(rtt);
        rtt.backend_mut().set_state(base_state());
        self.geometry_pass(frame, buffers, rtt, shading, view, env);
        self.light_pass(frame, buffers, rtt, shading, view);
        self.material_pass(frame, buffers, rtt, shading, view, env);
        if self.settings.anti_aliasing.is_fxaa() {
            Self::fxaa_pass(frame, rtt, shading);
        }
    }

    fn geometry_pass(
        &mut self,
        frame: &FrameBuffers,
        buffers: IrBuffers,
        rtt: &mut Rtt<G>,
        shading: &mut dyn Shading,
        view: &ViewState,
        env: DrawMode,
    ) {
        let scene_position = self.position;

        if let Some(g_buffer) = frame.g_buffer[0] {
            if rtt.begin_pass(g_buffer) {
                rtt.clear(ClearMask::COLOR | ClearMask::DEPTH);
                let mode = DrawMode::GEOMETRY_PASS | env;
                let mut ctx = DrawContext {
                    shading: &mut *shading,
                    gfx: rtt.backend_mut(),
                    view,
                    buffers,
                    scene_position,
                };

                for (_, model) in self.models.iter_mut() {
                    if model.is_visible() {
                        model.draw(mode, &mut ctx);
                    }
                }
                for (_, model) in self.models.iter_mut() {
                    if model.draws_physical_representation() {
                        model.draw_physical_representation(&mut ctx);
                    }
                }
                for callback in self.draw_callbacks.values_mut() {
                    callback(mode, &mut ctx);
                }
                rtt.end_pass();
            }
        }

        if let Some(g_buffer) = frame.g_buffer[1] {
            if rtt.begin_pass(g_buffer) {
                rtt.clear(ClearMask::COLOR | ClearMask::DEPTH);
                let mode = DrawMode::GEOMETRY_ALPHA_PASS | env;
                let mut ctx = DrawContext {
                    shading: &mut *shading,
                    gfx: rtt.backend_mut(),
                    view,
                    buffers,
                    scene_position,
                };

                Self::draw_alpha_objects(&mut self.alpha_objects, &self.sorted_alpha, mode, &mut ctx);
                for callback in self.draw_callbacks.values_mut() {
                    callback(mode, &mut ctx);
                }
                rtt.end_pass();
            }
        }
    }

    /// Draw the sorted alpha sub-objects back to front.
    fn draw_alpha_objects(
        alpha_objects: &mut Pool<AlphaEntry>,
        sorted: &[SortedAlpha<(AlphaHandle, usize)>],
        mode: DrawMode,
        ctx: &mut DrawContext<'_>,
    ) {
        for item in sorted.iter().rev() {
            let (handle, sub_object) = item.key;
            if let Some(entry) = alpha_objects.get_mut(handle.0) {
                entry.drawable.draw(mode, sub_object, item.mask_id, ctx);
            }
        }
    }

    fn light_pass(
        &mut self,
        frame: &FrameBuffers,
        buffers: IrBuffers,
        rtt: &mut Rtt<G>,
        shading: &mut dyn Shading,
        view: &ViewState,
    ) {
        let passes = if !self.alpha_objects.is_empty() && frame.l_buffer[1].is_some() {
            2
        } else {
            1
        };

        let camera = view.camera;
        let projection_ab = Vec2::new(
            camera.far / (camera.far - camera.near),
            -camera.far * camera.near / (camera.far - camera.near),
        );
        let mvpm = view.mvp();
        let imvm = view.modelview_matrix().inverse();
        let ipm = view.projection_matrix().inverse();

        rtt.backend_mut().set_blend(Some(BlendMode::Additive));
        for pass in 0..passes {
            let Some(l_buffer) = frame.l_buffer[pass] else {
                continue;
            };
            if !rtt.begin_pass(l_buffer) {
                continue;
            }
            rtt.clear(ClearMask::COLOR | ClearMask::DEPTH);
            if !self.lighting {
                rtt.end_pass();
                continue;
            }

            let screen_size = rtt
                .target(l_buffer)
                .map_or(Vec2::ONE, |t| Vec2::new(t.draw_size().0 as f32, t.draw_size().1 as f32));
            let gfx = rtt.backend_mut();

            for option in [DEFAULT_OPTION, DIRECTIONAL_OPTION] {
                if !shading.use_program(LIGHT_PROGRAM, option) {
                    continue;
                }
                shading.set_uniform("mvpm", mvpm.into());
                shading.set_uniform("imvm", imvm.into());
                shading.set_uniform("ipm", ipm.into());
                shading.set_uniform("cam_position", camera.position.into());
                shading.set_uniform("screen_size", screen_size.into());
                shading.set_uniform("projection_ab", projection_ab.into());
                if let Some(normal_nuv) = buffers.normal_nuv[pass] {
                    shading.bind_texture("normal_nuv_buffer", normal_nuv);
                }
                if let Some(depth) = buffers.depth[pass] {
                    shading.bind_texture("depth_buffer", depth);
                }

                let volumes = option == DEFAULT_OPTION;
                if !volumes {
                    gfx.set_front_face(Winding::Ccw);
                }
                for (_, light) in self.lights.iter() {
                    if !light.is_enabled() || light.has_volume() != volumes {
                        continue;
                    }
                    if volumes {
                        let (winding, depth_func) = light.volume_state(camera.position, camera.near);
                        gfx.set_front_face(winding);
                        gfx.set_depth_func(Some(depth_func));
                    }
                    let uniforms = light.uniforms();
                    shading.set_uniform("light_position", Vec4::from(uniforms.position).into());
                    shading.set_uniform("light_color", Vec4::from(uniforms.color).into());
                    shading.set_uniform("light_ambient", Vec4::from(uniforms.ambient).into());
                    shading.set_uniform("light_spot", Vec4::from(uniforms.spot).into());
                    let primitive = if volumes {
                        Primitive::LightVolume
                    } else {
                        Primitive::FullscreenTriangle
                    };
                    shading.draw(&mut *gfx, primitive);
                }
                shading.disable();
            }
            rtt.end_pass();
        }

        let gfx = rtt.backend_mut();
        gfx.set_front_face(Winding::Ccw);
        gfx.set_depth_func(Some(DepthFunc::LessEqual));
        gfx.set_blend(None);
    }

    fn material_pass(
        &mut self,
        frame: &FrameBuffers,
        buffers: IrBuffers,
        rtt: &mut Rtt<G>,
        shading: &mut dyn Shading,
        view: &ViewState,
        env: DrawMode,
    ) {
        if !rtt.begin_pass(frame.scene_buffer) {
            return;
        }
        // the shared g-buffer depth rejects everything not in front
        if frame.scene_depth_shared {
            rtt.clear(ClearMask::COLOR);
            rtt.backend_mut().set_depth_func(Some(DepthFunc::Equal));
        } else {
            rtt.clear(ClearMask::COLOR | ClearMask::DEPTH);
        }

        let mut ctx = DrawContext {
            shading: &mut *shading,
            gfx: rtt.backend_mut(),
            view,
            buffers,
            scene_position: self.position,
        };

        let mode = DrawMode::MATERIAL_PASS | env;
        for (_, model) in self.models.iter_mut() {
            if model.is_visible() {
                model.draw(mode, &mut ctx);
            }
        }
        for callback in self.draw_callbacks.values_mut() {
            callback(mode, &mut ctx);
        }

        // alpha objects, the sky and particles are not in the stored depth
        ctx.gfx.set_depth_func(Some(DepthFunc::LessEqual));

        if self.render_skybox {
            if let Some(skybox) = self.skybox {
                Self::draw_skybox(skybox, &mut ctx);
            }
        }

        if !self.sorted_alpha.is_empty() || !self.draw_callbacks.is_empty() {
            ctx.gfx.set_blend(Some(BlendMode::PremultipliedAlpha));
            let mode = DrawMode::MATERIAL_ALPHA_PASS | env;
            Self::draw_alpha_objects(&mut self.alpha_objects, &self.sorted_alpha, mode, &mut ctx);
            for callback in self.draw_callbacks.values_mut() {
                callback(mode, &mut ctx);
            }
            ctx.gfx.set_blend(None);
        }

        if !self.particle_managers.is_empty() {
            ctx.gfx.set_blend(Some(BlendMode::PremultipliedAlpha));
            ctx.gfx.set_depth_write(false);
            for (_, manager) in self.particle_managers.iter_mut() {
                manager.draw(&mut ctx);
            }
            ctx.gfx.set_depth_write(true);
            ctx.gfx.set_blend(None);
        }

        rtt.end_pass();
    }

    fn draw_skybox(skybox: TextureHandle, ctx: &mut DrawContext<'_>) {
        if !ctx.shading.use_program(SKYBOX_PROGRAM, DEFAULT_OPTION) {
            return;
        }
        let rotation = Mat4::from_mat3(Mat3::from_mat4(ctx.view.modelview_matrix()));
        ctx.shading
            .set_uniform("mvpm", (ctx.view.projection_matrix() * rotation).into());
        ctx.shading.bind_texture("skybox_texture", skybox);
        ctx.gfx.set_depth_write(false);
        ctx.draw(Primitive::Skybox);
        ctx.gfx.set_depth_write(true);
        ctx.shading.disable();
    }

    /// Luma into the fxaa buffer, then the filtered result back into the
    /// scene buffer.
    fn fxaa_pass(frame: &FrameBuffers, rtt: &mut Rtt<G>, shading: &mut dyn Shading) {
        let Some(scene_texture) = rtt.texture(frame.scene_buffer, 0) else {
            return;
        };
        let Some(fxaa_texture) = rtt.texture(frame.fxaa_buffer, 0) else {
            return;
        };
        let fxaa_size = rtt
            .target(frame.fxaa_buffer)
            .map_or((1, 1), |t| t.draw_size());

        if rtt.begin_pass(frame.fxaa_buffer) {
            let gfx = rtt.backend_mut();
            gfx.set_depth_func(None);
            if shading.use_program(LUMA_PROGRAM, DEFAULT_OPTION) {
                shading.bind_texture("src_buffer", scene_texture);
                shading.draw(&mut *gfx, Primitive::FullscreenTriangle);
                shading.disable();
            }
            rtt.end_pass();
        }

        if rtt.begin_pass(frame.scene_buffer) {
            let gfx = rtt.backend_mut();
            if shading.use_program(FXAA_PROGRAM, DEFAULT_OPTION) {
                shading.bind_texture("src_buffer", fxaa_texture);
                shading.set_uniform(
                    "texel_size",
                    (Vec2::ONE / Vec2::new(fxaa_size.0 as f32, fxaa_size.1 as f32)).into(),
                );
                // the luma buffer is upside down
                gfx.set_front_face(Winding::Cw);
                shading.draw(&mut *gfx, Primitive::FullscreenTriangle);
                gfx.set_front_face(Winding::Ccw);
                shading.disable();
            }
            rtt.end_pass();
        }
        rtt.backend_mut().set_depth_func(Some(DepthFunc::LessEqual));
    }

    fn post_process(&mut self, frame: &FrameBuffers, rtt: &mut Rtt<G>, shading: &mut dyn Shading) {
        for (_, handler) in &mut self.post_handlers {
            handler(&mut PostContext {
                rtt: &mut *rtt,
                shading: &mut *shading,
                scene_buffer: frame.scene_buffer,
            });
        }
    }

    // ---- buffers ----

    /// Recreate the frame buffers of the scene and of every probe, e.g. after
    /// a resize or a settings change.
    pub fn recreate_buffers(&mut self, rtt: &mut Rtt<G>) -> bool {
        if let Some(old) = self.frame.take() {
            old.delete(rtt);
            self.stale_interop.extend(old.interop);
        }
        self.frame = FrameBuffers::create(rtt, self.size, self.settings, true);

        let mut ok = self.frame.is_some();
        for (_, probe) in self.probes.iter_mut() {
            if let Some(old) = probe.buffers.take() {
                old.delete(rtt);
            }
            probe.buffers = FrameBuffers::create(rtt, probe.size(), self.settings, probe.captures_alpha());
            ok &= probe.buffers.is_some();
        }
        ok
    }

    pub fn resize(&mut self, rtt: &mut Rtt<G>, width: u32, height: u32) -> bool {
        if (width, height) == self.size && self.frame.is_some() {
            return true;
        }
        log::debug!("scene resized to {width}x{height}");
        self.size = (width, height);
        rtt.set_screen_size(width, height);
        self.recreate_buffers(rtt)
    }

    pub fn set_anti_aliasing(&mut self, rtt: &mut Rtt<G>, anti_aliasing: AntiAliasing) -> bool {
        if self.settings.anti_aliasing == anti_aliasing {
            return true;
        }
        self.settings.anti_aliasing = anti_aliasing;
        self.recreate_buffers(rtt)
    }

    pub fn set_inferred_scale(&mut self, rtt: &mut Rtt<G>, scale: u32) -> bool {
        let scale = scale.min(4);
        if self.settings.inferred_scale == scale {
            return true;
        }
        self.settings.inferred_scale = scale;
        self.recreate_buffers(rtt)
    }

    #[must_use]
    pub const fn settings(&self) -> FrameSettings {
        self.settings
    }

    #[must_use]
    pub const fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Expose the g-buffer normal and depth textures (read) and the l-buffer
    /// attachments (write) to compute kernels. Sharing is manual; kernels
    /// using them must acquire and release explicitly. Interop buffers of
    /// earlier frame buffers are deleted first.
    pub fn share_with_compute<C: ComputeBackend>(
        &mut self,
        rtt: &Rtt<G>,
        compute: &mut ComputeRegistry<C>,
    ) -> bool {
        for buffer in self.stale_interop.drain(..) {
            compute.delete_buffer(buffer);
        }
        let Some(frame) = self.frame.as_mut() else {
            return false;
        };
        for buffer in frame.interop.drain(..) {
            compute.delete_buffer(buffer);
        }

        let buffers = frame.ir_buffers(rtt);
        let objects = (0..2).flat_map(|i| {
            [
                (BufferFlags::READ, buffers.normal_nuv[i]),
                (BufferFlags::READ, buffers.depth[i]),
                (BufferFlags::WRITE, buffers.diffuse[i]),
                (BufferFlags::WRITE, buffers.specular[i]),
            ]
        });

        let mut ok = true;
        for (flags, texture) in objects {
            let Some(texture) = texture else {
                continue;
            };
            match compute.create_graphics_interop_buffer(flags, GraphicsObject::Texture2d(texture)) {
                Some(buffer) => {
                    compute.set_manual_sharing(buffer, true);
                    frame.interop.push(buffer);
                }
                None => {
                    log::warn!("texture {} cannot be shared with compute", texture.raw());
                    ok = false;
                }
            }
        }
        log::debug!("shared {} frame buffer textures with compute", frame.interop.len());
        ok
    }

    /// Compute views of the current frame buffers.
    #[must_use]
    pub fn interop_buffers(&self) -> &[BufferHandle] {
        self.frame.as_ref().map_or(&[], |f| f.interop.as_slice())
    }

    /// Delete every interop buffer created by
    /// [`share_with_compute`](Self::share_with_compute).
    pub fn release_compute<C: ComputeBackend>(&mut self, compute: &mut ComputeRegistry<C>) {
        let current = self.frame.as_mut().map(|f| std::mem::take(&mut f.interop));
        for buffer in self.stale_interop.drain(..).chain(current.into_iter().flatten()) {
            compute.delete_buffer(buffer);
        }
    }

    /// Delete every render target the scene and its probes own.
    pub fn release(&mut self, rtt: &mut Rtt<G>) {
        if let Some(frame) = self.frame.take() {
            frame.delete(rtt);
            self.stale_interop.extend(frame.interop);
        }
        for (_, probe) in self.probes.iter_mut() {
            if let Some(buffers) = probe.buffers.take() {
                buffers.delete(rtt);
            }
        }
    }

    /// Log every graphics error raised since the last call. Returns how many
    /// there were.
    pub fn report_errors(&self, rtt: &mut Rtt<G>) -> usize {
        let errors = rtt.backend_mut().take_errors();
        for error in &errors {
            log::error!("graphics error: {error}");
        }
        errors.len()
    }

    #[must_use]
    pub fn frame_buffers(&self) -> Option<&FrameBuffers> {
        self.frame.as_ref()
    }

    /// g-buffer `index` (0 opaque, 1 alpha)
    #[must_use]
    pub fn g_buffer(&self, index: usize) -> Option<TargetHandle> {
        self.frame.as_ref()?.g_buffer.get(index).copied().flatten()
    }

    /// l-buffer `index` (0 opaque, 1 alpha)
    #[must_use]
    pub fn l_buffer(&self, index: usize) -> Option<TargetHandle> {
        self.frame.as_ref()?.l_buffer.get(index).copied().flatten()
    }

    #[must_use]
    pub fn scene_buffer(&self) -> Option<TargetHandle> {
        self.frame.as_ref().map(|f| f.scene_buffer)
    }

    #[must_use]
    pub fn fxaa_buffer(&self) -> Option<TargetHandle> {
        self.frame.as_ref().map(|f| f.fxaa_buffer)
    }

    // ---- state ----

    /// Enable or disable drawing. Disabling clears the scene buffer so it
    /// stays fully transparent.
    pub fn set_enabled(&mut self, rtt: &mut Rtt<G>, enabled: bool) {
        if self.enabled && !enabled {
            if let Some(frame) = &self.frame {
                if rtt.begin_pass(frame.scene_buffer) {
                    rtt.clear(ClearMask::COLOR | ClearMask::DEPTH);
                    rtt.end_pass();
                }
            }
        }
        self.enabled = enabled;
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Scene origin offset handed to drawables.
    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    #[must_use]
    pub const fn position(&self) -> Vec3 {
        self.position
    }

    /// Without lighting the l-buffers stay cleared.
    pub fn set_lighting(&mut self, lighting: bool) {
        self.lighting = lighting;
    }

    #[must_use]
    pub const fn is_lighting(&self) -> bool {
        self.lighting
    }

    pub fn set_skybox_texture(&mut self, texture: Option<TextureHandle>) {
        self.skybox = texture;
    }

    #[must_use]
    pub const fn skybox_texture(&self) -> Option<TextureHandle> {
        self.skybox
    }

    pub fn set_render_skybox(&mut self, render: bool) {
        self.render_skybox = render;
    }

    #[must_use]
    pub const fn render_skybox(&self) -> bool {
        self.render_skybox
    }

    /// Eye separation for stereo output. Frames are rendered mono.
    pub fn set_eye_distance(&mut self, distance: f32) {
        self.eye_distance = distance;
    }

    #[must_use]
    pub const fn eye_distance(&self) -> f32 {
        self.eye_distance
    }

    // ---- registries ----

    pub fn add_model(&mut self, model: Box<dyn Model>) -> ModelHandle {
        ModelHandle(self.models.insert(model))
    }

    pub fn delete_model(&mut self, handle: ModelHandle) -> Option<Box<dyn Model>> {
        let model = self.models.remove(handle.0);
        if model.is_none() {
            log::error!("can't delete model: model {} doesn't exist", handle.0);
        }
        model
    }

    pub fn model_mut(&mut self, handle: ModelHandle) -> Option<&mut (dyn Model + 'static)> {
        self.models.get_mut(handle.0).map(|m| m.as_mut())
    }

    #[must_use]
    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn add_light(&mut self, light: Light) -> LightHandle {
        LightHandle(self.lights.insert(light))
    }

    pub fn delete_light(&mut self, handle: LightHandle) -> Option<Light> {
        self.lights.remove(handle.0)
    }

    #[must_use]
    pub fn light(&self, handle: LightHandle) -> Option<&Light> {
        self.lights.get(handle.0)
    }

    pub fn light_mut(&mut self, handle: LightHandle) -> Option<&mut Light> {
        self.lights.get_mut(handle.0)
    }

    #[must_use]
    pub fn light_count(&self) -> usize {
        self.lights.len()
    }

    pub fn add_particle_manager(&mut self, manager: Box<dyn ParticleManager>) -> ParticleHandle {
        ParticleHandle(self.particle_managers.insert(manager))
    }

    pub fn delete_particle_manager(
        &mut self,
        handle: ParticleHandle,
    ) -> Option<Box<dyn ParticleManager>> {
        self.particle_managers.remove(handle.0)
    }

    #[must_use]
    pub fn particle_manager_count(&self) -> usize {
        self.particle_managers.len()
    }

    /// Register one transparent sub-object of `drawable`.
    pub fn add_alpha_object(&mut self, drawable: Box<dyn AlphaDrawable>, sub_object: usize) -> AlphaHandle {
        self.add_alpha_objects(drawable, &[sub_object])
    }

    /// Register several transparent sub-objects of `drawable`, sorted
    /// individually every frame.
    pub fn add_alpha_objects(
        &mut self,
        drawable: Box<dyn AlphaDrawable>,
        sub_objects: &[usize],
    ) -> AlphaHandle {
        AlphaHandle(self.alpha_objects.insert(AlphaEntry {
            drawable,
            sub_objects: sub_objects.to_vec(),
        }))
    }

    pub fn delete_alpha_object(&mut self, handle: AlphaHandle) -> bool {
        let removed = self.alpha_objects.remove(handle.0).is_some();
        if removed {
            self.sorted_alpha.retain(|s| s.key.0 != handle);
        }
        removed
    }

    pub fn delete_alpha_objects(&mut self, handles: &[AlphaHandle]) -> usize {
        handles
            .iter()
            .filter(|&&handle| self.delete_alpha_object(handle))
            .count()
    }

    /// Register `callback` under `name`. Names are unique.
    pub fn add_draw_callback(&mut self, name: &str, callback: DrawCallback) -> bool {
        if self.draw_callbacks.contains_key(name) {
            log::error!("scene draw callback \"{name}\" already exists");
            return false;
        }
        self.draw_callbacks.insert(name.to_string(), callback);
        true
    }

    pub fn delete_draw_callback(&mut self, name: &str) -> bool {
        if self.draw_callbacks.remove(name).is_none() {
            log::error!("scene draw callback \"{name}\" doesn't exist");
            return false;
        }
        true
    }

    /// Register a post-processing handler; handlers run in registration order.
    pub fn add_post_processing(&mut self, handler: PostProcessHandler<G>) -> PostHandle {
        let handle = PostHandle(self.next_post);
        self.next_post += 1;
        self.post_handlers.push((handle, handler));
        handle
    }

    pub fn delete_post_processing(&mut self, handle: PostHandle) -> bool {
        let before = self.post_handlers.len();
        self.post_handlers.retain(|(h, _)| *h != handle);
        self.post_handlers.len() != before
    }

    /// Add a probe capturing both hemispheres around `position` at `size`
    /// per hemisphere.
    pub fn add_environment_probe(
        &mut self,
        rtt: &mut Rtt<G>,
        position: Vec3,
        rotation: Vec2,
        size: (u32, u32),
        capture_alpha: bool,
    ) -> Option<ProbeHandle> {
        let mut probe = EnvironmentProbe::new(position, rotation, size, capture_alpha);
        probe.buffers = Some(FrameBuffers::create(rtt, probe.size(), self.settings, capture_alpha)?);
        Some(ProbeHandle(self.probes.insert(probe)))
    }

    pub fn delete_environment_probe(&mut self, rtt: &mut Rtt<G>, handle: ProbeHandle) -> bool {
        let Some(mut probe) = self.probes.remove(handle.0) else {
            return false;
        };
        if let Some(buffers) = probe.buffers.take() {
            buffers.delete(rtt);
        }
        true
    }

    pub fn probe(&self, handle: ProbeHandle) -> Option<&EnvironmentProbe> {
        self.probes.get(handle.0)
    }

    pub fn probe_mut(&mut self, handle: ProbeHandle) -> Option<&mut EnvironmentProbe> {
        self.probes.get_mut(handle.0)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::compute::{host_device_info, ComputeContext, DeviceKind, HeadlessCompute};
    use crate::core::ComputeConfig;
    use crate::rtt::{GraphicsCall, GraphicsError, HeadlessGraphics, RecordedDraw};
    use crate::scene::camera::Camera;
    use crate::scene::probe::ProbeFrequency;
    use crate::scene::shaders::{register_builtin_programs, PARTICLE_PROGRAM};
    use crate::scene::shading::WgslShading;

    type Log = Rc<RefCell<Vec<String>>>;

    struct Fixture {
        rtt: Rtt<HeadlessGraphics>,
        shading: WgslShading,
        view: ViewState,
        scene: Scene<HeadlessGraphics>,
    }

    fn fixture(settings: FrameSettings) -> Fixture {
        let mut rtt = Rtt::new(HeadlessGraphics::new(), 320, 240);
        let mut shading = WgslShading::new(".");
        assert!(register_builtin_programs(&mut shading));
        let mut camera = Camera::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        camera.set_aspect(320, 240);
        let view = ViewState::new(camera, (320, 240));
        let scene = Scene::new(&mut rtt, (320, 240), settings);
        Fixture {
            rtt,
            shading,
            view,
            scene,
        }
    }

    impl Fixture {
        fn draw(&mut self) {
            self.rtt.backend_mut().clear_calls();
            self.scene.draw(&mut self.rtt, &mut self.shading, &mut self.view);
        }

        fn draws_of(&self, program: &str) -> Vec<RecordedDraw> {
            self.rtt
                .backend()
                .draws()
                .filter(|d| d.call.program == program)
                .cloned()
                .collect()
        }
    }

    fn describe(mode: DrawMode) -> String {
        let pass = match mode.pass() {
            DrawMode::GEOMETRY_PASS => "geometry",
            DrawMode::MATERIAL_PASS => "material",
            DrawMode::GEOMETRY_ALPHA_PASS => "geometry_alpha",
            DrawMode::MATERIAL_ALPHA_PASS => "material_alpha",
            _ => "?",
        };
        if mode.is_environment() {
            format!("env:{pass}")
        } else {
            pass.to_string()
        }
    }

    /// Logs its passes and draws a particle quad in the material pass.
    struct TestModel {
        log: Log,
    }

    impl Model for TestModel {
        fn draw(&mut self, mode: DrawMode, ctx: &mut DrawContext<'_>) {
            self.log.borrow_mut().push(format!("model {}", describe(mode)));
            if mode.pass() == DrawMode::MATERIAL_PASS && ctx.shading.use_program(PARTICLE_PROGRAM, DEFAULT_OPTION) {
                ctx.draw(Primitive::Mesh { vertices: 6, instances: 1 });
                ctx.shading.disable();
            }
        }
    }

    struct TestAlpha {
        log: Log,
        bbox: ExtBBox,
    }

    impl AlphaDrawable for TestAlpha {
        fn bbox(&self, _sub_object: usize) -> ExtBBox {
            self.bbox
        }

        fn draw(&mut self, mode: DrawMode, sub_object: usize, mask_id: u32, _ctx: &mut DrawContext<'_>) {
            self.log
                .borrow_mut()
                .push(format!("alpha{sub_object}/{mask_id} {}", describe(mode)));
        }
    }

    fn logging_callback(log: &Log) -> DrawCallback {
        let log = Rc::clone(log);
        Box::new(move |mode, _ctx| log.borrow_mut().push(format!("callback {}", describe(mode))))
    }

    #[test]
    fn test_pass_ordering() {
        let mut f = fixture(FrameSettings::default());
        let log: Log = Rc::default();
        f.scene.add_model(Box::new(TestModel { log: Rc::clone(&log) }));
        f.scene.add_alpha_object(
            Box::new(TestAlpha {
                log: Rc::clone(&log),
                bbox: ExtBBox::new(Vec3::splat(-0.5), Vec3::splat(0.5), Vec3::ZERO),
            }),
            0,
        );
        assert!(f.scene.add_draw_callback("overlay", logging_callback(&log)));

        f.draw();

        assert_eq!(
            *log.borrow(),
            vec![
                "model geometry",
                "callback geometry",
                "alpha0/1 geometry_alpha",
                "callback geometry_alpha",
                "model material",
                "callback material",
                "alpha0/1 material_alpha",
                "callback material_alpha",
            ]
        );
    }

    #[test]
    fn test_alpha_objects_drawn_back_to_front() {
        let mut f = fixture(FrameSettings::default());
        let log: Log = Rc::default();
        for z in [-10.0, 0.0, -5.0] {
            f.scene.add_alpha_object(
                Box::new(TestAlpha {
                    log: Rc::clone(&log),
                    bbox: ExtBBox::new(Vec3::splat(-0.5), Vec3::splat(0.5), Vec3::new(0.0, 0.0, z)),
                }),
                z as usize,
            );
        }
        f.draw();

        let geometry: Vec<String> = log
            .borrow()
            .iter()
            .filter(|l| l.ends_with(" geometry_alpha"))
            .cloned()
            .collect();
        // nearest gets mask 1, each one behind overlaps all in front
        assert_eq!(
            geometry,
            vec![
                "alpha0/3 geometry_alpha",
                "alpha0/2 geometry_alpha",
                "alpha0/1 geometry_alpha",
            ]
        );
        let sorted = f.scene.sorted_alpha_objects();
        assert_eq!(sorted.len(), 3);
        assert_eq!(sorted[0].mask_id, 1);
    }

    #[test]
    fn test_light_volume_state_follows_camera() {
        let mut f = fixture(FrameSettings::default());
        f.scene.add_light(Light::point(Vec3::new(0.0, 0.0, 4.0), Vec3::ONE, 2.0));
        f.scene.add_light(Light::point(Vec3::new(0.0, 0.0, -20.0), Vec3::ONE, 2.0));
        f.scene.add_light(Light::directional(Vec3::Y, Vec3::ONE, Vec3::splat(0.1)));
        f.draw();

        let draws = f.draws_of(LIGHT_PROGRAM);
        assert_eq!(draws.len(), 3);
        let l_texture = f.rtt.texture(f.scene.l_buffer(0).unwrap(), 0);

        let inside = &draws[0];
        assert_eq!(inside.call.option, DEFAULT_OPTION);
        assert_eq!(inside.call.primitive, Primitive::LightVolume);
        assert_eq!(inside.state.front_face, Winding::Cw);
        assert_eq!(inside.state.depth_func, Some(DepthFunc::Greater));
        assert_eq!(inside.state.blend, Some(BlendMode::Additive));
        assert_eq!(inside.target, l_texture);

        let outside = &draws[1];
        assert_eq!(outside.state.front_face, Winding::Ccw);
        assert_eq!(outside.state.depth_func, Some(DepthFunc::LessEqual));

        let directional = &draws[2];
        assert_eq!(directional.call.option, DIRECTIONAL_OPTION);
        assert_eq!(directional.call.primitive, Primitive::FullscreenTriangle);
        assert_eq!(
            directional.call.uniform("light_ambient"),
            Some(Vec4::new(0.1, 0.1, 0.1, 0.0).into())
        );
        assert_eq!(directional.call.textures.len(), 2);

        // blending is off again for the material pass
        assert_eq!(f.rtt.backend().state().blend, None);
    }

    #[test]
    fn test_lighting_disabled_only_clears() {
        let mut f = fixture(FrameSettings::default());
        f.scene.add_light(Light::point(Vec3::ZERO, Vec3::ONE, 2.0));
        f.scene.set_lighting(false);
        f.draw();

        assert!(f.draws_of(LIGHT_PROGRAM).is_empty());
        let l_texture = f.rtt.texture(f.scene.l_buffer(0).unwrap(), 0);
        assert!(f.rtt.backend().calls().iter().any(|c| matches!(
            c,
            GraphicsCall::Clear { mask, target } if *target == l_texture && *mask == ClearMask::COLOR
        )));
    }

    #[test]
    fn test_material_pass_depth_test() {
        let log: Log = Rc::default();

        let mut shared = fixture(FrameSettings::default());
        shared.scene.add_model(Box::new(TestModel { log: Rc::clone(&log) }));
        shared.draw();
        let scene_texture = shared.rtt.texture(shared.scene.scene_buffer().unwrap(), 0);
        let draws = shared.draws_of(PARTICLE_PROGRAM);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].state.depth_func, Some(DepthFunc::Equal));
        assert_eq!(draws[0].target, scene_texture);
        assert!(shared.rtt.backend().calls().contains(&GraphicsCall::Clear {
            mask: ClearMask::COLOR,
            target: scene_texture,
        }));

        let mut own_depth = fixture(FrameSettings {
            inferred_scale: 2,
            ..FrameSettings::default()
        });
        own_depth.scene.add_model(Box::new(TestModel { log }));
        own_depth.draw();
        let scene_texture = own_depth.rtt.texture(own_depth.scene.scene_buffer().unwrap(), 0);
        let draws = own_depth.draws_of(PARTICLE_PROGRAM);
        assert_eq!(draws[0].state.depth_func, Some(DepthFunc::LessEqual));
        assert!(own_depth.rtt.backend().calls().contains(&GraphicsCall::Clear {
            mask: ClearMask::COLOR | ClearMask::DEPTH,
            target: scene_texture,
        }));
    }

    #[test]
    fn test_fxaa_flips_front_face() {
        let mut f = fixture(FrameSettings {
            anti_aliasing: AntiAliasing::Fxaa,
            ..FrameSettings::default()
        });
        f.draw();

        let fxaa_texture = f.rtt.texture(f.scene.fxaa_buffer().unwrap(), 0);
        let scene_texture = f.rtt.texture(f.scene.scene_buffer().unwrap(), 0);

        let luma = f.draws_of(LUMA_PROGRAM);
        assert_eq!(luma.len(), 1);
        assert_eq!(luma[0].target, fxaa_texture);
        assert_eq!(luma[0].call.textures[0].1, scene_texture.unwrap());

        let fxaa = f.draws_of(FXAA_PROGRAM);
        assert_eq!(fxaa.len(), 1);
        assert_eq!(fxaa[0].target, scene_texture);
        assert_eq!(fxaa[0].state.front_face, Winding::Cw);
        assert_eq!(fxaa[0].call.uniform("texel_size"), Some(Vec2::new(1.0 / 320.0, 1.0 / 240.0).into()));
        assert_eq!(f.rtt.backend().state().front_face, Winding::Ccw);

        // no FXAA without the mode
        let mut plain = fixture(FrameSettings::default());
        plain.draw();
        assert!(plain.draws_of(FXAA_PROGRAM).is_empty());
    }

    #[test]
    fn test_probe_restores_view() {
        let mut f = fixture(FrameSettings::default());
        let log: Log = Rc::default();
        f.scene.add_model(Box::new(TestModel { log: Rc::clone(&log) }));
        let probe = f
            .scene
            .add_environment_probe(&mut f.rtt, Vec3::new(10.0, 0.0, 0.0), Vec2::new(0.0, 90.0), (32, 32), false)
            .unwrap();
        f.scene.probe_mut(probe).unwrap().set_frequency(ProbeFrequency::Once(1));
        assert_eq!(f.scene.probe(probe).unwrap().buffers().unwrap().size, (64, 32));

        let before = f.view.clone();
        f.draw();
        assert_eq!(f.view, before);
        assert_eq!(
            *log.borrow(),
            vec!["model env:geometry", "model env:material", "model geometry", "model material"]
        );

        log.borrow_mut().clear();
        f.draw();
        assert_eq!(*log.borrow(), vec!["model geometry", "model material"]);

        let targets = f.rtt.target_count();
        assert!(f.scene.delete_environment_probe(&mut f.rtt, probe));
        assert!(f.rtt.target_count() < targets);
        assert!(!f.scene.delete_environment_probe(&mut f.rtt, probe));
    }

    #[test]
    fn test_post_processing_gets_scene_buffer() {
        let mut f = fixture(FrameSettings::default());
        let seen: Rc<RefCell<Vec<TargetHandle>>> = Rc::default();
        let sink = Rc::clone(&seen);
        let handle = f
            .scene
            .add_post_processing(Box::new(move |ctx| sink.borrow_mut().push(ctx.scene_buffer)));
        f.draw();
        assert_eq!(*seen.borrow(), vec![f.scene.scene_buffer().unwrap()]);

        assert!(f.scene.delete_post_processing(handle));
        assert!(!f.scene.delete_post_processing(handle));
        f.draw();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_draw_callback_names_are_unique() {
        let mut f = fixture(FrameSettings::default());
        let log: Log = Rc::default();
        assert!(f.scene.add_draw_callback("hud", logging_callback(&log)));
        assert!(!f.scene.add_draw_callback("hud", logging_callback(&log)));
        assert!(f.scene.delete_draw_callback("hud"));
        assert!(!f.scene.delete_draw_callback("hud"));
    }

    #[test]
    fn test_disabled_scene_is_cleared_and_skipped() {
        let mut f = fixture(FrameSettings::default());
        let log: Log = Rc::default();
        f.scene.add_model(Box::new(TestModel { log: Rc::clone(&log) }));

        f.rtt.backend_mut().clear_calls();
        f.scene.set_enabled(&mut f.rtt, false);
        let scene_texture = f.rtt.texture(f.scene.scene_buffer().unwrap(), 0);
        assert!(f.rtt.backend().calls().iter().any(|c| matches!(
            c,
            GraphicsCall::Clear { target, .. } if *target == scene_texture
        )));

        f.draw();
        assert!(log.borrow().is_empty());
        assert!(f.rtt.backend().calls().is_empty());
    }

    #[test]
    fn test_delete_unknown_model() {
        let mut f = fixture(FrameSettings::default());
        let log: Log = Rc::default();
        let model = f.scene.add_model(Box::new(TestModel { log }));
        assert!(f.scene.delete_model(model).is_some());
        assert!(f.scene.delete_model(model).is_none());
        assert_eq!(f.scene.model_count(), 0);
    }

    #[test]
    fn test_share_with_compute() {
        let mut f = fixture(FrameSettings::default());
        let backend = HeadlessCompute::new(vec![host_device_info("cpu", DeviceKind::Cpu, 4)]);
        let config = ComputeConfig {
            cache_path: std::env::temp_dir().join("lumen-scene-tests"),
            ..ComputeConfig::default()
        };
        let mut compute = ComputeRegistry::new(ComputeContext::initialize(backend, &config).unwrap());

        // normal, depth, diffuse and specular of both variants
        assert!(f.scene.share_with_compute(&f.rtt, &mut compute));
        assert_eq!(f.scene.interop_buffers().len(), 8);
        assert_eq!(compute.buffer_count(), 8);

        // the old views are freed on the next share after a recreate
        assert!(f.scene.resize(&mut f.rtt, 640, 480));
        assert!(f.scene.interop_buffers().is_empty());
        assert!(f.scene.share_with_compute(&f.rtt, &mut compute));
        assert_eq!(compute.buffer_count(), 8);

        f.scene.release_compute(&mut compute);
        assert_eq!(compute.buffer_count(), 0);
    }

    #[test]
    fn test_errors_are_drained() {
        let mut f = fixture(FrameSettings::default());
        f.rtt
            .backend_mut()
            .inject_error(GraphicsError::OutOfMemory("texture".to_string()));
        assert_eq!(f.scene.report_errors(&mut f.rtt), 1);
        assert_eq!(f.scene.report_errors(&mut f.rtt), 0);
    }

    #[test]
    fn test_release_deletes_targets() {
        let mut f = fixture(FrameSettings::default());
        f.scene
            .add_environment_probe(&mut f.rtt, Vec3::ZERO, Vec2::ZERO, (16, 16), true)
            .unwrap();
        assert!(f.rtt.target_count() > 0);
        f.scene.release(&mut f.rtt);
        assert_eq!(f.rtt.target_count(), 0);
        assert_eq!(f.rtt.backend().live_textures(), 0);
    }
}
