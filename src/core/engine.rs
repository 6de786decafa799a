//! Engine: owns the subsystems and runs the frame

use std::time::Instant;

use crate::compute::{ComputeBackend, ComputeContext, ComputeRegistry};
use crate::core::config::EngineConfig;
use crate::core::debug::FrameStats;
use crate::core::reload::{ReloadFlags, ReloadRequest};
use crate::rtt::{AntiAliasing, GraphicsBackend, Rtt};
use crate::scene::{register_builtin_programs, Camera, FrameSettings, Scene, Shading, ViewState};

/// Main engine struct
///
/// Compute is optional: when it is disabled or no device can be initialised
/// the engine renders without it.
pub struct Engine<C: ComputeBackend, G: GraphicsBackend> {
    config: EngineConfig,
    compute: Option<ComputeRegistry<C>>,
    rtt: Rtt<G>,
    shading: Box<dyn Shading>,
    scene: Scene<G>,
    view: ViewState,
    reload: ReloadFlags,
    stats: FrameStats,
    released: bool,
}

impl<C: ComputeBackend, G: GraphicsBackend> Engine<C, G> {
    pub fn new(config: EngineConfig, compute: C, graphics: G, mut shading: Box<dyn Shading>) -> Self {
        log::info!("starting engine at {}x{}", config.width, config.height);

        let compute = if config.compute.enabled {
            match ComputeContext::initialize(compute, &config.compute) {
                Ok(context) => Some(ComputeRegistry::new(context)),
                Err(err) => {
                    log::error!("compute disabled: {err}");
                    None
                }
            }
        } else {
            log::info!("compute disabled by configuration");
            None
        };

        if !register_builtin_programs(shading.as_mut()) {
            log::warn!("some built-in programs failed to link");
        }

        let mut rtt = Rtt::new(graphics, config.width, config.height);
        let settings = FrameSettings {
            anti_aliasing: config.anti_aliasing,
            inferred_scale: config.inferred_scale,
        };
        let scene = Scene::new(&mut rtt, (config.width, config.height), settings);

        let mut camera = Camera::new();
        camera.fov = config.fov.to_radians();
        camera.set_planes(config.near, config.far);
        camera.set_aspect(config.width, config.height);
        let view = ViewState::new(camera, (config.width, config.height));

        Self {
            config,
            compute,
            rtt,
            shading,
            scene,
            view,
            reload: ReloadFlags::new(),
            stats: FrameStats::new(),
            released: false,
        }
    }

    /// Render one frame and run the end-of-frame safe point.
    pub fn draw_frame(&mut self) {
        let start = Instant::now();

        self.view.apply_camera();
        self.scene
            .draw(&mut self.rtt, self.shading.as_mut(), &mut self.view);
        self.rtt.backend_mut().submit();

        self.safe_point();

        let errors = self.scene.report_errors(&mut self.rtt);
        self.stats.record_frame(start.elapsed(), errors);
    }

    /// Wait for compute and graphics, then apply pending reloads.
    fn safe_point(&mut self) {
        if let Some(compute) = &mut self.compute {
            compute.finish();
        }
        self.rtt.backend_mut().finish();

        let request = self.reload.take();
        if request.contains(ReloadRequest::KERNELS) {
            match &mut self.compute {
                Some(compute) => {
                    log::info!("reloading kernels");
                    let ok = compute.reload_all();
                    self.stats.record_kernel_reload(ok);
                }
                None => log::warn!("kernel reload requested without compute"),
            }
        }
        if request.contains(ReloadRequest::SHADERS) {
            log::info!("reloading shaders");
            let ok = self.shading.reload();
            self.stats.record_shader_reload(ok);
        }
    }

    /// Handle for requesting reloads from other threads.
    #[must_use]
    pub fn reload_flags(&self) -> ReloadFlags {
        self.reload.clone()
    }

    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        if width == 0 || height == 0 {
            return false;
        }
        self.config.width = width;
        self.config.height = height;
        self.view.camera.set_aspect(width, height);
        self.view.screen = (width, height);
        self.scene.resize(&mut self.rtt, width, height)
    }

    pub fn set_anti_aliasing(&mut self, anti_aliasing: AntiAliasing) -> bool {
        self.config.anti_aliasing = anti_aliasing;
        self.scene.set_anti_aliasing(&mut self.rtt, anti_aliasing)
    }

    pub fn set_inferred_scale(&mut self, scale: u32) -> bool {
        self.config.inferred_scale = scale.min(4);
        self.scene.set_inferred_scale(&mut self.rtt, scale)
    }

    /// Share the scene's frame buffers with compute kernels.
    pub fn share_scene_with_compute(&mut self) -> bool {
        match &mut self.compute {
            Some(compute) => self.scene.share_with_compute(&self.rtt, compute),
            None => false,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn compute(&self) -> Option<&ComputeRegistry<C>> {
        self.compute.as_ref()
    }

    pub fn compute_mut(&mut self) -> Option<&mut ComputeRegistry<C>> {
        self.compute.as_mut()
    }

    #[must_use]
    pub const fn rtt(&self) -> &Rtt<G> {
        &self.rtt
    }

    pub fn rtt_mut(&mut self) -> &mut Rtt<G> {
        &mut self.rtt
    }

    #[must_use]
    pub const fn scene(&self) -> &Scene<G> {
        &self.scene
    }

    /// The scene together with the render targets it creates its buffers on.
    pub fn scene_mut(&mut self) -> (&mut Scene<G>, &mut Rtt<G>) {
        (&mut self.scene, &mut self.rtt)
    }

    pub fn shading_mut(&mut self) -> &mut dyn Shading {
        self.shading.as_mut()
    }

    #[must_use]
    pub const fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.view.camera
    }

    #[must_use]
    pub const fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Free every graphics and compute resource the engine holds. Called on
    /// drop; safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(compute) = &mut self.compute {
            compute.finish();
            self.scene.release_compute(compute);
        }
        self.rtt.backend_mut().finish();
        self.scene.release(&mut self.rtt);
        log::info!("engine released: {}", self.stats.summary());
    }
}

impl<C: ComputeBackend, G: GraphicsBackend> Drop for Engine<C, G> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::compute::{host_device_info, DeviceKind, HeadlessCompute};
    use crate::core::ComputeConfig;
    use crate::rtt::{GraphicsCall, GraphicsError, HeadlessGraphics};
    use crate::scene::{Light, WgslShading};

    fn engine(compute_enabled: bool) -> Engine<HeadlessCompute, HeadlessGraphics> {
        let config = EngineConfig::new().with_size(320, 240).with_compute(ComputeConfig {
            enabled: compute_enabled,
            cache_path: std::env::temp_dir().join("lumen-engine-tests"),
            ..ComputeConfig::default()
        });
        Engine::new(
            config,
            HeadlessCompute::new(vec![host_device_info("cpu", DeviceKind::Cpu, 4)]),
            HeadlessGraphics::new(),
            Box::new(WgslShading::new(".")),
        )
    }

    #[test]
    fn test_frame_ends_with_safe_point() {
        let mut engine = engine(true);
        let (scene, _) = engine.scene_mut();
        scene.add_light(Light::point(Vec3::ZERO, Vec3::ONE, 3.0));

        engine.rtt_mut().backend_mut().clear_calls();
        engine.draw_frame();

        let calls = engine.rtt().backend().calls();
        assert!(calls.iter().any(|c| matches!(c, GraphicsCall::Draw(_))));
        assert_eq!(calls[calls.len() - 2..], [GraphicsCall::Submit, GraphicsCall::Finish]);
        assert_eq!(engine.stats().total_frames(), 1);
    }

    #[test]
    fn test_reload_requests_are_consumed_once() {
        let mut engine = engine(true);
        let flags = engine.reload_flags();
        std::thread::spawn(move || {
            flags.request_kernels();
            flags.request_shaders();
        })
        .join()
        .unwrap();

        engine.draw_frame();
        engine.draw_frame();
        assert_eq!(engine.stats().kernel_reloads(), 1);
        assert_eq!(engine.stats().shader_reloads(), 1);
        assert_eq!(engine.stats().failed_reloads(), 0);
        assert!(engine.reload_flags().pending().is_empty());
    }

    #[test]
    fn test_runs_without_compute() {
        let mut engine = engine(false);
        assert!(engine.compute().is_none());
        assert!(!engine.share_scene_with_compute());

        engine.reload_flags().request_kernels();
        engine.draw_frame();
        assert_eq!(engine.stats().kernel_reloads(), 0);
    }

    #[test]
    fn test_graphics_errors_are_counted() {
        let mut engine = engine(true);
        engine
            .rtt_mut()
            .backend_mut()
            .inject_error(GraphicsError::InvalidOperation("draw".to_string()));
        engine.draw_frame();
        engine.draw_frame();
        assert_eq!(engine.stats().total_graphics_errors(), 1);
        assert_eq!(engine.stats().frames_with_errors(), 1);
    }

    #[test]
    fn test_resize_recreates_buffers() {
        let mut engine = engine(true);
        assert!(engine.share_scene_with_compute());
        let before = engine.scene().scene_buffer();

        assert!(engine.resize(640, 480));
        assert!(!engine.resize(0, 480));
        assert_ne!(engine.scene().scene_buffer(), before);
        assert_eq!(engine.view().screen, (640, 480));
        let scene_buffer = engine.scene().scene_buffer().unwrap();
        assert_eq!(engine.rtt().target(scene_buffer).unwrap().size(), (640, 480));

        assert!(engine.share_scene_with_compute());
        assert_eq!(engine.compute().unwrap().buffer_count(), 8);
    }

    #[test]
    fn test_release_frees_everything() {
        let mut engine = engine(true);
        assert!(engine.share_scene_with_compute());
        engine.release();
        assert_eq!(engine.rtt().target_count(), 0);
        assert_eq!(engine.rtt().backend().live_textures(), 0);
        assert_eq!(engine.compute().unwrap().buffer_count(), 0);
        engine.release();
    }
}
