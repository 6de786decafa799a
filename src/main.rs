//! Demo: renders a small scene for a number of frames
//!
//! Runs on the recording backends by default; `--wgpu` renders on the GPU.
//!
//! ```text
//! lumen-demo [--wgpu] [--frames N] [--aa MODE] [--config FILE.ron|FILE.json]
//! ```

use std::path::Path;

use lumen::compute::ComputeBackend;
use lumen::core::ConfigError;
use lumen::prelude::*;
use lumen::scene::{
    register_builtin_pipelines, ParticleClock, ProbeFrequency, DEFAULT_OPTION, PARTICLE_PROGRAM,
};

const FADE_KERNEL: &str = r"
@group(0) @binding(0) var<storage, read_write> values: array<f32>;
@group(0) @binding(1) var<uniform> factor: vec4<f32>;

@compute @workgroup_size(64)
fn fade(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x < arrayLength(&values) {
        values[id.x] = values[id.x] * factor.x;
    }
}
";

/// Glass panes drawn as camera-facing quads in the transparent pass.
struct Panes {
    positions: Vec<Vec3>,
}

impl AlphaDrawable for Panes {
    fn bbox(&self, sub_object: usize) -> ExtBBox {
        let position = self.positions.get(sub_object).copied().unwrap_or_default();
        ExtBBox::new(Vec3::splat(-0.5), Vec3::splat(0.5), position)
    }

    fn draw(&mut self, mode: DrawMode, sub_object: usize, mask_id: u32, ctx: &mut DrawContext<'_>) {
        if mode.pass() != DrawMode::MATERIAL_ALPHA_PASS {
            return;
        }
        if !ctx.shading.use_program(PARTICLE_PROGRAM, DEFAULT_OPTION) {
            return;
        }
        let camera = ctx.view.camera;
        let tint = match mask_id {
            1 => Vec4::new(0.2, 0.4, 0.8, 0.4),
            2 => Vec4::new(0.2, 0.8, 0.4, 0.4),
            _ => Vec4::new(0.8, 0.4, 0.2, 0.4),
        };
        let position = self.positions.get(sub_object).copied().unwrap_or_default();
        ctx.shading.set_uniform("mvpm", ctx.view.mvp().into());
        ctx.shading
            .set_uniform("particle_position", (position + ctx.scene_position).into());
        ctx.shading.set_uniform("particle_size", 1.0_f32.into());
        ctx.shading.set_uniform("particle_color", tint.into());
        ctx.shading.set_uniform("camera_right", camera.right().into());
        ctx.shading
            .set_uniform("camera_up", camera.right().cross(camera.direction).into());
        ctx.draw(Primitive::Mesh {
            vertices: 6,
            instances: 1,
        });
        ctx.shading.disable();
    }
}

struct Args {
    wgpu: bool,
    frames: u32,
    config: EngineConfig,
}

fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => EngineConfig::load_json(path),
        _ => EngineConfig::load_ron(path),
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        wgpu: false,
        frames: 60,
        config: EngineConfig::new().with_size(640, 360),
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--wgpu" => args.wgpu = true,
            "--frames" => {
                let value = iter.next().ok_or("--frames needs a value")?;
                args.frames = value.parse().map_err(|e| format!("--frames {value}: {e}"))?;
            }
            "--aa" => {
                let value = iter.next().ok_or("--aa needs a value")?;
                args.config.anti_aliasing = value.parse().map_err(|e| format!("--aa {value}: {e}"))?;
            }
            "--config" => {
                let value = iter.next().ok_or("--config needs a path")?;
                args.config = load_config(Path::new(&value)).map_err(|e| e.to_string())?;
            }
            other => return Err(format!("unknown argument {other}")),
        }
    }
    Ok(args)
}

fn populate<C: ComputeBackend, G: GraphicsBackend>(engine: &mut Engine<C, G>) {
    let camera = engine.camera_mut();
    let mut eye = Camera::look_at(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO, Vec3::Y);
    eye.fov = camera.fov;
    eye.aspect = camera.aspect;
    eye.set_planes(camera.near, camera.far);
    *camera = eye;

    let (scene, rtt) = engine.scene_mut();
    scene.add_light(Light::directional(
        Vec3::new(0.3, 1.0, 0.2),
        Vec3::splat(0.8),
        Vec3::splat(0.05),
    ));
    scene.add_light(Light::point(Vec3::new(2.0, 1.0, 0.0), Vec3::new(1.0, 0.6, 0.3), 4.0));
    scene.add_light(
        Light::spot(Vec3::new(0.0, 4.0, 0.0), Vec3::NEG_Y, Vec3::ONE, 8.0).with_cone_angle(30.0),
    );

    let mut particles = EmitterManager::with_clock(ParticleClock::Fixed(1.0 / 60.0));
    particles.add_emitter(ParticleEmitter::new(
        EmitterConfig::default()
            .with_capacity(256)
            .with_rate(120.0)
            .with_cone(Vec3::Y, 20.0)
            .with_colors(Vec4::new(1.0, 0.8, 0.3, 1.0), Vec4::new(1.0, 0.2, 0.0, 0.0)),
    )
    .at(Vec3::new(0.0, 0.5, 0.0)));
    scene.add_particle_manager(Box::new(particles));

    scene.add_alpha_objects(
        Box::new(Panes {
            positions: vec![Vec3::new(-1.0, 0.5, 1.0), Vec3::new(-0.5, 0.5, -1.0), Vec3::new(3.0, 0.5, 0.0)],
        }),
        &[0, 1, 2],
    );

    if let Some(probe) =
        scene.add_environment_probe(rtt, Vec3::new(0.0, 1.0, 0.0), Vec2::ZERO, (128, 128), false)
    {
        if let Some(probe) = scene.probe_mut(probe) {
            probe.set_frequency(ProbeFrequency::NthFrame(10));
        }
    }
}

/// Fade a buffer on the compute device each frame.
fn run<C: ComputeBackend, G: GraphicsBackend>(engine: &mut Engine<C, G>, frames: u32) {
    engine.share_scene_with_compute();

    let fade = engine.compute_mut().and_then(|compute| {
        compute.add_kernel("fade", KernelSource::Inline(FADE_KERNEL.to_string()), "fade", "")?;
        let data: Vec<u8> = bytemuck::cast_slice(&[1.0_f32; 256]).to_vec();
        compute.create_buffer(
            BufferFlags::READ_WRITE | BufferFlags::INITIAL_COPY,
            data.len() as u64,
            Some(&data),
        )
    });

    for frame in 0..frames {
        if let (Some(values), Some(compute)) = (fade, engine.compute_mut()) {
            if compute.use_kernel("fade") {
                compute.set_arg(0, values);
                compute.set_arg(1, KernelArg::Value(bytemuck::bytes_of(&[0.95_f32, 0.0, 0.0, 0.0]).to_vec()));
                compute.set_range(NdRange::one(256), None);
                compute.run_kernel();
            }
        }
        engine.draw_frame();
        if frame % 30 == 0 {
            log::info!("frame {frame}: {}", engine.stats().summary());
        }
    }

    if let (Some(values), Some(compute)) = (fade, engine.compute_mut()) {
        let mut out = [0u8; 4];
        if compute.read_range(values, 0, &mut out) {
            log::info!("faded value after {frames} frames: {}", f32::from_le_bytes(out));
        }
        compute.delete_buffer(values);
    }
    log::info!("{}", engine.stats().summary());
}

fn run_headless(args: Args) {
    let mut compute = HeadlessCompute::host();
    compute.register_kernel("fade", |d| {
        let factor = d.value::<[f32; 4]>(1).map_or(1.0, |f| f[0]);
        if let Some(values) = d.memory_mut(0) {
            for chunk in values.chunks_exact_mut(4) {
                let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                chunk.copy_from_slice(&(v * factor).to_le_bytes());
            }
        }
    });
    let mut engine = Engine::new(
        args.config,
        compute,
        HeadlessGraphics::new(),
        Box::new(WgslShading::new("data/shaders")),
    );
    populate(&mut engine);
    run(&mut engine, args.frames);
    log::info!(
        "recorded {} graphics calls in the last frame",
        engine.rtt().backend().calls().len()
    );
}

fn run_wgpu(args: Args) -> Result<(), String> {
    let share = GpuShare::new().map_err(|e| e.to_string())?;
    let mut graphics = WgpuGraphics::new(share.clone());
    register_builtin_pipelines(&mut graphics, args.config.anti_aliasing.samples());

    let mut engine = Engine::new(
        args.config,
        WgpuCompute::with_share(share),
        graphics,
        Box::new(WgslShading::new("data/shaders")),
    );
    populate(&mut engine);
    run(&mut engine, args.frames);
    Ok(())
}

fn main() {
    env_logger::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            log::error!("{err}");
            std::process::exit(2);
        }
    };

    if args.wgpu {
        if let Err(err) = run_wgpu(args) {
            log::error!("wgpu demo failed: {err}");
            std::process::exit(1);
        }
    } else {
        run_headless(args);
    }
}
