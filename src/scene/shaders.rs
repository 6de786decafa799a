//! Built-in programs of the inferred renderer
//!
//! WGSL sources for the light pass, the FXAA resolve, the skybox and the
//! particle quads. Every module has a `vs_main` and an `fs_main` entry point,
//! uniforms in a block at group 0 binding 0, and texture `n` at group 1
//! binding `2n` with its sampler at `2n + 1`.

use crate::compute::options_prelude;
use crate::rtt::{
    pipeline_state, BlendMode, CullFace, DepthFunc, RegisteredPipeline, RenderState,
    TextureFormat, WgpuGraphics, Winding,
};

use super::particles::EmitterManager;
use super::shading::{ShaderSources, Shading, DEFAULT_OPTION};

pub const LIGHT_PROGRAM: &str = "IR_LP_ASHIKHMIN_SHIRLEY";
pub const DIRECTIONAL_OPTION: &str = "directional";
pub const LUMA_PROGRAM: &str = "LUMA";
pub const FXAA_PROGRAM: &str = "FXAA";
pub const SKYBOX_PROGRAM: &str = "SKYBOX";
pub const PARTICLE_PROGRAM: &str = EmitterManager::PROGRAM;

const LIGHT_COMMON: &str = include_str!("shaders/light_common.wgsl");
const LIGHT_VOLUME: &str = include_str!("shaders/light_volume.wgsl");
const LIGHT_DIRECTIONAL: &str = include_str!("shaders/light_directional.wgsl");
const LUMA: &str = include_str!("shaders/luma.wgsl");
const FXAA: &str = include_str!("shaders/fxaa.wgsl");
const SKYBOX: &str = include_str!("shaders/skybox.wgsl");
const PARTICLE: &str = include_str!("shaders/particle.wgsl");

/// (program, option, WGSL source) of every built-in program.
#[must_use]
pub fn builtin_programs() -> Vec<(&'static str, &'static str, String)> {
    vec![
        (LIGHT_PROGRAM, DEFAULT_OPTION, format!("{LIGHT_COMMON}\n{LIGHT_VOLUME}")),
        (LIGHT_PROGRAM, DIRECTIONAL_OPTION, format!("{LIGHT_COMMON}\n{LIGHT_DIRECTIONAL}")),
        (LUMA_PROGRAM, DEFAULT_OPTION, LUMA.to_string()),
        (FXAA_PROGRAM, DEFAULT_OPTION, FXAA.to_string()),
        (SKYBOX_PROGRAM, DEFAULT_OPTION, SKYBOX.to_string()),
        (PARTICLE_PROGRAM, DEFAULT_OPTION, PARTICLE.to_string()),
    ]
}

/// Link every built-in program. Returns false if any failed to link.
pub fn register_builtin_programs(shading: &mut dyn Shading) -> bool {
    let mut ok = true;
    for (name, option, source) in builtin_programs() {
        ok &= shading
            .compile_and_link(name, option, &ShaderSources::module(source))
            .is_some();
    }
    ok
}

/// Attachments a built-in program draws into.
struct PipelineTarget {
    colors: &'static [TextureFormat],
    depth: Option<TextureFormat>,
    state: RenderState,
}

fn pipeline_target(program: &str, option: &str) -> PipelineTarget {
    const LIGHT: &[TextureFormat] = &[TextureFormat::Rgba8Unorm, TextureFormat::Rgba8Unorm];
    const SCENE: &[TextureFormat] = &[TextureFormat::Rgba8Unorm];
    let overlay = RenderState {
        depth_func: None,
        depth_write: false,
        blend: None,
        front_face: Winding::Ccw,
        cull: CullFace::None,
    };

    match (program, option) {
        // l-buffers have no depth; the back faces cover the volume from inside and outside
        (LIGHT_PROGRAM, DEFAULT_OPTION) => PipelineTarget {
            colors: LIGHT,
            depth: None,
            state: RenderState {
                blend: Some(BlendMode::Additive),
                cull: CullFace::Front,
                ..overlay
            },
        },
        (LIGHT_PROGRAM, _) => PipelineTarget {
            colors: LIGHT,
            depth: None,
            state: RenderState {
                blend: Some(BlendMode::Additive),
                ..overlay
            },
        },
        (LUMA_PROGRAM, _) => PipelineTarget {
            colors: SCENE,
            depth: None,
            state: overlay,
        },
        (SKYBOX_PROGRAM, _) => PipelineTarget {
            colors: SCENE,
            depth: Some(TextureFormat::Depth24Plus),
            state: RenderState {
                depth_func: Some(DepthFunc::LessEqual),
                ..overlay
            },
        },
        (PARTICLE_PROGRAM, _) => PipelineTarget {
            colors: SCENE,
            depth: Some(TextureFormat::Depth24Plus),
            state: RenderState {
                depth_func: Some(DepthFunc::LessEqual),
                blend: Some(BlendMode::PremultipliedAlpha),
                ..overlay
            },
        },
        // FXAA and anything else drawn into the scene buffer
        _ => PipelineTarget {
            colors: SCENE,
            depth: Some(TextureFormat::Depth24Plus),
            state: overlay,
        },
    }
}

/// Build wgpu pipelines for the built-in programs, for targets with
/// `samples` samples per pixel.
pub fn register_builtin_pipelines(gfx: &mut WgpuGraphics, samples: u32) {
    let device = gfx.share().device.clone();
    for (name, option, source) in builtin_programs() {
        let source = if option == DEFAULT_OPTION {
            source
        } else {
            format!(
                "{}{source}",
                options_prelude(&format!("-D OPTION_{}", option.to_ascii_uppercase()))
            )
        };
        let target = pipeline_target(name, option);
        let (primitive, depth_stencil, targets) =
            pipeline_state(target.state, target.colors, target.depth);

        let label = format!("{name}/{option}");
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&label),
            layout: None,
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                targets: &targets,
                compilation_options: Default::default(),
            }),
            primitive,
            depth_stencil,
            multisample: wgpu::MultisampleState {
                count: samples.max(1),
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        let uniform_group = (name != LUMA_PROGRAM).then_some(0);
        let texture_group = (name != PARTICLE_PROGRAM).then_some(1);
        gfx.register_pipeline(
            name,
            option,
            None,
            RegisteredPipeline {
                pipeline,
                uniform_group,
                texture_group,
            },
        );
    }
    log::debug!("registered built-in pipelines ({samples} samples)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::shading::{UniformLocation, WgslShading};

    #[test]
    fn test_builtin_programs_link() {
        let mut shading = WgslShading::new(".");
        assert!(register_builtin_programs(&mut shading));
        assert_eq!(shading.program_count(), 6);
    }

    #[test]
    fn test_builtin_sources_validate() {
        for (name, option, source) in builtin_programs() {
            let source = if option == DEFAULT_OPTION {
                source
            } else {
                format!(
                    "{}{source}",
                    options_prelude(&format!("-D OPTION_{}", option.to_ascii_uppercase()))
                )
            };
            let module = naga::front::wgsl::parse_str(&source)
                .unwrap_or_else(|e| panic!("{name}/{option}: {}", e.emit_to_string(&source)));
            naga::valid::Validator::new(
                naga::valid::ValidationFlags::all(),
                naga::valid::Capabilities::empty(),
            )
            .validate(&module)
            .unwrap_or_else(|e| panic!("{name}/{option}: {e:?}"));
        }
    }

    #[test]
    fn test_light_program_reflection() {
        let mut shading = WgslShading::new(".");
        register_builtin_programs(&mut shading);

        for option in [DEFAULT_OPTION, DIRECTIONAL_OPTION] {
            let info = shading.program(LIGHT_PROGRAM, option).unwrap();
            assert_eq!(info.samplers.get("normal_nuv_buffer"), Some(&0));
            assert_eq!(info.samplers.get("depth_buffer"), Some(&1));
            assert_eq!(
                info.uniforms.get("cam_position"),
                Some(&UniformLocation { group: 0, binding: 0, offset: 192 })
            );
            assert_eq!(info.uniforms.get("projection_ab").map(|l| l.offset), Some(280));
        }
    }

    #[test]
    fn test_particle_block_matches_packing() {
        let mut shading = WgslShading::new(".");
        register_builtin_programs(&mut shading);
        let info = shading.program(PARTICLE_PROGRAM, DEFAULT_OPTION).unwrap();
        let offset = |name: &str| info.uniforms.get(name).map(|l| l.offset);
        assert_eq!(offset("particle_position"), Some(64));
        assert_eq!(offset("particle_size"), Some(76));
        assert_eq!(offset("particle_color"), Some(80));
        assert_eq!(offset("camera_up"), Some(112));
        assert!(info.samplers.is_empty());
    }
}
