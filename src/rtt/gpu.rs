//! wgpu graphics backend
//!
//! Render passes are opened lazily: binding a framebuffer only records which
//! views to draw into, and the pass starts with the first clear or draw.
//! Pipelines are created by the application and registered per program
//! variant, optionally per render state, since wgpu bakes depth, blend and
//! winding into the pipeline.

use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashMap, FxHashSet};
use wgpu::util::DeviceExt;

use super::backend::{
    validate_framebuffer, ClearMask, CullFace, DepthFunc, FilterMode, FramebufferBinding,
    FramebufferStatus, GraphicsBackend, GraphicsError, GraphicsLimits, RenderState, TextureDesc,
    TextureFormat, TextureHandle, Winding, WrapMode,
};
use crate::gpu::{scoped, GpuShare};
use crate::scene::DrawCall;

/// A render pipeline for one program variant.
#[derive(Debug)]
pub struct RegisteredPipeline {
    pub pipeline: wgpu::RenderPipeline,
    /// Group whose binding 0 receives the draw's packed uniforms.
    pub uniform_group: Option<u32>,
    /// Group receiving texture unit `n` at binding `2n` and its sampler at `2n + 1`.
    pub texture_group: Option<u32>,
}

#[derive(Debug)]
struct GpuTexture {
    texture: Arc<wgpu::Texture>,
    view: wgpu::TextureView,
    desc: TextureDesc,
}

type PipelineKey = (String, String, Option<RenderState>);

/// Graphics backend on the shared wgpu device.
pub struct WgpuGraphics {
    // the pass must be dropped before the encoder it records into
    pass: Option<wgpu::RenderPass<'static>>,
    encoder: Option<wgpu::CommandEncoder>,
    share: GpuShare,
    limits: GraphicsLimits,
    textures: FxHashMap<TextureHandle, GpuTexture>,
    next_texture: u64,
    pipelines: FxHashMap<PipelineKey, RegisteredPipeline>,
    samplers: FxHashMap<(FilterMode, [WrapMode; 2]), Arc<wgpu::Sampler>>,
    bound: Option<FramebufferBinding>,
    status: FramebufferStatus,
    surface: Option<wgpu::TextureView>,
    state: RenderState,
    viewport: (u32, u32, u32, u32),
    pending_clear: Option<(ClearMask, [f32; 4], f32)>,
    missing: FxHashSet<(String, String)>,
    errors: Arc<Mutex<Vec<GraphicsError>>>,
}

impl WgpuGraphics {
    /// Backend on `share`, collecting uncaptured device errors for
    /// [`take_errors`](GraphicsBackend::take_errors).
    #[must_use]
    pub fn new(share: GpuShare) -> Self {
        let errors: Arc<Mutex<Vec<GraphicsError>>> = Arc::default();
        let sink = Arc::clone(&errors);
        share.device.on_uncaptured_error(Box::new(move |err| {
            let decoded = decode(err);
            log::debug!("uncaptured device error: {decoded}");
            if let Ok(mut errors) = sink.lock() {
                errors.push(decoded);
            }
        }));

        let limits = GraphicsLimits {
            max_texture_size: share.limits.max_texture_dimension_2d,
            // 4 is the only count every renderable format guarantees
            max_samples: 4,
            max_color_attachments: share.limits.max_color_attachments,
            coverage_samples: false,
        };

        Self {
            pass: None,
            encoder: None,
            share,
            limits,
            textures: FxHashMap::default(),
            next_texture: 1,
            pipelines: FxHashMap::default(),
            samplers: FxHashMap::default(),
            bound: None,
            status: FramebufferStatus::Complete,
            surface: None,
            state: RenderState::default(),
            viewport: (0, 0, 0, 0),
            pending_clear: None,
            missing: FxHashSet::default(),
            errors,
        }
    }

    #[must_use]
    pub fn share(&self) -> &GpuShare {
        &self.share
    }

    /// View drawn into while the default framebuffer is bound, e.g. the
    /// current swapchain image. Without one, default-framebuffer draws are dropped.
    pub fn set_surface_view(&mut self, view: Option<wgpu::TextureView>) {
        self.end_pass();
        self.surface = view;
    }

    /// Register `pipeline` for `program`/`option`. A pipeline registered with
    /// a `state` is preferred while that state is active.
    pub fn register_pipeline(
        &mut self,
        program: &str,
        option: &str,
        state: Option<RenderState>,
        pipeline: RegisteredPipeline,
    ) {
        self.missing.remove(&(program.to_string(), option.to_string()));
        self.pipelines
            .insert((program.to_string(), option.to_string(), state), pipeline);
    }

    /// The wgpu texture behind `handle`.
    #[must_use]
    pub fn wgpu_texture(&self, handle: TextureHandle) -> Option<&wgpu::Texture> {
        self.textures.get(&handle).map(|t| t.texture.as_ref())
    }

    fn end_pass(&mut self) {
        self.pass = None;
    }

    /// Open a pass on the bound framebuffer unless one is open. Returns false
    /// if there is nothing to draw into.
    fn ensure_pass(&mut self) -> bool {
        if self.pass.is_some() {
            return true;
        }
        let (mask, color, depth) = self
            .pending_clear
            .take()
            .unwrap_or((ClearMask::empty(), [0.0; 4], 1.0));

        let color_load = if mask.contains(ClearMask::COLOR) {
            wgpu::LoadOp::Clear(wgpu::Color {
                r: f64::from(color[0]),
                g: f64::from(color[1]),
                b: f64::from(color[2]),
                a: f64::from(color[3]),
            })
        } else {
            wgpu::LoadOp::Load
        };
        let depth_load = if mask.contains(ClearMask::DEPTH) {
            wgpu::LoadOp::Clear(depth)
        } else {
            wgpu::LoadOp::Load
        };

        let encoder = self.encoder.get_or_insert_with(|| {
            self.share
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Lumen Graphics Encoder"),
                })
        });

        let (color_views, depth_view): (Vec<&wgpu::TextureView>, Option<&wgpu::TextureView>) =
            match &self.bound {
                Some(binding) => (
                    binding
                        .color
                        .iter()
                        .filter_map(|t| self.textures.get(t).map(|t| &t.view))
                        .collect(),
                    binding
                        .depth
                        .and_then(|t| self.textures.get(&t).map(|t| &t.view)),
                ),
                None => match &self.surface {
                    Some(view) => (vec![view], None),
                    None => return false,
                },
            };
        if color_views.is_empty() && depth_view.is_none() {
            return false;
        }

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = color_views
            .into_iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: color_load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();

        let pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Lumen Render Pass"),
            color_attachments: &color_attachments,
            depth_stencil_attachment: depth_view.map(|view| wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        let mut pass = pass.forget_lifetime();

        let (x, y, width, height) = self.viewport;
        if width > 0 && height > 0 {
            pass.set_viewport(x as f32, y as f32, width as f32, height as f32, 0.0, 1.0);
        }
        self.pass = Some(pass);
        true
    }

    fn sampler(&mut self, filter: FilterMode, wrap: [WrapMode; 2]) -> Arc<wgpu::Sampler> {
        let device = &self.share.device;
        self.samplers
            .entry((filter, wrap))
            .or_insert_with(|| {
                let (mag, min, mip) = match filter {
                    FilterMode::Point => (
                        wgpu::FilterMode::Nearest,
                        wgpu::FilterMode::Nearest,
                        wgpu::FilterMode::Nearest,
                    ),
                    FilterMode::Linear | FilterMode::Bilinear => (
                        wgpu::FilterMode::Linear,
                        wgpu::FilterMode::Linear,
                        wgpu::FilterMode::Nearest,
                    ),
                    FilterMode::Trilinear => (
                        wgpu::FilterMode::Linear,
                        wgpu::FilterMode::Linear,
                        wgpu::FilterMode::Linear,
                    ),
                };
                Arc::new(device.create_sampler(&wgpu::SamplerDescriptor {
                    label: Some("render_target_sampler"),
                    address_mode_u: address_mode(wrap[0]),
                    address_mode_v: address_mode(wrap[1]),
                    address_mode_w: wgpu::AddressMode::ClampToEdge,
                    mag_filter: mag,
                    min_filter: min,
                    mipmap_filter: mip,
                    ..Default::default()
                }))
            })
            .clone()
    }
}

impl GraphicsBackend for WgpuGraphics {
    fn limits(&self) -> GraphicsLimits {
        self.limits
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle, GraphicsError> {
        let format = wgpu_format(desc.format);
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if desc.samples == 1 {
            usage |= wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
            if desc.sampled {
                usage |= wgpu::TextureUsages::TEXTURE_BINDING;
            }
            if storage_capable(desc.format) {
                usage |= wgpu::TextureUsages::STORAGE_BINDING;
            }
        }

        let device = Arc::clone(&self.share.device);
        let texture = scoped(&device, || {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: desc.samples.max(1),
                dimension: wgpu::TextureDimension::D2,
                format,
                usage,
                view_formats: &[],
            })
        })
        .map_err(decode)?;

        let texture = Arc::new(texture);
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = TextureHandle::from_raw(self.next_texture);
        self.next_texture += 1;

        if desc.samples == 1 && !desc.format.is_depth() {
            match self.share.objects() {
                Ok(mut objects) => {
                    objects.textures.insert(handle, Arc::clone(&texture));
                }
                Err(err) => log::warn!("texture \"{}\" not shared with compute: {err}", desc.label),
            }
        }

        self.textures.insert(
            handle,
            GpuTexture {
                texture,
                view,
                desc: desc.clone(),
            },
        );
        Ok(handle)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if self
            .bound
            .as_ref()
            .is_some_and(|b| b.color.contains(&texture) || b.depth == Some(texture))
        {
            self.end_pass();
        }
        if let Ok(mut objects) = self.share.objects() {
            objects.textures.remove(&texture);
        }
        // in-flight work keeps the allocation alive until it completes
        if self.textures.remove(&texture).is_none() {
            log::warn!("destroy_texture: unknown texture {}", texture.raw());
        }
    }

    fn bind_framebuffer(&mut self, binding: Option<&FramebufferBinding>) {
        self.end_pass();
        self.pending_clear = None;
        self.bound = binding.cloned();
        self.status = match &self.bound {
            None => FramebufferStatus::Complete,
            Some(binding) => {
                validate_framebuffer(binding, &self.limits, |t| self.textures.get(&t).map(|t| &t.desc))
            }
        };
    }

    fn framebuffer_status(&self) -> FramebufferStatus {
        self.status
    }

    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.viewport = (x, y, width, height);
        if let Some(pass) = self.pass.as_mut() {
            pass.set_viewport(x as f32, y as f32, width as f32, height as f32, 0.0, 1.0);
        }
    }

    fn clear(&mut self, mask: ClearMask, color: [f32; 4], depth: f32) {
        self.end_pass();
        self.pending_clear = Some((mask, color, depth));
        // open now so the clear happens even without draws
        self.ensure_pass();
    }

    fn resolve(&mut self, source: TextureHandle, destination: TextureHandle) {
        self.end_pass();
        let (Some(src), Some(dst)) = (self.textures.get(&source), self.textures.get(&destination))
        else {
            log::warn!("resolve: unknown texture {} or {}", source.raw(), destination.raw());
            return;
        };
        let encoder = self.encoder.get_or_insert_with(|| {
            self.share
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Lumen Graphics Encoder"),
                })
        });
        // an empty pass with a resolve target performs the resolve
        drop(encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Lumen Resolve"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &src.view,
                resolve_target: Some(&dst.view),
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        }));
    }

    fn set_state(&mut self, state: RenderState) {
        self.state = state;
    }

    fn state(&self) -> RenderState {
        self.state
    }

    fn draw(&mut self, call: &DrawCall) {
        let stated = (call.program.clone(), call.option.clone(), Some(self.state));
        let plain = (call.program.clone(), call.option.clone(), None);
        if !self.pipelines.contains_key(&stated) && !self.pipelines.contains_key(&plain) {
            if self.missing.insert((call.program.clone(), call.option.clone())) {
                log::debug!("no pipeline for {}/{}, draws skipped", call.program, call.option);
            }
            return;
        }
        if !self.ensure_pass() {
            return;
        }

        let samplers: Vec<(u32, Arc<wgpu::Sampler>)> = call
            .textures
            .iter()
            .filter_map(|(unit, tex)| {
                let desc = self.textures.get(tex).map(|t| (t.desc.filter, t.desc.wrap))?;
                Some((*unit, self.sampler(desc.0, desc.1)))
            })
            .collect();

        let Some(registered) = self.pipelines.get(&stated).or_else(|| self.pipelines.get(&plain))
        else {
            return;
        };
        let device = &self.share.device;

        let uniform_group = registered.uniform_group.map(|group| {
            let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Draw Uniforms"),
                contents: &call.uniform_block(),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("draw_uniform_bind_group"),
                layout: &registered.pipeline.get_bind_group_layout(group),
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                }],
            });
            (group, bind_group)
        });

        let texture_group = registered.texture_group.map(|group| {
            let mut entries = Vec::new();
            for (unit, texture) in &call.textures {
                let Some(gpu) = self.textures.get(texture) else {
                    continue;
                };
                let Some((_, sampler)) = samplers.iter().find(|(u, _)| u == unit) else {
                    continue;
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: unit * 2,
                    resource: wgpu::BindingResource::TextureView(&gpu.view),
                });
                entries.push(wgpu::BindGroupEntry {
                    binding: unit * 2 + 1,
                    resource: wgpu::BindingResource::Sampler(&**sampler),
                });
            }
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("draw_texture_bind_group"),
                layout: &registered.pipeline.get_bind_group_layout(group),
                entries: &entries,
            });
            (group, bind_group)
        });

        let Some(pass) = self.pass.as_mut() else {
            return;
        };
        pass.set_pipeline(&registered.pipeline);
        for (group, bind_group) in uniform_group.iter().chain(texture_group.iter()) {
            pass.set_bind_group(*group, bind_group, &[]);
        }
        pass.draw(
            0..call.primitive.vertex_count(),
            0..call.primitive.instance_count(),
        );
    }

    fn submit(&mut self) {
        self.end_pass();
        if let Some(encoder) = self.encoder.take() {
            self.share.queue.submit(Some(encoder.finish()));
        }
    }

    fn finish(&mut self) {
        self.submit();
        self.share.device.poll(wgpu::Maintain::Wait);
    }

    fn take_errors(&mut self) -> Vec<GraphicsError> {
        match self.errors.lock() {
            Ok(mut errors) => std::mem::take(&mut *errors),
            Err(_) => vec![GraphicsError::Other("error sink poisoned".to_string())],
        }
    }
}

impl Drop for WgpuGraphics {
    fn drop(&mut self) {
        self.submit();
        if let Ok(mut objects) = self.share.objects() {
            for handle in self.textures.keys() {
                objects.textures.remove(handle);
            }
        }
    }
}

/// Translate a wgpu device error into the graphics error taxonomy.
#[must_use]
pub fn decode(err: wgpu::Error) -> GraphicsError {
    match err {
        wgpu::Error::OutOfMemory { .. } => GraphicsError::OutOfMemory(err.to_string()),
        wgpu::Error::Validation { description, .. } => {
            let lower = description.to_ascii_lowercase();
            if lower.contains("attachment") || lower.contains("render pass") {
                GraphicsError::InvalidFramebufferOperation(description)
            } else if lower.contains("format") || lower.contains("enum") {
                GraphicsError::InvalidEnum(description)
            } else if lower.contains("size") || lower.contains("limit") || lower.contains("range") {
                GraphicsError::InvalidValue(description)
            } else {
                GraphicsError::InvalidOperation(description)
            }
        }
        other => GraphicsError::Other(other.to_string()),
    }
}

/// wgpu equivalent of a depth function.
#[must_use]
pub const fn compare_function(func: DepthFunc) -> wgpu::CompareFunction {
    match func {
        DepthFunc::Never => wgpu::CompareFunction::Never,
        DepthFunc::Less => wgpu::CompareFunction::Less,
        DepthFunc::Equal => wgpu::CompareFunction::Equal,
        DepthFunc::LessEqual => wgpu::CompareFunction::LessEqual,
        DepthFunc::Greater => wgpu::CompareFunction::Greater,
        DepthFunc::NotEqual => wgpu::CompareFunction::NotEqual,
        DepthFunc::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        DepthFunc::Always => wgpu::CompareFunction::Always,
    }
}

/// Pipeline state for `state`, for building pipelines to register.
#[must_use]
pub fn pipeline_state(
    state: RenderState,
    color: &[TextureFormat],
    depth: Option<TextureFormat>,
) -> (wgpu::PrimitiveState, Option<wgpu::DepthStencilState>, Vec<Option<wgpu::ColorTargetState>>) {
    let primitive = wgpu::PrimitiveState {
        front_face: match state.front_face {
            Winding::Ccw => wgpu::FrontFace::Ccw,
            Winding::Cw => wgpu::FrontFace::Cw,
        },
        cull_mode: match state.cull {
            CullFace::Back => Some(wgpu::Face::Back),
            CullFace::Front => Some(wgpu::Face::Front),
            CullFace::None => None,
        },
        ..Default::default()
    };

    let depth_stencil = depth.map(|format| wgpu::DepthStencilState {
        format: wgpu_format(format),
        depth_write_enabled: state.depth_write,
        depth_compare: state
            .depth_func
            .map_or(wgpu::CompareFunction::Always, compare_function),
        stencil: wgpu::StencilState::default(),
        bias: wgpu::DepthBiasState::default(),
    });

    let blend = state.blend.map(|mode| {
        let color = match mode {
            super::backend::BlendMode::Additive => wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::OneMinusSrc,
                operation: wgpu::BlendOperation::Add,
            },
            super::backend::BlendMode::PremultipliedAlpha => wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                operation: wgpu::BlendOperation::Add,
            },
        };
        wgpu::BlendState { color, alpha: color }
    });

    let targets = color
        .iter()
        .map(|&format| {
            Some(wgpu::ColorTargetState {
                format: wgpu_format(format),
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })
        })
        .collect();

    (primitive, depth_stencil, targets)
}

#[must_use]
pub const fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        TextureFormat::Depth24Plus => wgpu::TextureFormat::Depth24Plus,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

const fn storage_capable(format: TextureFormat) -> bool {
    matches!(
        format,
        TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba16Float
            | TextureFormat::Rgba32Float
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
    )
}

const fn address_mode(wrap: WrapMode) -> wgpu::AddressMode {
    match wrap {
        WrapMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt::BlendMode;

    #[test]
    fn test_pipeline_state_translation() {
        let state = RenderState {
            depth_func: Some(DepthFunc::Equal),
            depth_write: false,
            blend: Some(BlendMode::Additive),
            front_face: Winding::Cw,
            cull: CullFace::Front,
        };
        let (primitive, depth, targets) = pipeline_state(
            state,
            &[TextureFormat::Rgba16Float, TextureFormat::Rgba16Float],
            Some(TextureFormat::Depth24Plus),
        );

        assert_eq!(primitive.front_face, wgpu::FrontFace::Cw);
        assert_eq!(primitive.cull_mode, Some(wgpu::Face::Front));
        let depth = depth.unwrap();
        assert_eq!(depth.depth_compare, wgpu::CompareFunction::Equal);
        assert!(!depth.depth_write_enabled);
        assert_eq!(targets.len(), 2);
        let blend = targets[0].as_ref().unwrap().blend.unwrap();
        assert_eq!(blend.color.dst_factor, wgpu::BlendFactor::OneMinusSrc);
    }

    #[test]
    fn test_depth_test_off_compares_always() {
        let state = RenderState {
            depth_func: None,
            ..RenderState::default()
        };
        let (_, depth, _) = pipeline_state(state, &[], Some(TextureFormat::Depth32Float));
        assert_eq!(depth.unwrap().depth_compare, wgpu::CompareFunction::Always);
    }

    #[test]
    fn test_storage_usage_only_for_storage_formats() {
        assert!(storage_capable(TextureFormat::Rgba16Float));
        assert!(!storage_capable(TextureFormat::Rg16Float));
        assert!(!storage_capable(TextureFormat::Depth24Plus));
    }
}
