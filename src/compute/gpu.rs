//! wgpu compute backend
//!
//! Kernels are WGSL compute pipelines with an automatic bind group layout; kernel
//! argument `i` is `@group(0) @binding(i)`. Plain value arguments become small
//! uniform buffers. wgpu orders `write_buffer` before the next submission, so a
//! write followed by a dispatch behaves like an in-order queue.

use std::sync::Arc;

use wgpu::util::DeviceExt;

use super::backend::{BackendArg, ComputeBackend};
use super::buffer::{BufferFlags, GraphicsObject, ImageFormat, MapAccess, MemoryKind};
use super::device::{DeviceInfo, DeviceKind, Vendor};
use super::error::{ApiErrorCode, ComputeError, ComputeResult};
use super::kernel::{ArgKind, NdRange};
use super::reflect::KernelLayout;
use crate::gpu::{scoped, GpuShare};

const ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

#[derive(Debug, Clone)]
enum Resource {
    Buffer(Arc<wgpu::Buffer>),
    Texture {
        texture: Arc<wgpu::Texture>,
        volume: bool,
    },
}

/// Memory of the wgpu backend.
#[derive(Debug, Clone)]
pub struct WgpuMemory {
    device: usize,
    resource: Resource,
    interop: bool,
}

#[derive(Debug)]
enum BoundArg {
    Memory(Resource),
    Value(wgpu::Buffer),
}

/// Built kernel of the wgpu backend.
#[derive(Debug)]
pub struct WgpuProgram {
    device: usize,
    identifier: String,
    pipeline: wgpu::ComputePipeline,
    bind_layout: Option<wgpu::BindGroupLayout>,
    kinds: Vec<ArgKind>,
    args: Vec<Option<BoundArg>>,
    sampler: wgpu::Sampler,
}

#[derive(Debug)]
struct DeviceSlot {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    limits: wgpu::Limits,
    /// Present when the device is shared with the graphics backend
    share: Option<GpuShare>,
}

/// Compute backend on top of wgpu adapters.
pub struct WgpuCompute {
    instance: Option<wgpu::Instance>,
    adapters: Vec<wgpu::Adapter>,
    share: Option<GpuShare>,
    slots: Vec<Option<DeviceSlot>>,
}

impl WgpuCompute {
    /// Backend enumerating every adapter of the system.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instance: Some(wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            })),
            adapters: Vec::new(),
            share: None,
            slots: Vec::new(),
        }
    }

    /// Backend exposing exactly the device shared with the graphics backend.
    ///
    /// Only this mode supports graphics interop.
    #[must_use]
    pub fn with_share(share: GpuShare) -> Self {
        Self {
            instance: None,
            adapters: Vec::new(),
            share: Some(share),
            slots: Vec::new(),
        }
    }

    fn slot(&self, device: usize) -> ComputeResult<&DeviceSlot> {
        self.slots
            .get(device)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                ComputeError::api(
                    ApiErrorCode::InvalidCommandQueue,
                    format!("no command queue for device #{device}"),
                )
            })
    }

    fn read_bytes(&self, memory: &WgpuMemory, offset: u64, len: u64) -> ComputeResult<Vec<u8>> {
        let slot = self.slot(memory.device)?;
        match &memory.resource {
            Resource::Buffer(buffer) => {
                let start = offset & !(ALIGN - 1);
                let end = (offset + len).next_multiple_of(ALIGN);
                if end > buffer.size() {
                    return Err(ComputeError::api(
                        ApiErrorCode::InvalidValue,
                        format!("read range {offset}..{} exceeds {} bytes", offset + len, buffer.size()),
                    ));
                }
                let staging = slot.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("Compute Readback"),
                    size: end - start,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let mut encoder = slot
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("Compute Readback Encoder"),
                    });
                encoder.copy_buffer_to_buffer(buffer, start, &staging, 0, end - start);
                slot.queue.submit(Some(encoder.finish()));

                let data = map_staging(slot, &staging)?;
                let skip = (offset - start) as usize;
                Ok(data[skip..skip + len as usize].to_vec())
            }
            Resource::Texture { texture, .. } => {
                if offset != 0 {
                    return Err(ComputeError::api(
                        ApiErrorCode::InvalidValue,
                        "image reads start at offset 0",
                    ));
                }
                let bpp = texel_size(texture)?;
                let size = texture.size();
                let row = size.width * bpp;
                let padded_row = row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
                let rows = size.height * size.depth_or_array_layers;

                let staging = slot.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("Compute Image Readback"),
                    size: u64::from(padded_row) * u64::from(rows),
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let mut encoder = slot
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("Compute Image Readback Encoder"),
                    });
                encoder.copy_texture_to_buffer(
                    texture.as_image_copy(),
                    wgpu::ImageCopyBuffer {
                        buffer: &staging,
                        layout: wgpu::ImageDataLayout {
                            offset: 0,
                            bytes_per_row: Some(padded_row),
                            rows_per_image: Some(size.height),
                        },
                    },
                    size,
                );
                slot.queue.submit(Some(encoder.finish()));

                let padded = map_staging(slot, &staging)?;
                let mut data = Vec::with_capacity((row * rows) as usize);
                for chunk in padded.chunks_exact(padded_row as usize) {
                    data.extend_from_slice(&chunk[..row as usize]);
                }
                data.truncate(len as usize);
                Ok(data)
            }
        }
    }

    fn write_bytes(&self, memory: &WgpuMemory, offset: u64, data: &[u8]) -> ComputeResult<()> {
        let slot = self.slot(memory.device)?;
        match &memory.resource {
            Resource::Buffer(buffer) => {
                let end = offset + data.len() as u64;
                if end > buffer.size() {
                    return Err(ComputeError::api(
                        ApiErrorCode::InvalidValue,
                        format!("write range {offset}..{end} exceeds {} bytes", buffer.size()),
                    ));
                }
                if offset % ALIGN == 0 && data.len() as u64 % ALIGN == 0 {
                    slot.queue.write_buffer(buffer, offset, data);
                    return Ok(());
                }
                // unaligned: patch the covering aligned window
                let start = offset & !(ALIGN - 1);
                let aligned_end = end.next_multiple_of(ALIGN);
                let mut window = self.read_bytes(memory, start, aligned_end - start)?;
                let skip = (offset - start) as usize;
                window[skip..skip + data.len()].copy_from_slice(data);
                slot.queue.write_buffer(buffer, start, &window);
                Ok(())
            }
            Resource::Texture { texture, .. } => {
                if offset != 0 {
                    return Err(ComputeError::api(
                        ApiErrorCode::InvalidValue,
                        "image writes start at offset 0",
                    ));
                }
                let bpp = texel_size(texture)?;
                let size = texture.size();
                let expected = u64::from(size.width * bpp)
                    * u64::from(size.height)
                    * u64::from(size.depth_or_array_layers);
                if data.len() as u64 != expected {
                    return Err(ComputeError::api(
                        ApiErrorCode::InvalidValue,
                        format!("image write needs {expected} bytes, got {}", data.len()),
                    ));
                }
                slot.queue.write_texture(
                    texture.as_image_copy(),
                    data,
                    wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(size.width * bpp),
                        rows_per_image: Some(size.height),
                    },
                    size,
                );
                Ok(())
            }
        }
    }
}

impl Default for WgpuCompute {
    fn default() -> Self {
        Self::new()
    }
}

fn map_staging(slot: &DeviceSlot, staging: &wgpu::Buffer) -> ComputeResult<Vec<u8>> {
    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        tx.send(result).ok();
    });
    slot.device.poll(wgpu::Maintain::Wait);

    match rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(ComputeError::api(ApiErrorCode::MapFailure, e.to_string()));
        }
        Err(_) => {
            return Err(ComputeError::api(
                ApiErrorCode::MapFailure,
                "readback callback was dropped",
            ));
        }
    }
    let data = slice.get_mapped_range().to_vec();
    staging.unmap();
    Ok(data)
}

fn texel_size(texture: &wgpu::Texture) -> ComputeResult<u32> {
    texture.format().block_copy_size(None).ok_or_else(|| {
        ComputeError::api(
            ApiErrorCode::ImageFormatNotSupported,
            format!("{:?} cannot be copied", texture.format()),
        )
    })
}

fn texture_format(format: ImageFormat) -> wgpu::TextureFormat {
    match format {
        ImageFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        ImageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        ImageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        ImageFormat::R32Float => wgpu::TextureFormat::R32Float,
    }
}

fn translate(err: wgpu::Error) -> ComputeError {
    match err {
        wgpu::Error::OutOfMemory { .. } => {
            ComputeError::api(ApiErrorCode::MemObjectAllocationFailure, err.to_string())
        }
        wgpu::Error::Validation { description, .. } => {
            ComputeError::api(ApiErrorCode::InvalidOperation, description)
        }
        other => ComputeError::api(ApiErrorCode::OutOfResources, other.to_string()),
    }
}

/// Device description derived from adapter info and limits.
///
/// wgpu exposes neither compute unit counts nor clocks, so the speed estimate is
/// a class proxy: discrete > integrated > virtual, CPU adapters by host threads.
#[must_use]
pub fn adapter_device_info(
    info: &wgpu::AdapterInfo,
    limits: &wgpu::Limits,
    features: wgpu::Features,
) -> DeviceInfo {
    let (kind, units) = match info.device_type {
        wgpu::DeviceType::DiscreteGpu => (DeviceKind::Gpu, 4),
        wgpu::DeviceType::IntegratedGpu => (DeviceKind::Gpu, 2),
        wgpu::DeviceType::VirtualGpu => (DeviceKind::Gpu, 1),
        wgpu::DeviceType::Cpu => (
            DeviceKind::Cpu,
            std::thread::available_parallelism().map_or(1, |n| n.get() as u32),
        ),
        wgpu::DeviceType::Other => (DeviceKind::Other, 1),
    };

    DeviceInfo {
        name: info.name.clone(),
        vendor: Vendor::classify(info.vendor, &info.name),
        kind,
        units,
        clock: 1,
        memory_size: limits.max_buffer_size,
        max_alloc: limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size)),
        max_image_2d: (
            limits.max_texture_dimension_2d,
            limits.max_texture_dimension_2d,
        ),
        max_image_3d: (
            limits.max_texture_dimension_3d,
            limits.max_texture_dimension_3d,
            limits.max_texture_dimension_3d,
        ),
        max_work_group_size: limits.max_compute_invocations_per_workgroup,
        max_work_item_sizes: [
            limits.max_compute_workgroup_size_x,
            limits.max_compute_workgroup_size_y,
            limits.max_compute_workgroup_size_z,
        ],
        extensions: features
            .iter_names()
            .map(|(name, _)| name.to_string())
            .collect(),
    }
}

impl ComputeBackend for WgpuCompute {
    type Memory = WgpuMemory;
    type Program = WgpuProgram;

    fn enumerate_devices(
        &mut self,
        use_platform_devices: bool,
        platform_index: usize,
    ) -> ComputeResult<Vec<DeviceInfo>> {
        if let Some(share) = &self.share {
            return Ok(vec![adapter_device_info(
                &share.info,
                &share.limits,
                share.device.features(),
            )]);
        }

        let instance = self.instance.as_ref().ok_or_else(|| {
            ComputeError::DeviceEnumeration("no wgpu instance".to_string())
        })?;
        let all = instance.enumerate_adapters(wgpu::Backends::all());

        // a "platform" is one wgpu backend (Vulkan, Metal, DX12, GL)
        let mut platforms: Vec<wgpu::Backend> = Vec::new();
        for adapter in &all {
            let backend = adapter.get_info().backend;
            if !platforms.contains(&backend) {
                platforms.push(backend);
            }
        }
        log::debug!("compute platforms: {platforms:?}");

        self.adapters = if use_platform_devices {
            all
        } else {
            let platform = platforms.get(platform_index).copied().ok_or_else(|| {
                ComputeError::DeviceEnumeration(format!(
                    "platform #{platform_index} does not exist ({} available)",
                    platforms.len()
                ))
            })?;
            all.into_iter()
                .filter(|a| a.get_info().backend == platform)
                .collect()
        };

        if self.adapters.is_empty() {
            return Err(ComputeError::DeviceEnumeration(
                "no wgpu adapters found".to_string(),
            ));
        }
        Ok(self
            .adapters
            .iter()
            .map(|a| adapter_device_info(&a.get_info(), &a.limits(), a.features()))
            .collect())
    }

    fn open_queues(&mut self, devices: &[usize]) -> ComputeResult<()> {
        let count = devices.iter().copied().max().map_or(0, |m| m + 1);
        self.slots.resize_with(count.max(self.slots.len()), || None);

        for &idx in devices {
            let slot = if let Some(share) = &self.share {
                DeviceSlot {
                    device: Arc::clone(&share.device),
                    queue: Arc::clone(&share.queue),
                    limits: share.limits.clone(),
                    share: Some(share.clone()),
                }
            } else {
                let adapter = self.adapters.get(idx).ok_or_else(|| {
                    ComputeError::api(ApiErrorCode::InvalidDevice, format!("no device #{idx}"))
                })?;
                let limits = adapter.limits();
                let features = adapter.features() & wgpu::Features::MAPPABLE_PRIMARY_BUFFERS;
                let (device, queue) = pollster::block_on(adapter.request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("Compute Device"),
                        required_features: features,
                        required_limits: limits.clone(),
                        memory_hints: wgpu::MemoryHints::default(),
                    },
                    None,
                ))
                .map_err(|e| ComputeError::api(ApiErrorCode::DeviceNotAvailable, e.to_string()))?;
                device.on_uncaptured_error(Box::new(|err| {
                    log::error!("uncaptured compute device error: {err}");
                }));
                DeviceSlot {
                    device: Arc::new(device),
                    queue: Arc::new(queue),
                    limits,
                    share: None,
                }
            };
            self.slots[idx] = Some(slot);
        }
        Ok(())
    }

    fn flush(&mut self, device: usize) -> ComputeResult<()> {
        let slot = self.slot(device)?;
        slot.queue.submit([]);
        slot.device.poll(wgpu::Maintain::Poll);
        Ok(())
    }

    fn finish(&mut self, device: usize) -> ComputeResult<()> {
        let slot = self.slot(device)?;
        slot.queue.submit([]);
        slot.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn fixed_workgroup_size(&self) -> bool {
        true
    }

    fn create_buffer(
        &mut self,
        device: usize,
        size: u64,
        flags: BufferFlags,
    ) -> ComputeResult<WgpuMemory> {
        let slot = self.slot(device)?;
        if flags.contains(BufferFlags::USE_HOST_MEMORY)
            && !slot
                .device
                .features()
                .contains(wgpu::Features::MAPPABLE_PRIMARY_BUFFERS)
        {
            log::debug!("host-memory buffers are unavailable, using device memory");
        }

        let buffer = scoped(&slot.device, || {
            slot.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Compute Buffer"),
                size: size.next_multiple_of(ALIGN),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::UNIFORM
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })
        .map_err(translate)?;

        Ok(WgpuMemory {
            device,
            resource: Resource::Buffer(Arc::new(buffer)),
            interop: false,
        })
    }

    fn create_image(
        &mut self,
        device: usize,
        kind: &MemoryKind,
        _flags: BufferFlags,
    ) -> ComputeResult<WgpuMemory> {
        let slot = self.slot(device)?;
        let (size, dimension, format) = match *kind {
            MemoryKind::Image2d {
                width,
                height,
                format,
            } => (
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                wgpu::TextureDimension::D2,
                format,
            ),
            MemoryKind::Image3d {
                width,
                height,
                depth,
                format,
            } => (
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: depth,
                },
                wgpu::TextureDimension::D3,
                format,
            ),
            _ => {
                return Err(ComputeError::api(
                    ApiErrorCode::InvalidValue,
                    "create_image requires an image kind",
                ));
            }
        };

        let texture = scoped(&slot.device, || {
            slot.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("Compute Image"),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension,
                format: texture_format(format),
                usage: wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        })
        .map_err(translate)?;

        Ok(WgpuMemory {
            device,
            resource: Resource::Texture {
                texture: Arc::new(texture),
                volume: dimension == wgpu::TextureDimension::D3,
            },
            interop: false,
        })
    }

    fn import_graphics(
        &mut self,
        device: usize,
        object: &GraphicsObject,
        _flags: BufferFlags,
    ) -> ComputeResult<(WgpuMemory, u64)> {
        let slot = self.slot(device)?;
        let share = slot.share.as_ref().ok_or_else(|| {
            ComputeError::api(
                ApiErrorCode::InvalidContext,
                "device is not shared with the graphics backend",
            )
        })?;
        let objects = share.objects()?;
        let missing = || {
            ComputeError::api(
                ApiErrorCode::InvalidGlObject,
                format!("{object:?} is not registered for interop"),
            )
        };

        let (resource, size) = match object {
            GraphicsObject::Buffer { id, .. } => {
                let buffer = objects.buffers.get(id).cloned().ok_or_else(missing)?;
                let size = buffer.size();
                (Resource::Buffer(buffer), size)
            }
            GraphicsObject::Texture2d(handle)
            | GraphicsObject::Renderbuffer(handle)
            | GraphicsObject::Texture3d(handle) => {
                let texture = objects.textures.get(handle).cloned().ok_or_else(missing)?;
                let extent = texture.size();
                let bpp = texture.format().block_copy_size(None).unwrap_or(4);
                let size = u64::from(extent.width)
                    * u64::from(extent.height)
                    * u64::from(extent.depth_or_array_layers)
                    * u64::from(bpp);
                let volume = texture.dimension() == wgpu::TextureDimension::D3;
                (Resource::Texture { texture, volume }, size)
            }
        };

        Ok((
            WgpuMemory {
                device,
                resource,
                interop: true,
            },
            size,
        ))
    }

    fn release_memory(&mut self, memory: WgpuMemory) {
        // wgpu keeps the allocation alive until submitted work referencing it is done
        drop(memory);
    }

    fn write(
        &mut self,
        memory: &WgpuMemory,
        offset: u64,
        data: &[u8],
        blocking: bool,
    ) -> ComputeResult<()> {
        self.write_bytes(memory, offset, data)?;
        if blocking {
            self.finish(memory.device)?;
        }
        Ok(())
    }

    fn read(
        &mut self,
        memory: &WgpuMemory,
        offset: u64,
        dst: &mut [u8],
        _blocking: bool,
    ) -> ComputeResult<()> {
        // the readback copy is ordered after everything submitted so far
        let data = self.read_bytes(memory, offset, dst.len() as u64)?;
        if data.len() != dst.len() {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidValue,
                format!("read of {} bytes exceeds the image ({} bytes)", dst.len(), data.len()),
            ));
        }
        dst.copy_from_slice(&data);
        Ok(())
    }

    fn map(
        &mut self,
        memory: &WgpuMemory,
        _access: MapAccess,
        _blocking: bool,
    ) -> ComputeResult<Vec<u8>> {
        let len = match &memory.resource {
            Resource::Buffer(buffer) => buffer.size(),
            Resource::Texture { texture, .. } => {
                let size = texture.size();
                u64::from(size.width * texel_size(texture)?)
                    * u64::from(size.height)
                    * u64::from(size.depth_or_array_layers)
            }
        };
        self.read_bytes(memory, 0, len)
    }

    fn unmap(&mut self, memory: &WgpuMemory, access: MapAccess, data: &[u8]) -> ComputeResult<()> {
        if access.writes() {
            self.write_bytes(memory, 0, data)?;
        }
        Ok(())
    }

    fn acquire_graphics(&mut self, memory: &WgpuMemory) -> ComputeResult<()> {
        if !memory.interop {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidGlObject,
                "memory object is not backed by a graphics object",
            ));
        }
        // same device and queue: wgpu orders graphics and compute use itself
        log::trace!("acquired graphics object on device #{}", memory.device);
        Ok(())
    }

    fn release_graphics(&mut self, memory: &WgpuMemory) -> ComputeResult<()> {
        if !memory.interop {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidGlObject,
                "memory object is not backed by a graphics object",
            ));
        }
        log::trace!("released graphics object on device #{}", memory.device);
        Ok(())
    }

    fn compile(
        &mut self,
        device: usize,
        identifier: &str,
        source: &str,
        entry_point: &str,
        layout: &KernelLayout,
    ) -> ComputeResult<WgpuProgram> {
        let slot = self.slot(device)?;
        let (pipeline, bind_layout) = scoped(&slot.device, || {
            let module = slot
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(identifier),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                });
            let pipeline = slot
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(identifier),
                    layout: None,
                    module: &module,
                    entry_point: Some(entry_point),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                });
            let bind_layout =
                (!layout.args.is_empty()).then(|| pipeline.get_bind_group_layout(0));
            (pipeline, bind_layout)
        })
        .map_err(|err| ComputeError::Compilation {
            identifier: identifier.to_string(),
            log: err.to_string(),
        })?;

        let sampler = slot.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Kernel Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(WgpuProgram {
            device,
            identifier: identifier.to_string(),
            pipeline,
            bind_layout,
            kinds: layout.args.clone(),
            args: layout.args.iter().map(|_| None).collect(),
            sampler,
        })
    }

    fn destroy_program(&mut self, program: WgpuProgram) {
        log::trace!("destroying compute pipeline \"{}\"", program.identifier);
    }

    fn set_arg(
        &mut self,
        program: &mut WgpuProgram,
        index: u32,
        arg: BackendArg<'_, WgpuMemory>,
    ) -> ComputeResult<()> {
        let slot = self.slot(program.device)?;
        if index as usize >= program.args.len() {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidArgIndex,
                format!("no argument #{index}"),
            ));
        }

        let bound = match arg {
            BackendArg::Memory(memory) => {
                if memory.device != program.device {
                    return Err(ComputeError::api(
                        ApiErrorCode::InvalidMemObject,
                        "memory object belongs to another device",
                    ));
                }
                BoundArg::Memory(memory.resource.clone())
            }
            BackendArg::Value(bytes) => {
                // uniform bindings are sized in 16-byte steps
                let mut contents = bytes.to_vec();
                contents.resize(bytes.len().next_multiple_of(16).max(16), 0);
                BoundArg::Value(slot.device.create_buffer_init(
                    &wgpu::util::BufferInitDescriptor {
                        label: Some("Kernel Value"),
                        contents: &contents,
                        usage: wgpu::BufferUsages::UNIFORM,
                    },
                ))
            }
        };
        program.args[index as usize] = Some(bound);
        Ok(())
    }

    fn dispatch(
        &mut self,
        program: &WgpuProgram,
        global: &NdRange,
        local: &NdRange,
    ) -> ComputeResult<()> {
        let slot = self.slot(program.device)?;
        let groups = global.groups(local);
        let max_groups = slot.limits.max_compute_workgroups_per_dimension;
        if groups.iter().any(|g| *g > max_groups) {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidGlobalWorkSize,
                format!("{groups:?} work-groups exceed the per-axis limit {max_groups}"),
            ));
        }

        let views: Vec<Option<wgpu::TextureView>> = program
            .args
            .iter()
            .map(|arg| match arg {
                Some(BoundArg::Memory(Resource::Texture { texture, volume })) => {
                    Some(texture.create_view(&wgpu::TextureViewDescriptor {
                        dimension: Some(if *volume {
                            wgpu::TextureViewDimension::D3
                        } else {
                            wgpu::TextureViewDimension::D2
                        }),
                        ..Default::default()
                    }))
                }
                _ => None,
            })
            .collect();

        let mut entries = Vec::with_capacity(program.args.len());
        for (idx, arg) in program.args.iter().enumerate() {
            let resource = match (arg, &views[idx], program.kinds[idx]) {
                (Some(BoundArg::Memory(Resource::Buffer(buffer))), _, _) => {
                    buffer.as_entire_binding()
                }
                (Some(BoundArg::Value(buffer)), _, _) => buffer.as_entire_binding(),
                (Some(BoundArg::Memory(Resource::Texture { .. })), Some(view), _) => {
                    wgpu::BindingResource::TextureView(view)
                }
                (None, _, ArgKind::Sampler) => wgpu::BindingResource::Sampler(&program.sampler),
                _ => {
                    return Err(ComputeError::api(
                        ApiErrorCode::InvalidKernelArgs,
                        format!("argument #{idx} of \"{}\" is not set", program.identifier),
                    ));
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: idx as u32,
                resource,
            });
        }

        scoped(&slot.device, || {
            let bind_group = program.bind_layout.as_ref().map(|layout| {
                slot.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&program.identifier),
                    layout,
                    entries: &entries,
                })
            });

            let mut encoder = slot
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Compute Encoder"),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(&program.identifier),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&program.pipeline);
                if let Some(bind_group) = &bind_group {
                    pass.set_bind_group(0, bind_group, &[]);
                }
                pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
            }
            slot.queue.submit(Some(encoder.finish()));
        })
        .map_err(translate)
    }
}
