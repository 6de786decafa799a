//! Shared wgpu device
//!
//! The graphics and compute backends run on the same logical device so that
//! render targets and application buffers can be bound to kernels directly.
//! Objects registered in the [`InteropObjects`] table are what
//! `create_graphics_interop_buffer` can wrap.

use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::compute::{ApiErrorCode, ComputeError, ComputeResult, GraphicsBufferId};
use crate::rtt::TextureHandle;

/// Graphics objects visible to the compute side.
#[derive(Debug, Default)]
pub struct InteropObjects {
    pub buffers: FxHashMap<GraphicsBufferId, Arc<wgpu::Buffer>>,
    pub textures: FxHashMap<TextureHandle, Arc<wgpu::Texture>>,
}

/// Device, queue and interop table shared by both wgpu backends.
#[derive(Debug, Clone)]
pub struct GpuShare {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub info: wgpu::AdapterInfo,
    pub limits: wgpu::Limits,
    objects: Arc<Mutex<InteropObjects>>,
}

impl GpuShare {
    /// Open the highest-performance adapter without a surface.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceEnumeration`] if no adapter exists or the
    /// device cannot be created.
    pub fn new() -> ComputeResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| ComputeError::DeviceEnumeration("no GPU adapter found".to_string()))?;

        Self::from_adapter(&adapter)
    }

    /// Create the shared device on `adapter`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceEnumeration`] if the device cannot be created.
    pub fn from_adapter(adapter: &wgpu::Adapter) -> ComputeResult<Self> {
        let info = adapter.get_info();
        log::info!("Using GPU: {:?} ({:?})", info.name, info.backend);

        let limits = adapter.limits();
        let features = adapter.features() & wgpu::Features::MAPPABLE_PRIMARY_BUFFERS;
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Lumen Device"),
                required_features: features,
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))
        .map_err(|e| ComputeError::DeviceEnumeration(format!("failed to create device: {e}")))?;

        Ok(Self::from_parts(Arc::new(device), Arc::new(queue), info, limits))
    }

    /// Wrap an existing device, e.g. one owned by a windowing layer.
    #[must_use]
    pub fn from_parts(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        info: wgpu::AdapterInfo,
        limits: wgpu::Limits,
    ) -> Self {
        Self {
            device,
            queue,
            info,
            limits,
            objects: Arc::new(Mutex::new(InteropObjects::default())),
        }
    }

    /// Lock the interop table.
    ///
    /// # Errors
    ///
    /// Returns an `OUT_OF_HOST_MEMORY` error if a previous holder panicked.
    pub fn objects(&self) -> ComputeResult<MutexGuard<'_, InteropObjects>> {
        self.objects.lock().map_err(|_| {
            ComputeError::api(ApiErrorCode::OutOfHostMemory, "interop table lock poisoned")
        })
    }

    /// Make an application buffer available for interop under `id`.
    ///
    /// The buffer needs `STORAGE` usage to be bound to kernels.
    pub fn register_buffer(&self, id: GraphicsBufferId, buffer: Arc<wgpu::Buffer>) {
        match self.objects() {
            Ok(mut objects) => {
                objects.buffers.insert(id, buffer);
            }
            Err(err) => log::error!("register_buffer: {err}"),
        }
    }

    pub fn unregister_buffer(&self, id: GraphicsBufferId) {
        if let Ok(mut objects) = self.objects() {
            objects.buffers.remove(&id);
        }
    }

    /// Block until all submitted work has completed.
    pub fn wait_idle(&self) {
        self.queue.submit([]);
        self.device.poll(wgpu::Maintain::Wait);
    }
}

/// Run `f` inside validation and out-of-memory error scopes.
pub(crate) fn scoped<T>(device: &wgpu::Device, f: impl FnOnce() -> T) -> Result<T, wgpu::Error> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let value = f();
    let oom = pollster::block_on(device.pop_error_scope());
    let validation = pollster::block_on(device.pop_error_scope());
    match oom.or(validation) {
        Some(err) => Err(err),
        None => Ok(value),
    }
}
