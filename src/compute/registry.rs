//! Buffer and kernel registries
//!
//! Memory objects and kernels live in two arenas. Bindings are recorded on both
//! sides as index sets: a memory object knows which `(kernel, argument)` pairs use
//! it, a kernel knows which buffer backs each argument. Every public operation
//! logs failures and returns `None`/`false`; the last error stays available
//! through [`ComputeRegistry::last_error`].
//!
//! The registry is not internally synchronized. Calls must come from one thread
//! (or be serialized by the caller).

use rustc_hash::FxHashMap;

use super::backend::{BackendArg, ComputeBackend};
use super::buffer::{
    BufferFlags, BufferHandle, GraphicsObject, ImageFormat, MapAccess, MappedRegion, MemoryKind,
    MemoryObject,
};
use super::context::{options_prelude, ComputeContext};
use super::error::{ApiErrorCode, ComputeError, ComputeResult};
use super::kernel::{
    compute_local_range, ArgKind, Kernel, KernelArg, KernelHandle, KernelSource, KernelState, NdRange,
};
use super::reflect;
use crate::core::Pool;

/// Tracks compute memory objects and kernels on top of a [`ComputeContext`].
pub struct ComputeRegistry<B: ComputeBackend> {
    context: ComputeContext<B>,
    buffers: Pool<MemoryObject<B::Memory>>,
    kernels: Pool<Kernel<B::Program>>,
    identifiers: FxHashMap<String, KernelHandle>,
    /// Kernel targeted by `set_arg`/`run_kernel`
    current: Option<KernelHandle>,
    last_error: Option<ComputeError>,
    bytes_allocated: u64,
}

impl<B: ComputeBackend> ComputeRegistry<B> {
    #[must_use]
    pub fn new(context: ComputeContext<B>) -> Self {
        Self {
            context,
            buffers: Pool::new(),
            kernels: Pool::new(),
            identifiers: FxHashMap::default(),
            current: None,
            last_error: None,
            bytes_allocated: 0,
        }
    }

    #[must_use]
    pub fn context(&self) -> &ComputeContext<B> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ComputeContext<B> {
        &mut self.context
    }

    /// The most recent error reported by any registry operation.
    #[must_use]
    pub fn last_error(&self) -> Option<&ComputeError> {
        self.last_error.as_ref()
    }

    /// Block until the active device's queue is idle.
    pub fn finish(&mut self) -> bool {
        self.context.finish()
    }

    /// Submit pending commands of the active device.
    pub fn flush(&mut self) -> bool {
        self.context.flush()
    }

    fn report(&mut self, op: &str, err: ComputeError) {
        match &err {
            ComputeError::Api { .. } | ComputeError::Compilation { .. } => {
                log::error!("{op}: {err}");
            }
            _ => log::error!("{op}: {err} ({})", err.code()),
        }
        self.last_error = Some(err);
    }

    fn finish_op<T>(&mut self, op: &str, result: ComputeResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.report(op, err);
                None
            }
        }
    }

    // ========================================================================
    // Memory objects
    // ========================================================================

    /// Allocate a buffer on the active device.
    ///
    /// `data` is written at creation with `INITIAL_COPY` and staged for every
    /// dispatch with `COPY_ON_USE`.
    pub fn create_buffer(
        &mut self,
        flags: BufferFlags,
        size: u64,
        data: Option<&[u8]>,
    ) -> Option<BufferHandle> {
        let result = self.try_create_buffer(flags, size, data);
        self.finish_op("create_buffer", result)
    }

    fn try_create_buffer(
        &mut self,
        flags: BufferFlags,
        size: u64,
        data: Option<&[u8]>,
    ) -> ComputeResult<BufferHandle> {
        let device = self.context.active_device();
        let limit = self.context.active_device_info().max_alloc;
        if size == 0 {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidBufferSize,
                "buffer size must be non-zero",
            ));
        }
        if size > limit {
            return Err(ComputeError::Allocation {
                requested: size,
                limit,
            });
        }
        check_initial_data(data, size)?;

        let memory = self.context.backend_mut().create_buffer(device, size, flags)?;
        let object = MemoryObject::new(device, memory, MemoryKind::Buffer, flags, size);
        self.insert_memory_object(object, data)
    }

    /// Stage the initial data and register `object`. The device memory is
    /// released again when staging fails.
    fn insert_memory_object(
        &mut self,
        mut object: MemoryObject<B::Memory>,
        data: Option<&[u8]>,
    ) -> ComputeResult<BufferHandle> {
        if let Err(err) = self.stage_initial_data(&mut object, data) {
            self.context.backend_mut().release_memory(object.memory);
            return Err(err);
        }
        self.bytes_allocated += object.size;
        Ok(BufferHandle(self.buffers.insert(object)))
    }

    fn stage_initial_data(
        &mut self,
        object: &mut MemoryObject<B::Memory>,
        data: Option<&[u8]>,
    ) -> ComputeResult<()> {
        if let Some(data) = data
            && object.flags.contains(BufferFlags::INITIAL_COPY)
        {
            let blocking = object.flags.contains(BufferFlags::BLOCK_ON_WRITE);
            self.context
                .backend_mut()
                .write(&object.memory, 0, data, blocking)?;
        }
        if object.flags.contains(BufferFlags::COPY_ON_USE) {
            let mut staged = vec![0; object.size as usize];
            if let Some(data) = data {
                staged[..data.len()].copy_from_slice(data);
            }
            object.host_data = Some(staged);
        } else if object.flags.contains(BufferFlags::READ_BACK_RESULT) {
            object.host_data = Some(vec![0; object.size as usize]);
        }
        Ok(())
    }

    /// Allocate a 2D image on the active device.
    pub fn create_image2d(
        &mut self,
        flags: BufferFlags,
        width: u32,
        height: u32,
        format: ImageFormat,
        data: Option<&[u8]>,
    ) -> Option<BufferHandle> {
        let kind = MemoryKind::Image2d {
            width,
            height,
            format,
        };
        let result = self.try_create_image(flags, kind, data);
        self.finish_op("create_image2d", result)
    }

    /// Allocate a 3D image on the active device.
    pub fn create_image3d(
        &mut self,
        flags: BufferFlags,
        size: (u32, u32, u32),
        format: ImageFormat,
        data: Option<&[u8]>,
    ) -> Option<BufferHandle> {
        let kind = MemoryKind::Image3d {
            width: size.0,
            height: size.1,
            depth: size.2,
            format,
        };
        let result = self.try_create_image(flags, kind, data);
        self.finish_op("create_image3d", result)
    }

    fn try_create_image(
        &mut self,
        flags: BufferFlags,
        kind: MemoryKind,
        data: Option<&[u8]>,
    ) -> ComputeResult<BufferHandle> {
        let device = self.context.active_device();
        let info = self.context.active_device_info();
        let (bytes, exceeds) = match kind {
            MemoryKind::Image2d {
                width,
                height,
                format,
            } => (
                u64::from(width) * u64::from(height) * format.bytes_per_pixel(),
                (width > info.max_image_2d.0 || height > info.max_image_2d.1)
                    .then(|| (u64::from(width.max(height)), u64::from(info.max_image_2d.0))),
            ),
            MemoryKind::Image3d {
                width,
                height,
                depth,
                format,
            } => {
                let (mw, mh, md) = info.max_image_3d;
                (
                    u64::from(width)
                        * u64::from(height)
                        * u64::from(depth)
                        * format.bytes_per_pixel(),
                    (width > mw || height > mh || depth > md)
                        .then(|| (u64::from(width.max(height).max(depth)), u64::from(mw))),
                )
            }
            _ => {
                return Err(ComputeError::api(
                    ApiErrorCode::InvalidValue,
                    "not an image kind",
                ));
            }
        };
        if let Some((requested, limit)) = exceeds {
            return Err(ComputeError::Allocation { requested, limit });
        }
        if bytes == 0 {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidImageSize,
                "image dimensions must be non-zero",
            ));
        }

        check_initial_data(data, bytes)?;

        let memory = self.context.backend_mut().create_image(device, &kind, flags)?;
        let object = MemoryObject::new(device, memory, kind, flags, bytes);
        self.insert_memory_object(object, data)
    }

    /// Wrap a graphics buffer/texture/renderbuffer for compute access.
    ///
    /// Unless manual sharing is enabled the registry acquires the object before
    /// each dispatch using it and releases it afterwards. Any other compute access
    /// must be bracketed by [`acquire_graphics_object`](Self::acquire_graphics_object)
    /// and [`release_graphics_object`](Self::release_graphics_object).
    pub fn create_graphics_interop_buffer(
        &mut self,
        flags: BufferFlags,
        object: GraphicsObject,
    ) -> Option<BufferHandle> {
        let result = self.try_create_interop(flags | BufferFlags::GRAPHICS_INTEROP, object);
        self.finish_op("create_graphics_interop_buffer", result)
    }

    fn try_create_interop(
        &mut self,
        flags: BufferFlags,
        object: GraphicsObject,
    ) -> ComputeResult<BufferHandle> {
        let device = self.context.active_device();
        let (memory, size) = self
            .context
            .backend_mut()
            .import_graphics(device, &object, flags)?;
        let mut record = MemoryObject::new(device, memory, MemoryKind::Graphics(object), flags, size);
        if flags.contains(BufferFlags::READ_BACK_RESULT) {
            record.host_data = Some(vec![0; size as usize]);
        }
        Ok(BufferHandle(self.buffers.insert(record)))
    }

    /// Opt a graphics-interop buffer out of (or back into) automatic acquire/release.
    pub fn set_manual_sharing(&mut self, buffer: BufferHandle, manual: bool) -> bool {
        let result = self
            .buffer_mut(buffer)
            .map(|obj| obj.manual_sharing = manual);
        self.finish_op("set_manual_sharing", result).is_some()
    }

    /// Take a graphics-backed buffer from the graphics API.
    pub fn acquire_graphics_object(&mut self, buffer: BufferHandle) -> bool {
        let result = self.try_acquire(buffer);
        self.finish_op("acquire_graphics_object", result).is_some()
    }

    fn try_acquire(&mut self, buffer: BufferHandle) -> ComputeResult<()> {
        let obj = self
            .buffers
            .get_mut(buffer.0)
            .ok_or(ComputeError::InvalidHandle("buffer"))?;
        if !obj.is_interop() {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidGlObject,
                format!("{buffer} is not a graphics-interop buffer"),
            ));
        }
        if obj.acquired {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidOperation,
                format!("{buffer} is already acquired"),
            ));
        }
        self.context.backend_mut().acquire_graphics(&obj.memory)?;
        obj.acquired = true;
        Ok(())
    }

    /// Hand a graphics-backed buffer back to the graphics API.
    pub fn release_graphics_object(&mut self, buffer: BufferHandle) -> bool {
        let result = self.try_release(buffer);
        self.finish_op("release_graphics_object", result).is_some()
    }

    fn try_release(&mut self, buffer: BufferHandle) -> ComputeResult<()> {
        let obj = self
            .buffers
            .get_mut(buffer.0)
            .ok_or(ComputeError::InvalidHandle("buffer"))?;
        if !obj.acquired {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidOperation,
                format!("{buffer} is not acquired"),
            ));
        }
        self.context.backend_mut().release_graphics(&obj.memory)?;
        obj.acquired = false;
        Ok(())
    }

    /// Write `data` at `offset`. Blocks when the buffer has `BLOCK_ON_WRITE`.
    ///
    /// For `COPY_ON_USE` buffers the staged host copy is updated as well.
    pub fn write(&mut self, buffer: BufferHandle, data: &[u8], offset: u64) -> bool {
        let result = self.try_write(buffer, data, offset);
        self.finish_op("write", result).is_some()
    }

    fn try_write(&mut self, buffer: BufferHandle, data: &[u8], offset: u64) -> ComputeResult<()> {
        let obj = self
            .buffers
            .get_mut(buffer.0)
            .ok_or(ComputeError::InvalidHandle("buffer"))?;
        if obj.mapped.is_some() {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidOperation,
                format!("{buffer} is mapped"),
            ));
        }
        let Some(end) = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= obj.size)
        else {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidValue,
                format!(
                    "write of {} bytes at offset {offset} exceeds {} bytes",
                    data.len(),
                    obj.size
                ),
            ));
        };

        let blocking = obj.flags.contains(BufferFlags::BLOCK_ON_WRITE);
        self.context
            .backend_mut()
            .write(&obj.memory, offset, data, blocking)?;
        if obj.flags.contains(BufferFlags::COPY_ON_USE)
            && let Some(staged) = obj.host_data.as_mut()
        {
            staged[offset as usize..end as usize].copy_from_slice(data);
        }
        Ok(())
    }

    /// Read the start of the buffer into `dst`. Blocks when the buffer has
    /// `BLOCK_ON_READ`.
    pub fn read(&mut self, buffer: BufferHandle, dst: &mut [u8]) -> bool {
        self.read_range(buffer, 0, dst)
    }

    /// Read `dst.len()` bytes starting at `offset`.
    pub fn read_range(&mut self, buffer: BufferHandle, offset: u64, dst: &mut [u8]) -> bool {
        let result = self.try_read(buffer, offset, dst);
        self.finish_op("read", result).is_some()
    }

    fn try_read(&mut self, buffer: BufferHandle, offset: u64, dst: &mut [u8]) -> ComputeResult<()> {
        let obj = self
            .buffers
            .get(buffer.0)
            .ok_or(ComputeError::InvalidHandle("buffer"))?;
        if obj.mapped.is_some() {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidOperation,
                format!("{buffer} is mapped"),
            ));
        }
        let blocking = obj.flags.contains(BufferFlags::BLOCK_ON_READ);
        self.context
            .backend_mut()
            .read(&obj.memory, offset, dst, blocking)
    }

    /// Map the buffer for host access. It cannot be used by kernels until
    /// [`unmap`](Self::unmap) is called with the returned region.
    pub fn map(
        &mut self,
        buffer: BufferHandle,
        access: MapAccess,
        blocking: bool,
    ) -> Option<MappedRegion> {
        let result = self.try_map(buffer, access, blocking);
        self.finish_op("map", result)
    }

    fn try_map(
        &mut self,
        buffer: BufferHandle,
        access: MapAccess,
        blocking: bool,
    ) -> ComputeResult<MappedRegion> {
        let obj = self
            .buffers
            .get_mut(buffer.0)
            .ok_or(ComputeError::InvalidHandle("buffer"))?;
        if obj.mapped.is_some() {
            return Err(ComputeError::api(
                ApiErrorCode::MapFailure,
                format!("{buffer} is already mapped"),
            ));
        }
        let data = self
            .context
            .backend_mut()
            .map(&obj.memory, access, blocking)?;
        obj.mapped = Some(access);
        Ok(MappedRegion {
            buffer,
            access,
            data,
        })
    }

    /// Finish host access started by [`map`](Self::map).
    pub fn unmap(&mut self, region: MappedRegion) -> bool {
        let result = self.try_unmap(region);
        self.finish_op("unmap", result).is_some()
    }

    fn try_unmap(&mut self, region: MappedRegion) -> ComputeResult<()> {
        let obj = self
            .buffers
            .get_mut(region.buffer.0)
            .ok_or(ComputeError::InvalidHandle("buffer"))?;
        if obj.mapped.is_none() {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidOperation,
                format!("{} is not mapped", region.buffer),
            ));
        }
        self.context
            .backend_mut()
            .unmap(&obj.memory, region.access, &region.data)?;
        obj.mapped = None;
        Ok(())
    }

    /// Destroy a memory object, severing every kernel argument bound to it.
    ///
    /// Kernel argument slots stay "set"; they are just no longer buffer-backed.
    pub fn delete_buffer(&mut self, buffer: BufferHandle) -> bool {
        let result = self.try_delete_buffer(buffer);
        self.finish_op("delete_buffer", result).is_some()
    }

    fn try_delete_buffer(&mut self, buffer: BufferHandle) -> ComputeResult<()> {
        let obj = self
            .buffers
            .remove(buffer.0)
            .ok_or(ComputeError::InvalidHandle("buffer"))?;

        for (kernel_handle, indices) in &obj.bound_to {
            if let Some(kernel) = self.kernels.get_mut(kernel_handle.0) {
                for index in indices {
                    if kernel.buffer_args.get(index) == Some(&buffer) {
                        kernel.buffer_args.remove(index);
                    }
                }
                refresh_interop_flag(kernel, &self.buffers);
            }
        }

        if obj.acquired {
            log::warn!("{buffer} deleted while acquired by compute, releasing");
            if let Err(err) = self.context.backend_mut().release_graphics(&obj.memory) {
                log::error!("release of {buffer} failed: {err}");
            }
        }
        if !obj.is_interop() {
            self.bytes_allocated = self.bytes_allocated.saturating_sub(obj.size);
        }
        self.context.backend_mut().release_memory(obj.memory);
        Ok(())
    }

    fn buffer_mut(&mut self, buffer: BufferHandle) -> ComputeResult<&mut MemoryObject<B::Memory>> {
        self.buffers
            .get_mut(buffer.0)
            .ok_or(ComputeError::InvalidHandle("buffer"))
    }

    /// Staged (`COPY_ON_USE`) or read-back (`READ_BACK_RESULT`) host data.
    #[must_use]
    pub fn host_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(buffer.0)?.host_data.as_deref()
    }

    #[must_use]
    pub fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(buffer.0).map(|obj| obj.size)
    }

    #[must_use]
    pub fn buffer_flags(&self, buffer: BufferHandle) -> Option<BufferFlags> {
        self.buffers.get(buffer.0).map(|obj| obj.flags)
    }

    #[must_use]
    pub fn has_buffer(&self, buffer: BufferHandle) -> bool {
        self.buffers.contains(buffer.0)
    }

    /// Whether the buffer's back-reference set contains `(kernel, index)`.
    #[must_use]
    pub fn is_bound(&self, buffer: BufferHandle, kernel: KernelHandle, index: u32) -> bool {
        self.buffers
            .get(buffer.0)
            .is_some_and(|obj| obj.is_bound(kernel, index))
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Bytes held by registry-allocated (non-interop) memory objects.
    #[must_use]
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated
    }

    // ========================================================================
    // Kernels
    // ========================================================================

    /// Compile `entry_point` from `source` and register it under `identifier`.
    ///
    /// Re-adding an identifier replaces the previous kernel in place (the handle
    /// stays the same) after severing its buffer bindings. When the build fails
    /// the entry is kept for a later reload, the build log is logged and stored,
    /// and `None` is returned.
    pub fn add_kernel(
        &mut self,
        identifier: &str,
        source: KernelSource,
        entry_point: &str,
        options: &str,
    ) -> Option<KernelHandle> {
        let handle = match self.identifiers.get(identifier).copied() {
            Some(existing) if self.kernels.contains(existing.0) => {
                self.teardown_kernel(existing);
                if let Some(kernel) = self.kernels.get_mut(existing.0) {
                    kernel.source = source;
                    kernel.entry_point = entry_point.to_string();
                    kernel.options = options.to_string();
                    kernel.device = self.context.active_device();
                }
                existing
            }
            _ => {
                let kernel = Kernel::new(
                    identifier,
                    source,
                    entry_point,
                    options,
                    self.context.active_device(),
                );
                let handle = KernelHandle(self.kernels.insert(kernel));
                self.identifiers.insert(identifier.to_string(), handle);
                handle
            }
        };

        let result = self.compile_kernel(handle);
        self.finish_op("add_kernel", result).map(|()| handle)
    }

    fn compile_kernel(&mut self, handle: KernelHandle) -> ComputeResult<()> {
        let kernel = self
            .kernels
            .get(handle.0)
            .ok_or(ComputeError::InvalidHandle("kernel"))?;
        let identifier = kernel.identifier.clone();
        let entry_point = kernel.entry_point.clone();
        let device = kernel.device;

        let built = self.context.load_source(&kernel.source).and_then(|text| {
            let options = self.context.build_options(device, &kernel.options);
            let full_source = format!("{}{text}", options_prelude(&options));
            let layout = reflect::reflect(&full_source, &entry_point).map_err(|log| {
                ComputeError::Compilation {
                    identifier: identifier.clone(),
                    log,
                }
            })?;
            Ok((full_source, layout))
        });

        let compiled = built.and_then(|(full_source, layout)| {
            let program = self.context.backend_mut().compile(
                device,
                &identifier,
                &full_source,
                &entry_point,
                &layout,
            )?;
            Ok((program, layout))
        });

        let fixed = self.context.backend().fixed_workgroup_size();
        let kernel = self
            .kernels
            .get_mut(handle.0)
            .ok_or(ComputeError::InvalidHandle("kernel"))?;
        match compiled {
            Ok((program, layout)) => {
                // samplers are supplied by the device and never set by callers
                kernel.args_set = layout
                    .args
                    .iter()
                    .map(|arg| matches!(arg, ArgKind::Sampler))
                    .collect();
                kernel.args = layout.args;
                kernel.workgroup_size = fixed.then_some(layout.workgroup_size);
                kernel.program = Some(program);
                kernel.build_log = None;
                log::debug!(
                    "compiled kernel \"{identifier}\" ({} arguments)",
                    kernel.args.len()
                );
                Ok(())
            }
            Err(err) => {
                let log = match &err {
                    ComputeError::Compilation { log, .. } => log.clone(),
                    other => other.to_string(),
                };
                self.context.write_build_log(&identifier, &log);
                kernel.build_log = Some(log.clone());
                Err(ComputeError::Compilation { identifier, log })
            }
        }
    }

    /// Destroy the program and sever every buffer binding of a kernel, keeping
    /// its registry entry.
    fn teardown_kernel(&mut self, handle: KernelHandle) {
        let Some(kernel) = self.kernels.get_mut(handle.0) else {
            return;
        };
        for (index, buffer) in std::mem::take(&mut kernel.buffer_args) {
            if let Some(obj) = self.buffers.get_mut(buffer.0) {
                obj.remove_binding(handle, index);
            }
        }
        kernel.has_graphics_buffers = false;
        kernel.args.clear();
        kernel.args_set.clear();
        kernel.workgroup_size = None;
        if let Some(program) = kernel.program.take() {
            self.context.backend_mut().destroy_program(program);
        }
    }

    /// Remove a kernel entirely.
    pub fn delete_kernel(&mut self, kernel: KernelHandle) -> bool {
        if !self.kernels.contains(kernel.0) {
            self.report("delete_kernel", ComputeError::InvalidHandle("kernel"));
            return false;
        }
        self.teardown_kernel(kernel);
        if let Some(removed) = self.kernels.remove(kernel.0) {
            self.identifiers.remove(&removed.identifier);
        }
        if self.current == Some(kernel) {
            self.current = None;
        }
        true
    }

    /// Destroy and rebuild every kernel from its recorded source.
    ///
    /// The device queues must be idle (call [`finish`](Self::finish) first):
    /// rebuilding destroys programs that in-flight dispatches may reference.
    /// Arguments must be set again afterwards. Returns false if any build failed.
    pub fn reload_all(&mut self) -> bool {
        log::info!("reloading {} kernels", self.kernels.len());
        let mut ok = true;
        for idx in self.kernels.indices() {
            let handle = KernelHandle(idx);
            self.teardown_kernel(handle);
            let result = self.compile_kernel(handle);
            ok &= self.finish_op("reload_all", result).is_some();
        }
        ok
    }

    /// Look up a kernel by identifier (also finds kernels whose build failed).
    #[must_use]
    pub fn kernel(&self, identifier: &str) -> Option<KernelHandle> {
        self.identifiers.get(identifier).copied()
    }

    #[must_use]
    pub fn has_kernel(&self, identifier: &str) -> bool {
        self.identifiers.contains_key(identifier)
    }

    #[must_use]
    pub fn kernel_state(&self, kernel: KernelHandle) -> KernelState {
        self.kernels
            .get(kernel.0)
            .map_or(KernelState::Destroyed, Kernel::state)
    }

    /// Build log of the last failed build.
    #[must_use]
    pub fn build_log(&self, kernel: KernelHandle) -> Option<&str> {
        self.kernels.get(kernel.0)?.build_log.as_deref()
    }

    #[must_use]
    pub fn arg_count(&self, kernel: KernelHandle) -> Option<usize> {
        self.kernels.get(kernel.0).map(|k| k.args.len())
    }

    /// Buffer currently backing argument `index`, if any.
    #[must_use]
    pub fn bound_buffer(&self, kernel: KernelHandle, index: u32) -> Option<BufferHandle> {
        self.kernels.get(kernel.0)?.buffer_args.get(&index).copied()
    }

    /// Whether any argument of the kernel is backed by a graphics-interop buffer.
    #[must_use]
    pub fn has_graphics_buffers(&self, kernel: KernelHandle) -> bool {
        self.kernels
            .get(kernel.0)
            .is_some_and(|k| k.has_graphics_buffers)
    }

    #[must_use]
    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    /// Bind argument `index`. On failure the previous binding is left untouched.
    pub fn set_argument(
        &mut self,
        kernel: KernelHandle,
        index: u32,
        arg: impl Into<KernelArg>,
    ) -> bool {
        let result = self.try_set_argument(kernel, index, arg.into());
        self.finish_op("set_argument", result).is_some()
    }

    fn try_set_argument(
        &mut self,
        handle: KernelHandle,
        index: u32,
        arg: KernelArg,
    ) -> ComputeResult<()> {
        let kernel = self
            .kernels
            .get_mut(handle.0)
            .ok_or(ComputeError::InvalidHandle("kernel"))?;
        let name = kernel.identifier.clone();
        let binding_error = |reason: String| ComputeError::ArgumentBinding {
            kernel: name.clone(),
            index,
            reason,
        };

        let Some(kind) = kernel.args.get(index as usize).copied() else {
            return Err(binding_error(format!(
                "index out of range, kernel has {} arguments",
                kernel.args.len()
            )));
        };

        let memory = match &arg {
            KernelArg::Buffer(buffer) => {
                let obj = self
                    .buffers
                    .get(buffer.0)
                    .ok_or(ComputeError::InvalidHandle("buffer"))?;
                kind.accepts_memory(&obj.kind).map_err(&binding_error)?;
                if obj.device != kernel.device {
                    return Err(binding_error(format!(
                        "{buffer} lives on device #{}, kernel on device #{}",
                        obj.device, kernel.device
                    )));
                }
                Some(&obj.memory)
            }
            KernelArg::Value(bytes) => {
                kind.accepts_value(bytes.len()).map_err(&binding_error)?;
                None
            }
        };

        let Some(program) = kernel.program.as_mut() else {
            return Err(binding_error("kernel is not compiled".to_string()));
        };
        let backend_arg = match (&arg, memory) {
            (KernelArg::Value(bytes), _) => BackendArg::Value(bytes.as_slice()),
            (KernelArg::Buffer(_), Some(memory)) => BackendArg::Memory(memory),
            (KernelArg::Buffer(_), None) => return Err(ComputeError::InvalidHandle("buffer")),
        };
        if let Err(err) = self
            .context
            .backend_mut()
            .set_arg(program, index, backend_arg)
        {
            return Err(binding_error(err.to_string()));
        }

        // bookkeeping only after the device accepted the binding
        if let Some(old) = kernel.buffer_args.remove(&index)
            && let Some(old_obj) = self.buffers.get_mut(old.0)
        {
            old_obj.remove_binding(handle, index);
        }
        if let KernelArg::Buffer(buffer) = arg {
            kernel.buffer_args.insert(index, buffer);
            if let Some(obj) = self.buffers.get_mut(buffer.0) {
                obj.add_binding(handle, index);
            }
        }
        kernel.args_set[index as usize] = true;
        refresh_interop_flag(kernel, &self.buffers);
        Ok(())
    }

    /// Set the global range and, optionally, an explicit local range.
    pub fn set_kernel_range(
        &mut self,
        kernel: KernelHandle,
        global: NdRange,
        local: Option<NdRange>,
    ) -> bool {
        let result = self
            .kernels
            .get_mut(kernel.0)
            .ok_or(ComputeError::InvalidHandle("kernel"))
            .map(|k| {
                k.global = Some(global);
                k.local = local;
            });
        self.finish_op("set_kernel_range", result).is_some()
    }

    /// Work-group shape the active device would use for `global`.
    #[must_use]
    pub fn compute_local_range(&self, global: &NdRange) -> NdRange {
        let info = self.context.active_device_info();
        compute_local_range(global, info.max_work_group_size, info.max_work_item_sizes)
    }

    /// Enqueue one dispatch of `kernel`.
    ///
    /// Every argument must have been set and a global range given. Staged
    /// `COPY_ON_USE` data is written first, interop buffers are acquired around the
    /// dispatch (unless manually shared), `READ_BACK_RESULT` buffers are read back
    /// and `DELETE_AFTER_USE` buffers are deleted afterwards.
    pub fn dispatch(&mut self, kernel: KernelHandle) -> bool {
        let result = self.try_dispatch(kernel);
        self.finish_op("dispatch", result).is_some()
    }

    fn try_dispatch(&mut self, handle: KernelHandle) -> ComputeResult<()> {
        let kernel = self
            .kernels
            .get(handle.0)
            .ok_or(ComputeError::InvalidHandle("kernel"))?;
        let not_dispatchable = |reason: String| ComputeError::NotDispatchable {
            kernel: kernel.identifier.clone(),
            reason,
        };

        let Some(program) = kernel.program.as_ref() else {
            return Err(not_dispatchable("kernel is not compiled".to_string()));
        };
        let unset = kernel.unset_args();
        if !unset.is_empty() {
            return Err(not_dispatchable(format!("arguments {unset:?} were never set")));
        }
        let Some(global) = kernel.global else {
            return Err(not_dispatchable("no global range set".to_string()));
        };

        let device_info = self
            .context
            .device_info(kernel.device)
            .ok_or_else(|| ComputeError::api(ApiErrorCode::InvalidDevice, "kernel device is gone"))?;
        let local = match (kernel.workgroup_size, kernel.local) {
            (Some(fixed), _) => match global.dimensions() {
                1 => NdRange::one(fixed[0]),
                2 => NdRange::two(fixed[0], fixed[1]),
                _ => NdRange::three(fixed[0], fixed[1], fixed[2]),
            },
            (None, Some(local)) => local,
            (None, None) => compute_local_range(
                &global,
                device_info.max_work_group_size,
                device_info.max_work_item_sizes,
            ),
        };
        if local.product() > u64::from(device_info.max_work_group_size) {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidWorkGroupSize,
                format!(
                    "work-group of {} items exceeds device limit {}",
                    local.product(),
                    device_info.max_work_group_size
                ),
            ));
        }

        // staged in slot order, each object once
        let mut bound: Vec<BufferHandle> = Vec::new();
        for buffer in kernel.buffer_args.values() {
            if !bound.contains(buffer) {
                bound.push(*buffer);
            }
        }
        for buffer in &bound {
            if let Some(obj) = self.buffers.get(buffer.0)
                && obj.mapped.is_some()
            {
                return Err(not_dispatchable(format!("{buffer} is still mapped")));
            }
        }

        let backend = self.context.backend_mut();

        // stage host data and take interop objects from the graphics API
        let mut auto_acquired = Vec::new();
        let mut staged = Ok(());
        for buffer in &bound {
            let Some(obj) = self.buffers.get_mut(buffer.0) else {
                continue;
            };
            if obj.flags.contains(BufferFlags::COPY_ON_USE)
                && let Some(data) = obj.host_data.as_deref()
                && let Err(err) = backend.write(&obj.memory, 0, data, false)
            {
                staged = Err(err);
                break;
            }
            if obj.is_interop() && !obj.manual_sharing && !obj.acquired {
                if let Err(err) = backend.acquire_graphics(&obj.memory) {
                    staged = Err(err);
                    break;
                }
                obj.acquired = true;
                auto_acquired.push(*buffer);
            }
        }

        // whatever was taken from the graphics API goes back, dispatched or not
        let dispatched = staged.and_then(|()| backend.dispatch(program, &global, &local));

        for buffer in &auto_acquired {
            if let Some(obj) = self.buffers.get_mut(buffer.0) {
                if let Err(err) = backend.release_graphics(&obj.memory) {
                    log::error!("release of {buffer} after dispatch failed: {err}");
                }
                obj.acquired = false;
            }
        }
        dispatched?;

        let mut delete_after = Vec::new();
        for buffer in &bound {
            let Some(obj) = self.buffers.get_mut(buffer.0) else {
                continue;
            };
            if obj.flags.contains(BufferFlags::READ_BACK_RESULT) {
                let size = obj.size as usize;
                let mut data = obj.host_data.take().unwrap_or_else(|| vec![0; size]);
                let result = backend.read(&obj.memory, 0, &mut data, true);
                obj.host_data = Some(data);
                result?;
            }
            if obj.flags.contains(BufferFlags::DELETE_AFTER_USE) {
                delete_after.push(*buffer);
            }
        }

        if let Some(kernel) = self.kernels.get_mut(handle.0) {
            kernel.dispatch_count += 1;
        }
        for buffer in delete_after {
            self.try_delete_buffer(buffer)?;
        }
        Ok(())
    }

    // ========================================================================
    // Current-kernel cursor
    // ========================================================================

    /// Make `identifier` the target of [`set_arg`](Self::set_arg) and
    /// [`run_kernel`](Self::run_kernel).
    pub fn use_kernel(&mut self, identifier: &str) -> bool {
        match self.kernel(identifier) {
            Some(handle) => {
                self.current = Some(handle);
                true
            }
            None => {
                self.current = None;
                self.report(
                    "use_kernel",
                    ComputeError::api(
                        ApiErrorCode::InvalidKernelName,
                        format!("no kernel named \"{identifier}\""),
                    ),
                );
                false
            }
        }
    }

    #[must_use]
    pub fn current_kernel(&self) -> Option<KernelHandle> {
        self.current
    }

    /// Bind an argument of the current kernel.
    pub fn set_arg(&mut self, index: u32, arg: impl Into<KernelArg>) -> bool {
        match self.current {
            Some(kernel) => self.set_argument(kernel, index, arg),
            None => {
                self.report("set_arg", no_current_kernel());
                false
            }
        }
    }

    /// Set the ranges of the current kernel.
    pub fn set_range(&mut self, global: NdRange, local: Option<NdRange>) -> bool {
        match self.current {
            Some(kernel) => self.set_kernel_range(kernel, global, local),
            None => {
                self.report("set_range", no_current_kernel());
                false
            }
        }
    }

    /// Dispatch the current kernel.
    pub fn run_kernel(&mut self) -> bool {
        match self.current {
            Some(kernel) => self.dispatch(kernel),
            None => {
                self.report("run_kernel", no_current_kernel());
                false
            }
        }
    }
}

/// Initial data must fit the object it is written into.
fn check_initial_data(data: Option<&[u8]>, size: u64) -> ComputeResult<()> {
    match data {
        Some(data) if data.len() as u64 > size => Err(ComputeError::api(
            ApiErrorCode::InvalidValue,
            format!("{} bytes of initial data exceed size {size}", data.len()),
        )),
        _ => Ok(()),
    }
}

impl<B: ComputeBackend> Drop for ComputeRegistry<B> {
    fn drop(&mut self) {
        self.context.finish_all();
        for idx in self.kernels.indices() {
            self.teardown_kernel(KernelHandle(idx));
        }
        for idx in self.buffers.indices() {
            if let Some(obj) = self.buffers.remove(idx) {
                self.context.backend_mut().release_memory(obj.memory);
            }
        }
    }
}

fn no_current_kernel() -> ComputeError {
    ComputeError::api(ApiErrorCode::InvalidKernel, "no current kernel, call use_kernel first")
}

fn refresh_interop_flag<P, M>(kernel: &mut Kernel<P>, buffers: &Pool<MemoryObject<M>>) {
    kernel.has_graphics_buffers = kernel
        .buffer_args
        .values()
        .any(|b| buffers.get(b.0).is_some_and(MemoryObject::is_interop));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::device::{test_device, DeviceKind};
    use crate::compute::headless::HeadlessCompute;
    use crate::core::ComputeConfig;
    use crate::rtt::TextureHandle;

    const SCALE: &str = r"
struct Params { factor: f32, count: u32 }

@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(64)
fn scale(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x < params.count {
        output[id.x] = input[id.x] * params.factor;
    }
}
";

    const INCREMENT: &str = r"
@group(0) @binding(0) var<storage, read_write> data: array<u32>;

@compute @workgroup_size(1)
fn increment(@builtin(global_invocation_id) id: vec3<u32>) {
    data[id.x] = data[id.x] + 1u;
}
";

    #[repr(C)]
    #[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct Params {
        factor: f32,
        count: u32,
    }

    fn floats(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn float_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn registry() -> ComputeRegistry<HeadlessCompute> {
        let mut backend = HeadlessCompute::new(vec![test_device("gpu", DeviceKind::Gpu, 8, 1000)]);
        backend.register_kernel("scale", |d| {
            let params: Params = d.value(2).unwrap_or(Params {
                factor: 1.0,
                count: 0,
            });
            let input = d.memory(0).map(floats).unwrap_or_default();
            if let Some(out) = d.memory_mut(1) {
                for (i, chunk) in out.chunks_exact_mut(4).enumerate() {
                    if (i as u32) < params.count {
                        chunk.copy_from_slice(&(input[i] * params.factor).to_le_bytes());
                    }
                }
            }
        });
        backend.register_kernel("increment", |d| {
            if let Some(data) = d.memory_mut(0) {
                for chunk in data.chunks_exact_mut(4) {
                    let v = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    chunk.copy_from_slice(&(v + 1).to_le_bytes());
                }
            }
        });
        let config = ComputeConfig {
            cache_path: std::env::temp_dir().join("lumen-registry-tests"),
            ..ComputeConfig::default()
        };
        let context = ComputeContext::initialize(backend, &config).unwrap();
        ComputeRegistry::new(context)
    }

    fn add_scale(reg: &mut ComputeRegistry<HeadlessCompute>) -> KernelHandle {
        reg.add_kernel("scale", KernelSource::Inline(SCALE.to_string()), "scale", "")
            .unwrap()
    }

    #[test]
    fn test_delete_buffer_severs_back_reference() {
        let mut reg = registry();
        let kernel = add_scale(&mut reg);
        let buffer = reg.create_buffer(BufferFlags::default(), 64, None).unwrap();

        assert!(reg.set_argument(kernel, 0, buffer));
        assert!(reg.is_bound(buffer, kernel, 0));
        assert_eq!(reg.bound_buffer(kernel, 0), Some(buffer));

        assert!(reg.delete_buffer(buffer));
        assert_eq!(reg.bound_buffer(kernel, 0), None);

        let replacement = reg.create_buffer(BufferFlags::default(), 64, None).unwrap();
        assert!(reg.set_argument(kernel, 0, replacement));
        assert!(reg.is_bound(replacement, kernel, 0));
    }

    #[test]
    fn test_rebinding_removes_old_back_reference() {
        let mut reg = registry();
        let kernel = add_scale(&mut reg);
        let a = reg.create_buffer(BufferFlags::default(), 64, None).unwrap();
        let b = reg.create_buffer(BufferFlags::default(), 64, None).unwrap();

        assert!(reg.set_argument(kernel, 0, a));
        assert!(reg.set_argument(kernel, 1, a));
        assert!(reg.set_argument(kernel, 0, b));

        assert!(!reg.is_bound(a, kernel, 0));
        assert!(reg.is_bound(a, kernel, 1));
        assert!(reg.is_bound(b, kernel, 0));
    }

    #[test]
    fn test_value_over_buffer_slot_drops_stale_binding() {
        let mut reg = registry();
        let kernel = add_scale(&mut reg);
        let buffer = reg.create_buffer(BufferFlags::default(), 8, None).unwrap();

        // uniform slots take either a buffer or a plain value
        assert!(reg.set_argument(kernel, 2, buffer));
        assert!(reg.is_bound(buffer, kernel, 2));

        let params = Params {
            factor: 1.0,
            count: 0,
        };
        assert!(reg.set_argument(kernel, 2, KernelArg::value(&params)));
        assert!(!reg.is_bound(buffer, kernel, 2));
        assert_eq!(reg.bound_buffer(kernel, 2), None);
    }

    #[test]
    fn test_dispatch_rejected_until_all_arguments_set() {
        let mut reg = registry();
        let kernel = add_scale(&mut reg);
        let input = reg.create_buffer(BufferFlags::default(), 16, None).unwrap();
        let output = reg.create_buffer(BufferFlags::default(), 16, None).unwrap();
        assert!(reg.set_kernel_range(kernel, NdRange::one(4), None));

        assert_eq!(reg.kernel_state(kernel), KernelState::Compiled);
        assert!(!reg.dispatch(kernel));

        reg.set_argument(kernel, 0, input);
        reg.set_argument(kernel, 1, output);
        assert_eq!(reg.kernel_state(kernel), KernelState::ArgumentsPartiallySet);
        assert!(!reg.dispatch(kernel));
        assert!(matches!(
            reg.last_error(),
            Some(ComputeError::NotDispatchable { .. })
        ));

        let params = Params {
            factor: 2.0,
            count: 4,
        };
        assert!(reg.set_argument(kernel, 2, KernelArg::value(&params)));
        assert_eq!(reg.kernel_state(kernel), KernelState::ArgumentsFullySet);
        assert!(reg.dispatch(kernel));
        assert_eq!(reg.kernel_state(kernel), KernelState::ArgumentsFullySet);
    }

    #[test]
    fn test_argument_binding_errors_leave_binding_untouched() {
        let mut reg = registry();
        let kernel = add_scale(&mut reg);
        let buffer = reg.create_buffer(BufferFlags::default(), 16, None).unwrap();
        assert!(reg.set_argument(kernel, 0, buffer));

        // storage slots reject plain values
        assert!(!reg.set_argument(kernel, 0, KernelArg::value(&7u32)));
        assert!(matches!(
            reg.last_error(),
            Some(ComputeError::ArgumentBinding { index: 0, .. })
        ));
        assert!(reg.is_bound(buffer, kernel, 0));

        assert!(!reg.set_argument(kernel, 7, buffer));
        assert!(!reg.set_argument(kernel, 2, KernelArg::value(&1u32)));
        assert_eq!(reg.kernel_state(kernel), KernelState::ArgumentsPartiallySet);
    }

    #[test]
    fn test_scale_kernel_produces_results() {
        let mut reg = registry();
        let kernel = add_scale(&mut reg);
        let data = float_bytes(&[1.0, 2.0, 3.0, 4.0]);
        let input = reg
            .create_buffer(
                BufferFlags::default() | BufferFlags::INITIAL_COPY,
                16,
                Some(&data),
            )
            .unwrap();
        let output = reg.create_buffer(BufferFlags::default(), 16, None).unwrap();

        reg.set_argument(kernel, 0, input);
        reg.set_argument(kernel, 1, output);
        reg.set_argument(
            kernel,
            2,
            KernelArg::value(&Params {
                factor: 3.0,
                count: 4,
            }),
        );
        reg.set_kernel_range(kernel, NdRange::one(4), None);
        assert!(reg.dispatch(kernel));

        let mut out = [0u8; 16];
        assert!(reg.read(output, &mut out));
        assert_eq!(floats(&out), vec![3.0, 6.0, 9.0, 12.0]);
    }

    #[test]
    fn test_copy_on_use_restages_before_every_dispatch() {
        let mut reg = registry();
        let kernel = reg
            .add_kernel(
                "increment",
                KernelSource::Inline(INCREMENT.to_string()),
                "increment",
                "",
            )
            .unwrap();
        let initial: Vec<u8> = [10u32, 20].iter().flat_map(|v| v.to_le_bytes()).collect();
        let flags = BufferFlags::default() | BufferFlags::COPY_ON_USE;
        let buffer = reg.create_buffer(flags, 8, Some(&initial)).unwrap();

        reg.set_argument(kernel, 0, buffer);
        reg.set_kernel_range(kernel, NdRange::one(2), None);

        for _ in 0..3 {
            assert!(reg.dispatch(kernel));
            let mut out = [0u8; 8];
            assert!(reg.read(buffer, &mut out));
            // always one increment over the staged data, never accumulating
            assert_eq!(u32::from_le_bytes([out[0], out[1], out[2], out[3]]), 11);
            assert_eq!(u32::from_le_bytes([out[4], out[5], out[6], out[7]]), 21);
        }
    }

    #[test]
    fn test_read_back_result_updates_host_data() {
        let mut reg = registry();
        let kernel = reg
            .add_kernel(
                "increment",
                KernelSource::Inline(INCREMENT.to_string()),
                "increment",
                "",
            )
            .unwrap();
        let flags = BufferFlags::default() | BufferFlags::INITIAL_COPY | BufferFlags::READ_BACK_RESULT;
        let buffer = reg
            .create_buffer(flags, 4, Some(&5u32.to_le_bytes()))
            .unwrap();
        reg.set_argument(kernel, 0, buffer);
        reg.set_kernel_range(kernel, NdRange::one(1), None);

        assert!(reg.dispatch(kernel));
        assert_eq!(reg.host_data(buffer), Some(&6u32.to_le_bytes()[..]));
        assert!(reg.dispatch(kernel));
        assert_eq!(reg.host_data(buffer), Some(&7u32.to_le_bytes()[..]));
    }

    #[test]
    fn test_delete_after_use() {
        let mut reg = registry();
        let kernel = reg
            .add_kernel(
                "increment",
                KernelSource::Inline(INCREMENT.to_string()),
                "increment",
                "",
            )
            .unwrap();
        let buffer = reg
            .create_buffer(BufferFlags::default() | BufferFlags::DELETE_AFTER_USE, 4, None)
            .unwrap();
        reg.set_argument(kernel, 0, buffer);
        reg.set_kernel_range(kernel, NdRange::one(1), None);

        assert!(reg.dispatch(kernel));
        assert!(!reg.has_buffer(buffer));
        assert_eq!(reg.bound_buffer(kernel, 0), None);
        // the slot still counts as set
        assert_eq!(reg.kernel_state(kernel), KernelState::ArgumentsFullySet);

        assert!(reg.finish());
        assert_eq!(reg.context().backend().live_allocations(), 0);
    }

    #[test]
    fn test_mapped_buffer_blocks_dispatch_until_unmapped() {
        let mut reg = registry();
        let kernel = reg
            .add_kernel(
                "increment",
                KernelSource::Inline(INCREMENT.to_string()),
                "increment",
                "",
            )
            .unwrap();
        let buffer = reg.create_buffer(BufferFlags::default(), 4, None).unwrap();
        reg.set_argument(kernel, 0, buffer);
        reg.set_kernel_range(kernel, NdRange::one(1), None);

        let mut region = reg.map(buffer, MapAccess::ReadWrite, true).unwrap();
        region.data.copy_from_slice(&41u32.to_le_bytes());
        assert!(!reg.dispatch(kernel));

        assert!(reg.unmap(region));
        assert!(reg.dispatch(kernel));
        let mut out = [0u8; 4];
        reg.read(buffer, &mut out);
        assert_eq!(u32::from_le_bytes(out), 42);
    }

    #[test]
    fn test_allocation_limit() {
        let mut reg = registry();
        let too_big = reg.context().active_device_info().max_alloc + 1;
        assert!(reg.create_buffer(BufferFlags::default(), too_big, None).is_none());
        assert!(matches!(
            reg.last_error(),
            Some(ComputeError::Allocation { .. })
        ));

        assert!(
            reg.create_image2d(BufferFlags::default(), 100_000, 4, ImageFormat::Rgba8Unorm, None)
                .is_none()
        );
        assert!(
            reg.create_image2d(BufferFlags::default(), 64, 64, ImageFormat::Rgba8Unorm, None)
                .is_some()
        );
        assert_eq!(reg.bytes_allocated(), 64 * 64 * 4);
    }

    #[test]
    fn test_oversized_initial_data_is_rejected() {
        let mut reg = registry();
        let live = reg.context().backend().live_allocations();

        let flags = BufferFlags::default() | BufferFlags::COPY_ON_USE;
        assert!(
            reg.create_image2d(flags, 2, 2, ImageFormat::Rgba8Unorm, Some(&[7u8; 64]))
                .is_none()
        );
        assert_eq!(reg.last_error().map(ComputeError::code), Some(ApiErrorCode::InvalidValue));
        assert!(reg.create_buffer(flags, 8, Some(&[1u8; 9])).is_none());

        assert_eq!(reg.context().backend().live_allocations(), live);
        assert_eq!(reg.bytes_allocated(), 0);
    }

    #[test]
    fn test_failed_initial_copy_releases_memory() {
        let mut reg = registry();
        let live = reg.context().backend().live_allocations();

        reg.context_mut().backend_mut().fail_next_writes(1);
        let flags = BufferFlags::default() | BufferFlags::INITIAL_COPY;
        assert!(reg.create_buffer(flags, 8, Some(&[1u8; 8])).is_none());
        assert_eq!(
            reg.last_error().map(ComputeError::code),
            Some(ApiErrorCode::OutOfResources)
        );
        assert_eq!(reg.context().backend().live_allocations(), live);
        assert_eq!(reg.bytes_allocated(), 0);

        assert!(reg.create_buffer(flags, 8, Some(&[1u8; 8])).is_some());
        assert_eq!(reg.context().backend().live_allocations(), live + 1);
    }

    #[test]
    fn test_write_offset_overflow_is_rejected() {
        let mut reg = registry();
        let buffer = reg.create_buffer(BufferFlags::default(), 4, None).unwrap();
        assert!(!reg.write(buffer, &[1, 2], u64::MAX));
        assert_eq!(reg.last_error().map(ComputeError::code), Some(ApiErrorCode::InvalidValue));
        assert!(!reg.write(buffer, &[1, 2], 3));
        assert!(reg.write(buffer, &[1, 2], 2));
    }

    #[test]
    fn test_failed_staging_releases_acquired_objects() {
        let mut reg = registry();
        let src = r"
@group(0) @binding(0) var<storage, read_write> shared_data: array<u32>;
@group(0) @binding(1) var<storage, read_write> staged: array<u32>;
@compute @workgroup_size(1)
fn touch() { shared_data[0] = staged[0]; }
";
        let kernel = reg
            .add_kernel("touch", KernelSource::Inline(src.to_string()), "touch", "")
            .unwrap();
        let object = GraphicsObject::Buffer {
            id: crate::compute::buffer::GraphicsBufferId(5),
            size: 16,
        };
        let shared = reg
            .create_graphics_interop_buffer(BufferFlags::default(), object)
            .unwrap();
        let flags = BufferFlags::default() | BufferFlags::COPY_ON_USE;
        let staged = reg.create_buffer(flags, 4, Some(&[9u8; 4])).unwrap();
        assert!(reg.set_argument(kernel, 0, shared));
        assert!(reg.set_argument(kernel, 1, staged));
        reg.set_kernel_range(kernel, NdRange::one(1), None);

        // the shared object is taken first, then staging the second one fails
        reg.context_mut().backend_mut().fail_next_writes(1);
        assert!(!reg.dispatch(kernel));

        let obj = reg.buffers.get(shared.0).unwrap();
        assert!(!obj.acquired);
        assert!(!reg.context().backend().is_acquired(&obj.memory));
        let stats = reg.context().backend().stats();
        assert_eq!((stats.acquires, stats.releases), (1, 1));
        assert_eq!(stats.dispatches, 0);

        assert!(reg.dispatch(kernel));
        assert!(!reg.context().backend().is_acquired(&reg.buffers.get(shared.0).unwrap().memory));
    }

    #[test]
    fn test_compile_failure_keeps_entry_for_reload() {
        let mut reg = registry();
        let handle = reg.add_kernel(
            "broken",
            KernelSource::Inline("@compute fn broken( {".to_string()),
            "broken",
            "",
        );
        assert!(handle.is_none());

        let kernel = reg.kernel("broken").unwrap();
        assert_eq!(reg.kernel_state(kernel), KernelState::Uncompiled);
        assert!(reg.build_log(kernel).is_some());
        assert!(matches!(
            reg.last_error(),
            Some(ComputeError::Compilation { .. })
        ));

        // re-adding under the same identifier reuses the entry
        let fixed = reg
            .add_kernel(
                "broken",
                KernelSource::Inline(INCREMENT.to_string()),
                "increment",
                "",
            )
            .unwrap();
        assert_eq!(fixed, kernel);
        assert_eq!(reg.kernel_state(kernel), KernelState::Compiled);
        assert!(reg.build_log(kernel).is_none());
    }

    #[test]
    fn test_readding_kernel_severs_bindings() {
        let mut reg = registry();
        let kernel = add_scale(&mut reg);
        let buffer = reg.create_buffer(BufferFlags::default(), 16, None).unwrap();
        reg.set_argument(kernel, 0, buffer);

        let again = add_scale(&mut reg);
        assert_eq!(again, kernel);
        assert!(!reg.is_bound(buffer, kernel, 0));
        assert_eq!(reg.kernel_state(kernel), KernelState::Compiled);
    }

    #[test]
    fn test_build_options_become_constants() {
        let mut reg = registry();
        let src = r"
@group(0) @binding(0) var<storage, read_write> data: array<u32>;
@compute @workgroup_size(1)
fn fill() { data[0] = FILL_VALUE; }
";
        let kernel = reg.add_kernel(
            "fill",
            KernelSource::Inline(src.to_string()),
            "fill",
            "-D FILL_VALUE=7u",
        );
        assert!(kernel.is_some());

        let missing = reg.add_kernel("fill_missing", KernelSource::Inline(src.to_string()), "fill", "");
        assert!(missing.is_none());
    }

    #[test]
    fn test_interop_auto_acquire_and_manual_sharing() {
        let mut reg = registry();
        let src = r"
@group(0) @binding(0) var<storage, read_write> data: array<u32>;
@compute @workgroup_size(1)
fn touch() { data[0] = 1u; }
";
        let kernel = reg
            .add_kernel("touch", KernelSource::Inline(src.to_string()), "touch", "")
            .unwrap();
        let object = GraphicsObject::Buffer {
            id: crate::compute::buffer::GraphicsBufferId(3),
            size: 16,
        };
        let shared = reg
            .create_graphics_interop_buffer(BufferFlags::default(), object)
            .unwrap();
        assert!(reg.set_argument(kernel, 0, shared));
        assert!(reg.has_graphics_buffers(kernel));
        reg.set_kernel_range(kernel, NdRange::one(1), None);

        assert!(reg.dispatch(kernel));
        let stats = reg.context().backend().stats();
        assert_eq!((stats.acquires, stats.releases), (1, 1));

        assert!(reg.set_manual_sharing(shared, true));
        assert!(reg.dispatch(kernel));
        let stats = reg.context().backend().stats();
        assert_eq!((stats.acquires, stats.releases), (1, 1));

        assert!(reg.acquire_graphics_object(shared));
        assert!(!reg.acquire_graphics_object(shared));
        assert!(reg.release_graphics_object(shared));
        assert!(!reg.release_graphics_object(shared));

        // texture-backed objects bind to image slots only
        let texture = reg
            .create_graphics_interop_buffer(
                BufferFlags::READ,
                GraphicsObject::Texture2d(TextureHandle::from_raw(1)),
            )
            .unwrap();
        assert!(!reg.set_argument(kernel, 0, texture));

        reg.delete_buffer(shared);
        assert!(!reg.has_graphics_buffers(kernel));
    }

    #[test]
    fn test_cursor_use_and_run() {
        let mut reg = registry();
        assert!(!reg.run_kernel());
        assert!(!reg.use_kernel("increment"));

        reg.add_kernel(
            "increment",
            KernelSource::Inline(INCREMENT.to_string()),
            "increment",
            "",
        );
        let buffer = reg
            .create_buffer(BufferFlags::default() | BufferFlags::INITIAL_COPY, 4, Some(&[0; 4]))
            .unwrap();

        assert!(reg.use_kernel("increment"));
        assert!(reg.set_arg(0, buffer));
        assert!(reg.set_range(NdRange::one(1), None));
        assert!(reg.run_kernel());
        assert!(reg.run_kernel());

        let mut out = [0u8; 4];
        reg.read(buffer, &mut out);
        assert_eq!(u32::from_le_bytes(out), 2);
    }

    #[test]
    fn test_rapid_reload_and_dispatch_cycles() {
        let mut reg = registry();
        let kernel = reg
            .add_kernel(
                "increment",
                KernelSource::Inline(INCREMENT.to_string()),
                "increment",
                "",
            )
            .unwrap();
        let buffer = reg
            .create_buffer(
                BufferFlags::READ_WRITE | BufferFlags::INITIAL_COPY,
                4,
                Some(&[0; 4]),
            )
            .unwrap();

        for _ in 0..100 {
            assert!(reg.set_argument(kernel, 0, buffer));
            assert!(reg.set_kernel_range(kernel, NdRange::one(1), None));
            assert!(reg.dispatch(kernel));
            assert!(reg.finish());
            assert!(reg.reload_all());
            assert_eq!(reg.kernel_state(kernel), KernelState::Compiled);
        }

        assert_eq!(reg.context().backend().pending(0), 0);
        let mut out = [0u8; 4];
        assert!(reg.read(buffer, &mut out));
        assert_eq!(u32::from_le_bytes(out), 100);
    }

    #[test]
    fn test_deleted_kernel_is_destroyed() {
        let mut reg = registry();
        let kernel = add_scale(&mut reg);
        let buffer = reg.create_buffer(BufferFlags::default(), 16, None).unwrap();
        reg.set_argument(kernel, 0, buffer);

        assert!(reg.delete_kernel(kernel));
        assert_eq!(reg.kernel_state(kernel), KernelState::Destroyed);
        assert!(!reg.is_bound(buffer, kernel, 0));
        assert!(!reg.has_kernel("scale"));
        assert!(!reg.delete_kernel(kernel));
    }

    #[test]
    fn test_explicit_local_range_respects_device_limit() {
        let mut reg = registry();
        let kernel = reg
            .add_kernel(
                "increment",
                KernelSource::Inline(INCREMENT.to_string()),
                "increment",
                "",
            )
            .unwrap();
        let buffer = reg.create_buffer(BufferFlags::default(), 4, None).unwrap();
        reg.set_argument(kernel, 0, buffer);

        reg.set_kernel_range(kernel, NdRange::two(64, 64), Some(NdRange::two(32, 32)));
        assert!(!reg.dispatch(kernel));

        reg.set_kernel_range(kernel, NdRange::two(64, 64), None);
        assert!(reg.dispatch(kernel));
        assert_eq!(reg.compute_local_range(&NdRange::two(64, 64)).sizes(), [16, 16, 1]);
    }
}
