//! CPU compute backend
//!
//! Runs host-side kernel functions on a deterministic in-order queue per device.
//! Enqueued commands execute when the queue is flushed or finished, so the
//! asynchronous behavior of a real device stays observable. This is the backend
//! used by the test suite and the software fallback when no GPU adapter exists.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::backend::{BackendArg, ComputeBackend};
use super::buffer::{BufferFlags, GraphicsObject, MapAccess, MemoryKind};
use super::device::{DeviceInfo, DeviceKind, Vendor};
use super::error::{ApiErrorCode, ComputeError, ComputeResult};
use super::kernel::NdRange;
use super::reflect::KernelLayout;

/// Host implementation of a kernel entry point.
pub type HostKernelFn = Arc<dyn Fn(&mut HostDispatch<'_>) + Send + Sync>;

/// Memory of the CPU backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostMemory(u64);

/// Built kernel of the CPU backend.
pub struct HostProgram {
    device: usize,
    identifier: String,
    entry_point: String,
    kernel: Option<HostKernelFn>,
    args: Vec<Option<HostArg>>,
}

impl std::fmt::Debug for HostProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProgram")
            .field("device", &self.device)
            .field("identifier", &self.identifier)
            .field("entry_point", &self.entry_point)
            .field("has_kernel", &self.kernel.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
enum HostArg {
    Memory(u64),
    Value(Vec<u8>),
}

/// Argument data visible to a host kernel.
#[derive(Debug)]
pub enum HostArgData {
    Memory(Vec<u8>),
    Value(Vec<u8>),
    /// The memory was bound at an earlier index of the same dispatch
    Alias(usize),
}

/// One kernel invocation over the whole global range.
pub struct HostDispatch<'a> {
    pub global: NdRange,
    args: &'a mut [HostArgData],
}

impl HostDispatch<'_> {
    fn resolve(&self, index: usize) -> usize {
        match self.args.get(index) {
            Some(HostArgData::Alias(first)) => *first,
            _ => index,
        }
    }

    /// Bytes of the memory object bound at `index`.
    #[must_use]
    pub fn memory(&self, index: usize) -> Option<&[u8]> {
        match self.args.get(self.resolve(index))? {
            HostArgData::Memory(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Mutable bytes of the memory object bound at `index`.
    pub fn memory_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let index = self.resolve(index);
        match self.args.get_mut(index)? {
            HostArgData::Memory(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Plain value bound at `index`.
    #[must_use]
    pub fn value<T: bytemuck::Pod>(&self, index: usize) -> Option<T> {
        match self.args.get(index)? {
            HostArgData::Value(bytes) if bytes.len() == std::mem::size_of::<T>() => {
                Some(bytemuck::pod_read_unaligned(bytes))
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Allocation {
    device: usize,
    bytes: Vec<u8>,
    graphics: Option<GraphicsObject>,
    acquired: bool,
    /// Enqueued commands still referencing this allocation
    pending_refs: usize,
    released: bool,
}

enum Command {
    Write {
        id: u64,
        offset: usize,
        data: Vec<u8>,
    },
    Dispatch {
        identifier: String,
        kernel: Option<HostKernelFn>,
        args: Vec<HostArg>,
        global: NdRange,
    },
}

impl Command {
    fn memory_ids(&self) -> Vec<u64> {
        match self {
            Self::Write { id, .. } => vec![*id],
            Self::Dispatch { args, .. } => args
                .iter()
                .filter_map(|arg| match arg {
                    HostArg::Memory(id) => Some(*id),
                    HostArg::Value(_) => None,
                })
                .collect(),
        }
    }
}

/// Counters for what the queues actually executed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostStats {
    pub dispatches: u64,
    pub writes: u64,
    pub reads: u64,
    pub finishes: u64,
    pub acquires: u64,
    pub releases: u64,
}

/// CPU compute backend.
pub struct HeadlessCompute {
    devices: Vec<DeviceInfo>,
    queues: Vec<VecDeque<Command>>,
    memory: FxHashMap<u64, Allocation>,
    next_id: u64,
    host_kernels: FxHashMap<String, HostKernelFn>,
    stats: HostStats,
    failing_writes: u32,
}

impl HeadlessCompute {
    /// Backend exposing the given devices.
    #[must_use]
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            queues: Vec::new(),
            memory: FxHashMap::default(),
            next_id: 1,
            host_kernels: FxHashMap::default(),
            stats: HostStats::default(),
            failing_writes: 0,
        }
    }

    /// Backend exposing the host processor as a single CPU device.
    #[must_use]
    pub fn host() -> Self {
        let units = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self::new(vec![host_device_info("Host CPU", DeviceKind::Cpu, units)])
    }

    /// Register the host implementation executed for `entry_point`.
    pub fn register_kernel(
        &mut self,
        entry_point: &str,
        kernel: impl Fn(&mut HostDispatch<'_>) + Send + Sync + 'static,
    ) {
        self.host_kernels
            .insert(entry_point.to_string(), Arc::new(kernel));
    }

    #[must_use]
    pub fn stats(&self) -> HostStats {
        self.stats
    }

    /// Commands enqueued but not yet executed on `device`.
    #[must_use]
    pub fn pending(&self, device: usize) -> usize {
        self.queues.get(device).map_or(0, VecDeque::len)
    }

    /// Whether a graphics-backed allocation is currently held by compute.
    #[must_use]
    pub fn is_acquired(&self, memory: &HostMemory) -> bool {
        self.memory.get(&memory.0).is_some_and(|a| a.acquired)
    }

    /// Number of live allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.memory.len()
    }

    /// Make the next `count` writes fail with `OutOfResources`.
    pub fn fail_next_writes(&mut self, count: u32) {
        self.failing_writes = count;
    }

    fn queue(&mut self, device: usize) -> ComputeResult<&mut VecDeque<Command>> {
        self.queues.get_mut(device).ok_or_else(|| {
            ComputeError::api(
                ApiErrorCode::InvalidCommandQueue,
                format!("no command queue for device #{device}"),
            )
        })
    }

    fn enqueue(&mut self, device: usize, command: Command) -> ComputeResult<()> {
        self.queue(device)?;
        for id in command.memory_ids() {
            if let Some(alloc) = self.memory.get_mut(&id) {
                alloc.pending_refs += 1;
            }
        }
        self.queue(device)?.push_back(command);
        Ok(())
    }

    fn allocate(
        &mut self,
        device: usize,
        size: u64,
        graphics: Option<GraphicsObject>,
    ) -> HostMemory {
        let id = self.next_id;
        self.next_id += 1;
        self.memory.insert(
            id,
            Allocation {
                device,
                bytes: vec![0; size as usize],
                graphics,
                acquired: false,
                pending_refs: 0,
                released: false,
            },
        );
        HostMemory(id)
    }

    fn check_device(&self, device: usize) -> ComputeResult<&DeviceInfo> {
        self.devices.get(device).ok_or_else(|| {
            ComputeError::api(ApiErrorCode::InvalidDevice, format!("no device #{device}"))
        })
    }

    fn alloc(&self, memory: &HostMemory) -> ComputeResult<&Allocation> {
        self.memory
            .get(&memory.0)
            .filter(|a| !a.released)
            .ok_or_else(|| ComputeError::api(ApiErrorCode::InvalidMemObject, "released memory"))
    }

    fn alloc_mut(&mut self, memory: &HostMemory) -> ComputeResult<&mut Allocation> {
        self.memory
            .get_mut(&memory.0)
            .filter(|a| !a.released)
            .ok_or_else(|| ComputeError::api(ApiErrorCode::InvalidMemObject, "released memory"))
    }

    fn execute_queue(&mut self, device: usize) -> ComputeResult<()> {
        loop {
            let Some(command) = self.queue(device)?.pop_front() else {
                break;
            };
            let ids = command.memory_ids();
            self.execute(command);
            for id in ids {
                self.drop_ref(id);
            }
        }
        Ok(())
    }

    fn drop_ref(&mut self, id: u64) {
        let remove = match self.memory.get_mut(&id) {
            Some(alloc) => {
                alloc.pending_refs = alloc.pending_refs.saturating_sub(1);
                alloc.released && alloc.pending_refs == 0
            }
            None => false,
        };
        if remove {
            self.memory.remove(&id);
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Write { id, offset, data } => {
                if let Some(alloc) = self.memory.get_mut(&id) {
                    let end = (offset + data.len()).min(alloc.bytes.len());
                    if offset < end {
                        alloc.bytes[offset..end].copy_from_slice(&data[..end - offset]);
                    }
                    self.stats.writes += 1;
                }
            }
            Command::Dispatch {
                identifier,
                kernel,
                args,
                global,
            } => {
                self.stats.dispatches += 1;
                let Some(kernel) = kernel else {
                    log::trace!("\"{identifier}\": no host implementation, dispatch is a no-op");
                    return;
                };

                let mut data = Vec::with_capacity(args.len());
                let mut taken: Vec<(usize, u64)> = Vec::new();
                for (idx, arg) in args.iter().enumerate() {
                    match arg {
                        HostArg::Value(bytes) => data.push(HostArgData::Value(bytes.clone())),
                        HostArg::Memory(id) => {
                            if let Some((first, _)) = taken.iter().find(|(_, t)| t == id) {
                                data.push(HostArgData::Alias(*first));
                            } else {
                                let bytes = self
                                    .memory
                                    .get_mut(id)
                                    .map(|a| std::mem::take(&mut a.bytes))
                                    .unwrap_or_default();
                                taken.push((idx, *id));
                                data.push(HostArgData::Memory(bytes));
                            }
                        }
                    }
                }

                let mut dispatch = HostDispatch {
                    global,
                    args: &mut data,
                };
                kernel(&mut dispatch);

                for (idx, id) in taken {
                    let returned = std::mem::replace(&mut data[idx], HostArgData::Alias(idx));
                    if let (Some(alloc), HostArgData::Memory(bytes)) =
                        (self.memory.get_mut(&id), returned)
                    {
                        alloc.bytes = bytes;
                    }
                }
            }
        }
    }
}

/// Start of `len` bytes at `offset` if they fit in `size` bytes.
fn checked_range(offset: u64, len: usize, size: usize) -> Option<usize> {
    let start = usize::try_from(offset).ok()?;
    start.checked_add(len).filter(|&end| end <= size)?;
    Some(start)
}

impl Default for HeadlessCompute {
    fn default() -> Self {
        Self::host()
    }
}

/// Device description for a host-emulated processor.
#[must_use]
pub fn host_device_info(name: &str, kind: DeviceKind, units: u32) -> DeviceInfo {
    DeviceInfo {
        name: name.to_string(),
        vendor: Vendor::classify(0, name),
        kind,
        units,
        clock: 1000,
        memory_size: 1 << 30,
        max_alloc: 1 << 28,
        max_image_2d: (8192, 8192),
        max_image_3d: (2048, 2048, 2048),
        max_work_group_size: 256,
        max_work_item_sizes: [256, 256, 64],
        extensions: Vec::new(),
    }
}

impl ComputeBackend for HeadlessCompute {
    type Memory = HostMemory;
    type Program = HostProgram;

    fn enumerate_devices(
        &mut self,
        _use_platform_devices: bool,
        _platform_index: usize,
    ) -> ComputeResult<Vec<DeviceInfo>> {
        if self.devices.is_empty() {
            return Err(ComputeError::DeviceEnumeration(
                "host backend exposes no devices".to_string(),
            ));
        }
        Ok(self.devices.clone())
    }

    fn open_queues(&mut self, devices: &[usize]) -> ComputeResult<()> {
        let count = devices.iter().copied().max().map_or(0, |m| m + 1);
        self.queues.resize_with(count.max(self.queues.len()), VecDeque::new);
        Ok(())
    }

    fn flush(&mut self, device: usize) -> ComputeResult<()> {
        self.execute_queue(device)
    }

    fn finish(&mut self, device: usize) -> ComputeResult<()> {
        self.execute_queue(device)?;
        self.stats.finishes += 1;
        Ok(())
    }

    fn fixed_workgroup_size(&self) -> bool {
        false
    }

    fn create_buffer(
        &mut self,
        device: usize,
        size: u64,
        _flags: BufferFlags,
    ) -> ComputeResult<HostMemory> {
        self.check_device(device)?;
        Ok(self.allocate(device, size, None))
    }

    fn create_image(
        &mut self,
        device: usize,
        kind: &MemoryKind,
        _flags: BufferFlags,
    ) -> ComputeResult<HostMemory> {
        self.check_device(device)?;
        let size = match *kind {
            MemoryKind::Image2d {
                width,
                height,
                format,
            } => u64::from(width) * u64::from(height) * format.bytes_per_pixel(),
            MemoryKind::Image3d {
                width,
                height,
                depth,
                format,
            } => {
                u64::from(width) * u64::from(height) * u64::from(depth) * format.bytes_per_pixel()
            }
            _ => {
                return Err(ComputeError::api(
                    ApiErrorCode::InvalidValue,
                    "create_image requires an image kind",
                ));
            }
        };
        Ok(self.allocate(device, size, None))
    }

    fn import_graphics(
        &mut self,
        device: usize,
        object: &GraphicsObject,
        _flags: BufferFlags,
    ) -> ComputeResult<(HostMemory, u64)> {
        self.check_device(device)?;
        let size = match object {
            GraphicsObject::Buffer { size, .. } => *size,
            _ => 0,
        };
        Ok((self.allocate(device, size, Some(*object)), size))
    }

    fn release_memory(&mut self, memory: HostMemory) {
        let remove = match self.memory.get_mut(&memory.0) {
            Some(alloc) => {
                alloc.released = true;
                alloc.pending_refs == 0
            }
            None => false,
        };
        if remove {
            self.memory.remove(&memory.0);
        }
    }

    fn write(
        &mut self,
        memory: &HostMemory,
        offset: u64,
        data: &[u8],
        blocking: bool,
    ) -> ComputeResult<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(ComputeError::api(
                ApiErrorCode::OutOfResources,
                "write rejected by the device",
            ));
        }
        let alloc = self.alloc(memory)?;
        let device = alloc.device;
        let Some(start) = checked_range(offset, data.len(), alloc.bytes.len()) else {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidValue,
                format!(
                    "write of {} bytes at offset {offset} exceeds {} bytes",
                    data.len(),
                    alloc.bytes.len()
                ),
            ));
        };
        self.enqueue(
            device,
            Command::Write {
                id: memory.0,
                offset: start,
                data: data.to_vec(),
            },
        )?;
        if blocking {
            self.finish(device)?;
        }
        Ok(())
    }

    fn read(
        &mut self,
        memory: &HostMemory,
        offset: u64,
        dst: &mut [u8],
        blocking: bool,
    ) -> ComputeResult<()> {
        let device = self.alloc(memory)?.device;
        // in-order queue: everything enqueued so far precedes this read
        if blocking {
            self.finish(device)?;
        } else {
            self.flush(device)?;
        }

        let alloc = self.alloc(memory)?;
        let Some(start) = checked_range(offset, dst.len(), alloc.bytes.len()) else {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidValue,
                format!(
                    "read of {} bytes at offset {offset} exceeds {} bytes",
                    dst.len(),
                    alloc.bytes.len()
                ),
            ));
        };
        dst.copy_from_slice(&alloc.bytes[start..start + dst.len()]);
        self.stats.reads += 1;
        Ok(())
    }

    fn map(
        &mut self,
        memory: &HostMemory,
        _access: MapAccess,
        blocking: bool,
    ) -> ComputeResult<Vec<u8>> {
        let device = self.alloc(memory)?.device;
        if blocking {
            self.finish(device)?;
        } else {
            self.flush(device)?;
        }
        Ok(self.alloc(memory)?.bytes.clone())
    }

    fn unmap(&mut self, memory: &HostMemory, access: MapAccess, data: &[u8]) -> ComputeResult<()> {
        let alloc = self.alloc_mut(memory)?;
        if access.writes() {
            let len = data.len().min(alloc.bytes.len());
            alloc.bytes[..len].copy_from_slice(&data[..len]);
        }
        Ok(())
    }

    fn acquire_graphics(&mut self, memory: &HostMemory) -> ComputeResult<()> {
        let alloc = self.alloc_mut(memory)?;
        if alloc.graphics.is_none() {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidGlObject,
                "memory object is not backed by a graphics object",
            ));
        }
        alloc.acquired = true;
        self.stats.acquires += 1;
        Ok(())
    }

    fn release_graphics(&mut self, memory: &HostMemory) -> ComputeResult<()> {
        let alloc = self.alloc_mut(memory)?;
        if alloc.graphics.is_none() {
            return Err(ComputeError::api(
                ApiErrorCode::InvalidGlObject,
                "memory object is not backed by a graphics object",
            ));
        }
        alloc.acquired = false;
        self.stats.releases += 1;
        Ok(())
    }

    fn compile(
        &mut self,
        device: usize,
        identifier: &str,
        _source: &str,
        entry_point: &str,
        layout: &KernelLayout,
    ) -> ComputeResult<HostProgram> {
        self.check_device(device)?;
        Ok(HostProgram {
            device,
            identifier: identifier.to_string(),
            entry_point: entry_point.to_string(),
            kernel: self.host_kernels.get(entry_point).cloned(),
            args: vec![None; layout.args.len()],
        })
    }

    fn destroy_program(&mut self, program: HostProgram) {
        log::trace!("destroying host program \"{}\"", program.identifier);
    }

    fn set_arg(
        &mut self,
        program: &mut HostProgram,
        index: u32,
        arg: BackendArg<'_, HostMemory>,
    ) -> ComputeResult<()> {
        let bound = match arg {
            BackendArg::Memory(memory) => {
                self.alloc(memory)?;
                HostArg::Memory(memory.0)
            }
            BackendArg::Value(bytes) => HostArg::Value(bytes.to_vec()),
        };
        let slot = program.args.get_mut(index as usize).ok_or_else(|| {
            ComputeError::api(ApiErrorCode::InvalidArgIndex, format!("no argument #{index}"))
        })?;
        *slot = Some(bound);
        Ok(())
    }

    fn dispatch(
        &mut self,
        program: &HostProgram,
        global: &NdRange,
        _local: &NdRange,
    ) -> ComputeResult<()> {
        let args = program
            .args
            .iter()
            .enumerate()
            .map(|(idx, arg)| {
                arg.clone().ok_or_else(|| {
                    ComputeError::api(
                        ApiErrorCode::InvalidKernelArgs,
                        format!("argument #{idx} is not set"),
                    )
                })
            })
            .collect::<ComputeResult<Vec<_>>>()?;

        self.enqueue(
            program.device,
            Command::Dispatch {
                identifier: program.identifier.clone(),
                kernel: program.kernel.clone(),
                args,
                global: *global,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(args: usize) -> KernelLayout {
        KernelLayout {
            args: vec![super::super::kernel::ArgKind::StorageBuffer { read_only: false }; args],
            workgroup_size: [1, 1, 1],
        }
    }

    #[test]
    fn test_commands_execute_on_flush_in_order() {
        let mut backend = HeadlessCompute::host();
        backend.open_queues(&[0]).unwrap();
        backend.register_kernel("increment", |d| {
            if let Some(bytes) = d.memory_mut(0) {
                for b in bytes.iter_mut() {
                    *b += 1;
                }
            }
        });

        let mem = backend.create_buffer(0, 4, BufferFlags::default()).unwrap();
        backend.write(&mem, 0, &[1, 2, 3, 4], false).unwrap();
        let mut program = backend.compile(0, "inc", "", "increment", &layout(1)).unwrap();
        backend.set_arg(&mut program, 0, BackendArg::Memory(&mem)).unwrap();
        backend.dispatch(&program, &NdRange::one(4), &NdRange::one(4)).unwrap();

        assert_eq!(backend.pending(0), 2);
        backend.finish(0).unwrap();
        assert_eq!(backend.pending(0), 0);

        let mut out = [0u8; 4];
        backend.read(&mem, 0, &mut out, true).unwrap();
        assert_eq!(out, [2, 3, 4, 5]);
    }

    #[test]
    fn test_release_is_deferred_until_commands_complete() {
        let mut backend = HeadlessCompute::host();
        backend.open_queues(&[0]).unwrap();

        let mem = backend.create_buffer(0, 4, BufferFlags::default()).unwrap();
        backend.write(&mem, 0, &[9; 4], false).unwrap();
        backend.release_memory(mem);
        assert_eq!(backend.live_allocations(), 1);

        backend.finish(0).unwrap();
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_no_devices_is_an_enumeration_error() {
        let mut backend = HeadlessCompute::new(Vec::new());
        let err = backend.enumerate_devices(false, 0).unwrap_err();
        assert!(matches!(err, ComputeError::DeviceEnumeration(_)));
    }

    #[test]
    fn test_out_of_range_offsets_are_rejected() {
        let mut backend = HeadlessCompute::host();
        backend.open_queues(&[0]).unwrap();
        let mem = backend.create_buffer(0, 4, BufferFlags::default()).unwrap();

        let err = backend.write(&mem, u64::MAX, &[1, 2], true).unwrap_err();
        assert_eq!(err.code(), ApiErrorCode::InvalidValue);
        let mut out = [0u8; 2];
        let err = backend.read(&mem, u64::MAX - 1, &mut out, true).unwrap_err();
        assert_eq!(err.code(), ApiErrorCode::InvalidValue);
        assert!(backend.write(&mem, 3, &[1, 2], true).is_err());
        backend.write(&mem, 2, &[1, 2], true).unwrap();
    }

    #[test]
    fn test_failing_writes_recover() {
        let mut backend = HeadlessCompute::host();
        backend.open_queues(&[0]).unwrap();
        let mem = backend.create_buffer(0, 4, BufferFlags::default()).unwrap();

        backend.fail_next_writes(1);
        let err = backend.write(&mem, 0, &[1], true).unwrap_err();
        assert_eq!(err.code(), ApiErrorCode::OutOfResources);
        backend.write(&mem, 0, &[1], true).unwrap();
        assert_eq!(backend.stats().writes, 1);
    }
}
