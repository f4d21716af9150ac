// Host reference backend
//
// Runs the compute contract on the CPU. Devices come from a configurable
// topology, kernels are native Rust functions looked up by entry point name,
// and every enqueue executes immediately, which trivially keeps the queue
// in order. Interop ownership is enforced strictly so protocol mistakes
// surface as API errors instead of silent races.

pub mod graphics;
pub mod kernels;
pub mod source;

pub use graphics::{HostGraphics, SharedAllocation};
pub use kernels::{HostArg, NativeKernel, NdRange};

use crate::compute::backend::{
    AccessMode, ArgValue, BufferId, BuildFailure, ComputeBackend, ContextId, DeviceClass,
    DeviceEnumerator, DeviceId, DeviceInfo, GraphicsBufferHandle, GraphicsShareGroup, KernelId,
    PlatformId, PlatformInfo, ProgramId, QueueId, RawHandle,
};
use crate::compute::error::Status;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Extension string host devices advertise when they can share buffers.
pub const HOST_INTEROP_EXTENSION: &str = "host_graphics_sharing";

#[derive(Debug, Clone)]
pub struct HostDevice {
    pub name: String,
    pub class: DeviceClass,
    pub vendor_id: u32,
    pub extensions: Vec<String>,
}

impl HostDevice {
    pub fn new(name: &str, class: DeviceClass, vendor_id: u32) -> Self {
        Self {
            name: name.to_string(),
            class,
            vendor_id,
            extensions: vec![HOST_INTEROP_EXTENSION.to_string()],
        }
    }

    pub fn without_interop(mut self) -> Self {
        self.extensions.retain(|e| e != HOST_INTEROP_EXTENSION);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HostPlatform {
    pub name: String,
    pub devices: Vec<HostDevice>,
}

impl HostPlatform {
    pub fn new(name: &str, devices: Vec<HostDevice>) -> Self {
        Self {
            name: name.to_string(),
            devices,
        }
    }
}

/// One queue operation, recorded in execution order when tracing is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Write { buffer: BufferId, bytes: usize },
    Read { buffer: BufferId, bytes: usize },
    Acquire { buffer: BufferId },
    Release { buffer: BufferId },
    Dispatch { kernel: String, global: [usize; 3] },
    Finish,
}

struct HostBuffer {
    storage: Arc<SharedAllocation>,
    access: AccessMode,
    interop: bool,
}

impl HostBuffer {
    fn check_owned(&self) -> Result<(), Status> {
        if self.interop && !self.storage.compute_owned() {
            Err(Status::GraphicsObjectNotAcquired)
        } else {
            Ok(())
        }
    }
}

struct HostKernel {
    name: String,
    func: NativeKernel,
    args: Vec<Option<ArgValue>>,
}

struct HostContext {
    id: RawHandle,
    linked: bool,
}

#[derive(Default)]
struct HostState {
    next_handle: RawHandle,
    context: Option<HostContext>,
    programs: HashMap<RawHandle, HashMap<String, usize>>,
    queues: HashSet<RawHandle>,
    kernels: HashMap<RawHandle, HostKernel>,
    buffers: HashMap<RawHandle, HostBuffer>,
    trace: Vec<QueueEvent>,
}

impl HostState {
    fn next(&mut self) -> RawHandle {
        self.next_handle += 1;
        self.next_handle
    }

    fn require_context(&self) -> Result<&HostContext, Status> {
        self.context.as_ref().ok_or(Status::InvalidContext)
    }

    fn require_queue(&self, queue: QueueId) -> Result<(), Status> {
        if self.queues.contains(&queue.raw()) {
            Ok(())
        } else {
            Err(Status::InvalidQueue)
        }
    }

    fn require_buffer(&self, buffer: BufferId) -> Result<&HostBuffer, Status> {
        self.buffers.get(&buffer.raw()).ok_or(Status::InvalidBuffer)
    }
}

enum Slot<'a> {
    Global(MutexGuard<'a, Vec<u64>>, usize),
    Local(Vec<u64>, usize),
}

pub struct HostBackend {
    topology: Vec<HostPlatform>,
    natives: HashMap<String, NativeKernel>,
    graphics: Option<HostGraphics>,
    tracing: bool,
    max_allocation: Option<usize>,
    state: Mutex<HostState>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    /// One platform with a single CPU device that supports interop.
    pub fn new() -> Self {
        let platform = HostPlatform::new(
            "Host Reference Platform",
            vec![HostDevice::new("Host Reference Device", DeviceClass::Cpu, 0)],
        );

        Self {
            topology: vec![platform],
            natives: kernels::builtin()
                .into_iter()
                .map(|(name, func)| (name.to_string(), func))
                .collect(),
            graphics: None,
            tracing: false,
            max_allocation: None,
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn with_topology(mut self, platforms: Vec<HostPlatform>) -> Self {
        self.topology = platforms;
        self
    }

    /// Link to the graphics side whose vertex buffers may be imported.
    pub fn with_graphics(mut self, graphics: &HostGraphics) -> Self {
        self.graphics = Some(graphics.clone());
        self
    }

    pub fn with_kernel(mut self, name: &str, func: NativeKernel) -> Self {
        self.natives.insert(name.to_string(), func);
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    /// Largest single compute allocation; bigger requests fail with
    /// `InvalidBufferSize`. Imported graphics buffers are not affected.
    pub fn with_max_allocation(mut self, bytes: usize) -> Self {
        self.max_allocation = Some(bytes);
        self
    }

    /// Drain the recorded queue events.
    pub fn take_trace(&self) -> Vec<QueueEvent> {
        std::mem::take(&mut self.state.lock().trace)
    }

    fn record(&self, state: &mut HostState, event: QueueEvent) {
        if self.tracing {
            state.trace.push(event);
        }
    }

    fn locate(&self, device: DeviceId) -> Option<(usize, &HostDevice)> {
        let raw = device.raw();
        let platform = (raw >> 32).checked_sub(1)? as usize;
        let index = (raw & 0xffff_ffff).checked_sub(1)? as usize;
        let found = self.topology.get(platform)?.devices.get(index)?;
        Some((platform, found))
    }
}

fn platform_id(index: usize) -> PlatformId {
    PlatformId(index as RawHandle + 1)
}

fn device_id(platform: usize, index: usize) -> DeviceId {
    DeviceId(((platform as RawHandle + 1) << 32) | (index as RawHandle + 1))
}

impl DeviceEnumerator for HostBackend {
    fn platforms(&self) -> Result<Vec<PlatformInfo>, Status> {
        Ok(self
            .topology
            .iter()
            .enumerate()
            .map(|(i, p)| PlatformInfo {
                id: platform_id(i),
                name: p.name.clone(),
            })
            .collect())
    }

    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceInfo>, Status> {
        let index = (platform.raw() as usize)
            .checked_sub(1)
            .ok_or(Status::InvalidPlatform)?;
        let found = self.topology.get(index).ok_or(Status::InvalidPlatform)?;

        if found.devices.is_empty() {
            return Err(Status::DeviceNotFound);
        }

        Ok(found
            .devices
            .iter()
            .enumerate()
            .map(|(d, dev)| DeviceInfo {
                id: device_id(index, d),
                name: dev.name.clone(),
                class: dev.class,
                vendor_id: dev.vendor_id,
            })
            .collect())
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn interop_extension(&self) -> &'static str {
        HOST_INTEROP_EXTENSION
    }

    fn device_extensions(&self, device: DeviceId) -> Result<Vec<String>, Status> {
        self.locate(device)
            .map(|(_, d)| d.extensions.clone())
            .ok_or(Status::InvalidDevice)
    }

    fn create_context(
        &self,
        platform: PlatformId,
        device: DeviceId,
        share_group: Option<&GraphicsShareGroup>,
    ) -> Result<ContextId, Status> {
        let (owner, _) = self.locate(device).ok_or(Status::InvalidDevice)?;
        if platform_id(owner) != platform {
            return Err(Status::InvalidPlatform);
        }

        if let Some(group) = share_group {
            match &self.graphics {
                Some(graphics) if graphics.group() == group.context => {}
                _ => return Err(Status::InvalidGraphicsObject),
            }
        }

        let mut state = self.state.lock();
        if state.context.is_some() {
            return Err(Status::InvalidOperation);
        }

        let id = state.next();
        state.context = Some(HostContext {
            id,
            linked: share_group.is_some(),
        });
        Ok(ContextId(id))
    }

    fn release_context(&self, context: ContextId) {
        let mut state = self.state.lock();
        if state.context.as_ref().map(|c| c.id) == Some(context.raw()) {
            state.context = None;
        }
    }

    fn build_program(&self, source: &[u8]) -> Result<ProgramId, BuildFailure> {
        let mut state = self.state.lock();
        if state.context.is_none() {
            return Err(BuildFailure {
                status: Status::InvalidContext,
                log: String::new(),
            });
        }

        let entries = source::scan_entry_points(source).map_err(|log| BuildFailure {
            status: Status::BuildProgramFailure,
            log,
        })?;

        let id = state.next();
        state.programs.insert(id, entries);
        Ok(ProgramId(id))
    }

    fn release_program(&self, program: ProgramId) {
        self.state.lock().programs.remove(&program.raw());
    }

    fn create_queue(&self) -> Result<QueueId, Status> {
        let mut state = self.state.lock();
        state.require_context()?;
        let id = state.next();
        state.queues.insert(id);
        Ok(QueueId(id))
    }

    fn release_queue(&self, queue: QueueId) {
        self.state.lock().queues.remove(&queue.raw());
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId, Status> {
        let mut state = self.state.lock();
        let entries = state
            .programs
            .get(&program.raw())
            .ok_or(Status::InvalidProgram)?;
        let params = *entries.get(name).ok_or(Status::InvalidKernelName)?;
        let func = *self.natives.get(name).ok_or(Status::InvalidKernel)?;

        let id = state.next();
        state.kernels.insert(
            id,
            HostKernel {
                name: name.to_string(),
                func,
                args: vec![None; params],
            },
        );
        Ok(KernelId(id))
    }

    fn release_kernel(&self, kernel: KernelId) {
        self.state.lock().kernels.remove(&kernel.raw());
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: ArgValue) -> Result<(), Status> {
        let mut state = self.state.lock();

        match value {
            ArgValue::Buffer(buffer) => {
                state.require_buffer(buffer)?;
            }
            ArgValue::Local(0) => return Err(Status::InvalidArgSize),
            ArgValue::Local(_) => {}
        }

        let entry = state
            .kernels
            .get_mut(&kernel.raw())
            .ok_or(Status::InvalidKernel)?;
        let slot = entry
            .args
            .get_mut(index as usize)
            .ok_or(Status::InvalidArgIndex)?;
        *slot = Some(value);
        Ok(())
    }

    fn create_buffer(&self, size: usize, access: AccessMode) -> Result<BufferId, Status> {
        if size == 0 || self.max_allocation.is_some_and(|max| size > max) {
            return Err(Status::InvalidBufferSize);
        }

        let mut state = self.state.lock();
        state.require_context()?;
        let id = state.next();
        state.buffers.insert(
            id,
            HostBuffer {
                storage: Arc::new(SharedAllocation::new(size)),
                access,
                interop: false,
            },
        );
        Ok(BufferId(id))
    }

    fn import_graphics_buffer(
        &self,
        graphics: GraphicsBufferHandle,
        access: AccessMode,
    ) -> Result<BufferId, Status> {
        let mut state = self.state.lock();
        if !state.require_context()?.linked {
            return Err(Status::InvalidContext);
        }

        let storage = self
            .graphics
            .as_ref()
            .and_then(|g| g.allocation(graphics))
            .ok_or(Status::InvalidGraphicsObject)?;

        let id = state.next();
        state.buffers.insert(
            id,
            HostBuffer {
                storage,
                access,
                interop: true,
            },
        );
        Ok(BufferId(id))
    }

    fn release_buffer(&self, buffer: BufferId) {
        self.state.lock().buffers.remove(&buffer.raw());
    }

    fn enqueue_write(&self, queue: QueueId, buffer: BufferId, data: &[u8]) -> Result<(), Status> {
        let mut state = self.state.lock();
        state.require_queue(queue)?;

        let target = state.require_buffer(buffer)?;
        if data.len() > target.storage.len() {
            return Err(Status::InvalidBufferSize);
        }
        target.check_owned()?;
        target.storage.copy_from(data);

        self.record(
            &mut state,
            QueueEvent::Write {
                buffer,
                bytes: data.len(),
            },
        );
        Ok(())
    }

    fn enqueue_read(&self, queue: QueueId, buffer: BufferId, out: &mut [u8]) -> Result<(), Status> {
        let mut state = self.state.lock();
        state.require_queue(queue)?;

        let source = state.require_buffer(buffer)?;
        if out.len() > source.storage.len() {
            return Err(Status::InvalidBufferSize);
        }
        source.check_owned()?;
        if source.access == AccessMode::WriteOnly {
            log::trace!("Host read of write-only buffer {:#x}", buffer.raw());
        }
        source.storage.copy_to(out);

        self.record(
            &mut state,
            QueueEvent::Read {
                buffer,
                bytes: out.len(),
            },
        );
        Ok(())
    }

    fn enqueue_dispatch(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: [usize; 3],
        local: [usize; 3],
        _wait_count: u32,
    ) -> Result<(), Status> {
        let mut state = self.state.lock();
        state.require_queue(queue)?;

        let entry = state.kernels.get(&kernel.raw()).ok_or(Status::InvalidKernel)?;
        let (name, func) = (entry.name.clone(), entry.func);

        let divides = global
            .iter()
            .zip(local.iter())
            .all(|(&g, &l)| l != 0 && g % l == 0);
        if !divides {
            return Err(Status::InvalidWorkGroupSize);
        }

        let values: Vec<ArgValue> = entry
            .args
            .iter()
            .copied()
            .collect::<Option<_>>()
            .ok_or(Status::InvalidKernelArgs)?;

        let mut seen = HashSet::new();
        let mut storages = Vec::with_capacity(values.len());
        for value in &values {
            match *value {
                ArgValue::Buffer(id) => {
                    if !seen.insert(id) {
                        return Err(Status::InvalidArgValue);
                    }
                    let bound = state.require_buffer(id)?;
                    bound.check_owned()?;
                    storages.push(Some(Arc::clone(&bound.storage)));
                }
                ArgValue::Local(_) => storages.push(None),
            }
        }

        let mut slots: Vec<Slot<'_>> = values
            .iter()
            .zip(storages.iter())
            .map(|(value, storage)| match (value, storage) {
                (_, Some(storage)) => Slot::Global(storage.lock(), storage.len()),
                (ArgValue::Local(size), None) => Slot::Local(vec![0u64; size.div_ceil(8)], *size),
                (ArgValue::Buffer(_), None) => Slot::Local(Vec::new(), 0),
            })
            .collect();

        let mut args: Vec<HostArg<'_>> = slots
            .iter_mut()
            .map(|slot| match slot {
                Slot::Global(words, len) => {
                    HostArg::Global(&mut bytemuck::cast_slice_mut::<u64, u8>(&mut words[..])[..*len])
                }
                Slot::Local(words, len) => {
                    HostArg::Local(&mut bytemuck::cast_slice_mut::<u64, u8>(&mut words[..])[..*len])
                }
            })
            .collect();

        func(&NdRange { global, local }, &mut args)?;
        drop(args);
        drop(slots);

        self.record(&mut state, QueueEvent::Dispatch { kernel: name, global });
        Ok(())
    }

    fn enqueue_acquire_graphics(&self, queue: QueueId, buffers: &[BufferId]) -> Result<(), Status> {
        let mut state = self.state.lock();
        state.require_queue(queue)?;

        for &buffer in buffers {
            let shared = state.require_buffer(buffer)?;
            if !shared.interop {
                return Err(Status::InvalidGraphicsObject);
            }
            if shared.storage.compute_owned() {
                return Err(Status::InvalidOperation);
            }
            shared.storage.set_compute_owned(true);
            self.record(&mut state, QueueEvent::Acquire { buffer });
        }
        Ok(())
    }

    fn enqueue_release_graphics(&self, queue: QueueId, buffers: &[BufferId]) -> Result<(), Status> {
        let mut state = self.state.lock();
        state.require_queue(queue)?;

        for &buffer in buffers {
            let shared = state.require_buffer(buffer)?;
            if !shared.interop {
                return Err(Status::InvalidGraphicsObject);
            }
            if !shared.storage.compute_owned() {
                return Err(Status::InvalidOperation);
            }
            shared.storage.set_compute_owned(false);
            self.record(&mut state, QueueEvent::Release { buffer });
        }
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> Result<(), Status> {
        let mut state = self.state.lock();
        state.require_queue(queue)?;
        self.record(&mut state, QueueEvent::Finish);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(backend: &HostBackend) -> ContextId {
        let device = device_id(0, 0);
        backend.create_context(platform_id(0), device, None).unwrap()
    }

    #[test]
    fn default_topology_has_one_interop_cpu() {
        let backend = HostBackend::new();
        let platforms = backend.platforms().unwrap();
        assert_eq!(platforms.len(), 1);
        let devices = backend.devices(platforms[0].id).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].class, DeviceClass::Cpu);
        assert!(backend
            .device_extensions(devices[0].id)
            .unwrap()
            .contains(&HOST_INTEROP_EXTENSION.to_string()));
    }

    #[test]
    fn only_one_live_context() {
        let backend = HostBackend::new();
        let first = context(&backend);
        assert_eq!(
            backend.create_context(platform_id(0), device_id(0, 0), None),
            Err(Status::InvalidOperation)
        );
        backend.release_context(first);
        context(&backend);
    }

    #[test]
    fn dispatch_requires_every_argument() {
        let backend = HostBackend::new();
        context(&backend);
        let program = backend
            .build_program(b"__kernel void ArrayMultiply(__global float* a, __global float* b, __global float* c) {}")
            .unwrap();
        let queue = backend.create_queue().unwrap();
        let kernel = backend.create_kernel(program, "ArrayMultiply").unwrap();
        let a = backend.create_buffer(16, AccessMode::ReadOnly).unwrap();

        backend.set_kernel_arg(kernel, 0, ArgValue::Buffer(a)).unwrap();
        assert_eq!(
            backend.set_kernel_arg(kernel, 3, ArgValue::Buffer(a)),
            Err(Status::InvalidArgIndex)
        );
        assert_eq!(
            backend.enqueue_dispatch(queue, kernel, [4, 1, 1], [1, 1, 1], 0),
            Err(Status::InvalidKernelArgs)
        );
    }

    #[test]
    fn aliased_arguments_are_rejected() {
        let backend = HostBackend::new();
        context(&backend);
        let program = backend
            .build_program(b"__kernel void ArrayMultiply(__global float* a, __global float* b, __global float* c) {}")
            .unwrap();
        let queue = backend.create_queue().unwrap();
        let kernel = backend.create_kernel(program, "ArrayMultiply").unwrap();
        let a = backend.create_buffer(16, AccessMode::ReadWrite).unwrap();
        for index in 0..3 {
            backend.set_kernel_arg(kernel, index, ArgValue::Buffer(a)).unwrap();
        }
        assert_eq!(
            backend.enqueue_dispatch(queue, kernel, [4, 1, 1], [2, 1, 1], 0),
            Err(Status::InvalidArgValue)
        );
    }

    #[test]
    fn entry_without_native_implementation() {
        let backend = HostBackend::new();
        context(&backend);
        let program = backend.build_program(b"__kernel void Blur(__global float* a) {}").unwrap();
        assert_eq!(backend.create_kernel(program, "Blur"), Err(Status::InvalidKernel));
        assert_eq!(
            backend.create_kernel(program, "Sharpen"),
            Err(Status::InvalidKernelName)
        );
    }
}
