// Vulkan compute backend
//
// One instance is the single platform; every physical device is a compute
// device. Programs are SPIR-V modules, kernels are their compute entry
// points. Commands are recorded per queue and submitted when the host has
// to observe results.
//
// Interop: vertex buffers come from `VulkanGraphics` on the same logical
// device. Acquire/release record the compute half of a queue family
// ownership transfer when graphics and compute use different families;
// the renderer records the matching half on its own queue.

pub mod buffer;
pub mod device;
pub mod graphics;
pub mod shader;
pub mod sync;

pub use device::{VulkanDevice, VulkanInstance};
pub use graphics::VulkanGraphics;

use crate::compute::backend::{
    AccessMode, ArgValue, BufferId, BuildFailure, ComputeBackend, ContextId, DeviceClass,
    DeviceEnumerator, DeviceId, DeviceInfo, GraphicsBufferHandle, GraphicsShareGroup, KernelId,
    PlatformId, PlatformInfo, ProgramId, QueueId,
};
use crate::compute::error::Status;
use ash::vk;
use ash::vk::Handle;
use buffer::{DeviceMemory, STORAGE_USAGE};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use shader::{LOCAL_ARG_CONSTANT_BASE, LOCAL_SIZE_CONSTANT_IDS};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use sync::CommandBatch;

pub const EXTERNAL_MEMORY_EXTENSION: &str = "VK_KHR_external_memory";

/// Storage buffer bindings a kernel may use.
pub const MAX_KERNEL_ARGS: u32 = 16;

const PLATFORM: PlatformId = PlatformId(1);

/// Map a Vulkan result code onto the portable status set.
pub(crate) fn status_from(result: vk::Result) -> Status {
    match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => Status::OutOfHostMemory,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Status::AllocationFailure,
        vk::Result::ERROR_DEVICE_LOST | vk::Result::ERROR_INITIALIZATION_FAILED => {
            Status::DeviceNotAvailable
        }
        vk::Result::ERROR_EXTENSION_NOT_PRESENT | vk::Result::ERROR_FEATURE_NOT_PRESENT => {
            Status::InvalidDevice
        }
        vk::Result::ERROR_TOO_MANY_OBJECTS | vk::Result::ERROR_OUT_OF_POOL_MEMORY => {
            Status::OutOfResources
        }
        other => Status::Native(other.as_raw()),
    }
}

fn status_from_anyhow(err: &anyhow::Error, fallback: Status) -> Status {
    err.downcast_ref::<vk::Result>()
        .map(|r| status_from(*r))
        .unwrap_or(fallback)
}

fn device_class(device_type: vk::PhysicalDeviceType) -> DeviceClass {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU
        | vk::PhysicalDeviceType::INTEGRATED_GPU
        | vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceClass::Gpu,
        vk::PhysicalDeviceType::CPU => DeviceClass::Cpu,
        _ => DeviceClass::Accelerator,
    }
}

struct ProgramEntry {
    module: vk::ShaderModule,
    entry_points: Vec<String>,
}

/// Specialization of one kernel: work-group size, bound slots, scratch sizes.
#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    local: [u32; 3],
    bindings: Vec<u32>,
    locals: Vec<(u32, u32)>,
}

#[derive(Clone, Copy)]
struct KernelPipeline {
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl KernelPipeline {
    fn create(
        device: &VulkanDevice,
        module: vk::ShaderModule,
        entry: &CStr,
        key: &PipelineKey,
    ) -> Result<Self, Status> {
        let bindings: Vec<_> = key
            .bindings
            .iter()
            .map(|&binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();

        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout =
            unsafe { device.device.create_descriptor_set_layout(&set_layout_info, None) }
                .map_err(status_from)?;

        let layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(std::slice::from_ref(&set_layout));
        let layout = match unsafe { device.device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(status_from(e));
            }
        };

        let mut constants: Vec<u32> = key.local.to_vec();
        let mut map_entries: Vec<_> = LOCAL_SIZE_CONSTANT_IDS
            .iter()
            .enumerate()
            .map(|(i, &id)| {
                vk::SpecializationMapEntry::default()
                    .constant_id(id)
                    .offset((i * 4) as u32)
                    .size(4)
            })
            .collect();
        for &(index, bytes) in &key.locals {
            map_entries.push(
                vk::SpecializationMapEntry::default()
                    .constant_id(LOCAL_ARG_CONSTANT_BASE + index)
                    .offset((constants.len() * 4) as u32)
                    .size(4),
            );
            constants.push(bytes);
        }

        let specialization = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(bytemuck::cast_slice(&constants));

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(entry)
            .specialization_info(&specialization);

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let created = unsafe {
            device.device.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&create_info),
                None,
            )
        };

        match created {
            Ok(pipelines) => Ok(Self {
                set_layout,
                layout,
                pipeline: pipelines[0],
            }),
            Err((_, e)) => {
                log::error!(
                    "Failed to create compute pipeline for '{}': {:?}",
                    entry.to_string_lossy(),
                    e
                );
                unsafe {
                    device.device.destroy_pipeline_layout(layout, None);
                    device.device.destroy_descriptor_set_layout(set_layout, None);
                }
                Err(status_from(e))
            }
        }
    }

    fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.layout, None);
            device
                .device
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

struct KernelEntry {
    program: u64,
    entry: CString,
    args: Vec<Option<ArgValue>>,
    pipelines: HashMap<PipelineKey, KernelPipeline>,
}

enum Backing {
    Owned(DeviceMemory),
    Imported,
}

struct BufferEntry {
    buffer: vk::Buffer,
    size: usize,
    access: AccessMode,
    backing: Backing,
    acquired: bool,
}

impl BufferEntry {
    fn check_usable(&self) -> Result<(), Status> {
        match self.backing {
            Backing::Imported if !self.acquired => Err(Status::GraphicsObjectNotAcquired),
            _ => Ok(()),
        }
    }
}

struct GraphicsEntry {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
}

#[derive(Default)]
struct VulkanState {
    next_handle: u64,
    device: Option<VulkanDevice>,
    context: Option<ContextId>,
    programs: HashMap<u64, ProgramEntry>,
    queues: HashMap<u64, CommandBatch>,
    kernels: HashMap<u64, KernelEntry>,
    buffers: HashMap<u64, BufferEntry>,
    graphics: HashMap<u64, GraphicsEntry>,
}

impl VulkanState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Submit every queue and wait, so no recorded command still refers to
    /// an object about to be destroyed.
    fn wait_all(&mut self) {
        if let Some(device) = self.device.as_ref() {
            for batch in self.queues.values_mut().filter(|b| b.is_recording()) {
                if let Err(e) = batch.submit_and_wait(device) {
                    log::warn!("Queue flush before release failed: {:?}", e);
                }
            }
        }
    }

    fn teardown(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };

        for (_, batch) in self.queues.drain() {
            batch.destroy(&device);
        }
        let _ = device.wait_idle();

        for (_, kernel) in self.kernels.drain() {
            for pipeline in kernel.pipelines.values() {
                pipeline.destroy(&device);
            }
        }
        for (_, program) in self.programs.drain() {
            unsafe { device.device.destroy_shader_module(program.module, None) };
        }
        for (_, buffer) in self.buffers.drain() {
            if let Backing::Owned(memory) = buffer.backing {
                memory.free(&device);
            }
        }
        if !self.graphics.is_empty() {
            log::warn!(
                "Destroying {} vertex buffers still owned by graphics",
                self.graphics.len()
            );
        }
        for (_, graphics) in self.graphics.drain() {
            unsafe {
                device.device.destroy_buffer(graphics.buffer, None);
                device.device.free_memory(graphics.memory, None);
            }
        }
        self.context = None;
    }
}

pub struct VulkanBackend {
    // Declared before the instance: the device must go first
    state: Mutex<VulkanState>,
    instance: VulkanInstance,
}

impl VulkanBackend {
    pub fn new(enable_validation: bool) -> anyhow::Result<Self> {
        let instance = VulkanInstance::new("particle-interop", enable_validation)?;
        Ok(Self {
            state: Mutex::new(VulkanState::default()),
            instance,
        })
    }

    /// Handles to pass to `ComputeContext::initialize` so the context shares
    /// buffers with `VulkanGraphics` on `device`.
    pub fn share_group(&self, device: DeviceId) -> GraphicsShareGroup {
        GraphicsShareGroup {
            context: self.instance.instance.handle().as_raw(),
            device: device.raw(),
        }
    }

    fn physical(&self, device: DeviceId) -> Result<vk::PhysicalDevice, Status> {
        let handle = vk::PhysicalDevice::from_raw(device.raw());
        let known = self.instance.physical_devices().map_err(status_from)?;
        if known.contains(&handle) {
            Ok(handle)
        } else {
            Err(Status::InvalidDevice)
        }
    }

    pub(crate) fn create_graphics_buffer(
        &self,
        byte_size: usize,
    ) -> Result<GraphicsBufferHandle, Status> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let device = state.device.as_ref().ok_or(Status::InvalidContext)?;

        let (buffer, memory) = buffer::create_buffer(
            device,
            byte_size.max(4) as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER | STORAGE_USAGE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .map_err(|e| {
            log::error!("Vertex buffer creation failed: {:#}", e);
            status_from_anyhow(&e, Status::AllocationFailure)
        })?;

        let handle = buffer.as_raw();
        state.graphics.insert(handle, GraphicsEntry { buffer, memory });
        Ok(GraphicsBufferHandle(handle))
    }

    pub(crate) fn destroy_graphics_buffer(&self, handle: GraphicsBufferHandle) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(entry) = state.graphics.remove(&handle.raw()) else {
            log::warn!("Unknown vertex buffer {:#x}", handle.raw());
            return;
        };
        if state
            .buffers
            .values()
            .any(|b| matches!(b.backing, Backing::Imported) && b.buffer == entry.buffer)
        {
            log::debug!("Vertex buffer destroyed while compute still imports it");
        }

        state.wait_all();
        if let Some(device) = state.device.as_ref() {
            unsafe {
                device.device.destroy_buffer(entry.buffer, None);
                device.device.free_memory(entry.memory, None);
            }
        }
    }

    fn transfer_ownership(
        &self,
        queue: QueueId,
        buffers: &[BufferId],
        acquire: bool,
    ) -> Result<(), Status> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let device = state.device.as_ref().ok_or(Status::InvalidContext)?;
        let batch = state
            .queues
            .get_mut(&queue.raw())
            .ok_or(Status::InvalidQueue)?;

        let mut targets = Vec::with_capacity(buffers.len());
        for id in buffers {
            let entry = state.buffers.get(&id.raw()).ok_or(Status::InvalidBuffer)?;
            if !matches!(entry.backing, Backing::Imported) {
                return Err(Status::InvalidGraphicsObject);
            }
            if entry.acquired == acquire {
                return Err(Status::InvalidOperation);
            }
            targets.push(entry.buffer);
        }

        let transfer = device.needs_ownership_transfer();
        let (src_family, dst_family) = match (transfer, acquire) {
            (false, _) => (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
            (true, true) => (device.graphics_queue_family, device.compute_queue_family),
            (true, false) => (device.compute_queue_family, device.graphics_queue_family),
        };

        let compute_stages = vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER;
        let compute_access = vk::AccessFlags::SHADER_READ
            | vk::AccessFlags::SHADER_WRITE
            | vk::AccessFlags::TRANSFER_READ
            | vk::AccessFlags::TRANSFER_WRITE;
        // A compute-only family cannot name vertex stages; the graphics
        // queue's half of the transfer covers them
        let (graphics_stage, graphics_access) = if transfer {
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty())
        } else {
            (
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            )
        };

        let (src_stage, dst_stage, src_access, dst_access) = if acquire {
            (graphics_stage, compute_stages, graphics_access, compute_access)
        } else {
            let dst_stage = if transfer {
                vk::PipelineStageFlags::BOTTOM_OF_PIPE
            } else {
                graphics_stage
            };
            (compute_stages, dst_stage, compute_access, graphics_access)
        };

        let barriers: Vec<_> = targets
            .iter()
            .map(|&buffer| {
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
                    .buffer(buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
            })
            .collect();

        let cmd = batch.record(device).map_err(status_from)?;
        unsafe {
            device.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &barriers,
                &[],
            );
        }

        for id in buffers {
            if let Some(entry) = state.buffers.get_mut(&id.raw()) {
                entry.acquired = acquire;
            }
        }
        Ok(())
    }
}

/// Orders every compute and transfer access before the next one.
fn serialize(device: &VulkanDevice, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(
            vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE
                | vk::AccessFlags::TRANSFER_READ
                | vk::AccessFlags::TRANSFER_WRITE,
        );
    let stages = vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER;
    unsafe {
        device.device.cmd_pipeline_barrier(
            cmd,
            stages,
            stages,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        self.state.lock().teardown();
    }
}

impl DeviceEnumerator for VulkanBackend {
    fn platforms(&self) -> Result<Vec<PlatformInfo>, Status> {
        Ok(vec![PlatformInfo {
            id: PLATFORM,
            name: "Vulkan".to_string(),
        }])
    }

    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceInfo>, Status> {
        if platform != PLATFORM {
            return Err(Status::InvalidPlatform);
        }

        let devices = self.instance.physical_devices().map_err(status_from)?;
        Ok(devices
            .into_iter()
            .map(|pd| {
                let props = unsafe { self.instance.instance.get_physical_device_properties(pd) };
                DeviceInfo {
                    id: DeviceId(pd.as_raw()),
                    name: self.instance.device_name(pd),
                    class: device_class(props.device_type),
                    vendor_id: props.vendor_id,
                }
            })
            .collect())
    }
}

impl ComputeBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn interop_extension(&self) -> &'static str {
        EXTERNAL_MEMORY_EXTENSION
    }

    fn device_extensions(&self, device: DeviceId) -> Result<Vec<String>, Status> {
        let physical = self.physical(device)?;
        self.instance
            .extension_names(physical)
            .map_err(status_from)
    }

    fn create_context(
        &self,
        platform: PlatformId,
        device: DeviceId,
        share_group: Option<&GraphicsShareGroup>,
    ) -> Result<ContextId, Status> {
        if platform != PLATFORM {
            return Err(Status::InvalidPlatform);
        }

        let mut state = self.state.lock();
        if state.device.is_some() {
            return Err(Status::InvalidOperation);
        }

        let physical = self.physical(device)?;
        if let Some(share) = share_group {
            if *share != self.share_group(device) {
                return Err(Status::InvalidGraphicsObject);
            }
        }

        let logical = VulkanDevice::new(&self.instance, physical, share_group.is_some())
            .map_err(|e| {
                log::error!("Logical device creation failed: {:#}", e);
                status_from_anyhow(&e, Status::InvalidContext)
            })?;

        let context = ContextId(logical.device.handle().as_raw());
        state.device = Some(logical);
        state.context = Some(context);
        Ok(context)
    }

    fn release_context(&self, context: ContextId) {
        let mut state = self.state.lock();
        if state.context == Some(context) {
            state.teardown();
        }
    }

    fn build_program(&self, source: &[u8]) -> Result<ProgramId, BuildFailure> {
        let failure = |status: Status, log: String| BuildFailure { status, log };

        let words = shader::load_words(source)
            .map_err(|log| failure(Status::BuildProgramFailure, log))?;
        let entry_points = shader::compute_entry_points(&words)
            .map_err(|log| failure(Status::BuildProgramFailure, log))?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let device = state.device.as_ref().ok_or_else(|| {
            failure(Status::InvalidContext, "error: no compute context".to_string())
        })?;

        let module = shader::create_shader_module(device, &words).map_err(|status| {
            failure(
                Status::BuildProgramFailure,
                format!("error: driver rejected the module: {}", status),
            )
        })?;

        log::debug!("Built SPIR-V program with kernels {:?}", entry_points);
        let id = state.next();
        state.programs.insert(
            id,
            ProgramEntry {
                module,
                entry_points,
            },
        );
        Ok(ProgramId(id))
    }

    fn release_program(&self, program: ProgramId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let (Some(entry), Some(device)) =
            (state.programs.remove(&program.raw()), state.device.as_ref())
        {
            unsafe { device.device.destroy_shader_module(entry.module, None) };
        }
    }

    fn create_queue(&self) -> Result<QueueId, Status> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let device = state.device.as_ref().ok_or(Status::InvalidContext)?;

        let batch = CommandBatch::new(device).map_err(status_from)?;
        let id = state.next();
        state.queues.insert(id, batch);
        Ok(QueueId(id))
    }

    fn release_queue(&self, queue: QueueId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let (Some(batch), Some(device)) =
            (state.queues.remove(&queue.raw()), state.device.as_ref())
        {
            batch.destroy(device);
        }
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId, Status> {
        let mut state = self.state.lock();
        let entry = state
            .programs
            .get(&program.raw())
            .ok_or(Status::InvalidProgram)?;
        if !entry.entry_points.iter().any(|e| e == name) {
            return Err(Status::InvalidKernelName);
        }
        let entry = CString::new(name).map_err(|_| Status::InvalidKernelName)?;

        let id = state.next();
        state.kernels.insert(
            id,
            KernelEntry {
                program: program.raw(),
                entry,
                args: Vec::new(),
                pipelines: HashMap::new(),
            },
        );
        Ok(KernelId(id))
    }

    fn release_kernel(&self, kernel: KernelId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.kernels.remove(&kernel.raw()) else {
            return;
        };
        if entry.pipelines.is_empty() {
            return;
        }

        state.wait_all();
        if let Some(device) = state.device.as_ref() {
            for pipeline in entry.pipelines.values() {
                pipeline.destroy(device);
            }
        }
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: ArgValue) -> Result<(), Status> {
        if index >= MAX_KERNEL_ARGS {
            return Err(Status::InvalidArgIndex);
        }

        let mut state = self.state.lock();
        match value {
            ArgValue::Buffer(buffer) if !state.buffers.contains_key(&buffer.raw()) => {
                return Err(Status::InvalidBuffer);
            }
            ArgValue::Local(0) => return Err(Status::InvalidArgSize),
            ArgValue::Local(bytes) if u32::try_from(bytes).is_err() => {
                return Err(Status::InvalidArgSize);
            }
            _ => {}
        }

        let entry = state
            .kernels
            .get_mut(&kernel.raw())
            .ok_or(Status::InvalidKernel)?;
        let index = index as usize;
        if entry.args.len() <= index {
            entry.args.resize(index + 1, None);
        }
        entry.args[index] = Some(value);
        Ok(())
    }

    fn create_buffer(&self, size: usize, access: AccessMode) -> Result<BufferId, Status> {
        if size == 0 {
            return Err(Status::InvalidBufferSize);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let device = state.device.as_ref().ok_or(Status::InvalidContext)?;

        let memory = DeviceMemory::allocate(
            device,
            "compute buffer",
            size as vk::DeviceSize,
            STORAGE_USAGE,
            MemoryLocation::GpuOnly,
        )?;

        let id = state.next();
        state.buffers.insert(
            id,
            BufferEntry {
                buffer: memory.buffer,
                size,
                access,
                backing: Backing::Owned(memory),
                acquired: false,
            },
        );
        Ok(BufferId(id))
    }

    fn import_graphics_buffer(
        &self,
        graphics: GraphicsBufferHandle,
        access: AccessMode,
    ) -> Result<BufferId, Status> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let device = state.device.as_ref().ok_or(Status::InvalidContext)?;

        let shared = state
            .graphics
            .get(&graphics.raw())
            .ok_or(Status::InvalidGraphicsObject)?;
        let size = unsafe { device.device.get_buffer_memory_requirements(shared.buffer) }.size;
        let buffer = shared.buffer;

        let id = state.next();
        state.buffers.insert(
            id,
            BufferEntry {
                buffer,
                size: size as usize,
                access,
                backing: Backing::Imported,
                acquired: false,
            },
        );
        Ok(BufferId(id))
    }

    fn release_buffer(&self, buffer: BufferId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.buffers.remove(&buffer.raw()) else {
            return;
        };

        if let Backing::Owned(memory) = entry.backing {
            state.wait_all();
            if let Some(device) = state.device.as_ref() {
                memory.free(device);
            }
        }
    }

    fn enqueue_write(&self, queue: QueueId, buffer: BufferId, data: &[u8]) -> Result<(), Status> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let device = state.device.as_ref().ok_or(Status::InvalidContext)?;
        let batch = state
            .queues
            .get_mut(&queue.raw())
            .ok_or(Status::InvalidQueue)?;
        let target = state
            .buffers
            .get(&buffer.raw())
            .ok_or(Status::InvalidBuffer)?;

        if data.len() > target.size {
            return Err(Status::InvalidBufferSize);
        }
        target.check_usable()?;
        if data.is_empty() {
            return Ok(());
        }

        let cmd = batch.record(device).map_err(status_from)?;
        let staging = buffer::staging_upload(device, data)?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: data.len() as vk::DeviceSize,
        };

        serialize(device, cmd);
        unsafe {
            device
                .device
                .cmd_copy_buffer(cmd, staging.buffer, target.buffer, &[region]);
        }
        batch.keep(staging);
        Ok(())
    }

    fn enqueue_read(&self, queue: QueueId, buffer: BufferId, out: &mut [u8]) -> Result<(), Status> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let device = state.device.as_ref().ok_or(Status::InvalidContext)?;
        let batch = state
            .queues
            .get_mut(&queue.raw())
            .ok_or(Status::InvalidQueue)?;
        let source = state
            .buffers
            .get(&buffer.raw())
            .ok_or(Status::InvalidBuffer)?;

        if out.len() > source.size {
            return Err(Status::InvalidBufferSize);
        }
        source.check_usable()?;
        if source.access == AccessMode::WriteOnly {
            log::trace!("Reading back a write-only buffer");
        }
        if out.is_empty() {
            return Ok(());
        }

        let staging = DeviceMemory::allocate(
            device,
            "readback staging",
            out.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        let copied = batch.record(device).and_then(|cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: out.len() as vk::DeviceSize,
            };
            serialize(device, cmd);
            unsafe {
                device
                    .device
                    .cmd_copy_buffer(cmd, source.buffer, staging.buffer, &[region]);
            }
            batch.submit_and_wait(device)
        });

        let result = match (copied, staging.mapped_slice()) {
            (Ok(()), Some(mapped)) => {
                out.copy_from_slice(mapped);
                Ok(())
            }
            (Ok(()), None) => Err(Status::OutOfResources),
            (Err(e), _) => Err(status_from(e)),
        };
        staging.free(device);
        result
    }

    fn enqueue_dispatch(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: [usize; 3],
        local: [usize; 3],
        _wait_count: u32,
    ) -> Result<(), Status> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let device = state.device.as_ref().ok_or(Status::InvalidContext)?;
        let batch = state
            .queues
            .get_mut(&queue.raw())
            .ok_or(Status::InvalidQueue)?;
        let entry = state
            .kernels
            .get_mut(&kernel.raw())
            .ok_or(Status::InvalidKernel)?;

        let mut groups = [0u32; 3];
        let mut local_size = [0u32; 3];
        for axis in 0..3 {
            if local[axis] == 0 || global[axis] % local[axis] != 0 {
                return Err(Status::InvalidWorkGroupSize);
            }
            local_size[axis] =
                u32::try_from(local[axis]).map_err(|_| Status::InvalidWorkGroupSize)?;
            groups[axis] = u32::try_from(global[axis] / local[axis])
                .map_err(|_| Status::InvalidWorkGroupSize)?;
        }

        let mut bindings = Vec::new();
        let mut targets = Vec::new();
        let mut locals = Vec::new();
        for (index, arg) in entry.args.iter().enumerate() {
            match arg.ok_or(Status::InvalidKernelArgs)? {
                ArgValue::Buffer(id) => {
                    let target = state.buffers.get(&id.raw()).ok_or(Status::InvalidArgValue)?;
                    target.check_usable()?;
                    bindings.push(index as u32);
                    targets.push(target.buffer);
                }
                ArgValue::Local(bytes) => locals.push((index as u32, bytes as u32)),
            }
        }

        let key = PipelineKey {
            local: local_size,
            bindings: bindings.clone(),
            locals,
        };
        let pipeline = match entry.pipelines.entry(key) {
            Entry::Occupied(cached) => *cached.get(),
            Entry::Vacant(slot) => {
                let module = state
                    .programs
                    .get(&entry.program)
                    .ok_or(Status::InvalidProgram)?
                    .module;
                let created = KernelPipeline::create(device, module, &entry.entry, slot.key())?;
                *slot.insert(created)
            }
        };

        let set = match batch
            .descriptor_set(device, pipeline.set_layout)
            .map_err(status_from)?
        {
            Some(set) => set,
            None => {
                batch.submit_and_wait(device).map_err(status_from)?;
                batch
                    .descriptor_set(device, pipeline.set_layout)
                    .map_err(status_from)?
                    .ok_or(Status::OutOfResources)?
            }
        };

        let infos: Vec<_> = targets
            .iter()
            .map(|&buffer| {
                [vk::DescriptorBufferInfo {
                    buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                }]
            })
            .collect();
        let writes: Vec<_> = bindings
            .iter()
            .zip(&infos)
            .map(|(&binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(info)
            })
            .collect();

        let cmd = batch.record(device).map_err(status_from)?;
        unsafe {
            device.device.update_descriptor_sets(&writes, &[]);
            serialize(device, cmd);
            device
                .device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                &[set],
                &[],
            );
            device.device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
        }
        Ok(())
    }

    fn enqueue_acquire_graphics(&self, queue: QueueId, buffers: &[BufferId]) -> Result<(), Status> {
        self.transfer_ownership(queue, buffers, true)
    }

    fn enqueue_release_graphics(&self, queue: QueueId, buffers: &[BufferId]) -> Result<(), Status> {
        self.transfer_ownership(queue, buffers, false)
    }

    fn finish(&self, queue: QueueId) -> Result<(), Status> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let device = state.device.as_ref().ok_or(Status::InvalidContext)?;
        let batch = state
            .queues
            .get_mut(&queue.raw())
            .ok_or(Status::InvalidQueue)?;
        batch.submit_and_wait(device).map_err(status_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_errors_map_to_portable_statuses() {
        assert_eq!(
            status_from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            Status::AllocationFailure
        );
        assert_eq!(
            status_from(vk::Result::ERROR_DEVICE_LOST),
            Status::DeviceNotAvailable
        );
        assert_eq!(
            status_from(vk::Result::ERROR_UNKNOWN),
            Status::Native(vk::Result::ERROR_UNKNOWN.as_raw())
        );
    }

    #[test]
    fn device_types_map_to_classes() {
        assert_eq!(device_class(vk::PhysicalDeviceType::DISCRETE_GPU), DeviceClass::Gpu);
        assert_eq!(device_class(vk::PhysicalDeviceType::INTEGRATED_GPU), DeviceClass::Gpu);
        assert_eq!(device_class(vk::PhysicalDeviceType::CPU), DeviceClass::Cpu);
        assert_eq!(device_class(vk::PhysicalDeviceType::OTHER), DeviceClass::Accelerator);
    }

    #[test]
    fn anyhow_errors_keep_their_vulkan_code() {
        let err = anyhow::Error::new(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert_eq!(
            status_from_anyhow(&err, Status::InvalidContext),
            Status::OutOfHostMemory
        );
        let other = anyhow::anyhow!("no queue family");
        assert_eq!(
            status_from_anyhow(&other, Status::InvalidContext),
            Status::InvalidContext
        );
    }
}
