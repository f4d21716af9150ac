// Command batching and host synchronization
//
// Each compute queue records into one primary command buffer until the host
// has to wait (finish, read-back, resource release). The batch then ends,
// submits with a fence and blocks on it. Staging buffers and descriptor sets
// used by the batch live exactly as long as the batch.

use super::buffer::DeviceMemory;
use super::device::VulkanDevice;
use ash::vk;

/// Descriptor sets one batch can hold before it has to be flushed.
const SETS_PER_BATCH: u32 = 256;
const DESCRIPTORS_PER_BATCH: u32 = SETS_PER_BATCH * 8;

pub struct CommandBatch {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    descriptor_pool: vk::DescriptorPool,
    staging: Vec<DeviceMemory>,
    recording: bool,
}

impl CommandBatch {
    pub fn new(device: &VulkanDevice) -> Result<Self, vk::Result> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.compute_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(DESCRIPTORS_PER_BATCH)];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(SETS_PER_BATCH)
            .pool_sizes(&pool_sizes);

        // Start unsignaled; a fence is only waited on after a submit
        let fence_info = vk::FenceCreateInfo::default();

        let created = unsafe {
            device
                .device
                .allocate_command_buffers(&alloc_info)
                .and_then(|buffers| {
                    let descriptor_pool = device
                        .device
                        .create_descriptor_pool(&descriptor_pool_info, None)?;
                    match device.device.create_fence(&fence_info, None) {
                        Ok(fence) => Ok((buffers[0], descriptor_pool, fence)),
                        Err(e) => {
                            device.device.destroy_descriptor_pool(descriptor_pool, None);
                            Err(e)
                        }
                    }
                })
        };

        match created {
            Ok((command_buffer, descriptor_pool, fence)) => Ok(Self {
                pool,
                command_buffer,
                fence,
                descriptor_pool,
                staging: Vec::new(),
                recording: false,
            }),
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                Err(e)
            }
        }
    }

    /// Command buffer open for recording.
    pub fn record(&mut self, device: &VulkanDevice) -> Result<vk::CommandBuffer, vk::Result> {
        if !self.recording {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                device
                    .device
                    .begin_command_buffer(self.command_buffer, &begin_info)
            }?;
            self.recording = true;
        }
        Ok(self.command_buffer)
    }

    /// Allocate a descriptor set from this batch; `None` when the pool is
    /// exhausted and the batch must be flushed first.
    pub fn descriptor_set(
        &mut self,
        device: &VulkanDevice,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Option<vk::DescriptorSet>, vk::Result> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(std::slice::from_ref(&layout));

        match unsafe { device.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => Ok(sets.first().copied()),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Keep a staging buffer alive until the batch completes.
    pub fn keep(&mut self, staging: DeviceMemory) {
        self.staging.push(staging);
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Submit what has been recorded and block until the device is done.
    pub fn submit_and_wait(&mut self, device: &VulkanDevice) -> Result<(), vk::Result> {
        if !self.recording {
            return Ok(());
        }
        self.recording = false;

        let result = unsafe {
            device
                .device
                .end_command_buffer(self.command_buffer)
                .and_then(|_| {
                    let submit_info = vk::SubmitInfo::default()
                        .command_buffers(std::slice::from_ref(&self.command_buffer));
                    device
                        .device
                        .queue_submit(device.compute_queue, &[submit_info], self.fence)
                })
                .and_then(|_| {
                    device
                        .device
                        .wait_for_fences(&[self.fence], true, u64::MAX)
                })
                .and_then(|_| device.device.reset_fences(&[self.fence]))
        };

        // Whatever happened, the batch's transient resources are finished with
        unsafe {
            let _ = device
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty());
            let _ = device
                .device
                .reset_descriptor_pool(self.descriptor_pool, vk::DescriptorPoolResetFlags::empty());
        }
        for staging in self.staging.drain(..) {
            staging.free(device);
        }

        result
    }

    pub fn destroy(mut self, device: &VulkanDevice) {
        if let Err(e) = self.submit_and_wait(device) {
            log::warn!("Dropping unfinished compute batch: {:?}", e);
        }
        unsafe {
            device.device.destroy_fence(self.fence, None);
            device
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            device.device.destroy_command_pool(self.pool, None);
        }
    }
}
