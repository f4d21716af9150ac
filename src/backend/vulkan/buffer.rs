// Buffer utilities for compute storage, staging, and shared vertex buffers
//
// Compute-owned memory goes through gpu-allocator. Vertex buffers the
// graphics side renders from are plain device-local allocations so their
// lifetime stays independent of the compute allocator.

use super::device::VulkanDevice;
use super::status_from;
use crate::compute::error::Status;
use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

/// Usage of every buffer a kernel can bind.
pub const STORAGE_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// A buffer backed by a gpu-allocator allocation.
pub struct DeviceMemory {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Allocation,
}

impl DeviceMemory {
    pub fn allocate(
        device: &VulkanDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self, Status> {
        // Zero-sized buffers are invalid in Vulkan
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer =
            unsafe { device.device.create_buffer(&buffer_info, None) }.map_err(status_from)?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut guard = device.allocator();
            let allocator = guard.as_mut().ok_or(Status::InvalidContext)?;
            allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                log::error!("Allocation of '{}' ({} bytes) failed: {}", name, size, e);
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(Status::AllocationFailure);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            Self {
                buffer,
                size,
                allocation,
            }
            .free(device);
            return Err(status_from(e));
        }

        Ok(Self {
            buffer,
            size,
            allocation,
        })
    }

    /// Host view of the memory; `None` for device-only locations.
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation
            .mapped_slice()
            .map(|bytes| &bytes[..self.size as usize])
    }

    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        let size = self.size as usize;
        self.allocation
            .mapped_slice_mut()
            .map(|bytes| &mut bytes[..size])
    }

    pub fn free(self, device: &VulkanDevice) {
        if let Some(allocator) = device.allocator().as_mut() {
            if let Err(e) = allocator.free(self.allocation) {
                log::warn!("Failed to free buffer allocation: {}", e);
            }
        }
        unsafe { device.device.destroy_buffer(self.buffer, None) };
    }
}

/// Host-visible staging copy of `data`, ready to be copied on the queue.
pub fn staging_upload(device: &VulkanDevice, data: &[u8]) -> Result<DeviceMemory, Status> {
    let mut staging = DeviceMemory::allocate(
        device,
        "upload staging",
        data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
    )?;

    match staging.mapped_slice_mut() {
        Some(mapped) => {
            mapped.copy_from_slice(data);
            Ok(staging)
        }
        None => {
            staging.free(device);
            Err(Status::OutOfResources)
        }
    }
}

/// Helper to create a GPU buffer with specified usage and memory properties
///
/// Used for the vertex buffers the graphics side owns.
pub fn create_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .context("Failed to create buffer")?;

    let mem_requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let memory_type_index =
        find_memory_type(device, mem_requirements.memory_type_bits, memory_properties)?;

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(mem_requirements.size)
        .memory_type_index(memory_type_index);

    let buffer_memory = match unsafe { device.device.allocate_memory(&alloc_info, None) } {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).context("Failed to allocate buffer memory");
        }
    };

    unsafe {
        device
            .device
            .bind_buffer_memory(buffer, buffer_memory, 0)
            .context("Failed to bind buffer memory")?;
    }

    Ok((buffer, buffer_memory))
}

/// Find a suitable memory type index
fn find_memory_type(
    device: &VulkanDevice,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let mem_properties = &device.memory_properties;

    for i in 0..mem_properties.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = mem_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    anyhow::bail!("Failed to find suitable memory type")
}
