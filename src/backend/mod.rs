// Backend module - native compute APIs behind `ComputeBackend`
//
// host:   CPU reference implementation, always available
// vulkan: ash + gpu-allocator, behind the `vulkan` feature

pub mod host;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use host::{HostBackend, HostGraphics};
#[cfg(feature = "vulkan")]
pub use vulkan::{VulkanBackend, VulkanGraphics};
