// Vertex buffers for a renderer sharing the compute device

use super::VulkanBackend;
use crate::compute::buffer::{GraphicsBuffer, VertexBufferFactory};
use crate::compute::error::{reported, ComputeError, ComputeResult};
use std::sync::Arc;

/// Creates the vertex buffers particle data lives in. They can be bound as
/// vertex input by a renderer on the same logical device and imported by
/// the compute context.
#[derive(Clone)]
pub struct VulkanGraphics {
    backend: Arc<VulkanBackend>,
}

impl VulkanGraphics {
    pub fn new(backend: Arc<VulkanBackend>) -> Self {
        Self { backend }
    }
}

impl VertexBufferFactory for VulkanGraphics {
    fn create_vertex_buffer(&self, label: &str, byte_size: usize) -> ComputeResult<GraphicsBuffer> {
        let handle = self
            .backend
            .create_graphics_buffer(byte_size)
            .map_err(|status| {
                reported(ComputeError::Api {
                    op: "create vertex buffer",
                    status,
                })
            })?;

        log::debug!(
            "Created vertex buffer '{}' ({} bytes, handle {:#x})",
            label,
            byte_size,
            handle.raw()
        );
        Ok(GraphicsBuffer { handle, byte_size })
    }

    fn destroy_vertex_buffer(&self, buffer: GraphicsBuffer) {
        self.backend.destroy_graphics_buffer(buffer.handle);
    }
}
