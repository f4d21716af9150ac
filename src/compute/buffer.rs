// Device buffers
//
// Either a plain compute allocation or a compute-side view of a graphics
// vertex buffer. Dropping the buffer releases only the compute side.

use super::backend::{AccessMode, BufferId, GraphicsBufferHandle};
use super::context::ComputeContext;
use super::error::ComputeResult;
use std::sync::Arc;

/// A buffer owned by the graphics side, as handed to the compute layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsBuffer {
    pub handle: GraphicsBufferHandle,
    pub byte_size: usize,
}

/// Graphics collaborator that creates the vertex buffers compute imports.
pub trait VertexBufferFactory {
    fn create_vertex_buffer(&self, label: &str, byte_size: usize) -> ComputeResult<GraphicsBuffer>;
    fn destroy_vertex_buffer(&self, buffer: GraphicsBuffer);
}

pub struct DeviceBuffer {
    name: String,
    size: usize,
    access: AccessMode,
    handle: BufferId,
    /// Non-owning; the graphics side creates and destroys it.
    graphics: Option<GraphicsBuffer>,
    ctx: Arc<ComputeContext>,
}

impl DeviceBuffer {
    /// Allocate `size` bytes of compute-only device memory.
    pub fn create(
        ctx: &Arc<ComputeContext>,
        name: &str,
        size: usize,
        access: AccessMode,
    ) -> ComputeResult<Self> {
        let handle = ctx.check("create buffer", ctx.backend().create_buffer(size, access))?;
        log::trace!("Created buffer '{}' ({} bytes, {:?})", name, size, access);

        Ok(Self {
            name: name.to_string(),
            size,
            access,
            handle,
            graphics: None,
            ctx: Arc::clone(ctx),
        })
    }

    /// Wrap an existing graphics buffer so both APIs alias the same memory.
    pub fn import(
        ctx: &Arc<ComputeContext>,
        name: &str,
        access: AccessMode,
        graphics: GraphicsBuffer,
    ) -> ComputeResult<Self> {
        let handle = ctx.check(
            "create buffer from graphics buffer",
            ctx.backend().import_graphics_buffer(graphics.handle, access),
        )?;
        log::trace!(
            "Imported graphics buffer {:#x} as '{}' ({} bytes, {:?})",
            graphics.handle.raw(),
            name,
            graphics.byte_size,
            access
        );

        Ok(Self {
            name: name.to_string(),
            size: graphics.byte_size,
            access,
            handle,
            graphics: Some(graphics),
            ctx: Arc::clone(ctx),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn handle(&self) -> BufferId {
        self.handle
    }

    pub fn is_graphics_attached(&self) -> bool {
        self.graphics.is_some()
    }

    pub fn graphics(&self) -> Option<GraphicsBuffer> {
        self.graphics
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("access", &self.access)
            .field("handle", &self.handle)
            .field("graphics", &self.graphics)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.ctx.backend().release_buffer(self.handle);
    }
}
