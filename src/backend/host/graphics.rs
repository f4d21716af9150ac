// Host graphics share group
//
// Stands in for the renderer: owns vertex buffer memory and lends it to the
// compute side. Each allocation carries an ownership flag that the host
// backend flips on acquire/release; graphics-side reads are refused while
// compute holds the buffer.

use crate::compute::backend::{GraphicsBufferHandle, GraphicsShareGroup, RawHandle};
use crate::compute::buffer::{GraphicsBuffer, VertexBufferFactory};
use crate::compute::error::{ComputeError, ComputeResult, Status};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);

/// Byte storage backed by `u64` words so every POD view is aligned.
pub struct SharedAllocation {
    words: Mutex<Vec<u64>>,
    len: usize,
    compute_owned: AtomicBool,
}

impl SharedAllocation {
    pub fn new(len: usize) -> Self {
        Self {
            words: Mutex::new(vec![0u64; len.div_ceil(8)]),
            len,
            compute_owned: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Vec<u64>> {
        self.words.lock()
    }

    pub fn compute_owned(&self) -> bool {
        self.compute_owned.load(Ordering::Acquire)
    }

    pub(crate) fn set_compute_owned(&self, owned: bool) {
        self.compute_owned.store(owned, Ordering::Release);
    }

    pub fn copy_to(&self, out: &mut [u8]) {
        let words = self.words.lock();
        let bytes: &[u8] = bytemuck::cast_slice(&words[..]);
        let n = out.len().min(self.len);
        out[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn copy_from(&self, data: &[u8]) {
        let mut words = self.words.lock();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words[..]);
        let n = data.len().min(self.len);
        bytes[..n].copy_from_slice(&data[..n]);
    }
}

struct GraphicsInner {
    group: RawHandle,
    next: AtomicU64,
    buffers: Mutex<HashMap<RawHandle, Arc<SharedAllocation>>>,
}

#[derive(Clone)]
pub struct HostGraphics {
    inner: Arc<GraphicsInner>,
}

impl Default for HostGraphics {
    fn default() -> Self {
        Self::new()
    }
}

impl HostGraphics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GraphicsInner {
                group: NEXT_GROUP.fetch_add(1, Ordering::Relaxed),
                next: AtomicU64::new(1),
                buffers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Handles a compute context needs to link with this graphics context.
    pub fn share_group(&self) -> GraphicsShareGroup {
        GraphicsShareGroup {
            context: self.inner.group,
            device: 0,
        }
    }

    pub(crate) fn group(&self) -> RawHandle {
        self.inner.group
    }

    pub(crate) fn allocation(&self, handle: GraphicsBufferHandle) -> Option<Arc<SharedAllocation>> {
        self.inner.buffers.lock().get(&handle.raw()).cloned()
    }

    pub fn is_compute_owned(&self, buffer: GraphicsBuffer) -> bool {
        self.allocation(buffer.handle)
            .map(|a| a.compute_owned())
            .unwrap_or(false)
    }

    /// Graphics-side read, as the vertex stage would see the buffer.
    pub fn read_vertex_buffer(&self, buffer: GraphicsBuffer, out: &mut [u8]) -> ComputeResult<()> {
        let allocation = self.allocation(buffer.handle).ok_or(ComputeError::Api {
            op: "read vertex buffer",
            status: Status::InvalidGraphicsObject,
        })?;

        if allocation.compute_owned() {
            log::error!(
                "Vertex buffer {:#x} read while acquired by compute",
                buffer.handle.raw()
            );
            return Err(ComputeError::Api {
                op: "read vertex buffer",
                status: Status::InvalidOperation,
            });
        }

        allocation.copy_to(out);
        Ok(())
    }

    pub fn read_vertex_pod<T: bytemuck::Pod>(
        &self,
        buffer: GraphicsBuffer,
        out: &mut [T],
    ) -> ComputeResult<()> {
        self.read_vertex_buffer(buffer, bytemuck::cast_slice_mut(out))
    }

    pub fn live_buffers(&self) -> usize {
        self.inner.buffers.lock().len()
    }
}

impl VertexBufferFactory for HostGraphics {
    fn create_vertex_buffer(&self, label: &str, byte_size: usize) -> ComputeResult<GraphicsBuffer> {
        let raw = self.inner.next.fetch_add(1, Ordering::Relaxed);
        self.inner
            .buffers
            .lock()
            .insert(raw, Arc::new(SharedAllocation::new(byte_size)));
        log::debug!("Created vertex buffer '{}' ({} bytes)", label, byte_size);

        Ok(GraphicsBuffer {
            handle: GraphicsBufferHandle(raw),
            byte_size,
        })
    }

    fn destroy_vertex_buffer(&self, buffer: GraphicsBuffer) {
        self.inner.buffers.lock().remove(&buffer.handle.raw());
    }
}
