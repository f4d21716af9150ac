// Compute program
//
// One compiled unit, one in-order command queue, and the kernels and
// buffers registered against it by name. All host-side reads, writes,
// dispatches and interop transitions go through here.

use super::backend::{AccessMode, BufferId, ProgramId, QueueId};
use super::buffer::{DeviceBuffer, GraphicsBuffer};
use super::context::ComputeContext;
use super::error::{reported, ComputeError, ComputeResult, ResourceKind, Status};
use super::kernel::{Kernel, KernelArg};
use super::registry::{Insertion, Registry};
use glam::UVec3;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Host-side enqueue time accumulated for one kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelTiming {
    pub dispatches: u64,
    pub total: Duration,
}

impl KernelTiming {
    pub fn average(&self) -> Duration {
        if self.dispatches == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.dispatches);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    fn merge(&mut self, other: KernelTiming) {
        self.dispatches += other.dispatches;
        self.total += other.total;
    }
}

pub struct Program {
    kernels: Registry<Kernel>,
    buffers: Registry<DeviceBuffer>,
    timings: HashMap<String, KernelTiming>,
    queue: QueueId,
    id: ProgramId,
    source_path: Option<PathBuf>,
    ctx: Arc<ComputeContext>,
}

impl Program {
    /// Load the whole file at `path` and build it for the context's device.
    pub fn from_file(ctx: &Arc<ComputeContext>, path: impl AsRef<Path>) -> ComputeResult<Self> {
        let path = path.as_ref();
        log::info!("Loading compute source {:?}", path);

        let source = std::fs::read(path).map_err(|source| {
            reported(ComputeError::Io {
                path: path.to_path_buf(),
                source,
            })
        })?;

        let mut program = Self::from_source(ctx, &source)?;
        program.source_path = Some(path.to_path_buf());
        Ok(program)
    }

    pub fn from_source(ctx: &Arc<ComputeContext>, source: &[u8]) -> ComputeResult<Self> {
        let backend = ctx.backend();

        let id = match backend.build_program(source) {
            Ok(id) => id,
            Err(failure) => {
                log::error!("Program build failed ({})", failure.status);
                log::error!("Build log:\n{}", failure.log);
                return Err(reported(ComputeError::CompileFailure { log: failure.log }));
            }
        };

        let queue = ctx
            .check("create command queue", backend.create_queue())
            .inspect_err(|_| backend.release_program(id))?;

        log::info!("Compute program built ({} bytes of source)", source.len());

        Ok(Self {
            kernels: Registry::new(ResourceKind::Kernel),
            buffers: Registry::new(ResourceKind::Buffer),
            timings: HashMap::new(),
            queue,
            id,
            source_path: None,
            ctx: Arc::clone(ctx),
        })
    }

    pub fn context(&self) -> &Arc<ComputeContext> {
        &self.ctx
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    // ---- registration ----

    /// Compile the entry point `name`, register it and bind its arguments.
    pub fn add_kernel(&mut self, name: &str, args: Vec<KernelArg>) -> ComputeResult<()> {
        if self.kernels.contains(name) {
            return Err(reported(self.kernels.duplicate(name)));
        }

        let kernel = Kernel::compile(self, name, args).map_err(reported)?;
        kernel.attach_args(self.queue)?;
        self.register_kernel(kernel)
    }

    /// Register an already compiled kernel under its own name.
    pub fn register_kernel(&mut self, kernel: Kernel) -> ComputeResult<()> {
        let name = kernel.name().to_string();
        match self.kernels.insert(name.clone(), kernel) {
            Insertion::Inserted => Ok(()),
            Insertion::AlreadyExists => Err(reported(self.kernels.duplicate(&name))),
        }
    }

    /// Allocate a compute-only buffer. A taken name leaves the existing
    /// buffer untouched.
    pub fn add_buffer(
        &mut self,
        name: &str,
        size: usize,
        access: AccessMode,
    ) -> ComputeResult<BufferId> {
        if self.buffers.contains(name) {
            return Err(reported(self.buffers.duplicate(name)));
        }

        let buffer = DeviceBuffer::create(&self.ctx, name, size, access)?;
        self.insert_buffer(buffer)
    }

    /// Import a graphics vertex buffer as a shared compute buffer.
    pub fn add_interop_buffer(
        &mut self,
        name: &str,
        access: AccessMode,
        graphics: GraphicsBuffer,
    ) -> ComputeResult<BufferId> {
        if self.buffers.contains(name) {
            return Err(reported(self.buffers.duplicate(name)));
        }

        let buffer = DeviceBuffer::import(&self.ctx, name, access, graphics)?;
        self.insert_buffer(buffer)
    }

    fn insert_buffer(&mut self, buffer: DeviceBuffer) -> ComputeResult<BufferId> {
        let handle = buffer.handle();
        let name = buffer.name().to_string();
        match self.buffers.insert(name.clone(), buffer) {
            Insertion::Inserted => Ok(handle),
            Insertion::AlreadyExists => Err(reported(self.buffers.duplicate(&name))),
        }
    }

    /// Destroy and reallocate a compute-only buffer with a new size, keeping
    /// its name and access mode. Kernels bound to it are re-attached.
    pub fn recreate_buffer(&mut self, name: &str, size: usize) -> ComputeResult<BufferId> {
        let access = self.buffers.require(name).map_err(reported)?.access();
        let replacement = DeviceBuffer::create(&self.ctx, name, size, access)?;
        self.swap_buffer(name, replacement)
    }

    /// Re-import a shared buffer after the graphics side reallocated it.
    pub fn recreate_interop_buffer(
        &mut self,
        name: &str,
        graphics: GraphicsBuffer,
    ) -> ComputeResult<BufferId> {
        let access = self.buffers.require(name).map_err(reported)?.access();
        let replacement = DeviceBuffer::import(&self.ctx, name, access, graphics)?;
        self.swap_buffer(name, replacement)
    }

    fn swap_buffer(&mut self, name: &str, replacement: DeviceBuffer) -> ComputeResult<BufferId> {
        let new_handle = replacement.handle();
        let old = self
            .buffers
            .replace(name, replacement)
            .ok_or_else(|| reported(self.buffers.missing(name)))?;
        let old_handle = old.handle();

        // Kernels must stop referencing the old allocation before it goes.
        let mut stale = Vec::new();
        for kernel in self.kernels.values_mut() {
            if kernel.rebind(old_handle, new_handle) > 0 {
                stale.push(kernel.name().to_string());
            }
        }
        drop(old);

        for kernel_name in stale {
            if let Some(kernel) = self.kernels.get(&kernel_name) {
                kernel.attach_args(self.queue)?;
            }
        }

        log::debug!("Recreated buffer '{}'", name);
        Ok(new_handle)
    }

    /// Remove a buffer no kernel refers to anymore.
    pub fn remove_buffer(&mut self, name: &str) -> ComputeResult<()> {
        let handle = self.buffers.require(name).map_err(reported)?.handle();

        let in_use = self
            .kernels
            .iter()
            .any(|(_, k)| k.args().iter().any(|a| a.buffer() == Some(handle)));
        if in_use {
            log::error!("Buffer '{}' is still bound to a kernel", name);
            return Err(ComputeError::Api {
                op: "remove buffer",
                status: Status::InvalidOperation,
            });
        }

        self.buffers.remove(name);
        Ok(())
    }

    pub fn buffer(&self, name: &str) -> ComputeResult<&DeviceBuffer> {
        self.buffers.require(name).map_err(reported)
    }

    pub fn kernel(&self, name: &str) -> ComputeResult<&Kernel> {
        self.kernels.require(name).map_err(reported)
    }

    pub fn buffer_names(&self) -> Vec<&str> {
        self.buffers.names()
    }

    pub fn kernel_names(&self) -> Vec<&str> {
        self.kernels.names()
    }

    // ---- execution ----

    /// Re-bind `name`'s arguments and enqueue it over `global` work items in
    /// groups of `local`. Returns once enqueued, not once complete.
    ///
    /// `local` must divide `global` in every dimension.
    pub fn execute(
        &mut self,
        name: &str,
        global: UVec3,
        local: UVec3,
        wait_count: u32,
    ) -> ComputeResult<()> {
        let kernel = self.kernels.require(name).map_err(reported)?;
        kernel.attach_args(self.queue)?;

        let start = Instant::now();
        let enqueued = self.ctx.backend().enqueue_dispatch(
            self.queue,
            kernel.handle(),
            to_range(global),
            to_range(local),
            wait_count,
        );
        let elapsed = start.elapsed();

        self.ctx.check("enqueue kernel", enqueued)?;

        let timing = self.timings.entry(name.to_string()).or_default();
        timing.dispatches += 1;
        timing.total += elapsed;
        log::trace!("Kernel '{}' enqueued in {:?}", name, elapsed);

        Ok(())
    }

    pub fn kernel_timing(&self, name: &str) -> Option<KernelTiming> {
        self.timings.get(name).copied()
    }

    pub fn total_execution_time(&self) -> Duration {
        self.timings.values().map(|t| t.total).sum()
    }

    /// Fold another program's kernel timings into this one's, e.g. when it
    /// replaces `other` after a rebuild.
    pub fn absorb_timings(&mut self, other: &Program) {
        for (name, timing) in &other.timings {
            self.timings.entry(name.clone()).or_default().merge(*timing);
        }
    }

    // ---- host transfers ----

    /// Blocking copy of the whole buffer into `out`.
    pub fn read_buffer(&self, name: &str, out: &mut [u8]) -> ComputeResult<()> {
        let buffer = self.sized_buffer(name, out.len())?;

        if buffer.access() == AccessMode::WriteOnly {
            log::warn!("Reading from write-only buffer '{}'", name);
        }

        self.ctx.check(
            "read buffer",
            self.ctx.backend().enqueue_read(self.queue, buffer.handle(), out),
        )
    }

    /// Enqueue a copy of `data` into the whole buffer; complete after
    /// [`Program::flush`].
    pub fn write_buffer(&self, name: &str, data: &[u8]) -> ComputeResult<()> {
        let buffer = self.sized_buffer(name, data.len())?;

        self.ctx.check(
            "write buffer",
            self.ctx.backend().enqueue_write(self.queue, buffer.handle(), data),
        )
    }

    pub fn read_pod<T: bytemuck::Pod>(&self, name: &str, out: &mut [T]) -> ComputeResult<()> {
        self.read_buffer(name, bytemuck::cast_slice_mut(out))
    }

    pub fn write_pod<T: bytemuck::Pod>(&self, name: &str, data: &[T]) -> ComputeResult<()> {
        self.write_buffer(name, bytemuck::cast_slice(data))
    }

    fn sized_buffer(&self, name: &str, len: usize) -> ComputeResult<&DeviceBuffer> {
        let buffer = self.buffers.require(name).map_err(reported)?;
        if buffer.size() != len {
            return Err(reported(ComputeError::SizeMismatch {
                name: name.to_string(),
                expected: buffer.size(),
                actual: len,
            }));
        }
        Ok(buffer)
    }

    // ---- interop & sync ----

    /// Move ownership of a shared buffer from graphics to compute.
    pub fn enqueue_acquire_graphics(&self, name: &str) -> ComputeResult<()> {
        let handle = self.interop_handle(name)?;
        self.ctx.check(
            "acquire graphics buffer",
            self.ctx
                .backend()
                .enqueue_acquire_graphics(self.queue, &[handle]),
        )
    }

    /// Hand a shared buffer back to graphics.
    pub fn enqueue_release_graphics(&self, name: &str) -> ComputeResult<()> {
        let handle = self.interop_handle(name)?;
        self.ctx.check(
            "release graphics buffer",
            self.ctx
                .backend()
                .enqueue_release_graphics(self.queue, &[handle]),
        )
    }

    fn interop_handle(&self, name: &str) -> ComputeResult<BufferId> {
        let buffer = self.buffers.require(name).map_err(reported)?;
        if !buffer.is_graphics_attached() {
            return Err(reported(ComputeError::NotInteropBuffer(name.to_string())));
        }
        Ok(buffer.handle())
    }

    /// Block until everything enqueued so far has completed.
    pub fn flush(&self) -> ComputeResult<()> {
        self.ctx.wait(self.queue)
    }
}

fn to_range(v: UVec3) -> [usize; 3] {
    [v.x as usize, v.y as usize, v.z as usize]
}

impl Drop for Program {
    fn drop(&mut self) {
        self.kernels.clear();
        self.buffers.clear();

        let backend = self.ctx.backend();
        backend.release_queue(self.queue);
        backend.release_program(self.id);
        log::debug!("Compute program released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_survives_dispatch_counts_past_u32() {
        let timing = KernelTiming {
            dispatches: 1 << 32,
            total: Duration::from_secs(1 << 32),
        };
        assert_eq!(timing.average(), Duration::from_secs(1));
    }

    #[test]
    fn average_of_nothing_is_zero() {
        assert_eq!(KernelTiming::default().average(), Duration::ZERO);
    }

    #[test]
    fn merge_adds_counts_and_time() {
        let mut timing = KernelTiming {
            dispatches: 3,
            total: Duration::from_micros(30),
        };
        timing.merge(KernelTiming {
            dispatches: 2,
            total: Duration::from_micros(10),
        });
        assert_eq!(timing.dispatches, 5);
        assert_eq!(timing.total, Duration::from_micros(40));
        assert_eq!(timing.average(), Duration::from_micros(8));
    }
}
