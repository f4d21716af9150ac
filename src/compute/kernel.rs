// Kernels
//
// A compiled entry point plus its positional argument list. Argument order
// is fixed at construction and must match the parameter order declared in
// the compute source.

use super::backend::{ArgValue, BufferId, KernelId, QueueId, NATIVE_HANDLE_SIZE};
use super::buffer::DeviceBuffer;
use super::context::ComputeContext;
use super::error::{ComputeError, ComputeResult, ResourceKind};
use super::program::Program;
use std::sync::Arc;

/// Storage class of a kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    /// Device memory, bound by buffer handle.
    Global,
    /// Per-work-group scratch, bound by size only.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArg {
    name: String,
    buffer: Option<BufferId>,
    size: usize,
    class: ArgClass,
}

impl KernelArg {
    pub fn global(buffer: &DeviceBuffer) -> Self {
        Self {
            name: buffer.name().to_string(),
            buffer: Some(buffer.handle()),
            size: NATIVE_HANDLE_SIZE,
            class: ArgClass::Global,
        }
    }

    pub fn local(name: &str, bytes: usize) -> Self {
        Self {
            name: name.to_string(),
            buffer: None,
            size: bytes,
            class: ArgClass::Local,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn class(&self) -> ArgClass {
        self.class
    }

    fn value(&self) -> ComputeResult<ArgValue> {
        match (self.class, self.buffer) {
            (ArgClass::Global, Some(buffer)) => Ok(ArgValue::Buffer(buffer)),
            (ArgClass::Global, None) => Err(ComputeError::MissingResource {
                kind: ResourceKind::Buffer,
                name: self.name.clone(),
            }),
            (ArgClass::Local, _) => Ok(ArgValue::Local(self.size)),
        }
    }
}

pub struct Kernel {
    name: String,
    handle: KernelId,
    args: Vec<KernelArg>,
    ctx: Arc<ComputeContext>,
}

impl Kernel {
    /// Create the entry point `name` from the program's compiled unit.
    pub fn compile(program: &Program, name: &str, args: Vec<KernelArg>) -> ComputeResult<Self> {
        let ctx = program.context();
        let handle = ctx.check(
            "create kernel",
            ctx.backend().create_kernel(program.id(), name),
        )?;
        log::trace!("Compiled kernel '{}' with {} argument(s)", name, args.len());

        Ok(Self {
            name: name.to_string(),
            handle,
            args,
            ctx: Arc::clone(ctx),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> KernelId {
        self.handle
    }

    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }

    /// Bind every argument to its slot in declaration order, then wait on
    /// `queue` so the bindings are visible to the next dispatch.
    ///
    /// All slots are attempted; the first failure is returned.
    pub fn attach_args(&self, queue: QueueId) -> ComputeResult<()> {
        let backend = self.ctx.backend();
        let mut first_error = None;

        for (index, arg) in self.args.iter().enumerate() {
            let bound = arg.value().and_then(|value| {
                self.ctx.check(
                    "set kernel argument",
                    backend.set_kernel_arg(self.handle, index as u32, value),
                )
            });

            if let Err(err) = bound {
                log::error!(
                    "Failed to set argument '{}' at {} on kernel '{}'",
                    arg.name,
                    index,
                    self.name
                );
                first_error.get_or_insert(err);
            }
        }

        self.ctx.wait(queue)?;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Point every global argument bound to `old` at `new` instead.
    /// Returns how many slots changed.
    pub(crate) fn rebind(&mut self, old: BufferId, new: BufferId) -> usize {
        let mut changed = 0;
        for arg in &mut self.args {
            if arg.class == ArgClass::Global && arg.buffer == Some(old) {
                arg.buffer = Some(new);
                changed += 1;
            }
        }
        changed
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.ctx.backend().release_kernel(self.handle);
    }
}
