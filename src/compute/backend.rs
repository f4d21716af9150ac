// Compute backend seam
//
// Everything above this trait (context, program, kernels, buffers) is
// API-agnostic. A backend owns the native objects and hands out opaque
// handles; it hosts at most one live context at a time.

use super::error::Status;

/// Opaque native handle value.
pub type RawHandle = u64;

macro_rules! handle_type {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub RawHandle);

            impl $name {
                pub fn raw(self) -> RawHandle {
                    self.0
                }
            }
        )*
    };
}

handle_type!(
    PlatformId,
    DeviceId,
    ContextId,
    ProgramId,
    QueueId,
    KernelId,
    /// Native handle of a device memory allocation.
    BufferId,
    /// Handle of a buffer owned by the graphics side.
    GraphicsBufferHandle,
);

/// Byte size of a buffer handle when passed as a kernel argument.
pub const NATIVE_HANDLE_SIZE: usize = std::mem::size_of::<RawHandle>();

/// Hardware class of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Cpu,
    Gpu,
    Accelerator,
}

impl DeviceClass {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceClass::Cpu => "CPU",
            DeviceClass::Gpu => "GPU",
            DeviceClass::Accelerator => "Accelerator",
        }
    }
}

/// PCI vendor identifiers the selection heuristic knows about.
pub mod vendor {
    pub const AMD: u32 = 0x1002;
    pub const INTEL: u32 = 0x8086;
    pub const NVIDIA: u32 = 0x10de;

    pub fn name(id: u32) -> &'static str {
        match id {
            AMD => "AMD",
            INTEL => "Intel",
            NVIDIA => "NVIDIA",
            _ => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub id: PlatformId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    pub vendor_id: u32,
}

/// How the host and kernels may touch a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Handles identifying the graphics context a compute context is linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsShareGroup {
    pub context: RawHandle,
    pub device: RawHandle,
}

/// Value bound to one kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgValue {
    /// Device memory, passed by handle.
    Buffer(BufferId),
    /// Work-group scratch of the given byte size, no data.
    Local(usize),
}

/// A failed program build, with the compiler's log.
#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub status: Status,
    pub log: String,
}

/// Platform/device discovery.
pub trait DeviceEnumerator {
    fn platforms(&self) -> Result<Vec<PlatformInfo>, Status>;
    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceInfo>, Status>;
}

/// A native compute API.
///
/// Enqueue operations go to one in-order queue and may complete
/// asynchronously; `enqueue_read` and `finish` block the host.
pub trait ComputeBackend: DeviceEnumerator + Send + Sync {
    fn name(&self) -> &'static str;

    /// Extension a device must expose to share buffers with graphics.
    fn interop_extension(&self) -> &'static str;

    fn device_extensions(&self, device: DeviceId) -> Result<Vec<String>, Status>;

    fn create_context(
        &self,
        platform: PlatformId,
        device: DeviceId,
        share_group: Option<&GraphicsShareGroup>,
    ) -> Result<ContextId, Status>;
    fn release_context(&self, context: ContextId);

    fn build_program(&self, source: &[u8]) -> Result<ProgramId, BuildFailure>;
    fn release_program(&self, program: ProgramId);

    fn create_queue(&self) -> Result<QueueId, Status>;
    fn release_queue(&self, queue: QueueId);

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId, Status>;
    fn release_kernel(&self, kernel: KernelId);
    fn set_kernel_arg(&self, kernel: KernelId, index: u32, value: ArgValue) -> Result<(), Status>;

    fn create_buffer(&self, size: usize, access: AccessMode) -> Result<BufferId, Status>;
    fn import_graphics_buffer(
        &self,
        graphics: GraphicsBufferHandle,
        access: AccessMode,
    ) -> Result<BufferId, Status>;
    fn release_buffer(&self, buffer: BufferId);

    fn enqueue_write(&self, queue: QueueId, buffer: BufferId, data: &[u8]) -> Result<(), Status>;
    fn enqueue_read(&self, queue: QueueId, buffer: BufferId, out: &mut [u8]) -> Result<(), Status>;

    /// `wait_count` previously enqueued commands must complete first; the
    /// queue is in-order so this never reorders anything.
    fn enqueue_dispatch(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: [usize; 3],
        local: [usize; 3],
        wait_count: u32,
    ) -> Result<(), Status>;

    fn enqueue_acquire_graphics(&self, queue: QueueId, buffers: &[BufferId]) -> Result<(), Status>;
    fn enqueue_release_graphics(&self, queue: QueueId, buffers: &[BufferId]) -> Result<(), Status>;

    fn finish(&self, queue: QueueId) -> Result<(), Status>;
}
