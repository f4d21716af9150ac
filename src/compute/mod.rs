// Compute layer - device selection, context, programs, kernels, buffers
//
// API-agnostic: every native call goes through `ComputeBackend`.

pub mod backend;
pub mod buffer;
pub mod context;
pub mod error;
pub mod kernel;
pub mod program;
pub mod registry;
pub mod selector;

pub use backend::{
    AccessMode, ArgValue, BufferId, ComputeBackend, DeviceClass, DeviceEnumerator, DeviceInfo,
    GraphicsBufferHandle, GraphicsShareGroup, PlatformInfo,
};
pub use buffer::{DeviceBuffer, GraphicsBuffer, VertexBufferFactory};
pub use context::ComputeContext;
pub use error::{ComputeError, ComputeResult, ResourceKind, Status};
pub use kernel::{ArgClass, Kernel, KernelArg};
pub use program::{KernelTiming, Program};
pub use registry::{Insertion, Registry};
pub use selector::{DeviceDescriptor, DeviceSelector, SelectionStrategy, VendorHeuristic};
