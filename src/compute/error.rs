// Compute error taxonomy
//
// Two layers: `Status` is what a backend call reports (the API status code),
// `ComputeError` is what the compute layer hands back to its callers.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Status code reported by a compute backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    DeviceNotFound,
    DeviceNotAvailable,
    CompilerNotAvailable,
    AllocationFailure,
    OutOfResources,
    OutOfHostMemory,
    BuildProgramFailure,
    InvalidValue,
    InvalidPlatform,
    InvalidDevice,
    InvalidContext,
    InvalidQueue,
    InvalidBuffer,
    InvalidBufferSize,
    InvalidProgram,
    InvalidKernelName,
    InvalidKernel,
    InvalidKernelArgs,
    InvalidArgIndex,
    InvalidArgValue,
    InvalidArgSize,
    InvalidWorkGroupSize,
    InvalidGraphicsObject,
    GraphicsObjectNotAcquired,
    InvalidOperation,
    /// Backend-native code with no portable equivalent.
    Native(i32),
}

impl Status {
    /// Human-readable description, one entry per status code.
    pub fn describe(&self) -> &'static str {
        match self {
            Status::DeviceNotFound => "no compute device matched the request",
            Status::DeviceNotAvailable => "device is not currently available",
            Status::CompilerNotAvailable => "no compiler available for this device",
            Status::AllocationFailure => "failed to allocate device memory",
            Status::OutOfResources => "device ran out of resources",
            Status::OutOfHostMemory => "host ran out of memory",
            Status::BuildProgramFailure => "program failed to build for the device",
            Status::InvalidValue => "an argument value is invalid",
            Status::InvalidPlatform => "platform handle is invalid",
            Status::InvalidDevice => "device handle is invalid",
            Status::InvalidContext => "context is invalid or not created",
            Status::InvalidQueue => "command queue handle is invalid",
            Status::InvalidBuffer => "buffer handle is invalid",
            Status::InvalidBufferSize => "buffer size is zero or exceeds the allocation",
            Status::InvalidProgram => "program handle is invalid or not built",
            Status::InvalidKernelName => "no entry point with this name in the program",
            Status::InvalidKernel => "kernel handle is invalid or has no implementation",
            Status::InvalidKernelArgs => "kernel arguments have not all been set",
            Status::InvalidArgIndex => "argument index is out of range for the kernel",
            Status::InvalidArgValue => "argument value is invalid for this slot",
            Status::InvalidArgSize => "argument size does not match the slot",
            Status::InvalidWorkGroupSize => "local work size does not divide the global work size",
            Status::InvalidGraphicsObject => "graphics object is invalid or foreign to this context",
            Status::GraphicsObjectNotAcquired => "graphics buffer used without being acquired",
            Status::InvalidOperation => "operation is not valid in the current state",
            Status::Native(_) => "backend-specific failure",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Native(code) => write!(f, "{} (native code {})", self.describe(), code),
            _ => write!(f, "{:?}: {}", self, self.describe()),
        }
    }
}

/// Which registry a named resource lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Kernel,
    Buffer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Kernel => f.write_str("kernel"),
            ResourceKind::Buffer => f.write_str("buffer"),
        }
    }
}

/// Errors returned by the compute layer.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("found no compute devices on any platform")]
    DeviceNotFound,

    #[error("failed to create compute context: {0}")]
    ContextCreation(Status),

    #[error("device '{device}' does not expose the '{extension}' interop extension")]
    InteropUnsupported { device: String, extension: String },

    #[error("program build failed:\n{log}")]
    CompileFailure { log: String },

    #[error("{kind} with name '{name}' already exists in program")]
    DuplicateName { kind: ResourceKind, name: String },

    #[error("size mismatch on buffer '{name}': expected {expected} bytes, given {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("no {kind} with name '{name}' found")]
    MissingResource { kind: ResourceKind, name: String },

    #[error("buffer '{0}' is not attached to a graphics buffer")]
    NotInteropBuffer(String),

    #[error("{op} failed: {status}")]
    Api { op: &'static str, status: Status },

    #[error("cannot read compute source {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ComputeError {
    /// Errors the process is not expected to recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ComputeError::DeviceNotFound
                | ComputeError::ContextCreation(_)
                | ComputeError::InteropUnsupported { .. }
                | ComputeError::CompileFailure { .. }
                | ComputeError::Io { .. }
        )
    }

    /// Backend status carried by the error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            ComputeError::ContextCreation(status) | ComputeError::Api { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

pub type ComputeResult<T> = Result<T, ComputeError>;

/// Log a recoverable error and hand it back for propagation.
pub(crate) fn reported(err: ComputeError) -> ComputeError {
    if err.is_fatal() {
        log::error!("CRITICAL: {}", err);
    } else {
        log::error!("{}", err);
    }
    err
}
