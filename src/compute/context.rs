// Compute context
//
// Owns the backend, the selected device and the native context created on
// it. Shared by `Arc` with every program, kernel and buffer built on top.

use super::backend::{ComputeBackend, ContextId, DeviceId, GraphicsShareGroup, PlatformId, QueueId};
use super::error::{reported, ComputeError, ComputeResult, Status};
use super::selector::{DeviceDescriptor, DeviceSelector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct ComputeContext {
    backend: Arc<dyn ComputeBackend>,
    descriptor: DeviceDescriptor,
    context: ContextId,
    share_group: Option<GraphicsShareGroup>,
    debug_errors: AtomicBool,
}

impl ComputeContext {
    /// Select a device with the default heuristic and create a context on it.
    ///
    /// # Arguments
    /// * `backend` - Native compute API
    /// * `share_group` - Active graphics context to link with, if any
    pub fn initialize(
        backend: Arc<dyn ComputeBackend>,
        share_group: Option<GraphicsShareGroup>,
    ) -> ComputeResult<Arc<Self>> {
        Self::initialize_with(backend, share_group, &DeviceSelector::new())
    }

    pub fn initialize_with(
        backend: Arc<dyn ComputeBackend>,
        share_group: Option<GraphicsShareGroup>,
        selector: &DeviceSelector,
    ) -> ComputeResult<Arc<Self>> {
        log::info!("Initializing compute context on '{}' backend", backend.name());

        let descriptor = selector.select(backend.as_ref())?;

        let extension = backend.interop_extension();
        let supported = match backend.device_extensions(descriptor.device) {
            Ok(extensions) => extensions.iter().any(|e| e == extension),
            Err(status) => {
                log::error!("Querying device extensions failed: {}", status);
                false
            }
        };
        if !supported {
            return Err(reported(ComputeError::InteropUnsupported {
                device: descriptor.name.clone(),
                extension: extension.to_string(),
            }));
        }

        let context = backend
            .create_context(descriptor.platform, descriptor.device, share_group.as_ref())
            .map_err(|status| reported(ComputeError::ContextCreation(status)))?;

        if share_group.is_some() {
            log::info!("Compute context linked to the active graphics context");
        }

        Ok(Arc::new(Self {
            backend,
            descriptor,
            context,
            share_group,
            debug_errors: AtomicBool::new(true),
        }))
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    pub fn platform(&self) -> PlatformId {
        self.descriptor.platform
    }

    pub fn device(&self) -> DeviceId {
        self.descriptor.device
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn share_group(&self) -> Option<&GraphicsShareGroup> {
        self.share_group.as_ref()
    }

    /// Whether API failures are translated and logged.
    pub fn debug_errors(&self) -> bool {
        self.debug_errors.load(Ordering::Relaxed)
    }

    pub fn set_debug_errors(&self, enabled: bool) {
        self.debug_errors.store(enabled, Ordering::Relaxed);
    }

    /// Translate a backend status into the compute error, logging it with
    /// `op` as prefix while the debug toggle is on.
    pub fn check<T>(&self, op: &'static str, result: Result<T, Status>) -> ComputeResult<T> {
        result.map_err(|status| {
            if self.debug_errors() {
                log::error!("{}: {}", op, status);
            }
            ComputeError::Api { op, status }
        })
    }

    /// Block until `queue` has drained.
    pub fn wait(&self, queue: QueueId) -> ComputeResult<()> {
        self.check("wait for queue", self.backend.finish(queue))
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        log::info!("Destroying compute context...");
        self.backend.release_context(self.context);
    }
}
