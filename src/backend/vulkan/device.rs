// Vulkan instance and logical device
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device listing (selection happens in the compute layer)
// - Logical device with a compute queue and its graphics partner family
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::{CStr, CString};

/// Vulkan instance plus the debug messenger, shared by every context.
pub struct VulkanInstance {
    pub instance: ash::Instance,
    _entry: Entry,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create Vulkan instance
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, app_name, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        Ok(Self {
            instance,
            _entry: entry,
            debug_utils,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("particle-interop")?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = Vec::new();
        let layer_names = if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    pub fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>, vk::Result> {
        unsafe { self.instance.enumerate_physical_devices() }
    }

    pub fn device_name(&self, physical_device: vk::PhysicalDevice) -> String {
        let props = unsafe { self.instance.get_physical_device_properties(physical_device) };
        props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "Unknown device".to_string())
    }

    pub fn extension_names(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<String>, vk::Result> {
        let extensions =
            unsafe { self.instance.enumerate_device_extension_properties(physical_device) }?;
        Ok(extensions
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");

        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Logical device: one compute queue, plus the family graphics submits on.
pub struct VulkanDevice {
    allocator: Mutex<Option<gpu_allocator::vulkan::Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    pub compute_queue: vk::Queue,
    pub compute_queue_family: u32,
    pub graphics_queue_family: u32,

    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create the logical device on `physical_device`.
    ///
    /// When `prefer_shared_family` is set, a family that supports both
    /// graphics and compute is used for compute so interop transfers stay
    /// within one family.
    pub fn new(
        instance: &VulkanInstance,
        physical_device: vk::PhysicalDevice,
        prefer_shared_family: bool,
    ) -> Result<Self> {
        let instance = &instance.instance;

        let (compute_queue_family, graphics_queue_family) =
            Self::pick_queue_families(instance, physical_device, prefer_shared_family)?;

        let (device, compute_queue) =
            Self::create_logical_device(instance, physical_device, compute_queue_family)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Compute device: {}",
            properties
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: compute {}, graphics {}",
            compute_queue_family,
            graphics_queue_family
        );

        let allocator = match Self::create_allocator(instance, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        Ok(Self {
            allocator: Mutex::new(Some(allocator)),
            device,
            physical_device,
            compute_queue,
            compute_queue_family,
            graphics_queue_family,
            properties,
            memory_properties,
        })
    }

    fn pick_queue_families(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        prefer_shared_family: bool,
    ) -> Result<(u32, u32)> {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let find = |flags: vk::QueueFlags| {
            families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(flags))
                .map(|(i, _)| i as u32)
        };

        let graphics = find(vk::QueueFlags::GRAPHICS);
        let shared = find(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
        let compute = find(vk::QueueFlags::COMPUTE);

        let compute = if prefer_shared_family {
            shared.or(compute)
        } else {
            compute
        };

        match (compute, graphics) {
            (Some(compute), Some(graphics)) => Ok((compute, graphics)),
            (Some(compute), None) => Ok((compute, compute)),
            _ => anyhow::bail!("Device has no compute queue family"),
        }
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        compute_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_queue_family)
            .queue_priorities(&queue_priorities);

        let extensions = [ash::khr::external_memory::NAME.as_ptr()];

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let compute_queue = unsafe { device.get_device_queue(compute_queue_family, 0) };

        Ok((device, compute_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<gpu_allocator::vulkan::Allocator> {
        let allocator =
            gpu_allocator::vulkan::Allocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })?;

        Ok(allocator)
    }

    pub fn allocator(&self) -> MutexGuard<'_, Option<gpu_allocator::vulkan::Allocator>> {
        self.allocator.lock()
    }

    /// Whether compute and graphics submit on different queue families.
    pub fn needs_ownership_transfer(&self) -> bool {
        self.compute_queue_family != self.graphics_queue_family
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Allocator must go before the device it allocates from
        self.allocator.lock().take();
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
