//! Vulkan instance, physical device selection and logical device creation

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

use crate::config::DeviceConfig;
use crate::error::{GpuError, GpuResult};

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Surface extension loader, present when a display was given
    pub surface_loader: Option<Surface>,
    /// Debug utilities extension, present when validation is enabled
    pub debug_utils: Option<DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a Vulkan 1.3 instance, with surface extensions for `display`
    pub fn new(config: &DeviceConfig, display: Option<RawDisplayHandle>) -> GpuResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| GpuError::Initialization(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|e| GpuError::Initialization(format!("Invalid application name: {e}")))?;
        let engine_name = CString::new("bindless_gpu")
            .map_err(|e| GpuError::Initialization(format!("Invalid engine name: {e}")))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<*const c_char> = match display {
            Some(display) => ash_window::enumerate_required_extensions(display)
                .map_err(GpuError::Vulkan)?
                .to_vec(),
            None => Vec::new(),
        };

        let validation = config.validation_enabled();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation")
                .map_err(|e| GpuError::Initialization(e.to_string()))?]
        } else {
            Vec::new()
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(GpuError::Vulkan)?
        };

        let surface_loader = display.map(|_| Surface::new(&entry, &instance));

        let (debug_utils, debug_messenger) = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => (Some(debug_utils), Some(messenger)),
                Err(error) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(error);
                }
            }
        } else {
            (None, None)
        };

        log::debug!("Created Vulkan instance (validation: {})", validation);
        Ok(Self {
            entry,
            instance,
            surface_loader,
            debug_utils,
            debug_messenger,
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> GpuResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(GpuError::Vulkan)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Routes validation messages into `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the graphics queue family, also used for present
    pub graphics_family: u32,
}

impl PhysicalDeviceInfo {
    /// First device with a graphics queue and the features the core needs
    pub fn select_suitable_device(instance: &Instance, needs_swapchain: bool) -> GpuResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(GpuError::Vulkan)? };

        for device in devices {
            match Self::evaluate_device(instance, device, needs_swapchain) {
                Ok(info) => {
                    log::info!("Selected GPU: {}", unsafe {
                        CStr::from_ptr(info.properties.device_name.as_ptr()).to_string_lossy()
                    });
                    return Ok(info);
                }
                Err(reason) => log::debug!("Skipping physical device {:?}: {}", device, reason),
            }
        }

        Err(GpuError::Initialization("No suitable GPU found".to_string()))
    }

    fn evaluate_device(instance: &Instance, device: vk::PhysicalDevice, needs_swapchain: bool) -> Result<Self, String> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_3 {
            return Err("Vulkan 1.3 not supported".to_string());
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let graphics_family = queue_families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
            .and_then(|index| u32::try_from(index).ok())
            .ok_or_else(|| "No graphics queue family found".to_string())?;

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut features12)
            .push_next(&mut features13);
        unsafe { instance.get_physical_device_features2(device, &mut features2) };

        let required = [
            (features12.timeline_semaphore, "timeline semaphores"),
            (features12.descriptor_indexing, "descriptor indexing"),
            (features12.runtime_descriptor_array, "runtime descriptor arrays"),
            (features12.descriptor_binding_partially_bound, "partially bound descriptors"),
            (features12.descriptor_binding_update_unused_while_pending, "update unused while pending"),
            (features12.descriptor_binding_storage_buffer_update_after_bind, "storage buffer update after bind"),
            (features12.descriptor_binding_storage_image_update_after_bind, "storage image update after bind"),
            (features12.descriptor_binding_sampled_image_update_after_bind, "sampled image update after bind"),
            (features13.dynamic_rendering, "dynamic rendering"),
            (features13.synchronization2, "synchronization2"),
        ];
        if let Some((_, missing)) = required.iter().find(|(supported, _)| *supported == vk::FALSE) {
            return Err(format!("{missing} not supported"));
        }

        if needs_swapchain {
            let extensions = unsafe {
                instance
                    .enumerate_device_extension_properties(device)
                    .map_err(|e| format!("{e:?}"))?
            };
            let has_swapchain = extensions.iter().any(|available| {
                let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
                name == SwapchainLoader::name()
            });
            if !has_swapchain {
                return Err("VK_KHR_swapchain not supported".to_string());
            }
        }

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        Ok(Self {
            device,
            properties,
            memory_properties,
            graphics_family,
        })
    }

    /// Find a memory type allowed by `type_filter` that has all of `properties`
    pub fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            (type_filter & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// The single queue used for submit and present
    pub queue: vk::Queue,
    /// Swapchain extension loader, present when a display was given
    pub swapchain_loader: Option<SwapchainLoader>,
}

impl LogicalDevice {
    /// Create the device with the bindless, timeline and dynamic rendering features
    pub fn new(instance: &Instance, physical_device: &PhysicalDeviceInfo, with_swapchain: bool) -> GpuResult<Self> {
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(physical_device.graphics_family)
            .queue_priorities(&priorities)
            .build()];

        let extensions: Vec<*const c_char> = if with_swapchain {
            vec![SwapchainLoader::name().as_ptr()]
        } else {
            Vec::new()
        };

        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .shader_storage_buffer_array_non_uniform_indexing(true)
            .shader_storage_image_array_non_uniform_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .build();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .synchronization2(true)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device = unsafe {
            instance
                .create_device(physical_device.device, &create_info, None)
                .map_err(GpuError::Vulkan)?
        };
        let queue = unsafe { device.get_device_queue(physical_device.graphics_family, 0) };
        let swapchain_loader = with_swapchain.then(|| SwapchainLoader::new(instance, &device));

        Ok(Self {
            device,
            queue,
            swapchain_loader,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}
