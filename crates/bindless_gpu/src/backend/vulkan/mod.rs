//! Vulkan backend
//!
//! Owns the instance, one logical device with a single graphics/compute queue
//! (also used for present), a command pool and the global bindless descriptor
//! set. Requires Vulkan 1.3 with timeline semaphores, descriptor indexing and
//! dynamic rendering.

pub mod bindless;
mod encode;
pub mod instance;
mod memory;

use ash::prelude::VkResult;
use ash::{vk, Device};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CString;
use std::sync::Mutex;

use self::bindless::BindlessDescriptorSet;
use self::instance::{LogicalDevice, PhysicalDeviceInfo, VulkanInstance};
use super::{
    BindlessWrite, DeviceBackend, NativeBuffer, NativeImage, NativeImageViewInfo, NativeObject, NativeSubmit,
    NativeSwapchainInfo, SemaphoreKind, SurfaceSupport,
};
use crate::command::Command;
use crate::config::DeviceConfig;
use crate::device::lock;
use crate::error::{GpuError, GpuResult};
use crate::resource::{BufferInfo, ImageInfo};

/// [`DeviceBackend`] over a real Vulkan driver
pub struct VulkanBackend {
    bindless: BindlessDescriptorSet,
    command_pool: Mutex<vk::CommandPool>,
    queue_lock: Mutex<()>,
    // Field order is drop order: device before instance
    device: LogicalDevice,
    physical_device: PhysicalDeviceInfo,
    instance: VulkanInstance,
}

impl VulkanBackend {
    /// Initialize Vulkan
    ///
    /// Pass the display handle of the windowing system to enable
    /// presentation; `None` creates a compute/offscreen-only device whose
    /// surface operations fail with `ERROR_EXTENSION_NOT_PRESENT`.
    pub fn new(config: &DeviceConfig, display: Option<RawDisplayHandle>) -> GpuResult<Self> {
        config.validate()?;

        let instance = VulkanInstance::new(config, display)?;
        let physical_device = PhysicalDeviceInfo::select_suitable_device(&instance.instance, display.is_some())?;
        let device = LogicalDevice::new(&instance.instance, &physical_device, display.is_some())?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(physical_device.graphics_family);
        let command_pool = unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .map_err(GpuError::Vulkan)?
        };

        let bindless = match BindlessDescriptorSet::new(&device.device, config) {
            Ok(bindless) => bindless,
            Err(error) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(GpuError::Vulkan(error));
            }
        };

        log::info!("Vulkan backend ready");
        Ok(Self {
            bindless,
            command_pool: Mutex::new(command_pool),
            queue_lock: Mutex::new(()),
            device,
            physical_device,
            instance,
        })
    }

    /// The logical device, for creating pipelines and shaders
    pub fn device(&self) -> &Device {
        &self.device.device
    }

    /// Properties of the selected GPU
    pub const fn physical_device_properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.physical_device.properties
    }

    /// Layout of the bindless set; pipeline layouts put it at set 0
    pub const fn bindless_layout(&self) -> vk::DescriptorSetLayout {
        self.bindless.layout()
    }

    fn swapchain_loader(&self) -> VkResult<&ash::extensions::khr::Swapchain> {
        self.device
            .swapchain_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }

    fn surface_loader(&self) -> VkResult<&ash::extensions::khr::Surface> {
        self.instance
            .surface_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }
}

impl DeviceBackend for VulkanBackend {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn create_surface(&self, display: RawDisplayHandle, window: RawWindowHandle) -> VkResult<vk::SurfaceKHR> {
        self.surface_loader()?;
        unsafe { ash_window::create_surface(&self.instance.entry, &self.instance.instance, display, window, None) }
    }

    fn surface_support(&self, surface: vk::SurfaceKHR) -> VkResult<SurfaceSupport> {
        let loader = self.surface_loader()?;
        let physical = self.physical_device.device;
        unsafe {
            Ok(SurfaceSupport {
                present_supported: loader.get_physical_device_surface_support(
                    physical,
                    self.physical_device.graphics_family,
                    surface,
                )?,
                capabilities: loader.get_physical_device_surface_capabilities(physical, surface)?,
                formats: loader.get_physical_device_surface_formats(physical, surface)?,
                present_modes: loader.get_physical_device_surface_present_modes(physical, surface)?,
            })
        }
    }

    fn create_swapchain(&self, info: &NativeSwapchainInfo) -> VkResult<vk::SwapchainKHR> {
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(info.surface)
            .min_image_count(info.min_image_count)
            .image_format(info.format.format)
            .image_color_space(info.format.color_space)
            .image_extent(info.extent)
            .image_array_layers(1)
            .image_usage(info.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(info.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(info.present_mode)
            .clipped(true)
            .old_swapchain(info.old_swapchain);
        unsafe { self.swapchain_loader()?.create_swapchain(&create_info, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader()?.get_swapchain_images(swapchain) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader()?
                .acquire_next_image(swapchain, timeout_ns, vk::Semaphore::null(), fence)
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let _queue = lock(&self.queue_lock);
        unsafe { self.swapchain_loader()?.queue_present(self.device.queue, &present_info) }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        unsafe { self.device().create_fence(&vk::FenceCreateInfo::default(), None) }
    }

    fn wait_and_reset_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe {
            self.device().wait_for_fences(&[fence], true, timeout_ns)?;
            self.device().reset_fences(&[fence])
        }
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore> {
        match kind {
            SemaphoreKind::Binary => unsafe {
                self.device()
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            },
            SemaphoreKind::Timeline { initial_value } => {
                let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
                    .semaphore_type(vk::SemaphoreType::TIMELINE)
                    .initial_value(initial_value);
                let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
                unsafe { self.device().create_semaphore(&create_info, None) }
            }
        }
    }

    fn timeline_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        unsafe { self.device().get_semaphore_counter_value(semaphore) }
    }

    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> VkResult<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { self.device().wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn create_image(&self, info: &ImageInfo) -> VkResult<NativeImage> {
        memory::create_image(self.device(), &self.physical_device, info)
    }

    fn create_image_view(&self, info: &NativeImageViewInfo) -> VkResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(info.image)
            .view_type(info.view_type)
            .format(info.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(info.range);
        unsafe { self.device().create_image_view(&create_info, None) }
    }

    fn create_buffer(&self, info: &BufferInfo) -> VkResult<NativeBuffer> {
        memory::create_buffer(self.device(), &self.physical_device, info)
    }

    fn write_bindless(&self, write: BindlessWrite) {
        self.bindless.write(self.device(), write);
    }

    fn destroy(&self, object: NativeObject) {
        let device = self.device();
        unsafe {
            match object {
                NativeObject::Image(image) => {
                    device.destroy_image(image.image, None);
                    device.free_memory(image.memory, None);
                }
                NativeObject::ImageView(view) => device.destroy_image_view(view, None),
                NativeObject::Buffer(buffer) => {
                    device.destroy_buffer(buffer.buffer, None);
                    device.free_memory(buffer.memory, None);
                }
                NativeObject::Semaphore(semaphore) => device.destroy_semaphore(semaphore, None),
                NativeObject::Fence(fence) => device.destroy_fence(fence, None),
                NativeObject::Swapchain(swapchain) => match self.swapchain_loader() {
                    Ok(loader) => loader.destroy_swapchain(swapchain, None),
                    Err(_) => log::error!("Cannot destroy {:?} without the swapchain extension", swapchain),
                },
                NativeObject::Surface(surface) => match self.surface_loader() {
                    Ok(loader) => loader.destroy_surface(surface, None),
                    Err(_) => log::error!("Cannot destroy {:?} without the surface extension", surface),
                },
            }
        }
    }

    fn set_debug_name(&self, object_type: vk::ObjectType, raw_handle: u64, name: &str) {
        let Some(debug_utils) = &self.instance.debug_utils else {
            return;
        };
        if name.is_empty() {
            return;
        }
        let Ok(name) = CString::new(name) else {
            log::warn!("Debug name {:?} contains a NUL byte", name);
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(raw_handle)
            .object_name(&name);
        if let Err(error) = unsafe { debug_utils.set_debug_utils_object_name(self.device().handle(), &name_info) } {
            log::debug!("Failed to set debug name: {:?}", error);
        }
    }

    fn begin_command_buffer(&self) -> VkResult<vk::CommandBuffer> {
        let pool = lock(&self.command_pool);
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device().allocate_command_buffers(&alloc_info)?[0] };

        // Not ONE_TIME_SUBMIT: a retired list may be submitted again
        let begin_info = vk::CommandBufferBeginInfo::builder();
        if let Err(error) = unsafe { self.device().begin_command_buffer(command_buffer, &begin_info) } {
            unsafe { self.device().free_command_buffers(*pool, &[command_buffer]) };
            return Err(error);
        }
        Ok(command_buffer)
    }

    fn encode(&self, command_buffer: vk::CommandBuffer, command: &Command) {
        // Recording into a pool's buffers must be externally synchronized with the pool
        let _pool = lock(&self.command_pool);
        encode::encode(self.device(), command_buffer, self.bindless.set(), command);
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let _pool = lock(&self.command_pool);
        unsafe { self.device().end_command_buffer(command_buffer) }
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        let pool = lock(&self.command_pool);
        unsafe { self.device().free_command_buffers(*pool, &[command_buffer]) };
    }

    fn queue_submit(&self, submit: &NativeSubmit<'_>) -> VkResult<()> {
        let wait_semaphores: Vec<vk::Semaphore> = submit
            .wait_semaphores
            .iter()
            .map(|(semaphore, _)| *semaphore)
            .collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = submit.wait_semaphores.iter().map(|(_, stage)| *stage).collect();
        let wait_values = vec![0; wait_semaphores.len()];

        let mut signal_semaphores = submit.signal_semaphores.to_vec();
        signal_semaphores.push(submit.timeline);
        let mut signal_values = vec![0; submit.signal_semaphores.len()];
        signal_values.push(submit.timeline_value);

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        let _queue = lock(&self.queue_lock);
        unsafe { self.device().queue_submit(self.device.queue, &[submit_info], vk::Fence::null()) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        let _queue = lock(&self.queue_lock);
        unsafe { self.device().device_wait_idle() }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan backend");
        let device = &self.device.device;
        unsafe {
            let _ = device.device_wait_idle();
            self.bindless.destroy(device);
            device.destroy_command_pool(*lock(&self.command_pool), None);
        }
    }
}
