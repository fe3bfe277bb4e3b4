//! Dedicated-allocation images and buffers

use ash::prelude::VkResult;
use ash::{vk, Device};

use super::instance::PhysicalDeviceInfo;
use crate::backend::{NativeBuffer, NativeImage};
use crate::resource::{BufferInfo, ImageInfo};

fn allocate(
    device: &Device,
    physical_device: &PhysicalDeviceInfo,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> VkResult<vk::DeviceMemory> {
    let memory_type_index = physical_device
        .find_memory_type(requirements.memory_type_bits, properties)
        .ok_or_else(|| {
            log::error!("No memory type with {:?} in mask {:#x}", properties, requirements.memory_type_bits);
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        })?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    unsafe { device.allocate_memory(&alloc_info, None) }
}

/// Create a 2D image in device-local memory
pub fn create_image(device: &Device, physical_device: &PhysicalDeviceInfo, info: &ImageInfo) -> VkResult<NativeImage> {
    let image_type = if info.extent.depth > 1 {
        vk::ImageType::TYPE_3D
    } else {
        vk::ImageType::TYPE_2D
    };
    let create_info = vk::ImageCreateInfo::builder()
        .image_type(image_type)
        .format(info.format)
        .extent(info.extent)
        .mip_levels(info.mip_level_count)
        .array_layers(info.array_layer_count)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(info.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { device.create_image(&create_info, None)? };
    let requirements = unsafe { device.get_image_memory_requirements(image) };

    let memory = match allocate(device, physical_device, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        Ok(memory) => memory,
        Err(error) => {
            unsafe { device.destroy_image(image, None) };
            return Err(error);
        }
    };

    if let Err(error) = unsafe { device.bind_image_memory(image, memory, 0) } {
        unsafe {
            device.destroy_image(image, None);
            device.free_memory(memory, None);
        }
        return Err(error);
    }

    Ok(NativeImage { image, memory })
}

/// Create a buffer, host-visible and coherent when `info.host_visible` is set
pub fn create_buffer(
    device: &Device,
    physical_device: &PhysicalDeviceInfo,
    info: &BufferInfo,
) -> VkResult<NativeBuffer> {
    let create_info = vk::BufferCreateInfo::builder()
        .size(info.size)
        .usage(info.usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.create_buffer(&create_info, None)? };
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let properties = if info.host_visible {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    } else {
        vk::MemoryPropertyFlags::DEVICE_LOCAL
    };

    let memory = match allocate(device, physical_device, requirements, properties) {
        Ok(memory) => memory,
        Err(error) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(error);
        }
    };

    if let Err(error) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
        unsafe {
            device.destroy_buffer(buffer, None);
            device.free_memory(memory, None);
        }
        return Err(error);
    }

    Ok(NativeBuffer { buffer, memory })
}
