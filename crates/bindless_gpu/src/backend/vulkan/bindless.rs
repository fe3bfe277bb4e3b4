//! The global bindless descriptor set

use ash::prelude::VkResult;
use ash::{vk, Device};
use std::sync::Mutex;

use crate::backend::BindlessWrite;
use crate::config::DeviceConfig;
use crate::device::lock;

/// Binding of the storage buffer array
pub const STORAGE_BUFFER_BINDING: u32 = 0;
/// Binding of the storage image array
pub const STORAGE_IMAGE_BINDING: u32 = 1;
/// Binding of the sampled image array
pub const SAMPLED_IMAGE_BINDING: u32 = 2;

/// One update-after-bind descriptor set shared by every pipeline
pub struct BindlessDescriptorSet {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    write_lock: Mutex<()>,
}

impl BindlessDescriptorSet {
    /// Create the pool, layout and the single set
    pub fn new(device: &Device, config: &DeviceConfig) -> VkResult<Self> {
        let buffers = config.max_bindless_buffers;
        let views = config.max_bindless_image_views;

        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(STORAGE_BUFFER_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(buffers)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(STORAGE_IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(views)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(SAMPLED_IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(views)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
        ];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING; 3];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: buffers,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: views,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: views,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(error) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(error);
            }
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(error) => {
                unsafe {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(error);
            }
        };

        log::debug!("Created bindless table ({} buffers, {} image views)", buffers, views);
        Ok(Self {
            pool,
            layout,
            set,
            write_lock: Mutex::new(()),
        })
    }

    /// Layout pipelines must place at set 0 to read the table
    pub const fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The descriptor set
    pub const fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Publish a resource at its index
    pub fn write(&self, device: &Device, write: BindlessWrite) {
        let _guard = lock(&self.write_lock);
        match write {
            BindlessWrite::Buffer { index, buffer, size } => {
                let buffer_info = [vk::DescriptorBufferInfo {
                    buffer,
                    offset: 0,
                    range: size,
                }];
                let writes = [vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(STORAGE_BUFFER_BINDING)
                    .dst_array_element(index)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&buffer_info)
                    .build()];
                unsafe { device.update_descriptor_sets(&writes, &[]) };
            }
            BindlessWrite::ImageView {
                index,
                view,
                storage,
                sampled,
            } => {
                let storage_info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::GENERAL,
                }];
                let sampled_info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }];

                let mut writes = Vec::with_capacity(2);
                if storage {
                    writes.push(
                        vk::WriteDescriptorSet::builder()
                            .dst_set(self.set)
                            .dst_binding(STORAGE_IMAGE_BINDING)
                            .dst_array_element(index)
                            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                            .image_info(&storage_info)
                            .build(),
                    );
                }
                if sampled {
                    writes.push(
                        vk::WriteDescriptorSet::builder()
                            .dst_set(self.set)
                            .dst_binding(SAMPLED_IMAGE_BINDING)
                            .dst_array_element(index)
                            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                            .image_info(&sampled_info)
                            .build(),
                    );
                }
                unsafe { device.update_descriptor_sets(&writes, &[]) };
            }
        }
    }

    /// Destroy the pool (freeing the set) and the layout
    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
