//! Scenario tests over the headless backend
//!
//! Each module drives the public device API the way an application would and
//! checks the simulated GPU's view of what happened.

mod command_recording;
mod deferred_destruction;
mod frame_pacing;
mod swapchain_lifecycle;

use ash::vk;
use std::sync::Arc;

use crate::backend::HeadlessBackend;
use crate::command::{CommandRecorderInfo, ExecutableCommandList, ImageBarrierInfo, ImageClearInfo};
use crate::config::DeviceConfig;
use crate::device::Device;
use crate::resource::{BufferId, BufferInfo, ImageId, ImageInfo};
use crate::swapchain::{Swapchain, SwapchainInfo};
use crate::sync::Access;

pub(crate) fn headless_device() -> (Arc<HeadlessBackend>, Device) {
    headless_device_with(DeviceConfig::new("scenario"))
}

pub(crate) fn headless_device_with(config: DeviceConfig) -> (Arc<HeadlessBackend>, Device) {
    let backend = Arc::new(HeadlessBackend::new());
    let device = Device::new(backend.clone(), config).expect("Should create headless device");
    (backend, device)
}

pub(crate) fn create_test_image(device: &Device, name: &str) -> ImageId {
    device
        .create_image(&ImageInfo {
            extent: vk::Extent3D {
                width: 64,
                height: 64,
                depth: 1,
            },
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE,
            name: name.to_string(),
            ..ImageInfo::default()
        })
        .expect("Should create image")
}

pub(crate) fn create_test_buffer(device: &Device, name: &str) -> BufferId {
    device
        .create_buffer(&BufferInfo {
            size: 1024,
            name: name.to_string(),
            ..BufferInfo::default()
        })
        .expect("Should create buffer")
}

/// Transition `image` and clear it
pub(crate) fn record_clear(device: &Device, image: ImageId, name: &str) -> ExecutableCommandList {
    let mut recorder = device
        .create_command_recorder(&CommandRecorderInfo::new(name))
        .expect("Should create recorder");
    recorder
        .queue_image_barrier(&ImageBarrierInfo::transition(
            image,
            Access::none(),
            Access::transfer_write(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ))
        .expect("Should queue barrier");
    recorder
        .clear_image(&ImageClearInfo::new(image, [0.0, 0.0, 0.0, 1.0]))
        .expect("Should clear");
    recorder.finalize().expect("Should finalize")
}

pub(crate) fn create_test_swapchain(backend: &HeadlessBackend, device: &Device, width: u32, height: u32) -> Swapchain {
    let surface = backend.create_test_surface();
    device
        .create_swapchain(SwapchainInfo::new(surface, width, height).with_name("test swapchain"))
        .expect("Should create swapchain")
}
