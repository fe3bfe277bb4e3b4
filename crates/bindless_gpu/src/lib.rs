//! # bindless_gpu
//!
//! Bindless GPU resource handles, swapchain frame pacing and deferred
//! destruction over Vulkan.
//!
//! ## Features
//!
//! - **Typed handles**: images, views and buffers are `Copy` handles with a
//!   stable index into one global bindless descriptor set
//! - **Timeline submission**: every submit signals one device timeline value
//! - **Deferred destruction**: resources are freed only after the GPU passes
//!   the last submission that could reference them
//! - **Swapchain state machine**: acquire, present, resize and surface loss
//! - **Frame pacing**: a bounded ring of frames in flight
//! - **Headless backend**: the full core runs without a GPU for tests and tools
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bindless_gpu::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DeviceConfig::new("quick start");
//!     let device = Device::new(Arc::new(HeadlessBackend::new()), config)?;
//!
//!     let image = device.create_image(&ImageInfo {
//!         extent: vk::Extent3D { width: 256, height: 256, depth: 1 },
//!         usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
//!         name: "albedo".to_string(),
//!         ..ImageInfo::default()
//!     })?;
//!
//!     let mut recorder = device.create_command_recorder(&CommandRecorderInfo::new("upload"))?;
//!     recorder.queue_image_barrier(&ImageBarrierInfo::transition(
//!         image,
//!         Access::none(),
//!         Access::transfer_write(),
//!         vk::ImageLayout::UNDEFINED,
//!         vk::ImageLayout::TRANSFER_DST_OPTIMAL,
//!     ))?;
//!     recorder.clear_image(&ImageClearInfo::new(image, [0.0, 0.0, 0.0, 1.0]))?;
//!     let list = recorder.finalize()?;
//!
//!     device.submit_commands(&SubmitInfo::new(&[list]))?;
//!     device.destroy_image(image)?;
//!     device.wait_idle()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod backend;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod foundation;
pub mod frame;
pub mod gc;
pub mod resource;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod tests;

pub use ash::vk;

pub use backend::{DeviceBackend, HeadlessBackend, HeadlessFaults, VulkanBackend};
pub use command::{CommandListState, CommandRecorder, CommandRecorderInfo, ExecutableCommandList};
pub use config::{Config, ConfigError, DeviceConfig};
pub use device::{Device, SubmitInfo};
pub use error::{GpuError, GpuResult};
pub use frame::{FramePacer, FrameSubmitInfo};
pub use gc::GcReport;
pub use resource::{BufferId, BufferInfo, ImageId, ImageInfo, ImageViewId, ImageViewInfo};
pub use swapchain::{Swapchain, SwapchainImage, SwapchainInfo, SwapchainState};
pub use sync::{Access, BinarySemaphore};

/// Common imports for crate users
pub mod prelude {
    pub use crate::{
        backend::{DeviceBackend, HeadlessBackend, VulkanBackend},
        command::{
            BufferBarrierInfo, BufferCopyInfo, BufferImageCopyInfo, CommandRecorder, CommandRecorderInfo,
            ExecutableCommandList, ImageBarrierInfo, ImageBlitInfo, ImageClearInfo, RenderingAttachmentInfo,
            RenderingInfo,
        },
        config::DeviceConfig,
        device::{Device, SubmitInfo},
        error::{GpuError, GpuResult},
        frame::{FramePacer, FrameSubmitInfo},
        resource::{BufferId, BufferInfo, ImageId, ImageInfo, ImageViewId, ImageViewInfo},
        swapchain::{Swapchain, SwapchainImage, SwapchainInfo},
        sync::{Access, BinarySemaphore},
        vk,
    };
}
