//! Synchronization primitives for GPU/CPU coordination
//!
//! The device's timeline semaphore is the single source of GPU progress and
//! lives inside [`Device`](crate::Device). This module holds the pieces the
//! caller handles directly:
//!
//! - [`BinarySemaphore`]: one-shot GPU-side signal for the acquire → submit
//!   and submit → present handoffs
//! - [`Access`]: a pipeline stage / access mask pair used to describe both
//!   halves of a barrier
//!
//! ## Memory Barrier Presets
//!
//! ```
//! use bindless_gpu::sync::Access;
//!
//! // Transfer write followed by a fragment shader read (texture upload)
//! let (src, dst) = (Access::transfer_write(), Access::fragment_shader_read());
//! assert!(src.stages.contains(ash::vk::PipelineStageFlags::TRANSFER));
//! # let _ = dst;
//! ```

use ash::vk;
use std::fmt;

use crate::backend::{NativeObject, SemaphoreKind};
use crate::device::Device;
use crate::error::{GpuError, GpuResult};

/// Binary semaphore owned by the caller
///
/// Dropping it does not destroy the native semaphore straight away: a binary
/// semaphore may still be waited on by queued work, so destruction goes
/// through the device's garbage collector behind the current timeline value.
pub struct BinarySemaphore {
    device: Device,
    semaphore: vk::Semaphore,
    name: String,
}

impl BinarySemaphore {
    pub(crate) fn new(device: &Device, name: &str) -> GpuResult<Self> {
        let backend = device.backend();
        let semaphore = backend
            .create_semaphore(SemaphoreKind::Binary)
            .map_err(GpuError::from_vk)?;
        if !name.is_empty() {
            backend.set_debug_name(vk::ObjectType::SEMAPHORE, vk::Handle::as_raw(semaphore), name);
        }
        log::trace!("Created binary semaphore '{}'", name);

        Ok(Self {
            device: device.clone(),
            semaphore,
            name: name.to_string(),
        })
    }

    /// Native semaphore handle
    pub fn raw(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for BinarySemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinarySemaphore")
            .field("semaphore", &self.semaphore)
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for BinarySemaphore {
    fn drop(&mut self) {
        self.device.defer_destruction(NativeObject::Semaphore(self.semaphore));
    }
}

/// One side of a barrier: the pipeline stages and memory accesses involved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    /// Pipeline stages
    pub stages: vk::PipelineStageFlags,
    /// Memory access types
    pub access: vk::AccessFlags,
}

impl Access {
    /// Build an access from raw flags
    pub const fn new(stages: vk::PipelineStageFlags, access: vk::AccessFlags) -> Self {
        Self { stages, access }
    }

    /// Nothing happened before (fresh images, first use)
    pub const fn none() -> Self {
        Self::new(vk::PipelineStageFlags::empty(), vk::AccessFlags::empty())
    }

    /// Read by a copy, blit or resolve
    pub const fn transfer_read() -> Self {
        Self::new(vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
    }

    /// Written by a copy, blit or clear
    pub const fn transfer_write() -> Self {
        Self::new(vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
    }

    /// Written as a color attachment
    pub const fn color_attachment_write() -> Self {
        Self::new(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
    }

    /// Read by a compute shader
    pub const fn compute_shader_read() -> Self {
        Self::new(vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_READ)
    }

    /// Written by a compute shader
    pub const fn compute_shader_write() -> Self {
        Self::new(vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_WRITE)
    }

    /// Read by a fragment shader
    pub const fn fragment_shader_read() -> Self {
        Self::new(vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ)
    }

    /// Written by the host through a mapping
    pub const fn host_write() -> Self {
        Self::new(vk::PipelineStageFlags::HOST, vk::AccessFlags::HOST_WRITE)
    }

    /// Handed to the presentation engine
    pub const fn present() -> Self {
        Self::new(vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty())
    }

    /// Full pipeline flush, for debugging synchronization issues
    pub const fn all() -> Self {
        Self::new(
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::from_raw(vk::AccessFlags::MEMORY_READ.as_raw() | vk::AccessFlags::MEMORY_WRITE.as_raw()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_presets() {
        assert_eq!(Access::transfer_write().access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(Access::none().stages, vk::PipelineStageFlags::empty());
        assert!(Access::all().access.contains(vk::AccessFlags::MEMORY_WRITE));
        assert!(Access::all().access.contains(vk::AccessFlags::MEMORY_READ));
    }
}
