//! Swapchain management
//!
//! A [`Swapchain`] owns a surface, the native swapchain, one registered
//! image and view per presentable image, and the fence the native acquire
//! signals. Its state machine is:
//!
//! ```text
//!          acquire_next_image             present_frame
//!  Ready ---------------------> Acquired(i) -------------> Ready
//!    ^                              |
//!    +------------ resize ----------+
//!
//!  any state --surface lost--> Lost (permanent)
//! ```
//!
//! Extent and image set change only in [`Swapchain::resize`]. Replaced
//! images, views and native swapchains are not destroyed in place; they go
//! through the device's deferred destruction behind the current timeline
//! value, like any other resource.

use ash::vk;
use std::fmt;

use crate::backend::{NativeObject, NativeSwapchainInfo, SurfaceSupport};
use crate::device::Device;
use crate::error::{GpuError, GpuResult};
use crate::resource::{ImageId, ImageInfo, ImageViewId, ImageViewInfo};
use crate::sync::BinarySemaphore;

/// Default surface format score: 8-bit sRGB first, 8-bit UNORM next,
/// anything else as a last resort
pub fn default_format_score(format: vk::Format) -> i32 {
    match format {
        vk::Format::B8G8R8A8_SRGB => 100,
        vk::Format::R8G8B8A8_SRGB => 90,
        vk::Format::B8G8R8A8_UNORM => 50,
        vk::Format::R8G8B8A8_UNORM => 40,
        _ => 1,
    }
}

/// Swapchain creation parameters
#[derive(Debug, Clone)]
pub struct SwapchainInfo {
    /// Target surface; ownership passes to the swapchain on success
    pub surface: vk::SurfaceKHR,
    /// Requested width
    pub width: u32,
    /// Requested height
    pub height: u32,
    /// Requested present mode; falls back to FIFO when unsupported
    pub present_mode: vk::PresentModeKHR,
    /// Usage on top of `COLOR_ATTACHMENT`
    pub additional_image_usage: vk::ImageUsageFlags,
    /// Scores surface formats; the highest positive score wins
    pub format_selector: fn(vk::Format) -> i32,
    /// Debug name
    pub name: String,
}

impl SwapchainInfo {
    /// FIFO swapchain with the default format preference
    pub fn new(surface: vk::SurfaceKHR, width: u32, height: u32) -> Self {
        Self {
            surface,
            width,
            height,
            present_mode: vk::PresentModeKHR::FIFO,
            additional_image_usage: vk::ImageUsageFlags::empty(),
            format_selector: default_format_score,
            name: String::new(),
        }
    }

    /// Set the present mode
    pub fn with_present_mode(mut self, present_mode: vk::PresentModeKHR) -> Self {
        self.present_mode = present_mode;
        self
    }

    /// Add image usage flags
    pub fn with_additional_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.additional_image_usage = usage;
        self
    }

    /// Set the format scoring function
    pub fn with_format_selector(mut self, selector: fn(vk::Format) -> i32) -> Self {
        self.format_selector = selector;
        self
    }

    /// Set the debug name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Acquisition state of a swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    /// No image outstanding
    Ready,
    /// The driver handed out image `index` but its acquire fence has not
    /// signaled yet; the next acquire finishes waiting for it
    AcquirePending(u32),
    /// Image `index` has been acquired and not yet presented
    Acquired(u32),
    /// The surface is gone; only dropping the swapchain remains
    Lost,
}

/// An acquired presentable image
///
/// Move-only: presenting consumes it. It becomes stale when its swapchain
/// is resized.
#[derive(Debug)]
pub struct SwapchainImage {
    image: ImageId,
    view: ImageViewId,
    index: u32,
    swapchain_id: u64,
    generation: u64,
}

impl SwapchainImage {
    /// Registry handle of the image
    pub const fn image(&self) -> ImageId {
        self.image
    }

    /// Registry handle of the full view
    pub const fn view(&self) -> ImageViewId {
        self.view
    }

    /// Native image index within the swapchain
    pub const fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug, Clone, Copy)]
struct PresentableImage {
    image: ImageId,
    view: ImageViewId,
}

struct NativeSet {
    native: vk::SwapchainKHR,
    images: Vec<PresentableImage>,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

fn surface_error(result: vk::Result) -> GpuError {
    match result {
        vk::Result::ERROR_SURFACE_LOST_KHR => GpuError::SurfaceLost,
        vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
        other => GpuError::SurfaceCreation {
            reason: format!("{other:?}"),
        },
    }
}

fn resolve_extent(capabilities: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width == u32::MAX {
        vk::Extent2D {
            width: requested
                .width
                .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
            height: requested
                .height
                .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
        }
    } else {
        capabilities.current_extent
    }
}

fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// Presentable image set bound to one surface
pub struct Swapchain {
    device: Device,
    id: u64,
    generation: u64,
    surface: vk::SurfaceKHR,
    native: vk::SwapchainKHR,
    images: Vec<PresentableImage>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    requested_present_mode: vk::PresentModeKHR,
    usage: vk::ImageUsageFlags,
    acquire_fence: vk::Fence,
    state: SwapchainState,
    name: String,
}

impl Swapchain {
    /// Only [`Device::create_swapchain`] builds swapchains
    pub(crate) fn new(device: &Device, info: SwapchainInfo) -> GpuResult<Self> {
        let support = Self::query_support(device, info.surface)?;
        if !support.present_supported {
            return Err(GpuError::SurfaceCreation {
                reason: "the device queue cannot present to this surface".to_string(),
            });
        }

        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | info.additional_image_usage;
        if !support.capabilities.supported_usage_flags.contains(usage) {
            return Err(GpuError::SurfaceCreation {
                reason: format!("image usage {usage:?} is not supported by the surface"),
            });
        }

        let selector = info.format_selector;
        let format = support
            .formats
            .iter()
            .map(|format| (selector(format.format), *format))
            .filter(|(score, _)| *score > 0)
            .max_by_key(|(score, _)| *score)
            .map(|(_, format)| format)
            .ok_or(GpuError::FormatUnavailable)?;

        let acquire_fence = device.backend().create_fence().map_err(GpuError::from_vk)?;

        let set = match Self::build_native_set(
            device,
            &support,
            info.surface,
            vk::Extent2D {
                width: info.width,
                height: info.height,
            },
            format,
            info.present_mode,
            usage,
            vk::SwapchainKHR::null(),
            &info.name,
        ) {
            Ok(set) => set,
            Err(error) => {
                device.backend().destroy(NativeObject::Fence(acquire_fence));
                return Err(error);
            }
        };

        log::info!(
            "Created swapchain '{}' {}x{} {:?} {:?} with {} images",
            info.name,
            set.extent.width,
            set.extent.height,
            format.format,
            set.present_mode,
            set.images.len()
        );

        Ok(Self {
            device: device.clone(),
            id: device.next_swapchain_id(),
            generation: 0,
            surface: info.surface,
            native: set.native,
            images: set.images,
            format,
            extent: set.extent,
            present_mode: set.present_mode,
            requested_present_mode: info.present_mode,
            usage,
            acquire_fence,
            state: SwapchainState::Ready,
            name: info.name,
        })
    }

    fn query_support(device: &Device, surface: vk::SurfaceKHR) -> GpuResult<SurfaceSupport> {
        device.backend().surface_support(surface).map_err(surface_error)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_native_set(
        device: &Device,
        support: &SurfaceSupport,
        surface: vk::SurfaceKHR,
        requested_extent: vk::Extent2D,
        format: vk::SurfaceFormatKHR,
        requested_present_mode: vk::PresentModeKHR,
        usage: vk::ImageUsageFlags,
        old_swapchain: vk::SwapchainKHR,
        name: &str,
    ) -> GpuResult<NativeSet> {
        let capabilities = &support.capabilities;
        let extent = resolve_extent(capabilities, requested_extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::InvalidExtent {
                width: extent.width,
                height: extent.height,
            });
        }

        let present_mode = if support.present_modes.contains(&requested_present_mode) {
            requested_present_mode
        } else {
            log::warn!(
                "Present mode {:?} not supported by the surface, falling back to FIFO",
                requested_present_mode
            );
            vk::PresentModeKHR::FIFO
        };

        let backend = device.backend();
        let native = backend
            .create_swapchain(&NativeSwapchainInfo {
                surface,
                min_image_count: image_count(capabilities),
                format,
                extent,
                usage,
                present_mode,
                pre_transform: capabilities.current_transform,
                old_swapchain,
            })
            .map_err(surface_error)?;
        if !name.is_empty() {
            backend.set_debug_name(vk::ObjectType::SWAPCHAIN_KHR, vk::Handle::as_raw(native), name);
        }

        let native_images = match backend.swapchain_images(native) {
            Ok(images) => images,
            Err(result) => {
                backend.destroy(NativeObject::Swapchain(native));
                return Err(surface_error(result));
            }
        };

        let mut images = Vec::with_capacity(native_images.len());
        for (index, native_image) in native_images.into_iter().enumerate() {
            match Self::register_image(device, native_image, format.format, extent, usage, name, index) {
                Ok(image) => images.push(image),
                Err(error) => {
                    Self::retire_images(device, &images);
                    device.defer_destruction(NativeObject::Swapchain(native));
                    return Err(error);
                }
            }
        }

        Ok(NativeSet {
            native,
            images,
            extent,
            present_mode,
        })
    }

    fn register_image(
        device: &Device,
        native_image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        name: &str,
        index: usize,
    ) -> GpuResult<PresentableImage> {
        let image = device.register_external_image(
            native_image,
            ImageInfo {
                format,
                extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
                mip_level_count: 1,
                array_layer_count: 1,
                usage,
                name: format!("{name} image {index}"),
            },
        )?;
        let view_info = ImageViewInfo::new(image).with_name(format!("{name} view {index}"));
        let view = match device.create_image_view(&view_info) {
            Ok(view) => view,
            Err(error) => {
                let _ = device.destroy_image(image);
                return Err(error);
            }
        };
        Ok(PresentableImage { image, view })
    }

    fn retire_images(device: &Device, images: &[PresentableImage]) {
        for image in images {
            if let Err(error) = device.destroy_image_view(image.view) {
                log::warn!("Swapchain view already destroyed: {}", error);
            }
            if let Err(error) = device.destroy_image(image.image) {
                log::warn!("Swapchain image already destroyed: {}", error);
            }
        }
    }

    /// Acquire the next presentable image
    ///
    /// Blocks until the native acquire has signaled the internal fence,
    /// bounded by the configured acquire timeout. Fails with
    /// [`GpuError::AcquireOutOfOrder`] if an image is already outstanding, in
    /// which case nothing changes.
    ///
    /// If the fence wait fails after the driver picked an image, the image
    /// stays pending and the next call waits for that same image instead of
    /// acquiring another one.
    pub fn acquire_next_image(&mut self) -> GpuResult<SwapchainImage> {
        match self.state {
            SwapchainState::Lost => return Err(GpuError::SurfaceLost),
            SwapchainState::Acquired(index) => return Err(GpuError::AcquireOutOfOrder { index }),
            SwapchainState::AcquirePending(index) => return self.finish_acquire(index),
            SwapchainState::Ready => {}
        }

        let timeout_ns = self.device.config().acquire_timeout_ns();
        let acquired = self
            .device
            .backend()
            .acquire_next_image(self.native, self.acquire_fence, timeout_ns);
        let (index, suboptimal) = match acquired {
            Ok(acquired) => acquired,
            Err(result) => return Err(self.acquire_error(result)),
        };
        if suboptimal {
            log::debug!("Swapchain '{}' is suboptimal for its surface", self.name);
        }
        self.state = SwapchainState::AcquirePending(index);
        self.finish_acquire(index)
    }

    fn wait_acquire_fence(&self, index: u32) -> GpuResult<()> {
        let timeout_ns = self.device.config().acquire_timeout_ns();
        self.device
            .backend()
            .wait_and_reset_fence(self.acquire_fence, timeout_ns)
            .map_err(|result| match result {
                vk::Result::TIMEOUT => {
                    log::warn!("Swapchain '{}' timed out waiting for image {}", self.name, index);
                    GpuError::AcquireTimeout { index }
                }
                other => GpuError::from_vk(other),
            })
    }

    fn finish_acquire(&mut self, index: u32) -> GpuResult<SwapchainImage> {
        self.wait_acquire_fence(index)?;

        let Some(image) = self.images.get(index as usize).copied() else {
            self.state = SwapchainState::Ready;
            return Err(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN));
        };
        self.state = SwapchainState::Acquired(index);

        Ok(SwapchainImage {
            image: image.image,
            view: image.view,
            index,
            swapchain_id: self.id,
            generation: self.generation,
        })
    }

    fn acquire_error(&mut self, result: vk::Result) -> GpuError {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => {
                log::warn!("Swapchain '{}' out of date during acquire", self.name);
                GpuError::SwapchainOutOfDate
            }
            vk::Result::ERROR_SURFACE_LOST_KHR => {
                self.state = SwapchainState::Lost;
                GpuError::SurfaceLost
            }
            other => GpuError::from_vk(other),
        }
    }

    pub(crate) fn present(&mut self, image: SwapchainImage, wait_semaphores: &[&BinarySemaphore]) -> GpuResult<()> {
        let current = image.swapchain_id == self.id
            && image.generation == self.generation
            && self.state == SwapchainState::Acquired(image.index);
        if !current {
            return Err(GpuError::StaleSwapchainImage { index: image.index });
        }

        let waits: Vec<vk::Semaphore> = wait_semaphores.iter().map(|semaphore| semaphore.raw()).collect();
        let result = self.device.backend().queue_present(self.native, image.index, &waits);
        // The presentation engine owns the image again whatever the outcome
        self.state = SwapchainState::Ready;

        match result {
            Ok(suboptimal) => {
                if suboptimal {
                    log::debug!("Swapchain '{}' presented suboptimally", self.name);
                }
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain '{}' out of date during present", self.name);
                Err(GpuError::SwapchainOutOfDate)
            }
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                self.state = SwapchainState::Lost;
                Err(GpuError::PresentationLost(vk::Result::ERROR_SURFACE_LOST_KHR))
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(GpuError::DeviceLost),
            Err(other) => Err(GpuError::PresentationLost(other)),
        }
    }

    /// Recreate the image set at a new extent
    ///
    /// Format and usage are kept; a present mode set with
    /// [`set_present_mode`](Self::set_present_mode) takes effect here. The
    /// caller must have waited for GPU work that uses the old images. On any
    /// failure the previous swapchain stays intact.
    pub fn resize(&mut self, extent: vk::Extent2D) -> GpuResult<()> {
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::InvalidExtent {
                width: extent.width,
                height: extent.height,
            });
        }
        match self.state {
            SwapchainState::Lost => return Err(GpuError::SurfaceLost),
            // The fence must be idle before the next acquire reuses it
            SwapchainState::AcquirePending(index) => self.wait_acquire_fence(index)?,
            SwapchainState::Ready | SwapchainState::Acquired(_) => {}
        }

        let built = Self::query_support(&self.device, self.surface).and_then(|support| {
            Self::build_native_set(
                &self.device,
                &support,
                self.surface,
                extent,
                self.format,
                self.requested_present_mode,
                self.usage,
                self.native,
                &self.name,
            )
        });
        let set = match built {
            Ok(set) => set,
            Err(error) => {
                if matches!(error, GpuError::SurfaceLost) {
                    self.state = SwapchainState::Lost;
                }
                return Err(GpuError::SwapchainRecreate {
                    source: Box::new(error),
                });
            }
        };

        Self::retire_images(&self.device, &self.images);
        self.device.defer_destruction(NativeObject::Swapchain(self.native));

        self.native = set.native;
        self.images = set.images;
        self.extent = set.extent;
        self.present_mode = set.present_mode;
        self.generation += 1;
        self.state = SwapchainState::Ready;

        log::info!(
            "Resized swapchain '{}' to {}x{}",
            self.name,
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    /// Request a present mode for the next recreation
    pub fn set_present_mode(&mut self, present_mode: vk::PresentModeKHR) {
        self.requested_present_mode = present_mode;
    }

    /// Current image extent
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Image format
    pub const fn format(&self) -> vk::Format {
        self.format.format
    }

    /// Image format and color space
    pub const fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Present mode in effect
    pub const fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Present mode that the next recreation will use
    pub const fn requested_present_mode(&self) -> vk::PresentModeKHR {
        self.requested_present_mode
    }

    /// Image usage
    pub const fn image_usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    /// Number of presentable images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Registry handles of every presentable image, in native index order
    pub fn images(&self) -> Vec<ImageId> {
        self.images.iter().map(|image| image.image).collect()
    }

    /// Acquisition state
    pub const fn state(&self) -> SwapchainState {
        self.state
    }

    /// Whether the surface has been lost
    pub fn is_lost(&self) -> bool {
        self.state == SwapchainState::Lost
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swapchain")
            .field("name", &self.name)
            .field("extent", &self.extent)
            .field("format", &self.format.format)
            .field("present_mode", &self.present_mode)
            .field("images", &self.images.len())
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain '{}'", self.name);
        Self::retire_images(&self.device, &self.images);
        self.device.defer_destruction(NativeObject::Swapchain(self.native));
        self.device.defer_destruction(NativeObject::Surface(self.surface));
        if let SwapchainState::AcquirePending(index) = self.state {
            if let Err(error) = self.wait_acquire_fence(index) {
                log::warn!("Destroying swapchain '{}' with a pending acquire: {}", self.name, error);
            }
        }
        self.device.backend().destroy(NativeObject::Fence(self.acquire_fence));
    }
}
