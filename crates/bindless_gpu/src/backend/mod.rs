//! Backend abstraction for the native graphics API
//!
//! The core never calls the driver directly. Every native operation it needs
//! goes through [`DeviceBackend`], which has two implementations:
//!
//! - [`vulkan::VulkanBackend`]: the real driver, through `ash`
//! - [`headless::HeadlessBackend`]: an in-memory GPU simulation used by tests
//!   and by tools that need the bookkeeping without a display
//!
//! Native handles are plain `ash::vk` handle types in both cases, so the core
//! is written once against Vulkan semantics.

pub mod headless;
pub mod vulkan;

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle as _;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::command::Command;
use crate::resource::{BufferInfo, ImageInfo};

pub use headless::{HeadlessBackend, HeadlessFaults};
pub use vulkan::VulkanBackend;

/// Kind of semaphore to create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreKind {
    /// Single-use GPU-side signal
    Binary,
    /// Monotonic counter readable from the CPU
    Timeline {
        /// Counter value at creation
        initial_value: u64,
    },
}

/// Presentation capabilities of a surface on this device
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    /// Whether the device's queue can present to the surface
    pub present_supported: bool,
    /// Surface capabilities (extent limits, image counts, usage)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Fully resolved parameters for a native swapchain
#[derive(Debug, Clone, Copy)]
pub struct NativeSwapchainInfo {
    /// Target surface
    pub surface: vk::SurfaceKHR,
    /// Requested image count
    pub min_image_count: u32,
    /// Image format and color space
    pub format: vk::SurfaceFormatKHR,
    /// Image extent
    pub extent: vk::Extent2D,
    /// Image usage
    pub usage: vk::ImageUsageFlags,
    /// Present mode
    pub present_mode: vk::PresentModeKHR,
    /// Surface transform
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Swapchain being replaced, or null
    pub old_swapchain: vk::SwapchainKHR,
}

/// An image together with the memory bound to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeImage {
    /// Image handle
    pub image: vk::Image,
    /// Backing memory
    pub memory: vk::DeviceMemory,
}

/// A buffer together with the memory bound to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBuffer {
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Backing memory
    pub memory: vk::DeviceMemory,
}

/// Fully resolved parameters for an image view
#[derive(Debug, Clone, Copy)]
pub struct NativeImageViewInfo {
    /// Viewed image
    pub image: vk::Image,
    /// View type
    pub view_type: vk::ImageViewType,
    /// View format
    pub format: vk::Format,
    /// Viewed subresources
    pub range: vk::ImageSubresourceRange,
}

/// A descriptor write into the global bindless table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindlessWrite {
    /// Publish an image view at `index`
    ImageView {
        /// Bindless index
        index: u32,
        /// View handle
        view: vk::ImageView,
        /// Whether the image allows storage access
        storage: bool,
        /// Whether the image allows sampled access
        sampled: bool,
    },
    /// Publish a storage buffer at `index`
    Buffer {
        /// Bindless index
        index: u32,
        /// Buffer handle
        buffer: vk::Buffer,
        /// Buffer size in bytes
        size: vk::DeviceSize,
    },
}

/// Any native object the core may destroy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeObject {
    /// Image and its memory
    Image(NativeImage),
    /// Image view
    ImageView(vk::ImageView),
    /// Buffer and its memory
    Buffer(NativeBuffer),
    /// Binary or timeline semaphore
    Semaphore(vk::Semaphore),
    /// Fence
    Fence(vk::Fence),
    /// Swapchain (its images are owned by it)
    Swapchain(vk::SwapchainKHR),
    /// Presentation surface
    Surface(vk::SurfaceKHR),
}

impl NativeObject {
    /// Raw 64-bit handle value of the primary object
    pub fn raw(&self) -> u64 {
        match self {
            Self::Image(image) => image.image.as_raw(),
            Self::ImageView(view) => view.as_raw(),
            Self::Buffer(buffer) => buffer.buffer.as_raw(),
            Self::Semaphore(semaphore) => semaphore.as_raw(),
            Self::Fence(fence) => fence.as_raw(),
            Self::Swapchain(swapchain) => swapchain.as_raw(),
            Self::Surface(surface) => surface.as_raw(),
        }
    }

    /// Vulkan object type of the primary object
    pub const fn object_type(&self) -> vk::ObjectType {
        match self {
            Self::Image(_) => vk::ObjectType::IMAGE,
            Self::ImageView(_) => vk::ObjectType::IMAGE_VIEW,
            Self::Buffer(_) => vk::ObjectType::BUFFER,
            Self::Semaphore(_) => vk::ObjectType::SEMAPHORE,
            Self::Fence(_) => vk::ObjectType::FENCE,
            Self::Swapchain(_) => vk::ObjectType::SWAPCHAIN_KHR,
            Self::Surface(_) => vk::ObjectType::SURFACE_KHR,
        }
    }
}

/// One queue submission, already resolved to native handles
#[derive(Debug, Clone, Copy)]
pub struct NativeSubmit<'a> {
    /// Command buffers in execution order
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Binary semaphores to wait on, with the stage that waits
    pub wait_semaphores: &'a [(vk::Semaphore, vk::PipelineStageFlags)],
    /// Binary semaphores to signal
    pub signal_semaphores: &'a [vk::Semaphore],
    /// Device timeline semaphore
    pub timeline: vk::Semaphore,
    /// Value the timeline is signaled to on completion
    pub timeline_value: u64,
}

/// Native device operations used by the core
///
/// Implementations must be callable from any thread. The core serializes
/// queue submission itself; backends only need to protect their own pools.
pub trait DeviceBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Create a presentation surface for a native window
    fn create_surface(&self, display: RawDisplayHandle, window: RawWindowHandle) -> VkResult<vk::SurfaceKHR>;

    /// Query how the device can present to a surface
    fn surface_support(&self, surface: vk::SurfaceKHR) -> VkResult<SurfaceSupport>;

    /// Create a native swapchain
    fn create_swapchain(&self, info: &NativeSwapchainInfo) -> VkResult<vk::SwapchainKHR>;

    /// Images owned by a swapchain, in native index order
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;

    /// Acquire the next presentable image, signaling `fence` when it is ready.
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> VkResult<(u32, bool)>;

    /// Queue a present of `image_index` after `wait_semaphores`.
    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool>;

    /// Create an unsignaled fence
    fn create_fence(&self) -> VkResult<vk::Fence>;

    /// Wait for a fence, then reset it to unsignaled
    fn wait_and_reset_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;

    /// Create a semaphore
    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore>;

    /// Current counter value of a timeline semaphore
    fn timeline_value(&self, semaphore: vk::Semaphore) -> VkResult<u64>;

    /// Block until a timeline semaphore reaches `value`.
    /// Returns `false` when the timeout expired first.
    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> VkResult<bool>;

    /// Create an image with device-local memory
    fn create_image(&self, info: &ImageInfo) -> VkResult<NativeImage>;

    /// Create an image view
    fn create_image_view(&self, info: &NativeImageViewInfo) -> VkResult<vk::ImageView>;

    /// Create a buffer with memory bound
    fn create_buffer(&self, info: &BufferInfo) -> VkResult<NativeBuffer>;

    /// Publish a resource in the global bindless table
    fn write_bindless(&self, write: BindlessWrite);

    /// Destroy a native object immediately
    fn destroy(&self, object: NativeObject);

    /// Attach a debug name to a native object
    fn set_debug_name(&self, object_type: vk::ObjectType, raw_handle: u64, name: &str);

    /// Allocate a primary command buffer and begin recording
    fn begin_command_buffer(&self) -> VkResult<vk::CommandBuffer>;

    /// Record one command into a command buffer in the recording state
    fn encode(&self, command_buffer: vk::CommandBuffer, command: &Command);

    /// End recording
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// Return a command buffer that is not pending execution
    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer);

    /// Submit one batch to the queue
    fn queue_submit(&self, submit: &NativeSubmit<'_>) -> VkResult<()>;

    /// Wait until the device has no pending work
    fn wait_idle(&self) -> VkResult<()>;
}
