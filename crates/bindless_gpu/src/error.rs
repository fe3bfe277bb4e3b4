//! Error taxonomy for the GPU core
//!
//! Errors fall into four groups:
//!
//! - **Creation errors**: the surface, format or resource requested is not
//!   supported. Fatal to that object; the caller may retry with other parameters.
//! - **Acquisition/presentation errors**: [`GpuError::SwapchainOutOfDate`] is
//!   recovered by resizing and retrying. [`GpuError::SurfaceLost`],
//!   [`GpuError::PresentationLost`] and [`GpuError::DeviceLost`] require the
//!   swapchain or device to be rebuilt.
//! - **Usage errors**: the caller broke a contract (recording after finalize,
//!   acquiring twice, presenting a stale image). Returned immediately and the
//!   object's state is left untouched.
//! - **Backend errors**: any other driver result code.

use ash::vk;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors produced by the GPU core
#[derive(Error, Debug)]
pub enum GpuError {
    /// The surface cannot be used with this device
    #[error("Surface creation failed: {reason}")]
    SurfaceCreation {
        /// Why the surface was rejected
        reason: String,
    },

    /// None of the surface formats passed the format selector
    #[error("No acceptable image format available for the surface")]
    FormatUnavailable,

    /// `acquire_next_image` was called again before present or resize
    #[error("Swapchain image {index} is already acquired; present or resize before acquiring again")]
    AcquireOutOfOrder {
        /// Index of the image that is still outstanding
        index: u32,
    },

    /// The swapchain could not be recreated at the requested extent
    #[error("Swapchain recreation failed: {source}")]
    SwapchainRecreate {
        /// The underlying creation error
        #[source]
        source: Box<GpuError>,
    },

    /// A zero-area extent was requested
    #[error("Invalid swapchain extent {width}x{height}")]
    InvalidExtent {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
    },

    /// The presentation surface is gone; the swapchain is permanently unusable
    #[error("Presentation surface lost")]
    SurfaceLost,

    /// A mutating call was made on a recorder that has already been finalized
    #[error("Command recorder '{name}' is already finalized")]
    RecorderFinalized {
        /// Debug name of the recorder
        name: String,
    },

    /// Native resource creation failed
    #[error("Failed to create {kind} '{name}': {reason}")]
    ResourceCreation {
        /// Resource kind ("image", "buffer", ...)
        kind: &'static str,
        /// Debug name of the resource
        name: String,
        /// Driver result or table exhaustion description
        reason: String,
    },

    /// Queue submission failed; nothing from the batch is in flight
    #[error("Queue submission failed: {0:?}")]
    Submission(vk::Result),

    /// The swapchain no longer matches the surface; resize and retry
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    /// Presentation failed permanently
    #[error("Presentation lost: {0:?}")]
    PresentationLost(vk::Result),

    /// The device was lost; the whole device must be rebuilt
    #[error("Device lost")]
    DeviceLost,

    /// A handle does not name a live resource of the expected kind
    #[error("Invalid or destroyed {kind} handle")]
    InvalidHandle {
        /// Resource kind ("image", "image view", "buffer")
        kind: &'static str,
    },

    /// A mip level outside the image's level range
    #[error("Mip level {mip_level} is out of range for an image with {mip_level_count} levels")]
    InvalidSubresource {
        /// Requested level
        mip_level: u32,
        /// Levels the image was created with
        mip_level_count: u32,
    },

    /// The driver picked an image but its acquire fence did not signal in time
    #[error("Timed out waiting for swapchain image {index}")]
    AcquireTimeout {
        /// Native index of the pending image
        index: u32,
    },

    /// A swapchain image was presented after its swapchain was resized or presented
    #[error("Swapchain image {index} is stale")]
    StaleSwapchainImage {
        /// Native index of the stale image
        index: u32,
    },

    /// A command list was submitted again while its previous submission is still in flight
    #[error("Command list '{name}' is still in flight (timeline value {timeline_value})")]
    CommandListInFlight {
        /// Debug name of the list
        name: String,
        /// Timeline value of the pending submission
        timeline_value: u64,
    },

    /// An explicit timeline signal value did not advance the timeline
    #[error("Timeline value {requested} does not exceed highest issued value {highest}")]
    TimelineNotMonotonic {
        /// Value the caller asked to signal
        requested: u64,
        /// Highest value already issued
        highest: u64,
    },

    /// A bounded wait on the GPU timeline expired
    #[error("Timed out waiting for timeline value {value}")]
    Timeout {
        /// Timeline value that was not reached
        value: u64,
    },

    /// Any other Vulkan error code
    #[error("Vulkan API error: {0:?}")]
    Vulkan(vk::Result),

    /// Backend initialization failed
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// Configuration loading or validation failed
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl GpuError {
    /// Map a raw driver result, keeping device loss distinct from other codes
    pub fn from_vk(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Vulkan(other),
        }
    }

    /// Caller contract violations
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::AcquireOutOfOrder { .. }
                | Self::RecorderFinalized { .. }
                | Self::InvalidHandle { .. }
                | Self::InvalidSubresource { .. }
                | Self::StaleSwapchainImage { .. }
                | Self::CommandListInFlight { .. }
                | Self::TimelineNotMonotonic { .. }
                | Self::InvalidExtent { .. }
        )
    }

    /// Errors the caller can recover from without rebuilding the device or swapchain
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SwapchainOutOfDate
                | Self::SwapchainRecreate { .. }
                | Self::FormatUnavailable
                | Self::ResourceCreation { .. }
                | Self::Submission(_)
                | Self::Timeout { .. }
                | Self::AcquireTimeout { .. }
        )
    }
}

/// Result type for GPU core operations
pub type GpuResult<T> = Result<T, GpuError>;
