//! Headless backend
//!
//! A GPU simulation with no driver behind it. Handles are fabricated,
//! command buffers keep the [`Command`]s encoded into them, and a timeline
//! semaphore only advances when told to:
//!
//! - [`HeadlessBackend::complete_up_to`] / [`HeadlessBackend::complete_all`]
//!   from the test
//! - a CPU wait on the timeline, which completes just enough work to satisfy
//!   it unless the GPU is [stalled](HeadlessBackend::set_stalled)
//!
//! Every submission, present and destruction is recorded for inspection,
//! and [`HeadlessFaults`] injects driver failures.

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle as _;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    BindlessWrite, DeviceBackend, NativeBuffer, NativeImage, NativeImageViewInfo, NativeObject, NativeSubmit,
    NativeSwapchainInfo, SemaphoreKind, SurfaceSupport,
};
use crate::command::Command;
use crate::device::lock;
use crate::resource::{BufferInfo, ImageInfo};

bitflags::bitflags! {
    /// Driver failures the headless backend reports until cleared
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeadlessFaults: u32 {
        /// Surface queries, swapchain creation, acquire and present fail with `ERROR_SURFACE_LOST_KHR`
        const SURFACE_LOST = 1 << 0;
        /// Acquire and present fail with `ERROR_OUT_OF_DATE_KHR`; cleared by swapchain creation
        const OUT_OF_DATE = 1 << 1;
        /// Queue and timeline operations fail with `ERROR_DEVICE_LOST`
        const DEVICE_LOST = 1 << 2;
        /// Resource creation and submission fail with `ERROR_OUT_OF_DEVICE_MEMORY`
        const OUT_OF_MEMORY = 1 << 3;
        /// The queue reports it cannot present to any surface
        const UNSUPPORTED_SURFACE = 1 << 4;
        /// Surfaces report no formats
        const NO_FORMATS = 1 << 5;
        /// Acquire hands out an image but its fence stays pending, so fence
        /// waits time out; the signal lands on the first wait after clearing
        const FENCE_TIMEOUT = 1 << 6;
    }
}

/// A recorded queue submission
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    /// Timeline value signaled on completion
    pub timeline_value: u64,
    /// Submitted command buffers
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Commands of each command buffer, in submission order
    pub commands: Vec<Vec<Command>>,
    /// Binary semaphores waited on
    pub wait_semaphores: Vec<vk::Semaphore>,
    /// Binary semaphores signaled
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// A recorded present
#[derive(Debug, Clone)]
pub struct PresentRecord {
    /// Presenting swapchain
    pub swapchain: vk::SwapchainKHR,
    /// Presented image index
    pub image_index: u32,
    /// Binary semaphores waited on
    pub wait_semaphores: Vec<vk::Semaphore>,
}

/// A recorded destruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestructionRecord {
    /// Destroyed object
    pub object: NativeObject,
    /// Completed value of the first timeline semaphore at destruction time
    pub completed_value: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timeline {
    completed: u64,
    pending: u64,
}

#[derive(Debug)]
struct SimulatedSwapchain {
    images: Vec<vk::Image>,
    next_image: usize,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    /// A signal operation has been queued but not delivered
    Pending,
    Signaled,
}

#[derive(Debug)]
struct HeadlessState {
    next_handle: u64,
    faults: HeadlessFaults,
    stalled: bool,
    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    live: HashMap<u64, vk::ObjectType>,
    timelines: HashMap<u64, Timeline>,
    device_timeline: Option<vk::Semaphore>,
    fences: HashMap<u64, FenceState>,
    swapchains: HashMap<u64, SimulatedSwapchain>,
    recording: HashMap<u64, Vec<Command>>,
    executable: HashMap<u64, Vec<Command>>,
    submissions: Vec<SubmissionRecord>,
    presents: Vec<PresentRecord>,
    destroyed: Vec<DestructionRecord>,
    bindless_writes: Vec<BindlessWrite>,
    debug_names: HashMap<u64, String>,
}

impl HeadlessState {
    fn allocate<H: vk::Handle>(&mut self, object_type: vk::ObjectType) -> H {
        self.next_handle += 1;
        self.live.insert(self.next_handle, object_type);
        H::from_raw(self.next_handle)
    }

    fn check(&self, fault: HeadlessFaults, result: vk::Result) -> VkResult<()> {
        if self.faults.contains(fault) {
            Err(result)
        } else {
            Ok(())
        }
    }

    fn device_completed(&self) -> u64 {
        self.device_timeline
            .and_then(|timeline| self.timelines.get(&timeline.as_raw()))
            .map_or(0, |timeline| timeline.completed)
    }

    fn complete(&mut self, value: u64) {
        for timeline in self.timelines.values_mut() {
            timeline.completed = timeline.completed.max(value.min(timeline.pending));
        }
    }
}

/// In-memory GPU simulation
#[derive(Debug)]
pub struct HeadlessBackend {
    state: Mutex<HeadlessState>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// Simulated GPU with a flexible 2 to 8 image surface
    pub fn new() -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 16384,
                height: 16384,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::STORAGE,
        };

        Self {
            state: Mutex::new(HeadlessState {
                next_handle: 0x1000,
                faults: HeadlessFaults::empty(),
                stalled: false,
                capabilities,
                formats: vec![
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_SRGB,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                ],
                present_modes: vec![
                    vk::PresentModeKHR::FIFO,
                    vk::PresentModeKHR::MAILBOX,
                    vk::PresentModeKHR::IMMEDIATE,
                ],
                live: HashMap::new(),
                timelines: HashMap::new(),
                device_timeline: None,
                fences: HashMap::new(),
                swapchains: HashMap::new(),
                recording: HashMap::new(),
                executable: HashMap::new(),
                submissions: Vec::new(),
                presents: Vec::new(),
                destroyed: Vec::new(),
                bindless_writes: Vec::new(),
                debug_names: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HeadlessState> {
        lock(&self.state)
    }

    // ---- Simulation control ----

    /// Complete all work up to `value` on every timeline
    pub fn complete_up_to(&self, value: u64) {
        self.state().complete(value);
    }

    /// Complete all submitted work
    pub fn complete_all(&self) {
        self.state().complete(u64::MAX);
    }

    /// When stalled, CPU waits time out instead of completing work
    pub fn set_stalled(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// Add persistent faults
    pub fn inject_faults(&self, faults: HeadlessFaults) {
        self.state().faults |= faults;
    }

    /// Remove faults
    pub fn clear_faults(&self, faults: HeadlessFaults) {
        self.state().faults.remove(faults);
    }

    /// Pin the surface extent, or `None` to follow the requested extent
    pub fn set_current_extent(&self, extent: Option<vk::Extent2D>) {
        self.state().capabilities.current_extent = extent.unwrap_or(vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        });
    }

    /// Surface extent limits
    pub fn set_extent_limits(&self, min: vk::Extent2D, max: vk::Extent2D) {
        let mut state = self.state();
        state.capabilities.min_image_extent = min;
        state.capabilities.max_image_extent = max;
    }

    /// Surface formats reported to swapchains
    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state().formats = formats;
    }

    /// Present modes reported to swapchains
    pub fn set_present_modes(&self, present_modes: Vec<vk::PresentModeKHR>) {
        self.state().present_modes = present_modes;
    }

    /// Fabricate a surface without a window
    pub fn create_test_surface(&self) -> vk::SurfaceKHR {
        self.state().allocate(vk::ObjectType::SURFACE_KHR)
    }

    // ---- Inspection ----

    /// Completed value of the first timeline semaphore
    pub fn completed_value(&self) -> u64 {
        self.state().device_completed()
    }

    /// Every submission so far
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state().submissions.clone()
    }

    /// Every present so far
    pub fn presents(&self) -> Vec<PresentRecord> {
        self.state().presents.clone()
    }

    /// Every destruction so far
    pub fn destroyed(&self) -> Vec<DestructionRecord> {
        self.state().destroyed.clone()
    }

    /// Whether `object` has been destroyed
    pub fn was_destroyed(&self, object: NativeObject) -> bool {
        self.state().destroyed.iter().any(|record| record.object == object)
    }

    /// Every bindless descriptor write so far
    pub fn bindless_writes(&self) -> Vec<BindlessWrite> {
        self.state().bindless_writes.clone()
    }

    /// Objects created and not destroyed, command buffers excluded
    pub fn live_object_count(&self) -> usize {
        self.state().live.len()
    }

    /// Command buffers allocated and not freed
    pub fn live_command_buffer_count(&self) -> usize {
        let state = self.state();
        state.recording.len() + state.executable.len()
    }

    /// Debug name attached to a raw handle
    pub fn debug_name(&self, raw_handle: u64) -> Option<String> {
        self.state().debug_names.get(&raw_handle).cloned()
    }

    /// Extent and present mode a swapchain was created with
    pub fn swapchain_config(&self, swapchain: vk::SwapchainKHR) -> Option<(vk::Extent2D, vk::PresentModeKHR)> {
        self.state()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|simulated| (simulated.extent, simulated.present_mode))
    }
}

impl DeviceBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_surface(&self, _display: RawDisplayHandle, _window: RawWindowHandle) -> VkResult<vk::SurfaceKHR> {
        Ok(self.create_test_surface())
    }

    fn surface_support(&self, _surface: vk::SurfaceKHR) -> VkResult<SurfaceSupport> {
        let state = self.state();
        state.check(HeadlessFaults::SURFACE_LOST, vk::Result::ERROR_SURFACE_LOST_KHR)?;
        Ok(SurfaceSupport {
            present_supported: !state.faults.contains(HeadlessFaults::UNSUPPORTED_SURFACE),
            capabilities: state.capabilities,
            formats: if state.faults.contains(HeadlessFaults::NO_FORMATS) {
                Vec::new()
            } else {
                state.formats.clone()
            },
            present_modes: state.present_modes.clone(),
        })
    }

    fn create_swapchain(&self, info: &NativeSwapchainInfo) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state();
        state.check(HeadlessFaults::SURFACE_LOST, vk::Result::ERROR_SURFACE_LOST_KHR)?;
        state.faults.remove(HeadlessFaults::OUT_OF_DATE);

        let swapchain: vk::SwapchainKHR = state.allocate(vk::ObjectType::SWAPCHAIN_KHR);
        let images = (0..info.min_image_count)
            .map(|_| {
                state.next_handle += 1;
                vk::Image::from_raw(state.next_handle)
            })
            .collect();
        state.swapchains.insert(
            swapchain.as_raw(),
            SimulatedSwapchain {
                images,
                next_image: 0,
                extent: info.extent,
                present_mode: info.present_mode,
            },
        );
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.state()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|simulated| simulated.images.clone())
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        fence: vk::Fence,
        _timeout_ns: u64,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state();
        state.check(HeadlessFaults::DEVICE_LOST, vk::Result::ERROR_DEVICE_LOST)?;
        state.check(HeadlessFaults::SURFACE_LOST, vk::Result::ERROR_SURFACE_LOST_KHR)?;
        state.check(HeadlessFaults::OUT_OF_DATE, vk::Result::ERROR_OUT_OF_DATE_KHR)?;

        let simulated = state
            .swapchains
            .get_mut(&swapchain.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let index = simulated.next_image;
        simulated.next_image = (index + 1) % simulated.images.len().max(1);
        let signal = if state.faults.contains(HeadlessFaults::FENCE_TIMEOUT) {
            FenceState::Pending
        } else {
            FenceState::Signaled
        };
        match state.fences.get_mut(&fence.as_raw()) {
            Some(current) if *current == FenceState::Unsignaled => *current = signal,
            Some(current) => {
                log::error!("Acquire passed fence {:?} while it is {:?}", fence, current);
                return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
            }
            None => return Err(vk::Result::ERROR_UNKNOWN),
        }
        Ok((u32::try_from(index).unwrap_or(u32::MAX), false))
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let mut state = self.state();
        state.presents.push(PresentRecord {
            swapchain,
            image_index,
            wait_semaphores: wait_semaphores.to_vec(),
        });
        state.check(HeadlessFaults::DEVICE_LOST, vk::Result::ERROR_DEVICE_LOST)?;
        state.check(HeadlessFaults::SURFACE_LOST, vk::Result::ERROR_SURFACE_LOST_KHR)?;
        state.check(HeadlessFaults::OUT_OF_DATE, vk::Result::ERROR_OUT_OF_DATE_KHR)?;
        Ok(false)
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let mut state = self.state();
        let fence: vk::Fence = state.allocate(vk::ObjectType::FENCE);
        state.fences.insert(fence.as_raw(), FenceState::Unsignaled);
        Ok(fence)
    }

    fn wait_and_reset_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state();
        let stalled = state.faults.contains(HeadlessFaults::FENCE_TIMEOUT);
        match state.fences.get_mut(&fence.as_raw()) {
            Some(current) if *current == FenceState::Signaled || (*current == FenceState::Pending && !stalled) => {
                *current = FenceState::Unsignaled;
                Ok(())
            }
            Some(_) => Err(vk::Result::TIMEOUT),
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> VkResult<vk::Semaphore> {
        let mut state = self.state();
        let semaphore: vk::Semaphore = state.allocate(vk::ObjectType::SEMAPHORE);
        if let SemaphoreKind::Timeline { initial_value } = kind {
            state.timelines.insert(
                semaphore.as_raw(),
                Timeline {
                    completed: initial_value,
                    pending: initial_value,
                },
            );
            state.device_timeline.get_or_insert(semaphore);
        }
        Ok(semaphore)
    }

    fn timeline_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        let state = self.state();
        state.check(HeadlessFaults::DEVICE_LOST, vk::Result::ERROR_DEVICE_LOST)?;
        state
            .timelines
            .get(&semaphore.as_raw())
            .map(|timeline| timeline.completed)
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, _timeout_ns: u64) -> VkResult<bool> {
        let mut state = self.state();
        state.check(HeadlessFaults::DEVICE_LOST, vk::Result::ERROR_DEVICE_LOST)?;
        let stalled = state.stalled;
        let timeline = state
            .timelines
            .get_mut(&semaphore.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if timeline.completed >= value {
            return Ok(true);
        }
        if stalled {
            return Ok(false);
        }
        timeline.completed = timeline.completed.max(value.min(timeline.pending));
        Ok(timeline.completed >= value)
    }

    fn create_image(&self, _info: &ImageInfo) -> VkResult<NativeImage> {
        let mut state = self.state();
        state.check(HeadlessFaults::OUT_OF_MEMORY, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        let image = state.allocate(vk::ObjectType::IMAGE);
        state.next_handle += 1;
        Ok(NativeImage {
            image,
            memory: vk::DeviceMemory::from_raw(state.next_handle),
        })
    }

    fn create_image_view(&self, _info: &NativeImageViewInfo) -> VkResult<vk::ImageView> {
        let mut state = self.state();
        state.check(HeadlessFaults::OUT_OF_MEMORY, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        Ok(state.allocate(vk::ObjectType::IMAGE_VIEW))
    }

    fn create_buffer(&self, _info: &BufferInfo) -> VkResult<NativeBuffer> {
        let mut state = self.state();
        state.check(HeadlessFaults::OUT_OF_MEMORY, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        let buffer = state.allocate(vk::ObjectType::BUFFER);
        state.next_handle += 1;
        Ok(NativeBuffer {
            buffer,
            memory: vk::DeviceMemory::from_raw(state.next_handle),
        })
    }

    fn write_bindless(&self, write: BindlessWrite) {
        self.state().bindless_writes.push(write);
    }

    fn destroy(&self, object: NativeObject) {
        let mut state = self.state();
        let raw = object.raw();
        if state.live.remove(&raw).is_none() {
            log::error!("Headless backend destroyed {:?} which is not alive", object);
        }
        match object {
            NativeObject::Semaphore(_) => {
                state.timelines.remove(&raw);
            }
            NativeObject::Fence(_) => {
                state.fences.remove(&raw);
            }
            NativeObject::Swapchain(_) => {
                state.swapchains.remove(&raw);
            }
            _ => {}
        }
        let completed_value = state.device_completed();
        state.destroyed.push(DestructionRecord { object, completed_value });
    }

    fn set_debug_name(&self, _object_type: vk::ObjectType, raw_handle: u64, name: &str) {
        self.state().debug_names.insert(raw_handle, name.to_string());
    }

    fn begin_command_buffer(&self) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state();
        state.next_handle += 1;
        let raw = state.next_handle;
        state.recording.insert(raw, Vec::new());
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn encode(&self, command_buffer: vk::CommandBuffer, command: &Command) {
        match self.state().recording.get_mut(&command_buffer.as_raw()) {
            Some(commands) => commands.push(command.clone()),
            None => log::error!("Encoding into {:?} which is not recording", command_buffer),
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state();
        let commands = state
            .recording
            .remove(&command_buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        state.executable.insert(command_buffer.as_raw(), commands);
        Ok(())
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        let mut state = self.state();
        let raw = command_buffer.as_raw();
        if state.recording.remove(&raw).is_none() && state.executable.remove(&raw).is_none() {
            log::error!("Freeing unknown command buffer {:?}", command_buffer);
        }
    }

    fn queue_submit(&self, submit: &NativeSubmit<'_>) -> VkResult<()> {
        let mut state = self.state();
        state.check(HeadlessFaults::DEVICE_LOST, vk::Result::ERROR_DEVICE_LOST)?;
        state.check(HeadlessFaults::OUT_OF_MEMORY, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

        let commands = submit
            .command_buffers
            .iter()
            .map(|command_buffer| {
                state
                    .executable
                    .get(&command_buffer.as_raw())
                    .cloned()
                    .ok_or(vk::Result::ERROR_UNKNOWN)
            })
            .collect::<VkResult<Vec<_>>>()?;

        let timeline = state
            .timelines
            .get_mut(&submit.timeline.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        timeline.pending = timeline.pending.max(submit.timeline_value);

        state.submissions.push(SubmissionRecord {
            timeline_value: submit.timeline_value,
            command_buffers: submit.command_buffers.to_vec(),
            commands,
            wait_semaphores: submit.wait_semaphores.iter().map(|(semaphore, _)| *semaphore).collect(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
        });
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state();
        state.check(HeadlessFaults::DEVICE_LOST, vk::Result::ERROR_DEVICE_LOST)?;
        if !state.stalled {
            state.complete(u64::MAX);
        }
        Ok(())
    }
}
