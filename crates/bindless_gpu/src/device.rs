//! # Device Context
//!
//! [`Device`] is the one explicitly constructed context object: it owns the
//! backend, the device timeline semaphore, the resource registry and the
//! garbage collector, and it is the factory for every other object in the
//! crate. It is a cheap clonable handle; objects that need the device keep a
//! clone, and the native device is torn down when the last clone goes.
//!
//! ## Timeline discipline
//!
//! Every submission signals the device timeline to a strictly increasing
//! value. That counter is the only record of GPU progress:
//!
//! - a destroy request is guarded by the highest value issued at the time of
//!   the call
//! - a submitted command list stays in flight until the completed value
//!   reaches its submission value
//! - [`Device::check_for_finished_submits`] frees whatever those two rules
//!   allow and never blocks
//!
//! ## Threading
//!
//! All methods take `&self`. Submission is serialized internally so timeline
//! values are issued in order, but recording into one
//! [`CommandRecorder`] is single threaded by construction (`&mut self`).

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::backend::{BindlessWrite, DeviceBackend, NativeImageViewInfo, NativeObject, NativeSubmit, SemaphoreKind};
use crate::command::{CommandListState, CommandRecorder, CommandRecorderInfo, ExecutableCommandList};
use crate::config::DeviceConfig;
use crate::error::{GpuError, GpuResult};
use crate::foundation::collections::{Handle, ResourceKey};
use crate::gc::{GarbageCollector, GcReport, Zombie};
use crate::resource::{
    BufferId, BufferInfo, FreeOutcome, ImageId, ImageInfo, ImageViewId, ImageViewInfo, ResourceDetails,
    ResourceKind, ResourceRegistry, ResourceType,
};
use crate::swapchain::{Swapchain, SwapchainImage, SwapchainInfo};
use crate::sync::BinarySemaphore;

/// Lock a mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parameters of one queue submission
#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo<'a> {
    /// Lists executed in order
    pub command_lists: &'a [ExecutableCommandList],
    /// Binary semaphores waited on before execution
    pub wait_binary_semaphores: &'a [&'a BinarySemaphore],
    /// Binary semaphores signaled on completion
    pub signal_binary_semaphores: &'a [&'a BinarySemaphore],
    /// Stages that wait on `wait_binary_semaphores`
    pub wait_stages: vk::PipelineStageFlags,
    /// Timeline value to signal; `None` takes the next value
    pub signal_timeline_value: Option<u64>,
}

impl Default for SubmitInfo<'_> {
    fn default() -> Self {
        Self {
            command_lists: &[],
            wait_binary_semaphores: &[],
            signal_binary_semaphores: &[],
            wait_stages: vk::PipelineStageFlags::ALL_COMMANDS,
            signal_timeline_value: None,
        }
    }
}

impl<'a> SubmitInfo<'a> {
    /// Submit `command_lists` with no semaphores and the next timeline value
    pub fn new(command_lists: &'a [ExecutableCommandList]) -> Self {
        Self {
            command_lists,
            ..Self::default()
        }
    }
}

pub(crate) struct DeviceShared {
    backend: Arc<dyn DeviceBackend>,
    config: DeviceConfig,
    timeline: vk::Semaphore,
    /// Highest timeline value handed to the queue; held for the whole submit
    highest_issued: Mutex<u64>,
    registry: Mutex<ResourceRegistry>,
    gc: Mutex<GarbageCollector>,
    next_swapchain_id: Mutex<u64>,
}

impl DeviceShared {
    pub(crate) fn registry(&self) -> MutexGuard<'_, ResourceRegistry> {
        lock(&self.registry)
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        log::debug!("Destroying device on {} backend", self.backend.name());
        if let Err(result) = self.backend.wait_idle() {
            log::error!("Device wait idle failed during teardown: {:?}", result);
        }

        let gc = self.gc.get_mut().unwrap_or_else(PoisonError::into_inner);
        let (submissions, pending) = gc.drain_all();
        drop(submissions);

        let registry = self.registry.get_mut().unwrap_or_else(PoisonError::into_inner);
        let live = registry.len();
        let destroyed = pending
            .iter()
            .filter(|entry| matches!(entry.zombie, Zombie::Resource(_)))
            .count();
        if live > destroyed {
            log::warn!("{} resources were never destroyed; releasing them at device teardown", live - destroyed);
        }

        for object in registry.drain() {
            self.backend.destroy(object);
        }
        for entry in pending {
            if let Zombie::Native(object) = entry.zombie {
                self.backend.destroy(object);
            }
        }
        self.backend.destroy(NativeObject::Semaphore(self.timeline));
    }
}

/// Device context: factory, submission queue and garbage collector
#[derive(Clone)]
pub struct Device(Arc<DeviceShared>);

impl Device {
    /// Create a device on top of a backend
    pub fn new(backend: Arc<dyn DeviceBackend>, config: DeviceConfig) -> GpuResult<Self> {
        config.validate()?;

        let timeline = backend
            .create_semaphore(SemaphoreKind::Timeline { initial_value: 0 })
            .map_err(GpuError::from_vk)?;
        backend.set_debug_name(vk::ObjectType::SEMAPHORE, vk::Handle::as_raw(timeline), "device timeline");

        log::info!(
            "Created device '{}' on {} backend ({} frames in flight)",
            config.application_name,
            backend.name(),
            config.max_frames_in_flight
        );

        Ok(Self(Arc::new(DeviceShared {
            registry: Mutex::new(ResourceRegistry::new(&config)),
            backend,
            config,
            timeline,
            highest_issued: Mutex::new(0),
            gc: Mutex::new(GarbageCollector::new()),
            next_swapchain_id: Mutex::new(0),
        })))
    }

    /// Device configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.0.config
    }

    /// Name of the backend driving this device
    pub fn backend_name(&self) -> &str {
        self.0.backend.name()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.0.backend
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, ResourceRegistry> {
        self.0.registry()
    }

    pub(crate) fn downgrade(&self) -> Weak<DeviceShared> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn next_swapchain_id(&self) -> u64 {
        let mut next = lock(&self.0.next_swapchain_id);
        *next += 1;
        *next
    }

    // ---- Surfaces and swapchains ----

    /// Create a presentation surface for a window
    ///
    /// Ownership of the surface passes to the swapchain created from it.
    pub fn create_surface<W>(&self, window: &W) -> GpuResult<vk::SurfaceKHR>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        let surface = self
            .0
            .backend
            .create_surface(window.raw_display_handle(), window.raw_window_handle())
            .map_err(|result| GpuError::SurfaceCreation {
                reason: format!("{result:?}"),
            })?;
        log::debug!("Created surface {:?}", surface);
        Ok(surface)
    }

    /// Destroy a surface that no swapchain took ownership of
    pub fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.defer_destruction(NativeObject::Surface(surface));
    }

    /// Create a swapchain for a surface
    pub fn create_swapchain(&self, info: SwapchainInfo) -> GpuResult<Swapchain> {
        Swapchain::new(self, info)
    }

    /// Present an acquired image once `wait_semaphores` are signaled
    ///
    /// The image is consumed. An out-of-date result leaves the swapchain
    /// ready for [`Swapchain::resize`]; surface loss makes it unusable.
    pub fn present_frame(
        &self,
        swapchain: &mut Swapchain,
        image: SwapchainImage,
        wait_semaphores: &[&BinarySemaphore],
    ) -> GpuResult<()> {
        swapchain.present(image, wait_semaphores)
    }

    // ---- Resources ----

    fn creation_error(kind: &'static str, name: &str, result: vk::Result) -> GpuError {
        match result {
            vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
            other => GpuError::ResourceCreation {
                kind,
                name: name.to_string(),
                reason: format!("{other:?}"),
            },
        }
    }

    fn reserve_index(&self, resource_type: ResourceType, name: &str) -> GpuResult<u32> {
        self.registry()
            .reserve_index(resource_type)
            .ok_or_else(|| GpuError::ResourceCreation {
                kind: resource_type.name(),
                name: name.to_string(),
                reason: format!("bindless {} table is full", resource_type.name()),
            })
    }

    fn set_debug_name(&self, object_type: vk::ObjectType, raw: u64, name: &str) {
        if !name.is_empty() {
            self.0.backend.set_debug_name(object_type, raw, name);
        }
    }

    /// Create an image with device-local memory
    pub fn create_image(&self, info: &ImageInfo) -> GpuResult<ImageId> {
        let extent = info.extent;
        if extent.width == 0
            || extent.height == 0
            || extent.depth == 0
            || info.mip_level_count == 0
            || info.array_layer_count == 0
        {
            return Err(GpuError::ResourceCreation {
                kind: "image",
                name: info.name.clone(),
                reason: "extent, mip count and layer count must be non-zero".to_string(),
            });
        }

        let index = self.reserve_index(ResourceType::Image, &info.name)?;
        let native = match self.0.backend.create_image(info) {
            Ok(native) => native,
            Err(result) => {
                self.registry().release_index(ResourceType::Image, index);
                return Err(Self::creation_error("image", &info.name, result));
            }
        };
        self.set_debug_name(vk::ObjectType::IMAGE, vk::Handle::as_raw(native.image), &info.name);

        let key = self.registry().insert(
            ResourceDetails::Image {
                info: info.clone(),
                image: native.image,
            },
            Some(NativeObject::Image(native)),
            index,
        );
        log::debug!("Created image '{}' {}x{} {:?}", info.name, extent.width, extent.height, info.format);
        Ok(Handle::new(key))
    }

    /// Register an image owned by something else (swapchain images)
    pub(crate) fn register_external_image(&self, image: vk::Image, info: ImageInfo) -> GpuResult<ImageId> {
        let index = self.reserve_index(ResourceType::Image, &info.name)?;
        self.set_debug_name(vk::ObjectType::IMAGE, vk::Handle::as_raw(image), &info.name);
        let key = self
            .registry()
            .insert(ResourceDetails::Image { info, image }, None, index);
        Ok(Handle::new(key))
    }

    /// Create a view of a live image and publish it in the bindless table
    pub fn create_image_view(&self, info: &ImageViewInfo) -> GpuResult<ImageViewId> {
        // Held across creation so the parent cannot be destroyed in between
        let mut registry = self.registry();
        let (image, image_info) = registry.image(info.image)?;
        let native_info = NativeImageViewInfo {
            image,
            view_type: info.view_type,
            format: info.format.unwrap_or(image_info.format),
            range: info.range.unwrap_or_else(|| image_info.full_range()),
        };
        let storage = image_info.usage.contains(vk::ImageUsageFlags::STORAGE);
        let sampled = image_info.usage.contains(vk::ImageUsageFlags::SAMPLED);

        let index = registry
            .reserve_index(ResourceType::ImageView)
            .ok_or_else(|| GpuError::ResourceCreation {
                kind: "image view",
                name: info.name.clone(),
                reason: "bindless image view table is full".to_string(),
            })?;
        let view = match self.0.backend.create_image_view(&native_info) {
            Ok(view) => view,
            Err(result) => {
                registry.release_index(ResourceType::ImageView, index);
                return Err(Self::creation_error("image view", &info.name, result));
            }
        };

        self.set_debug_name(vk::ObjectType::IMAGE_VIEW, vk::Handle::as_raw(view), &info.name);
        if storage || sampled {
            self.0.backend.write_bindless(BindlessWrite::ImageView {
                index,
                view,
                storage,
                sampled,
            });
        }

        let key = registry.insert(
            ResourceDetails::ImageView {
                parent: info.image.key(),
                view,
                format: native_info.format,
                range: native_info.range,
                name: info.name.clone(),
            },
            Some(NativeObject::ImageView(view)),
            index,
        );
        log::debug!("Created image view '{}' at bindless index {}", info.name, index);
        Ok(Handle::new(key))
    }

    /// Create a buffer and publish it in the bindless table
    pub fn create_buffer(&self, info: &BufferInfo) -> GpuResult<BufferId> {
        if info.size == 0 {
            return Err(GpuError::ResourceCreation {
                kind: "buffer",
                name: info.name.clone(),
                reason: "size must be non-zero".to_string(),
            });
        }

        let index = self.reserve_index(ResourceType::Buffer, &info.name)?;
        let native = match self.0.backend.create_buffer(info) {
            Ok(native) => native,
            Err(result) => {
                self.registry().release_index(ResourceType::Buffer, index);
                return Err(Self::creation_error("buffer", &info.name, result));
            }
        };
        self.set_debug_name(vk::ObjectType::BUFFER, vk::Handle::as_raw(native.buffer), &info.name);
        if info.usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            self.0.backend.write_bindless(BindlessWrite::Buffer {
                index,
                buffer: native.buffer,
                size: info.size,
            });
        }

        let key = self.registry().insert(
            ResourceDetails::Buffer {
                info: info.clone(),
                buffer: native.buffer,
            },
            Some(NativeObject::Buffer(native)),
            index,
        );
        log::debug!("Created buffer '{}' ({} bytes) at bindless index {}", info.name, info.size, index);
        Ok(Handle::new(key))
    }

    fn destroy_resource(&self, key: ResourceKey, resource_type: ResourceType) -> GpuResult<()> {
        self.registry().mark_destroyed(key, resource_type)?;
        let guard = self.highest_issued_value();
        lock(&self.0.gc).defer(Zombie::Resource(key), guard);
        log::trace!("Deferred destruction of {} {:?} behind timeline value {}", resource_type.name(), key, guard);
        Ok(())
    }

    /// Request destruction of an image
    ///
    /// The handle becomes invalid immediately. The native image is freed once
    /// the GPU has passed every submission issued so far and no command list
    /// or view still references it.
    pub fn destroy_image(&self, image: ImageId) -> GpuResult<()> {
        self.destroy_resource(image.key(), ResourceType::Image)
    }

    /// Request destruction of an image view
    pub fn destroy_image_view(&self, view: ImageViewId) -> GpuResult<()> {
        self.destroy_resource(view.key(), ResourceType::ImageView)
    }

    /// Request destruction of a buffer
    pub fn destroy_buffer(&self, buffer: BufferId) -> GpuResult<()> {
        self.destroy_resource(buffer.key(), ResourceType::Buffer)
    }

    /// Destroy a native object once the work issued so far has completed
    pub(crate) fn defer_destruction(&self, object: NativeObject) {
        let guard = self.highest_issued_value();
        lock(&self.0.gc).defer(Zombie::Native(object), guard);
    }

    /// Bindless index of a live resource
    pub fn bindless_index<T: ResourceKind>(&self, handle: Handle<T>) -> GpuResult<u32> {
        self.registry().bindless_index(handle.key(), T::TYPE)
    }

    /// Whether a handle names a live, not yet destroyed resource
    pub fn is_alive<T: ResourceKind>(&self, handle: Handle<T>) -> bool {
        self.registry().is_live(handle.key(), T::TYPE)
    }

    /// Creation parameters of a live image
    pub fn image_info(&self, image: ImageId) -> GpuResult<ImageInfo> {
        self.registry().image(image).map(|(_, info)| info.clone())
    }

    /// Creation parameters of a live buffer
    pub fn buffer_info(&self, buffer: BufferId) -> GpuResult<BufferInfo> {
        self.registry().buffer(buffer).map(|(_, info)| info.clone())
    }

    /// Native image behind a live handle
    pub fn native_image(&self, image: ImageId) -> GpuResult<vk::Image> {
        self.registry().image(image).map(|(native, _)| native)
    }

    /// Native buffer behind a live handle
    pub fn native_buffer(&self, buffer: BufferId) -> GpuResult<vk::Buffer> {
        self.registry().buffer(buffer).map(|(native, _)| native)
    }

    /// Registered resources, including destroyed ones not yet collected
    pub fn resource_count(&self) -> usize {
        self.registry().len()
    }

    // ---- Recording and submission ----

    /// Create a binary semaphore
    pub fn create_binary_semaphore(&self, name: &str) -> GpuResult<BinarySemaphore> {
        BinarySemaphore::new(self, name)
    }

    /// Begin recording a new command list
    pub fn create_command_recorder(&self, info: &CommandRecorderInfo) -> GpuResult<CommandRecorder> {
        CommandRecorder::new(self, info)
    }

    /// Submit executable lists in one native submission
    ///
    /// All wait and signal semaphores are paired in that one call, and the
    /// device timeline is signaled to the returned value when the batch
    /// completes. On failure nothing from the batch is in flight.
    pub fn submit_commands(&self, info: &SubmitInfo<'_>) -> GpuResult<u64> {
        let mut highest = lock(&self.0.highest_issued);
        let completed = self.completed_value()?;

        for (position, list) in info.command_lists.iter().enumerate() {
            if info.command_lists[..position].iter().any(|other| other.ptr_eq(list)) {
                return Err(GpuError::CommandListInFlight {
                    name: list.name().to_string(),
                    timeline_value: *highest + 1,
                });
            }
            if let CommandListState::Submitted(value) = list.state() {
                if value > completed {
                    return Err(GpuError::CommandListInFlight {
                        name: list.name().to_string(),
                        timeline_value: value,
                    });
                }
            }
        }
        {
            // Recorded against a resource destroyed since, including swapchain images
            let registry = self.registry();
            for list in info.command_lists {
                if let Some(kind) = registry.find_destroyed(list.references()) {
                    log::warn!("Command list '{}' references a destroyed {}", list.name(), kind);
                    return Err(GpuError::InvalidHandle { kind });
                }
            }
        }

        let value = match info.signal_timeline_value {
            Some(requested) if requested <= *highest => {
                return Err(GpuError::TimelineNotMonotonic {
                    requested,
                    highest: *highest,
                });
            }
            Some(requested) => requested,
            None => *highest + 1,
        };

        let command_buffers: Vec<vk::CommandBuffer> = info
            .command_lists
            .iter()
            .map(ExecutableCommandList::command_buffer)
            .collect();
        let wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)> = info
            .wait_binary_semaphores
            .iter()
            .map(|semaphore| (semaphore.raw(), info.wait_stages))
            .collect();
        let signal_semaphores: Vec<vk::Semaphore> = info
            .signal_binary_semaphores
            .iter()
            .map(|semaphore| semaphore.raw())
            .collect();

        self.0
            .backend
            .queue_submit(&NativeSubmit {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                signal_semaphores: &signal_semaphores,
                timeline: self.0.timeline,
                timeline_value: value,
            })
            .map_err(|result| match result {
                vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
                other => GpuError::Submission(other),
            })?;

        *highest = value;
        for list in info.command_lists {
            list.set_state(CommandListState::Submitted(value));
        }
        lock(&self.0.gc).track_submission(value, info.command_lists.to_vec());
        log::trace!("Submitted {} command lists at timeline value {}", info.command_lists.len(), value);
        Ok(value)
    }

    // ---- Timeline ----

    /// Highest timeline value handed to the queue
    pub fn highest_issued_value(&self) -> u64 {
        *lock(&self.0.highest_issued)
    }

    /// Timeline value the GPU has completed
    pub fn completed_value(&self) -> GpuResult<u64> {
        self.0.backend.timeline_value(self.0.timeline).map_err(GpuError::from_vk)
    }

    /// Block until the timeline reaches `value` or `timeout` expires
    pub fn wait_for_value(&self, value: u64, timeout: Duration) -> GpuResult<()> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self.wait_for_value_ns(value, timeout_ns)
    }

    pub(crate) fn wait_for_value_ns(&self, value: u64, timeout_ns: u64) -> GpuResult<()> {
        match self.0.backend.wait_timeline(self.0.timeline, value, timeout_ns) {
            Ok(true) => Ok(()),
            Ok(false) => Err(GpuError::Timeout { value }),
            Err(result) => Err(GpuError::from_vk(result)),
        }
    }

    // ---- Garbage collection ----

    /// Retire finished submissions and free what they kept alive
    ///
    /// Polls the completed timeline value once and never blocks. Calling it
    /// again without GPU progress does nothing.
    pub fn check_for_finished_submits(&self) -> GpuResult<GcReport> {
        let completed = self.completed_value()?;
        Ok(self.collect_up_to(completed))
    }

    /// Same sweep as [`check_for_finished_submits`](Self::check_for_finished_submits)
    pub fn collect_garbage(&self) -> GpuResult<GcReport> {
        self.check_for_finished_submits()
    }

    /// Wait for everything issued so far, then collect
    ///
    /// Unbounded; meant for teardown and swapchain recreation.
    pub fn wait_idle(&self) -> GpuResult<GcReport> {
        let highest = self.highest_issued_value();
        self.wait_for_value_ns(highest, u64::MAX)?;
        self.0.backend.wait_idle().map_err(GpuError::from_vk)?;
        let completed = self.completed_value()?;
        Ok(self.collect_up_to(completed))
    }

    fn collect_up_to(&self, completed: u64) -> GcReport {
        let mut report = GcReport {
            completed_value: completed,
            ..GcReport::default()
        };

        let retired = lock(&self.0.gc).drain_completed_submissions(completed);
        report.retired_submissions = retired.len();
        for submission in &retired {
            for list in &submission.lists {
                list.retire(submission.timeline_value);
            }
        }
        // Dropping the list clones releases their registry references
        drop(retired);

        let mut waiting = lock(&self.0.gc).drain_ready_destructions(completed);
        let mut natives = Vec::new();
        {
            let mut registry = self.registry();
            loop {
                let before = waiting.len();
                let mut busy = Vec::new();
                for entry in waiting {
                    match entry.zombie {
                        Zombie::Native(object) => {
                            natives.push(object);
                            report.freed_objects += 1;
                        }
                        Zombie::Resource(key) => match registry.try_free(key) {
                            FreeOutcome::Freed(native) => {
                                natives.extend(native);
                                report.freed_objects += 1;
                            }
                            FreeOutcome::Busy => busy.push(entry),
                            FreeOutcome::Missing => {
                                log::warn!("Pending destruction of unknown resource {:?}", key);
                            }
                        },
                    }
                }
                waiting = busy;
                // A freed view may have released the last reference to its image
                if waiting.is_empty() || waiting.len() == before {
                    break;
                }
            }
        }

        for object in natives {
            log::trace!("Destroying {:?}", object);
            self.0.backend.destroy(object);
        }

        report.deferred = waiting.len();
        if !waiting.is_empty() {
            lock(&self.0.gc).requeue(waiting);
        }
        report
    }

    /// Submissions not yet retired
    pub fn in_flight_submissions(&self) -> usize {
        lock(&self.0.gc).in_flight_count()
    }

    /// Destructions not yet performed
    pub fn pending_destructions(&self) -> usize {
        lock(&self.0.gc).pending_count()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.0.backend.name())
            .field("application", &self.0.config.application_name)
            .field("highest_issued", &self.highest_issued_value())
            .finish()
    }
}
