//! Resource registry
//!
//! Owns every image, image view and buffer created through a
//! [`Device`](crate::Device). Clients hold [`Handle`]s; the registry holds the
//! native objects, their bindless indices and a reference count of the
//! command lists (and child views) that still use them.
//!
//! A resource leaves the registry only when both conditions hold:
//! its destroy request's timeline guard has been reached, and its reference
//! count is zero. The garbage collector checks both.

use ash::vk;

use crate::backend::NativeObject;
use crate::config::DeviceConfig;
use crate::error::{GpuError, GpuResult};
use crate::foundation::collections::{BindlessTable, Handle, ResourceKey, SlotMap};

/// Marker for image handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Image {}

/// Marker for image view handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageView {}

/// Marker for buffer handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Buffer {}

/// Handle to an image
pub type ImageId = Handle<Image>;
/// Handle to an image view
pub type ImageViewId = Handle<ImageView>;
/// Handle to a buffer
pub type BufferId = Handle<Buffer>;

/// Kinds of registry resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// Image
    Image,
    /// Image view
    ImageView,
    /// Buffer
    Buffer,
}

impl ResourceType {
    /// Human-readable kind name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::ImageView => "image view",
            Self::Buffer => "buffer",
        }
    }
}

/// Ties a handle marker to its registry kind
pub trait ResourceKind {
    /// Registry kind of this marker
    const TYPE: ResourceType;
}

impl ResourceKind for Image {
    const TYPE: ResourceType = ResourceType::Image;
}

impl ResourceKind for ImageView {
    const TYPE: ResourceType = ResourceType::ImageView;
}

impl ResourceKind for Buffer {
    const TYPE: ResourceType = ResourceType::Buffer;
}

/// Image creation parameters
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Texel format
    pub format: vk::Format,
    /// Size in texels
    pub extent: vk::Extent3D,
    /// Number of mip levels
    pub mip_level_count: u32,
    /// Number of array layers
    pub array_layer_count: u32,
    /// Allowed usage
    pub usage: vk::ImageUsageFlags,
    /// Debug name
    pub name: String,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D { width: 1, height: 1, depth: 1 },
            mip_level_count: 1,
            array_layer_count: 1,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            name: String::new(),
        }
    }
}

impl ImageInfo {
    /// Aspect implied by the format
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.format)
    }

    /// Range covering every mip level and layer
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.mip_level_count,
            base_array_layer: 0,
            layer_count: self.array_layer_count,
        }
    }
}

/// Image view creation parameters
#[derive(Debug, Clone)]
pub struct ImageViewInfo {
    /// Viewed image
    pub image: ImageId,
    /// View type
    pub view_type: vk::ImageViewType,
    /// View format, defaults to the image's
    pub format: Option<vk::Format>,
    /// Viewed subresources, defaults to the whole image
    pub range: Option<vk::ImageSubresourceRange>,
    /// Debug name
    pub name: String,
}

impl ImageViewInfo {
    /// 2D view over the whole image
    pub fn new(image: ImageId) -> Self {
        Self {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format: None,
            range: None,
            name: String::new(),
        }
    }

    /// Set the debug name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Buffer creation parameters
#[derive(Debug, Clone)]
pub struct BufferInfo {
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Allowed usage
    pub usage: vk::BufferUsageFlags,
    /// Whether the memory must be mappable from the host
    pub host_visible: bool,
    /// Debug name
    pub name: String,
}

impl Default for BufferInfo {
    fn default() -> Self {
        Self {
            size: 0,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
            host_visible: false,
            name: String::new(),
        }
    }
}

/// Aspect mask implied by a format
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// What the registry knows about a resource
#[derive(Debug, Clone)]
pub(crate) enum ResourceDetails {
    Image {
        info: ImageInfo,
        image: vk::Image,
    },
    ImageView {
        parent: ResourceKey,
        view: vk::ImageView,
        format: vk::Format,
        range: vk::ImageSubresourceRange,
        name: String,
    },
    Buffer {
        info: BufferInfo,
        buffer: vk::Buffer,
    },
}

impl ResourceDetails {
    const fn resource_type(&self) -> ResourceType {
        match self {
            Self::Image { .. } => ResourceType::Image,
            Self::ImageView { .. } => ResourceType::ImageView,
            Self::Buffer { .. } => ResourceType::Buffer,
        }
    }
}

#[derive(Debug)]
struct ResourceSlot {
    details: ResourceDetails,
    /// `None` for images owned by a swapchain
    native: Option<NativeObject>,
    bindless_index: u32,
    references: u32,
    destroy_requested: bool,
}

/// Result of trying to free a destroyed resource
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FreeOutcome {
    /// Removed from the registry; the native object (if owned) must be destroyed
    Freed(Option<NativeObject>),
    /// Still referenced by a command list or view
    Busy,
    /// Already gone
    Missing,
}

/// Arena of live resources keyed by generational handles
#[derive(Debug)]
pub(crate) struct ResourceRegistry {
    slots: SlotMap<ResourceKey, ResourceSlot>,
    images: BindlessTable,
    image_views: BindlessTable,
    buffers: BindlessTable,
}

impl ResourceRegistry {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            slots: SlotMap::with_key(),
            images: BindlessTable::new(config.max_bindless_images),
            image_views: BindlessTable::new(config.max_bindless_image_views),
            buffers: BindlessTable::new(config.max_bindless_buffers),
        }
    }

    fn table(&mut self, resource_type: ResourceType) -> &mut BindlessTable {
        match resource_type {
            ResourceType::Image => &mut self.images,
            ResourceType::ImageView => &mut self.image_views,
            ResourceType::Buffer => &mut self.buffers,
        }
    }

    /// Reserve a bindless index before the native object is created
    pub fn reserve_index(&mut self, resource_type: ResourceType) -> Option<u32> {
        self.table(resource_type).allocate()
    }

    /// Give back an index whose native creation failed
    pub fn release_index(&mut self, resource_type: ResourceType, index: u32) {
        self.table(resource_type).free(index);
    }

    /// Register a created resource under a reserved index
    pub fn insert(
        &mut self,
        details: ResourceDetails,
        native: Option<NativeObject>,
        bindless_index: u32,
    ) -> ResourceKey {
        if let ResourceDetails::ImageView { parent, .. } = &details {
            if let Some(parent) = self.slots.get_mut(*parent) {
                parent.references += 1;
            }
        }
        self.slots.insert(ResourceSlot {
            details,
            native,
            bindless_index,
            references: 0,
            destroy_requested: false,
        })
    }

    fn live_slot(&self, key: ResourceKey, resource_type: ResourceType) -> GpuResult<&ResourceSlot> {
        match self.slots.get(key) {
            Some(slot) if slot.details.resource_type() == resource_type && !slot.destroy_requested => Ok(slot),
            _ => Err(GpuError::InvalidHandle { kind: resource_type.name() }),
        }
    }

    /// Whether a handle names a live resource that has not been destroyed
    pub fn is_live(&self, key: ResourceKey, resource_type: ResourceType) -> bool {
        self.live_slot(key, resource_type).is_ok()
    }

    /// Bindless index of a live resource
    pub fn bindless_index(&self, key: ResourceKey, resource_type: ResourceType) -> GpuResult<u32> {
        self.live_slot(key, resource_type).map(|slot| slot.bindless_index)
    }

    /// Native image and its creation info
    pub fn image(&self, id: ImageId) -> GpuResult<(vk::Image, &ImageInfo)> {
        match &self.live_slot(id.key(), ResourceType::Image)?.details {
            ResourceDetails::Image { info, image } => Ok((*image, info)),
            _ => Err(GpuError::InvalidHandle { kind: "image" }),
        }
    }

    /// Native view, its format and range, and the extent of its parent image
    pub fn image_view(&self, id: ImageViewId) -> GpuResult<(vk::ImageView, vk::Format, vk::ImageSubresourceRange)> {
        match &self.live_slot(id.key(), ResourceType::ImageView)?.details {
            ResourceDetails::ImageView { view, format, range, .. } => Ok((*view, *format, *range)),
            _ => Err(GpuError::InvalidHandle { kind: "image view" }),
        }
    }

    /// Native buffer and its creation info
    pub fn buffer(&self, id: BufferId) -> GpuResult<(vk::Buffer, &BufferInfo)> {
        match &self.live_slot(id.key(), ResourceType::Buffer)?.details {
            ResourceDetails::Buffer { info, buffer } => Ok((*buffer, info)),
            _ => Err(GpuError::InvalidHandle { kind: "buffer" }),
        }
    }

    /// Take a reference on behalf of a command list
    pub fn add_reference(&mut self, key: ResourceKey, resource_type: ResourceType) -> GpuResult<()> {
        self.live_slot(key, resource_type)?;
        if let Some(slot) = self.slots.get_mut(key) {
            slot.references += 1;
        }
        Ok(())
    }

    /// Drop a reference; destroyed resources stay registered until freed
    pub fn release_reference(&mut self, key: ResourceKey) {
        match self.slots.get_mut(key) {
            Some(slot) if slot.references > 0 => slot.references -= 1,
            Some(_) => log::warn!("Reference count underflow for resource {:?}", key),
            None => log::warn!("Released reference to unknown resource {:?}", key),
        }
    }

    /// Current reference count, if the resource is registered
    pub fn references(&self, key: ResourceKey) -> Option<u32> {
        self.slots.get(key).map(|slot| slot.references)
    }

    /// Kind of the first resource in `keys` whose destruction was requested
    pub fn find_destroyed(&self, keys: &[ResourceKey]) -> Option<&'static str> {
        keys.iter().find_map(|key| match self.slots.get(*key) {
            Some(slot) if !slot.destroy_requested => None,
            Some(slot) => Some(slot.details.resource_type().name()),
            None => Some("resource"),
        })
    }

    /// Mark a resource destroyed; further use of its handle is rejected
    pub fn mark_destroyed(&mut self, key: ResourceKey, resource_type: ResourceType) -> GpuResult<()> {
        self.live_slot(key, resource_type)?;
        if let Some(slot) = self.slots.get_mut(key) {
            slot.destroy_requested = true;
        }
        Ok(())
    }

    /// Remove a destroyed resource if nothing references it any more
    pub fn try_free(&mut self, key: ResourceKey) -> FreeOutcome {
        match self.slots.get(key) {
            None => return FreeOutcome::Missing,
            Some(slot) if slot.references > 0 => return FreeOutcome::Busy,
            Some(_) => {}
        }
        let Some(slot) = self.slots.remove(key) else {
            return FreeOutcome::Missing;
        };
        let resource_type = slot.details.resource_type();
        self.table(resource_type).free(slot.bindless_index);
        if let ResourceDetails::ImageView { parent, .. } = slot.details {
            self.release_reference(parent);
        }
        FreeOutcome::Freed(slot.native)
    }

    /// Remove everything, views first, returning owned native objects
    pub fn drain(&mut self) -> Vec<NativeObject> {
        let mut keys: Vec<(ResourceKey, bool)> = self
            .slots
            .iter()
            .map(|(key, slot)| (key, matches!(slot.details, ResourceDetails::ImageView { .. })))
            .collect();
        keys.sort_by_key(|(_, is_view)| !*is_view);

        let mut natives = Vec::new();
        for (key, _) in keys {
            if let Some(slot) = self.slots.remove(key) {
                let resource_type = slot.details.resource_type();
                self.table(resource_type).free(slot.bindless_index);
                natives.extend(slot.native);
            }
        }
        natives
    }

    /// Number of registered resources, including destroyed ones awaiting collection
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of bindless indices allocated for a kind
    pub fn allocated_indices(&self, resource_type: ResourceType) -> u32 {
        match resource_type {
            ResourceType::Image => self.images.allocated_count(),
            ResourceType::ImageView => self.image_views.allocated_count(),
            ResourceType::Buffer => self.buffers.allocated_count(),
        }
    }
}
