//! Command recording
//!
//! A [`CommandRecorder`] records GPU operations against registry handles and
//! is finalized exactly once into an [`ExecutableCommandList`]. Barrier
//! requests are queued and flushed as one native barrier call right before
//! the next operation that does work (or on an explicit
//! [`CommandRecorder::insert_queued_barriers`]).
//!
//! Every handle a recorder touches gains one registry reference, held by the
//! resulting command list until the last clone of that list is dropped. The
//! device keeps a clone of every submitted list until the GPU has passed its
//! timeline value, so a resource destroyed while referenced by in-flight work
//! stays alive until that work retires.

use ash::vk;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::backend::DeviceBackend;
use crate::device::{lock, Device, DeviceShared};
use crate::error::{GpuError, GpuResult};
use crate::foundation::collections::ResourceKey;
use crate::resource::{BufferId, ImageId, ImageViewId, ResourceRegistry, ResourceType};
use crate::sync::Access;

/// Global memory barrier resolved for the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeMemoryBarrier {
    /// Accesses made available
    pub src_access: vk::AccessFlags,
    /// Accesses made visible
    pub dst_access: vk::AccessFlags,
}

/// Buffer barrier resolved for the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBufferBarrier {
    /// Guarded buffer
    pub buffer: vk::Buffer,
    /// Accesses made available
    pub src_access: vk::AccessFlags,
    /// Accesses made visible
    pub dst_access: vk::AccessFlags,
    /// Start of the guarded range
    pub offset: vk::DeviceSize,
    /// Size of the guarded range
    pub size: vk::DeviceSize,
}

/// Image barrier resolved for the backend
#[derive(Debug, Clone, Copy)]
pub struct NativeImageBarrier {
    /// Guarded image
    pub image: vk::Image,
    /// Accesses made available
    pub src_access: vk::AccessFlags,
    /// Accesses made visible
    pub dst_access: vk::AccessFlags,
    /// Layout before the barrier
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
    /// Guarded subresources
    pub range: vk::ImageSubresourceRange,
}

/// Barriers flushed together as one native call
#[derive(Debug, Clone, Default)]
pub struct BarrierBatch {
    /// Union of all source stages
    pub src_stages: vk::PipelineStageFlags,
    /// Union of all destination stages
    pub dst_stages: vk::PipelineStageFlags,
    /// Global memory barriers
    pub memory: Vec<NativeMemoryBarrier>,
    /// Buffer barriers
    pub buffers: Vec<NativeBufferBarrier>,
    /// Image barriers
    pub images: Vec<NativeImageBarrier>,
}

impl BarrierBatch {
    /// Whether nothing has been queued
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffers.is_empty() && self.images.is_empty()
    }

    /// Number of queued barriers
    pub fn len(&self) -> usize {
        self.memory.len() + self.buffers.len() + self.images.len()
    }

    /// Stage masks to pass to the driver; empty masks become the pipe ends
    pub fn resolved_stages(&self) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
        let src = if self.src_stages.is_empty() {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            self.src_stages
        };
        let dst = if self.dst_stages.is_empty() {
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        } else {
            self.dst_stages
        };
        (src, dst)
    }

    fn add_stages(&mut self, src: Access, dst: Access) {
        self.src_stages |= src.stages;
        self.dst_stages |= dst.stages;
    }
}

/// Clear value of a rendering attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Color in linear float RGBA
    Color([f32; 4]),
    /// Depth and stencil
    DepthStencil {
        /// Depth value
        depth: f32,
        /// Stencil value
        stencil: u32,
    },
}

impl ClearValue {
    /// Convert to the native union
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// Rendering attachment resolved for the backend
#[derive(Debug, Clone, Copy)]
pub struct NativeAttachment {
    /// Target view
    pub view: vk::ImageView,
    /// Layout the view is in while rendering
    pub layout: vk::ImageLayout,
    /// Load operation
    pub load_op: vk::AttachmentLoadOp,
    /// Store operation
    pub store_op: vk::AttachmentStoreOp,
    /// Clear value used when `load_op` is `CLEAR`
    pub clear: ClearValue,
}

/// A recorded operation with every handle resolved to its native object
#[derive(Debug, Clone)]
pub enum Command {
    /// One batched pipeline barrier
    PipelineBarrier(BarrierBatch),
    /// Clear a color image
    ClearColorImage {
        /// Target image
        image: vk::Image,
        /// Current layout
        layout: vk::ImageLayout,
        /// Clear color
        color: [f32; 4],
        /// Cleared subresources
        range: vk::ImageSubresourceRange,
    },
    /// Copy between buffers
    CopyBuffer {
        /// Source buffer
        src: vk::Buffer,
        /// Destination buffer
        dst: vk::Buffer,
        /// Copied region
        region: vk::BufferCopy,
    },
    /// Copy buffer contents into an image
    CopyBufferToImage {
        /// Source buffer
        src: vk::Buffer,
        /// Destination image
        dst: vk::Image,
        /// Current layout of the destination
        dst_layout: vk::ImageLayout,
        /// Copied region
        region: vk::BufferImageCopy,
    },
    /// Scaled image copy
    BlitImage {
        /// Source image
        src: vk::Image,
        /// Current layout of the source
        src_layout: vk::ImageLayout,
        /// Destination image
        dst: vk::Image,
        /// Current layout of the destination
        dst_layout: vk::ImageLayout,
        /// Blitted region
        region: vk::ImageBlit,
        /// Sampling filter
        filter: vk::Filter,
    },
    /// Bind a pipeline
    BindPipeline {
        /// Graphics or compute
        bind_point: vk::PipelineBindPoint,
        /// Pipeline handle
        pipeline: vk::Pipeline,
    },
    /// Bind the global bindless descriptor set
    BindBindlessTable {
        /// Graphics or compute
        bind_point: vk::PipelineBindPoint,
        /// Layout of the pipelines that will read the table
        layout: vk::PipelineLayout,
    },
    /// Upload push constants
    PushConstants {
        /// Pipeline layout
        layout: vk::PipelineLayout,
        /// Stages that read the constants
        stages: vk::ShaderStageFlags,
        /// Byte offset
        offset: u32,
        /// Constant bytes
        bytes: Vec<u8>,
    },
    /// Compute dispatch
    Dispatch {
        /// Workgroups along X
        x: u32,
        /// Workgroups along Y
        y: u32,
        /// Workgroups along Z
        z: u32,
    },
    /// Begin dynamic rendering
    BeginRendering {
        /// Color attachments
        colors: Vec<NativeAttachment>,
        /// Depth attachment
        depth: Option<NativeAttachment>,
        /// Rendered area
        render_area: vk::Rect2D,
    },
    /// End dynamic rendering
    EndRendering,
    /// Set the viewport
    SetViewport(vk::Viewport),
    /// Set the scissor rectangle
    SetScissor(vk::Rect2D),
    /// Non-indexed draw
    Draw {
        /// Vertices per instance
        vertex_count: u32,
        /// Instances
        instance_count: u32,
        /// First vertex
        first_vertex: u32,
        /// First instance
        first_instance: u32,
    },
}

/// Image barrier request
#[derive(Debug, Clone)]
pub struct ImageBarrierInfo {
    /// Guarded image
    pub image: ImageId,
    /// Prior access
    pub src: Access,
    /// Following access
    pub dst: Access,
    /// Layout before the barrier
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
    /// Guarded subresources, defaults to the whole image
    pub range: Option<vk::ImageSubresourceRange>,
}

impl ImageBarrierInfo {
    /// Layout transition over the whole image
    pub fn transition(
        image: ImageId,
        src: Access,
        dst: Access,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        Self {
            image,
            src,
            dst,
            old_layout,
            new_layout,
            range: None,
        }
    }
}

/// Buffer barrier request
#[derive(Debug, Clone)]
pub struct BufferBarrierInfo {
    /// Guarded buffer
    pub buffer: BufferId,
    /// Prior access
    pub src: Access,
    /// Following access
    pub dst: Access,
    /// Start of the guarded range
    pub offset: vk::DeviceSize,
    /// Size of the guarded range, `WHOLE_SIZE` for everything
    pub size: vk::DeviceSize,
}

/// Image clear request
#[derive(Debug, Clone)]
pub struct ImageClearInfo {
    /// Cleared image
    pub image: ImageId,
    /// Current layout
    pub layout: vk::ImageLayout,
    /// Clear color
    pub color: [f32; 4],
    /// Cleared subresources, defaults to the whole image
    pub range: Option<vk::ImageSubresourceRange>,
}

impl ImageClearInfo {
    /// Clear the whole image, which must be in `TRANSFER_DST_OPTIMAL`
    pub fn new(image: ImageId, color: [f32; 4]) -> Self {
        Self {
            image,
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            color,
            range: None,
        }
    }
}

/// Buffer to buffer copy request
#[derive(Debug, Clone)]
pub struct BufferCopyInfo {
    /// Source buffer
    pub src: BufferId,
    /// Offset into the source
    pub src_offset: vk::DeviceSize,
    /// Destination buffer
    pub dst: BufferId,
    /// Offset into the destination
    pub dst_offset: vk::DeviceSize,
    /// Bytes to copy
    pub size: vk::DeviceSize,
}

/// Buffer to image copy request
#[derive(Debug, Clone)]
pub struct BufferImageCopyInfo {
    /// Source buffer
    pub buffer: BufferId,
    /// Offset into the source
    pub buffer_offset: vk::DeviceSize,
    /// Destination image
    pub image: ImageId,
    /// Current layout of the destination
    pub image_layout: vk::ImageLayout,
    /// Destination mip level
    pub mip_level: u32,
    /// Destination offset in texels
    pub image_offset: vk::Offset3D,
    /// Copied extent, defaults to the whole mip level
    pub image_extent: Option<vk::Extent3D>,
}

/// Image blit request
#[derive(Debug, Clone)]
pub struct ImageBlitInfo {
    /// Source image
    pub src: ImageId,
    /// Current layout of the source
    pub src_layout: vk::ImageLayout,
    /// Destination image
    pub dst: ImageId,
    /// Current layout of the destination
    pub dst_layout: vk::ImageLayout,
    /// Source corners, defaults to the whole base level
    pub src_offsets: Option<[vk::Offset3D; 2]>,
    /// Destination corners, defaults to the whole base level
    pub dst_offsets: Option<[vk::Offset3D; 2]>,
    /// Sampling filter
    pub filter: vk::Filter,
}

impl ImageBlitInfo {
    /// Whole-image blit between transfer layouts
    pub fn new(src: ImageId, dst: ImageId) -> Self {
        Self {
            src,
            src_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            dst_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_offsets: None,
            dst_offsets: None,
            filter: vk::Filter::LINEAR,
        }
    }
}

/// Rendering attachment request
#[derive(Debug, Clone)]
pub struct RenderingAttachmentInfo {
    /// Target view
    pub view: ImageViewId,
    /// Layout the view is in while rendering
    pub layout: vk::ImageLayout,
    /// Load operation
    pub load_op: vk::AttachmentLoadOp,
    /// Store operation
    pub store_op: vk::AttachmentStoreOp,
    /// Clear value used when `load_op` is `CLEAR`
    pub clear: ClearValue,
}

impl RenderingAttachmentInfo {
    /// Color attachment cleared to `color` and stored
    pub fn cleared(view: ImageViewId, color: [f32; 4]) -> Self {
        Self {
            view,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear: ClearValue::Color(color),
        }
    }
}

/// Dynamic rendering request
#[derive(Debug, Clone)]
pub struct RenderingInfo {
    /// Rendered area
    pub render_area: vk::Rect2D,
    /// Color attachments
    pub color_attachments: Vec<RenderingAttachmentInfo>,
    /// Depth attachment
    pub depth_attachment: Option<RenderingAttachmentInfo>,
}

/// Recorder creation parameters
#[derive(Debug, Clone, Default)]
pub struct CommandRecorderInfo {
    /// Debug name
    pub name: String,
}

impl CommandRecorderInfo {
    /// Recorder with a debug name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Lifecycle of recorded commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    /// Accepting commands
    Recording,
    /// Finalized and ready to submit
    Executable,
    /// Submitted; in flight until the timeline reaches the value
    Submitted(u64),
    /// The GPU has passed the value of the last submission
    Retired(u64),
}

/// Records commands into a native command buffer
pub struct CommandRecorder {
    device: Device,
    command_buffer: vk::CommandBuffer,
    state: CommandListState,
    queued_barriers: BarrierBatch,
    references: HashSet<ResourceKey>,
    name: String,
}

impl CommandRecorder {
    pub(crate) fn new(device: &Device, info: &CommandRecorderInfo) -> GpuResult<Self> {
        let backend = device.backend();
        let command_buffer = backend.begin_command_buffer().map_err(GpuError::from_vk)?;
        if !info.name.is_empty() {
            backend.set_debug_name(
                vk::ObjectType::COMMAND_BUFFER,
                vk::Handle::as_raw(command_buffer),
                &info.name,
            );
        }
        log::trace!("Begin recording '{}'", info.name);

        Ok(Self {
            device: device.clone(),
            command_buffer,
            state: CommandListState::Recording,
            queued_barriers: BarrierBatch::default(),
            references: HashSet::new(),
            name: info.name.clone(),
        })
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Recording` until [`finalize`](Self::finalize) succeeds, `Executable` after
    pub const fn state(&self) -> CommandListState {
        self.state
    }

    /// Number of barriers waiting to be flushed
    pub fn queued_barrier_count(&self) -> usize {
        self.queued_barriers.len()
    }

    fn ensure_recording(&self) -> GpuResult<()> {
        match self.state {
            CommandListState::Recording => Ok(()),
            _ => Err(GpuError::RecorderFinalized { name: self.name.clone() }),
        }
    }

    /// Resolve a handle under the registry lock and reference it once per recorder
    fn use_resource<T>(
        &mut self,
        key: ResourceKey,
        resource_type: ResourceType,
        resolve: impl FnOnce(&ResourceRegistry) -> GpuResult<T>,
    ) -> GpuResult<T> {
        let mut registry = self.device.registry();
        let value = resolve(&registry)?;
        if !self.references.contains(&key) {
            registry.add_reference(key, resource_type)?;
            self.references.insert(key);
        }
        Ok(value)
    }

    fn use_image(&mut self, image: ImageId) -> GpuResult<(vk::Image, vk::ImageSubresourceRange, vk::Extent3D)> {
        self.use_resource(image.key(), ResourceType::Image, |registry| {
            registry.image(image).map(|(native, info)| (native, info.full_range(), info.extent))
        })
    }

    fn use_buffer(&mut self, buffer: BufferId) -> GpuResult<vk::Buffer> {
        self.use_resource(buffer.key(), ResourceType::Buffer, |registry| {
            registry.buffer(buffer).map(|(native, _)| native)
        })
    }

    fn use_attachment(&mut self, attachment: &RenderingAttachmentInfo) -> GpuResult<NativeAttachment> {
        let view = attachment.view;
        let native = self.use_resource(view.key(), ResourceType::ImageView, |registry| {
            registry.image_view(view).map(|(native, _, _)| native)
        })?;
        Ok(NativeAttachment {
            view: native,
            layout: attachment.layout,
            load_op: attachment.load_op,
            store_op: attachment.store_op,
            clear: attachment.clear,
        })
    }

    fn encode(&self, command: &Command) {
        self.device.backend().encode(self.command_buffer, command);
    }

    fn flush_barriers(&mut self) {
        if self.queued_barriers.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.queued_barriers);
        self.encode(&Command::PipelineBarrier(batch));
    }

    /// Flush queued barriers, then record `command`
    fn record_work(&mut self, command: &Command) {
        self.flush_barriers();
        self.encode(command);
    }

    /// Queue a global memory barrier
    pub fn queue_memory_barrier(&mut self, src: Access, dst: Access) -> GpuResult<()> {
        self.ensure_recording()?;
        self.queued_barriers.add_stages(src, dst);
        self.queued_barriers.memory.push(NativeMemoryBarrier {
            src_access: src.access,
            dst_access: dst.access,
        });
        Ok(())
    }

    /// Queue an image barrier, usually a layout transition
    pub fn queue_image_barrier(&mut self, info: &ImageBarrierInfo) -> GpuResult<()> {
        self.ensure_recording()?;
        let (image, full_range, _) = self.use_image(info.image)?;
        self.queued_barriers.add_stages(info.src, info.dst);
        self.queued_barriers.images.push(NativeImageBarrier {
            image,
            src_access: info.src.access,
            dst_access: info.dst.access,
            old_layout: info.old_layout,
            new_layout: info.new_layout,
            range: info.range.unwrap_or(full_range),
        });
        Ok(())
    }

    /// Queue a buffer barrier
    pub fn queue_buffer_barrier(&mut self, info: &BufferBarrierInfo) -> GpuResult<()> {
        self.ensure_recording()?;
        let buffer = self.use_buffer(info.buffer)?;
        self.queued_barriers.add_stages(info.src, info.dst);
        self.queued_barriers.buffers.push(NativeBufferBarrier {
            buffer,
            src_access: info.src.access,
            dst_access: info.dst.access,
            offset: info.offset,
            size: info.size,
        });
        Ok(())
    }

    /// Flush every queued barrier as one native barrier call
    pub fn insert_queued_barriers(&mut self) -> GpuResult<()> {
        self.ensure_recording()?;
        self.flush_barriers();
        Ok(())
    }

    /// Clear a color image
    pub fn clear_image(&mut self, info: &ImageClearInfo) -> GpuResult<()> {
        self.ensure_recording()?;
        let (image, full_range, _) = self.use_image(info.image)?;
        self.record_work(&Command::ClearColorImage {
            image,
            layout: info.layout,
            color: info.color,
            range: info.range.unwrap_or(full_range),
        });
        Ok(())
    }

    /// Copy a byte range between buffers
    pub fn copy_buffer_to_buffer(&mut self, info: &BufferCopyInfo) -> GpuResult<()> {
        self.ensure_recording()?;
        let src = self.use_buffer(info.src)?;
        let dst = self.use_buffer(info.dst)?;
        self.record_work(&Command::CopyBuffer {
            src,
            dst,
            region: vk::BufferCopy {
                src_offset: info.src_offset,
                dst_offset: info.dst_offset,
                size: info.size,
            },
        });
        Ok(())
    }

    /// Copy tightly packed buffer data into an image
    pub fn copy_buffer_to_image(&mut self, info: &BufferImageCopyInfo) -> GpuResult<()> {
        self.ensure_recording()?;
        let (image, mip_level) = (info.image, info.mip_level);
        let (dst, range, extent) = self.use_resource(image.key(), ResourceType::Image, |registry| {
            let (native, image_info) = registry.image(image)?;
            if mip_level >= image_info.mip_level_count {
                return Err(GpuError::InvalidSubresource {
                    mip_level,
                    mip_level_count: image_info.mip_level_count,
                });
            }
            Ok((native, image_info.full_range(), image_info.extent))
        })?;
        let src = self.use_buffer(info.buffer)?;
        let level_extent = mip_extent(extent, mip_level);
        self.record_work(&Command::CopyBufferToImage {
            src,
            dst,
            dst_layout: info.image_layout,
            region: vk::BufferImageCopy {
                buffer_offset: info.buffer_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: range.aspect_mask,
                    mip_level: info.mip_level,
                    base_array_layer: 0,
                    layer_count: range.layer_count,
                },
                image_offset: info.image_offset,
                image_extent: info.image_extent.unwrap_or(level_extent),
            },
        });
        Ok(())
    }

    /// Scaled copy between images
    pub fn blit_image(&mut self, info: &ImageBlitInfo) -> GpuResult<()> {
        self.ensure_recording()?;
        let (src, src_range, src_extent) = self.use_image(info.src)?;
        let (dst, dst_range, dst_extent) = self.use_image(info.dst)?;
        self.record_work(&Command::BlitImage {
            src,
            src_layout: info.src_layout,
            dst,
            dst_layout: info.dst_layout,
            region: vk::ImageBlit {
                src_subresource: base_layers(src_range),
                src_offsets: info.src_offsets.unwrap_or_else(|| full_offsets(src_extent)),
                dst_subresource: base_layers(dst_range),
                dst_offsets: info.dst_offsets.unwrap_or_else(|| full_offsets(dst_extent)),
            },
            filter: info.filter,
        });
        Ok(())
    }

    /// Bind a pipeline created by the pipeline layer
    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) -> GpuResult<()> {
        self.ensure_recording()?;
        self.encode(&Command::BindPipeline { bind_point, pipeline });
        Ok(())
    }

    /// Bind the global bindless descriptor set at set 0
    pub fn bind_bindless_table(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
    ) -> GpuResult<()> {
        self.ensure_recording()?;
        self.encode(&Command::BindBindlessTable { bind_point, layout });
        Ok(())
    }

    /// Upload a plain-data value as push constants
    pub fn push_constant<T: bytemuck::Pod>(
        &mut self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        value: &T,
    ) -> GpuResult<()> {
        self.ensure_recording()?;
        self.encode(&Command::PushConstants {
            layout,
            stages,
            offset,
            bytes: bytemuck::bytes_of(value).to_vec(),
        });
        Ok(())
    }

    /// Compute dispatch
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> GpuResult<()> {
        self.ensure_recording()?;
        self.record_work(&Command::Dispatch { x, y, z });
        Ok(())
    }

    /// Begin dynamic rendering into the given attachments
    pub fn begin_rendering(&mut self, info: &RenderingInfo) -> GpuResult<()> {
        self.ensure_recording()?;
        let colors = info
            .color_attachments
            .iter()
            .map(|attachment| self.use_attachment(attachment))
            .collect::<GpuResult<Vec<_>>>()?;
        let depth = info
            .depth_attachment
            .as_ref()
            .map(|attachment| self.use_attachment(attachment))
            .transpose()?;
        self.record_work(&Command::BeginRendering {
            colors,
            depth,
            render_area: info.render_area,
        });
        Ok(())
    }

    /// End dynamic rendering
    pub fn end_rendering(&mut self) -> GpuResult<()> {
        self.ensure_recording()?;
        self.encode(&Command::EndRendering);
        Ok(())
    }

    /// Set the viewport
    pub fn set_viewport(&mut self, viewport: vk::Viewport) -> GpuResult<()> {
        self.ensure_recording()?;
        self.encode(&Command::SetViewport(viewport));
        Ok(())
    }

    /// Set the scissor rectangle
    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> GpuResult<()> {
        self.ensure_recording()?;
        self.encode(&Command::SetScissor(scissor));
        Ok(())
    }

    /// Non-indexed draw
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> GpuResult<()> {
        self.ensure_recording()?;
        self.record_work(&Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        Ok(())
    }

    /// Close recording and produce the executable list
    ///
    /// Remaining queued barriers are flushed first. Afterwards every mutating
    /// call on this recorder fails with [`GpuError::RecorderFinalized`].
    pub fn finalize(&mut self) -> GpuResult<ExecutableCommandList> {
        self.ensure_recording()?;
        self.flush_barriers();
        self.device
            .backend()
            .end_command_buffer(self.command_buffer)
            .map_err(GpuError::from_vk)?;

        self.state = CommandListState::Executable;
        let command_buffer = std::mem::replace(&mut self.command_buffer, vk::CommandBuffer::null());
        let references: Vec<ResourceKey> = self.references.drain().collect();
        log::trace!("Finalized '{}' ({} resources referenced)", self.name, references.len());

        Ok(ExecutableCommandList {
            inner: Arc::new(CommandListInner {
                backend: Arc::clone(self.device.backend()),
                device: self.device.downgrade(),
                command_buffer,
                references,
                state: Mutex::new(CommandListState::Executable),
                name: self.name.clone(),
            }),
        })
    }
}

impl fmt::Debug for CommandRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("queued_barriers", &self.queued_barriers.len())
            .field("references", &self.references.len())
            .finish()
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        if self.command_buffer == vk::CommandBuffer::null() {
            return;
        }
        // Abandoned before finalize: nothing was submitted
        {
            let mut registry = self.device.registry();
            for key in self.references.drain() {
                registry.release_reference(key);
            }
        }
        self.device.backend().free_command_buffer(self.command_buffer);
    }
}

pub(crate) struct CommandListInner {
    backend: Arc<dyn DeviceBackend>,
    device: Weak<DeviceShared>,
    command_buffer: vk::CommandBuffer,
    references: Vec<ResourceKey>,
    state: Mutex<CommandListState>,
    name: String,
}

impl Drop for CommandListInner {
    fn drop(&mut self) {
        if let Some(shared) = self.device.upgrade() {
            let mut registry = shared.registry();
            for key in &self.references {
                registry.release_reference(*key);
            }
        }
        self.backend.free_command_buffer(self.command_buffer);
    }
}

/// Finalized, immutable commands ready for submission
///
/// Cloning is cheap and shares the same native command buffer. The
/// resources it references stay registered until every clone is dropped.
#[derive(Clone)]
pub struct ExecutableCommandList {
    inner: Arc<CommandListInner>,
}

impl ExecutableCommandList {
    /// Debug name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> CommandListState {
        *lock(&self.inner.state)
    }

    /// Number of distinct resources this list keeps alive
    pub fn referenced_resource_count(&self) -> usize {
        self.inner.references.len()
    }

    pub(crate) fn command_buffer(&self) -> vk::CommandBuffer {
        self.inner.command_buffer
    }

    pub(crate) fn references(&self) -> &[ResourceKey] {
        &self.inner.references
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_state(&self, state: CommandListState) {
        *lock(&self.inner.state) = state;
    }

    /// Mark retired unless a later submission took over
    pub(crate) fn retire(&self, timeline_value: u64) -> bool {
        let mut state = lock(&self.inner.state);
        if *state == CommandListState::Submitted(timeline_value) {
            *state = CommandListState::Retired(timeline_value);
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for ExecutableCommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableCommandList")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("references", &self.inner.references.len())
            .finish()
    }
}

fn mip_extent(extent: vk::Extent3D, level: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width.checked_shr(level).unwrap_or(0).max(1),
        height: extent.height.checked_shr(level).unwrap_or(0).max(1),
        depth: extent.depth.checked_shr(level).unwrap_or(0).max(1),
    }
}

fn base_layers(range: vk::ImageSubresourceRange) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: range.aspect_mask,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: range.layer_count,
    }
}

fn full_offsets(extent: vk::Extent3D) -> [vk::Offset3D; 2] {
    let clamp = |value: u32| i32::try_from(value).unwrap_or(i32::MAX);
    [
        vk::Offset3D { x: 0, y: 0, z: 0 },
        vk::Offset3D {
            x: clamp(extent.width),
            y: clamp(extent.height),
            z: clamp(extent.depth),
        },
    ]
}
