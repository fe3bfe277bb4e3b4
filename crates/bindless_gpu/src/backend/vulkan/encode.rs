//! Translate recorded commands into `vkCmd*` calls

use ash::{vk, Device};

use crate::command::{BarrierBatch, Command, NativeAttachment};

fn barrier(device: &Device, command_buffer: vk::CommandBuffer, batch: &BarrierBatch) {
    let memory: Vec<vk::MemoryBarrier> = batch
        .memory
        .iter()
        .map(|barrier| {
            vk::MemoryBarrier::builder()
                .src_access_mask(barrier.src_access)
                .dst_access_mask(barrier.dst_access)
                .build()
        })
        .collect();
    let buffers: Vec<vk::BufferMemoryBarrier> = batch
        .buffers
        .iter()
        .map(|barrier| {
            vk::BufferMemoryBarrier::builder()
                .buffer(barrier.buffer)
                .src_access_mask(barrier.src_access)
                .dst_access_mask(barrier.dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .offset(barrier.offset)
                .size(barrier.size)
                .build()
        })
        .collect();
    let images: Vec<vk::ImageMemoryBarrier> = batch
        .images
        .iter()
        .map(|barrier| {
            vk::ImageMemoryBarrier::builder()
                .image(barrier.image)
                .src_access_mask(barrier.src_access)
                .dst_access_mask(barrier.dst_access)
                .old_layout(barrier.old_layout)
                .new_layout(barrier.new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(barrier.range)
                .build()
        })
        .collect();

    let (src_stages, dst_stages) = batch.resolved_stages();
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            src_stages,
            dst_stages,
            vk::DependencyFlags::empty(),
            &memory,
            &buffers,
            &images,
        );
    }
}

fn attachment(attachment: &NativeAttachment) -> vk::RenderingAttachmentInfo {
    vk::RenderingAttachmentInfo::builder()
        .image_view(attachment.view)
        .image_layout(attachment.layout)
        .load_op(attachment.load_op)
        .store_op(attachment.store_op)
        .clear_value(attachment.clear.to_vk())
        .build()
}

/// Record `command`; `bindless_set` is bound for [`Command::BindBindlessTable`]
pub fn encode(device: &Device, command_buffer: vk::CommandBuffer, bindless_set: vk::DescriptorSet, command: &Command) {
    unsafe {
        match command {
            Command::PipelineBarrier(batch) => barrier(device, command_buffer, batch),
            Command::ClearColorImage {
                image,
                layout,
                color,
                range,
            } => {
                let clear = vk::ClearColorValue { float32: *color };
                device.cmd_clear_color_image(command_buffer, *image, *layout, &clear, std::slice::from_ref(range));
            }
            Command::CopyBuffer { src, dst, region } => {
                device.cmd_copy_buffer(command_buffer, *src, *dst, std::slice::from_ref(region));
            }
            Command::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                region,
            } => {
                device.cmd_copy_buffer_to_image(command_buffer, *src, *dst, *dst_layout, std::slice::from_ref(region));
            }
            Command::BlitImage {
                src,
                src_layout,
                dst,
                dst_layout,
                region,
                filter,
            } => {
                device.cmd_blit_image(
                    command_buffer,
                    *src,
                    *src_layout,
                    *dst,
                    *dst_layout,
                    std::slice::from_ref(region),
                    *filter,
                );
            }
            Command::BindPipeline { bind_point, pipeline } => {
                device.cmd_bind_pipeline(command_buffer, *bind_point, *pipeline);
            }
            Command::BindBindlessTable { bind_point, layout } => {
                device.cmd_bind_descriptor_sets(command_buffer, *bind_point, *layout, 0, &[bindless_set], &[]);
            }
            Command::PushConstants {
                layout,
                stages,
                offset,
                bytes,
            } => {
                device.cmd_push_constants(command_buffer, *layout, *stages, *offset, bytes);
            }
            Command::Dispatch { x, y, z } => device.cmd_dispatch(command_buffer, *x, *y, *z),
            Command::BeginRendering {
                colors,
                depth,
                render_area,
            } => {
                let color_attachments: Vec<vk::RenderingAttachmentInfo> = colors.iter().map(attachment).collect();
                let depth_attachment = depth.as_ref().map(attachment);
                let mut info = vk::RenderingInfo::builder()
                    .render_area(*render_area)
                    .layer_count(1)
                    .color_attachments(&color_attachments);
                if let Some(depth_attachment) = depth_attachment.as_ref() {
                    info = info.depth_attachment(depth_attachment);
                }
                device.cmd_begin_rendering(command_buffer, &info);
            }
            Command::EndRendering => device.cmd_end_rendering(command_buffer),
            Command::SetViewport(viewport) => {
                device.cmd_set_viewport(command_buffer, 0, std::slice::from_ref(viewport));
            }
            Command::SetScissor(scissor) => {
                device.cmd_set_scissor(command_buffer, 0, std::slice::from_ref(scissor));
            }
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                device.cmd_draw(command_buffer, *vertex_count, *instance_count, *first_vertex, *first_instance);
            }
        }
    }
}
