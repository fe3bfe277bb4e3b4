//! Recorder barrier batching, finalization and reference tracking

use ash::vk;

use super::{create_test_buffer, create_test_image, headless_device};
use crate::command::{
    BufferBarrierInfo, BufferImageCopyInfo, Command, CommandListState, CommandRecorderInfo, ImageBarrierInfo,
    ImageClearInfo, RenderingAttachmentInfo, RenderingInfo,
};
use crate::device::SubmitInfo;
use crate::error::GpuError;
use crate::resource::ImageViewInfo;
use crate::sync::Access;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DrawConstants {
    image_index: u32,
    buffer_index: u32,
    scale: [f32; 2],
}

fn recorded_commands(backend: &crate::backend::HeadlessBackend) -> Vec<Command> {
    backend
        .submissions()
        .pop()
        .expect("Should have a submission")
        .commands
        .into_iter()
        .next()
        .expect("Should have one command buffer")
}

#[test]
fn test_queued_barriers_flush_once_before_work() {
    let (backend, device) = headless_device();
    let image = create_test_image(&device, "image");
    let buffer = create_test_buffer(&device, "buffer");

    let mut recorder = device
        .create_command_recorder(&CommandRecorderInfo::new("batched"))
        .expect("Should create recorder");
    recorder
        .queue_image_barrier(&ImageBarrierInfo::transition(
            image,
            Access::none(),
            Access::transfer_write(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ))
        .expect("Should queue");
    recorder
        .queue_buffer_barrier(&BufferBarrierInfo {
            buffer,
            src: Access::host_write(),
            dst: Access::transfer_read(),
            offset: 0,
            size: vk::WHOLE_SIZE,
        })
        .expect("Should queue");
    recorder
        .queue_memory_barrier(Access::compute_shader_write(), Access::transfer_read())
        .expect("Should queue");
    assert_eq!(recorder.queued_barrier_count(), 3);

    recorder
        .copy_buffer_to_image(&BufferImageCopyInfo {
            buffer,
            buffer_offset: 0,
            image,
            image_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            mip_level: 0,
            image_offset: vk::Offset3D::default(),
            image_extent: None,
        })
        .expect("Should copy");
    assert_eq!(recorder.queued_barrier_count(), 0);
    recorder
        .clear_image(&ImageClearInfo::new(image, [1.0; 4]))
        .expect("Should clear");

    let list = recorder.finalize().expect("Should finalize");
    assert_eq!(list.referenced_resource_count(), 2);
    device.submit_commands(&SubmitInfo::new(&[list])).expect("Should submit");

    let commands = recorded_commands(&backend);
    assert_eq!(commands.len(), 3);
    match &commands[0] {
        Command::PipelineBarrier(batch) => {
            assert_eq!(batch.len(), 3);
            assert_eq!(
                batch.src_stages,
                vk::PipelineStageFlags::HOST | vk::PipelineStageFlags::COMPUTE_SHADER
            );
            assert_eq!(batch.dst_stages, vk::PipelineStageFlags::TRANSFER);
        }
        other => panic!("Expected one batched barrier first, got {other:?}"),
    }
    match &commands[1] {
        Command::CopyBufferToImage { region, .. } => {
            assert_eq!((region.image_extent.width, region.image_extent.height), (64, 64));
        }
        other => panic!("Expected the copy, got {other:?}"),
    }
    assert!(matches!(commands[2], Command::ClearColorImage { .. }));
}

#[test]
fn test_finalize_flushes_trailing_barriers() {
    let (backend, device) = headless_device();
    let image = create_test_image(&device, "image");

    let mut recorder = device
        .create_command_recorder(&CommandRecorderInfo::new("trailing"))
        .expect("Should create recorder");
    recorder
        .queue_image_barrier(&ImageBarrierInfo::transition(
            image,
            Access::transfer_write(),
            Access::fragment_shader_read(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ))
        .expect("Should queue");
    let list = recorder.finalize().expect("Should finalize");
    device.submit_commands(&SubmitInfo::new(&[list])).expect("Should submit");

    let commands = recorded_commands(&backend);
    assert_eq!(commands.len(), 1);
    assert!(matches!(&commands[0], Command::PipelineBarrier(batch) if batch.images.len() == 1));
}

#[test]
fn test_finalized_recorder_rejects_everything() {
    let (_backend, device) = headless_device();
    let image = create_test_image(&device, "image");
    let mut recorder = device
        .create_command_recorder(&CommandRecorderInfo::new("closed"))
        .expect("Should create recorder");
    let list = recorder.finalize().expect("Should finalize");
    assert_eq!(recorder.state(), CommandListState::Executable);
    assert_eq!(list.state(), CommandListState::Executable);

    assert!(matches!(
        recorder.clear_image(&ImageClearInfo::new(image, [0.0; 4])),
        Err(GpuError::RecorderFinalized { .. })
    ));
    assert!(matches!(recorder.dispatch(1, 1, 1), Err(GpuError::RecorderFinalized { .. })));
    assert!(matches!(
        recorder.queue_memory_barrier(Access::all(), Access::all()),
        Err(GpuError::RecorderFinalized { .. })
    ));
    let error = recorder.finalize().expect_err("Should not finalize twice");
    assert!(matches!(error, GpuError::RecorderFinalized { ref name } if name == "closed"));
    assert!(error.is_usage_error());
}

#[test]
fn test_abandoned_recorder_releases_references() {
    let (backend, device) = headless_device();
    let image = create_test_image(&device, "image");
    let mut recorder = device
        .create_command_recorder(&CommandRecorderInfo::new("abandoned"))
        .expect("Should create recorder");
    recorder
        .clear_image(&ImageClearInfo::new(image, [0.0; 4]))
        .expect("Should clear");
    drop(recorder);
    assert_eq!(backend.live_command_buffer_count(), 0);

    device.destroy_image(image).expect("Should destroy");
    let report = device.collect_garbage().expect("Should collect");
    assert_eq!(report.freed_objects, 1);
}

#[test]
fn test_dead_handle_is_rejected_while_recording() {
    let (_backend, device) = headless_device();
    let image = create_test_image(&device, "image");
    device.destroy_image(image).expect("Should destroy");

    let mut recorder = device
        .create_command_recorder(&CommandRecorderInfo::new("stale"))
        .expect("Should create recorder");
    let error = recorder
        .queue_image_barrier(&ImageBarrierInfo::transition(
            image,
            Access::none(),
            Access::transfer_write(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ))
        .expect_err("Should reject destroyed image");
    assert!(matches!(error, GpuError::InvalidHandle { kind: "image" }));
    assert_eq!(recorder.queued_barrier_count(), 0);
}

#[test]
fn test_rendering_pass_records_in_order() {
    let (backend, device) = headless_device();
    let target = device
        .create_image(&crate::resource::ImageInfo {
            extent: vk::Extent3D {
                width: 128,
                height: 128,
                depth: 1,
            },
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            name: "color target".to_string(),
            ..crate::resource::ImageInfo::default()
        })
        .expect("Should create target");
    let view = device
        .create_image_view(&ImageViewInfo::new(target))
        .expect("Should create view");
    let area = vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent: vk::Extent2D {
            width: 128,
            height: 128,
        },
    };

    let mut recorder = device
        .create_command_recorder(&CommandRecorderInfo::new("pass"))
        .expect("Should create recorder");
    recorder
        .queue_image_barrier(&ImageBarrierInfo::transition(
            target,
            Access::none(),
            Access::color_attachment_write(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ))
        .expect("Should queue");
    recorder
        .begin_rendering(&RenderingInfo {
            render_area: area,
            color_attachments: vec![RenderingAttachmentInfo::cleared(view, [0.1, 0.2, 0.3, 1.0])],
            depth_attachment: None,
        })
        .expect("Should begin");
    recorder
        .bind_bindless_table(vk::PipelineBindPoint::GRAPHICS, vk::PipelineLayout::null())
        .expect("Should bind");
    let constants = DrawConstants {
        image_index: device.bindless_index(view).expect("Should have index"),
        buffer_index: 0,
        scale: [1.0, 1.0],
    };
    recorder
        .push_constant(
            vk::PipelineLayout::null(),
            vk::ShaderStageFlags::ALL_GRAPHICS,
            0,
            &constants,
        )
        .expect("Should push");
    recorder.set_scissor(area).expect("Should set scissor");
    recorder.draw(3, 1, 0, 0).expect("Should draw");
    recorder.end_rendering().expect("Should end");
    let list = recorder.finalize().expect("Should finalize");
    assert_eq!(list.referenced_resource_count(), 2);
    device.submit_commands(&SubmitInfo::new(&[list])).expect("Should submit");

    let commands = recorded_commands(&backend);
    assert!(matches!(commands[0], Command::PipelineBarrier(_)));
    assert!(matches!(&commands[1], Command::BeginRendering { colors, depth: None, .. } if colors.len() == 1));
    assert!(matches!(commands[2], Command::BindBindlessTable { .. }));
    match &commands[3] {
        Command::PushConstants { bytes, .. } => assert_eq!(bytes.len(), std::mem::size_of::<DrawConstants>()),
        other => panic!("Expected push constants, got {other:?}"),
    }
    assert!(matches!(commands[4], Command::SetScissor(_)));
    assert!(matches!(commands[5], Command::Draw { vertex_count: 3, .. }));
    assert!(matches!(commands[6], Command::EndRendering));
}

#[test]
fn test_copy_to_missing_mip_level_is_rejected() {
    let (backend, device) = headless_device();
    let image = create_test_image(&device, "single level");
    let buffer = create_test_buffer(&device, "staging");

    let mut recorder = device
        .create_command_recorder(&CommandRecorderInfo::new("mips"))
        .expect("Should create recorder");
    let copy = |mip_level| BufferImageCopyInfo {
        buffer,
        buffer_offset: 0,
        image,
        image_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        mip_level,
        image_offset: vk::Offset3D::default(),
        image_extent: None,
    };
    for mip_level in [1, 32, 40] {
        let error = recorder
            .copy_buffer_to_image(&copy(mip_level))
            .expect_err("Should reject mip level");
        assert!(matches!(
            error,
            GpuError::InvalidSubresource { mip_level: level, mip_level_count: 1 } if level == mip_level
        ));
        assert!(error.is_usage_error());
    }
    assert_eq!(recorder.state(), CommandListState::Recording);

    let mipped = device
        .create_image(&crate::resource::ImageInfo {
            extent: vk::Extent3D {
                width: 64,
                height: 32,
                depth: 1,
            },
            mip_level_count: 4,
            name: "mipped".to_string(),
            ..crate::resource::ImageInfo::default()
        })
        .expect("Should create mipped image");
    recorder
        .copy_buffer_to_image(&BufferImageCopyInfo {
            image: mipped,
            mip_level: 3,
            ..copy(0)
        })
        .expect("Should copy into the last level");
    let list = recorder.finalize().expect("Should finalize");
    device.submit_commands(&SubmitInfo::new(&[list])).expect("Should submit");

    let commands = recorded_commands(&backend);
    assert_eq!(commands.len(), 1);
    match &commands[0] {
        Command::CopyBufferToImage { region, .. } => {
            assert_eq!(region.image_subresource.mip_level, 3);
            assert_eq!((region.image_extent.width, region.image_extent.height), (8, 4));
        }
        other => panic!("Expected the copy, got {other:?}"),
    }
}
