//! Frame ring bounds and the acquire/submit/present loop

use ash::vk;
use std::time::Duration;

use super::{create_test_image, create_test_swapchain, headless_device, headless_device_with, record_clear};
use crate::command::{CommandRecorderInfo, ImageBarrierInfo};
use crate::config::{ConfigError, DeviceConfig};
use crate::error::GpuError;
use crate::frame::{FramePacer, FrameSubmitInfo, MAX_FRAME_SLOTS};
use crate::sync::Access;

#[test]
fn test_slot_count_bounds() {
    let (_backend, device) = headless_device();
    for count in [0, MAX_FRAME_SLOTS + 1] {
        let error = FramePacer::new(&device, count).expect_err("Should reject slot count");
        assert!(matches!(error, GpuError::Config(ConfigError::Invalid(_))));
    }
    let pacer = FramePacer::from_config(&device).expect("Should create from config");
    assert_eq!(pacer.slot_count(), device.config().max_frames_in_flight);
}

#[test]
fn test_frames_in_flight_never_exceed_slot_count() {
    let config = DeviceConfig::new("pacing").with_frame_wait_timeout(Duration::from_millis(1));
    let (backend, device) = headless_device_with(config);
    let image = create_test_image(&device, "target");
    let mut pacer = FramePacer::new(&device, 2).expect("Should create pacer");

    backend.set_stalled(true);
    for frame in 0..2 {
        let list = record_clear(&device, image, &format!("frame {frame}"));
        pacer.submit(&FrameSubmitInfo::new(&[list])).expect("Should submit");
        pacer.advance();
        assert!(pacer.frames_in_flight().expect("Should query") <= 2);
    }
    assert_eq!(pacer.frames_in_flight().expect("Should query"), 2);

    // The GPU is stuck on frame 0, so its slot cannot be reused
    let list = record_clear(&device, image, "frame 2");
    let error = pacer
        .submit(&FrameSubmitInfo::new(&[list.clone()]))
        .expect_err("Should time out waiting for the slot");
    assert!(matches!(error, GpuError::Timeout { value: 1 }));
    assert_eq!(device.highest_issued_value(), 2);
    assert_eq!(pacer.frames_in_flight().expect("Should query"), 2);

    backend.set_stalled(false);
    let value = pacer.submit(&FrameSubmitInfo::new(&[list])).expect("Should submit");
    assert_eq!(value, 3);
    assert!(device.completed_value().expect("Should query") >= 1);
    assert!(pacer.frames_in_flight().expect("Should query") <= 2);
}

#[test]
fn test_slot_reuse_waits_for_previous_submission() {
    let (_backend, device) = headless_device();
    let image = create_test_image(&device, "target");
    let mut pacer = FramePacer::new(&device, 2).expect("Should create pacer");

    let mut values = Vec::new();
    for frame in 0..6 {
        let list = record_clear(&device, image, &format!("frame {frame}"));
        values.push(pacer.submit(&FrameSubmitInfo::new(&[list])).expect("Should submit"));
        pacer.advance();

        // Submitting frame N waited for frame N - 2
        if frame >= 2 {
            assert!(device.completed_value().expect("Should query") >= values[frame - 2]);
        }
    }
    assert_eq!(values, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(pacer.current_index(), 0);
}

#[test]
fn test_present_waits_on_slot_semaphore() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);
    let mut pacer = FramePacer::new(&device, 2).expect("Should create pacer");

    for _ in 0..3 {
        let frame = swapchain.acquire_next_image().expect("Should acquire");
        let mut recorder = device
            .create_command_recorder(&CommandRecorderInfo::new("frame"))
            .expect("Should create recorder");
        recorder
            .queue_image_barrier(&ImageBarrierInfo::transition(
                frame.image(),
                Access::none(),
                Access::present(),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ))
            .expect("Should queue barrier");
        let list = recorder.finalize().expect("Should finalize");

        pacer.submit(&FrameSubmitInfo::new(&[list])).expect("Should submit");
        let signal = pacer.present_signal().raw();
        device
            .present_frame(&mut swapchain, frame, &[pacer.present_signal()])
            .expect("Should present");
        pacer.advance();

        let submission = backend.submissions().pop().expect("Should have a submission");
        assert_eq!(submission.signal_semaphores, vec![signal]);
        let present = backend.presents().pop().expect("Should have a present");
        assert_eq!(present.wait_semaphores, vec![signal]);
    }

    let slot_signals: Vec<_> = backend
        .presents()
        .iter()
        .map(|present| present.wait_semaphores[0])
        .collect();
    assert_ne!(slot_signals[0], slot_signals[1]);
    assert_eq!(slot_signals[0], slot_signals[2]);
}
