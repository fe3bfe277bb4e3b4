//! Swapchain acquire, present, resize and surface loss

use ash::vk;
use raw_window_handle::{
    HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle, XlibDisplayHandle, XlibWindowHandle,
};

use super::{create_test_swapchain, headless_device, record_clear};
use crate::backend::{HeadlessFaults, NativeObject};
use crate::device::SubmitInfo;
use crate::error::GpuError;
use crate::swapchain::{SwapchainInfo, SwapchainState};

struct DummyWindow;

unsafe impl HasRawWindowHandle for DummyWindow {
    fn raw_window_handle(&self) -> RawWindowHandle {
        RawWindowHandle::Xlib(XlibWindowHandle::empty())
    }
}

unsafe impl HasRawDisplayHandle for DummyWindow {
    fn raw_display_handle(&self) -> RawDisplayHandle {
        RawDisplayHandle::Xlib(XlibDisplayHandle::empty())
    }
}

#[test]
fn test_swapchain_from_window_surface() {
    let (_backend, device) = headless_device();
    let surface = device.create_surface(&DummyWindow).expect("Should create surface");

    let swapchain = device
        .create_swapchain(SwapchainInfo::new(surface, 800, 600))
        .expect("Should create swapchain");
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 800, height: 600 });
    assert_eq!(swapchain.format(), vk::Format::B8G8R8A8_SRGB);
    assert_eq!(swapchain.image_count(), 3);
    assert_eq!(swapchain.state(), SwapchainState::Ready);
}

#[test]
fn test_resize_round_trip_keeps_format() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);
    let format = swapchain.format();
    let original_images = swapchain.images();

    swapchain
        .resize(vk::Extent2D { width: 1024, height: 768 })
        .expect("Should resize");
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 1024, height: 768 });
    assert_eq!(swapchain.format(), format);
    assert!(
        original_images.iter().all(|image| !device.is_alive(*image)),
        "Old presentable images should be invalid after resize"
    );

    swapchain
        .resize(vk::Extent2D { width: 800, height: 600 })
        .expect("Should resize back");
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 800, height: 600 });
    assert_eq!(swapchain.format(), format);

    device.collect_garbage().expect("Should collect");
    let retired_swapchains = backend
        .destroyed()
        .iter()
        .filter(|record| matches!(record.object, NativeObject::Swapchain(_)))
        .count();
    assert_eq!(retired_swapchains, 2, "Both replaced swapchains should be destroyed");
}

#[test]
fn test_zero_extent_resize_is_rejected() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);
    let images = swapchain.images();

    let error = swapchain
        .resize(vk::Extent2D { width: 0, height: 0 })
        .expect_err("Should reject zero extent");
    assert!(matches!(error, GpuError::InvalidExtent { width: 0, height: 0 }));

    assert_eq!(swapchain.extent(), vk::Extent2D { width: 800, height: 600 });
    assert_eq!(swapchain.images(), images);
    assert_eq!(swapchain.state(), SwapchainState::Ready);
    swapchain.acquire_next_image().expect("Should still acquire");
}

#[test]
fn test_second_acquire_before_present_is_rejected() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);

    let image = swapchain.acquire_next_image().expect("Should acquire");
    let index = image.index();
    assert_eq!(swapchain.state(), SwapchainState::Acquired(index));

    let error = swapchain.acquire_next_image().expect_err("Should reject second acquire");
    assert!(matches!(error, GpuError::AcquireOutOfOrder { index: outstanding } if outstanding == index));
    assert!(error.is_usage_error());
    assert_eq!(swapchain.state(), SwapchainState::Acquired(index));

    device
        .present_frame(&mut swapchain, image, &[])
        .expect("Should present");
    let next = swapchain.acquire_next_image().expect("Should acquire after present");
    assert_ne!(next.index(), index);
}

#[test]
fn test_out_of_date_acquire_recovers_after_resize() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);

    backend.inject_faults(HeadlessFaults::OUT_OF_DATE);
    let error = swapchain.acquire_next_image().expect_err("Should be out of date");
    assert!(matches!(error, GpuError::SwapchainOutOfDate));
    assert!(error.is_recoverable());
    assert_eq!(swapchain.state(), SwapchainState::Ready);

    swapchain
        .resize(vk::Extent2D { width: 800, height: 600 })
        .expect("Should recreate");
    swapchain.acquire_next_image().expect("Should acquire after recreation");
}

#[test]
fn test_out_of_date_present_releases_image() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);
    let image = swapchain.acquire_next_image().expect("Should acquire");
    let index = image.index();

    backend.inject_faults(HeadlessFaults::OUT_OF_DATE);
    let error = device
        .present_frame(&mut swapchain, image, &[])
        .expect_err("Should be out of date");
    assert!(matches!(error, GpuError::SwapchainOutOfDate));
    assert_eq!(swapchain.state(), SwapchainState::Ready);

    let presents = backend.presents();
    assert_eq!(presents.len(), 1);
    assert_eq!(presents[0].image_index, index);
}

#[test]
fn test_surface_loss_is_terminal() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);

    backend.inject_faults(HeadlessFaults::SURFACE_LOST);
    let error = swapchain.acquire_next_image().expect_err("Should lose the surface");
    assert!(matches!(error, GpuError::SurfaceLost));
    assert!(swapchain.is_lost());

    backend.clear_faults(HeadlessFaults::SURFACE_LOST);
    assert!(matches!(swapchain.acquire_next_image(), Err(GpuError::SurfaceLost)));
    assert!(matches!(
        swapchain.resize(vk::Extent2D { width: 640, height: 480 }),
        Err(GpuError::SurfaceLost)
    ));
}

#[test]
fn test_surface_lost_during_present() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);
    let image = swapchain.acquire_next_image().expect("Should acquire");

    backend.inject_faults(HeadlessFaults::SURFACE_LOST);
    let error = device
        .present_frame(&mut swapchain, image, &[])
        .expect_err("Should lose presentation");
    assert!(matches!(error, GpuError::PresentationLost(vk::Result::ERROR_SURFACE_LOST_KHR)));
    assert_eq!(swapchain.state(), SwapchainState::Lost);
}

#[test]
fn test_image_acquired_before_resize_is_stale() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);
    let image = swapchain.acquire_next_image().expect("Should acquire");

    swapchain
        .resize(vk::Extent2D { width: 400, height: 300 })
        .expect("Should resize");
    let error = device
        .present_frame(&mut swapchain, image, &[])
        .expect_err("Should reject stale image");
    assert!(matches!(error, GpuError::StaleSwapchainImage { .. }));
    assert!(backend.presents().is_empty());
}

#[test]
fn test_no_acceptable_format() {
    let (backend, device) = headless_device();

    backend.inject_faults(HeadlessFaults::NO_FORMATS);
    let surface = backend.create_test_surface();
    let error = device
        .create_swapchain(SwapchainInfo::new(surface, 800, 600))
        .expect_err("Should find no format");
    assert!(matches!(error, GpuError::FormatUnavailable));
    backend.clear_faults(HeadlessFaults::NO_FORMATS);

    fn reject_everything(_format: vk::Format) -> i32 {
        0
    }
    let error = device
        .create_swapchain(SwapchainInfo::new(surface, 800, 600).with_format_selector(reject_everything))
        .expect_err("Selector should reject every format");
    assert!(matches!(error, GpuError::FormatUnavailable));
    device.destroy_surface(surface);
}

#[test]
fn test_unsupported_present_mode_falls_back_to_fifo() {
    let (backend, device) = headless_device();
    backend.set_present_modes(vec![vk::PresentModeKHR::FIFO]);
    let surface = backend.create_test_surface();

    let swapchain = device
        .create_swapchain(SwapchainInfo::new(surface, 800, 600).with_present_mode(vk::PresentModeKHR::MAILBOX))
        .expect("Should create swapchain");
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::FIFO);
    assert_eq!(swapchain.requested_present_mode(), vk::PresentModeKHR::MAILBOX);
}

#[test]
fn test_present_mode_change_waits_for_resize() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::FIFO);

    swapchain.set_present_mode(vk::PresentModeKHR::MAILBOX);
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::FIFO);
    assert_eq!(swapchain.requested_present_mode(), vk::PresentModeKHR::MAILBOX);

    swapchain
        .resize(vk::Extent2D { width: 800, height: 600 })
        .expect("Should recreate");
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::MAILBOX);
}

#[test]
fn test_surface_without_present_support_is_rejected() {
    let (backend, device) = headless_device();
    let surface = backend.create_test_surface();

    backend.inject_faults(HeadlessFaults::UNSUPPORTED_SURFACE);
    let error = device
        .create_swapchain(SwapchainInfo::new(surface, 800, 600))
        .expect_err("Should reject the surface");
    assert!(matches!(error, GpuError::SurfaceCreation { .. }));
    assert_eq!(device.resource_count(), 0);
    device.destroy_surface(surface);
}

#[test]
fn test_fixed_surface_extent_wins_over_request() {
    let (backend, device) = headless_device();
    backend.set_current_extent(Some(vk::Extent2D { width: 640, height: 480 }));

    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 640, height: 480 });

    backend.set_current_extent(Some(vk::Extent2D { width: 1280, height: 720 }));
    swapchain
        .resize(vk::Extent2D { width: 1, height: 1 })
        .expect("Should resize");
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 1280, height: 720 });
}

#[test]
fn test_dropped_swapchain_waits_for_issued_work() {
    let (backend, device) = headless_device();
    let surface = backend.create_test_surface();
    let swapchain = device
        .create_swapchain(SwapchainInfo::new(surface, 800, 600))
        .expect("Should create swapchain");

    let image = super::create_test_image(&device, "busy");
    let list = super::record_clear(&device, image, "busy work");
    let value = device
        .submit_commands(&crate::device::SubmitInfo::new(&[list]))
        .expect("Should submit");

    drop(swapchain);
    device.collect_garbage().expect("Should collect");
    assert!(!backend.was_destroyed(NativeObject::Surface(surface)));

    backend.complete_up_to(value);
    device.collect_garbage().expect("Should collect");
    let record = backend
        .destroyed()
        .into_iter()
        .find(|record| record.object == NativeObject::Surface(surface))
        .expect("Surface should be destroyed once the work completed");
    assert!(record.completed_value >= value);
}

#[test]
fn test_list_recorded_against_old_images_is_rejected_after_resize() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);

    let frame = swapchain.acquire_next_image().expect("Should acquire");
    let list = record_clear(&device, frame.image(), "draws into the frame");
    device
        .submit_commands(&SubmitInfo::new(&[list.clone()]))
        .expect("Should submit");
    device
        .present_frame(&mut swapchain, frame, &[])
        .expect("Should present");

    swapchain
        .resize(vk::Extent2D { width: 1024, height: 768 })
        .expect("Should resize");
    device.wait_idle().expect("Should wait");
    let retired_swapchains = backend
        .destroyed()
        .iter()
        .filter(|record| matches!(record.object, NativeObject::Swapchain(_)))
        .count();
    assert_eq!(retired_swapchains, 1);

    let submitted = backend.submissions().len();
    let error = device
        .submit_commands(&SubmitInfo::new(&[list]))
        .expect_err("Should reject a list that uses a retired swapchain image");
    assert!(matches!(error, GpuError::InvalidHandle { kind: "image" }));
    assert!(error.is_usage_error());
    assert_eq!(backend.submissions().len(), submitted);
    assert_eq!(device.in_flight_submissions(), 0);
}

#[test]
fn test_timed_out_acquire_keeps_its_image() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);

    backend.inject_faults(HeadlessFaults::FENCE_TIMEOUT);
    let error = swapchain.acquire_next_image().expect_err("Should time out");
    assert!(error.is_recoverable());
    let GpuError::AcquireTimeout { index: pending } = error else {
        panic!("Expected an acquire timeout, got {error:?}");
    };
    assert_eq!(swapchain.state(), SwapchainState::AcquirePending(pending));

    // Retrying waits on the same image rather than acquiring with a busy fence
    let error = swapchain.acquire_next_image().expect_err("Should still time out");
    assert!(matches!(error, GpuError::AcquireTimeout { index } if index == pending));
    assert_eq!(swapchain.state(), SwapchainState::AcquirePending(pending));

    backend.clear_faults(HeadlessFaults::FENCE_TIMEOUT);
    let image = swapchain.acquire_next_image().expect("Should finish the pending acquire");
    assert_eq!(image.index(), pending);
    assert_eq!(swapchain.state(), SwapchainState::Acquired(pending));

    device
        .present_frame(&mut swapchain, image, &[])
        .expect("Should present");
    let next = swapchain.acquire_next_image().expect("Should acquire with an idle fence");
    assert_ne!(next.index(), pending);
}

#[test]
fn test_resize_settles_pending_acquire() {
    let (backend, device) = headless_device();
    let mut swapchain = create_test_swapchain(&backend, &device, 800, 600);
    let images = swapchain.images();

    backend.inject_faults(HeadlessFaults::FENCE_TIMEOUT);
    swapchain.acquire_next_image().expect_err("Should time out");
    let pending = swapchain.state();
    assert!(matches!(pending, SwapchainState::AcquirePending(_)));

    let error = swapchain
        .resize(vk::Extent2D { width: 1024, height: 768 })
        .expect_err("Should not recreate while the fence is busy");
    assert!(matches!(error, GpuError::AcquireTimeout { .. }));
    assert_eq!(swapchain.state(), pending);
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 800, height: 600 });
    assert_eq!(swapchain.images(), images);

    backend.clear_faults(HeadlessFaults::FENCE_TIMEOUT);
    swapchain
        .resize(vk::Extent2D { width: 1024, height: 768 })
        .expect("Should resize once the fence signals");
    assert_eq!(swapchain.state(), SwapchainState::Ready);
    swapchain.acquire_next_image().expect("Should acquire with an idle fence");
}
