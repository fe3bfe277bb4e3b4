//! Resource lifetime across in-flight GPU work

use ash::vk::Handle as _;

use super::{create_test_buffer, create_test_image, headless_device, record_clear};
use crate::backend::NativeObject;
use crate::command::CommandListState;
use crate::device::SubmitInfo;
use crate::error::GpuError;
use crate::resource::ImageViewInfo;

#[test]
fn test_destroyed_image_outlives_in_flight_work() {
    let (backend, device) = headless_device();
    let image = create_test_image(&device, "in flight");
    let native = device.native_image(image).expect("Should resolve").as_raw();

    let list = record_clear(&device, image, "uses image");
    let value = device.submit_commands(&SubmitInfo::new(&[list])).expect("Should submit");
    device.destroy_image(image).expect("Should destroy");

    // The handle dies immediately, the native image does not
    assert!(!device.is_alive(image));
    assert!(matches!(device.bindless_index(image), Err(GpuError::InvalidHandle { .. })));
    let report = device.check_for_finished_submits().expect("Should collect");
    assert_eq!(report.freed_objects, 0);
    assert!(!backend.destroyed().iter().any(|record| record.object.raw() == native));

    backend.complete_up_to(value);
    let report = device.check_for_finished_submits().expect("Should collect");
    assert_eq!(report.retired_submissions, 1);
    assert_eq!(report.freed_objects, 1);

    let record = backend
        .destroyed()
        .into_iter()
        .find(|record| record.object.raw() == native)
        .expect("Image should be destroyed");
    assert!(record.completed_value >= value);
    assert_eq!(device.resource_count(), 0);
}

#[test]
fn test_destruction_waits_for_every_earlier_submission() {
    let (backend, device) = headless_device();
    let busy = create_test_image(&device, "busy");
    let unrelated = create_test_buffer(&device, "unrelated");
    let native = device.native_buffer(unrelated).expect("Should resolve").as_raw();

    let list = record_clear(&device, busy, "does not touch the buffer");
    let value = device.submit_commands(&SubmitInfo::new(&[list])).expect("Should submit");
    device.destroy_buffer(unrelated).expect("Should destroy");

    device.collect_garbage().expect("Should collect");
    assert_eq!(device.pending_destructions(), 1);
    assert!(!backend.destroyed().iter().any(|record| record.object.raw() == native));

    backend.complete_up_to(value);
    device.collect_garbage().expect("Should collect");
    assert_eq!(device.pending_destructions(), 0);
    assert!(backend.destroyed().iter().any(|record| record.object.raw() == native));
}

#[test]
fn test_submission_retires_exactly_once() {
    let (backend, device) = headless_device();
    let image = create_test_image(&device, "image");
    let list = record_clear(&device, image, "once");
    let value = device
        .submit_commands(&SubmitInfo::new(&[list.clone()]))
        .expect("Should submit");
    assert_eq!(list.state(), CommandListState::Submitted(value));

    let report = device.check_for_finished_submits().expect("Should collect");
    assert_eq!(report.retired_submissions, 0);
    assert_eq!(device.in_flight_submissions(), 1);

    backend.complete_up_to(value);
    let report = device.check_for_finished_submits().expect("Should collect");
    assert_eq!(report.retired_submissions, 1);
    assert_eq!(report.completed_value, value);
    assert_eq!(list.state(), CommandListState::Retired(value));

    let again = device.check_for_finished_submits().expect("Should collect");
    assert_eq!(again.retired_submissions, 0);
    assert_eq!(again.freed_objects, 0);
    assert_eq!(device.in_flight_submissions(), 0);
}

#[test]
fn test_held_command_list_keeps_resources_alive() {
    let (backend, device) = headless_device();
    let image = create_test_image(&device, "held");
    let list = record_clear(&device, image, "kept by caller");
    let value = device
        .submit_commands(&SubmitInfo::new(&[list.clone()]))
        .expect("Should submit");
    device.destroy_image(image).expect("Should destroy");

    backend.complete_up_to(value);
    let report = device.collect_garbage().expect("Should collect");
    assert_eq!(report.freed_objects, 0);
    assert_eq!(report.deferred, 1);
    assert_eq!(device.resource_count(), 1);

    let error = device
        .submit_commands(&SubmitInfo::new(&[list.clone()]))
        .expect_err("Should not resubmit against a destroyed image");
    assert!(matches!(error, GpuError::InvalidHandle { kind: "image" }));
    assert_eq!(list.state(), CommandListState::Retired(value));
    assert_eq!(device.highest_issued_value(), value);

    drop(list);
    let report = device.collect_garbage().expect("Should collect");
    assert_eq!(report.freed_objects, 1);
    assert_eq!(device.resource_count(), 0);
}

#[test]
fn test_view_keeps_parent_image_alive() {
    let (backend, device) = headless_device();
    let image = create_test_image(&device, "parent");
    let view = device
        .create_image_view(&ImageViewInfo::new(image).with_name("child"))
        .expect("Should create view");
    let native_image = device.native_image(image).expect("Should resolve").as_raw();

    device.destroy_image(image).expect("Should destroy image");
    let report = device.collect_garbage().expect("Should collect");
    assert_eq!(report.freed_objects, 0);
    assert!(device.is_alive(view));
    assert!(!backend.destroyed().iter().any(|record| record.object.raw() == native_image));

    device.destroy_image_view(view).expect("Should destroy view");
    let report = device.collect_garbage().expect("Should collect");
    assert_eq!(report.freed_objects, 2);

    let destroyed = backend.destroyed();
    let view_position = destroyed
        .iter()
        .position(|record| matches!(record.object, NativeObject::ImageView(_)))
        .expect("View should be destroyed");
    let image_position = destroyed
        .iter()
        .position(|record| record.object.raw() == native_image)
        .expect("Image should be destroyed");
    assert!(view_position < image_position, "The view must go before its image");
}

#[test]
fn test_view_of_destroyed_image_is_rejected() {
    let (_backend, device) = headless_device();
    let image = create_test_image(&device, "gone");
    device.destroy_image(image).expect("Should destroy");

    let error = device
        .create_image_view(&ImageViewInfo::new(image))
        .expect_err("Should reject dead parent");
    assert!(matches!(error, GpuError::InvalidHandle { .. }));
    assert!(matches!(device.destroy_image(image), Err(GpuError::InvalidHandle { .. })));
}

#[test]
fn test_bindless_index_reused_after_free() {
    let (backend, device) = headless_device();
    let first = create_test_image(&device, "first");
    let first_view = device
        .create_image_view(&ImageViewInfo::new(first))
        .expect("Should create view");
    let index = device.bindless_index(first_view).expect("Should have an index");

    device.destroy_image_view(first_view).expect("Should destroy");
    device.destroy_image(first).expect("Should destroy");
    device.collect_garbage().expect("Should collect");

    let second = create_test_image(&device, "second");
    let second_view = device
        .create_image_view(&ImageViewInfo::new(second))
        .expect("Should create view");
    assert_eq!(device.bindless_index(second_view).expect("Should have an index"), index);
    assert!(!device.is_alive(first_view), "Stale handle must not alias the new view");

    let writes = backend.bindless_writes();
    assert_eq!(writes.len(), 2, "Both sampled views should be published");
}

#[test]
fn test_binary_semaphore_drop_is_deferred() {
    let (backend, device) = headless_device();
    let image = create_test_image(&device, "image");
    let semaphore = device.create_binary_semaphore("signal").expect("Should create");
    let raw = semaphore.raw();

    let list = record_clear(&device, image, "signals");
    let value = device
        .submit_commands(&SubmitInfo {
            command_lists: &[list],
            signal_binary_semaphores: &[&semaphore],
            ..SubmitInfo::default()
        })
        .expect("Should submit");
    drop(semaphore);

    device.collect_garbage().expect("Should collect");
    assert!(!backend.was_destroyed(NativeObject::Semaphore(raw)));

    backend.complete_up_to(value);
    device.collect_garbage().expect("Should collect");
    assert!(backend.was_destroyed(NativeObject::Semaphore(raw)));
}

#[test]
fn test_device_drop_releases_everything() {
    let (backend, device) = headless_device();
    let image = create_test_image(&device, "leaked image");
    let _buffer = create_test_buffer(&device, "leaked buffer");
    let list = record_clear(&device, image, "in flight at teardown");
    device.submit_commands(&SubmitInfo::new(&[list])).expect("Should submit");

    drop(device);
    assert_eq!(backend.live_object_count(), 0);
    assert_eq!(backend.live_command_buffer_count(), 0);
}
