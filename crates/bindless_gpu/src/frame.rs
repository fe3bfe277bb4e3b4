//! Frame pacing
//!
//! [`FramePacer`] is a ring of frame slots. Each slot owns the binary
//! semaphore its frame's last submission signals for presentation, and the
//! timeline value that submission was given. Before a slot is reused the
//! pacer waits (bounded) for that value, so the CPU never runs more than
//! `slot_count` frames ahead of the GPU and a present semaphore is never
//! signaled twice without the first signal having been consumed.
//!
//! A frame typically goes:
//!
//! ```text
//! acquire -> record -> pacer.submit -> present(pacer.present_signal) -> pacer.advance
//! ```

use ash::vk;
use std::fmt;

use crate::command::ExecutableCommandList;
use crate::config::ConfigError;
use crate::device::{Device, SubmitInfo};
use crate::error::GpuResult;
use crate::sync::BinarySemaphore;

/// Upper bound on frame slots
pub const MAX_FRAME_SLOTS: usize = 8;

/// One slot of the ring
pub struct FrameSlot {
    present_signal: BinarySemaphore,
    last_submitted_value: u64,
}

impl FrameSlot {
    /// Semaphore signaled by this slot's submission and waited on by present
    pub fn present_signal(&self) -> &BinarySemaphore {
        &self.present_signal
    }

    /// Timeline value of this slot's latest submission, 0 if never used
    pub const fn last_submitted_value(&self) -> u64 {
        self.last_submitted_value
    }
}

impl fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSlot")
            .field("present_signal", &self.present_signal.raw())
            .field("last_submitted_value", &self.last_submitted_value)
            .finish()
    }
}

/// The frame's final submission
#[derive(Debug, Clone, Copy)]
pub struct FrameSubmitInfo<'a> {
    /// Lists executed in order
    pub command_lists: &'a [ExecutableCommandList],
    /// Binary semaphores waited on before execution
    pub wait_binary_semaphores: &'a [&'a BinarySemaphore],
    /// Signaled in addition to the slot's present semaphore
    pub extra_signal_semaphores: &'a [&'a BinarySemaphore],
    /// Stages that wait on `wait_binary_semaphores`
    pub wait_stages: vk::PipelineStageFlags,
}

impl<'a> FrameSubmitInfo<'a> {
    /// Submit `command_lists` with no extra semaphores
    pub fn new(command_lists: &'a [ExecutableCommandList]) -> Self {
        Self {
            command_lists,
            wait_binary_semaphores: &[],
            extra_signal_semaphores: &[],
            wait_stages: vk::PipelineStageFlags::ALL_COMMANDS,
        }
    }
}

/// Fixed ring of in-flight frame slots
pub struct FramePacer {
    device: Device,
    slots: Vec<FrameSlot>,
    current: usize,
}

impl FramePacer {
    /// Create a pacer with `slot_count` slots (1 to [`MAX_FRAME_SLOTS`])
    pub fn new(device: &Device, slot_count: usize) -> GpuResult<Self> {
        if slot_count == 0 || slot_count > MAX_FRAME_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "Frame slot count must be between 1 and {MAX_FRAME_SLOTS}, got {slot_count}"
            ))
            .into());
        }

        let slots = (0..slot_count)
            .map(|index| {
                Ok(FrameSlot {
                    present_signal: device.create_binary_semaphore(&format!("frame {index} present signal"))?,
                    last_submitted_value: 0,
                })
            })
            .collect::<GpuResult<Vec<_>>>()?;

        log::debug!("Creating frame pacer with {} slots", slot_count);
        Ok(Self {
            device: device.clone(),
            slots,
            current: 0,
        })
    }

    /// Create a pacer sized by the device's `max_frames_in_flight`
    pub fn from_config(device: &Device) -> GpuResult<Self> {
        Self::new(device, device.config().max_frames_in_flight)
    }

    /// Number of slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot in use
    pub const fn current_index(&self) -> usize {
        self.current
    }

    /// Slot for the frame in progress
    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    /// Present semaphore of the current slot
    pub fn present_signal(&self) -> &BinarySemaphore {
        &self.slots[self.current].present_signal
    }

    /// Block until the current slot's previous submission has completed
    ///
    /// Bounded by the configured frame wait timeout.
    pub fn wait_for_current_slot(&self) -> GpuResult<()> {
        let value = self.current_slot().last_submitted_value;
        if value == 0 {
            return Ok(());
        }
        self.device
            .wait_for_value_ns(value, self.device.config().frame_wait_timeout_ns())
    }

    /// Submit the frame's work, signaling the slot's present semaphore
    ///
    /// Waits for the slot to be free first. Use
    /// [`Device::submit_commands`] for any earlier submissions of the frame;
    /// only one submission per slot may signal its present semaphore.
    pub fn submit(&mut self, info: &FrameSubmitInfo<'_>) -> GpuResult<u64> {
        self.wait_for_current_slot()?;

        let value = {
            let slot = &self.slots[self.current];
            let signals: Vec<&BinarySemaphore> = std::iter::once(&slot.present_signal)
                .chain(info.extra_signal_semaphores.iter().copied())
                .collect();
            self.device.submit_commands(&SubmitInfo {
                command_lists: info.command_lists,
                wait_binary_semaphores: info.wait_binary_semaphores,
                signal_binary_semaphores: &signals,
                wait_stages: info.wait_stages,
                signal_timeline_value: None,
            })?
        };

        self.slots[self.current].last_submitted_value = value;
        Ok(value)
    }

    /// Rotate to the next slot once the frame's submit and present are issued
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Slots whose submission the GPU has not finished
    pub fn frames_in_flight(&self) -> GpuResult<usize> {
        let completed = self.device.completed_value()?;
        Ok(self
            .slots
            .iter()
            .filter(|slot| slot.last_submitted_value > completed)
            .count())
    }
}

impl fmt::Debug for FramePacer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePacer")
            .field("slots", &self.slots)
            .field("current", &self.current)
            .finish()
    }
}
