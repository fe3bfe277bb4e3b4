//! Deferred reclamation queues
//!
//! Two FIFO queues ordered by timeline value:
//!
//! - in-flight submissions, each holding clones of the command lists it
//!   executes; retiring one drops those clones and with them the lists'
//!   resource references
//! - pending destructions, each guarded by the highest timeline value issued
//!   when the destroy was requested
//!
//! Both queues are drained only for entries whose value is at or below the
//! GPU's completed counter, so draining is idempotent: a second sweep at the
//! same counter finds nothing to do.

use std::collections::VecDeque;

use crate::backend::NativeObject;
use crate::command::ExecutableCommandList;
use crate::foundation::collections::ResourceKey;

/// Something waiting to be destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Zombie {
    /// Registry resource; freed once unreferenced
    Resource(ResourceKey),
    /// Native object outside the registry (semaphores, swapchains, surfaces)
    Native(NativeObject),
}

#[derive(Debug)]
pub(crate) struct PendingDestruction {
    pub zombie: Zombie,
    pub guard: u64,
}

#[derive(Debug)]
pub(crate) struct InFlightSubmission {
    pub timeline_value: u64,
    pub lists: Vec<ExecutableCommandList>,
}

/// Outcome of one garbage collection sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Submissions whose timeline value was reached
    pub retired_submissions: usize,
    /// Objects actually destroyed
    pub freed_objects: usize,
    /// Guard reached but still referenced by a live command list
    pub deferred: usize,
    /// Completed timeline value observed by the sweep
    pub completed_value: u64,
}

#[derive(Debug, Default)]
pub(crate) struct GarbageCollector {
    in_flight: VecDeque<InFlightSubmission>,
    pending: VecDeque<PendingDestruction>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_submission(&mut self, timeline_value: u64, lists: Vec<ExecutableCommandList>) {
        debug_assert!(self.in_flight.back().map_or(true, |last| last.timeline_value < timeline_value));
        self.in_flight.push_back(InFlightSubmission { timeline_value, lists });
    }

    pub fn defer(&mut self, zombie: Zombie, guard: u64) {
        self.pending.push_back(PendingDestruction { zombie, guard });
    }

    /// Remove submissions the GPU has finished
    pub fn drain_completed_submissions(&mut self, completed: u64) -> Vec<InFlightSubmission> {
        let mut retired = Vec::new();
        while self.in_flight.front().is_some_and(|entry| entry.timeline_value <= completed) {
            retired.extend(self.in_flight.pop_front());
        }
        retired
    }

    /// Remove destructions whose guard has been reached
    ///
    /// Guards are issued in non-decreasing order except for requeued entries,
    /// so the whole queue is scanned.
    pub fn drain_ready_destructions(&mut self, completed: u64) -> Vec<PendingDestruction> {
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
            self.pending.drain(..).partition(|entry| entry.guard <= completed);
        self.pending = waiting;
        ready.into_iter().collect()
    }

    /// Put back entries whose guard passed but which are still referenced
    pub fn requeue(&mut self, entries: Vec<PendingDestruction>) {
        self.pending.extend(entries);
    }

    /// Take everything, for device teardown
    pub fn drain_all(&mut self) -> (Vec<InFlightSubmission>, Vec<PendingDestruction>) {
        (self.in_flight.drain(..).collect(), self.pending.drain(..).collect())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Timeline value of the oldest unretired submission
    pub fn oldest_in_flight(&self) -> Option<u64> {
        self.in_flight.front().map(|entry| entry.timeline_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use ash::vk::Handle as _;

    fn semaphore(raw: u64) -> Zombie {
        Zombie::Native(NativeObject::Semaphore(vk::Semaphore::from_raw(raw)))
    }

    #[test]
    fn test_destructions_wait_for_guard() {
        let mut gc = GarbageCollector::new();
        gc.defer(semaphore(1), 3);
        gc.defer(semaphore(2), 5);

        assert!(gc.drain_ready_destructions(2).is_empty());
        let ready = gc.drain_ready_destructions(4);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].zombie, semaphore(1));
        assert_eq!(gc.pending_count(), 1);
    }

    #[test]
    fn test_drain_is_idempotent() {
        let mut gc = GarbageCollector::new();
        gc.defer(semaphore(1), 1);
        assert_eq!(gc.drain_ready_destructions(1).len(), 1);
        assert!(gc.drain_ready_destructions(1).is_empty());
        assert!(gc.drain_completed_submissions(1).is_empty());
    }

    #[test]
    fn test_requeued_entries_are_retried() {
        let mut gc = GarbageCollector::new();
        gc.defer(semaphore(1), 1);
        let ready = gc.drain_ready_destructions(1);
        gc.requeue(ready);
        assert_eq!(gc.pending_count(), 1);
        assert_eq!(gc.drain_ready_destructions(1).len(), 1);
    }

    #[test]
    fn test_submissions_retire_in_order() {
        let mut gc = GarbageCollector::new();
        gc.track_submission(1, Vec::new());
        gc.track_submission(2, Vec::new());
        gc.track_submission(3, Vec::new());

        assert_eq!(gc.oldest_in_flight(), Some(1));
        let retired = gc.drain_completed_submissions(2);
        assert_eq!(retired.iter().map(|entry| entry.timeline_value).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(gc.in_flight_count(), 1);
    }
}
