use std::time::Duration;

use crate::error::MasterError;
use crate::master::handle::WorkerHandle;
use crate::model::WorkerId;

/// Capacity of the event queue between the worker manager and `tick`.
pub(crate) const MAX_PENDING_EVENTS: usize = 1024;

/// How long an enqueue may wait on a full queue before the manager declares
/// fatal backpressure.
pub(crate) const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bookkeeping applied under the manager lock right before an event is
/// handed to the user callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventPreAction {
    None,
    /// Dispatch failed: the entry (if any) is removed so the worker ID
    /// disappears from `get_workers`.
    RemoveEntry,
    /// Offline delivery: the entry becomes a tombstone.
    MarkTombstone,
}

pub(crate) enum MasterEventKind {
    WorkerOnline,
    WorkerOffline { reason: MasterError },
    WorkerStatusUpdated,
    WorkerDispatchFailed { err: MasterError },
}

/// One state transition awaiting delivery to the user callbacks on the
/// `poll` task.
pub(crate) struct MasterEvent {
    pub worker_id: WorkerId,
    pub handle: WorkerHandle,
    pub kind: MasterEventKind,
    pub pre_action: EventPreAction,
}
