use tokio::time::Instant;

use crate::error::MasterError;
use crate::model::{ExecutorId, WorkerId, WorkerStatus, WorkerStatusCode};

/// Lifecycle state of one in-memory worker entry.
///
/// `Created` entries come from the dispatch pipeline, `Wait` entries from
/// recovery. Both reach `Online` on the first valid heartbeat. `Offline` is
/// entered when the expire time passes, and `Tombstone` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    Created,
    Wait,
    Online,
    Offline,
    Tombstone,
}

/// The master's in-memory record for one worker. Owned exclusively by the
/// worker manager; handles only ever look it up under the manager lock.
#[derive(Debug)]
pub(crate) struct WorkerEntry {
    worker_id: WorkerId,
    executor_id: Option<ExecutorId>,
    state: EntryState,
    expire_at: Instant,
    status: StatusReader,
}

impl WorkerEntry {
    /// Entry for a worker whose dispatch request is about to be sent.
    pub fn new_created(worker_id: WorkerId, executor_id: ExecutorId, expire_at: Instant) -> Self {
        Self {
            worker_id,
            executor_id: Some(executor_id),
            state: EntryState::Created,
            expire_at,
            status: StatusReader::new(WorkerStatus::new(WorkerStatusCode::Created)),
        }
    }

    /// Entry for a worker found in the metadata store during recovery.
    pub fn new_waiting(worker_id: WorkerId, last_status: WorkerStatus, expire_at: Instant) -> Self {
        Self {
            worker_id,
            executor_id: None,
            state: EntryState::Wait,
            expire_at,
            status: StatusReader::new(last_status),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn executor_id(&self) -> Option<&ExecutorId> {
        self.executor_id.as_ref()
    }

    pub fn expire_at(&self) -> Instant {
        self.expire_at
    }

    pub fn set_expire_at(&mut self, at: Instant) {
        self.expire_at = at;
    }

    /// First valid heartbeat: the entry becomes `Online` and learns which
    /// executor hosts the worker.
    pub fn mark_online(&mut self, executor_id: ExecutorId, expire_at: Instant) {
        debug_assert!(
            matches!(self.state, EntryState::Created | EntryState::Wait),
            "online transition from {:?}",
            self.state
        );
        self.executor_id = Some(executor_id);
        self.state = EntryState::Online;
        self.expire_at = expire_at;
    }

    pub fn mark_offline(&mut self) {
        self.state = EntryState::Offline;
    }

    pub fn mark_tombstone(&mut self) {
        self.state = EntryState::Tombstone;
    }

    pub fn is_tombstone(&self) -> bool {
        self.state == EntryState::Tombstone
    }

    pub fn status_reader(&mut self) -> &mut StatusReader {
        &mut self.status
    }

    pub fn status(&self) -> &WorkerStatus {
        self.status.status()
    }

    /// Offline reason, decided at the transition point from the last known
    /// status code.
    pub fn offline_reason(&self) -> MasterError {
        match self.status.status().code {
            WorkerStatusCode::Finished => MasterError::WorkerFinish,
            WorkerStatusCode::Stopped => MasterError::WorkerStop,
            _ => MasterError::WorkerOffline(self.worker_id.clone()),
        }
    }
}

/// Cache of the worker-reported status plus a flag for notifications that
/// have not yet been turned into a `WorkerStatusUpdated` event.
#[derive(Debug)]
pub(crate) struct StatusReader {
    current: WorkerStatus,
    pending: bool,
}

impl StatusReader {
    pub fn new(initial: WorkerStatus) -> Self {
        Self {
            current: initial,
            pending: false,
        }
    }

    /// Records an asynchronous notification from the worker. Notifications
    /// arriving between two checker passes coalesce into one event.
    pub fn on_notification(&mut self, status: WorkerStatus) {
        self.current = status;
        self.pending = true;
    }

    /// Takes the pending notification, if any.
    pub fn take_pending(&mut self) -> Option<WorkerStatus> {
        if self.pending {
            self.pending = false;
            Some(self.current.clone())
        } else {
            None
        }
    }

    pub fn status(&self) -> &WorkerStatus {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[tokio::test]
    async fn test_created_to_online_sets_executor() {
        let mut entry = WorkerEntry::new_created("w1".to_owned(), "e1".to_owned(), now());
        assert_eq!(entry.state(), EntryState::Created);

        entry.mark_online("e1".to_owned(), now());
        assert_eq!(entry.state(), EntryState::Online);
        assert_eq!(entry.executor_id(), Some(&"e1".to_owned()));
    }

    #[tokio::test]
    async fn test_waiting_entry_learns_executor_from_heartbeat() {
        let mut entry = WorkerEntry::new_waiting(
            "w1".to_owned(),
            WorkerStatus::new(WorkerStatusCode::Normal),
            now(),
        );
        assert_eq!(entry.executor_id(), None);

        entry.mark_online("e2".to_owned(), now());
        assert_eq!(entry.executor_id(), Some(&"e2".to_owned()));
    }

    #[tokio::test]
    async fn test_offline_reason_tracks_last_status() {
        let mut entry = WorkerEntry::new_created("w1".to_owned(), "e1".to_owned(), now());
        assert_eq!(
            entry.offline_reason(),
            MasterError::WorkerOffline("w1".to_owned())
        );

        entry
            .status_reader()
            .on_notification(WorkerStatus::new(WorkerStatusCode::Finished));
        assert_eq!(entry.offline_reason(), MasterError::WorkerFinish);

        entry
            .status_reader()
            .on_notification(WorkerStatus::new(WorkerStatusCode::Stopped));
        assert_eq!(entry.offline_reason(), MasterError::WorkerStop);
    }

    #[tokio::test]
    async fn test_status_reader_coalesces_notifications() {
        let mut reader = StatusReader::new(WorkerStatus::new(WorkerStatusCode::Created));
        assert!(reader.take_pending().is_none());

        reader.on_notification(WorkerStatus::new(WorkerStatusCode::Init));
        reader.on_notification(WorkerStatus::new(WorkerStatusCode::Normal));

        let pending = reader.take_pending().unwrap();
        assert_eq!(pending.code, WorkerStatusCode::Normal);
        assert!(reader.take_pending().is_none());
        assert_eq!(reader.status().code, WorkerStatusCode::Normal);
    }
}
