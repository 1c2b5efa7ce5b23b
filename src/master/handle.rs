use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{MasterError, Result};
use crate::master::entry::EntryState;
use crate::master::manager::ManagerCore;
use crate::model::message::Topic;
use crate::model::{ExecutorId, WorkerId, WorkerInfo, WorkerStatus};
use crate::p2p::MessageValue;

const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const SEND_RETRY_TIMEOUT: Duration = Duration::from_secs(1);

/// Reference to one worker, handed to user callbacks and returned by
/// `get_workers`.
///
/// A handle never owns the entry: every operation resolves the worker ID
/// under the manager lock, and operations on a vanished entry return
/// `InvalidWorkerHandle`.
#[derive(Clone)]
pub enum WorkerHandle {
    Running(RunningHandle),
    Tombstone(TombstoneHandle),
}

impl WorkerHandle {
    pub fn id(&self) -> &WorkerId {
        match self {
            WorkerHandle::Running(h) => h.id(),
            WorkerHandle::Tombstone(h) => h.id(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, WorkerHandle::Tombstone(_))
    }

    /// Last framework-visible status reported by the worker.
    pub fn status(&self) -> Result<WorkerStatus> {
        match self {
            WorkerHandle::Running(h) => h.status(),
            WorkerHandle::Tombstone(h) => h.status(),
        }
    }

    /// Sends a business message to the worker's executor node. A
    /// non-blocking send reports `Ok(false)` when the bus did not accept the
    /// message; a blocking send retries briefly first.
    pub async fn send_message(
        &self,
        topic: &Topic,
        message: MessageValue,
        nonblocking: bool,
    ) -> Result<bool> {
        match self {
            WorkerHandle::Running(h) => h.send_message(topic, message, nonblocking).await,
            WorkerHandle::Tombstone(h) => {
                Err(MasterError::SendToTombstone(h.id().clone()))
            }
        }
    }

    /// Serializable snapshot for reporting and persistence.
    pub fn to_info(&self) -> Result<WorkerInfo> {
        match self {
            WorkerHandle::Running(h) => Ok(WorkerInfo {
                worker_id: h.id().clone(),
                executor_id: h.executor_id().ok(),
                is_tombstone: false,
                status: h.status()?,
            }),
            WorkerHandle::Tombstone(h) => Ok(WorkerInfo {
                worker_id: h.id().clone(),
                executor_id: None,
                is_tombstone: true,
                status: h.status()?,
            }),
        }
    }

    pub fn as_running(&self) -> Option<&RunningHandle> {
        match self {
            WorkerHandle::Running(h) => Some(h),
            WorkerHandle::Tombstone(_) => None,
        }
    }

    pub fn as_tombstone(&self) -> Option<&TombstoneHandle> {
        match self {
            WorkerHandle::Running(_) => None,
            WorkerHandle::Tombstone(h) => Some(h),
        }
    }
}

/// Handle to a live (created or online) worker.
#[derive(Clone)]
pub struct RunningHandle {
    pub(crate) worker_id: WorkerId,
    pub(crate) core: Weak<ManagerCore>,
}

impl RunningHandle {
    pub fn id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn core(&self) -> Result<Arc<ManagerCore>> {
        self.core
            .upgrade()
            .ok_or(MasterError::MasterClosed)
    }

    pub fn status(&self) -> Result<WorkerStatus> {
        let core = self.core()?;
        core.with_entry(&self.worker_id, |entry| entry.status().clone())
            .ok_or_else(|| MasterError::InvalidWorkerHandle(self.worker_id.clone()))
    }

    /// The executor hosting this worker. Unknown until the first heartbeat
    /// for entries recovered from metadata.
    pub fn executor_id(&self) -> Result<ExecutorId> {
        let core = self.core()?;
        core.with_entry(&self.worker_id, |entry| entry.executor_id().cloned())
            .ok_or_else(|| MasterError::InvalidWorkerHandle(self.worker_id.clone()))?
            .ok_or_else(|| MasterError::InvalidWorkerHandle(self.worker_id.clone()))
    }

    pub async fn send_message(
        &self,
        topic: &Topic,
        message: MessageValue,
        nonblocking: bool,
    ) -> Result<bool> {
        let core = self.core()?;
        let state = core
            .with_entry(&self.worker_id, |entry| entry.state())
            .ok_or_else(|| MasterError::InvalidWorkerHandle(self.worker_id.clone()))?;
        if state == EntryState::Tombstone {
            return Err(MasterError::SendToTombstone(self.worker_id.clone()));
        }
        let node = self.executor_id()?;

        let delivered = core
            .message_sender()
            .send_to_node(&node, topic, message.clone())
            .await?;
        if delivered || nonblocking {
            return Ok(delivered);
        }

        // Blocking mode: retry briefly while the bus is saturated.
        let deadline = tokio::time::Instant::now() + SEND_RETRY_TIMEOUT;
        loop {
            tokio::time::sleep(SEND_RETRY_INTERVAL).await;
            let delivered = core
                .message_sender()
                .send_to_node(&node, topic, message.clone())
                .await?;
            if delivered {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }
}

/// Handle to a worker that has gone offline or failed to dispatch. Preserves
/// the worker's identity so late calls fail deterministically.
#[derive(Clone)]
pub struct TombstoneHandle {
    pub(crate) worker_id: WorkerId,
    pub(crate) core: Weak<ManagerCore>,
}

impl TombstoneHandle {
    pub fn id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn status(&self) -> Result<WorkerStatus> {
        let core = self
            .core
            .upgrade()
            .ok_or(MasterError::MasterClosed)?;
        core.with_entry(&self.worker_id, |entry| entry.status().clone())
            .ok_or_else(|| MasterError::InvalidWorkerHandle(self.worker_id.clone()))
    }

    /// Removes both the in-memory tombstone entry and the persisted worker
    /// record. Idempotent: repeated calls are no-ops.
    pub async fn clean_meta(&self) -> Result<()> {
        let core = self
            .core
            .upgrade()
            .ok_or(MasterError::MasterClosed)?;
        core.worker_meta().delete(&self.worker_id).await?;
        core.remove_tombstone_entry(&self.worker_id);
        Ok(())
    }
}
