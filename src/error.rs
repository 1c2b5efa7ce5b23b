use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Epoch, ExecutorId, WorkerId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MasterError {
    #[error("worker finished")]
    WorkerFinish,

    #[error("worker stopped by request")]
    WorkerStop,

    #[error("worker {0} is offline")]
    WorkerOffline(WorkerId),

    #[error("too many concurrent worker creations")]
    ConcurrencyExceeded,

    #[error("too many pending master events")]
    TooManyPendingEvents,

    #[error("cannot send message to tombstone worker {0}")]
    SendToTombstone(WorkerId),

    #[error("worker handle {0} is no longer valid")]
    InvalidWorkerHandle(WorkerId),

    #[error("worker config does not match the declared worker type: {0}")]
    InvalidMasterMeta(String),

    #[error("master is closed")]
    MasterClosed,

    #[error("master is not ready")]
    MasterNotReady,

    #[error("stale master still running: own epoch {own}, message epoch {msg}")]
    StaleMasterDetected { own: Epoch, msg: Epoch },

    #[error("scheduler rejected the task: {0}")]
    ScheduleTaskFailed(ErrorCode),

    #[error("executor rejected the dispatch: {0}")]
    DispatchRejected(ErrorCode),

    #[error("unknown executor {0}")]
    UnknownExecutor(ExecutorId),

    #[error("metadata serialization failed: {0}")]
    MetaSerde(String),

    #[error("metadata store error: {0}")]
    MetaStore(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("operation canceled")]
    Canceled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl MasterError {
    /// Cancellation is a normal consequence of shutdown, not a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, MasterError::Canceled)
    }

    pub(crate) fn serde(err: serde_json::Error) -> Self {
        MasterError::MetaSerde(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MasterError>;

/// Wire-level error codes exchanged with the server master and executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok,
    MasterNotLeader,
    UnknownExecutor,
    NotEnoughResource,
    SubJobSubmitFailed,
    TombstoneExecutor,
    SubJobBuildFailed,
    BuildGrpcConnFailed,
    InvalidMetaStoreType,
    MasterNotReady,
    UnknownJob,
    MetaStoreNotExists,
    MetaStoreSerializeFail,
    UnexpectedJobStatus,
    UnknownError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
