pub mod message;

use serde::{Deserialize, Serialize};

/// Identifier of one job master.
pub type MasterId = String;
/// Identifier of one worker, unique within the cluster.
pub type WorkerId = String;
/// Identifier of a node on the message bus.
pub type NodeId = String;
/// Identifier of an executor node that hosts workers.
pub type ExecutorId = String;
/// Monotonic integer identifying a master generation.
pub type Epoch = i64;
/// Abstract resource cost of a worker, consumed by the scheduler.
pub type ResourceUnit = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterStatusCode {
    Uninit,
    Init,
    Finished,
    Stopped,
}

impl std::fmt::Display for MasterStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterStatusCode::Uninit => write!(f, "uninit"),
            MasterStatusCode::Init => write!(f, "init"),
            MasterStatusCode::Finished => write!(f, "finished"),
            MasterStatusCode::Stopped => write!(f, "stopped"),
        }
    }
}

/// Persisted record of one master, keyed by its master ID.
///
/// Created once by the submitter with status `Uninit`. On every (re)start the
/// master bumps `epoch`, rewrites `node_id` and `addr`, and moves the status
/// to `Init`. The epoch is strictly increasing across the lifetime of a
/// master ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterMeta {
    pub id: MasterId,
    pub epoch: Epoch,
    pub node_id: NodeId,
    pub addr: String,
    pub status: MasterStatusCode,
    #[serde(default)]
    pub config: Vec<u8>,
}

impl MasterMeta {
    /// A fresh record for a master that has never been persisted.
    pub fn zeroed(id: MasterId) -> Self {
        Self {
            id,
            epoch: 0,
            node_id: NodeId::default(),
            addr: String::new(),
            status: MasterStatusCode::Uninit,
            config: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatusCode {
    Created,
    Init,
    Normal,
    Finished,
    Stopped,
    Error,
}

impl std::fmt::Display for WorkerStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatusCode::Created => write!(f, "created"),
            WorkerStatusCode::Init => write!(f, "init"),
            WorkerStatusCode::Normal => write!(f, "normal"),
            WorkerStatusCode::Finished => write!(f, "finished"),
            WorkerStatusCode::Stopped => write!(f, "stopped"),
            WorkerStatusCode::Error => write!(f, "error"),
        }
    }
}

/// Framework-visible status of one worker.
///
/// Mutated by the worker side; the master observes it through asynchronous
/// status messages and on-demand reloads from the metadata store. `ext`
/// carries opaque business-level bytes the framework never interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub code: WorkerStatusCode,
    #[serde(default)]
    pub ext: Vec<u8>,
}

impl WorkerStatus {
    pub fn new(code: WorkerStatusCode) -> Self {
        Self {
            code,
            ext: Vec::new(),
        }
    }
}

/// Kind of workload a dispatched worker runs.
///
/// The numeric id is opaque to the framework and travels to the executor in
/// the dispatch request so the executor can pick the right runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerType {
    /// A nested job master; its config is a pre-allocated [`MasterMeta`].
    SubMaster(i64),
    /// A plain worker with a business-defined config.
    Worker(i64),
}

impl WorkerType {
    pub fn type_id(&self) -> i64 {
        match self {
            WorkerType::SubMaster(id) | WorkerType::Worker(id) => *id,
        }
    }
}

/// Config handed to `create_worker`, matched against the [`WorkerType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerConfig {
    /// For `WorkerType::SubMaster`: the sub-master's pre-allocated metadata.
    /// Its `id` is reused as the worker ID.
    SubMaster(MasterMeta),
    /// For `WorkerType::Worker`: serialized as-is; a fresh worker ID is
    /// generated.
    Custom(serde_json::Value),
}

/// Serializable snapshot of a worker handle, for reporting and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub executor_id: Option<ExecutorId>,
    pub is_tombstone: bool,
    pub status: WorkerStatus,
}
