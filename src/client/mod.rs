pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, MasterError, Result};
use crate::model::{ExecutorId, MasterId, ResourceUnit, WorkerId};

/// One unit of work submitted to the external scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTask {
    pub task_id: i64,
    pub cost: ResourceUnit,
}

/// One placement decision returned by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulePlacement {
    pub executor_id: ExecutorId,
    pub addr: String,
}

/// Client of the server master's scheduler.
#[async_trait]
pub trait ServerMasterClient: Send + Sync {
    /// Returns one placement per task, size-matched with the request.
    async fn schedule_task(&self, tasks: Vec<ScheduleTask>) -> Result<Vec<SchedulePlacement>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchTaskRequest {
    pub task_type_id: i64,
    pub task_config: Vec<u8>,
    pub master_id: MasterId,
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchTaskResponse {
    pub error_code: ErrorCode,
}

impl DispatchTaskResponse {
    pub fn ok() -> Self {
        Self {
            error_code: ErrorCode::Ok,
        }
    }
}

/// Client of one executor node.
#[async_trait]
pub trait ExecutorClient: Send + Sync + std::fmt::Debug {
    async fn dispatch_task(&self, req: DispatchTaskRequest) -> Result<DispatchTaskResponse>;
}

/// Builds an [`ExecutorClient`] connection for a placement decision.
#[async_trait]
pub trait ExecutorConnector: Send + Sync {
    async fn connect(&self, executor_id: &ExecutorId, addr: &str)
        -> Result<Arc<dyn ExecutorClient>>;
}

/// Registry of live executor connections, keyed by executor ID.
pub struct ExecutorGroup {
    connector: Arc<dyn ExecutorConnector>,
    clients: RwLock<HashMap<ExecutorId, Arc<dyn ExecutorClient>>>,
}

impl ExecutorGroup {
    pub fn new(connector: Arc<dyn ExecutorConnector>) -> Self {
        Self {
            connector,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Connects to the executor if it is not already registered.
    pub async fn add_executor(&self, executor_id: &ExecutorId, addr: &str) -> Result<()> {
        if self.clients.read().contains_key(executor_id) {
            return Ok(());
        }
        let client = self.connector.connect(executor_id, addr).await?;
        self.clients
            .write()
            .entry(executor_id.clone())
            .or_insert(client);
        Ok(())
    }

    pub fn executor_client(&self, executor_id: &ExecutorId) -> Result<Arc<dyn ExecutorClient>> {
        self.clients
            .read()
            .get(executor_id)
            .cloned()
            .ok_or_else(|| MasterError::UnknownExecutor(executor_id.clone()))
    }
}
