//! Scripted collaborator doubles for unit and integration tests of
//! master implementations.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{
    DispatchTaskRequest, DispatchTaskResponse, ExecutorClient, ExecutorConnector,
    SchedulePlacement, ScheduleTask, ServerMasterClient,
};
use crate::error::{MasterError, Result};
use crate::model::ExecutorId;

/// Scheduler double answering `schedule_task` from a scripted queue.
#[derive(Default)]
pub struct MockServerMasterClient {
    responses: Mutex<VecDeque<Result<Vec<SchedulePlacement>>>>,
    requests: Mutex<Vec<Vec<ScheduleTask>>>,
    delay: Mutex<Option<std::time::Duration>>,
}

impl MockServerMasterClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `schedule_task` call stall first, for tests
    /// that need in-flight dispatches.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Queues a single-placement success response.
    pub fn push_placement(&self, executor_id: &str, addr: &str) {
        self.responses
            .lock()
            .push_back(Ok(vec![SchedulePlacement {
                executor_id: executor_id.to_owned(),
                addr: addr.to_owned(),
            }]));
    }

    pub fn push_error(&self, err: MasterError) {
        self.responses.lock().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<Vec<ScheduleTask>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ServerMasterClient for MockServerMasterClient {
    async fn schedule_task(&self, tasks: Vec<ScheduleTask>) -> Result<Vec<SchedulePlacement>> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().push(tasks);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(MasterError::Internal("no scripted schedule response".into())))
    }
}

/// Executor double recording every dispatch it receives.
///
/// With no scripted response the dispatch succeeds, which is the common
/// happy-path setup.
#[derive(Default, Debug)]
pub struct MockExecutorClient {
    responses: Mutex<VecDeque<Result<DispatchTaskResponse>>>,
    dispatched: Mutex<Vec<DispatchTaskRequest>>,
}

impl MockExecutorClient {
    pub fn push_response(&self, resp: Result<DispatchTaskResponse>) {
        self.responses.lock().push_back(resp);
    }

    pub fn dispatched(&self) -> Vec<DispatchTaskRequest> {
        self.dispatched.lock().clone()
    }
}

#[async_trait]
impl ExecutorClient for MockExecutorClient {
    async fn dispatch_task(&self, req: DispatchTaskRequest) -> Result<DispatchTaskResponse> {
        self.dispatched.lock().push(req);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(DispatchTaskResponse::ok()))
    }
}

/// Connector double handing out one [`MockExecutorClient`] per executor ID.
#[derive(Default)]
pub struct MockExecutorConnector {
    clients: Mutex<HashMap<ExecutorId, Arc<MockExecutorClient>>>,
}

impl MockExecutorConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client a given executor ID resolves to, creating it on demand so
    /// tests can script responses before any dispatch happens.
    pub fn client(&self, executor_id: &str) -> Arc<MockExecutorClient> {
        self.clients
            .lock()
            .entry(executor_id.to_owned())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl ExecutorConnector for MockExecutorConnector {
    async fn connect(
        &self,
        executor_id: &ExecutorId,
        _addr: &str,
    ) -> Result<Arc<dyn ExecutorClient>> {
        Ok(self.client(executor_id))
    }
}
