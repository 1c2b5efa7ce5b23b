//! Test harness for master integration tests.
//!
//! Wires an in-memory metadata store, an in-process message bus and scripted
//! scheduler/executor doubles around a recording master implementation, and
//! scripts the worker side of the heartbeat and status protocols.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use jobmaster::client::mock::{MockExecutorConnector, MockServerMasterClient};
use jobmaster::client::ExecutorGroup;
use jobmaster::config::TimeoutConfig;
use jobmaster::error::{MasterError, Result};
use jobmaster::master::{BaseMaster, MasterContext, MasterDeps, MasterImpl, WorkerHandle};
use jobmaster::meta::{MemKv, WorkerMetadataClient};
use jobmaster::model::message::{
    heartbeat_ping_topic, worker_status_topic, HeartbeatPing, WorkerStatusMessage,
};
use jobmaster::model::{Epoch, WorkerId, WorkerStatus, WorkerStatusCode};
use jobmaster::p2p::{LocalMessageBus, MessageSender};

/// Everything a master needs, sharing one store and one bus so restarts and
/// multiple masters see the same cluster.
pub struct TestEnv {
    pub kv: Arc<MemKv>,
    pub bus: Arc<LocalMessageBus>,
    pub scheduler: Arc<MockServerMasterClient>,
    pub connector: Arc<MockExecutorConnector>,
    pub executor_group: Arc<ExecutorGroup>,
}

impl TestEnv {
    pub fn new() -> Self {
        let connector = Arc::new(MockExecutorConnector::new());
        Self {
            kv: Arc::new(MemKv::new()),
            bus: Arc::new(LocalMessageBus::new()),
            scheduler: Arc::new(MockServerMasterClient::new()),
            executor_group: Arc::new(ExecutorGroup::new(connector.clone())),
            connector,
        }
    }

    pub fn deps(&self) -> MasterDeps {
        MasterDeps {
            message_sender: self.bus.clone(),
            message_router: self.bus.clone(),
            kv: self.kv.clone(),
            server_master_client: self.scheduler.clone(),
            executor_group: self.executor_group.clone(),
        }
    }

    /// Worker side of the protocol: one heartbeat ping from `executor_node`.
    pub async fn send_heartbeat(
        &self,
        master_id: &str,
        worker_id: &str,
        executor_node: &str,
        epoch: Epoch,
    ) -> bool {
        let ping = HeartbeatPing {
            from_worker_id: worker_id.to_owned(),
            send_time: Utc::now(),
            epoch,
        };
        self.bus
            .send_to_node(
                &executor_node.to_owned(),
                &heartbeat_ping_topic(master_id),
                serde_json::to_value(&ping).unwrap(),
            )
            .await
            .unwrap()
    }

    /// Worker side of the protocol: one asynchronous status notification.
    pub async fn send_worker_status(
        &self,
        master_id: &str,
        worker_id: &str,
        epoch: Epoch,
        code: WorkerStatusCode,
    ) -> bool {
        let msg = WorkerStatusMessage {
            worker: worker_id.to_owned(),
            master_epoch: epoch,
            status: WorkerStatus::new(code),
        };
        self.bus
            .send_to_node(
                &"worker-node".to_owned(),
                &worker_status_topic(master_id),
                serde_json::to_value(&msg).unwrap(),
            )
            .await
            .unwrap()
    }

    /// Persists a worker record the way the worker side would, so recovery
    /// and `clean_meta` have something to find.
    pub async fn seed_worker_meta(&self, master_id: &str, worker_id: &str, code: WorkerStatusCode) {
        WorkerMetadataClient::new(master_id.to_owned(), self.kv.clone())
            .store(worker_id, &WorkerStatus::new(code))
            .await
            .unwrap();
    }

    pub async fn load_worker_meta(
        &self,
        master_id: &str,
        worker_id: &str,
    ) -> Option<WorkerStatus> {
        WorkerMetadataClient::new(master_id.to_owned(), self.kv.clone())
            .load(worker_id)
            .await
            .unwrap()
    }
}

/// Lets spawned work (dispatch pipeline, timeout checker) run to completion
/// under the paused test clock.
pub async fn settle() {
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Init,
    Recovered,
    Online(WorkerId),
    Offline(WorkerId, MasterError),
    StatusUpdated(WorkerId, WorkerStatusCode),
    Dispatched(WorkerId, Option<MasterError>),
    Closed,
}

/// Master implementation that records every callback invocation.
#[derive(Default)]
pub struct RecordingImpl {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingImpl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the recorded callbacks, usable while the master owns
    /// the implementation.
    pub fn events(&self) -> Arc<Mutex<Vec<Recorded>>> {
        self.events.clone()
    }
}

#[async_trait::async_trait]
impl MasterImpl for RecordingImpl {
    async fn init_impl(&mut self, _master: &Arc<MasterContext>) -> Result<()> {
        self.events.lock().push(Recorded::Init);
        Ok(())
    }

    async fn tick(&mut self, _master: &Arc<MasterContext>) -> Result<()> {
        Ok(())
    }

    async fn on_master_recovered(&mut self, _master: &Arc<MasterContext>) -> Result<()> {
        self.events.lock().push(Recorded::Recovered);
        Ok(())
    }

    async fn on_worker_online(
        &mut self,
        _master: &Arc<MasterContext>,
        worker: WorkerHandle,
    ) -> Result<()> {
        self.events.lock().push(Recorded::Online(worker.id().clone()));
        Ok(())
    }

    async fn on_worker_offline(
        &mut self,
        _master: &Arc<MasterContext>,
        worker: WorkerHandle,
        reason: MasterError,
    ) -> Result<()> {
        self.events
            .lock()
            .push(Recorded::Offline(worker.id().clone(), reason));
        Ok(())
    }

    async fn on_worker_status_updated(
        &mut self,
        _master: &Arc<MasterContext>,
        worker: WorkerHandle,
        status: WorkerStatus,
    ) -> Result<()> {
        self.events
            .lock()
            .push(Recorded::StatusUpdated(worker.id().clone(), status.code));
        Ok(())
    }

    async fn on_worker_dispatched(
        &mut self,
        _master: &Arc<MasterContext>,
        worker: WorkerHandle,
        result: Result<()>,
    ) -> Result<()> {
        self.events
            .lock()
            .push(Recorded::Dispatched(worker.id().clone(), result.err()));
        Ok(())
    }

    async fn close_impl(&mut self, _master: &Arc<MasterContext>) -> Result<()> {
        self.events.lock().push(Recorded::Closed);
        Ok(())
    }
}

/// A wired-up master plus the shared view of its recorded callbacks.
pub fn test_master(env: &TestEnv, master_id: &str) -> (BaseMaster<RecordingImpl>, EventLog) {
    let recording = RecordingImpl::new();
    let events = recording.events();
    let master = BaseMaster::new(
        recording,
        master_id.to_owned(),
        "node-1".to_owned(),
        "127.0.0.1:9100".to_owned(),
        env.deps(),
        TimeoutConfig::default(),
    );
    (master, events)
}

pub type EventLog = Arc<Mutex<Vec<Recorded>>>;

/// Events of one worker, in delivery order.
pub fn events_for(log: &EventLog, worker_id: &str) -> Vec<Recorded> {
    log.lock()
        .iter()
        .filter(|ev| match ev {
            Recorded::Online(id)
            | Recorded::Offline(id, _)
            | Recorded::StatusUpdated(id, _)
            | Recorded::Dispatched(id, _) => id == worker_id,
            _ => false,
        })
        .cloned()
        .collect()
}

