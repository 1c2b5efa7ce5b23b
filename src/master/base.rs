use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{DispatchTaskRequest, ExecutorGroup, ScheduleTask, ServerMasterClient};
use crate::config::TimeoutConfig;
use crate::error::{ErrorCode, MasterError, Result};
use crate::master::error_center::ErrorCenter;
use crate::master::handle::WorkerHandle;
use crate::master::manager::{WorkerEventListener, WorkerManager};
use crate::meta::{KvClient, MasterMetadataClient};
use crate::model::message::{
    heartbeat_ping_topic, heartbeat_pong_topic, worker_status_topic, HeartbeatPing,
    HeartbeatPong, Topic, WorkerStatusMessage,
};
use crate::model::{
    MasterId, MasterMeta, MasterStatusCode, NodeId, ResourceUnit, WorkerConfig, WorkerId,
    WorkerStatus, WorkerType,
};
use crate::p2p::{MessageRouter, MessageSender, MessageValue};

const CREATE_WORKER_WAIT_QUOTA_TIMEOUT: Duration = Duration::from_secs(5);
const CREATE_WORKER_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CREATE_WORKER_CONCURRENCY: usize = 100;
const CLOSE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Business logic of one master, supplied by the user.
///
/// Every callback runs on the task that calls [`BaseMaster::poll`], one at a
/// time. The `master` argument is the capability set through which the
/// implementation reaches the framework; it exposes no internal state.
#[async_trait]
pub trait MasterImpl: Send + 'static {
    /// First-time initialization of a freshly submitted master.
    async fn init_impl(&mut self, master: &Arc<MasterContext>) -> Result<()>;

    /// Called on every poll after pending worker events were delivered.
    async fn tick(&mut self, master: &Arc<MasterContext>) -> Result<()>;

    /// Called instead of `init_impl` when the master restarts over existing
    /// metadata, after the recovery protocol has finished.
    async fn on_master_recovered(&mut self, _master: &Arc<MasterContext>) -> Result<()> {
        Ok(())
    }

    /// Called when an asynchronous worker launch has failed for sure.
    async fn on_worker_dispatched(
        &mut self,
        _master: &Arc<MasterContext>,
        _worker: WorkerHandle,
        _result: Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when the first heartbeat for a worker is received.
    async fn on_worker_online(
        &mut self,
        _master: &Arc<MasterContext>,
        _worker: WorkerHandle,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when a worker exits or times out. The reason distinguishes a
    /// normal finish, a requested stop and a plain timeout.
    async fn on_worker_offline(
        &mut self,
        _master: &Arc<MasterContext>,
        _worker: WorkerHandle,
        _reason: MasterError,
    ) -> Result<()> {
        Ok(())
    }

    /// Called for business messages on topics the implementation registered
    /// for its workers.
    async fn on_worker_message(
        &mut self,
        _master: &Arc<MasterContext>,
        _worker: WorkerHandle,
        _topic: Topic,
        _message: MessageValue,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when a worker reported a new framework-visible status.
    async fn on_worker_status_updated(
        &mut self,
        _master: &Arc<MasterContext>,
        _worker: WorkerHandle,
        _status: WorkerStatus,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once when the master is being closed.
    async fn close_impl(&mut self, _master: &Arc<MasterContext>) -> Result<()> {
        Ok(())
    }
}

/// Injected collaborators of one master. Every field is mandatory at
/// construction; there is no late binding.
#[derive(Clone)]
pub struct MasterDeps {
    pub message_sender: Arc<dyn MessageSender>,
    pub message_router: Arc<dyn MessageRouter>,
    pub kv: Arc<dyn KvClient>,
    pub server_master_client: Arc<dyn ServerMasterClient>,
    pub executor_group: Arc<ExecutorGroup>,
}

/// The capability set a [`MasterImpl`] works against: worker creation, the
/// worker registry, metadata access and error reporting.
pub struct MasterContext {
    self_weak: Weak<MasterContext>,
    deps: MasterDeps,
    master_id: MasterId,
    node_id: NodeId,
    addr: String,
    timeouts: TimeoutConfig,
    epoch: AtomicI64,
    master_meta: Mutex<MasterMeta>,
    worker_manager: OnceLock<Arc<WorkerManager>>,
    err_center: ErrorCenter,
    close_token: CancellationToken,
    create_worker_quota: Arc<Semaphore>,
    registered_topics: Mutex<Vec<Topic>>,
}

impl MasterContext {
    pub fn master_id(&self) -> &MasterId {
        &self.master_id
    }

    /// The persisted master record as of the last refresh.
    pub fn master_meta(&self) -> MasterMeta {
        self.master_meta.lock().clone()
    }

    pub fn current_epoch(&self) -> i64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Raw access to the shared metadata store, for business-level records.
    pub fn meta_kv_client(&self) -> Arc<dyn KvClient> {
        self.deps.kv.clone()
    }

    /// True once first-time init or recovery has completed.
    pub fn is_master_ready(&self) -> bool {
        self.worker_manager
            .get()
            .map(|m| m.is_initialized())
            .unwrap_or(false)
    }

    /// Snapshot of every live and tombstoned worker. Empty before `init`.
    pub fn get_workers(&self) -> std::collections::HashMap<WorkerId, WorkerHandle> {
        self.worker_manager
            .get()
            .map(|m| m.get_workers())
            .unwrap_or_default()
    }

    /// Non-blocking fatal-error report. The first error per master lifetime
    /// wins and surfaces from the next `poll`.
    pub fn on_error(&self, err: MasterError) {
        self.err_center.on_error(err);
    }

    /// Registers the worker and dispatches it onto an executor chosen by the
    /// scheduler.
    ///
    /// Returns the freshly minted worker ID right away; the remainder of the
    /// dispatch runs asynchronously. Its outcome arrives through
    /// `on_worker_dispatched` (definitive failure) or `on_worker_online`
    /// (success). In-flight dispatches are bounded; exhausting the quota for
    /// more than a few seconds fails with `ConcurrencyExceeded`.
    pub async fn create_worker(
        &self,
        worker_type: WorkerType,
        config: WorkerConfig,
        cost: ResourceUnit,
    ) -> Result<WorkerId> {
        tracing::info!(
            master_id = %self.master_id,
            worker_type = worker_type.type_id(),
            cost,
            "create worker"
        );
        let manager = self.worker_manager()?.clone();

        let permit = match tokio::time::timeout(
            CREATE_WORKER_WAIT_QUOTA_TIMEOUT,
            self.create_worker_quota.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(MasterError::MasterClosed),
            Err(_) => return Err(MasterError::ConcurrencyExceeded),
        };

        let (config_bytes, worker_id) = prepare_worker_config(&worker_type, &config)?;

        let ctx = self
            .self_weak
            .upgrade()
            .ok_or(MasterError::MasterClosed)?;
        let ret = worker_id.clone();
        tokio::spawn(async move {
            // Quota is held for the whole dispatch and released on every
            // exit path when the permit drops.
            let _permit = permit;
            ctx.dispatch_worker(manager, worker_id, worker_type, config_bytes, cost)
                .await;
        });

        Ok(ret)
    }

    async fn dispatch_worker(
        self: Arc<Self>,
        manager: Arc<WorkerManager>,
        worker_id: WorkerId,
        worker_type: WorkerType,
        config: Vec<u8>,
        cost: ResourceUnit,
    ) {
        let deadline = tokio::time::Instant::now() + CREATE_WORKER_TIMEOUT;

        let tasks = vec![ScheduleTask { task_id: 0, cost }];
        let mut placements = match tokio::time::timeout_at(
            deadline,
            self.deps.server_master_client.schedule_task(tasks),
        )
        .await
        {
            Ok(Ok(placements)) => placements,
            Ok(Err(err)) => {
                manager.abort_creating_worker(worker_id, err).await;
                return;
            }
            Err(_) => {
                manager
                    .abort_creating_worker(
                        worker_id,
                        MasterError::DeadlineExceeded("schedule task".to_owned()),
                    )
                    .await;
                return;
            }
        };
        if placements.len() != 1 {
            manager
                .abort_creating_worker(
                    worker_id,
                    MasterError::Internal(format!(
                        "expected one placement, got {}",
                        placements.len()
                    )),
                )
                .await;
            return;
        }
        let placement = placements.remove(0);

        let registered = tokio::time::timeout_at(
            deadline,
            self.deps
                .executor_group
                .add_executor(&placement.executor_id, &placement.addr),
        )
        .await
        .unwrap_or_else(|_| {
            Err(MasterError::DeadlineExceeded("register executor".to_owned()))
        });
        if let Err(err) = registered {
            manager.abort_creating_worker(worker_id, err).await;
            return;
        }

        // Only from this point on is the worker visible to the manager.
        manager.before_starting_worker(worker_id.clone(), placement.executor_id.clone());

        let client = match self.deps.executor_group.executor_client(&placement.executor_id) {
            Ok(client) => client,
            Err(err) => {
                manager.abort_creating_worker(worker_id, err).await;
                return;
            }
        };

        let req = DispatchTaskRequest {
            task_type_id: worker_type.type_id(),
            task_config: config,
            master_id: self.master_id.clone(),
            worker_id: worker_id.clone(),
        };
        match tokio::time::timeout_at(deadline, client.dispatch_task(req)).await {
            Ok(Ok(resp)) => {
                tracing::info!(
                    master_id = %self.master_id,
                    worker_id = %worker_id,
                    code = %resp.error_code,
                    "worker dispatched"
                );
                if resp.error_code != ErrorCode::Ok {
                    manager
                        .abort_creating_worker(
                            worker_id,
                            MasterError::DispatchRejected(resp.error_code),
                        )
                        .await;
                }
                // On Ok the first heartbeat flips the entry online.
            }
            Ok(Err(err)) => {
                // The executor may have already launched the worker; the
                // heartbeat, or its timeout, is the source of truth.
                tracing::warn!(
                    master_id = %self.master_id,
                    worker_id = %worker_id,
                    error = %err,
                    "dispatch transport failed, waiting for heartbeat"
                );
            }
            Err(_) => {
                tracing::warn!(
                    master_id = %self.master_id,
                    worker_id = %worker_id,
                    "dispatch timed out, waiting for heartbeat"
                );
            }
        }
    }

    fn worker_manager(&self) -> Result<&Arc<WorkerManager>> {
        self.worker_manager.get().ok_or(MasterError::MasterNotReady)
    }

    /// Loads the master record, allocates a fresh epoch and rewrites the
    /// record to reflect this instance. Returns whether this is the first
    /// startup.
    async fn refresh_metadata(&self) -> Result<bool> {
        let meta_client =
            MasterMetadataClient::new(self.master_id.clone(), self.deps.kv.clone());

        let mut meta = meta_client.load().await?;
        let epoch = meta_client.gen_epoch().await?;
        meta.epoch = epoch;
        meta.node_id = self.node_id.clone();
        meta.addr = self.addr.clone();
        let is_first_startup = meta.status == MasterStatusCode::Uninit;
        meta_client.store(&meta).await?;

        self.epoch.store(epoch, Ordering::SeqCst);
        *self.master_meta.lock() = meta;
        Ok(is_first_startup)
    }

    async fn mark_status_code_in_metadata(&self, code: MasterStatusCode) -> Result<()> {
        let meta_client =
            MasterMetadataClient::new(self.master_id.clone(), self.deps.kv.clone());
        let mut meta = meta_client.load().await?;
        meta.status = code;
        meta_client.store(&meta).await?;
        self.master_meta.lock().status = code;
        Ok(())
    }

    async fn register_message_handlers(&self) -> Result<()> {
        let ping_topic = heartbeat_ping_topic(&self.master_id);
        let weak = self.self_weak.clone();
        let registered = self
            .deps
            .message_router
            .register_handler(
                ping_topic.clone(),
                Box::new(move |from, value| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(ctx) => ctx.handle_heartbeat_ping(from, value).await,
                            None => Ok(()),
                        }
                    })
                }),
            )
            .await?;
        if !registered {
            panic!("duplicate message handler for topic {}", ping_topic);
        }
        self.registered_topics.lock().push(ping_topic);

        let status_topic = worker_status_topic(&self.master_id);
        let weak = self.self_weak.clone();
        let registered = self
            .deps
            .message_router
            .register_handler(
                status_topic.clone(),
                Box::new(move |from, value| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(ctx) => ctx.handle_worker_status_message(from, value),
                            None => Ok(()),
                        }
                    })
                }),
            )
            .await?;
        if !registered {
            panic!("duplicate message handler for topic {}", status_topic);
        }
        self.registered_topics.lock().push(status_topic);

        Ok(())
    }

    async fn handle_heartbeat_ping(&self, from: NodeId, value: MessageValue) -> Result<()> {
        let msg: HeartbeatPing = serde_json::from_value(value).map_err(MasterError::serde)?;
        tracing::debug!(
            master_id = %self.master_id,
            worker_id = %msg.from_worker_id,
            from = %from,
            "heartbeat ping received"
        );

        let pong = HeartbeatPong {
            send_time: msg.send_time,
            reply_time: Utc::now(),
            to_worker_id: msg.from_worker_id.clone(),
            epoch: self.current_epoch(),
        };
        let pong_topic = heartbeat_pong_topic(&self.master_id, &msg.from_worker_id);
        let pong_value = serde_json::to_value(&pong).map_err(MasterError::serde)?;
        let delivered = self
            .deps
            .message_sender
            .send_to_node(&from, &pong_topic, pong_value)
            .await?;
        if !delivered {
            // Best effort; the worker pings again on its next interval.
            tracing::debug!(
                master_id = %self.master_id,
                worker_id = %msg.from_worker_id,
                "heartbeat pong not delivered"
            );
        }

        if let Some(manager) = self.worker_manager.get() {
            manager.handle_heartbeat(msg, from).await;
        }
        Ok(())
    }

    fn handle_worker_status_message(&self, from: NodeId, value: MessageValue) -> Result<()> {
        let msg: WorkerStatusMessage =
            serde_json::from_value(value).map_err(MasterError::serde)?;
        tracing::debug!(
            master_id = %self.master_id,
            worker_id = %msg.worker,
            from = %from,
            status = %msg.status.code,
            "worker status message received"
        );
        if let Some(manager) = self.worker_manager.get() {
            manager.on_worker_status_update_message(msg);
        }
        Ok(())
    }
}

fn prepare_worker_config(
    worker_type: &WorkerType,
    config: &WorkerConfig,
) -> Result<(Vec<u8>, WorkerId)> {
    match (worker_type, config) {
        // A sub-master ships its pre-allocated metadata; the master ID
        // doubles as the worker ID.
        (WorkerType::SubMaster(_), WorkerConfig::SubMaster(meta)) => {
            Ok((meta.config.clone(), meta.id.clone()))
        }
        (WorkerType::Worker(_), WorkerConfig::Custom(value)) => {
            let raw = serde_json::to_vec(value).map_err(MasterError::serde)?;
            Ok((raw, Uuid::new_v4().to_string()))
        }
        _ => Err(MasterError::InvalidMasterMeta(format!(
            "worker type {:?}",
            worker_type
        ))),
    }
}

/// Owner of the master lifecycle: wires the user [`MasterImpl`] to the
/// worker manager, the message bus and the metadata store.
///
/// `init`, `poll` and `close` must be driven from a single task; that task
/// is the serialization point for every user callback.
pub struct BaseMaster<M> {
    ctx: Arc<MasterContext>,
    impl_: M,
}

impl<M: MasterImpl> BaseMaster<M> {
    pub fn new(
        impl_: M,
        master_id: MasterId,
        node_id: NodeId,
        addr: String,
        deps: MasterDeps,
        timeouts: TimeoutConfig,
    ) -> Self {
        let ctx = Arc::new_cyclic(|self_weak| MasterContext {
            self_weak: self_weak.clone(),
            deps,
            master_meta: Mutex::new(MasterMeta::zeroed(master_id.clone())),
            master_id,
            node_id,
            addr,
            timeouts,
            epoch: AtomicI64::new(0),
            worker_manager: OnceLock::new(),
            err_center: ErrorCenter::new(),
            close_token: CancellationToken::new(),
            create_worker_quota: Arc::new(Semaphore::new(MAX_CREATE_WORKER_CONCURRENCY)),
            registered_topics: Mutex::new(Vec::new()),
        });
        Self { ctx, impl_ }
    }

    /// The capability set shared with the [`MasterImpl`] callbacks.
    pub fn context(&self) -> &Arc<MasterContext> {
        &self.ctx
    }

    pub fn master_id(&self) -> &MasterId {
        self.ctx.master_id()
    }

    pub fn master_meta(&self) -> MasterMeta {
        self.ctx.master_meta()
    }

    pub fn is_master_ready(&self) -> bool {
        self.ctx.is_master_ready()
    }

    pub fn get_workers(&self) -> std::collections::HashMap<WorkerId, WorkerHandle> {
        self.ctx.get_workers()
    }

    pub fn on_error(&self, err: MasterError) {
        self.ctx.on_error(err);
    }

    pub async fn create_worker(
        &self,
        worker_type: WorkerType,
        config: WorkerConfig,
        cost: ResourceUnit,
    ) -> Result<WorkerId> {
        self.ctx.create_worker(worker_type, config, cost).await
    }

    /// Refreshes the master metadata under a fresh epoch, wires the message
    /// handlers and runs first-time init or the recovery protocol.
    pub async fn init(&mut self, cancel: &CancellationToken) -> Result<()> {
        let is_first_startup = self.ctx.refresh_metadata().await?;

        let manager = Arc::new(WorkerManager::new(
            self.ctx.master_id.clone(),
            self.ctx.current_epoch(),
            self.ctx.deps.kv.clone(),
            self.ctx.deps.message_sender.clone(),
            is_first_startup,
            self.ctx.timeouts.clone(),
            self.ctx.err_center.clone(),
        ));
        if self.ctx.worker_manager.set(manager).is_err() {
            return Err(MasterError::Internal("master initialized twice".to_owned()));
        }

        self.ctx.register_message_handlers().await?;

        if is_first_startup {
            self.impl_.init_impl(&self.ctx).await?;
        } else {
            // Heartbeats accumulate in the manager while we wait for the
            // pre-existing workers to report back.
            self.ctx.worker_manager()?.init_after_recover(cancel).await?;
            self.impl_.on_master_recovered(&self.ctx).await?;
        }

        self.ctx
            .mark_status_code_in_metadata(MasterStatusCode::Init)
            .await?;
        Ok(())
    }

    /// One scheduling round: surfaces fatal errors, delivers pending worker
    /// events to the user callbacks, then runs the user tick.
    pub async fn poll(&mut self, cancel: &CancellationToken) -> Result<()> {
        if let Some(err) = self.ctx.err_center.first_error() {
            return Err(err);
        }
        if self.ctx.close_token.is_cancelled() {
            return Err(MasterError::MasterClosed);
        }

        let manager = self.ctx.worker_manager()?.clone();
        let mut bridge = EventBridge {
            ctx: &self.ctx,
            impl_: &mut self.impl_,
        };
        manager.tick(cancel, &mut bridge).await?;

        self.impl_.tick(&self.ctx).await
    }

    /// Runs the user close hook, stops background work and unregisters the
    /// message handlers within a bounded deadline.
    pub async fn close(&mut self) -> Result<()> {
        self.impl_.close_impl(&self.ctx).await?;

        self.ctx.close_token.cancel();
        if let Some(manager) = self.ctx.worker_manager.get() {
            manager.close().await;
        }

        let topics: Vec<Topic> = self.ctx.registered_topics.lock().drain(..).collect();
        let router = self.ctx.deps.message_router.clone();
        let cleanup = async move {
            for topic in &topics {
                let _ = router.unregister_handler(topic).await;
            }
        };
        if tokio::time::timeout(CLOSE_CLEANUP_TIMEOUT, cleanup).await.is_err() {
            tracing::warn!(
                master_id = %self.ctx.master_id,
                "failed to clean up message handlers in time"
            );
        }
        Ok(())
    }
}

/// Adapter running the manager's events through the user callbacks.
struct EventBridge<'a, M> {
    ctx: &'a Arc<MasterContext>,
    impl_: &'a mut M,
}

#[async_trait]
impl<M: MasterImpl> WorkerEventListener for EventBridge<'_, M> {
    async fn on_worker_online(&mut self, worker: WorkerHandle) -> Result<()> {
        self.impl_.on_worker_online(self.ctx, worker).await
    }

    async fn on_worker_offline(
        &mut self,
        worker: WorkerHandle,
        reason: MasterError,
    ) -> Result<()> {
        self.impl_.on_worker_offline(self.ctx, worker, reason).await
    }

    async fn on_worker_status_updated(&mut self, worker: WorkerHandle) -> Result<()> {
        let status = worker.status()?;
        self.impl_
            .on_worker_status_updated(self.ctx, worker, status)
            .await
    }

    async fn on_worker_dispatch_failed(
        &mut self,
        worker: WorkerHandle,
        err: MasterError,
    ) -> Result<()> {
        self.impl_
            .on_worker_dispatched(self.ctx, worker, Err(err))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MasterMeta;

    #[test]
    fn test_prepare_worker_config_sub_master_reuses_id() {
        let mut meta = MasterMeta::zeroed("sub-1".to_owned());
        meta.config = b"nested".to_vec();

        let (raw, worker_id) = prepare_worker_config(
            &WorkerType::SubMaster(7),
            &WorkerConfig::SubMaster(meta),
        )
        .unwrap();
        assert_eq!(worker_id, "sub-1");
        assert_eq!(raw, b"nested");
    }

    #[test]
    fn test_prepare_worker_config_generates_fresh_ids() {
        let config = WorkerConfig::Custom(serde_json::json!({"shard": 3}));
        let (raw1, id1) =
            prepare_worker_config(&WorkerType::Worker(1), &config).unwrap();
        let (_raw2, id2) =
            prepare_worker_config(&WorkerType::Worker(1), &config).unwrap();

        assert_ne!(id1, id2);
        let round_trip: serde_json::Value = serde_json::from_slice(&raw1).unwrap();
        assert_eq!(round_trip, serde_json::json!({"shard": 3}));
    }

    #[test]
    fn test_prepare_worker_config_rejects_mismatch() {
        let err = prepare_worker_config(
            &WorkerType::SubMaster(7),
            &WorkerConfig::Custom(serde_json::json!({})),
        )
        .unwrap_err();
        assert!(matches!(err, MasterError::InvalidMasterMeta(_)));
    }
}
