use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::TimeoutConfig;
use crate::error::{MasterError, Result};
use crate::master::entry::{EntryState, WorkerEntry};
use crate::master::error_center::ErrorCenter;
use crate::master::event::{
    EventPreAction, MasterEvent, MasterEventKind, ENQUEUE_TIMEOUT, MAX_PENDING_EVENTS,
};
use crate::master::handle::{RunningHandle, TombstoneHandle, WorkerHandle};
use crate::meta::{KvClient, WorkerMetadataClient};
use crate::model::message::{HeartbeatPing, WorkerStatusMessage};
use crate::model::{Epoch, ExecutorId, MasterId, NodeId, WorkerId, WorkerStatusCode};

/// Soft deadline for one `tick`: events left after this much callback work
/// stay queued for the next poll.
const TICK_MAX_DURATION: std::time::Duration = std::time::Duration::from_secs(5);

/// Receiver of the state-change events drained by [`WorkerManager::tick`].
/// Implemented by the base master, which forwards to the user callbacks.
#[async_trait]
pub trait WorkerEventListener: Send {
    async fn on_worker_online(&mut self, worker: WorkerHandle) -> Result<()>;
    async fn on_worker_offline(&mut self, worker: WorkerHandle, reason: MasterError)
        -> Result<()>;
    async fn on_worker_status_updated(&mut self, worker: WorkerHandle) -> Result<()>;
    async fn on_worker_dispatch_failed(
        &mut self,
        worker: WorkerHandle,
        err: MasterError,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    /// Normal operation; the timeout checker is active.
    Ready,
    /// Recovery: persisted workers have not been loaded yet, heartbeats are
    /// dropped.
    LoadingMeta,
    /// Recovery: waiting for every pre-existing worker to heartbeat.
    WaitingHeartbeat,
}

struct ManagerInner {
    entries: HashMap<WorkerId, WorkerEntry>,
    state: ManagerState,
}

/// Shared state of the worker manager. Handles keep a weak reference to it
/// and resolve worker IDs under its lock on every call.
pub(crate) struct ManagerCore {
    master_id: MasterId,
    epoch: Epoch,
    inner: Mutex<ManagerInner>,
    event_tx: mpsc::Sender<MasterEvent>,
    message_sender: Arc<dyn crate::p2p::MessageSender>,
    worker_meta: WorkerMetadataClient,
    err_center: ErrorCenter,
    /// Cancelled when a heartbeat has been received from every worker found
    /// in the metadata during recovery.
    all_workers_ready: CancellationToken,
    close_token: CancellationToken,
    timeouts: TimeoutConfig,
}

impl ManagerCore {
    fn next_expire_time(&self) -> Instant {
        Instant::now() + self.timeouts.worker_expire_interval()
    }

    /// `<` drops the message, `==` accepts it, `>` is fatal: a master with a
    /// newer epoch exists and this instance must stop.
    fn epoch_matches(&self, msg_epoch: Epoch) -> bool {
        if msg_epoch > self.epoch {
            tracing::error!(
                master_id = %self.master_id,
                own_epoch = self.epoch,
                msg_epoch,
                "stale master still running"
            );
            self.err_center.on_error(MasterError::StaleMasterDetected {
                own: self.epoch,
                msg: msg_epoch,
            });
            return false;
        }
        if msg_epoch < self.epoch {
            tracing::info!(
                master_id = %self.master_id,
                own_epoch = self.epoch,
                msg_epoch,
                "message from smaller epoch dropped"
            );
            return false;
        }
        true
    }

    async fn enqueue_event(&self, event: MasterEvent) -> Result<()> {
        match self.event_tx.send_timeout(event, ENQUEUE_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Err(MasterError::TooManyPendingEvents)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(MasterError::MasterClosed),
        }
    }

    fn running_handle(core: &Arc<ManagerCore>, worker_id: &str) -> WorkerHandle {
        WorkerHandle::Running(RunningHandle {
            worker_id: worker_id.to_owned(),
            core: Arc::downgrade(core),
        })
    }

    fn tombstone_handle(core: &Arc<ManagerCore>, worker_id: &str) -> WorkerHandle {
        WorkerHandle::Tombstone(TombstoneHandle {
            worker_id: worker_id.to_owned(),
            core: Arc::downgrade(core),
        })
    }

    pub(crate) fn with_entry<R>(
        &self,
        worker_id: &str,
        f: impl FnOnce(&WorkerEntry) -> R,
    ) -> Option<R> {
        self.inner.lock().entries.get(worker_id).map(f)
    }

    pub(crate) fn message_sender(&self) -> &Arc<dyn crate::p2p::MessageSender> {
        &self.message_sender
    }

    pub(crate) fn worker_meta(&self) -> &WorkerMetadataClient {
        &self.worker_meta
    }

    /// Removes a tombstone entry from the map. Only the tombstone handle's
    /// `clean_meta` goes through here, never the event dispatcher. Idempotent.
    pub(crate) fn remove_tombstone_entry(&self, worker_id: &str) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get(worker_id) else {
            return;
        };
        if !entry.is_tombstone() {
            panic!("entry for worker {} is not a tombstone", worker_id);
        }
        inner.entries.remove(worker_id);
    }

    fn run_pre_action(&self, event: &MasterEvent) {
        match event.pre_action {
            EventPreAction::None => {}
            EventPreAction::RemoveEntry => {
                self.inner.lock().entries.remove(&event.worker_id);
            }
            EventPreAction::MarkTombstone => {
                if let Some(entry) = self.inner.lock().entries.get_mut(&event.worker_id) {
                    entry.mark_tombstone();
                }
            }
        }
    }
}

/// In-memory registry of every worker owned by one master.
///
/// Reconciles heartbeats, status notifications and dispatch outcomes into a
/// per-worker state machine, synthesizes events for the user callbacks, and
/// enforces worker timeouts from a background checker. All callbacks run
/// from [`WorkerManager::tick`] on the poll task.
pub struct WorkerManager {
    core: Arc<ManagerCore>,
    event_rx: tokio::sync::Mutex<mpsc::Receiver<MasterEvent>>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        master_id: MasterId,
        epoch: Epoch,
        kv: Arc<dyn KvClient>,
        message_sender: Arc<dyn crate::p2p::MessageSender>,
        is_init: bool,
        timeouts: TimeoutConfig,
        err_center: ErrorCenter,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(MAX_PENDING_EVENTS);
        let state = if is_init {
            ManagerState::Ready
        } else {
            ManagerState::LoadingMeta
        };

        let core = Arc::new(ManagerCore {
            worker_meta: WorkerMetadataClient::new(master_id.clone(), kv),
            master_id,
            epoch,
            inner: Mutex::new(ManagerInner {
                entries: HashMap::new(),
                state,
            }),
            event_tx,
            message_sender,
            err_center,
            all_workers_ready: CancellationToken::new(),
            close_token: CancellationToken::new(),
            timeouts,
        });

        let checker = tokio::spawn(Self::run_background_checker(core.clone()));

        Self {
            core,
            event_rx: tokio::sync::Mutex::new(event_rx),
            checker: Mutex::new(Some(checker)),
        }
    }

    /// True once the master is past recovery (or never needed one).
    pub fn is_initialized(&self) -> bool {
        self.core.inner.lock().state == ManagerState::Ready
    }

    /// Stops the background checker and releases internals.
    pub async fn close(&self) {
        self.core.close_token.cancel();
        let checker = self.checker.lock().take();
        if let Some(handle) = checker {
            let _ = handle.await;
        }
    }

    /// Recovery protocol, called once after a master restart.
    ///
    /// Blocks until every worker found in the metadata store has sent a
    /// heartbeat, or the worker timeout plus grace has elapsed. Workers that
    /// never came back are tombstoned silently: they went offline under a
    /// previous master generation, so no offline event is delivered.
    pub async fn init_after_recover(&self, cancel: &CancellationToken) -> Result<()> {
        let result = self.do_init_after_recover(cancel).await;
        if let Err(err) = &result {
            self.core.err_center.on_error(err.clone());
        }
        result
    }

    async fn do_init_after_recover(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let inner = self.core.inner.lock();
            if inner.state != ManagerState::LoadingMeta {
                panic!("init_after_recover called without a recovery pending");
            }
        }

        // Loading involves I/O; the lock stays released.
        let all_persisted = tokio::select! {
            res = self.core.worker_meta.load_all() => res?,
            _ = cancel.cancelled() => return Err(MasterError::Canceled),
        };

        {
            let mut inner = self.core.inner.lock();
            for (worker_id, status) in all_persisted {
                if status.code == WorkerStatusCode::Finished {
                    // Already reported terminal once.
                    continue;
                }
                inner.entries.insert(
                    worker_id.clone(),
                    WorkerEntry::new_waiting(worker_id, status, self.core.next_expire_time()),
                );
            }

            if inner.entries.is_empty() {
                // Fast path when there is no active worker.
                inner.state = ManagerState::Ready;
                return Ok(());
            }
            inner.state = ManagerState::WaitingHeartbeat;
        }

        let started = Instant::now();
        tokio::select! {
            _ = cancel.cancelled() => return Err(MasterError::Canceled),
            _ = self.core.err_center.on_first_error() => {
                return Err(self
                    .core
                    .err_center
                    .first_error()
                    .unwrap_or(MasterError::Canceled));
            }
            _ = self.core.all_workers_ready.cancelled() => {
                tracing::info!(
                    master_id = %self.core.master_id,
                    elapsed = ?started.elapsed(),
                    "all workers sent heartbeats after failover, resuming"
                );
            }
            _ = tokio::time::sleep(self.core.timeouts.worker_expire_interval()) => {
                let mut inner = self.core.inner.lock();
                for entry in inner.entries.values_mut() {
                    if entry.state() == EntryState::Wait {
                        tracing::info!(
                            master_id = %self.core.master_id,
                            worker_id = %entry.worker_id(),
                            "worker did not come back after failover, tombstoned"
                        );
                        entry.mark_tombstone();
                    }
                }
            }
        }

        self.core.inner.lock().state = ManagerState::Ready;
        Ok(())
    }

    /// Advances the sender's entry on a heartbeat ping. May run on any task.
    pub async fn handle_heartbeat(&self, msg: HeartbeatPing, from_node: NodeId) {
        let core = &self.core;
        let event = {
            let mut inner = core.inner.lock();
            if inner.state == ManagerState::LoadingMeta {
                return;
            }
            if !core.epoch_matches(msg.epoch) {
                return;
            }
            let state = inner.state;
            let Some(entry) = inner.entries.get_mut(&msg.from_worker_id) else {
                tracing::info!(
                    master_id = %core.master_id,
                    worker_id = %msg.from_worker_id,
                    from_node = %from_node,
                    "heartbeat from unknown worker dropped"
                );
                return;
            };
            entry.set_expire_at(core.next_expire_time());

            if state == ManagerState::WaitingHeartbeat {
                if entry.state() == EntryState::Wait {
                    tracing::info!(
                        master_id = %core.master_id,
                        worker_id = %msg.from_worker_id,
                        executor_id = %from_node,
                        "worker discovered after failover"
                    );
                    // Recovery is transparent to the user: no online event.
                    entry.mark_online(
                        ExecutorId::from(from_node.clone()),
                        core.next_expire_time(),
                    );

                    let all_ready = inner
                        .entries
                        .values()
                        .all(|e| e.state() != EntryState::Wait);
                    if all_ready {
                        core.all_workers_ready.cancel();
                    }
                }
                None
            } else if entry.state() == EntryState::Created {
                entry.mark_online(
                    ExecutorId::from(from_node.clone()),
                    core.next_expire_time(),
                );
                Some(MasterEvent {
                    worker_id: msg.from_worker_id.clone(),
                    handle: ManagerCore::running_handle(core, &msg.from_worker_id),
                    kind: MasterEventKind::WorkerOnline,
                    pre_action: EventPreAction::None,
                })
            } else {
                // Not the first heartbeat; the refreshed expire time is all
                // that matters.
                None
            }
        };

        if let Some(event) = event {
            if let Err(err) = core.enqueue_event(event).await {
                core.err_center.on_error(err);
            }
        }
    }

    /// Records an asynchronous status notification for the addressed entry.
    /// The checker turns it into a `WorkerStatusUpdated` event.
    pub fn on_worker_status_update_message(&self, msg: WorkerStatusMessage) {
        let mut inner = self.core.inner.lock();
        if !self.core.epoch_matches(msg.master_epoch) {
            return;
        }
        match inner.entries.get_mut(&msg.worker) {
            Some(entry) => entry.status_reader().on_notification(msg.status),
            None => {
                tracing::info!(
                    master_id = %self.core.master_id,
                    worker_id = %msg.worker,
                    "status message for unknown worker dropped"
                );
            }
        }
    }

    /// Called by the dispatch pipeline right before the dispatch request is
    /// sent; from here on the worker is visible to the manager.
    ///
    /// Panics if the worker already has an entry: worker IDs are minted
    /// fresh per dispatch, so a duplicate is a framework bug.
    pub fn before_starting_worker(&self, worker_id: WorkerId, executor_id: ExecutorId) {
        let mut inner = self.core.inner.lock();
        if inner.entries.contains_key(&worker_id) {
            panic!("worker {} already has an entry", worker_id);
        }
        inner.entries.insert(
            worker_id.clone(),
            WorkerEntry::new_created(worker_id, executor_id, self.core.next_expire_time()),
        );
    }

    /// Called by the dispatch pipeline when starting the worker has failed
    /// for sure. A transport error whose request may already be executing is
    /// NOT such a failure.
    pub async fn abort_creating_worker(&self, worker_id: WorkerId, err: MasterError) {
        tracing::info!(
            master_id = %self.core.master_id,
            worker_id = %worker_id,
            error = %err,
            "worker creation aborted"
        );
        let event = MasterEvent {
            handle: ManagerCore::tombstone_handle(&self.core, &worker_id),
            kind: MasterEventKind::WorkerDispatchFailed { err },
            pre_action: EventPreAction::RemoveEntry,
            worker_id,
        };
        if let Err(err) = self.core.enqueue_event(event).await {
            self.core.err_center.on_error(err);
        }
    }

    /// Drains pending events and delivers them to `listener`, which runs the
    /// user callbacks. Must be called from a single task; a 5-second soft
    /// deadline bounds the callback work per poll.
    pub async fn tick(
        &self,
        cancel: &CancellationToken,
        listener: &mut dyn WorkerEventListener,
    ) -> Result<()> {
        if let Some(err) = self.core.err_center.first_error() {
            return Err(err);
        }

        let deadline = Instant::now() + TICK_MAX_DURATION;
        let mut event_rx = self.event_rx.lock().await;
        loop {
            if cancel.is_cancelled() {
                return Err(MasterError::Canceled);
            }
            if let Some(err) = self.core.err_center.first_error() {
                return Err(err);
            }
            if Instant::now() >= deadline {
                return Ok(());
            }

            let event = match event_rx.try_recv() {
                Ok(event) => event,
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
            };

            self.core.run_pre_action(&event);
            match event.kind {
                MasterEventKind::WorkerOnline => {
                    listener.on_worker_online(event.handle).await?;
                }
                MasterEventKind::WorkerOffline { reason } => {
                    listener.on_worker_offline(event.handle, reason).await?;
                }
                MasterEventKind::WorkerStatusUpdated => {
                    listener.on_worker_status_updated(event.handle).await?;
                }
                MasterEventKind::WorkerDispatchFailed { err } => {
                    listener.on_worker_dispatch_failed(event.handle, err).await?;
                }
            }
        }
    }

    /// Snapshot of every live and tombstoned worker.
    pub fn get_workers(&self) -> HashMap<WorkerId, WorkerHandle> {
        let inner = self.core.inner.lock();
        inner
            .entries
            .iter()
            .map(|(worker_id, entry)| {
                let handle = if entry.is_tombstone() {
                    ManagerCore::tombstone_handle(&self.core, worker_id)
                } else {
                    ManagerCore::running_handle(&self.core, worker_id)
                };
                (worker_id.clone(), handle)
            })
            .collect()
    }

    async fn run_background_checker(core: Arc<ManagerCore>) {
        let mut ticker = tokio::time::interval(core.timeouts.master_check_interval);
        loop {
            tokio::select! {
                _ = core.close_token.cancelled() => {
                    tracing::info!(master_id = %core.master_id, "timeout checker exited");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = Self::check_worker_entries_once(&core).await {
                        core.err_center.on_error(err);
                        return;
                    }
                }
            }
        }
    }

    async fn check_worker_entries_once(core: &Arc<ManagerCore>) -> Result<()> {
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut inner = core.inner.lock();
            if inner.state != ManagerState::Ready {
                // Timeouts during the waiting period are handled inside
                // init_after_recover.
                return Ok(());
            }

            for (worker_id, entry) in inner.entries.iter_mut() {
                match entry.state() {
                    // Prevents repeated delivery of the offline event.
                    EntryState::Offline | EntryState::Tombstone => continue,
                    _ => {}
                }

                if entry.expire_at() > now {
                    // A notification only becomes an event once the worker
                    // is online, so events stay in state-machine order.
                    if entry.state() == EntryState::Online
                        && entry.status_reader().take_pending().is_some()
                    {
                        events.push(MasterEvent {
                            worker_id: worker_id.clone(),
                            handle: ManagerCore::running_handle(core, worker_id),
                            kind: MasterEventKind::WorkerStatusUpdated,
                            pre_action: EventPreAction::None,
                        });
                    }
                    continue;
                }

                entry.mark_offline();
                let reason = entry.offline_reason();
                tracing::info!(
                    master_id = %core.master_id,
                    worker_id = %worker_id,
                    reason = %reason,
                    "worker timed out"
                );
                events.push(MasterEvent {
                    worker_id: worker_id.clone(),
                    handle: ManagerCore::tombstone_handle(core, worker_id),
                    kind: MasterEventKind::WorkerOffline { reason },
                    pre_action: EventPreAction::MarkTombstone,
                });
            }
        }

        // Enqueueing can wait up to a second; never under the lock.
        for event in events {
            core.enqueue_event(event).await?;
        }
        Ok(())
    }
}
