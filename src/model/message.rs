use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Epoch, WorkerId, WorkerStatus};

/// Name of a point-to-point channel on the message bus.
pub type Topic = String;

/// Periodic ping from a worker to its master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub from_worker_id: WorkerId,
    pub send_time: DateTime<Utc>,
    pub epoch: Epoch,
}

/// Reply from the master; the sole source of worker liveness on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPong {
    pub send_time: DateTime<Utc>,
    pub reply_time: DateTime<Utc>,
    pub to_worker_id: WorkerId,
    pub epoch: Epoch,
}

/// Asynchronous status notification from a worker to its master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusMessage {
    pub worker: WorkerId,
    pub master_epoch: Epoch,
    pub status: WorkerStatus,
}

pub fn heartbeat_ping_topic(master_id: &str) -> Topic {
    format!("heartbeat-ping/{}", master_id)
}

pub fn heartbeat_pong_topic(master_id: &str, worker_id: &str) -> Topic {
    format!("heartbeat-pong/{}/{}", master_id, worker_id)
}

pub fn worker_status_topic(master_id: &str) -> Topic {
    format!("worker-status/{}", master_id)
}

/// Ack channel a master uses to confirm a status update back to the worker.
/// Registered by the worker side; the master only constructs the name.
pub fn worker_status_updated_topic(master_id: &str) -> Topic {
    format!("worker-status-updated/{}", master_id)
}
