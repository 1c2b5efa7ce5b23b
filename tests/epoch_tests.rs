mod common;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{events_for, settle, test_master, Recorded, TestEnv};
use jobmaster::error::MasterError;
use jobmaster::model::{WorkerConfig, WorkerStatusCode, WorkerType};

/// A message carrying a newer epoch proves a newer master generation exists:
/// this instance must stop, surfacing the fatal error from `poll`.
#[tokio::test(start_paused = true)]
async fn test_newer_epoch_heartbeat_is_fatal() {
    let env = TestEnv::new();
    let (mut master, _events) = test_master(&env, "job-1");
    let cancel = CancellationToken::new();
    master.init(&cancel).await.unwrap();
    let epoch = master.master_meta().epoch;

    env.send_heartbeat("job-1", "w1", "exec-1", epoch + 1).await;

    let err = master.poll(&cancel).await.unwrap_err();
    assert!(matches!(err, MasterError::StaleMasterDetected { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_newer_epoch_status_message_is_fatal() {
    let env = TestEnv::new();
    let (mut master, _events) = test_master(&env, "job-1");
    let cancel = CancellationToken::new();
    master.init(&cancel).await.unwrap();
    let epoch = master.master_meta().epoch;

    env.send_worker_status("job-1", "w1", epoch + 1, WorkerStatusCode::Normal)
        .await;

    let err = master.poll(&cancel).await.unwrap_err();
    assert!(matches!(err, MasterError::StaleMasterDetected { .. }));
}

/// Messages from an older epoch never influence state: the stale status is
/// dropped and the entry keeps its current status.
#[tokio::test(start_paused = true)]
async fn test_stale_epoch_messages_are_dropped() {
    let env = TestEnv::new();
    let (mut master, events) = test_master(&env, "job-1");
    let cancel = CancellationToken::new();
    master.init(&cancel).await.unwrap();
    let epoch = master.master_meta().epoch;

    env.scheduler.push_placement("exec-1", "127.0.0.1:9200");
    let wid = master
        .create_worker(
            WorkerType::Worker(1),
            WorkerConfig::Custom(serde_json::json!({})),
            1,
        )
        .await
        .unwrap();
    settle().await;
    env.send_heartbeat("job-1", &wid, "exec-1", epoch).await;
    master.poll(&cancel).await.unwrap();

    // Status update and heartbeat from the previous generation.
    env.send_worker_status("job-1", &wid, epoch - 1, WorkerStatusCode::Error)
        .await;
    env.send_heartbeat("job-1", "w-stale", "exec-9", epoch - 1)
        .await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    master.poll(&cancel).await.unwrap();

    assert_eq!(events_for(&events, &wid), vec![Recorded::Online(wid.clone())]);
    let workers = master.get_workers();
    assert_eq!(
        workers[&wid].status().unwrap().code,
        WorkerStatusCode::Created
    );
}
