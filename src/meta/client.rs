use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MasterError, Result};
use crate::meta::kv::KvClient;
use crate::model::{Epoch, MasterId, MasterMeta, WorkerId, WorkerStatus};

pub fn master_meta_key(master_id: &str) -> String {
    format!("/master/{}", master_id)
}

pub fn worker_meta_prefix(master_id: &str) -> String {
    format!("/worker/{}/", master_id)
}

pub fn worker_meta_key(master_id: &str, worker_id: &str) -> String {
    format!("/worker/{}/{}", master_id, worker_id)
}

/// Typed access to the persisted record of one master.
#[derive(Clone)]
pub struct MasterMetadataClient {
    master_id: MasterId,
    kv: Arc<dyn KvClient>,
}

impl MasterMetadataClient {
    pub fn new(master_id: MasterId, kv: Arc<dyn KvClient>) -> Self {
        Self { master_id, kv }
    }

    /// Loads the master record. An absent key yields a fresh zeroed record
    /// keyed by this master ID; "not found" is never an error.
    pub async fn load(&self) -> Result<MasterMeta> {
        let key = master_meta_key(&self.master_id);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_slice(&raw).map_err(MasterError::serde),
            None => Ok(MasterMeta::zeroed(self.master_id.clone())),
        }
    }

    /// Unconditional overwrite of the single master key.
    pub async fn store(&self, meta: &MasterMeta) -> Result<()> {
        let raw = serde_json::to_vec(meta).map_err(MasterError::serde)?;
        self.kv.put(&master_meta_key(&self.master_id), raw).await
    }

    pub async fn gen_epoch(&self) -> Result<Epoch> {
        self.kv.gen_epoch().await
    }
}

/// Typed access to the per-worker records of one master.
#[derive(Clone)]
pub struct WorkerMetadataClient {
    master_id: MasterId,
    kv: Arc<dyn KvClient>,
}

impl WorkerMetadataClient {
    pub fn new(master_id: MasterId, kv: Arc<dyn KvClient>) -> Self {
        Self { master_id, kv }
    }

    /// Range-read of every worker registered under this master.
    pub async fn load_all(&self) -> Result<HashMap<WorkerId, WorkerStatus>> {
        let prefix = worker_meta_prefix(&self.master_id);
        let mut ret = HashMap::new();
        for (key, raw) in self.kv.get_prefix(&prefix).await? {
            let worker_id = key[prefix.len()..].to_owned();
            let status: WorkerStatus =
                serde_json::from_slice(&raw).map_err(MasterError::serde)?;
            ret.insert(worker_id, status);
        }
        Ok(ret)
    }

    pub async fn load(&self, worker_id: &str) -> Result<Option<WorkerStatus>> {
        let key = worker_meta_key(&self.master_id, worker_id);
        match self.kv.get(&key).await? {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(MasterError::serde)?,
            )),
            None => Ok(None),
        }
    }

    pub async fn store(&self, worker_id: &str, status: &WorkerStatus) -> Result<()> {
        let raw = serde_json::to_vec(status).map_err(MasterError::serde)?;
        self.kv
            .put(&worker_meta_key(&self.master_id, worker_id), raw)
            .await
    }

    pub async fn delete(&self, worker_id: &str) -> Result<()> {
        self.kv
            .delete(&worker_meta_key(&self.master_id, worker_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::mem::MemKv;
    use crate::model::{MasterStatusCode, WorkerStatusCode};

    #[tokio::test]
    async fn test_master_meta_load_absent_yields_zeroed() {
        let kv = Arc::new(MemKv::new());
        let client = MasterMetadataClient::new("m1".to_owned(), kv);

        let meta = client.load().await.unwrap();
        assert_eq!(meta.id, "m1");
        assert_eq!(meta.epoch, 0);
        assert_eq!(meta.status, MasterStatusCode::Uninit);
    }

    #[tokio::test]
    async fn test_master_meta_round_trip() {
        let kv = Arc::new(MemKv::new());
        let client = MasterMetadataClient::new("m1".to_owned(), kv);

        let mut meta = MasterMeta::zeroed("m1".to_owned());
        meta.epoch = 7;
        meta.node_id = "node-a".to_owned();
        meta.addr = "10.0.0.1:9000".to_owned();
        meta.status = MasterStatusCode::Init;
        client.store(&meta).await.unwrap();

        assert_eq!(client.load().await.unwrap(), meta);
    }

    #[tokio::test]
    async fn test_worker_meta_load_all_scoped_to_master() {
        let kv = Arc::new(MemKv::new());
        let m1 = WorkerMetadataClient::new("m1".to_owned(), kv.clone());
        let m2 = WorkerMetadataClient::new("m2".to_owned(), kv);

        m1.store("w1", &WorkerStatus::new(WorkerStatusCode::Normal))
            .await
            .unwrap();
        m1.store("w2", &WorkerStatus::new(WorkerStatusCode::Finished))
            .await
            .unwrap();
        m2.store("w9", &WorkerStatus::new(WorkerStatusCode::Error))
            .await
            .unwrap();

        let all = m1.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["w1"].code, WorkerStatusCode::Normal);
        assert_eq!(all["w2"].code, WorkerStatusCode::Finished);
    }

    #[tokio::test]
    async fn test_worker_meta_delete_is_idempotent() {
        let kv = Arc::new(MemKv::new());
        let client = WorkerMetadataClient::new("m1".to_owned(), kv);

        client
            .store("w1", &WorkerStatus::new(WorkerStatusCode::Normal))
            .await
            .unwrap();
        client.delete("w1").await.unwrap();
        assert_eq!(client.load("w1").await.unwrap(), None);
        client.delete("w1").await.unwrap();
    }
}
