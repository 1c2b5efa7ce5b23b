use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::meta::kv::{KvClient, Op};
use crate::model::Epoch;

/// In-memory [`KvClient`] backed by an ordered map and a revision counter.
///
/// Every mutation bumps the revision; `gen_epoch` bumps and returns it, which
/// makes epochs strictly increasing for all masters sharing one store. Used
/// by tests and in-process deployments.
#[derive(Debug, Default)]
pub struct MemKv {
    inner: Mutex<MemKvInner>,
}

#[derive(Debug, Default)]
struct MemKvInner {
    data: BTreeMap<String, Vec<u8>>,
    revision: i64,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(inner: &mut MemKvInner, op: &Op) {
        match op {
            Op::Put { key, value } => {
                inner.data.insert(key.clone(), value.clone());
            }
            Op::Delete { key } => {
                inner.data.remove(key);
            }
        }
        inner.revision += 1;
    }
}

#[async_trait]
impl KvClient for MemKv {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::apply(
            &mut inner,
            &Op::Put {
                key: key.to_owned(),
                value,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().data.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock();
        Ok(inner
            .data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_range(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock();
        Ok(inner
            .data
            .range(start.to_owned()..end.to_owned())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_from(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock();
        Ok(inner
            .data
            .range(key.to_owned()..)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::apply(&mut inner, &Op::Delete { key: key.to_owned() });
        Ok(())
    }

    async fn delete_range(&self, start: &str, end: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .data
            .range(start.to_owned()..end.to_owned())
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            Self::apply(&mut inner, &Op::Delete { key });
        }
        Ok(())
    }

    async fn do_op(&self, op: Op) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::apply(&mut inner, &op);
        Ok(())
    }

    async fn txn(&self, ops: Vec<Op>) -> Result<()> {
        // Single lock acquisition makes the batch atomic.
        let mut inner = self.inner.lock();
        for op in &ops {
            Self::apply(&mut inner, op);
        }
        Ok(())
    }

    async fn gen_epoch(&self) -> Result<Epoch> {
        let mut inner = self.inner.lock();
        inner.revision += 1;
        Ok(inner.revision)
    }
}
