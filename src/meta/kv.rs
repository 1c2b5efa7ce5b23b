use async_trait::async_trait;

use crate::error::Result;
use crate::model::Epoch;

/// One write operation for [`KvClient::txn`].
#[derive(Debug, Clone)]
pub enum Op {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Versioned key-value store shared by all masters of a cluster.
///
/// Values are opaque byte sequences; the typed clients in
/// [`crate::meta::client`] define the encoding. Implementations must be safe
/// for concurrent use.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Range-read of every key starting with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Range-read of `[start, end)`, in key order.
    async fn get_range(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Range-read of every key greater than or equal to `key`.
    async fn get_from(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Deletes the range `[start, end)`.
    async fn delete_range(&self, start: &str, end: &str) -> Result<()>;

    /// Applies a single op outside a transaction.
    async fn do_op(&self, op: Op) -> Result<()>;

    /// Applies all `ops` atomically under snapshot isolation; any failure
    /// rolls the whole transaction back.
    async fn txn(&self, ops: Vec<Op>) -> Result<()>;

    /// Returns an integer strictly increasing across the cluster. Used to
    /// fence master generations.
    async fn gen_epoch(&self) -> Result<Epoch>;
}
