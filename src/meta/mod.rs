pub mod client;
pub mod kv;
pub mod mem;

pub use client::{MasterMetadataClient, WorkerMetadataClient};
pub use kv::{KvClient, Op};
pub use mem::MemKv;
