pub mod client;
pub mod config;
pub mod error;
pub mod master;
pub mod meta;
pub mod model;
pub mod p2p;

pub use error::{MasterError, Result};
pub use master::{BaseMaster, MasterContext, MasterDeps, MasterImpl, WorkerHandle};
