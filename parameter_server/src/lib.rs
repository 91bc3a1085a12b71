pub mod config;
pub mod error;
pub mod initialization;
mod model_shard;
pub mod optimization;
pub mod service;
pub mod sparse;
pub mod storage;

pub use config::ServerConfig;
pub use error::PsErr;
pub use model_shard::{ModelShard, checkpoint_dir};
pub use service::ParamServer;
pub use storage::ShardHandle;
