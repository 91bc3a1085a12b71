pub mod config;
pub mod error;
pub mod middleware;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{Result, WorkerErr};
pub use middleware::Middleware;
pub use worker::{FileStats, LocalTrainer, Trainer, Worker};
