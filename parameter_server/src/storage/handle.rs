use std::{
    io,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use comms::proto::{PullRequest, PushNotify, TensorMap};
use tokio::task;

use crate::ModelShard;

/// The actual interface to interact with a `ModelShard` from the async runtime.
///
/// It bridges the async runtime with the blocking CPU-bound implementation of the `ModelShard`.
#[derive(Clone)]
pub struct ShardHandle(Arc<ModelShard>);

impl Deref for ShardHandle {
    type Target = ModelShard;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ShardHandle {
    /// Creates a new `ShardHandle`.
    ///
    /// # Arguments
    /// * `shard` - The underlying model shard.
    ///
    /// # Returns
    /// A new `ShardHandle` instance.
    pub fn new(shard: ModelShard) -> Self {
        Self(Arc::new(shard))
    }

    /// Async call to the synchronous implementation of `ModelShard::pull`.
    pub async fn pull(&self, req: PullRequest) -> TensorMap {
        task::block_in_place(|| self.0.pull(req))
    }

    /// Async call to the synchronous implementation of `ModelShard::push`.
    ///
    /// # Returns
    /// An io error if a tensor doesn't match its parameter.
    pub async fn push(&self, push: PushNotify) -> io::Result<()> {
        task::block_in_place(|| self.0.push(push))
    }

    /// Async call to the synchronous implementation of `ModelShard::save`.
    ///
    /// # Arguments
    /// * `dir` - The root checkpoint directory.
    /// * `epoch` - The epoch that just completed.
    /// * `timestamp` - An optional tag, empty for none.
    pub async fn save(&self, dir: &Path, epoch: u32, timestamp: &str) -> io::Result<PathBuf> {
        task::block_in_place(|| self.0.save(dir, epoch, timestamp))
    }
}
