use std::{collections::BTreeSet, net::SocketAddr, num::NonZeroUsize};

use comms::{
    Connections, DistMessage, MsgKind, Retry,
    proto::{PullRequest, PushNotify, ShardFn, Tensor, TensorMap, merge_tensor_maps},
};
use log::{debug, info};

use crate::error::{Result, WorkerErr};

/// The communication manager between the worker process and the many parameter servers.
///
/// Requests are split by a `ShardFn` so every dense tensor and sparse row is
/// read from and written to the shard that owns it.
pub struct Middleware {
    endpoints: Vec<SocketAddr>,
    conns: Connections,
    shard_fn: ShardFn,
    dense: BTreeSet<String>,
}

impl Middleware {
    /// Connects to every parameter server.
    ///
    /// # Arguments
    /// * `endpoints` - The addresses of the parameter servers, in shard order.
    /// * `retry` - How many times and how often to retry each of them.
    ///
    /// # Returns
    /// A new `Middleware` instance.
    pub async fn connect(endpoints: &[SocketAddr], retry: Retry) -> Result<Self> {
        let shard_count = NonZeroUsize::new(endpoints.len())
            .ok_or_else(|| WorkerErr::InvalidConfig("ps_endpoints must not be empty".into()))?;

        let conns = Connections::connect_retry(endpoints, retry).await?;

        Ok(Self {
            endpoints: endpoints.to_vec(),
            conns,
            shard_fn: ShardFn::new(shard_count),
            dense: BTreeSet::new(),
        })
    }

    pub fn shard_fn(&self) -> ShardFn {
        self.shard_fn
    }

    /// Returns the names of the dense tensors seen so far.
    pub fn dense(&self) -> &BTreeSet<String> {
        &self.dense
    }

    /// Pulls the requested parameters from the shards owning them.
    ///
    /// Shards with nothing to serve aren't contacted.
    ///
    /// # Arguments
    /// * `req` - The dense tensors and sparse rows to read.
    ///
    /// # Returns
    /// The union of every shard's response.
    pub async fn pull(&mut self, req: &PullRequest) -> Result<TensorMap> {
        self.dense.extend(req.tsr_set.iter().cloned());

        let msgs = self
            .shard_fn
            .split_pull_request(req)
            .into_iter()
            .map(|part| (!part.is_empty()).then_some(DistMessage::PullRequest(part)))
            .collect();

        let responses = self.conns.rpc_masked(msgs).await?;
        let mut parts = Vec::with_capacity(responses.len());

        for (&peer, response) in self.endpoints.iter().zip(responses) {
            match response {
                Some(DistMessage::PullResponse(params)) => parts.push(params),
                Some(msg) => {
                    return Err(WorkerErr::UnexpectedMessage {
                        peer,
                        expected: MsgKind::PullResponse,
                        got: msg.kind(),
                    });
                }
                None => {}
            }
        }

        let params = merge_tensor_maps(parts);

        for (name, tensor) in &params {
            if matches!(tensor, Tensor::Dense(_)) && !self.dense.contains(name) {
                self.dense.insert(name.clone());
            }
        }

        debug!(tensors = params.len(); "pulled parameters");
        Ok(params)
    }

    /// Pushes gradients and overwritten parameters to the shards owning them.
    ///
    /// Nothing is awaited past the write, parameter servers don't answer pushes.
    pub async fn push(&mut self, push: PushNotify) -> Result<()> {
        if push.is_empty() {
            return Ok(());
        }

        let msgs = self
            .shard_fn
            .split_push(push, &self.dense)
            .into_iter()
            .map(|part| (!part.is_empty()).then_some(DistMessage::PushNotify(part)))
            .collect();

        self.conns.rpc_masked(msgs).await?;
        Ok(())
    }

    /// Asks every parameter server to save its shard of the model.
    ///
    /// # Arguments
    /// * `epoch` - The epoch being saved.
    /// * `timestamp` - Appended to the checkpoint directory when not empty.
    ///
    /// # Returns
    /// The path of every saved shard, in shard order.
    pub async fn save_model(&mut self, epoch: u32, timestamp: &str) -> Result<Vec<String>> {
        let msg = DistMessage::ModelSaveRequest {
            epoch,
            timestamp: timestamp.to_string(),
        };

        let responses = self.conns.broadcast(&msg).await?;
        let mut paths = Vec::with_capacity(responses.len());

        for (&peer, response) in self.endpoints.iter().zip(responses) {
            match response {
                Some(DistMessage::ModelSaveResponse { saved: true, path }) => paths.push(path),
                _ => return Err(WorkerErr::SaveFailed { peer }),
            }
        }

        info!(epoch = epoch + 1; "model saved");
        Ok(paths)
    }

    /// Tells every parameter server to stop.
    pub async fn terminate(mut self) -> Result<()> {
        self.conns.broadcast(&DistMessage::TerminationNotify).await?;
        info!("parameter servers terminated");
        Ok(())
    }

    /// Closes every connection.
    pub async fn close(self) -> Result<()> {
        self.conns.close().await?;
        Ok(())
    }
}
