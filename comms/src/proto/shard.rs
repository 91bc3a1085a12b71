use std::{collections::BTreeSet, num::NonZeroUsize};

use crate::proto::{Id, PullRequest, PushNotify, SparseRows, Tensor, TensorMap};

/// Decides which parameter server shard owns each dense tensor and sparse row.
///
/// Dense tensors are placed by a hash of their name, sparse rows by their id,
/// so every sparse tensor is spread across all the shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardFn {
    shard_count: NonZeroUsize,
}

impl ShardFn {
    /// Creates a new `ShardFn`.
    ///
    /// # Arguments
    /// * `shard_count` - The amount of parameter server shards.
    pub fn new(shard_count: NonZeroUsize) -> Self {
        Self { shard_count }
    }

    /// Returns the amount of shards.
    pub fn shard_count(&self) -> usize {
        self.shard_count.get()
    }

    /// Returns the shard owning the dense tensor `name`.
    pub fn tensor_shard(&self, name: &str) -> usize {
        (fnv1a(name.as_bytes()) % self.shard_count.get() as u64) as usize
    }

    /// Returns the shard owning the sparse row `id`.
    pub fn id_shard(&self, id: Id) -> usize {
        (id % self.shard_count.get() as u64) as usize
    }

    /// Splits a pull request into one request per shard.
    ///
    /// The observed id frequencies travel with the ids they belong to.
    ///
    /// # Arguments
    /// * `req` - The request to split.
    ///
    /// # Returns
    /// A request per shard, some of them possibly empty.
    pub fn split_pull_request(&self, req: &PullRequest) -> Vec<PullRequest> {
        let mut out: Vec<_> = (0..self.shard_count())
            .map(|_| PullRequest {
                is_train: req.is_train,
                ..Default::default()
            })
            .collect();

        for name in &req.tsr_set {
            out[self.tensor_shard(name)].tsr_set.insert(name.clone());
        }

        for (name, ids) in &req.srm_map {
            for &id in ids {
                out[self.id_shard(id)]
                    .srm_map
                    .entry(name.clone())
                    .or_default()
                    .insert(id);
            }
        }

        for (&id, &freq) in &req.id_freq_map {
            out[self.id_shard(id)].id_freq_map.insert(id, freq);
        }

        out
    }

    /// Splits a tensor map into one map per shard.
    ///
    /// Sparse rows addressing the rows of a dense tensor are not spread by id,
    /// they go whole to the shard owning that tensor.
    ///
    /// # Arguments
    /// * `tensors` - The tensors to split.
    /// * `dense` - The names of the dense tensors.
    ///
    /// # Returns
    /// A map per shard, some of them possibly empty.
    pub fn split_tensor_map(&self, tensors: TensorMap, dense: &BTreeSet<String>) -> Vec<TensorMap> {
        let mut out = vec![TensorMap::new(); self.shard_count()];

        for (name, tensor) in tensors {
            match tensor {
                Tensor::Sparse(srm) if !dense.contains(&name) => {
                    let mut parts = vec![SparseRows::new(srm.col); self.shard_count()];

                    for (id, row) in srm.rows {
                        parts[self.id_shard(id)].rows.insert(id, row);
                    }

                    for (map, part) in out.iter_mut().zip(parts) {
                        if !part.is_empty() {
                            map.insert(name.clone(), Tensor::Sparse(part));
                        }
                    }
                }
                tensor => {
                    let shard = self.tensor_shard(&name);
                    out[shard].insert(name, tensor);
                }
            }
        }

        out
    }

    /// Splits a push into one push per shard.
    pub fn split_push(&self, push: PushNotify, dense: &BTreeSet<String>) -> Vec<PushNotify> {
        let grads = self.split_tensor_map(push.grad, dense);
        let overwritten = self.split_tensor_map(push.overwritten, dense);

        grads
            .into_iter()
            .zip(overwritten)
            .map(|(grad, overwritten)| PushNotify { grad, overwritten })
            .collect()
    }
}

/// Merges the per shard responses of a pull back into a single map.
///
/// # Arguments
/// * `parts` - The pulled parameters of each shard.
///
/// # Returns
/// The union of all the parts, sparse rows of the same tensor are joined.
pub fn merge_tensor_maps<I>(parts: I) -> TensorMap
where
    I: IntoIterator<Item = TensorMap>,
{
    let mut out = TensorMap::new();

    for part in parts {
        for (name, tensor) in part {
            match (out.get_mut(&name), tensor) {
                (Some(Tensor::Sparse(acc)), Tensor::Sparse(srm)) => acc.rows.extend(srm.rows),
                (_, tensor) => {
                    out.insert(name, tensor);
                }
            }
        }
    }

    out
}

/// Stable 64 bit FNV-1a hash, the placement of dense tensors must not change between builds.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ b as u64).wrapping_mul(PRIME))
}
