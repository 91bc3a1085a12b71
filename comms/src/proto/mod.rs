//! The model level types shared by workers and parameter servers.

mod pull;
mod shard;
mod tensor;

pub use pull::{Freq, IdFreqMap, IdSet, PullRequest, PushNotify, Ts};
pub use shard::{ShardFn, merge_tensor_maps};
pub use tensor::{DenseTensor, Id, SparseRows, Tensor, TensorMap, shape_len};
