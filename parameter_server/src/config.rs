use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf};

use comms::proto::{Freq, Ts};
use serde::Deserialize;

use crate::{sparse::Baseline, storage::Graph};

/// The configuration of a parameter server shard.
///
/// Loaded from JSON with `key=value` overrides, every field but `graph` has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// The amount of I/O threads of the runtime.
    pub thread: NonZeroUsize,
    pub shard_id: usize,
    pub shard_count: NonZeroUsize,
    pub graph: Graph,
    pub optimizer: String,
    /// The optimizer's hyperparameters as `key=value;key=value`.
    pub optimizer_config: String,
    /// The amount of locks each sparse table is split into.
    pub lock_shards: NonZeroUsize,
    /// `0` disables the frequency filter.
    pub freq_filter_threshold: Freq,
    /// `0` disables expiry.
    pub expire_threshold: Ts,
    pub ts_now: Ts,
    pub ts_baseline: Baseline,
    /// A checkpoint directory to warm start from.
    pub in_model: Option<PathBuf>,
    /// Where `ModelSaveRequest`s write checkpoints.
    pub out_model: PathBuf,
    pub seed: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 61000)),
            thread: NonZeroUsize::MIN,
            shard_id: 0,
            shard_count: NonZeroUsize::MIN,
            graph: Graph::default(),
            optimizer: "sgd".to_string(),
            optimizer_config: String::new(),
            lock_shards: NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
            freq_filter_threshold: 0,
            expire_threshold: 0,
            ts_now: 0,
            ts_baseline: Baseline::Zero,
            in_model: None,
            out_model: PathBuf::from("model"),
            seed: 9527,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_defaults() {
        let config: ServerConfig = comms::config::load(
            None,
            "shard_id=1;shard_count=2;listen=127.0.0.1:9000;optimizer=adam;ts_baseline=creation",
        )
        .unwrap();

        assert_eq!(config.shard_id, 1);
        assert_eq!(config.shard_count.get(), 2);
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.optimizer, "adam");
        assert_eq!(config.ts_baseline, Baseline::Creation);
        assert_eq!(config.lock_shards.get(), 16);
    }

    #[test]
    fn unknown_keys_fail() {
        assert!(comms::config::load::<ServerConfig>(None, "shards=2").is_err());
    }
}
