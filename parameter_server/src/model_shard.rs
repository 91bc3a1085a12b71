use std::{
    fs, io,
    path::{Path, PathBuf},
};

use comms::{
    ByteReader, config,
    proto::{IdSet, PullRequest, PushNotify, ShardFn, TensorMap},
};
use log::{debug, info};

use crate::{
    config::ServerConfig,
    error::{PsErr, Result},
    optimization::{Optimizer, new_optimizer},
    sparse::{FreqStore, TsStore},
    storage::Model,
};

/// Everything a parameter server shard holds: the parameters, the optimizer
/// updating them and the optional sparse id policies.
pub struct ModelShard {
    shard_id: usize,
    model: Model,
    optimizer: Box<dyn Optimizer>,
    freq: Option<FreqStore>,
    ts: Option<TsStore>,
}

impl ModelShard {
    /// Creates a new `ModelShard` ready to serve.
    ///
    /// Parameters are sampled from their initializers, or restored from `in_model`
    /// when set, and every table is split into `lock_shards` locks.
    ///
    /// # Arguments
    /// * `config` - The configuration of this shard.
    ///
    /// # Returns
    /// A new `ModelShard` or a `PsErr` if the config is invalid or the checkpoint can't be read.
    pub fn build(config: &ServerConfig) -> Result<Self> {
        let ServerConfig {
            shard_id,
            shard_count,
            lock_shards,
            ..
        } = *config;

        if shard_id >= shard_count.get() {
            return Err(PsErr::InvalidShard {
                shard_id,
                shard_count: shard_count.get(),
            });
        }

        let shard_fn = ShardFn::new(shard_count);
        let mut model = Model::new(&config.graph, shard_fn, shard_id, config.seed)?;
        model.init_lock(lock_shards);

        let mut optimizer = new_optimizer(&config.optimizer)?;
        optimizer.init(&model);
        optimizer.init_config(&config::parse_config(&config.optimizer_config)?)?;
        optimizer.init_param(&model);

        let freq = (config.freq_filter_threshold > 0).then(|| {
            let mut freq = FreqStore::new(config.freq_filter_threshold);
            freq.init(&model);
            freq
        });

        let ts = (config.expire_threshold > 0).then(|| {
            let mut ts = TsStore::new(config.expire_threshold, config.ts_baseline);
            ts.init(&model);
            ts.set_now(config.ts_now);
            ts
        });

        let mut shard = Self {
            shard_id,
            model,
            optimizer,
            freq,
            ts,
        };

        if let Some(dir) = &config.in_model {
            shard.load(dir)?;
        }

        if let Some(freq) = &shard.freq {
            freq.init_param(&shard.model);
        }

        if let Some(ts) = &shard.ts {
            ts.init_param(&shard.model);
        }

        shard.optimizer.init_lock(lock_shards);
        Ok(shard)
    }

    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn freq_store(&self) -> Option<&FreqStore> {
        self.freq.as_ref()
    }

    pub fn ts_store(&self) -> Option<&TsStore> {
        self.ts.as_ref()
    }

    /// Reads the requested parameters.
    ///
    /// When training, rare ids are dropped by the frequency filter and the rows
    /// this pull creates are stamped by the timestamp store.
    pub fn pull(&self, mut req: PullRequest) -> TensorMap {
        if let (Some(freq), true) = (&self.freq, req.is_train) {
            freq.filter_pull(&mut req);
        }

        let (params, created) = self.model.pull(&req);

        if let Some(ts) = &self.ts {
            for (name, ids) in &created {
                ts.track(name, ids);
            }
        }

        params
    }

    /// Applies a push, gradients first and then the overwritten parameters.
    ///
    /// # Returns
    /// An io error if a tensor doesn't match its parameter.
    pub fn push(&self, push: PushNotify) -> io::Result<()> {
        let PushNotify {
            mut grad,
            overwritten,
        } = push;

        if !grad.is_empty() {
            if let Some(freq) = &self.freq {
                freq.filter_grad(&mut grad);
            }

            if let Some(ts) = &self.ts {
                self.model.retain_existing(&mut grad);
                ts.update(&grad);
            }

            self.optimizer.update(&self.model, &grad)?;
        }

        if !overwritten.is_empty() {
            self.model.assign(&overwritten)?;
        }

        Ok(())
    }

    /// Drops the rows nobody has updated for longer than the expiry threshold
    /// from the model, the optimizer and both stores.
    ///
    /// # Returns
    /// The amount of dropped rows.
    pub fn expire(&self) -> usize {
        let Some(ts) = &self.ts else {
            return 0;
        };

        let expired = ts.expire();
        let total: usize = expired.values().map(IdSet::len).sum();

        if total == 0 {
            return 0;
        }

        self.model.remove(&expired);
        self.optimizer.for_each_srm(&mut |name, table| {
            if let Some(ids) = expired.get(name) {
                table.remove(ids);
            }
        });

        if let Some(freq) = &self.freq {
            freq.remove_if(&expired);
        }

        ts.remove(&expired);

        info!(rows = total; "expired stale rows");
        total
    }

    /// Writes a checkpoint of this shard.
    ///
    /// Stale rows are expired first. The checkpoint goes to a directory under `dir`
    /// named after the epoch and the timestamp, and a `SUCCESS` marker is written last.
    ///
    /// # Returns
    /// The checkpoint directory or an io error.
    pub fn save(&self, dir: &Path, epoch: u32, timestamp: &str) -> io::Result<PathBuf> {
        self.expire();

        let dir = checkpoint_dir(dir, epoch, timestamp);
        fs::create_dir_all(&dir)?;

        let mut buf = Vec::new();
        self.model.write(&mut buf);
        fs::write(self.file(&dir, "model.bin"), &buf)?;

        buf.clear();
        self.optimizer.write(&mut buf);
        fs::write(self.file(&dir, "optimizer.bin"), &buf)?;

        if let Some(ts) = &self.ts {
            ts.save(&self.file(&dir, "ts_store.bin"))?;
        }

        if let Some(freq) = &self.freq {
            freq.save(&self.file(&dir, "freq_store.bin"))?;
        }

        fs::write(self.file(&dir, "SUCCESS"), [])?;
        info!(epoch = epoch, shard = self.shard_id; "model saved to {}", dir.display());

        Ok(dir)
    }

    /// Restores a checkpoint written by `save`.
    ///
    /// The optimizer keeps its configured hyperparameters and takes the
    /// checkpointed auxiliary state. Missing store files are skipped.
    pub fn load(&mut self, dir: &Path) -> Result<()> {
        info!(shard = self.shard_id; "loading model from {}", dir.display());

        let buf = fs::read(self.file(dir, "model.bin"))?;
        let mut reader = ByteReader::new(&buf);
        self.model.read(&mut reader)?;
        reader.finish()?;

        let buf = fs::read(self.file(dir, "optimizer.bin"))?;
        let mut restored = new_optimizer(self.optimizer.name())?;
        restored.init(&self.model);
        let mut reader = ByteReader::new(&buf);
        restored.read(&mut reader)?;
        reader.finish()?;
        self.optimizer.warmup(&*restored)?;

        if let Some(ts) = &self.ts {
            let path = self.file(dir, "ts_store.bin");
            if path.exists() {
                ts.load(&path)?;
            } else {
                debug!("no timestamps to load at {}", path.display());
            }
        }

        if let Some(freq) = &self.freq {
            let path = self.file(dir, "freq_store.bin");
            if path.exists() {
                freq.load(&path)?;
            } else {
                debug!("no frequencies to load at {}", path.display());
            }
        }

        Ok(())
    }

    fn file(&self, dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.{}", self.shard_id))
    }
}

/// Returns the directory a checkpoint of `epoch` is written to.
pub fn checkpoint_dir(dir: &Path, epoch: u32, timestamp: &str) -> PathBuf {
    if timestamp.is_empty() {
        dir.join(format!("epoch-{epoch}"))
    } else {
        dir.join(format!("epoch-{epoch}-{timestamp}"))
    }
}
