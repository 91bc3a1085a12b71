use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};

use comms::{
    ByteReader, Serialize,
    proto::{Id, IdSet, Tensor, TensorMap, Ts},
    serialize_len,
};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Deserialize;

use crate::storage::{Model, read_version};

/// The stamp given to rows that exist but were never updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Baseline {
    /// Untouched rows age from time `0`.
    #[default]
    Zero,
    /// Untouched rows age from the moment they were created.
    Creation,
}

/// Staleness tracker for sparse ids.
///
/// Remembers the logical time at which every row was last updated so that rows
/// nobody trains anymore can be expired.
#[derive(Debug, Default)]
pub struct TsStore {
    threshold: Ts,
    baseline: Baseline,
    now: AtomicU32,
    maps: BTreeMap<String, RwLock<HashMap<Id, Ts>>>,
}

impl TsStore {
    /// Creates a new `TsStore`.
    ///
    /// # Arguments
    /// * `threshold` - The age past which a row expires, `0` disables expiry.
    /// * `baseline` - The stamp of rows that were never updated.
    pub fn new(threshold: Ts, baseline: Baseline) -> Self {
        Self {
            threshold,
            baseline,
            now: AtomicU32::new(0),
            maps: BTreeMap::new(),
        }
    }

    /// Advances the logical clock.
    pub fn set_now(&self, now: Ts) {
        self.now.store(now, Ordering::Release);
    }

    pub fn now(&self) -> Ts {
        self.now.load(Ordering::Acquire)
    }

    /// Allocates a timestamp map per sparse table of `model`.
    pub fn init(&mut self, model: &Model) {
        self.maps = model
            .sparse_tables()
            .map(|(name, _)| (name.to_string(), RwLock::default()))
            .collect();
    }

    /// Stamps every row already present in `model` according to the baseline.
    pub fn init_param(&self, model: &Model) {
        for (name, table) in model.sparse_tables() {
            self.track(name, &table.ids());
        }
    }

    /// Stamps every row of the sparse gradients with the current time.
    pub fn update(&self, grad: &TensorMap) {
        let now = self.now();

        for (name, tensor) in grad {
            let (Tensor::Sparse(srm), Some(map)) = (tensor, self.maps.get(name)) else {
                continue;
            };

            let mut map = map.write();
            map.extend(srm.rows.keys().map(|&id| (id, now)));
        }
    }

    /// Registers rows that were just created, the already known ones keep their stamp.
    ///
    /// # Arguments
    /// * `name` - The sparse table.
    /// * `ids` - The created rows.
    pub fn track(&self, name: &str, ids: &[Id]) {
        let Some(map) = self.maps.get(name) else {
            return;
        };

        let ts = match self.baseline {
            Baseline::Zero => 0,
            Baseline::Creation => self.now(),
        };

        let mut map = map.write();
        for &id in ids {
            map.entry(id).or_insert(ts);
        }
    }

    /// Finds the rows older than the threshold, nothing is removed.
    ///
    /// # Returns
    /// The expired ids of every table, empty when expiry is disabled.
    pub fn expire(&self) -> BTreeMap<String, IdSet> {
        let now = self.now();
        let threshold = self.threshold;

        self.maps
            .par_iter()
            .map(|(name, map)| {
                let expired = if threshold == 0 {
                    IdSet::new()
                } else {
                    map.read()
                        .iter()
                        .filter(|&(_, &ts)| now.saturating_sub(ts) > threshold)
                        .map(|(&id, _)| id)
                        .collect()
                };

                (name.clone(), expired)
            })
            .collect()
    }

    pub fn remove(&self, expired: &BTreeMap<String, IdSet>) {
        for (name, ids) in expired {
            if let Some(map) = self.maps.get(name) {
                map.write().retain(|id, _| !ids.contains(id));
            }
        }
    }

    /// Returns the stamp of `id` in the table `name`.
    pub fn ts(&self, name: &str, id: Id) -> Option<Ts> {
        self.maps.get(name)?.read().get(&id).copied()
    }

    /// Merges stamps into this store, the newer stamp of every row wins.
    pub fn merge(&self, name: &str, stamps: HashMap<Id, Ts>) {
        let Some(map) = self.maps.get(name) else {
            return;
        };

        let mut map = map.write();
        for (id, ts) in stamps {
            let current = map.entry(id).or_insert(ts);
            *current = (*current).max(ts);
        }
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        0u32.serialize(buf);
        self.now().serialize(buf);
        serialize_len(self.maps.len(), buf);

        for (name, map) in &self.maps {
            name.serialize(buf);
            map.read().serialize(buf);
        }
    }

    /// Reads the stamps written by `write` and merges them into this store.
    ///
    /// The clock never goes back, stamps of tables this store doesn't track are skipped.
    pub fn read(&self, reader: &mut ByteReader<'_>) -> io::Result<()> {
        read_version(reader)?;
        let now: Ts = reader.read()?;
        let maps: BTreeMap<String, HashMap<Id, Ts>> = reader.read()?;

        self.now.fetch_max(now, Ordering::AcqRel);

        for (name, stamps) in maps {
            self.merge(&name, stamps);
        }

        Ok(())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut buf = Vec::new();
        self.write(&mut buf);
        fs::write(path, buf)
    }

    pub fn load(&self, path: &Path) -> io::Result<()> {
        let buf = fs::read(path)?;
        let mut reader = ByteReader::new(&buf);
        self.read(&mut reader)?;
        reader.finish()
    }
}
