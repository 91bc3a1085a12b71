use std::{collections::BTreeMap, fs, io, path::Path};

use comms::{
    ByteReader, Serialize,
    proto::{Freq, Id, IdFreqMap, IdSet, PullRequest, Tensor, TensorMap},
    serialize_len,
};
use parking_lot::RwLock;

use crate::storage::{Model, read_version};

/// Admission filter for sparse ids.
///
/// Keeps the cumulative occurrence count of every sparse id and hides the ids
/// seen fewer than `threshold` times from pulls and pushes, so long tail
/// features never get a row.
#[derive(Debug, Default)]
pub struct FreqStore {
    threshold: Freq,
    maps: BTreeMap<String, RwLock<IdFreqMap>>,
}

impl FreqStore {
    /// Creates a new `FreqStore`.
    ///
    /// # Arguments
    /// * `threshold` - The minimum cumulative count of an id, `0` disables filtering.
    pub fn new(threshold: Freq) -> Self {
        Self {
            threshold,
            maps: BTreeMap::new(),
        }
    }

    pub fn threshold(&self) -> Freq {
        self.threshold
    }

    /// Allocates a frequency map per sparse table of `model`.
    pub fn init(&mut self, model: &Model) {
        self.maps = model
            .sparse_tables()
            .map(|(name, _)| (name.to_string(), RwLock::default()))
            .collect();
    }

    /// Marks every row already present in `model` as frequent enough.
    pub fn init_param(&self, model: &Model) {
        for (name, table) in model.sparse_tables() {
            if let Some(map) = self.maps.get(name) {
                map.write().extend(table.ids().into_iter().map(|id| (id, Freq::MAX)));
            }
        }
    }

    /// Tallies the occurrences of every id in a batch.
    ///
    /// # Arguments
    /// * `fields` - The sparse index fields of the batch.
    ///
    /// # Returns
    /// The per batch count of every id.
    pub fn get_id_freq_map<'a, I>(fields: I) -> IdFreqMap
    where
        I: IntoIterator<Item = &'a [Id]>,
    {
        let mut out = IdFreqMap::new();

        for &id in fields.into_iter().flatten() {
            let freq = out.entry(id).or_insert(0);
            *freq = freq.saturating_add(1);
        }

        out
    }

    /// Merges every count submitted with `req` and drops the requested ids that are still rare.
    ///
    /// The submitted counts are batch wide, so they're merged into every tracked
    /// table whether the request asks for the id or not. Tables this store
    /// doesn't track are left untouched.
    pub fn filter_pull(&self, req: &mut PullRequest) {
        if self.threshold == 0 {
            return;
        }

        let PullRequest {
            srm_map,
            id_freq_map,
            ..
        } = req;

        if !id_freq_map.is_empty() {
            for map in self.maps.values() {
                let mut map = map.write();

                for (&id, &submitted) in id_freq_map.iter() {
                    let freq = map.entry(id).or_insert(0);
                    *freq = freq.saturating_add(submitted);
                }
            }
        }

        for (name, ids) in srm_map.iter_mut() {
            let Some(map) = self.maps.get(name) else {
                continue;
            };

            let map = map.read();
            ids.retain(|id| map.get(id).is_some_and(|&freq| freq >= self.threshold));
        }
    }

    /// Drops the rows of rare ids from a sparse gradient, the kept rows keep their values.
    pub fn filter_grad(&self, grad: &mut TensorMap) {
        if self.threshold == 0 {
            return;
        }

        for (name, tensor) in grad.iter_mut() {
            let (Tensor::Sparse(srm), Some(map)) = (tensor, self.maps.get(name)) else {
                continue;
            };

            let map = map.read();
            srm.rows
                .retain(|id, _| map.get(id).is_some_and(|&freq| freq >= self.threshold));
        }
    }

    /// Forgets the expired ids.
    pub fn remove_if(&self, expired: &BTreeMap<String, IdSet>) {
        for (name, ids) in expired {
            if let Some(map) = self.maps.get(name) {
                map.write().retain(|id, _| !ids.contains(id));
            }
        }
    }

    /// Returns the cumulative count of `id` in the table `name`.
    pub fn freq(&self, name: &str, id: Id) -> Freq {
        self.maps
            .get(name)
            .and_then(|map| map.read().get(&id).copied())
            .unwrap_or(0)
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        0u32.serialize(buf);
        serialize_len(self.maps.len(), buf);

        for (name, map) in &self.maps {
            name.serialize(buf);
            map.read().serialize(buf);
        }
    }

    /// Reads the counts written by `write`, counts of tables this store doesn't track are skipped.
    pub fn read(&self, reader: &mut ByteReader<'_>) -> io::Result<()> {
        read_version(reader)?;
        let maps: BTreeMap<String, IdFreqMap> = reader.read()?;

        for (name, loaded) in maps {
            if let Some(map) = self.maps.get(&name) {
                *map.write() = loaded;
            }
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
