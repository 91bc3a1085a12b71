use std::{collections::HashMap, num::NonZeroUsize};

use comms::proto::{Id, IdSet, SparseRows};
use parking_lot::RwLock;

use super::{Result, StorageErr};
use crate::initialization::Sampler;

/// The rows of a single lock shard.
pub type Rows = HashMap<Id, Box<[f32]>>;

/// A sparse row map split into lock shards by `id % shards`.
///
/// Tables start with a single shard, `reshard` installs the final count
/// before the table is shared.
#[derive(Debug)]
pub struct SparseTable {
    col: usize,
    sampler: Sampler,
    seed: u64,
    shards: Box<[RwLock<Rows>]>,
}

impl SparseTable {
    /// Creates a new empty `SparseTable`.
    ///
    /// # Arguments
    /// * `col` - The amount of values per row.
    /// * `sampler` - Initializes the rows that get created.
    /// * `seed` - The seed of the table, rows are seeded by it and their id.
    pub fn new(col: usize, sampler: Sampler, seed: u64) -> Self {
        Self {
            col,
            sampler,
            seed,
            shards: Box::new([RwLock::default()]),
        }
    }

    /// Creates a new empty `SparseTable` whose rows start at zero.
    pub fn zeros(col: usize) -> Self {
        Self::new(col, Sampler::Const(0.), 0)
    }

    pub fn col(&self) -> usize {
        self.col
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the index of the shard holding `id`.
    pub fn shard_of(&self, id: Id) -> usize {
        (id % self.shards.len() as u64) as usize
    }

    /// Returns the lock of the shard `idx`.
    ///
    /// # Panics
    /// If `idx` isn't lower than `shard_count`.
    pub fn shard(&self, idx: usize) -> &RwLock<Rows> {
        &self.shards[idx]
    }

    /// Redistributes the rows over `shards` locks.
    pub fn reshard(&mut self, shards: NonZeroUsize) {
        let old = std::mem::take(&mut self.shards);
        self.shards = (0..shards.get()).map(|_| RwLock::default()).collect();

        for shard in old {
            for (id, row) in shard.into_inner() {
                let idx = self.shard_of(id);
                self.shards[idx].get_mut().insert(id, row);
            }
        }
    }

    /// Creates the initial value of the row `id`.
    pub fn new_row(&self, id: Id) -> Box<[f32]> {
        let mut row = vec![0.; self.col].into_boxed_slice();
        self.sampler.fill_row(self.seed, id, &mut row);
        row
    }

    /// Copies the rows of `ids`.
    ///
    /// # Arguments
    /// * `ids` - The requested rows.
    /// * `create` - Whether missing rows get created, otherwise they are omitted.
    ///
    /// # Returns
    /// The copied rows and the ids of the rows this call created.
    pub fn gather(&self, ids: &IdSet, create: bool) -> (SparseRows, Vec<Id>) {
        let mut out = SparseRows::new(self.col);
        let mut created = Vec::new();

        for (idx, group) in self.group(ids.iter().copied()).into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }

            let mut missing = Vec::new();

            {
                let rows = self.shards[idx].read();
                for id in group {
                    match rows.get(&id) {
                        Some(row) => {
                            out.rows.insert(id, row.to_vec());
                        }
                        None => missing.push(id),
                    }
                }
            }

            if !create || missing.is_empty() {
                continue;
            }

            let mut rows = self.shards[idx].write();
            for id in missing {
                let row = rows.entry(id).or_insert_with(|| {
                    created.push(id);
                    self.new_row(id)
                });
                out.rows.insert(id, row.to_vec());
            }
        }

        (out, created)
    }

    /// Overwrites or inserts every row of `rows`.
    ///
    /// # Returns
    /// A `StorageErr` naming `name` if the rows don't have `col` values, nothing is written then.
    pub fn assign(&self, name: &str, rows: &SparseRows) -> Result<()> {
        self.check_col(name, rows)?;

        for (id, row) in &rows.rows {
            let mut shard = self.shards[self.shard_of(*id)].write();
            shard.insert(*id, row.as_slice().into());
        }

        Ok(())
    }

    /// Inserts the rows of `other` this table doesn't have yet.
    pub fn insert_missing(&self, other: &SparseTable) {
        for shard in other.shards.iter() {
            for (&id, row) in shard.read().iter() {
                self.shards[self.shard_of(id)]
                    .write()
                    .entry(id)
                    .or_insert_with(|| row.clone());
            }
        }
    }

    pub fn remove(&self, ids: &IdSet) {
        for (idx, group) in self.group(ids.iter().copied()).into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }

            let mut rows = self.shards[idx].write();
            for id in group {
                rows.remove(&id);
            }
        }
    }

    pub fn contains(&self, id: Id) -> bool {
        self.shards[self.shard_of(id)].read().contains_key(&id)
    }

    pub fn clear(&self) {
        self.shards.iter().for_each(|shard| shard.write().clear());
    }

    pub fn ids(&self) -> Vec<Id> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().keys().copied().collect::<Vec<_>>())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every row of the table.
    pub fn snapshot(&self) -> SparseRows {
        let mut out = SparseRows::new(self.col);

        for shard in self.shards.iter() {
            let rows = shard.read();
            out.rows
                .extend(rows.iter().map(|(&id, row)| (id, row.to_vec())));
        }

        out
    }

    /// Replaces the content of the table with `rows`.
    ///
    /// # Returns
    /// A `StorageErr` naming `name` if the rows don't have `col` values, the table is untouched then.
    pub fn load(&self, name: &str, rows: &SparseRows) -> Result<()> {
        self.check_col(name, rows)?;
        self.clear();
        self.assign(name, rows)
    }

    fn check_col(&self, name: &str, rows: &SparseRows) -> Result<()> {
        if rows.col != self.col {
            return Err(StorageErr::SizeMismatch {
                name: name.to_string(),
                expected: self.col,
                got: rows.col,
            });
        }

        Ok(())
    }

    fn group(&self, ids: impl Iterator<Item = Id>) -> Vec<Vec<Id>> {
        let mut groups = vec![Vec::new(); self.shards.len()];
        ids.for_each(|id| groups[self.shard_of(id)].push(id));
        groups
    }
}
