use std::{collections::BTreeMap, io, num::NonZeroUsize};

use comms::{
    ByteReader, Serialize,
    proto::{DenseTensor, Id, IdSet, PullRequest, ShardFn, Tensor, TensorMap},
};
use log::debug;
use parking_lot::RwLock;
use rand::{SeedableRng, rngs::StdRng};

use super::{Graph, ParamKind, Result, SparseTable, StorageErr};
use crate::initialization::Sampler;

const VERSION: u32 = 0;

/// A dense parameter owned by this shard.
#[derive(Debug)]
pub struct DenseParam {
    shape: Vec<usize>,
    sampler: Sampler,
    seed: u64,
    data: RwLock<Box<[f32]>>,
}

impl DenseParam {
    fn new(shape: Vec<usize>, sampler: Sampler, seed: u64) -> Self {
        let len = shape.iter().product();

        Self {
            shape,
            sampler,
            seed,
            data: RwLock::new(vec![0.; len].into_boxed_slice()),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the length of a row, the last dimension of the shape.
    pub fn row_len(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Returns the amount of rows of a 2-D parameter, `None` for any other rank.
    pub fn rows(&self) -> Option<usize> {
        match self.shape[..] {
            [rows, _] => Some(rows),
            _ => None,
        }
    }

    pub fn data(&self) -> &RwLock<Box<[f32]>> {
        &self.data
    }

    fn reset(&self) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        self.sampler.fill(&mut rng, &mut self.data.write());
    }

    fn to_tensor(&self) -> DenseTensor {
        DenseTensor {
            shape: self.shape.clone(),
            data: self.data.read().to_vec(),
        }
    }

    fn assign(&self, name: &str, tsr: &DenseTensor) -> Result<()> {
        if tsr.shape != self.shape {
            return Err(StorageErr::SizeMismatch {
                name: name.to_string(),
                expected: self.len(),
                got: tsr.data.len(),
            });
        }

        self.data.write().copy_from_slice(&tsr.data);
        Ok(())
    }
}

/// The parameters held by a parameter server shard.
///
/// Holds the dense tensors the `ShardFn` places on this shard and every sparse
/// table, whose rows are spread by id across all the shards.
#[derive(Debug)]
pub struct Model {
    dense: BTreeMap<String, DenseParam>,
    sparse: BTreeMap<String, SparseTable>,
}

impl Model {
    /// Creates a new `Model` out of a compiled graph, every value starts at zero.
    ///
    /// # Arguments
    /// * `graph` - The trainable parameters.
    /// * `shard_fn` - The placement of the parameters.
    /// * `shard_id` - The index of this shard.
    /// * `seed` - The seed of the initializers.
    ///
    /// # Returns
    /// A new `Model` or a `StorageErr` if the graph is invalid.
    pub fn new(graph: &Graph, shard_fn: ShardFn, shard_id: usize, seed: u64) -> Result<Self> {
        graph.validate()?;

        let mut dense = BTreeMap::new();
        let mut sparse = BTreeMap::new();

        for (i, decl) in graph.params.iter().enumerate() {
            let seed = seed.wrapping_add(i as u64);
            let sampler = decl.init.sampler().map_err(|source| StorageErr::Init {
                name: decl.name.clone(),
                source,
            })?;

            match &decl.kind {
                ParamKind::Dense { shape } => {
                    if shard_fn.tensor_shard(&decl.name) == shard_id {
                        dense.insert(decl.name.clone(), DenseParam::new(shape.clone(), sampler, seed));
                    }
                }
                ParamKind::Sparse { col } => {
                    sparse.insert(decl.name.clone(), SparseTable::new(*col, sampler, seed));
                }
            }
        }

        Ok(Self { dense, sparse })
    }

    /// Samples every dense parameter from its initializer and drops every sparse row.
    pub fn init_param(&self) {
        self.dense.values().for_each(DenseParam::reset);
        self.sparse.values().for_each(SparseTable::clear);
    }

    /// Splits every sparse table into `shards` locks.
    pub fn init_lock(&mut self, shards: NonZeroUsize) {
        self.sparse
            .values_mut()
            .for_each(|table| table.reshard(shards));
    }

    pub fn dense(&self, name: &str) -> Option<&DenseParam> {
        self.dense.get(name)
    }

    pub fn sparse(&self, name: &str) -> Option<&SparseTable> {
        self.sparse.get(name)
    }

    pub fn dense_params(&self) -> impl Iterator<Item = (&str, &DenseParam)> {
        self.dense.iter().map(|(name, param)| (name.as_str(), param))
    }

    pub fn sparse_tables(&self) -> impl Iterator<Item = (&str, &SparseTable)> {
        self.sparse.iter().map(|(name, table)| (name.as_str(), table))
    }

    /// Copies the requested parameters.
    ///
    /// Missing sparse rows are created only when `req.is_train`, otherwise they are
    /// omitted. Names this model doesn't hold are skipped.
    ///
    /// # Arguments
    /// * `req` - The requested dense tensors and sparse rows.
    ///
    /// # Returns
    /// The pulled parameters and the ids of the rows created by this pull, per table.
    pub fn pull(&self, req: &PullRequest) -> (TensorMap, BTreeMap<String, Vec<Id>>) {
        let mut out = TensorMap::new();
        let mut created = BTreeMap::new();

        for name in &req.tsr_set {
            if let Some(param) = self.dense.get(name) {
                out.insert(name.clone(), Tensor::Dense(param.to_tensor()));
            }
        }

        for (name, ids) in &req.srm_map {
            let Some(table) = self.sparse.get(name) else {
                continue;
            };

            let (rows, new_ids) = table.gather(ids, req.is_train);

            if !new_ids.is_empty() {
                created.insert(name.clone(), new_ids);
            }

            out.insert(name.clone(), Tensor::Sparse(rows));
        }

        (out, created)
    }

    /// Overwrites parameters with the given values, names this model doesn't hold are skipped.
    ///
    /// # Returns
    /// A `StorageErr` if a tensor doesn't match the shape or kind of its parameter.
    pub fn assign(&self, tensors: &TensorMap) -> Result<()> {
        for (name, tensor) in tensors {
            match (tensor, self.dense.get(name), self.sparse.get(name)) {
                (Tensor::Dense(tsr), Some(param), _) => param.assign(name, tsr)?,
                (Tensor::Sparse(srm), _, Some(table)) => table.assign(name, srm)?,
                (_, None, None) => {}
                _ => return Err(StorageErr::KindMismatch(name.clone())),
            }
        }

        Ok(())
    }

    /// Drops the sparse gradient rows of ids that have no row in their table.
    pub fn retain_existing(&self, grad: &mut TensorMap) {
        for (name, tensor) in grad.iter_mut() {
            if let (Tensor::Sparse(srm), Some(table)) = (tensor, self.sparse.get(name)) {
                srm.rows.retain(|&id, _| table.contains(id));
            }
        }
    }

    /// Drops the expired rows of every sparse table.
    pub fn remove(&self, expired: &BTreeMap<String, IdSet>) {
        for (name, ids) in expired {
            if let Some(table) = self.sparse.get(name) {
                table.remove(ids);
            }
        }
    }

    /// Copies every parameter.
    pub fn snapshot(&self) -> TensorMap {
        let dense = self
            .dense
            .iter()
            .map(|(name, param)| (name.clone(), Tensor::Dense(param.to_tensor())));

        let sparse = self
            .sparse
            .iter()
            .map(|(name, table)| (name.clone(), Tensor::Sparse(table.snapshot())));

        dense.chain(sparse).collect()
    }

    /// Writes a checkpoint of the parameters.
    pub fn write(&self, buf: &mut Vec<u8>) {
        VERSION.serialize(buf);
        self.snapshot().serialize(buf);
    }

    /// Reads a checkpoint written by `write`.
    ///
    /// Tensors this model doesn't hold are skipped, parameters missing from the
    /// checkpoint keep their values.
    ///
    /// # Returns
    /// An `InvalidData` error if the checkpoint is malformed or doesn't match the graph.
    pub fn read(&self, reader: &mut ByteReader<'_>) -> io::Result<()> {
        read_version(reader)?;
        let tensors: TensorMap = reader.read()?;

        for (name, tensor) in &tensors {
            match (tensor, self.dense.get(name), self.sparse.get(name)) {
                (Tensor::Dense(tsr), Some(param), _) => param.assign(name, tsr)?,
                (Tensor::Sparse(srm), _, Some(table)) => table.load(name, srm)?,
                (_, None, None) => debug!("skipping checkpointed tensor {name}"),
                _ => return Err(StorageErr::KindMismatch(name.clone()).into()),
            }
        }

        Ok(())
    }
}

/// Reads the version of a checkpoint, only version `0` exists.
pub fn read_version(reader: &mut ByteReader<'_>) -> io::Result<()> {
    let version: u32 = reader.read()?;

    if version != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported checkpoint version {version}"),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use comms::proto::SparseRows;

    use super::*;
    use crate::{initialization::Initializer, storage::ParamDecl};

    fn graph() -> Graph {
        Graph::new(vec![
            ParamDecl::dense("w", vec![2, 2], Initializer::Constant { value: 0.5 }),
            ParamDecl::sparse("emb", 2, Initializer::Constant { value: 1. }),
        ])
    }

    fn model() -> Model {
        let shard_fn = ShardFn::new(NonZeroUsize::MIN);
        let model = Model::new(&graph(), shard_fn, 0, 7).unwrap();
        model.init_param();
        model
    }

    fn request(is_train: bool) -> PullRequest {
        let mut req = PullRequest {
            is_train,
            ..Default::default()
        };
        req.tsr_set.insert("w".into());
        req.tsr_set.insert("unknown".into());
        req.srm_map.insert("emb".into(), [1, 2].into_iter().collect());
        req
    }

    #[test]
    fn dense_params_follow_the_shard_fn() {
        let shard_fn = ShardFn::new(NonZeroUsize::new(2).unwrap());
        let owner = shard_fn.tensor_shard("w");

        let held = Model::new(&graph(), shard_fn, owner, 0).unwrap();
        let other = Model::new(&graph(), shard_fn, 1 - owner, 0).unwrap();

        assert!(held.dense("w").is_some());
        assert!(other.dense("w").is_none());
        assert!(other.sparse("emb").is_some());
    }

    #[test]
    fn pull_creates_rows_only_when_training() {
        let model = model();

        let (out, created) = model.pull(&request(false));
        assert_eq!(out["w"], Tensor::Dense(DenseTensor::from_data(vec![2, 2], vec![0.5; 4]).unwrap()));
        assert!(!out.contains_key("unknown"));
        assert!(matches!(&out["emb"], Tensor::Sparse(srm) if srm.is_empty()));
        assert!(created.is_empty());

        let (out, created) = model.pull(&request(true));
        let Tensor::Sparse(srm) = &out["emb"] else {
            panic!("expected sparse rows");
        };
        assert_eq!(srm.rows[&1], [1., 1.]);
        assert_eq!(created["emb"].len(), 2);
    }

    #[test]
    fn assign_checks_shapes() {
        let model = model();

        let mut tensors = TensorMap::new();
        tensors.insert("w".into(), Tensor::Dense(DenseTensor::zeros(vec![4]).unwrap()));
        assert!(model.assign(&tensors).is_err());

        tensors.insert("w".into(), Tensor::Dense(DenseTensor::zeros(vec![2, 2]).unwrap()));
        tensors.insert("elsewhere".into(), Tensor::Dense(DenseTensor::zeros(vec![1]).unwrap()));
        model.assign(&tensors).unwrap();
        assert_eq!(**model.dense("w").unwrap().data().read(), [0.; 4]);
    }

    #[test]
    fn retain_existing_drops_unknown_rows() {
        let model = model();
        model.pull(&request(true));

        let mut srm = SparseRows::new(2);
        srm.rows.extend([(1, vec![1., 1.]), (77, vec![1., 1.])]);
        let mut grad = TensorMap::from([("emb".to_string(), Tensor::Sparse(srm))]);

        model.retain_existing(&mut grad);

        let Tensor::Sparse(srm) = &grad["emb"] else {
            panic!("expected sparse rows");
        };
        assert!(srm.rows.contains_key(&1));
        assert!(!srm.rows.contains_key(&77));
    }

    #[test]
    fn checkpoint_restores_values() {
        let model = model();
        model.pull(&request(true));

        let mut buf = Vec::new();
        model.write(&mut buf);

        let restored = Model::new(&graph(), ShardFn::new(NonZeroUsize::MIN), 0, 7).unwrap();
        let mut reader = ByteReader::new(&buf);
        restored.read(&mut reader).unwrap();
        reader.finish().unwrap();

        assert_eq!(restored.snapshot(), model.snapshot());

        buf[3] = 1;
        assert!(restored.read(&mut ByteReader::new(&buf)).is_err());
    }
}
