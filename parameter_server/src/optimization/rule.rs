use std::{any::Any, collections::BTreeMap, io, num::NonZeroUsize, str::FromStr};

use comms::{
    ByteReader, Deserialize, Serialize,
    config::{self, StringMap},
    proto::{DenseTensor, Id, SparseRows, Tensor, TensorMap},
    serialize_len,
};
use parking_lot::Mutex;
use rayon::prelude::*;

use super::{Optimizer, OptimizerErr, Result};
use crate::storage::{DenseParam, Model, SparseTable, StorageErr, read_version};

/// The numeric side of an optimizer.
///
/// Every parameter element owns `SLOTS` auxiliary values. For a row of `n` values
/// `apply` receives the `SLOTS * n` auxiliary values of that row, slot after slot.
pub trait Rule: Send + Sync + 'static {
    const NAME: &'static str;
    const SLOTS: usize;

    /// The state that advances once per update, like the decay powers of Adam.
    type Schedule: Clone + Send + Serialize + for<'a> Deserialize<'a>;

    /// The constants of a single update, derived from the schedule.
    type Step: Sync;

    /// Sets a hyperparameter.
    ///
    /// # Returns
    /// An error on unknown keys or out of range values.
    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Returns the hyperparameters in the form `set` takes them.
    fn config(&self) -> StringMap;

    /// Returns the initial schedule for the current hyperparameters.
    fn schedule(&self) -> Self::Schedule;

    /// Advances the schedule and returns the constants of this update.
    fn begin(&self, schedule: &mut Self::Schedule) -> Self::Step;

    /// Updates a single row.
    fn apply(&self, step: &Self::Step, grad: &[f32], w: &mut [f32], aux: &mut [f32]);
}

/// Parses a hyperparameter and checks its range.
pub(super) fn parse_checked<T: FromStr>(
    key: &str,
    value: &str,
    valid: impl FnOnce(&T) -> bool,
) -> Result<T> {
    config::parse_value(key, value)
        .ok()
        .filter(valid)
        .ok_or_else(|| OptimizerErr::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Error for a hyperparameter a rule doesn't know.
pub(super) fn unknown_key<R: Rule>(key: &str) -> OptimizerErr {
    OptimizerErr::UnknownKey {
        optimizer: R::NAME,
        key: key.to_string(),
    }
}

/// An `Optimizer` applying the rule `R`, it owns the auxiliary state of every parameter.
pub struct RuleOptimizer<R: Rule> {
    rule: R,
    schedule: Mutex<R::Schedule>,
    dense: BTreeMap<String, Mutex<Box<[f32]>>>,
    sparse: BTreeMap<String, SparseTable>,
    locked: bool,
}

impl<R: Rule + Default> Default for RuleOptimizer<R> {
    fn default() -> Self {
        Self::new(R::default())
    }
}

impl<R: Rule> RuleOptimizer<R> {
    /// Creates a new `RuleOptimizer` with no parameters bound yet.
    pub fn new(rule: R) -> Self {
        Self {
            schedule: Mutex::new(rule.schedule()),
            rule,
            dense: BTreeMap::new(),
            sparse: BTreeMap::new(),
            locked: false,
        }
    }

    pub fn rule(&self) -> &R {
        &self.rule
    }

    /// Copies the auxiliary values of the sparse row `id` of the table `name`.
    pub fn aux_row(&self, name: &str, id: Id) -> Option<Vec<f32>> {
        let table = self.sparse.get(name)?;
        let row = table.shard(table.shard_of(id)).read().get(&id)?.to_vec();
        Some(row)
    }

    fn update_dense(&self, model: &Model, name: &str, grad: &DenseTensor, step: &R::Step) -> Result<()> {
        let (Some(param), Some(aux)) = (model.dense(name), self.dense.get(name)) else {
            return Ok(());
        };

        if grad.shape != param.shape() {
            return Err(StorageErr::SizeMismatch {
                name: name.to_string(),
                expected: param.len(),
                got: grad.data.len(),
            }
            .into());
        }

        if param.is_empty() {
            return Ok(());
        }

        let row = param.row_len();
        let aux_row = R::SLOTS * row;

        let mut w = param.data().write();
        let mut aux = aux.lock();

        for (i, (w, g)) in w.chunks_mut(row).zip(grad.data.chunks(row)).enumerate() {
            let aux = &mut aux[i * aux_row..(i + 1) * aux_row];
            self.rule.apply(step, g, w, aux);
        }

        Ok(())
    }

    fn update_sparse(&self, model: &Model, name: &str, grad: &SparseRows, step: &R::Step) -> Result<()> {
        if let (Some(table), Some(aux)) = (model.sparse(name), self.sparse.get(name)) {
            if grad.col != table.col() {
                return Err(StorageErr::SizeMismatch {
                    name: name.to_string(),
                    expected: table.col(),
                    got: grad.col,
                }
                .into());
            }

            if table.shard_count() != aux.shard_count() {
                return Err(OptimizerErr::LockNotInitialized);
            }

            let mut groups = vec![Vec::new(); table.shard_count()];
            for (&id, row) in &grad.rows {
                groups[table.shard_of(id)].push((id, row.as_slice()));
            }

            groups
                .into_par_iter()
                .enumerate()
                .filter(|(_, rows)| !rows.is_empty())
                .for_each(|(idx, rows)| {
                    let mut w = table.shard(idx).write();
                    let mut a = aux.shard(idx).write();

                    for (id, g) in rows {
                        let Some(w) = w.get_mut(&id) else {
                            continue;
                        };

                        let a = a.entry(id).or_insert_with(|| aux.new_row(id));
                        self.rule.apply(step, g, w, a);
                    }
                });

            return Ok(());
        }

        if let (Some(param), Some(aux)) = (model.dense(name), self.dense.get(name)) {
            return self.update_dense_rows(name, param, aux, grad, step);
        }

        Ok(())
    }

    /// Applies sparse rows to the rows of a 2-D dense parameter, ids past the last row are skipped.
    fn update_dense_rows(
        &self,
        name: &str,
        param: &DenseParam,
        aux: &Mutex<Box<[f32]>>,
        grad: &SparseRows,
        step: &R::Step,
    ) -> Result<()> {
        let row = param.row_len();
        let Some(rows) = param.rows().filter(|_| row == grad.col) else {
            return Err(StorageErr::KindMismatch(name.to_string()).into());
        };

        let aux_row = R::SLOTS * row;
        let mut w = param.data().write();
        let mut aux = aux.lock();

        for (&id, g) in &grad.rows {
            let Some(i) = usize::try_from(id).ok().filter(|&i| i < rows) else {
                continue;
            };

            let w = &mut w[i * row..(i + 1) * row];
            let aux = &mut aux[i * aux_row..(i + 1) * aux_row];
            self.rule.apply(step, g, w, aux);
        }

        Ok(())
    }
}

impl<R: Rule> Optimizer for RuleOptimizer<R> {
    fn name(&self) -> &'static str {
        R::NAME
    }

    fn init(&mut self, model: &Model) {
        self.dense = model
            .dense_params()
            .map(|(name, param)| {
                let aux = vec![0.; R::SLOTS * param.len()].into_boxed_slice();
                (name.to_string(), Mutex::new(aux))
            })
            .collect();

        self.sparse = model
            .sparse_tables()
            .map(|(name, table)| (name.to_string(), SparseTable::zeros(R::SLOTS * table.col())))
            .collect();

        self.locked = false;
    }

    fn init_config(&mut self, config: &StringMap) -> Result<()> {
        for (key, value) in config {
            self.rule.set(key, value)?;
        }

        *self.schedule.get_mut() = self.rule.schedule();
        Ok(())
    }

    fn init_param(&mut self, model: &Model) {
        model.init_param();
        self.dense.values_mut().for_each(|aux| aux.get_mut().fill(0.));
        self.sparse.values().for_each(SparseTable::clear);
        *self.schedule.get_mut() = self.rule.schedule();
    }

    fn init_lock(&mut self, shards: NonZeroUsize) {
        self.sparse
            .values_mut()
            .for_each(|table| table.reshard(shards));
        self.locked = true;
    }

    fn update(&self, model: &Model, grad: &TensorMap) -> Result<()> {
        if !self.locked {
            return Err(OptimizerErr::LockNotInitialized);
        }

        let step = self.rule.begin(&mut self.schedule.lock());

        grad.par_iter().try_for_each(|(name, tensor)| match tensor {
            Tensor::Dense(g) => self.update_dense(model, name, g, &step),
            Tensor::Sparse(g) => self.update_sparse(model, name, g, &step),
        })
    }

    fn warmup(&self, other: &dyn Optimizer) -> Result<()> {
        let Some(other) = other.as_any().downcast_ref::<Self>() else {
            return Err(OptimizerErr::RuleMismatch {
                expected: R::NAME,
                got: other.name().to_string(),
            });
        };

        *self.schedule.lock() = other.schedule.lock().clone();

        for (name, aux) in &self.dense {
            if let Some(theirs) = other.dense.get(name) {
                let theirs = theirs.lock();
                let mut aux = aux.lock();

                if aux.len() == theirs.len() {
                    aux.copy_from_slice(&theirs);
                }
            }
        }

        for (name, aux) in &self.sparse {
            if let Some(theirs) = other.sparse.get(name) {
                if aux.col() == theirs.col() {
                    aux.insert_missing(theirs);
                }
            }
        }

        Ok(())
    }

    fn write(&self, buf: &mut Vec<u8>) {
        0u32.serialize(buf);
        R::NAME.serialize(buf);
        self.rule.config().serialize(buf);
        self.schedule.lock().serialize(buf);

        serialize_len(self.dense.len(), buf);
        for (name, aux) in &self.dense {
            name.serialize(buf);
            aux.lock()[..].serialize(buf);
        }

        serialize_len(self.sparse.len(), buf);
        for (name, table) in &self.sparse {
            name.serialize(buf);
            table.snapshot().serialize(buf);
        }
    }

    fn read(&mut self, reader: &mut ByteReader<'_>) -> io::Result<()> {
        read_version(reader)?;

        let name: &str = reader.read()?;
        if name != R::NAME {
            return Err(OptimizerErr::RuleMismatch {
                expected: R::NAME,
                got: name.to_string(),
            }
            .into());
        }

        let config: StringMap = reader.read()?;
        for (key, value) in &config {
            self.rule.set(key, value)?;
        }

        let schedule: R::Schedule = reader.read()?;
        *self.schedule.get_mut() = schedule;

        let dense: BTreeMap<String, Vec<f32>> = reader.read()?;
        for (name, values) in dense {
            let Some(aux) = self.dense.get_mut(&name) else {
                continue;
            };

            let aux = aux.get_mut();
            if aux.len() != values.len() {
                return Err(StorageErr::SizeMismatch {
                    name,
                    expected: aux.len(),
                    got: values.len(),
                }
                .into());
            }

            aux.copy_from_slice(&values);
        }

        let sparse: BTreeMap<String, SparseRows> = reader.read()?;
        for (name, rows) in &sparse {
            if let Some(table) = self.sparse.get(name) {
                table.load(name, rows)?;
            }
        }

        Ok(())
    }

    fn for_each_srm(&self, f: &mut dyn FnMut(&str, &SparseTable)) {
        for (name, table) in &self.sparse {
            f(name, table);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use comms::proto::{IdSet, ShardFn};

    use super::*;
    use crate::{
        initialization::Initializer,
        optimization::{Adam, GradientDescent, GradientDescentWithMomentum},
        storage::{Graph, ParamDecl},
    };

    fn model(shards: usize) -> Model {
        let graph = Graph::new(vec![
            ParamDecl::dense("w", vec![2, 2], Initializer::Zeros),
            ParamDecl::sparse("emb", 2, Initializer::Zeros),
        ]);

        let mut model = Model::new(&graph, ShardFn::new(NonZeroUsize::MIN), 0, 0).unwrap();
        model.init_lock(NonZeroUsize::new(shards).unwrap());
        model
    }

    fn sgd(model: &Model, shards: usize) -> RuleOptimizer<GradientDescent> {
        let mut optimizer = RuleOptimizer::<GradientDescent>::default();
        optimizer.init(model);
        optimizer
            .init_config(&config::parse_config("alpha=1;batch_decay=0").unwrap())
            .unwrap();
        optimizer.init_lock(NonZeroUsize::new(shards).unwrap());
        optimizer
    }

    fn materialize(model: &Model, ids: &[Id]) {
        let ids: IdSet = ids.iter().copied().collect();
        model.sparse("emb").unwrap().gather(&ids, true);
    }

    fn sparse_grad(name: &str, rows: &[(Id, [f32; 2])]) -> TensorMap {
        let mut srm = SparseRows::new(2);
        srm.rows.extend(rows.iter().map(|(id, row)| (*id, row.to_vec())));
        TensorMap::from([(name.to_string(), Tensor::Sparse(srm))])
    }

    fn row(model: &Model, id: Id) -> Option<Vec<f32>> {
        let table = model.sparse("emb").unwrap();
        let row = table.shard(table.shard_of(id)).read().get(&id)?.to_vec();
        Some(row)
    }

    #[test]
    fn update_requires_init_lock() {
        let model = model(1);
        let mut optimizer = RuleOptimizer::<GradientDescent>::default();
        optimizer.init(&model);

        let err = optimizer.update(&model, &TensorMap::new()).unwrap_err();
        assert!(matches!(err, OptimizerErr::LockNotInitialized));
    }

    #[test]
    fn dense_update() {
        let model = model(1);
        let optimizer = sgd(&model, 1);

        let grad = DenseTensor::from_data(vec![2, 2], vec![1., 2., 3., 4.]).unwrap();
        let grad = TensorMap::from([("w".to_string(), Tensor::Dense(grad))]);
        optimizer.update(&model, &grad).unwrap();

        assert_eq!(**model.dense("w").unwrap().data().read(), [-1., -2., -3., -4.]);

        let bad = TensorMap::from([("w".to_string(), Tensor::Dense(DenseTensor::zeros(vec![4]).unwrap()))]);
        assert!(optimizer.update(&model, &bad).is_err());
    }

    #[test]
    fn sparse_update_skips_missing_rows() {
        let model = model(3);
        let optimizer = sgd(&model, 3);
        materialize(&model, &[1, 2]);

        optimizer
            .update(&model, &sparse_grad("emb", &[(1, [1., 1.]), (9, [1., 1.])]))
            .unwrap();

        assert_eq!(row(&model, 1), Some(vec![-1., -1.]));
        assert_eq!(row(&model, 2), Some(vec![0., 0.]));
        assert_eq!(row(&model, 9), None);
    }

    #[test]
    fn sparse_rows_update_dense_rows() {
        let model = model(1);
        let optimizer = sgd(&model, 1);

        optimizer
            .update(&model, &sparse_grad("w", &[(1, [1., 2.]), (5, [9., 9.])]))
            .unwrap();

        assert_eq!(**model.dense("w").unwrap().data().read(), [0., 0., -1., -2.]);
    }

    #[test]
    fn aux_rows_are_created_lazily() {
        let model = model(2);
        let mut optimizer = RuleOptimizer::<GradientDescentWithMomentum>::default();
        optimizer.init(&model);
        optimizer.init_lock(NonZeroUsize::new(2).unwrap());
        materialize(&model, &[4]);

        assert!(optimizer.aux_row("emb", 4).is_none());
        optimizer
            .update(&model, &sparse_grad("emb", &[(4, [1., 2.])]))
            .unwrap();
        assert_eq!(optimizer.aux_row("emb", 4), Some(vec![1., 2.]));
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        const THREADS: usize = 8;
        const UPDATES: usize = 100;

        let model = Arc::new(model(4));
        let optimizer = Arc::new(sgd(&model, 4));
        materialize(&model, &(0..=THREADS as Id).collect::<Vec<_>>());

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let model = Arc::clone(&model);
                let optimizer = Arc::clone(&optimizer);

                thread::spawn(move || {
                    let grad = sparse_grad("emb", &[(0, [1., 1.]), (t as Id + 1, [1., 1.])]);
                    for _ in 0..UPDATES {
                        optimizer.update(&model, &grad).unwrap();
                    }
                })
            })
            .collect();

        handles.into_iter().for_each(|h| h.join().unwrap());

        let shared = -((THREADS * UPDATES) as f32);
        assert_eq!(row(&model, 0), Some(vec![shared, shared]));

        for id in 1..=THREADS as Id {
            assert_eq!(row(&model, id), Some(vec![-(UPDATES as f32); 2]));
        }
    }

    #[test]
    fn warmup_takes_transient_state() {
        let model = model(1);
        materialize(&model, &[1]);

        let mut old = RuleOptimizer::<Adam>::default();
        old.init(&model);
        old.init_lock(NonZeroUsize::MIN);
        old.update(&model, &sparse_grad("emb", &[(1, [1., 1.])])).unwrap();

        let mut new = RuleOptimizer::<Adam>::default();
        new.init(&model);
        new.warmup(&old).unwrap();

        assert_eq!(new.aux_row("emb", 1), old.aux_row("emb", 1));
        assert_eq!(*new.schedule.lock(), *old.schedule.lock());

        let sgd = sgd(&model, 1);
        assert!(matches!(new.warmup(&sgd), Err(OptimizerErr::RuleMismatch { .. })));
    }

    #[test]
    fn checkpoint_round_trip() {
        let model = model(1);
        materialize(&model, &[3]);

        let mut optimizer = RuleOptimizer::<Adam>::default();
        optimizer.init(&model);
        optimizer.init_config(&config::parse_config("alpha=0.5").unwrap()).unwrap();
        optimizer.init_lock(NonZeroUsize::MIN);
        optimizer.update(&model, &sparse_grad("emb", &[(3, [1., -1.])])).unwrap();

        let mut buf = Vec::new();
        optimizer.write(&mut buf);

        let mut restored = RuleOptimizer::<Adam>::default();
        restored.init(&model);
        let mut reader = ByteReader::new(&buf);
        restored.read(&mut reader).unwrap();
        reader.finish().unwrap();

        assert_eq!(restored.rule().config(), optimizer.rule().config());
        assert_eq!(*restored.schedule.lock(), *optimizer.schedule.lock());
        assert_eq!(restored.aux_row("emb", 3), optimizer.aux_row("emb", 3));

        let mut other = RuleOptimizer::<GradientDescent>::default();
        other.init(&model);
        assert!(other.read(&mut ByteReader::new(&buf)).is_err());
    }
}
