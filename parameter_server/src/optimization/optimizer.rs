use std::{any::Any, io, num::NonZeroUsize};

use comms::{ByteReader, config::StringMap, proto::TensorMap};

use super::Result;
use crate::storage::{Model, SparseTable};

/// Defines the strategy for updating model parameters based on calculated gradients.
///
/// The lifecycle is `init`, `init_config`, `init_param` or `read`, then `init_lock`,
/// after which `update` may be called concurrently.
pub trait Optimizer: Send + Sync {
    /// Returns the short name the optimizer is registered under.
    fn name(&self) -> &'static str;

    /// Allocates the auxiliary state of every parameter of `model`.
    fn init(&mut self, model: &Model);

    /// Parses the textual hyperparameters.
    ///
    /// # Returns
    /// An error on unknown keys or out of range values.
    fn init_config(&mut self, config: &StringMap) -> Result<()>;

    /// Initializes the values of the parameters and resets the auxiliary state.
    fn init_param(&mut self, model: &Model);

    /// Splits the auxiliary state of the sparse tables into `shards` locks, the
    /// same amount the model's tables use.
    fn init_lock(&mut self, shards: NonZeroUsize);

    /// Applies a gradient to the parameters of `model`.
    ///
    /// Gradients of tensors `model` doesn't hold are ignored, as are sparse
    /// rows that don't exist in the model.
    ///
    /// # Arguments
    /// * `model` - The parameters to update.
    /// * `grad` - The gradient of every updated tensor.
    ///
    /// # Returns
    /// An error if called before `init_lock` or if a gradient doesn't match its parameter.
    fn update(&self, model: &Model, grad: &TensorMap) -> Result<()>;

    /// Takes the transient state of an optimizer restored from a checkpoint.
    ///
    /// # Returns
    /// An error if `other` doesn't use the same update rule.
    fn warmup(&self, other: &dyn Optimizer) -> Result<()>;

    /// Writes a checkpoint of the hyperparameters and auxiliary state.
    fn write(&self, buf: &mut Vec<u8>);

    /// Reads a checkpoint written by `write`.
    fn read(&mut self, reader: &mut ByteReader<'_>) -> io::Result<()>;

    /// Calls `f` on every sparse auxiliary table.
    fn for_each_srm(&self, f: &mut dyn FnMut(&str, &SparseTable));

    fn as_any(&self) -> &dyn Any;
}
