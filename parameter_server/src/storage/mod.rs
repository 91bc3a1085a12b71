mod error;
mod graph;
mod handle;
mod model;
mod table;

pub use error::{Result, StorageErr};
pub use graph::{Graph, ParamDecl, ParamKind};
pub use handle::ShardHandle;
pub use model::{DenseParam, Model, read_version};
pub use table::{Rows, SparseTable};
