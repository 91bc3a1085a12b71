use std::{error::Error, fmt, io};

use comms::config::ConfigErr;

use crate::{optimization::OptimizerErr, storage::StorageErr};

/// The parameter server's result type.
pub type Result<T> = std::result::Result<T, PsErr>;

/// Failures while building, loading or saving a parameter server shard.
#[derive(Debug)]
pub enum PsErr {
    Io(io::Error),
    Config(ConfigErr),
    Optimizer(OptimizerErr),
    Storage(StorageErr),
    InvalidShard { shard_id: usize, shard_count: usize },
}

impl fmt::Display for PsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsErr::Io(e) => write!(f, "io error: {e}"),
            PsErr::Config(e) => write!(f, "{e}"),
            PsErr::Optimizer(e) => write!(f, "optimizer error: {e}"),
            PsErr::Storage(e) => write!(f, "model error: {e}"),
            PsErr::InvalidShard {
                shard_id,
                shard_count,
            } => write!(f, "shard {shard_id} is out of range for {shard_count} shards"),
        }
    }
}

impl Error for PsErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PsErr::Io(e) => Some(e),
            PsErr::Config(e) => Some(e),
            PsErr::Optimizer(e) => Some(e),
            PsErr::Storage(e) => Some(e),
            PsErr::InvalidShard { .. } => None,
        }
    }
}

impl From<io::Error> for PsErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ConfigErr> for PsErr {
    fn from(value: ConfigErr) -> Self {
        Self::Config(value)
    }
}

impl From<OptimizerErr> for PsErr {
    fn from(value: OptimizerErr) -> Self {
        Self::Optimizer(value)
    }
}

impl From<StorageErr> for PsErr {
    fn from(value: StorageErr) -> Self {
        Self::Storage(value)
    }
}

impl From<PsErr> for io::Error {
    fn from(value: PsErr) -> Self {
        match value {
            PsErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidInput, other),
        }
    }
}
