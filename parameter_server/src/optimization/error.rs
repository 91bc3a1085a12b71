use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use crate::storage::StorageErr;

/// The specific result type for the optimization module.
pub type Result<T> = std::result::Result<T, OptimizerErr>;

/// Error returned whenever an optimizer can't be built or configured, or an
/// update can't be applied.
#[derive(Debug)]
pub enum OptimizerErr {
    UnknownOptimizer(String),
    UnknownKey { optimizer: &'static str, key: String },
    InvalidValue { key: String, value: String },
    LockNotInitialized,
    RuleMismatch { expected: &'static str, got: String },
    Storage(StorageErr),
}

impl Display for OptimizerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOptimizer(name) => write!(f, "unknown optimizer {name:?}"),
            Self::UnknownKey { optimizer, key } => {
                write!(f, "unexpected config key {key:?} for optimizer {optimizer}")
            }
            Self::InvalidValue { key, value } => write!(f, "invalid {key}: {value:?}"),
            Self::LockNotInitialized => f.write_str("update called before init_lock"),
            Self::RuleMismatch { expected, got } => {
                write!(f, "expected a {expected} optimizer, got {got}")
            }
            Self::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl Error for OptimizerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageErr> for OptimizerErr {
    fn from(value: StorageErr) -> Self {
        Self::Storage(value)
    }
}

impl From<OptimizerErr> for io::Error {
    fn from(value: OptimizerErr) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value)
    }
}
