use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use crate::initialization::RandErr;

/// The specific result type for the storage module.
pub type Result<T> = std::result::Result<T, StorageErr>;

/// Error returned whenever a graph can't be compiled into a `Model`, or a tensor
/// doesn't match the shape of the parameter it's applied to.
#[derive(Debug)]
pub enum StorageErr {
    Duplicate(String),
    Invalid { name: String, reason: &'static str },
    SizeMismatch { name: String, expected: usize, got: usize },
    KindMismatch(String),
    Init { name: String, source: RandErr },
}

impl Display for StorageErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate(name) => write!(f, "parameter {name:?} is declared twice"),
            Self::Invalid { name, reason } => write!(f, "parameter {name:?}: {reason}"),
            Self::SizeMismatch {
                name,
                expected,
                got,
            } => write!(f, "parameter {name:?} expects {expected} values, got {got}"),
            Self::KindMismatch(name) => write!(f, "parameter {name:?} got a tensor of the wrong kind"),
            Self::Init { name, source } => write!(f, "parameter {name:?}: {source}"),
        }
    }
}

impl Error for StorageErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Init { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<StorageErr> for io::Error {
    fn from(value: StorageErr) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value)
    }
}
