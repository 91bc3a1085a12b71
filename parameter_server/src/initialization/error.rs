use std::{
    error::Error,
    fmt::{self, Display},
};

use rand_distr::{NormalError, uniform::Error as UniformError};

/// The specific result type for building the samplers of an `Initializer`.
pub type Result<T> = std::result::Result<T, RandErr>;

/// Error returned whenever an `Initializer` has parameters its distribution
/// can't be built from, like an empty range or a non finite standard deviation.
#[derive(Debug)]
pub struct RandErr(String);

impl RandErr {
    pub(super) fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<NormalError> for RandErr {
    fn from(value: NormalError) -> Self {
        Self(value.to_string())
    }
}

impl From<UniformError> for RandErr {
    fn from(value: UniformError) -> Self {
        Self(value.to_string())
    }
}

impl Display for RandErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid initializer: {}", self.0)
    }
}

impl Error for RandErr {}
