mod error;
mod initializer;

pub use error::{RandErr, Result};
pub use initializer::{Initializer, Sampler};
