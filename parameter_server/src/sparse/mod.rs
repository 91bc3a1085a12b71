//! Policies over the id space of the sparse tables.

mod freq_store;
mod ts_store;

pub use freq_store::FreqStore;
pub use ts_store::{Baseline, TsStore};
