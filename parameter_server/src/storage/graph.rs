use std::collections::HashSet;

use comms::proto::shape_len;
use serde::Deserialize;

use super::{Result, StorageErr};
use crate::initialization::Initializer;

/// The layout of a trainable parameter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// A contiguous tensor, a 2-D one can also be updated by sparse rows.
    Dense { shape: Vec<usize> },
    /// A sparse row map with rows of `col` values, grown on demand.
    Sparse { col: usize },
}

/// A trainable parameter of the compiled graph.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamDecl {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub init: Initializer,
}

impl ParamDecl {
    /// Declares a dense parameter.
    pub fn dense(name: &str, shape: Vec<usize>, init: Initializer) -> Self {
        Self {
            name: name.to_string(),
            kind: ParamKind::Dense { shape },
            init,
        }
    }

    /// Declares a sparse parameter.
    pub fn sparse(name: &str, col: usize, init: Initializer) -> Self {
        Self {
            name: name.to_string(),
            kind: ParamKind::Sparse { col },
            init,
        }
    }
}

/// The compiled list of trainable parameters, shared by every parameter server shard.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Graph {
    pub params: Vec<ParamDecl>,
}

impl Graph {
    /// Creates a new `Graph`.
    pub fn new(params: Vec<ParamDecl>) -> Self {
        Self { params }
    }

    /// Checks that names are unique, that no parameter is empty and that
    /// every initializer can be sampled from.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();

        for decl in &self.params {
            if !names.insert(decl.name.as_str()) {
                return Err(StorageErr::Duplicate(decl.name.clone()));
            }

            let empty = match &decl.kind {
                ParamKind::Dense { shape } => shape.is_empty() || shape.contains(&0),
                ParamKind::Sparse { col } => *col == 0,
            };

            if empty {
                return Err(StorageErr::Invalid {
                    name: decl.name.clone(),
                    reason: "a parameter can't be empty",
                });
            }

            let too_large = match &decl.kind {
                ParamKind::Dense { shape } => shape_len(shape).is_none(),
                ParamKind::Sparse { .. } => false,
            };

            if too_large {
                return Err(StorageErr::Invalid {
                    name: decl.name.clone(),
                    reason: "the shape is too large",
                });
            }

            decl.init.validate().map_err(|source| StorageErr::Init {
                name: decl.name.clone(),
                source,
            })?;
        }

        Ok(())
    }
}
