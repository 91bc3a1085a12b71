use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    io,
};

use crate::{
    ByteReader, Deserialize, Serialize,
    proto::{Id, TensorMap},
};

/// The cumulative or per batch occurrence count of a sparse id.
pub type Freq = u32;

/// A logical timestamp, the last step at which a sparse id was updated.
pub type Ts = u32;

/// A set of sparse ids.
pub type IdSet = HashSet<Id>;

/// Sparse ids and their occurrence counts.
pub type IdFreqMap = HashMap<Id, Freq>;

/// A request to read parameters from a parameter server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullRequest {
    /// Whether the request comes from training, only then missing rows are created.
    pub is_train: bool,
    /// The names of the requested dense tensors.
    pub tsr_set: BTreeSet<String>,
    /// The requested ids of each sparse tensor.
    pub srm_map: BTreeMap<String, IdSet>,
    /// The ids observed in the batch and how many times.
    pub id_freq_map: IdFreqMap,
}

impl PullRequest {
    /// Returns `true` if neither dense tensors nor sparse ids are requested.
    pub fn is_empty(&self) -> bool {
        self.tsr_set.is_empty() && self.srm_map.values().all(HashSet::is_empty)
    }

    /// Clears the request keeping the allocations.
    pub fn clear(&mut self) {
        self.is_train = false;
        self.tsr_set.clear();
        self.srm_map.clear();
        self.id_freq_map.clear();
    }
}

impl Serialize for PullRequest {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.is_train.serialize(buf);
        self.tsr_set.serialize(buf);
        self.srm_map.serialize(buf);
        self.id_freq_map.serialize(buf);
    }
}

impl<'a> Deserialize<'a> for PullRequest {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        Ok(Self {
            is_train: reader.read()?,
            tsr_set: reader.read()?,
            srm_map: reader.read()?,
            id_freq_map: reader.read()?,
        })
    }
}

/// The body of a push: gradients to apply and parameters to overwrite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushNotify {
    pub grad: TensorMap,
    pub overwritten: TensorMap,
}

impl PushNotify {
    /// Returns `true` if there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.grad.is_empty() && self.overwritten.is_empty()
    }
}

impl Serialize for PushNotify {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.grad.serialize(buf);
        self.overwritten.serialize(buf);
    }
}

impl<'a> Deserialize<'a> for PushNotify {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        Ok(Self {
            grad: reader.read()?,
            overwritten: reader.read()?,
        })
    }
}
