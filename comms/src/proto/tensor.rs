use std::{
    collections::{BTreeMap, HashMap},
    io,
};

use crate::{ByteReader, Deserialize, Serialize};

/// The key of a sparse row.
pub type Id = u64;

/// A name to tensor mapping, used for pulled parameters, gradients and checkpoints.
pub type TensorMap = BTreeMap<String, Tensor>;

/// A contiguous tensor addressed by a fixed shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DenseTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl DenseTensor {
    /// Creates a new `DenseTensor` filled with zeros.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    ///
    /// # Returns
    /// An `InvalidData` error if the shape holds more values than a `usize` can count.
    pub fn zeros(shape: Vec<usize>) -> io::Result<Self> {
        let len = checked_len(&shape)?;
        Ok(Self {
            shape,
            data: vec![0.; len],
        })
    }

    /// Creates a new `DenseTensor` from raw values.
    ///
    /// # Returns
    /// An `InvalidData` error if the amount of values doesn't match the shape.
    pub fn from_data(shape: Vec<usize>, data: Vec<f32>) -> io::Result<Self> {
        let len = checked_len(&shape)?;

        if len != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tensor of shape {shape:?} can't hold {} values", data.len()),
            ));
        }

        Ok(Self { shape, data })
    }

    /// Returns the length of a row, the last dimension of the shape.
    pub fn row_len(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }
}

/// Returns the amount of values a tensor of `shape` holds, `None` on overflow.
pub fn shape_len(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |len, &dim| len.checked_mul(dim))
}

fn checked_len(shape: &[usize]) -> io::Result<usize> {
    shape_len(shape).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("tensor of shape {shape:?} is too large"),
        )
    })
}

/// A sparse row map, only the rows that have been touched are stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseRows {
    pub col: usize,
    pub rows: HashMap<Id, Vec<f32>>,
}

impl SparseRows {
    /// Creates a new empty `SparseRows` with rows of `col` values.
    pub fn new(col: usize) -> Self {
        Self {
            col,
            rows: HashMap::new(),
        }
    }

    /// Returns the amount of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A parameter, gradient or auxiliary tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    Dense(DenseTensor),
    Sparse(SparseRows),
}

impl Tensor {
    const DENSE: u32 = 0;
    const SPARSE: u32 = 1;

    /// Returns `true` if the tensor holds no values.
    pub fn is_empty(&self) -> bool {
        match self {
            Tensor::Dense(tsr) => tsr.data.is_empty(),
            Tensor::Sparse(srm) => srm.is_empty(),
        }
    }
}

impl Serialize for DenseTensor {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.shape.serialize(buf);
        self.data.serialize(buf);
    }
}

impl<'a> Deserialize<'a> for DenseTensor {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let shape = reader.read()?;
        let data = reader.read()?;
        Self::from_data(shape, data)
    }
}

impl Serialize for SparseRows {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.col.serialize(buf);
        self.rows.serialize(buf);
    }
}

impl<'a> Deserialize<'a> for SparseRows {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let col = reader.read()?;
        let rows: HashMap<Id, Vec<f32>> = reader.read()?;

        if let Some((id, row)) = rows.iter().find(|(_, row)| row.len() != col) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("row {id} has {} values, expected {col}", row.len()),
            ));
        }

        Ok(Self { col, rows })
    }
}

impl Serialize for Tensor {
    fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            Tensor::Dense(tsr) => {
                Self::DENSE.serialize(buf);
                tsr.serialize(buf);
            }
            Tensor::Sparse(srm) => {
                Self::SPARSE.serialize(buf);
                srm.serialize(buf);
            }
        }
    }
}

impl<'a> Deserialize<'a> for Tensor {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        match reader.read::<u32>()? {
            Self::DENSE => reader.read().map(Tensor::Dense),
            Self::SPARSE => reader.read().map(Tensor::Sparse),
            kind => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid tensor kind {kind}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::from_bytes;

    #[test]
    fn dense_shape_mismatch_is_rejected() {
        let tsr = DenseTensor {
            shape: vec![2, 2],
            data: vec![1., 2., 3.],
        };

        let mut buf = Vec::new();
        tsr.serialize(&mut buf);
        assert!(from_bytes::<DenseTensor>(&buf).is_err());
    }

    #[test]
    fn overflowing_shapes_are_rejected() {
        let mut buf = Vec::new();
        vec![usize::MAX, 2].serialize(&mut buf);
        Vec::<f32>::new().serialize(&mut buf);

        let err = from_bytes::<DenseTensor>(&buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(DenseTensor::zeros(vec![usize::MAX, 2]).is_err());
        assert_eq!(shape_len(&[2, 3]), Some(6));
    }

    #[test]
    fn sparse_row_width_is_checked() {
        let mut srm = SparseRows::new(2);
        srm.rows.insert(7, vec![1.]);

        let mut buf = Vec::new();
        srm.serialize(&mut buf);
        assert!(from_bytes::<SparseRows>(&buf).is_err());
    }

    #[test]
    fn tensor_map_round_trip() {
        let mut srm = SparseRows::new(2);
        srm.rows.insert(3, vec![0.5, -0.5]);
        srm.rows.insert(1, vec![1., 2.]);

        let mut map = TensorMap::new();
        map.insert("w".into(), Tensor::Dense(DenseTensor::zeros(vec![2, 3]).unwrap()));
        map.insert("emb".into(), Tensor::Sparse(srm));

        let mut buf = Vec::new();
        map.serialize(&mut buf);
        let decoded: TensorMap = from_bytes(&buf).unwrap();
        assert_eq!(decoded, map);

        let mut again = Vec::new();
        decoded.serialize(&mut again);
        assert_eq!(again, buf);
    }
}
