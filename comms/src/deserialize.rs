use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    hash::Hash,
    io,
};

use crate::LenType;

/// A value that can be read back from the system's primitive encoding.
///
/// The lifetime `'a` is the lifetime of the received frame, borrowed values
/// such as `&'a str` alias it instead of copying.
pub trait Deserialize<'a>: Sized {
    /// Reads one value from `reader`.
    ///
    /// # Arguments
    /// * `reader` - The cursor over the received bytes.
    ///
    /// # Returns
    /// The decoded value or an `InvalidData` error if the bytes are malformed.
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self>;
}

/// A forward only cursor over a borrowed byte buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    /// Creates a new `ByteReader`.
    ///
    /// # Arguments
    /// * `buf` - The bytes to read from.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the amount of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Consumes the next `n` bytes.
    ///
    /// # Arguments
    /// * `n` - The amount of bytes to consume.
    ///
    /// # Returns
    /// The consumed bytes or an error if there aren't enough left.
    pub fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(unexpected_end(n, self.buf.len()));
        }

        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Reads a fixed size array of bytes.
    pub fn take_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let bytes = self.take(N)?;
        let mut array = [0; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    /// Reads a container length prefix.
    ///
    /// The length is checked against the remaining bytes assuming every element
    /// takes at least `min_elem_size` bytes, so corrupted prefixes never cause huge allocations.
    ///
    /// # Arguments
    /// * `min_elem_size` - The smallest encoded size of a single element.
    pub fn read_len(&mut self, min_elem_size: usize) -> io::Result<usize> {
        let len = LenType::from_be_bytes(self.take_array()?);
        let len = usize::try_from(len).map_err(|_| invalid_len(len, self.remaining()))?;

        if len.saturating_mul(min_elem_size) > self.remaining() {
            return Err(invalid_len(len as LenType, self.remaining()));
        }

        Ok(len)
    }

    /// Decodes a value of type `T`.
    pub fn read<T: Deserialize<'a>>(&mut self) -> io::Result<T> {
        T::deserialize(self)
    }

    /// Fails if there are bytes left over.
    pub fn finish(&self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} trailing bytes after the decoded value", self.buf.len()),
        ))
    }
}

/// Decodes a whole buffer into a `T`, failing on trailing bytes.
///
/// # Arguments
/// * `buf` - The encoded bytes.
///
/// # Returns
/// The decoded value or an `InvalidData` error.
pub fn from_bytes<'a, T: Deserialize<'a>>(buf: &'a [u8]) -> io::Result<T> {
    let mut reader = ByteReader::new(buf);
    let value = reader.read()?;
    reader.finish()?;
    Ok(value)
}

fn unexpected_end(needed: usize, left: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected end of buffer, needed {needed} bytes but only {left} are left"),
    )
}

fn invalid_len(len: LenType, left: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("invalid length prefix {len} with {left} bytes left"),
    )
}

macro_rules! deserialize_be {
    ($($t:ty),*) => {
        $(
            impl<'a> Deserialize<'a> for $t {
                fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
                    Ok(<$t>::from_be_bytes(reader.take_array()?))
                }
            }
        )*
    };
}

deserialize_be!(u8, u32, i32, u64, i64, f32, f64);

impl<'a> Deserialize<'a> for () {
    fn deserialize(_reader: &mut ByteReader<'a>) -> io::Result<Self> {
        Ok(())
    }
}

impl<'a> Deserialize<'a> for bool {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        match reader.read::<u8>()? {
            0 => Ok(false),
            1 => Ok(true),
            byte => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid bool byte {byte}"),
            )),
        }
    }
}

impl<'a> Deserialize<'a> for usize {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let value = reader.read::<u64>()?;
        usize::try_from(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<'a> Deserialize<'a> for &'a [u8] {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let len = reader.read_len(1)?;
        reader.take(len)
    }
}

impl<'a> Deserialize<'a> for &'a str {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let bytes: &'a [u8] = reader.read()?;
        str::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<'a> Deserialize<'a> for String {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        reader.read::<&str>().map(str::to_owned)
    }
}

impl<'a, T: Deserialize<'a>> Deserialize<'a> for Vec<T> {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let len = reader.read_len(1)?;
        (0..len).map(|_| reader.read()).collect()
    }
}

impl<'a, T: Deserialize<'a> + Ord> Deserialize<'a> for BTreeSet<T> {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let len = reader.read_len(1)?;
        (0..len).map(|_| reader.read()).collect()
    }
}

impl<'a, T: Deserialize<'a> + Eq + Hash> Deserialize<'a> for HashSet<T> {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let len = reader.read_len(1)?;
        let mut set = HashSet::with_capacity(len);

        for _ in 0..len {
            set.insert(reader.read()?);
        }

        Ok(set)
    }
}

impl<'a, K, V> Deserialize<'a> for BTreeMap<K, V>
where
    K: Deserialize<'a> + Ord,
    V: Deserialize<'a>,
{
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let len = reader.read_len(2)?;
        (0..len)
            .map(|_| -> io::Result<(K, V)> { Ok((reader.read()?, reader.read()?)) })
            .collect()
    }
}

impl<'a, K, V> Deserialize<'a> for HashMap<K, V>
where
    K: Deserialize<'a> + Eq + Hash,
    V: Deserialize<'a>,
{
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let len = reader.read_len(2)?;
        let mut map = HashMap::with_capacity(len);

        for _ in 0..len {
            let k = reader.read()?;
            let v = reader.read()?;
            map.insert(k, v);
        }

        Ok(map)
    }
}

impl<'a, A: Deserialize<'a>, B: Deserialize<'a>> Deserialize<'a> for (A, B) {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        Ok((reader.read()?, reader.read()?))
    }
}

impl<'a, T: Deserialize<'a> + Default + Copy, const N: usize> Deserialize<'a> for [T; N] {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        let mut array = [T::default(); N];

        for item in array.iter_mut() {
            *item = reader.read()?;
        }

        Ok(array)
    }
}
