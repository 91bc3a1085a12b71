use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::LenType;

/// A value that can be written with the system's primitive encoding.
///
/// Integers and floats are written big endian with a fixed width, containers
/// as a `LenType` count followed by their elements. Sets and maps are always
/// written in ascending key order so the same value always encodes to the same bytes.
pub trait Serialize {
    /// Appends the encoded form of `self` to `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer to write into.
    fn serialize(&self, buf: &mut Vec<u8>);
}

macro_rules! serialize_be {
    ($($t:ty),*) => {
        $(
            impl Serialize for $t {
                fn serialize(&self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(&self.to_be_bytes());
                }
            }
        )*
    };
}

serialize_be!(u8, u32, i32, u64, i64, f32, f64);

/// Writes a container length prefix.
///
/// # Arguments
/// * `len` - The amount of elements or bytes that follow.
/// * `buf` - The buffer to write into.
pub fn serialize_len(len: usize, buf: &mut Vec<u8>) {
    (len as LenType).serialize(buf);
}

impl Serialize for () {
    fn serialize(&self, _buf: &mut Vec<u8>) {}
}

impl Serialize for bool {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }
}

impl Serialize for usize {
    fn serialize(&self, buf: &mut Vec<u8>) {
        (*self as u64).serialize(buf);
    }
}

impl Serialize for str {
    fn serialize(&self, buf: &mut Vec<u8>) {
        serialize_len(self.len(), buf);
        buf.extend_from_slice(self.as_bytes());
    }
}

impl Serialize for String {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.as_str().serialize(buf);
    }
}

impl<T: Serialize + ?Sized> Serialize for &T {
    fn serialize(&self, buf: &mut Vec<u8>) {
        (**self).serialize(buf);
    }
}

impl<T: Serialize> Serialize for [T] {
    fn serialize(&self, buf: &mut Vec<u8>) {
        serialize_len(self.len(), buf);
        self.iter().for_each(|item| item.serialize(buf));
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.as_slice().serialize(buf);
    }
}

impl<T: Serialize> Serialize for BTreeSet<T> {
    fn serialize(&self, buf: &mut Vec<u8>) {
        serialize_len(self.len(), buf);
        self.iter().for_each(|item| item.serialize(buf));
    }
}

impl<T: Serialize + Ord> Serialize for HashSet<T> {
    fn serialize(&self, buf: &mut Vec<u8>) {
        let mut items: Vec<_> = self.iter().collect();
        items.sort_unstable();
        items.serialize(buf);
    }
}

impl<K: Serialize, V: Serialize> Serialize for BTreeMap<K, V> {
    fn serialize(&self, buf: &mut Vec<u8>) {
        serialize_len(self.len(), buf);

        for (k, v) in self {
            k.serialize(buf);
            v.serialize(buf);
        }
    }
}

impl<K: Serialize + Ord, V: Serialize> Serialize for HashMap<K, V> {
    fn serialize(&self, buf: &mut Vec<u8>) {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        serialize_len(entries.len(), buf);

        for (k, v) in entries {
            k.serialize(buf);
            v.serialize(buf);
        }
    }
}

impl<A: Serialize, B: Serialize> Serialize for (A, B) {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.0.serialize(buf);
        self.1.serialize(buf);
    }
}

impl<T: Serialize, const N: usize> Serialize for [T; N] {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.iter().for_each(|item| item.serialize(buf));
    }
}

/// Writes `f` as a length prefixed byte string without knowing its size upfront.
///
/// A placeholder length is written first and patched once `f` returns.
///
/// # Arguments
/// * `buf` - The buffer to write into.
/// * `f` - The closure that writes the nested value.
pub fn serialize_nested<F>(buf: &mut Vec<u8>, f: F)
where
    F: FnOnce(&mut Vec<u8>),
{
    let start = buf.len();
    serialize_len(0, buf);
    f(buf);

    let len = (buf.len() - start - size_of::<LenType>()) as LenType;
    buf[start..start + size_of::<LenType>()].copy_from_slice(&len.to_be_bytes());
}
