//! Bit-exact serializers with a declared maximum size.
//!
//! Every value persisted by a tree goes through a [`Converter`]. The declared
//! [`max_object_size`](Converter::max_object_size) is what node capacities are
//! derived from, so a converter must never emit more bytes than it declares.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{TreeError, TreeResult};
use crate::region::{KeyRange, Lifespan, MvRegion, Rectangle, Separator, Version};

/// Serializer for values of type `T`.
pub trait Converter<T>: Send + Sync {
    /// Appends the encoding of `value` to `out`.
    fn write(&self, value: &T, out: &mut Vec<u8>) -> TreeResult<()>;

    /// Decodes one value from the front of `input`, advancing it.
    fn read(&self, input: &mut &[u8]) -> TreeResult<T>;

    /// Upper bound of the encoded size in bytes.
    fn max_object_size(&self) -> usize;

    fn to_bytes(&self, value: &T) -> TreeResult<Vec<u8>> {
        let mut out = Vec::new();
        self.write(value, &mut out)?;
        if out.len() > self.max_object_size() {
            return Err(TreeError::Serialization(format!(
                "encoded size {} exceeds declared maximum {}",
                out.len(),
                self.max_object_size()
            )));
        }
        Ok(out)
    }

    fn from_bytes(&self, bytes: &[u8]) -> TreeResult<T> {
        let mut input = bytes;
        self.read(&mut input)
    }

    /// Exact encoded size of `value`.
    fn serialized_size(&self, value: &T) -> TreeResult<usize> {
        let mut out = Vec::new();
        self.write(value, &mut out)?;
        Ok(out.len())
    }
}

impl<T, C: Converter<T> + ?Sized> Converter<T> for Arc<C> {
    fn write(&self, value: &T, out: &mut Vec<u8>) -> TreeResult<()> {
        (**self).write(value, out)
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<T> {
        (**self).read(input)
    }

    fn max_object_size(&self) -> usize {
        (**self).max_object_size()
    }
}

pub(crate) fn take<'a>(input: &mut &'a [u8], n: usize) -> TreeResult<&'a [u8]> {
    if input.len() < n {
        return Err(TreeError::Serialization(format!(
            "unexpected end of input: need {} bytes, have {}",
            n,
            input.len()
        )));
    }
    let slice: &'a [u8] = *input;
    let (head, tail) = slice.split_at(n);
    *input = tail;
    Ok(head)
}

pub(crate) fn read_u8(input: &mut &[u8]) -> TreeResult<u8> {
    Ok(take(input, 1)?[0])
}

pub(crate) fn read_u32(input: &mut &[u8]) -> TreeResult<u32> {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(take(input, 4)?);
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64(input: &mut &[u8]) -> TreeResult<u64> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(take(input, 8)?);
    Ok(u64::from_le_bytes(buf))
}

fn read_f64(input: &mut &[u8]) -> TreeResult<f64> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(take(input, 8)?);
    Ok(f64::from_le_bytes(buf))
}

/// Serde-backed converter using bincode's legacy fixed-int encoding.
///
/// Fixed-size types (integers, floats, tuples and arrays of them) get a
/// stable size; for variable-size types `max_size` is an enforced cap.
pub struct BincodeConverter<T> {
    max_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeConverter<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            _marker: PhantomData,
        }
    }
}

impl<T> BincodeConverter<T> {
    /// Converter whose maximum is the in-memory size of `T`; an upper bound
    /// of the legacy encoding for numbers and tuples or arrays of them.
    pub fn fixed() -> Self {
        Self::new(std::mem::size_of::<T>())
    }
}

impl<T: Serialize + DeserializeOwned> Converter<T> for BincodeConverter<T> {
    fn write(&self, value: &T, out: &mut Vec<u8>) -> TreeResult<()> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
        if bytes.len() > self.max_size {
            return Err(TreeError::Serialization(format!(
                "value of {} bytes exceeds converter limit {}",
                bytes.len(),
                self.max_size
            )));
        }
        out.extend_from_slice(&bytes);
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<T> {
        let slice: &[u8] = *input;
        let (value, consumed) =
            bincode::serde::decode_from_slice(slice, bincode::config::legacy())?;
        *input = &slice[consumed..];
        Ok(value)
    }

    fn max_object_size(&self) -> usize {
        self.max_size
    }
}

const TAG_NEG_INFINITY: u8 = 0;
const TAG_VALUE: u8 = 1;
const TAG_POS_INFINITY: u8 = 2;

/// Tag byte followed by the key for definite separators.
pub struct SeparatorConverter<K> {
    key: Arc<dyn Converter<K>>,
}

impl<K> SeparatorConverter<K> {
    pub fn new(key: Arc<dyn Converter<K>>) -> Self {
        Self { key }
    }
}

impl<K> Clone for SeparatorConverter<K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
        }
    }
}

impl<K> Converter<Separator<K>> for SeparatorConverter<K> {
    fn write(&self, value: &Separator<K>, out: &mut Vec<u8>) -> TreeResult<()> {
        match value {
            Separator::NegInfinity => out.push(TAG_NEG_INFINITY),
            Separator::Value(k) => {
                out.push(TAG_VALUE);
                self.key.write(k, out)?;
            }
            Separator::PosInfinity => out.push(TAG_POS_INFINITY),
        }
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<Separator<K>> {
        match read_u8(input)? {
            TAG_NEG_INFINITY => Ok(Separator::NegInfinity),
            TAG_VALUE => Ok(Separator::Value(self.key.read(input)?)),
            TAG_POS_INFINITY => Ok(Separator::PosInfinity),
            other => Err(TreeError::Serialization(format!(
                "unknown separator tag {}",
                other
            ))),
        }
    }

    fn max_object_size(&self) -> usize {
        1 + self.key.max_object_size()
    }
}

/// Both bounds of a range, each as a separator.
pub struct KeyRangeConverter<K> {
    separator: SeparatorConverter<K>,
}

impl<K> KeyRangeConverter<K> {
    pub fn new(key: Arc<dyn Converter<K>>) -> Self {
        Self {
            separator: SeparatorConverter::new(key),
        }
    }
}

impl<K: Ord + Clone> Converter<KeyRange<K>> for KeyRangeConverter<K> {
    fn write(&self, value: &KeyRange<K>, out: &mut Vec<u8>) -> TreeResult<()> {
        self.separator.write(&value.min, out)?;
        self.separator.write(&value.max, out)
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<KeyRange<K>> {
        let min = self.separator.read(input)?;
        let max = self.separator.read(input)?;
        Ok(KeyRange::new(min, max))
    }

    fn max_object_size(&self) -> usize {
        2 * self.separator.max_object_size()
    }
}

/// `dims` minimum coordinates followed by `dims` maximum coordinates, f64 LE.
#[derive(Debug, Clone, Copy)]
pub struct RectangleConverter {
    dims: usize,
}

impl RectangleConverter {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    pub fn dimensions(&self) -> usize {
        self.dims
    }
}

impl Converter<Rectangle> for RectangleConverter {
    fn write(&self, value: &Rectangle, out: &mut Vec<u8>) -> TreeResult<()> {
        if value.dimensions() != self.dims {
            return Err(TreeError::Serialization(format!(
                "expected {}-dimensional rectangle, got {}",
                self.dims,
                value.dimensions()
            )));
        }
        for c in value.min().iter().chain(value.max()) {
            out.extend_from_slice(&c.to_le_bytes());
        }
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<Rectangle> {
        let mut min = Vec::with_capacity(self.dims);
        let mut max = Vec::with_capacity(self.dims);
        for _ in 0..self.dims {
            min.push(read_f64(input)?);
        }
        for _ in 0..self.dims {
            max.push(read_f64(input)?);
        }
        Ok(Rectangle::new(min, max))
    }

    fn max_object_size(&self) -> usize {
        2 * self.dims * 8
    }
}

/// Insert version, a presence flag and the delete version (17 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct LifespanConverter;

impl Converter<Lifespan> for LifespanConverter {
    fn write(&self, value: &Lifespan, out: &mut Vec<u8>) -> TreeResult<()> {
        out.extend_from_slice(&value.insert.0.to_le_bytes());
        match value.delete {
            Some(d) => {
                out.push(1);
                out.extend_from_slice(&d.0.to_le_bytes());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&0u64.to_le_bytes());
            }
        }
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<Lifespan> {
        let insert = Version(read_u64(input)?);
        let flag = read_u8(input)?;
        let delete = read_u64(input)?;
        Ok(Lifespan::new(insert, (flag == 1).then_some(Version(delete))))
    }

    fn max_object_size(&self) -> usize {
        17
    }
}

/// Key range followed by its lifespan.
pub struct MvRegionConverter<K> {
    range: KeyRangeConverter<K>,
}

impl<K> MvRegionConverter<K> {
    pub fn new(key: Arc<dyn Converter<K>>) -> Self {
        Self {
            range: KeyRangeConverter::new(key),
        }
    }
}

impl<K: Ord + Clone> Converter<MvRegion<K>> for MvRegionConverter<K> {
    fn write(&self, value: &MvRegion<K>, out: &mut Vec<u8>) -> TreeResult<()> {
        self.range.write(&value.range, out)?;
        LifespanConverter.write(&value.lifespan, out)
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<MvRegion<K>> {
        let range = self.range.read(input)?;
        let lifespan = LifespanConverter.read(input)?;
        Ok(MvRegion::new(range, lifespan))
    }

    fn max_object_size(&self) -> usize {
        self.range.max_object_size() + LifespanConverter.max_object_size()
    }
}
