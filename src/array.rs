//! Typed views over the opaque byte blobs holding dimension arrays and measures.

use crate::error::CubeError;
use crate::models::DType;

use num_traits::{NumCast, ToPrimitive};
// Bring trait into scope to use as_bytes method.
use zerocopy::AsBytes;

/// Convert from bytes to `Vec<T>`.
///
/// Zerocopy provides a mechanism for converting between types. Blobs coming back from storage have
/// no alignment guarantee, so the data is first copied into an 8-byte aligned buffer.
///
/// # Arguments
///
/// * `data`: Bytes containing data to convert.
pub fn from_bytes<T: zerocopy::FromBytes + Copy>(data: &[u8]) -> Result<Vec<T>, CubeError> {
    let mut buf = maligned::align_first::<u8, maligned::A8>(data.len());
    buf.extend_from_slice(data);
    let layout = zerocopy::LayoutVerified::<_, [T]>::new_slice(&buf[..]).ok_or(
        CubeError::FromBytes {
            type_name: std::any::type_name::<T>(),
        },
    )?;
    Ok(layout.into_slice().to_vec())
}

/// Arithmetic mean of a run of values, expressed in the type of the values.
///
/// Integer means are truncated towards zero.
trait Centroid: Sized + Copy {
    fn centroid(values: &[Self]) -> Self;
}

macro_rules! centroid_int {
    ($($t:ty),*) => {
        $(
            impl Centroid for $t {
                fn centroid(values: &[Self]) -> Self {
                    let sum: i128 = values.iter().map(|v| *v as i128).sum();
                    (sum / values.len() as i128) as $t
                }
            }
        )*
    };
}

centroid_int!(i8, i16, i32, i64);

impl Centroid for f32 {
    fn centroid(values: &[Self]) -> Self {
        let sum: f64 = values.iter().map(|v| *v as f64).sum();
        (sum / values.len() as f64) as f32
    }
}

impl Centroid for f64 {
    fn centroid(values: &[Self]) -> Self {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// An owned array of one of the six supported element types.
#[derive(Clone, Debug, PartialEq)]
pub enum DimensionArray {
    Byte(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

/// Evaluates `$body` with `$values` bound to the inner vector, whatever its element type.
macro_rules! dispatch {
    ($array:expr, $values:ident => $body:expr) => {
        match $array {
            DimensionArray::Byte($values) => $body,
            DimensionArray::Short($values) => $body,
            DimensionArray::Int($values) => $body,
            DimensionArray::Long($values) => $body,
            DimensionArray::Float($values) => $body,
            DimensionArray::Double($values) => $body,
        }
    };
}

/// Builds an array of `dtype` by evaluating `$body` with `$t` bound to the element type.
macro_rules! build {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            DType::Byte => DimensionArray::Byte({
                type $t = i8;
                $body
            }),
            DType::Short => DimensionArray::Short({
                type $t = i16;
                $body
            }),
            DType::Int => DimensionArray::Int({
                type $t = i32;
                $body
            }),
            DType::Long => DimensionArray::Long({
                type $t = i64;
                $body
            }),
            DType::Float => DimensionArray::Float({
                type $t = f32;
                $body
            }),
            DType::Double => DimensionArray::Double({
                type $t = f64;
                $body
            }),
        }
    };
}

impl DimensionArray {
    /// Interprets `data` as an array of `dtype`.
    pub fn from_bytes(dtype: DType, data: &[u8]) -> Result<Self, CubeError> {
        Ok(build!(dtype, T => from_bytes::<T>(data)?))
    }

    /// Converts `values` to `dtype`, failing when a value is not representable.
    pub fn from_f64(dtype: DType, values: &[f64]) -> Result<Self, CubeError> {
        Ok(build!(dtype, T => values
            .iter()
            .map(|v| {
                <T as NumCast>::from(*v).ok_or(CubeError::FromBytes {
                    type_name: std::any::type_name::<T>(),
                })
            })
            .collect::<Result<Vec<T>, _>>()?))
    }

    /// Returns the 1-based positions `1..=count` as an index array.
    pub fn positions(count: u64) -> Self {
        Self::Long((1..=count as i64).collect())
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Byte(_) => DType::Byte,
            Self::Short(_) => DType::Short,
            Self::Int(_) => DType::Int,
            Self::Long(_) => DType::Long,
            Self::Float(_) => DType::Float,
            Self::Double(_) => DType::Double,
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, values => values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the raw native-endian encoding of the array.
    pub fn to_bytes(&self) -> Vec<u8> {
        dispatch!(self, values => values.as_slice().as_bytes().to_vec())
    }

    /// Returns element `index` widened to f64.
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        dispatch!(self, values => values.get(index).and_then(|v| v.to_f64()))
    }

    /// Returns element `index` as an integer; floating point values are truncated.
    pub fn get_i64(&self, index: usize) -> Option<i64> {
        dispatch!(self, values => values.get(index).and_then(|v| v.to_i64()))
    }

    /// Returns every element widened to f64.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.len()).filter_map(|i| self.get_f64(i)).collect()
    }

    /// Returns the elements at 0-based `positions`, in the given order.
    pub fn gather(&self, positions: &[usize]) -> Result<Self, CubeError> {
        let len = self.len();
        if let Some(position) = positions.iter().find(|p| **p >= len) {
            return Err(CubeError::SubsetOutOfDomain {
                subset: (position + 1).to_string(),
                count: len,
            });
        }
        Ok(match self {
            Self::Byte(values) => Self::Byte(positions.iter().map(|p| values[*p]).collect()),
            Self::Short(values) => Self::Short(positions.iter().map(|p| values[*p]).collect()),
            Self::Int(values) => Self::Int(positions.iter().map(|p| values[*p]).collect()),
            Self::Long(values) => Self::Long(positions.iter().map(|p| values[*p]).collect()),
            Self::Float(values) => Self::Float(positions.iter().map(|p| values[*p]).collect()),
            Self::Double(values) => Self::Double(positions.iter().map(|p| values[*p]).collect()),
        })
    }

    /// Overwrites element `first` with the mean of elements `first..=last`.
    pub fn update_value(&mut self, first: usize, last: usize) -> Result<(), CubeError> {
        if first > last || last >= self.len() {
            return Err(CubeError::SubsetOutOfDomain {
                subset: format!("{}:{}", first + 1, last + 1),
                count: self.len(),
            });
        }
        dispatch!(self, values => {
            values[first] = Centroid::centroid(&values[first..=last]);
        });
        Ok(())
    }
}
