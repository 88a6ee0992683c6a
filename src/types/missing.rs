//! Missing data descriptors.
//!
//! A measure may hold values that block aggregation must skip. A request describes them with one
//! of the [Missing] variants, in JSON numbers; once the measure type is known the descriptor is
//! converted to that element type.

use serde::{Deserialize, Serialize};
use validator::ValidationError;

use crate::error::CubeError;
use crate::models::DType;
use crate::operation::Element;
use crate::types::dvalue::TryFromDValue;
use crate::types::DValue;

/// Which measure values count as missing.
///
/// `T` is [DValue] in requests and the measure's element type during aggregation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Missing<T> {
    MissingValue(T),
    MissingValues(Vec<T>),
    /// Values below the minimum are missing
    ValidMin(T),
    /// Values above the maximum are missing
    ValidMax(T),
    /// Values outside of the inclusive range are missing
    ValidRange(T, T),
}

impl<T> Missing<T> {
    /// Applies `convert` to every value of the descriptor.
    fn try_map<U, E>(&self, convert: impl Fn(&T) -> Result<U, E>) -> Result<Missing<U>, E> {
        Ok(match self {
            Self::MissingValue(value) => Missing::MissingValue(convert(value)?),
            Self::MissingValues(values) => {
                Missing::MissingValues(values.iter().map(convert).collect::<Result<_, _>>()?)
            }
            Self::ValidMin(min) => Missing::ValidMin(convert(min)?),
            Self::ValidMax(max) => Missing::ValidMax(convert(max)?),
            Self::ValidRange(min, max) => Missing::ValidRange(convert(min)?, convert(max)?),
        })
    }
}

fn invalid(code: &'static str, detail: String) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.add_param("detail".into(), &detail);
    error
}

impl Missing<DValue> {
    /// Checks that the descriptor applies to a measure of type `dtype`.
    ///
    /// Every value must be representable in `dtype`, a list needs a first value to fill
    /// all-missing groups with, and a range must not be empty.
    pub fn validate(&self, dtype: DType) -> Result<(), ValidationError> {
        match dtype {
            DType::Byte => self.validate_as::<i8>(),
            DType::Short => self.validate_as::<i16>(),
            DType::Int => self.validate_as::<i32>(),
            DType::Long => self.validate_as::<i64>(),
            DType::Float => self.validate_as::<f32>(),
            DType::Double => self.validate_as::<f64>(),
        }
    }

    fn validate_as<T: TryFromDValue + PartialOrd>(&self) -> Result<(), ValidationError> {
        let converted = Missing::<T>::try_from(self)
            .map_err(|err| invalid("missing_incompatible", err.to_string()))?;
        match converted {
            Missing::MissingValues(values) if values.is_empty() => Err(invalid(
                "missing_values_empty",
                "no missing value given".to_string(),
            )),
            Missing::ValidRange(min, max) if min > max => Err(invalid(
                "missing_range_empty",
                "valid range minimum is greater than its maximum".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl<T: TryFromDValue> TryFrom<&Missing<DValue>> for Missing<T> {
    type Error = CubeError;

    fn try_from(missing: &Missing<DValue>) -> Result<Self, Self::Error> {
        missing.try_map(|value| T::try_from_dvalue(value.clone()))
    }
}

impl<T: Element> Missing<T> {
    pub fn is_missing(&self, x: &T) -> bool {
        match self {
            Self::MissingValue(value) => x == value,
            Self::MissingValues(values) => values.contains(x),
            Self::ValidMin(min) => x < min,
            Self::ValidMax(max) => x > max,
            Self::ValidRange(min, max) => x < min || x > max,
        }
    }

    /// Value written for a group in which every element is missing.
    ///
    /// Valid bounds have no representative, so those groups get zero.
    pub fn fill_value(&self) -> Option<T> {
        match self {
            Self::MissingValue(value) => Some(*value),
            Self::MissingValues(values) => values.first().copied(),
            Self::ValidMin(_) | Self::ValidMax(_) | Self::ValidRange(..) => None,
        }
    }
}
