//! Data value representing a value of any [DType](crate::models::DType)

use crate::error::CubeError;

/// A value of any DType.
/// This is an alias of the Number type from serde_json, which is an enum that can represent
/// integers and floating point numbers.
/// The number type is an enum over i64, u64 and f64, with the additional constraint that floating
/// point numbers must be finite (not positive or negative infinity or NaN).
pub type DValue = serde_json::Number;

/// Try to convert a DValue to an i64.
fn as_i64(value: &DValue) -> Result<i64, CubeError> {
    value
        .as_i64()
        .ok_or(CubeError::IncompatibleMissing(value.clone()))
}

/// Try to convert a DValue to an f64.
fn as_f64(value: &DValue) -> Result<f64, CubeError> {
    value
        .as_f64()
        .ok_or(CubeError::IncompatibleMissing(value.clone()))
}

/// Attempt to convert from a [DValue] to specific numeric type.
// This trait exists because we can't implement TryFrom<DValue> for numeric types because the trait
// and type are in external crates.
pub trait TryFromDValue: Sized {
    /// Try to convert from a [DValue] to a numeric type.
    fn try_from_dvalue(value: DValue) -> Result<Self, CubeError>;
}

macro_rules! try_from_dvalue_narrow_int {
    ($($t:ty),*) => {
        $(
            impl TryFromDValue for $t {
                fn try_from_dvalue(value: DValue) -> Result<Self, CubeError> {
                    Self::try_from(as_i64(&value)?)
                        .map_err(|_| CubeError::IncompatibleMissing(value))
                }
            }
        )*
    };
}

try_from_dvalue_narrow_int!(i8, i16, i32);

impl TryFromDValue for i64 {
    fn try_from_dvalue(value: DValue) -> Result<Self, CubeError> {
        as_i64(&value)
    }
}

impl TryFromDValue for f32 {
    fn try_from_dvalue(value: DValue) -> Result<Self, CubeError> {
        // If the number is too large to be represented as an f32 this cast returns infinity.
        let float = as_f64(&value)? as f32;
        if float.is_finite() {
            Ok(float)
        } else {
            Err(CubeError::IncompatibleMissing(value))
        }
    }
}

impl TryFromDValue for f64 {
    fn try_from_dvalue(value: DValue) -> Result<Self, CubeError> {
        as_f64(&value)
    }
}

#[cfg(test)]
mod tests {
    use num_traits::Float;

    use super::*;

    #[test]
    fn test_dvalue_is_finite() {
        assert!(DValue::from_f64(f64::infinity()).is_none());
    }

    #[test]
    fn test_try_from_dvalue_i8() {
        let result = i8::try_from_dvalue((-7).into()).unwrap();
        assert_eq!(-7, result);
    }

    #[test]
    #[should_panic(expected = "IncompatibleMissing(Number(128))")]
    fn test_try_from_dvalue_i8_too_large() {
        i8::try_from_dvalue(128.into()).unwrap();
    }

    #[test]
    #[should_panic(expected = "IncompatibleMissing(Number(-32769))")]
    fn test_try_from_dvalue_i16_too_negative() {
        i16::try_from_dvalue((-32769).into()).unwrap();
    }

    #[test]
    fn test_try_from_dvalue_i32() {
        let result = i32::try_from_dvalue(42.into()).unwrap();
        assert_eq!(42, result);
    }

    #[test]
    #[should_panic(expected = "IncompatibleMissing(Number(2147483648))")]
    fn test_try_from_dvalue_i32_too_large() {
        i32::try_from_dvalue((i32::MAX as i64 + 1).into()).unwrap();
    }

    #[test]
    #[should_panic(expected = "IncompatibleMissing(Number(9223372036854775808))")]
    fn test_try_from_dvalue_i64_too_large() {
        i64::try_from_dvalue((i64::MAX as u64 + 1).into()).unwrap();
    }

    #[test]
    #[should_panic(expected = "IncompatibleMissing(Number(1.0))")]
    fn test_try_from_dvalue_i64_float() {
        i64::try_from_dvalue(DValue::from_f64(1.0).unwrap()).unwrap();
    }

    #[test]
    fn test_try_from_dvalue_f32_int() {
        let result = f32::try_from_dvalue(42_u64.into()).unwrap();
        assert_eq!(42.0, result);
    }

    #[test]
    #[should_panic(expected = "IncompatibleMissing(Number(6.805646932770577e38))")]
    fn test_try_from_dvalue_f32_too_large() {
        f32::try_from_dvalue(DValue::from_f64((f32::MAX as f64) * 2.0).unwrap()).unwrap();
    }

    #[test]
    fn test_try_from_dvalue_f64() {
        let result = f64::try_from_dvalue(DValue::from_f64(-1e20).unwrap()).unwrap();
        assert_eq!(-1e20, result);
    }
}
