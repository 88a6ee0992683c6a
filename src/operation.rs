use crate::error::CubeError;
use crate::models::{BlockTask, DType};
use crate::types::dvalue::TryFromDValue;

use bytes::Bytes;

/// Trait for measure elements.
pub trait Element:
    Clone
    + Copy
    + PartialOrd
    + num_traits::FromPrimitive
    + num_traits::ToPrimitive
    + num_traits::Zero
    + std::fmt::Debug
    + std::ops::Add<Output = Self>
    + std::ops::Div<Output = Self>
    + zerocopy::AsBytes
    + zerocopy::FromBytes
    + TryFromDValue
    + Send
    + Sync
{
}

/// Blanket implementation of Element.
impl<T> Element for T where
    T: Clone
        + Copy
        + PartialOrd
        + num_traits::FromPrimitive
        + num_traits::ToPrimitive
        + num_traits::Zero
        + std::fmt::Debug
        + std::ops::Add<Output = Self>
        + std::ops::Div<Output = Self>
        + zerocopy::AsBytes
        + zerocopy::FromBytes
        + TryFromDValue
        + Send
        + Sync
{
}

/// Trait for block aggregation operations.
///
/// This forms the contract between the fragment stores and operations.
pub trait Operation {
    /// Execute the operation.
    ///
    /// Returns the output rows of one fragment, encoded as stored.
    ///
    /// # Arguments
    ///
    /// * `task`: Sizing and parameters of the aggregation
    /// * `rows`: Stored rows of the source fragment, in key order
    fn execute(task: &BlockTask, rows: &[Bytes]) -> Result<Vec<Bytes>, CubeError>;
}

/// Trait for block aggregation operations on numerical data.
///
/// This trait provides an entry point into the type system based on the runtime measure type.
pub trait NumOperation: Operation {
    fn execute_t<T: Element>(task: &BlockTask, rows: &[Bytes]) -> Result<Vec<Bytes>, CubeError>;
}

impl<T: NumOperation> Operation for T {
    /// Execute the operation.
    ///
    /// This method dispatches to `execute_t` based on the measure type.
    fn execute(task: &BlockTask, rows: &[Bytes]) -> Result<Vec<Bytes>, CubeError> {
        match task.measure_type {
            DType::Byte => Self::execute_t::<i8>(task, rows),
            DType::Short => Self::execute_t::<i16>(task, rows),
            DType::Int => Self::execute_t::<i32>(task, rows),
            DType::Long => Self::execute_t::<i64>(task, rows),
            DType::Float => Self::execute_t::<f32>(task, rows),
            DType::Double => Self::execute_t::<f64>(task, rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    struct TestOp {}

    impl Operation for TestOp {
        fn execute(_task: &BlockTask, rows: &[Bytes]) -> Result<Vec<Bytes>, CubeError> {
            // Pass rows through unchanged.
            Ok(rows.to_vec())
        }
    }

    #[test]
    fn operation_identity() {
        let task = test_utils::get_test_block_task();
        let rows = vec![Bytes::from_static(&[1, 2, 3, 4])];
        let result = TestOp::execute(&task, &rows).unwrap();
        assert_eq!(rows, result);
    }

    struct TestNumOp {}

    impl NumOperation for TestNumOp {
        fn execute_t<T: Element>(
            _task: &BlockTask,
            _rows: &[Bytes],
        ) -> Result<Vec<Bytes>, CubeError> {
            // Write the name of the type parameter to the only row.
            Ok(vec![Bytes::from(std::any::type_name::<T>())])
        }
    }

    #[test]
    fn num_operation_dispatch() {
        let mut task = test_utils::get_test_block_task();
        for (dtype, name) in [
            (DType::Byte, "i8"),
            (DType::Short, "i16"),
            (DType::Int, "i32"),
            (DType::Long, "i64"),
            (DType::Float, "f32"),
            (DType::Double, "f64"),
        ] {
            task.measure_type = dtype;
            let result = TestNumOp::execute(&task, &[]).unwrap();
            assert_eq!(vec![Bytes::from(name)], result);
        }
    }
}
