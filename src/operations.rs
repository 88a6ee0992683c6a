//! Block aggregation operations.
//!
//! Each operation is implemented as a struct that implements the
//! [Operation](crate::operation::Operation) trait. An operation reduces the rows of one source
//! fragment into the rows of the matching output fragment.

use std::cmp::Ordering;

use crate::array;
use crate::compression;
use crate::error::CubeError;
use crate::models::{BlockOperation, BlockTask};
use crate::operation::{Element, NumOperation, Operation};
use crate::types::Missing;

use bytes::Bytes;
use ndarray::{Array2, Axis};
// Bring trait into scope to use as_bytes method.
use zerocopy::AsBytes;

/// Decodes the rows of a fragment into a 2D array with one array row per stored row.
///
/// # Arguments
///
/// * `task`: Sizing of the aggregation
/// * `rows`: Stored rows, possibly compressed
fn build_array<T: Element>(task: &BlockTask, rows: &[Bytes]) -> Result<Array2<T>, CubeError> {
    let length = usize::try_from(task.array_length)?;
    let mut values = vec![];
    values.try_reserve_exact(rows.len() * length)?;
    for row in rows {
        let data = compression::decode(row, task.compressed)?;
        values.extend(array::from_bytes::<T>(&data)?);
    }
    Ok(Array2::from_shape_vec((rows.len(), length), values)?)
}

/// Returns, for each output row of a slab, the positions of the slab rows it merges.
///
/// Output row `g * block_size + b` merges rows `(start + j) * block_size + b` for every `j` below
/// the count of group `g`, where `start` is the number of elements in the preceding groups.
fn block_selections(task: &BlockTask) -> Result<Vec<Vec<usize>>, CubeError> {
    let block = usize::try_from(task.block_size)?;
    let mut selections = vec![];
    let mut start = 0;
    for count in &task.group_counts {
        let count = usize::try_from(*count)?;
        for b in 0..block {
            selections.push((start..start + count).map(|j| j * block + b).collect());
        }
        start += count;
    }
    Ok(selections)
}

/// Folds each block of a fragment, ignoring missing data.
///
/// `fold` accumulates one valid element. `finish` converts an accumulator and its count of valid
/// elements into the output element; it also receives the value written for groups with no valid
/// element.
fn reduce_blocks<T, A, O, F, G>(
    task: &BlockTask,
    rows: &[Bytes],
    init: A,
    fold: F,
    finish: G,
) -> Result<Vec<Bytes>, CubeError>
where
    T: Element,
    A: Clone,
    O: Element,
    F: Fn(&A, &T) -> A,
    G: Fn(&A, i64, T) -> O,
{
    let slab = usize::try_from(task.input_slab())?;
    if slab == 0 || rows.len() % slab != 0 {
        return Err(CubeError::NotDivisible {
            tuplexfragment: rows.len() as u64,
            divisor: task.input_slab(),
        });
    }
    let missing = task
        .missing
        .as_ref()
        .map(Missing::<T>::try_from)
        .transpose()?;
    let fill = missing
        .as_ref()
        .and_then(Missing::fill_value)
        .unwrap_or_else(T::zero);

    let array = build_array::<T>(task, rows)?;
    let selections = block_selections(task)?;
    let mut output = vec![];
    output.try_reserve_exact(rows.len() / slab * selections.len())?;
    for slab_rows in array.axis_chunks_iter(Axis(0), slab) {
        for selection in &selections {
            let block = slab_rows.select(Axis(0), selection);
            let result = block.fold_axis(Axis(0), (init.clone(), 0_i64), |(acc, count), val| {
                match &missing {
                    Some(missing) if missing.is_missing(val) => (acc.clone(), *count),
                    _ => (fold(acc, val), count + 1),
                }
            });
            let values = result
                .iter()
                .map(|(acc, count)| finish(acc, *count, fill))
                .collect::<Vec<O>>();
            output.push(compression::encode(values.as_bytes(), task.compressed)?);
        }
    }
    Ok(output)
}

/// Keeps the running extreme in the direction `wanted`.
///
/// Unordered values (NaN) never replace an ordered one.
fn extreme<T: Element>(acc: &Option<T>, val: &T, wanted: Ordering) -> Option<T> {
    match acc {
        None => Some(*val),
        Some(current) => match val.partial_cmp(current) {
            Some(order) if order == wanted => Some(*val),
            None if current.partial_cmp(current).is_none() => Some(*val),
            _ => Some(*current),
        },
    }
}

/// Run the block aggregation selected by `task.operation`.
pub fn execute(task: &BlockTask, rows: &[Bytes]) -> Result<Vec<Bytes>, CubeError> {
    match task.operation {
        BlockOperation::Sum => Sum::execute(task, rows),
        BlockOperation::Avg => Avg::execute(task, rows),
        BlockOperation::Max => Max::execute(task, rows),
        BlockOperation::Min => Min::execute(task, rows),
        BlockOperation::Count => Count::execute(task, rows),
    }
}

/// Return the sum of the valid elements of each block.
pub struct Sum {}

impl NumOperation for Sum {
    fn execute_t<T: Element>(task: &BlockTask, rows: &[Bytes]) -> Result<Vec<Bytes>, CubeError> {
        reduce_blocks::<T, _, T, _, _>(
            task,
            rows,
            T::zero(),
            |sum, val| *sum + *val,
            |sum, count, fill| if count == 0 { fill } else { *sum },
        )
    }
}

/// Return the mean of the valid elements of each block.
///
/// Integer means are truncated towards zero.
pub struct Avg {}

impl NumOperation for Avg {
    fn execute_t<T: Element>(task: &BlockTask, rows: &[Bytes]) -> Result<Vec<Bytes>, CubeError> {
        reduce_blocks::<T, _, T, _, _>(
            task,
            rows,
            0.0_f64,
            |sum, val| sum + val.to_f64().unwrap_or(f64::NAN),
            |sum, count, fill| {
                if count == 0 {
                    fill
                } else {
                    T::from_f64(sum / count as f64).unwrap_or(fill)
                }
            },
        )
    }
}

/// Return the maximum of the valid elements of each block.
pub struct Max {}

impl NumOperation for Max {
    fn execute_t<T: Element>(task: &BlockTask, rows: &[Bytes]) -> Result<Vec<Bytes>, CubeError> {
        reduce_blocks::<T, _, T, _, _>(
            task,
            rows,
            None,
            |max, val| extreme(max, val, Ordering::Greater),
            |max, _, fill| max.unwrap_or(fill),
        )
    }
}

/// Return the minimum of the valid elements of each block.
pub struct Min {}

impl NumOperation for Min {
    fn execute_t<T: Element>(task: &BlockTask, rows: &[Bytes]) -> Result<Vec<Bytes>, CubeError> {
        reduce_blocks::<T, _, T, _, _>(
            task,
            rows,
            None,
            |min, val| extreme(min, val, Ordering::Less),
            |min, _, fill| min.unwrap_or(fill),
        )
    }
}

/// Return the number of valid elements of each block.
///
/// Counts are always `long`, whatever the input measure type.
pub struct Count {}

impl NumOperation for Count {
    fn execute_t<T: Element>(task: &BlockTask, rows: &[Bytes]) -> Result<Vec<Bytes>, CubeError> {
        reduce_blocks::<T, _, i64, _, _>(task, rows, (), |_, _| (), |_, count, _| count)
    }
}
