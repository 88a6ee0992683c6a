use crate::models::*;
use crate::types::Missing;

use bytes::Bytes;
use zerocopy::AsBytes;

/// Every supported measure and dimension type.
pub(crate) const ALL_DTYPES: [DType; 6] = [
    DType::Byte,
    DType::Short,
    DType::Int,
    DType::Long,
    DType::Float,
    DType::Double,
];

/// Create a ReduceRequest object with only required fields set.
pub(crate) fn get_test_reduce_request() -> ReduceRequest {
    ReduceRequest::new(1, BlockOperation::Sum)
}

/// Create a ReduceRequest object with all fields set that a temporal reduction accepts.
pub(crate) fn get_test_reduce_request_optional() -> ReduceRequest {
    ReduceRequest {
        datacube_id: 1,
        dimension: Some("time".to_string()),
        concept_level: 'd',
        operation: BlockOperation::Avg,
        missing: Some(Missing::MissingValue((-999).into())),
        midnight: MidnightPolicy::FoldForward,
        group_size: None,
        grid: Some("daily".to_string()),
        description: Some("daily mean".to_string()),
    }
}

/// Create a BlockTask summing rows of two ints in groups of two.
pub(crate) fn get_test_block_task() -> BlockTask {
    BlockTask {
        operation: BlockOperation::Sum,
        measure_type: DType::Int,
        missing: None,
        block_size: 1,
        group_counts: vec![2, 2],
        array_length: 2,
        compressed: false,
    }
}

/// Create a Datacube of four fragments of four rows of two ints.
pub(crate) fn get_test_datacube() -> Datacube {
    Datacube {
        id: 0,
        container_id: 1,
        measure: "measure".to_string(),
        measure_type: DType::Int,
        compressed: false,
        tuplexfragment: 4,
        array_length: 2,
        frag_ids: FragmentIds::range(1, 4),
        level: 0,
        source_id: None,
        description: None,
    }
}

/// Create a DimensionInstance of `size` elements.
pub(crate) fn get_test_instance(size: u64) -> DimensionInstance {
    DimensionInstance {
        id: 0,
        dimension_id: 1,
        size,
        concept_level: 'c',
        index_row_id: 1,
        label_row_id: 2,
        compressed: false,
        grid_id: None,
    }
}

/// Create fragment `index` of a datacube from [get_test_datacube].
pub(crate) fn get_test_fragment(datacube_id: u64, index: u64) -> Fragment {
    Fragment {
        datacube_id,
        relative_index: index,
        name: format!("fragment_{}", index),
        key_start: (index - 1) * 4 + 1,
        key_end: index * 4,
        db: DbInstance {
            server: "s1".to_string(),
            database: "db1".to_string(),
        },
    }
}

/// Encodes rows of two ints.
pub(crate) fn int_rows(rows: &[[i32; 2]]) -> Vec<Bytes> {
    rows.iter()
        .map(|row| Bytes::copy_from_slice(row.as_bytes()))
        .collect()
}
