//! Data model of containers, datacubes, dimensions and fragments.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::Display;
use validator::{Validate, ValidationError};

use crate::calendar::CalendarDescriptor;
use crate::error::CubeError;
use crate::hierarchy;
use crate::types::{DValue, Missing};

/// Supported element types of dimension arrays and measures
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    /// [i8]
    Byte,
    /// [i16]
    Short,
    /// [i32]
    Int,
    /// [i64]
    Long,
    /// [f32]
    Float,
    /// [f64]
    Double,
}

impl DType {
    /// Returns the size of the associated type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Byte => std::mem::size_of::<i8>(),
            Self::Short => std::mem::size_of::<i16>(),
            Self::Int => std::mem::size_of::<i32>(),
            Self::Long => std::mem::size_of::<i64>(),
            Self::Float => std::mem::size_of::<f32>(),
            Self::Double => std::mem::size_of::<f64>(),
        }
    }

    /// Returns a compact numeric tag used on the wire.
    pub fn tag(self) -> u8 {
        match self {
            Self::Byte => 1,
            Self::Short => 2,
            Self::Int => 3,
            Self::Long => 4,
            Self::Float => 5,
            Self::Double => 6,
        }
    }

    /// Inverse of [DType::tag].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Byte),
            2 => Some(Self::Short),
            3 => Some(Self::Int),
            4 => Some(Self::Long),
            5 => Some(Self::Float),
            6 => Some(Self::Double),
            _ => None,
        }
    }
}

impl FromStr for DType {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "byte" => Ok(Self::Byte),
            "short" => Ok(Self::Short),
            "int" => Ok(Self::Int),
            "long" => Ok(Self::Long),
            "float" => Ok(Self::Float),
            "double" => Ok(Self::Double),
            _ => Err(CubeError::UnsupportedDataType {
                type_name: s.to_string(),
            }),
        }
    }
}

/// Maps an element type tag to its width in bytes.
pub fn check_data_type(type_name: &str) -> Result<usize, CubeError> {
    Ok(type_name.parse::<DType>()?.size_of())
}

/// Static definition of one coordinate axis of a container.
#[derive(Clone, Debug, PartialEq)]
pub struct Dimension {
    pub id: u64,
    pub container_id: u64,
    pub name: String,
    pub dtype: DType,
    /// Hierarchy the concept levels of this dimension belong to
    pub hierarchy_id: u64,
    /// Present when the axis is temporal
    pub calendar: Option<CalendarDescriptor>,
}

/// Realisation of a [Dimension] for one datacube.
#[derive(Clone, Debug, PartialEq)]
pub struct DimensionInstance {
    pub id: u64,
    pub dimension_id: u64,
    /// Element count; 0 means fully reduced
    pub size: u64,
    pub concept_level: char,
    pub index_row_id: u64,
    pub label_row_id: u64,
    /// Whether the index and label rows are stored compressed
    pub compressed: bool,
    pub grid_id: Option<u64>,
}

/// One (dimension instance, explicit, level) relation of a datacube.
#[derive(Clone, Debug, PartialEq)]
pub struct CubeHasDim {
    pub datacube_id: u64,
    pub instance_id: u64,
    pub explicit: bool,
    /// Nesting order, 1 is outermost; 0 for a fully reduced axis
    pub level: u32,
    pub size: u64,
}

/// Set of fragment relative indices, e.g. `1-4,7`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragmentIds {
    /// Sorted, non-overlapping inclusive ranges
    ranges: Vec<(u64, u64)>,
}

impl FragmentIds {
    /// Returns the contiguous set `first..=last`.
    pub fn range(first: u64, last: u64) -> Self {
        if first > last {
            return Self::default();
        }
        Self {
            ranges: vec![(first, last)],
        }
    }

    /// Returns the number of fragments in the set.
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(|(a, b)| b - a + 1).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates over the relative indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|(a, b)| *a..=*b)
    }

    /// Returns the subset made of `count` indices starting at position `offset` of the set.
    pub fn slice(&self, offset: u64, count: u64) -> Self {
        let mut ranges = vec![];
        let mut skip = offset;
        let mut left = count;
        for &(first, last) in &self.ranges {
            if left == 0 {
                break;
            }
            let size = last - first + 1;
            if skip >= size {
                skip -= size;
                continue;
            }
            let start = first + skip;
            let taken = (last - start + 1).min(left);
            ranges.push((start, start + taken - 1));
            left -= taken;
            skip = 0;
        }
        Self { ranges }
    }

    /// Sorts `ranges` and merges the ones that overlap or touch.
    fn from_ranges(mut ranges: Vec<(u64, u64)>) -> Self {
        ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for (first, last) in ranges {
            match merged.last_mut() {
                Some((_, end)) if first <= end.saturating_add(1) => *end = (*end).max(last),
                _ => merged.push((first, last)),
            }
        }
        Self { ranges: merged }
    }
}

impl FromStr for FragmentIds {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let syntax = || CubeError::BadParameter {
            message: format!("invalid fragment id set {}", s),
        };
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut ranges = vec![];
        for part in s.split(',') {
            let (first, last) = match part.split_once('-') {
                Some((a, b)) => (a.trim(), b.trim()),
                None => (part.trim(), part.trim()),
            };
            let first: u64 = first.parse().map_err(|_| syntax())?;
            let last: u64 = last.parse().map_err(|_| syntax())?;
            if first == 0 || first > last {
                return Err(syntax());
            }
            ranges.push((first, last));
        }
        Ok(Self::from_ranges(ranges))
    }
}

impl fmt::Display for FragmentIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|(a, b)| {
                if a == b {
                    a.to_string()
                } else {
                    format!("{}-{}", a, b)
                }
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// A versioned multidimensional array dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct Datacube {
    pub id: u64,
    pub container_id: u64,
    pub measure: String,
    pub measure_type: DType,
    pub compressed: bool,
    /// Rows stored in each fragment
    pub tuplexfragment: u64,
    /// Elements packed in each row (product of implicit dimension sizes)
    pub array_length: u64,
    pub frag_ids: FragmentIds,
    pub level: u32,
    pub source_id: Option<u64>,
    pub description: Option<String>,
}

/// Physical database holding fragments.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DbInstance {
    pub server: String,
    pub database: String,
}

/// A physical, contiguously keyed partition of a datacube's rows.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    pub datacube_id: u64,
    pub relative_index: u64,
    pub name: String,
    /// Inclusive, 1-based
    pub key_start: u64,
    /// Inclusive
    pub key_end: u64,
    pub db: DbInstance,
}

/// A named, validated set of dimension instances shared by several datacubes.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
    pub id: u64,
    pub container_id: u64,
    pub name: String,
    pub instance_ids: Vec<u64>,
}

/// Block reduction operations
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BlockOperation {
    Sum,
    Avg,
    Max,
    Min,
    Count,
}

impl BlockOperation {
    /// Returns the measure type produced by this operation.
    pub fn output_type(self, input: DType) -> DType {
        match self {
            Self::Count => DType::Long,
            _ => input,
        }
    }
}

/// Parameters of a block aggregation, shared by every fragment of one reduction.
///
/// Rows of a fragment are laid out as whole slabs of `sum(group_counts) * block_size` rows. Each
/// output slab holds `group_counts.len() * block_size` rows.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockTask {
    pub operation: BlockOperation,
    /// Measure type of the input rows
    pub measure_type: DType,
    pub missing: Option<Missing<DValue>>,
    /// Rows nested inside the reduced axis
    pub block_size: u64,
    /// Elements of the reduced axis merged into each output element
    pub group_counts: Vec<u64>,
    /// Elements in each row
    pub array_length: u64,
    pub compressed: bool,
}

impl BlockTask {
    /// Returns the measure type of the output rows.
    pub fn output_type(&self) -> DType {
        self.operation.output_type(self.measure_type)
    }

    /// Returns the number of input rows in one slab.
    pub fn input_slab(&self) -> u64 {
        self.group_counts.iter().sum::<u64>() * self.block_size
    }

    /// Returns the number of output rows in one slab.
    pub fn output_slab(&self) -> u64 {
        self.group_counts.len() as u64 * self.block_size
    }

    /// Returns the number of output rows produced from `rows` input rows.
    pub fn output_rows(&self, rows: u64) -> u64 {
        match self.input_slab() {
            0 => 0,
            slab => rows / slab * self.output_slab(),
        }
    }
}

/// Whether a timestamp at exactly midnight closes the previous day or opens the next one.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum MidnightPolicy {
    /// Midnight belongs to the next day's group
    #[serde(rename = "00")]
    FoldForward,
    /// Midnight belongs to the previous day's group
    #[default]
    #[serde(rename = "24")]
    FoldBackward,
}

fn default_concept_level() -> char {
    hierarchy::ALL
}

/// Request to reduce one explicit dimension of a datacube
#[derive(Clone, Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_reduce_request"))]
pub struct ReduceRequest {
    /// Input datacube
    pub datacube_id: u64,
    /// Dimension to reduce; the innermost sized explicit dimension when omitted
    #[validate(length(min = 1, message = "dimension must not be empty"))]
    pub dimension: Option<String>,
    /// Target concept level, `A` collapses the dimension entirely
    #[serde(default = "default_concept_level")]
    pub concept_level: char,
    /// Reduction applied to the measure
    pub operation: BlockOperation,
    /// Missing data descriptor of the measure
    pub missing: Option<Missing<DValue>>,
    /// Grouping of midnight timestamps
    #[serde(default)]
    pub midnight: MidnightPolicy,
    /// Elements per group when reducing a non-temporal dimension
    #[validate(range(min = 1, message = "group size must be greater than 0"))]
    pub group_size: Option<u64>,
    /// Grid the output dimensions are bound to
    #[validate(length(min = 1, message = "grid must not be empty"))]
    pub grid: Option<String>,
    /// Free text stored with the output datacube
    pub description: Option<String>,
}

impl ReduceRequest {
    /// Returns a request collapsing `dimension` entirely.
    pub fn new(datacube_id: u64, operation: BlockOperation) -> Self {
        Self {
            datacube_id,
            dimension: None,
            concept_level: hierarchy::ALL,
            operation,
            missing: None,
            midnight: MidnightPolicy::default(),
            group_size: None,
            grid: None,
            description: None,
        }
    }

    /// Whether the request collapses the dimension entirely.
    pub fn is_full_collapse(&self) -> bool {
        self.concept_level == hierarchy::ALL
    }
}

/// Validate request data
fn validate_reduce_request(request: &ReduceRequest) -> Result<(), ValidationError> {
    if !hierarchy::is_known_level(request.concept_level) {
        let mut error = ValidationError::new("Unknown concept level");
        error.add_param("concept_level".into(), &request.concept_level.to_string());
        return Err(error);
    }
    if request.group_size.is_some() && request.is_full_collapse() {
        return Err(ValidationError::new(
            "Group size requires a partial reduction",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use serde_test::{assert_de_tokens, assert_de_tokens_error, Token};

    #[test]
    fn test_check_data_type() {
        assert_eq!(1, check_data_type("byte").unwrap());
        assert_eq!(2, check_data_type("SHORT").unwrap());
        assert_eq!(4, check_data_type("int").unwrap());
        assert_eq!(8, check_data_type("long").unwrap());
        assert_eq!(4, check_data_type("float").unwrap());
        assert_eq!(8, check_data_type("double").unwrap());
    }

    #[test]
    fn test_check_data_type_unknown() {
        let err = check_data_type("complex").unwrap_err();
        assert_eq!(err.to_string(), "unsupported data type complex");
    }

    #[test]
    fn test_dtype_tag() {
        for dtype in test_utils::ALL_DTYPES {
            assert_eq!(Some(dtype), DType::from_tag(dtype.tag()));
            assert_eq!(dtype, dtype.to_string().parse().unwrap());
        }
        assert_eq!(None, DType::from_tag(0));
    }

    #[test]
    fn test_fragment_ids_parse() {
        let ids: FragmentIds = "1-3,7,5-6".parse().unwrap();
        assert_eq!("1-3,5-7", ids.to_string());
        assert_eq!(6, ids.len());
        assert_eq!(vec![1, 2, 3, 5, 6, 7], ids.iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_fragment_ids_slice() {
        let ids = FragmentIds::range(1, 10);
        assert_eq!("4-6", ids.slice(3, 3).to_string());
        assert!(ids.slice(10, 2).is_empty());
        let ids: FragmentIds = "1-2,5-9".parse().unwrap();
        assert_eq!("2,5-6", ids.slice(1, 3).to_string());
        assert_eq!("9", ids.slice(6, 4).to_string());
    }

    #[test]
    fn test_fragment_ids_overlapping_parts_merge() {
        let ids: FragmentIds = "5-7,1-3,4,6-9,2".parse().unwrap();
        assert_eq!("1-9", ids.to_string());
        assert_eq!(9, ids.len());
    }

    #[test]
    fn test_fragment_ids_large_range_kept_as_range() {
        let ids: FragmentIds = "1-4000000000".parse().unwrap();
        assert_eq!(4_000_000_000, ids.len());
        assert_eq!("1-4000000000", ids.to_string());
        let tail = ids.slice(3_999_999_998, 5);
        assert_eq!("3999999999-4000000000", tail.to_string());
        assert_eq!(vec![3_999_999_999, 4_000_000_000], tail.iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_fragment_ids_zero() {
        let err = "0-3".parse::<FragmentIds>().unwrap_err();
        assert_eq!(err.to_string(), "bad parameter: invalid fragment id set 0-3");
    }

    #[test]
    fn test_block_operation_output_type() {
        assert_eq!(DType::Long, BlockOperation::Count.output_type(DType::Float));
        assert_eq!(DType::Float, BlockOperation::Avg.output_type(DType::Float));
    }

    #[test]
    fn test_required_fields() {
        let request = test_utils::get_test_reduce_request();
        assert_de_tokens(
            &request,
            &[
                Token::Struct {
                    name: "ReduceRequest",
                    len: 2,
                },
                Token::Str("datacube_id"),
                Token::U64(1),
                Token::Str("operation"),
                Token::Enum {
                    name: "BlockOperation",
                },
                Token::Str("sum"),
                Token::Unit,
                Token::StructEnd,
            ],
        );
        request.validate().unwrap()
    }

    #[test]
    fn test_optional_fields() {
        let request = test_utils::get_test_reduce_request_optional();
        assert_de_tokens(
            &request,
            &[
                Token::Struct {
                    name: "ReduceRequest",
                    len: 2,
                },
                Token::Str("datacube_id"),
                Token::U64(1),
                Token::Str("dimension"),
                Token::Some,
                Token::Str("time"),
                Token::Str("concept_level"),
                Token::Char('d'),
                Token::Str("operation"),
                Token::Enum {
                    name: "BlockOperation",
                },
                Token::Str("avg"),
                Token::Unit,
                Token::Str("missing"),
                Token::Some,
                Token::Enum { name: "Missing" },
                Token::Str("missing_value"),
                Token::I64(-999),
                Token::Str("midnight"),
                Token::Enum {
                    name: "MidnightPolicy",
                },
                Token::Str("00"),
                Token::Unit,
                Token::Str("grid"),
                Token::Some,
                Token::Str("daily"),
                Token::Str("description"),
                Token::Some,
                Token::Str("daily mean"),
                Token::StructEnd,
            ],
        );
        request.validate().unwrap()
    }

    #[test]
    fn test_missing_operation() {
        assert_de_tokens_error::<ReduceRequest>(
            &[
                Token::Struct {
                    name: "ReduceRequest",
                    len: 2,
                },
                Token::Str("datacube_id"),
                Token::U64(1),
                Token::StructEnd,
            ],
            "missing field `operation`",
        )
    }

    #[test]
    fn test_invalid_operation() {
        assert_de_tokens_error::<ReduceRequest>(
            &[
                Token::Struct {
                    name: "ReduceRequest",
                    len: 2,
                },
                Token::Str("operation"),
                Token::Enum {
                    name: "BlockOperation",
                },
                Token::Str("median"),
                Token::StructEnd,
            ],
            "unknown variant `median`, expected one of `sum`, `avg`, `max`, `min`, `count`",
        )
    }

    #[test]
    fn test_unknown_field() {
        assert_de_tokens_error::<ReduceRequest>(&[
            Token::Struct { name: "ReduceRequest", len: 2 },
            Token::Str("foo"),
            Token::StructEnd
            ],
            "unknown field `foo`, expected one of `datacube_id`, `dimension`, `concept_level`, `operation`, `missing`, `midnight`, `group_size`, `grid`, `description`"
        )
    }

    #[test]
    #[should_panic(expected = "dimension must not be empty")]
    fn test_invalid_dimension() {
        let mut request = test_utils::get_test_reduce_request();
        request.dimension = Some("".to_string());
        request.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "group size must be greater than 0")]
    fn test_invalid_group_size() {
        let mut request = test_utils::get_test_reduce_request();
        request.concept_level = 'c';
        request.group_size = Some(0);
        request.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "Group size requires a partial reduction")]
    fn test_group_size_with_collapse() {
        let mut request = test_utils::get_test_reduce_request();
        request.group_size = Some(2);
        request.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "Unknown concept level")]
    fn test_unknown_concept_level() {
        let mut request = test_utils::get_test_reduce_request();
        request.concept_level = 'x';
        request.validate().unwrap()
    }

    #[test]
    fn test_json_defaults() {
        let json = r#"{"datacube_id": 1, "operation": "sum"}"#;
        let request = serde_json::from_str::<ReduceRequest>(json).unwrap();
        assert_eq!(request, test_utils::get_test_reduce_request());
        assert_eq!(MidnightPolicy::FoldBackward, request.midnight);
        assert!(request.is_full_collapse());
    }

    #[test]
    fn test_json_optional_fields() {
        let json = r#"{"datacube_id": 1, "dimension": "time", "concept_level": "d", "operation": "avg", "missing": {"missing_value": -999}, "midnight": "00", "grid": "daily", "description": "daily mean"}"#;
        let request = serde_json::from_str::<ReduceRequest>(json).unwrap();
        assert_eq!(request, test_utils::get_test_reduce_request_optional());
    }
}
