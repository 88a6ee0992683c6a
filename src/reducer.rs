//! Grouping of the elements of a dimension for a partial reduction.
//!
//! A single forward scan assigns every element to a group. A group is a maximal run of
//! consecutive elements sharing the same key; the first element always opens a group and the last
//! group is closed when the scan ends. Each closed group is represented by the centroid of its
//! labels.

use crate::array::DimensionArray;
use crate::calendar::CalendarDescriptor;
use crate::error::CubeError;
use crate::hierarchy;
use crate::models::MidnightPolicy;

use tracing::debug;

/// Outcome of grouping one dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct Reduction {
    /// Size of the reduced dimension; 0 for a full collapse
    pub new_size: u64,
    /// Number of input elements in each group, in order
    pub group_counts: Vec<u64>,
    /// One centroid label per group, or `None` when the dimension is collapsed
    pub labels: Option<DimensionArray>,
}

impl Reduction {
    /// Full collapse of a dimension of `old_size` elements.
    pub fn collapse(old_size: u64) -> Self {
        Self {
            new_size: 0,
            group_counts: vec![old_size],
            labels: None,
        }
    }
}

enum ScanState<K> {
    AwaitingFirst,
    InGroup { start: usize, key: K },
}

/// Splits `0..len` into runs of equal keys and returns the inclusive bounds of each run.
fn scan_groups<K, F>(len: usize, mut key_of: F) -> Result<Vec<(usize, usize)>, CubeError>
where
    K: PartialEq,
    F: FnMut(usize) -> Result<K, CubeError>,
{
    let mut groups = vec![];
    let mut state = ScanState::AwaitingFirst;
    for index in 0..len {
        let key = key_of(index)?;
        state = match state {
            ScanState::AwaitingFirst => ScanState::InGroup { start: index, key },
            ScanState::InGroup { start, key: current } if current == key => ScanState::InGroup {
                start,
                key: current,
            },
            ScanState::InGroup { start, .. } => {
                groups.push((start, index - 1));
                ScanState::InGroup { start: index, key }
            }
        };
    }
    if let ScanState::InGroup { start, .. } = state {
        groups.push((start, len - 1));
    }
    Ok(groups)
}

/// Replaces each group by its centroid and returns the reduction.
fn close_groups(
    labels: &DimensionArray,
    groups: &[(usize, usize)],
) -> Result<Reduction, CubeError> {
    let mut centroids = labels.clone();
    for (first, last) in groups {
        centroids.update_value(*first, *last)?;
    }
    let starts: Vec<usize> = groups.iter().map(|(first, _)| *first).collect();
    let group_counts: Vec<u64> = groups
        .iter()
        .map(|(first, last)| (last - first + 1) as u64)
        .collect();
    Ok(Reduction {
        new_size: group_counts.len() as u64,
        group_counts,
        labels: Some(centroids.gather(&starts)?),
    })
}

/// Groups the labels of a time dimension by calendar fields at `level`.
///
/// The calendar and the level are checked before scanning.
pub fn reduce_time(
    labels: &DimensionArray,
    calendar: &CalendarDescriptor,
    level: char,
    policy: MidnightPolicy,
) -> Result<Reduction, CubeError> {
    calendar.validate()?;
    if level == hierarchy::ALL || hierarchy::time_rank(level).is_none() {
        return Err(CubeError::Calendar {
            message: format!("concept level '{}' is not a time level", level),
        });
    }
    let groups = scan_groups(labels.len(), |index| {
        let value = labels.get_f64(index).ok_or(CubeError::SubsetOutOfDomain {
            subset: (index + 1).to_string(),
            count: labels.len(),
        })?;
        calendar.decode(value, level, policy)?.group_key(level)
    })?;
    debug!(level = %level, groups = groups.len(), "grouped time dimension");
    close_groups(labels, &groups)
}

/// Groups the elements of a dimension into runs of `group_size` consecutive raw indices.
///
/// `indices` holds the 1-based index of each element; the last group may be smaller.
pub fn reduce_by_size(
    labels: &DimensionArray,
    indices: &DimensionArray,
    group_size: u64,
) -> Result<Reduction, CubeError> {
    if group_size == 0 {
        return Err(CubeError::BadParameter {
            message: "group size must be greater than 0".to_string(),
        });
    }
    if indices.len() != labels.len() {
        return Err(CubeError::SubsetOutOfDomain {
            subset: format!("1:{}", indices.len()),
            count: labels.len(),
        });
    }
    let group_size = i64::try_from(group_size)?;
    let groups = scan_groups(labels.len(), |index| match indices.get_i64(index) {
        Some(raw) if raw >= 1 => Ok((raw - 1) / group_size),
        _ => Err(CubeError::SubsetSyntax {
            subset: format!("index array element {}", index + 1),
        }),
    })?;
    close_groups(labels, &groups)
}
