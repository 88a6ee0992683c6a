//! Even partitioning of fragments across workers and threads.

/// Returns the `(offset, count)` of the share of `total` items owned by part `rank` of `parts`.
///
/// Every part gets `total / parts` items and the first `total % parts` parts get one more, so the
/// shares are contiguous, disjoint and cover `0..total`. With no parts, nothing is assigned.
pub fn split_evenly(total: u64, parts: u64, rank: u64) -> (u64, u64) {
    if parts == 0 || rank >= parts {
        return (0, 0);
    }
    let base = total / parts;
    let remainder = total % parts;
    if rank < remainder {
        (rank * (base + 1), base + 1)
    } else {
        (remainder * (base + 1) + (rank - remainder) * base, base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_remainder() {
        let shares: Vec<(u64, u64)> = (0..4).map(|rank| split_evenly(10, 4, rank)).collect();
        assert_eq!(vec![(0, 3), (3, 3), (6, 2), (8, 2)], shares);
    }

    #[test]
    fn fewer_items_than_parts() {
        let shares: Vec<(u64, u64)> = (0..4).map(|rank| split_evenly(2, 4, rank)).collect();
        assert_eq!(vec![(0, 1), (1, 1), (2, 0), (2, 0)], shares);
    }

    #[test]
    fn no_parts() {
        assert_eq!((0, 0), split_evenly(5, 0, 0));
        assert_eq!((0, 0), split_evenly(5, 2, 2));
    }

    #[test]
    fn every_item_assigned_once() {
        for total in 0..40 {
            for parts in 1..9 {
                let mut owner = vec![0; total as usize];
                for rank in 0..parts {
                    let (offset, count) = split_evenly(total, parts, rank);
                    assert!(count == total / parts || count == total / parts + 1);
                    for item in offset..offset + count {
                        owner[item as usize] += 1;
                    }
                }
                assert!(owner.iter().all(|n| *n == 1), "{} over {}", total, parts);
            }
        }
    }
}
