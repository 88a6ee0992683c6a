//! Subset expressions selecting positions of a stored array.
//!
//! A subset is a comma separated list of 1-based inclusive terms, each either a single index
//! (`7`), a range (`1:4`) or a strided range (`10:2:20`).

use std::fmt;
use std::str::FromStr;

use crate::array::DimensionArray;
use crate::error::CubeError;

/// One `start:stride:end` term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Term {
    start: u64,
    stride: u64,
    end: u64,
}

/// A list of positions to extract from an array, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subset {
    terms: Vec<Term>,
}

impl Subset {
    /// Selects the positions listed in an index array.
    pub fn from_index_array(indices: &DimensionArray) -> Result<Self, CubeError> {
        let terms = (0..indices.len())
            .map(|i| match indices.get_i64(i) {
                Some(index) if index >= 1 => Ok(Term {
                    start: index as u64,
                    stride: 1,
                    end: index as u64,
                }),
                _ => Err(CubeError::SubsetSyntax {
                    subset: format!("index array element {}", i + 1),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { terms })
    }

    /// Returns the selected 0-based positions, checking them against an array of `count` elements.
    pub fn positions(&self, count: usize) -> Result<Vec<usize>, CubeError> {
        let mut positions = vec![];
        for term in &self.terms {
            if term.end as usize > count {
                return Err(CubeError::SubsetOutOfDomain {
                    subset: self.to_string(),
                    count,
                });
            }
            positions.extend(
                (term.start..=term.end)
                    .step_by(term.stride as usize)
                    .map(|i| (i - 1) as usize),
            );
        }
        Ok(positions)
    }
}

impl FromStr for Subset {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let syntax = || CubeError::SubsetSyntax {
            subset: s.to_string(),
        };
        let mut terms = vec![];
        for part in s.split(',') {
            let numbers = part
                .split(':')
                .map(|n| n.trim().parse::<u64>().map_err(|_| syntax()))
                .collect::<Result<Vec<_>, _>>()?;
            let term = match numbers[..] {
                [index] => Term {
                    start: index,
                    stride: 1,
                    end: index,
                },
                [start, end] => Term {
                    start,
                    stride: 1,
                    end,
                },
                [start, stride, end] => Term { start, stride, end },
                _ => return Err(syntax()),
            };
            if term.start == 0 || term.stride == 0 || term.start > term.end {
                return Err(syntax());
            }
            terms.push(term);
        }
        Ok(Self { terms })
    }
}

impl fmt::Display for Subset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .terms
            .iter()
            .map(|t| match (t.start == t.end, t.stride) {
                (true, _) => t.start.to_string(),
                (false, 1) => format!("{}:{}", t.start, t.end),
                (false, stride) => format!("{}:{}:{}", t.start, stride, t.end),
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_terms() {
        let subset: Subset = "1:3,7,10:2:14".parse().unwrap();
        assert_eq!(
            vec![0, 1, 2, 6, 9, 11, 13],
            subset.positions(14).unwrap()
        );
        assert_eq!("1:3,7,10:2:14", subset.to_string());
    }

    #[test]
    fn out_of_domain() {
        let err = "1:5".parse::<Subset>().unwrap().positions(4).unwrap_err();
        assert_eq!(err.to_string(), "subset 1:5 is out of the index domain 1..=4");
    }

    #[test]
    fn zero_is_not_an_index() {
        let err = "0:3".parse::<Subset>().unwrap_err();
        assert_eq!(err.to_string(), "invalid subset expression 0:3");
    }

    #[test]
    fn too_many_fields() {
        let err = "1:2:3:4".parse::<Subset>().unwrap_err();
        assert_eq!(err.to_string(), "invalid subset expression 1:2:3:4");
    }

    #[test]
    fn from_index_array() {
        let indices = DimensionArray::Long(vec![4, 2, 9]);
        let subset = Subset::from_index_array(&indices).unwrap();
        assert_eq!(vec![3, 1, 8], subset.positions(9).unwrap());
    }
}
