//! Concept levels and the hierarchies linking them.
//!
//! A concept level is a single character naming a rung of a dimension's reduction hierarchy. A
//! hierarchy lists the steps from one level to a coarser one and the block operations allowed
//! for each step. Multi-step reductions are allowed when a chain of steps exists; the operations
//! available are those allowed by every step of the chain.

use std::collections::VecDeque;

use crate::error::CubeError;
use crate::models::BlockOperation;

pub const SECOND: char = 's';
pub const MINUTE: char = 'n';
pub const HOUR: char = 'h';
pub const THREE_HOURS: char = '3';
pub const SIX_HOURS: char = '6';
pub const DAY: char = 'd';
pub const WEEK: char = 'w';
pub const MONTH: char = 'M';
pub const QUARTER: char = 'q';
pub const YEAR: char = 'y';
/// Full collapse of the dimension
pub const ALL: char = 'A';
/// Level of dimensions that are not part of a concept hierarchy
pub const NOT_APPLICABLE: char = 'c';

/// Time levels, finest first.
const TIME_LEVELS: [char; 11] = [
    SECOND,
    MINUTE,
    HOUR,
    THREE_HOURS,
    SIX_HOURS,
    DAY,
    WEEK,
    MONTH,
    QUARTER,
    YEAR,
    ALL,
];

const ALL_OPERATIONS: [BlockOperation; 5] = [
    BlockOperation::Sum,
    BlockOperation::Avg,
    BlockOperation::Max,
    BlockOperation::Min,
    BlockOperation::Count,
];

/// Whether `level` names a concept level.
pub fn is_known_level(level: char) -> bool {
    level == NOT_APPLICABLE || TIME_LEVELS.contains(&level)
}

/// Position of a time level in the finest-first ordering.
pub fn time_rank(level: char) -> Option<usize> {
    TIME_LEVELS.iter().position(|l| *l == level)
}

/// Whether the midnight policy applies when grouping at `level`.
///
/// Only day and coarser groupings care which day a midnight timestamp belongs to.
pub fn folds_midnight(level: char) -> bool {
    match (time_rank(level), time_rank(DAY)) {
        (Some(rank), Some(day)) => rank >= day,
        _ => false,
    }
}

/// One allowed reduction between two levels.
#[derive(Clone, Debug, PartialEq)]
pub struct HierarchyStep {
    pub from: char,
    pub to: char,
    pub operations: Vec<BlockOperation>,
}

impl HierarchyStep {
    /// Returns a step allowing every block operation.
    pub fn new(from: char, to: char) -> Self {
        Self {
            from,
            to,
            operations: ALL_OPERATIONS.to_vec(),
        }
    }
}

/// A named set of concept levels and the steps between them.
#[derive(Clone, Debug, PartialEq)]
pub struct Hierarchy {
    pub id: u64,
    pub name: String,
    pub steps: Vec<HierarchyStep>,
}

impl Hierarchy {
    /// The calendar hierarchy of time dimensions.
    pub fn time(id: u64) -> Self {
        let mut steps = vec![
            HierarchyStep::new(SECOND, MINUTE),
            HierarchyStep::new(MINUTE, HOUR),
            HierarchyStep::new(HOUR, THREE_HOURS),
            HierarchyStep::new(THREE_HOURS, SIX_HOURS),
            HierarchyStep::new(SIX_HOURS, DAY),
            HierarchyStep::new(DAY, WEEK),
            HierarchyStep::new(DAY, MONTH),
            HierarchyStep::new(MONTH, QUARTER),
            HierarchyStep::new(QUARTER, YEAR),
        ];
        steps.extend(
            TIME_LEVELS
                .iter()
                .filter(|level| **level != ALL)
                .map(|level| HierarchyStep::new(*level, ALL)),
        );
        Self {
            id,
            name: "time".to_string(),
            steps,
        }
    }

    /// The hierarchy of dimensions without concept levels.
    ///
    /// Such dimensions may be regrouped by size or collapsed.
    pub fn base(id: u64) -> Self {
        Self {
            id,
            name: "base".to_string(),
            steps: vec![
                HierarchyStep::new(NOT_APPLICABLE, NOT_APPLICABLE),
                HierarchyStep::new(NOT_APPLICABLE, ALL),
            ],
        }
    }

    /// Whether the hierarchy reduces time dimensions.
    pub fn is_temporal(&self) -> bool {
        self.steps.iter().any(|step| step.from != NOT_APPLICABLE)
    }

    /// Returns the operations available to reduce from level `from` to level `to`.
    ///
    /// An empty list means no chain of steps leads from `from` to `to`.
    pub fn available_reduction_ops(&self, from: char, to: char) -> Vec<BlockOperation> {
        let mut available: Vec<BlockOperation> = vec![];
        let mut queue = VecDeque::new();
        queue.push_back((from, ALL_OPERATIONS.to_vec(), 0_usize));
        while let Some((level, operations, depth)) = queue.pop_front() {
            // Chains never revisit a level, so they are no longer than the step list.
            if depth >= self.steps.len() {
                continue;
            }
            for step in self.steps.iter().filter(|step| step.from == level) {
                let allowed: Vec<BlockOperation> = operations
                    .iter()
                    .copied()
                    .filter(|op| step.operations.contains(op))
                    .collect();
                if step.to == to {
                    for op in &allowed {
                        if !available.contains(op) {
                            available.push(*op);
                        }
                    }
                } else if step.to != step.from && !allowed.is_empty() {
                    queue.push_back((step.to, allowed, depth + 1));
                }
            }
        }
        available
    }

    /// Checks that `operation` may reduce level `from` to level `to`.
    pub fn check_reduction(
        &self,
        from: char,
        to: char,
        operation: BlockOperation,
    ) -> Result<(), CubeError> {
        if !self.steps.iter().any(|step| step.to == to) {
            return Err(CubeError::HierarchyStepUnavailable { from, to });
        }
        let available = self.available_reduction_ops(from, to);
        if available.is_empty() {
            if self.available_chain_exists(from, to) {
                return Err(CubeError::OperationUnavailable {
                    operation: operation.to_string(),
                    from,
                    to,
                });
            }
            return Err(CubeError::HierarchyStepUnavailable { from, to });
        }
        if !available.contains(&operation) {
            return Err(CubeError::OperationUnavailable {
                operation: operation.to_string(),
                from,
                to,
            });
        }
        Ok(())
    }

    /// Whether any chain of steps leads from `from` to `to`, whatever its operations.
    fn available_chain_exists(&self, from: char, to: char) -> bool {
        let mut visited = vec![from];
        let mut queue = VecDeque::from([from]);
        while let Some(level) = queue.pop_front() {
            for step in self.steps.iter().filter(|step| step.from == level) {
                if step.to == to {
                    return true;
                }
                if !visited.contains(&step.to) {
                    visited.push(step.to);
                    queue.push_back(step.to);
                }
            }
        }
        false
    }
}
