//! This crate provides the dimension store and fragment aggregation engine of a datacube
//! analytics system. A datacube is a large array-valued dataset partitioned into fragments that
//! live on several storage servers, described by dimensions (time, latitude, levels, ...) whose
//! coordinate arrays are stored as binary rows.
//!
//! Reducing a datacube along one of its dimensions involves:
//!
//! * grouping the elements of the dimension, by calendar level for time or by fixed size
//!   otherwise, and recomputing its labels;
//! * planning the output datacube: sizes, nesting levels, fragment shape and grid binding;
//! * aggregating every fragment on its own store, with the fragments split across a group of
//!   workers and, within a worker, across a pool of threads;
//! * committing the output only when every worker succeeded, and rolling back otherwise.
//!
//! The engine is built on top of a number of open source components.
//!
//! * [sled] stores the binary dimension rows.
//! * [rayon] provides the per-worker thread pool.
//! * [ndarray] provides the n-dimensional arrays used in block aggregation.
//! * [Serde](serde) and [validator] deserialise and validate reduction requests.
//! * [tracing] provides structured logging.

pub mod aggregation;
pub mod array;
pub mod calendar;
pub mod catalog;
pub mod cli;
pub mod comm;
pub mod compression;
pub mod dimension_store;
pub mod error;
pub mod fragment_store;
pub mod grid;
pub mod hierarchy;
pub mod models;
pub mod operation;
pub mod operations;
pub mod partition;
pub mod payload;
pub mod reduce;
pub mod reducer;
pub mod relation;
pub mod subset;
pub mod synthetic;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod types;
