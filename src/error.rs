//! Error handling.

use std::error::Error;
use thiserror::Error;
use tracing::{event, Level};
use zune_inflate::errors::InflateDecodeErrors;

use crate::types::DValue;

/// Exit code reported by a worker that completed successfully.
pub const SUCCESS: i32 = 0;

/// Classes of failure.
///
/// Every [CubeError] belongs to exactly one class, and every class has a negative exit code so
/// that the worst outcome among a set of workers is the minimum of their codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// A lifecycle step was invoked out of order
    NullHandle,
    /// Malformed or missing configuration
    BadParameter,
    /// A request field holds an invalid value
    InvalidParam,
    /// Allocation failure
    MemoryError,
    /// Catalog or fragment store access failure
    StorageError,
    /// A logical precondition was violated
    UtilityError,
    /// Stored or supplied data cannot be interpreted
    DataError,
    /// Failure of the local system (threads, integer conversions, collectives)
    SystemError,
}

impl ErrorClass {
    /// Returns the exit code associated with this class.
    pub fn code(self) -> i32 {
        match self {
            Self::NullHandle => -1,
            Self::BadParameter => -2,
            Self::InvalidParam => -3,
            Self::MemoryError => -4,
            Self::StorageError => -5,
            Self::UtilityError => -6,
            Self::DataError => -7,
            Self::SystemError => -8,
        }
    }
}

/// Datacube reduction error type
///
/// This type encapsulates the various errors that may occur.
/// Each variant belongs to one [ErrorClass].
#[derive(Debug, Error)]
pub enum CubeError {
    /// A lifecycle step was invoked before its prerequisite
    #[error("{step} invoked before {prerequisite}")]
    NullHandle {
        step: &'static str,
        prerequisite: &'static str,
    },

    /// Malformed configuration
    #[error("bad parameter: {message}")]
    BadParameter { message: String },

    /// Error deserialising a request
    #[error("request data is not valid")]
    RequestJson(#[from] serde_json::Error),

    /// Error validating a request (single error)
    #[error("request data is not valid")]
    RequestValidationSingle(#[from] validator::ValidationError),

    /// Error validating a request (multiple errors)
    #[error("request data is not valid")]
    RequestValidation(#[from] validator::ValidationErrors),

    /// Incompatible missing data descriptor
    #[error("Incompatible value {0} for missing")]
    IncompatibleMissing(DValue),

    /// Allocation failure
    #[error("unable to allocate memory")]
    Memory(#[from] std::collections::TryReserveError),

    /// Error accessing the dimension store
    #[error("dimension store error")]
    Sled(#[from] sled::Error),

    /// Error appending a row to the dimension store
    #[error("unable to insert row into {table}")]
    DimensionInsert {
        table: String,
        #[source]
        source: sled::Error,
    },

    /// Error reported by the metadata catalog
    #[error("catalog error: {message}")]
    Catalog { message: String },

    /// Error reported by a fragment store
    #[error("fragment store error on {server}: {message}")]
    FragmentStore { server: String, message: String },

    /// Unknown element type tag
    #[error("unsupported data type {type_name}")]
    UnsupportedDataType { type_name: String },

    /// Row does not exist in the dimension store
    #[error("row {id} not found in {table}")]
    RowNotFound { table: String, id: u64 },

    /// Row length does not match its declared element count
    #[error("row holds {actual} bytes, expected {expected}")]
    RowLength { expected: usize, actual: usize },

    /// Error converting from bytes to a type
    #[error("failed to convert from bytes to {type_name}")]
    FromBytes { type_name: &'static str },

    /// Subset selects positions outside of the array
    #[error("subset {subset} is out of the index domain 1..={count}")]
    SubsetOutOfDomain { subset: String, count: usize },

    /// Malformed subset expression
    #[error("invalid subset expression {subset}")]
    SubsetSyntax { subset: String },

    /// Calendar fields cannot be decoded
    #[error("unable to decode calendar fields: {message}")]
    Calendar { message: String },

    /// Error decompressing data
    #[error("failed to decompress data")]
    DecompressionFlate2(#[from] std::io::Error),

    /// Error decompressing data
    #[error("failed to decompress data")]
    DecompressionZune(#[from] InflateDecodeErrors),

    /// Error creating ndarray ArrayView from Shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ndarray::ShapeError),

    /// Broadcast payload cannot be decoded
    #[error("malformed broadcast payload: {message}")]
    Payload { message: String },

    /// Tuple count is not a multiple of the reduction block
    #[error("datacube cannot be aggregated ({tuplexfragment} tuples per fragment is not a multiple of {divisor}); try to merge fragments first")]
    NotDivisible { tuplexfragment: u64, divisor: u64 },

    /// Requested dimension is not part of the datacube
    #[error("dimension {name} not found in datacube")]
    DimensionNotFound { name: String },

    /// Requested dimension cannot be reduced
    #[error("dimension {name} cannot be reduced: {reason}")]
    DimensionNotReducible { name: String, reason: String },

    /// No hierarchy step leads to the requested concept level
    #[error("no available reduction operation from concept level '{from}' to '{to}'")]
    HierarchyStepUnavailable { from: char, to: char },

    /// Operation not allowed for the hierarchy step
    #[error("operation {operation} is not available from concept level '{from}' to '{to}'")]
    OperationUnavailable {
        operation: String,
        from: char,
        to: char,
    },

    /// Grid does not match the datacube's dimensions
    #[error("grid {grid} cannot be used in this context: {reason}")]
    GridMismatch { grid: String, reason: String },

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// Error building the aggregation thread pool
    #[error("unable to build thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Collective operation failed
    #[error("collective {operation} failed: {message}")]
    Collective {
        operation: &'static str,
        message: String,
    },

    /// Another worker failed and the operation was rolled back
    #[error("operation aborted by a remote failure (code {code})")]
    Aborted { code: i32 },
}

impl CubeError {
    /// Returns the class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NullHandle { .. } => ErrorClass::NullHandle,

            Self::BadParameter { .. } | Self::RequestJson(_) => ErrorClass::BadParameter,

            Self::RequestValidationSingle(_)
            | Self::RequestValidation(_)
            | Self::IncompatibleMissing(_) => ErrorClass::InvalidParam,

            Self::Memory(_) => ErrorClass::MemoryError,

            Self::Sled(_) | Self::Catalog { .. } | Self::FragmentStore { .. } => {
                ErrorClass::StorageError
            }

            Self::NotDivisible { .. }
            | Self::DimensionNotFound { .. }
            | Self::DimensionNotReducible { .. }
            | Self::HierarchyStepUnavailable { .. }
            | Self::OperationUnavailable { .. }
            | Self::GridMismatch { .. } => ErrorClass::UtilityError,

            Self::UnsupportedDataType { .. }
            | Self::RowNotFound { .. }
            | Self::RowLength { .. }
            | Self::FromBytes { .. }
            | Self::SubsetOutOfDomain { .. }
            | Self::SubsetSyntax { .. }
            | Self::Calendar { .. }
            | Self::DecompressionFlate2(_)
            | Self::DecompressionZune(_)
            | Self::ShapeInvalid(_)
            | Self::Payload { .. } => ErrorClass::DataError,

            Self::DimensionInsert { .. }
            | Self::TryFromInt(_)
            | Self::ThreadPool(_)
            | Self::Collective { .. }
            | Self::Aborted { .. } => ErrorClass::SystemError,
        }
    }

    /// Returns the exit code reported for this error.
    ///
    /// [CubeError::Aborted] carries the code of the remote failure.
    pub fn code(&self) -> i32 {
        match self {
            Self::Aborted { code } => *code,
            _ => self.class().code(),
        }
    }

    /// Logs the error and its chain of causes.
    pub fn log(&self) {
        event!(Level::ERROR, code = self.code(), "{}", self);
        let mut current = self.source();
        while let Some(source) = current {
            event!(Level::ERROR, "Caused by: {}", source);
            current = source.source();
        }
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CubeError>;
