//! Collective operations between the workers of a reduction.
//!
//! Workers exchange two kinds of messages: a payload broadcast from one worker to all, and an
//! integer reduced across all workers to the worst outcome. Every worker must take part in every
//! collective, in the same order.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::CubeError;

use bytes::Bytes;
use strum_macros::Display;

/// Reduction applied by [Communicator::all_reduce].
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum ReduceOp {
    Min,
    Max,
}

impl ReduceOp {
    fn apply(self, values: &[i64]) -> Option<i64> {
        match self {
            Self::Min => values.iter().copied().min(),
            Self::Max => values.iter().copied().max(),
        }
    }
}

/// Communicator trait.
///
/// Implementations connect a fixed set of workers numbered `0..size`.
pub trait Communicator: Send + Sync {
    /// Rank of this worker.
    fn rank(&self) -> u64;

    /// Number of workers.
    fn size(&self) -> u64;

    /// Sends `payload` from worker `root` to every worker and returns it.
    ///
    /// Only the root's payload is used; the root must supply one.
    fn broadcast(&self, root: u64, payload: Option<Bytes>) -> Result<Bytes, CubeError>;

    /// Combines `value` across every worker with `op` and returns the result to all.
    fn all_reduce(&self, value: i64, op: ReduceOp) -> Result<i64, CubeError>;
}

struct Shared {
    barrier: Barrier,
    payload: Mutex<Option<Bytes>>,
    values: Mutex<Vec<i64>>,
}

/// A group of workers running as threads of one process.
pub struct LocalGroup;

impl LocalGroup {
    /// Returns one communicator per worker of a group of `size` workers.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: u64) -> Vec<LocalCommunicator> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size as usize),
            payload: Mutex::new(None),
            values: Mutex::new(vec![0; size as usize]),
        });
        (0..size)
            .map(|rank| LocalCommunicator {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// Communicator of one worker of a [LocalGroup].
pub struct LocalCommunicator {
    rank: u64,
    size: u64,
    shared: Arc<Shared>,
}

fn poisoned(operation: &'static str) -> CubeError {
    CubeError::Collective {
        operation,
        message: "shared state poisoned".to_string(),
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> u64 {
        self.rank
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn broadcast(&self, root: u64, payload: Option<Bytes>) -> Result<Bytes, CubeError> {
        if self.rank == root {
            *self.shared.payload.lock().map_err(|_| poisoned("broadcast"))? = payload;
        }
        self.shared.barrier.wait();
        let received = self
            .shared
            .payload
            .lock()
            .map_err(|_| poisoned("broadcast"))?
            .clone();
        // Nobody may overwrite the payload before every worker has read it.
        self.shared.barrier.wait();
        received.ok_or(CubeError::Collective {
            operation: "broadcast",
            message: format!("root {} sent no payload", root),
        })
    }

    fn all_reduce(&self, value: i64, op: ReduceOp) -> Result<i64, CubeError> {
        self.shared
            .values
            .lock()
            .map_err(|_| poisoned("all_reduce"))?[self.rank as usize] = value;
        self.shared.barrier.wait();
        let result = op.apply(
            &self
                .shared
                .values
                .lock()
                .map_err(|_| poisoned("all_reduce"))?,
        );
        self.shared.barrier.wait();
        result.ok_or(CubeError::Collective {
            operation: "all_reduce",
            message: "empty group".to_string(),
        })
    }
}
