use thiserror::Error;

use crate::queue::QueueError;
use crate::staging::StagingError;
use crate::warehouse::WarehouseError;

/// Batch-level failures of the load pipeline.
///
/// Only the primary-target load outcome decides whether a batch commits.
/// Everything else degrades to logging and counters: parse failures drop the
/// one message, secondary-target failures are recorded on the commit result,
/// and staging cleanup failures never propagate at all.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("malformed message payload: {0}")]
    Parse(String),

    #[error("failed to stage batch: {0}")]
    Stage(#[from] StagingError),

    #[error("schema synchronization failed for {table}: {error}")]
    Schema {
        table: String,
        error: WarehouseError,
    },

    #[error("bulk load failed on {target}: {reason}")]
    Load { target: String, reason: String },

    #[error("bulk load timed out on {target} after {waited_secs}s")]
    LoadTimeout { target: String, waited_secs: u64 },

    #[error("queue operation failed: {0}")]
    Queue(#[from] QueueError),
}

impl PipelineError {
    /// Parse failures drop a single message; everything else retains the
    /// whole batch for redelivery.
    pub fn is_batch_fatal(&self) -> bool {
        !matches!(self, PipelineError::Parse(_))
    }
}
