//! Error types of the engine.
//!
//! The taxonomy is closed. Processors signal failures through
//! [`ProcessingError`], collaborators through [`LogError`] and [`StoreError`],
//! and the state machines and the actor propagate [`EngineError`].

use std::fmt::Display;

use strand_types::{PartitionId, Position, ValueError};

/// Failure raised while processing a single record.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Generic failure: the record is rejected, the entity blacklisted and
    /// processing continues with the next record.
    #[error("processing failed: {0}")]
    Failed(String),

    /// Transient failure: the same record is retried after a delay.
    #[error("recoverable processing failure: {0}")]
    Recoverable(String),

    /// The engine cannot continue on this partition.
    #[error("unrecoverable processing failure: {0}")]
    Unrecoverable(String),
}

impl ProcessingError {
    pub fn failed(message: impl Display) -> Self {
        Self::Failed(message.to_string())
    }

    pub fn recoverable(message: impl Display) -> Self {
        Self::Recoverable(message.to_string())
    }

    pub fn unrecoverable(message: impl Display) -> Self {
        Self::Unrecoverable(message.to_string())
    }
}

impl From<StoreError> for ProcessingError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Codec(_) => Self::Failed(error.to_string()),
            StoreError::Unavailable(_) => Self::Recoverable(error.to_string()),
        }
    }
}

impl From<ValueError> for ProcessingError {
    fn from(error: ValueError) -> Self {
        Self::Failed(error.to_string())
    }
}

/// Failure of the log collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The log cannot accept the write right now (backpressure, leader
    /// change in progress).
    #[error("log unavailable: {0}")]
    Unavailable(String),

    /// The log refused the batch and will refuse it again.
    #[error("log rejected write: {0}")]
    Rejected(String),

    #[error("log is closed")]
    Closed,
}

impl LogError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Failure of the transactional store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode or decode stored value: {0}")]
    Codec(String),
}

impl From<postcard::Error> for StoreError {
    fn from(error: postcard::Error) -> Self {
        Self::Codec(error.to_string())
    }
}

/// Error propagated by the state machines and the stream processor.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unrecoverable failure: {0}")]
    Unrecoverable(String),

    #[error("log positions are not increasing: {current} follows {previous}")]
    NonIncreasingPosition { previous: Position, current: Position },

    #[error("snapshot position {0} does not exist in the log")]
    MissingSnapshotRecord(Position),

    #[error(
        "reprocessing is inconsistent with the log for source position {source_position}: {reason}"
    )]
    InconsistentReprocessing {
        source_position: Position,
        reason: String,
    },

    #[error("configured for partition {configured}, but the log belongs to partition {log}")]
    PartitionMismatch {
        configured: PartitionId,
        log: PartitionId,
    },

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("stream processor is closed")]
    Closed,
}

impl EngineError {
    /// Unrecoverable errors mark the processor dead; everything else only
    /// makes it unhealthy.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::Unrecoverable(_)
                | Self::NonIncreasingPosition { .. }
                | Self::MissingSnapshotRecord(_)
                | Self::InconsistentReprocessing { .. }
                | Self::PartitionMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(StoreError::Unavailable("busy".into()) => matches ProcessingError::Recoverable(_); "unavailable store is recoverable")]
    #[test_case(StoreError::Codec("bad".into()) => matches ProcessingError::Failed(_); "codec failure is a processing failure")]
    fn store_errors_map_to_processing_errors(error: StoreError) -> ProcessingError {
        ProcessingError::from(error)
    }

    #[test]
    fn only_unavailable_log_is_transient() {
        assert!(LogError::Unavailable("backpressure".into()).is_transient());
        assert!(!LogError::Rejected("too large".into()).is_transient());
        assert!(!LogError::Closed.is_transient());
    }

    #[test]
    fn engine_error_classification() {
        assert!(EngineError::MissingSnapshotRecord(Position::new(3)).is_unrecoverable());
        assert!(
            EngineError::InconsistentReprocessing {
                source_position: Position::new(1),
                reason: "mismatch".into(),
            }
            .is_unrecoverable()
        );
        assert!(
            EngineError::PartitionMismatch {
                configured: PartitionId::new(1),
                log: PartitionId::new(2),
            }
            .is_unrecoverable()
        );
        assert!(!EngineError::Log(LogError::Closed).is_unrecoverable());
        assert!(!EngineError::Closed.is_unrecoverable());
    }
}
