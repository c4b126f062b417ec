//! Log collaborator interfaces.
//!
//! The engine never owns log storage. It reads committed records through a
//! [`LogStreamReader`], appends batches through a [`LogStreamWriter`] and
//! follows the commit position through a `watch` channel.

use std::future::Future;

use strand_types::{Key, LoggedEvent, PartitionId, Position, RecordMetadata, RecordValue};
use tokio::sync::watch;

use crate::error::LogError;

/// One record of a batch handed to [`LogStreamWriter::try_write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAppendEntry {
    pub key: Key,
    pub metadata: RecordMetadata,
    pub value: RecordValue,
}

/// A partition of the replicated log.
pub trait LogStream: Send + Sync {
    fn partition_id(&self) -> PartitionId;

    fn new_reader(
        &self,
    ) -> impl Future<Output = Result<Box<dyn LogStreamReader>, LogError>> + Send;

    fn new_writer(
        &self,
    ) -> impl Future<Output = Result<Box<dyn LogStreamWriter>, LogError>> + Send;

    /// Highest position that is durable and visible to readers.
    fn commit_position(&self) -> Position;

    fn subscribe_commit_position(&self) -> watch::Receiver<Position>;
}

/// Cursor over the committed part of a log partition.
pub trait LogStreamReader: Send {
    fn has_next(&mut self) -> bool;

    fn next(&mut self) -> Option<LoggedEvent>;

    /// Positions the reader so that [`next`](Self::next) returns the record
    /// at `position`. Returns false if no such record exists.
    fn seek(&mut self, position: Position) -> bool;

    /// Positions the reader right after `position`. An unset position
    /// behaves like [`seek_to_first_event`](Self::seek_to_first_event).
    /// Returns false if `position` is set but not part of the log.
    fn seek_to_next_event(&mut self, position: Position) -> bool;

    fn seek_to_first_event(&mut self);

    /// Position of the record last returned by [`next`](Self::next).
    fn position(&self) -> Position;
}

/// Appends batches of records atomically.
pub trait LogStreamWriter: Send {
    /// Writes all entries with the given source position and returns the
    /// position of the last one.
    fn try_write(
        &mut self,
        entries: &[LogAppendEntry],
        source_position: Position,
    ) -> Result<Position, LogError>;
}
