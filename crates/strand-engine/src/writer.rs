//! Typed stream writers.
//!
//! Processors never write to the log directly. Follow-up records are
//! buffered in a [`TypedStreamWriter`] and flushed by the processing state
//! machine once the processor returned, so that a failed record leaves no
//! partial output behind.

use std::collections::{BTreeMap, VecDeque};

use strand_types::{
    Intent, Key, Position, RecordMetadata, RecordType, RecordValue, RejectionType, ValueType,
};

use crate::error::LogError;
use crate::log::{LogAppendEntry, LogStreamWriter};
use crate::record::TypedRecord;

pub trait TypedStreamWriter: Send {
    /// Sets the source position of every record appended afterwards.
    fn configure_source_context(&mut self, source_position: Position);

    fn append_record(&mut self, key: Key, metadata: RecordMetadata, value: RecordValue);

    /// Discards all buffered records.
    fn reset(&mut self);

    /// Writes the buffered records and returns the position of the last one,
    /// or [`Position::UNSET`] if nothing was buffered.
    fn flush(&mut self) -> Result<Position, LogError>;

    fn append_new_command(&mut self, value_type: ValueType, intent: Intent, value: RecordValue) {
        self.append_record(Key::UNSET, RecordMetadata::command(value_type, intent), value);
    }

    fn append_follow_up_command(
        &mut self,
        key: Key,
        value_type: ValueType,
        intent: Intent,
        value: RecordValue,
    ) {
        self.append_record(key, RecordMetadata::command(value_type, intent), value);
    }

    fn append_new_event(
        &mut self,
        key: Key,
        value_type: ValueType,
        intent: Intent,
        value: RecordValue,
    ) {
        self.append_record(key, RecordMetadata::event(value_type, intent), value);
    }

    fn append_follow_up_event(
        &mut self,
        key: Key,
        value_type: ValueType,
        intent: Intent,
        value: RecordValue,
    ) {
        self.append_record(key, RecordMetadata::event(value_type, intent), value);
    }

    /// Appends the rejection of `command`, carrying its request metadata so
    /// that clients can correlate it.
    fn append_rejection(
        &mut self,
        command: &TypedRecord,
        rejection_type: RejectionType,
        reason: &str,
    ) {
        let mut metadata = RecordMetadata::rejection(
            command.value_type(),
            command.intent(),
            rejection_type,
            reason,
        );
        metadata.request = command.request();
        self.append_record(command.key(), metadata, command.value().clone());
    }
}

// ============================================================================
// Live Writer
// ============================================================================

/// Buffers records and writes them to the log as one batch.
pub struct TypedStreamWriterImpl {
    writer: Box<dyn LogStreamWriter>,
    source_position: Position,
    buffer: Vec<LogAppendEntry>,
}

impl TypedStreamWriterImpl {
    pub fn new(writer: Box<dyn LogStreamWriter>) -> Self {
        Self {
            writer,
            source_position: Position::UNSET,
            buffer: Vec::new(),
        }
    }

    pub fn buffered(&self) -> &[LogAppendEntry] {
        &self.buffer
    }
}

impl TypedStreamWriter for TypedStreamWriterImpl {
    fn configure_source_context(&mut self, source_position: Position) {
        self.source_position = source_position;
    }

    fn append_record(&mut self, key: Key, metadata: RecordMetadata, value: RecordValue) {
        self.buffer.push(LogAppendEntry {
            key,
            metadata,
            value,
        });
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn flush(&mut self) -> Result<Position, LogError> {
        if self.buffer.is_empty() {
            return Ok(Position::UNSET);
        }
        // the buffer survives a failed write so the batch can be retried
        let position = self.writer.try_write(&self.buffer, self.source_position)?;
        self.buffer.clear();
        Ok(position)
    }
}

// ============================================================================
// Reprocessing Writer
// ============================================================================

/// What a processor produced for a source record during reprocessing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReprocessedRecord {
    pub key: Key,
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
}

/// Records appended records per source position instead of writing them,
/// so that they can be compared with the follow-ups already in the log.
#[derive(Debug, Default)]
pub struct ReprocessingStreamWriter {
    source_position: Position,
    records: BTreeMap<Position, VecDeque<ReprocessedRecord>>,
}

impl ReprocessingStreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the oldest record produced for `source_position`.
    pub fn take_next(&mut self, source_position: Position) -> Option<ReprocessedRecord> {
        let queue = self.records.get_mut(&source_position)?;
        let record = queue.pop_front();
        if queue.is_empty() {
            self.records.remove(&source_position);
        }
        record
    }

    /// The first source that still has unmatched records.
    pub fn first_unmatched(&self) -> Option<(Position, &ReprocessedRecord)> {
        self.records
            .iter()
            .find_map(|(source, queue)| queue.front().map(|record| (*source, record)))
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.source_position = Position::UNSET;
    }
}

impl TypedStreamWriter for ReprocessingStreamWriter {
    fn configure_source_context(&mut self, source_position: Position) {
        self.source_position = source_position;
    }

    fn append_record(&mut self, key: Key, metadata: RecordMetadata, _value: RecordValue) {
        self.records
            .entry(self.source_position)
            .or_default()
            .push_back(ReprocessedRecord {
                key,
                record_type: metadata.record_type,
                value_type: metadata.value_type,
                intent: metadata.intent,
            });
    }

    /// Forgets what was recorded for the current source, so that a retried
    /// replay does not record twice.
    fn reset(&mut self) {
        self.records.remove(&self.source_position);
    }

    fn flush(&mut self) -> Result<Position, LogError> {
        Ok(Position::UNSET)
    }
}

/// Placeholder installed while no live writer exists. Appends are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStreamWriter;

impl TypedStreamWriter for DisabledStreamWriter {
    fn configure_source_context(&mut self, _source_position: Position) {}

    fn append_record(&mut self, key: Key, metadata: RecordMetadata, _value: RecordValue) {
        tracing::warn!(
            key = %key,
            record_type = %metadata.record_type,
            "record appended while the stream writer is disabled"
        );
    }

    fn reset(&mut self) {}

    fn flush(&mut self) -> Result<Position, LogError> {
        Ok(Position::UNSET)
    }
}
