//! Record processors and the dispatch table.
//!
//! ## Architecture
//!
//! - [`TypedRecordProcessor`]: the one trait every processor implements
//! - [`ProcessingScope`]: what a processor may touch while handling a record
//! - [`RecordProcessorMap`]: `(record type, value type, intent) -> processor`
//! - [`TypedRecordProcessors`]: builder used to register processors before
//!   the stream processor starts
//!
//! ## Example
//!
//! ```ignore
//! let processors = TypedRecordProcessors::new()
//!     .on_command(ValueType::Job, JobIntent::COMPLETE, CompleteJobProcessor)
//!     .on_event(ValueType::Timer, TimerIntent::TRIGGERED, TriggerTimerProcessor)
//!     .with_listener(JobTimeoutChecker::new());
//! ```

use std::sync::Arc;

use strand_types::{
    Intent, Key, LoggedEvent, PartitionId, Position, RecordType, RecordValue, RejectionType,
    ValueType,
};

use crate::command::{CommandProcessor, CommandProcessorAdapter};
use crate::db::Transaction;
use crate::error::ProcessingError;
use crate::record::{MigratedValueTypes, TypedRecord};
use crate::response::TypedResponseWriter;
use crate::side_effect::{SideEffectProducer, SideEffects};
use crate::state::{EngineState, EventApplier};
use crate::writer::TypedStreamWriter;

// ============================================================================
// Processing Scope
// ============================================================================

/// Resources available to a processor for one record.
///
/// Everything written through the scope belongs to the record's transaction
/// and is discarded if processing fails.
pub struct ProcessingScope<'a> {
    position: Position,
    transaction: &'a mut dyn Transaction,
    state: &'a EngineState,
    writer: &'a mut dyn TypedStreamWriter,
    response_writer: &'a mut dyn TypedResponseWriter,
    side_effects: &'a mut SideEffects,
    event_applier: Option<&'a dyn EventApplier>,
    migrated: &'a MigratedValueTypes,
}

impl<'a> ProcessingScope<'a> {
    pub(crate) fn new(
        position: Position,
        transaction: &'a mut dyn Transaction,
        state: &'a EngineState,
        writer: &'a mut dyn TypedStreamWriter,
        response_writer: &'a mut dyn TypedResponseWriter,
        side_effects: &'a mut SideEffects,
        event_applier: Option<&'a dyn EventApplier>,
        migrated: &'a MigratedValueTypes,
    ) -> Self {
        Self {
            position,
            transaction,
            state,
            writer,
            response_writer,
            side_effects,
            event_applier,
            migrated,
        }
    }

    /// Position of the record being processed.
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn transaction(&mut self) -> &mut dyn Transaction {
        &mut *self.transaction
    }

    pub fn state(&self) -> &EngineState {
        self.state
    }

    pub fn next_key(&mut self) -> Result<Key, ProcessingError> {
        Ok(self.state.key_generator.next_key(&mut *self.transaction)?)
    }

    pub fn append_new_command(&mut self, value_type: ValueType, intent: Intent, value: RecordValue) {
        self.writer.append_new_command(value_type, intent, value);
    }

    pub fn append_follow_up_command(
        &mut self,
        key: Key,
        value_type: ValueType,
        intent: Intent,
        value: RecordValue,
    ) {
        self.writer
            .append_follow_up_command(key, value_type, intent, value);
    }

    /// Appends an event. Events of migrated value types are applied to state
    /// right away.
    pub fn append_follow_up_event(
        &mut self,
        key: Key,
        value_type: ValueType,
        intent: Intent,
        value: RecordValue,
    ) -> Result<(), ProcessingError> {
        if self.migrated.contains(value_type) {
            if let Some(applier) = self.event_applier {
                applier.apply_state(&mut *self.transaction, key, value_type, intent, &value)?;
            }
        }
        self.writer
            .append_follow_up_event(key, value_type, intent, value);
        Ok(())
    }

    pub fn append_rejection(
        &mut self,
        command: &TypedRecord,
        rejection_type: RejectionType,
        reason: &str,
    ) {
        self.writer.append_rejection(command, rejection_type, reason);
    }

    pub fn response_writer(&mut self) -> &mut dyn TypedResponseWriter {
        &mut *self.response_writer
    }

    /// Replaces the default side effect (sending the response).
    pub fn replace_side_effect(&mut self, producer: impl SideEffectProducer + 'static) {
        self.side_effects.replace(Box::new(producer));
    }

    pub fn add_side_effect(&mut self, producer: impl SideEffectProducer + 'static) {
        self.side_effects.add(Box::new(producer));
    }
}

// ============================================================================
// Processor Traits
// ============================================================================

pub trait TypedRecordProcessor: Send + Sync {
    fn process_record(
        &self,
        record: &TypedRecord,
        scope: &mut ProcessingScope<'_>,
    ) -> Result<(), ProcessingError>;

    /// Processors that want lifecycle notifications return themselves here.
    fn as_lifecycle_aware(&self) -> Option<&dyn StreamProcessorLifecycleAware> {
        None
    }
}

/// Hooks into the stream processor lifecycle.
pub trait StreamProcessorLifecycleAware: Send + Sync {
    fn on_recovered(&self, _partition_id: PartitionId, _last_processed_position: Position) {}

    fn on_paused(&self) {}

    fn on_resumed(&self) {}

    fn on_close(&self) {}

    fn on_failed(&self) {}
}

/// Observer of processing progress.
pub trait StreamProcessorListener: Send + Sync {
    fn on_processed(&self, _record: &TypedRecord) {}

    fn on_skipped(&self, _record: &LoggedEvent) {}
}

// ============================================================================
// Dispatch Table
// ============================================================================

type ProcessorSlot = Option<Arc<dyn TypedRecordProcessor>>;

/// Constant-time lookup of the processor for a record.
///
/// Indexed by record type ordinal, value type ordinal and intent value.
/// Intent vectors grow on registration, so unknown intents are misses.
pub struct RecordProcessorMap {
    table: Vec<Vec<Vec<ProcessorSlot>>>,
    len: usize,
}

impl RecordProcessorMap {
    pub fn new() -> Self {
        Self {
            table: (0..RecordType::COUNT)
                .map(|_| (0..ValueType::COUNT).map(|_| Vec::new()).collect())
                .collect(),
            len: 0,
        }
    }

    pub fn register(
        &mut self,
        record_type: RecordType,
        value_type: ValueType,
        intent: Intent,
        processor: Arc<dyn TypedRecordProcessor>,
    ) {
        let slots = &mut self.table[record_type.ordinal()][value_type.ordinal()];
        if slots.len() <= intent.ordinal() {
            slots.resize(intent.ordinal() + 1, None);
        }
        let slot = &mut slots[intent.ordinal()];
        if slot.is_some() {
            tracing::warn!(
                record_type = %record_type,
                value_type = %value_type,
                intent = %intent,
                "replacing registered processor"
            );
        } else {
            self.len += 1;
        }
        *slot = Some(processor);
    }

    pub fn get(
        &self,
        record_type: RecordType,
        value_type: ValueType,
        intent: Intent,
    ) -> Option<&Arc<dyn TypedRecordProcessor>> {
        self.table[record_type.ordinal()][value_type.ordinal()]
            .get(intent.ordinal())
            .and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TypedRecordProcessor>> {
        self.table
            .iter()
            .flatten()
            .flatten()
            .filter_map(Option::as_ref)
    }
}

impl Default for RecordProcessorMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers processors and lifecycle listeners for a stream processor.
#[derive(Default)]
pub struct TypedRecordProcessors {
    processors: RecordProcessorMap,
    listeners: Vec<Arc<dyn StreamProcessorLifecycleAware>>,
}

impl TypedRecordProcessors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_record(
        mut self,
        record_type: RecordType,
        value_type: ValueType,
        intent: Intent,
        processor: impl TypedRecordProcessor + 'static,
    ) -> Self {
        self.processors
            .register(record_type, value_type, intent, Arc::new(processor));
        self
    }

    /// Registers a processor that accepts or rejects commands.
    pub fn on_command(
        self,
        value_type: ValueType,
        intent: Intent,
        processor: impl CommandProcessor + 'static,
    ) -> Self {
        self.on_record(
            RecordType::Command,
            value_type,
            intent,
            CommandProcessorAdapter::new(processor),
        )
    }

    pub fn on_event(
        self,
        value_type: ValueType,
        intent: Intent,
        processor: impl TypedRecordProcessor + 'static,
    ) -> Self {
        self.on_record(RecordType::Event, value_type, intent, processor)
    }

    pub fn with_listener(mut self, listener: impl StreamProcessorLifecycleAware + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn processors(&self) -> &RecordProcessorMap {
        &self.processors
    }

    pub(crate) fn into_parts(
        self,
    ) -> (RecordProcessorMap, Vec<Arc<dyn StreamProcessorLifecycleAware>>) {
        (self.processors, self.listeners)
    }
}
