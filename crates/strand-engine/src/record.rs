//! Typed view of log records and the record filters.

use serde::de::DeserializeOwned;
use strand_types::{
    Intent, Key, LoggedEvent, Position, RecordMetadata, RecordType, RecordValue,
    RequestMetadata, ValueError, ValueType,
};

/// Owned view of the record currently being handled.
///
/// The state machines re-populate one instance per record with
/// [`wrap`](Self::wrap); processors must not hold on to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedRecord {
    event: LoggedEvent,
}

impl TypedRecord {
    pub fn new(event: LoggedEvent) -> Self {
        Self { event }
    }

    /// Replaces the viewed record.
    pub fn wrap(&mut self, event: LoggedEvent) {
        self.event = event;
    }

    pub fn position(&self) -> Position {
        self.event.position
    }

    pub fn source_event_position(&self) -> Position {
        self.event.source_event_position
    }

    pub fn key(&self) -> Key {
        self.event.key
    }

    pub fn timestamp(&self) -> i64 {
        self.event.timestamp
    }

    pub fn metadata(&self) -> &RecordMetadata {
        &self.event.metadata
    }

    pub fn record_type(&self) -> RecordType {
        self.event.metadata.record_type
    }

    pub fn value_type(&self) -> ValueType {
        self.event.metadata.value_type
    }

    pub fn intent(&self) -> Intent {
        self.event.metadata.intent
    }

    pub fn request(&self) -> Option<RequestMetadata> {
        self.event.metadata.request
    }

    pub fn value(&self) -> &RecordValue {
        &self.event.value
    }

    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, ValueError> {
        self.event.value.decode()
    }

    pub fn is_command(&self) -> bool {
        self.record_type() == RecordType::Command
    }

    pub fn event(&self) -> &LoggedEvent {
        &self.event
    }
}

impl From<LoggedEvent> for TypedRecord {
    fn from(event: LoggedEvent) -> Self {
        Self::new(event)
    }
}

/// Value types whose state is changed only by applying their events.
///
/// Commands of these types are processed normally, but their events are
/// applied through the event applier instead of being processed, and during
/// reprocessing the events are applied instead of re-running the commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigratedValueTypes {
    migrated: [bool; ValueType::COUNT],
}

impl MigratedValueTypes {
    pub fn new(value_types: impl IntoIterator<Item = ValueType>) -> Self {
        let mut migrated = [false; ValueType::COUNT];
        for value_type in value_types {
            migrated[value_type.ordinal()] = true;
        }
        Self { migrated }
    }

    pub fn contains(&self, value_type: ValueType) -> bool {
        self.migrated[value_type.ordinal()]
    }

    /// Live processing: migrated types only as commands, legacy types always.
    pub fn accepts_for_processing(&self, record_type: RecordType, value_type: ValueType) -> bool {
        !self.contains(value_type) || record_type == RecordType::Command
    }

    /// Reprocessing: migrated types only as events, legacy types always.
    pub fn accepts_for_replay(&self, record_type: RecordType, value_type: ValueType) -> bool {
        !self.contains(value_type) || record_type == RecordType::Event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(RecordType::Command, ValueType::Job => true; "migrated command is processed")]
    #[test_case(RecordType::Event, ValueType::Job => false; "migrated event is not processed")]
    #[test_case(RecordType::CommandRejection, ValueType::Job => false; "migrated rejection is not processed")]
    #[test_case(RecordType::Event, ValueType::Timer => true; "legacy event is processed")]
    #[test_case(RecordType::Command, ValueType::Timer => true; "legacy command is processed")]
    fn processing_filter(record_type: RecordType, value_type: ValueType) -> bool {
        MigratedValueTypes::new([ValueType::Job]).accepts_for_processing(record_type, value_type)
    }

    #[test_case(RecordType::Command, ValueType::Job => false; "migrated command is not replayed")]
    #[test_case(RecordType::Event, ValueType::Job => true; "migrated event is replayed")]
    #[test_case(RecordType::Command, ValueType::Timer => true; "legacy command is replayed")]
    fn replay_filter(record_type: RecordType, value_type: ValueType) -> bool {
        MigratedValueTypes::new([ValueType::Job]).accepts_for_replay(record_type, value_type)
    }

    #[test]
    fn wrap_replaces_the_viewed_record() {
        let event = |position: i64, key: i64| LoggedEvent {
            position: Position::new(position),
            source_event_position: Position::UNSET,
            key: Key::new(key),
            timestamp: 0,
            metadata: RecordMetadata::command(ValueType::Timer, Intent::new(0)),
            value: RecordValue::empty(),
        };

        let mut record = TypedRecord::new(event(1, 10));
        record.wrap(event(2, 20));

        assert_eq!(record.position(), Position::new(2));
        assert_eq!(record.key(), Key::new(20));
        assert!(record.is_command());
    }
}
