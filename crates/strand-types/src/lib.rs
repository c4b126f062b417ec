//! # strand-types: Core types for `Strand`
//!
//! This crate contains the value types shared by every Strand crate:
//! - Log addressing ([`Position`], [`PartitionId`])
//! - Entity identity ([`Key`], partition-encoded)
//! - Record classification ([`RecordType`], [`ValueType`], [`Intent`], [`RejectionType`])
//! - Record layout ([`RecordMetadata`], [`RequestMetadata`], [`RecordValue`], [`LoggedEvent`])
//! - Error events ([`ErrorRecord`], [`ErrorIntent`])

use std::fmt::{Debug, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

// ============================================================================
// Log Addressing - All Copy (cheap 8-byte values)
// ============================================================================

/// Identifier of a log partition. Each partition is processed by exactly
/// one stream processor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PartitionId(u16);

impl PartitionId {
    /// Highest partition id that fits into the upper bits of a [`Key`].
    pub const MAX: u16 = (1 << (64 - Key::KEY_BITS - 1)) - 1;

    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PartitionId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<PartitionId> for u16 {
    fn from(id: PartitionId) -> Self {
        id.0
    }
}

/// Position of a record in the log.
///
/// Positions are strictly increasing within a partition. [`Position::UNSET`]
/// marks "no position", e.g. the source of a record written by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(i64);

impl Position {
    pub const UNSET: Position = Position(-1);

    pub const fn new(position: i64) -> Self {
        Self(position)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns true if this is a real log position.
    pub fn is_set(self) -> bool {
        self.0 >= 0
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::UNSET
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Position {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Position> for i64 {
    fn from(position: Position) -> Self {
        position.0
    }
}

// ============================================================================
// Entity Keys - Copy (partition-encoded 8-byte value)
// ============================================================================

/// Key of an entity (process instance, job, message, ...).
///
/// **Bit Layout**:
/// - Upper bits: `partition_id` of the partition that generated the key
/// - Lower 51 bits: per-partition counter
///
/// Keys generated on different partitions therefore never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(i64);

impl Key {
    pub const UNSET: Key = Key(-1);

    /// Number of bits reserved for the per-partition counter.
    pub const KEY_BITS: u32 = 51;

    const LOCAL_MASK: i64 = (1 << Self::KEY_BITS) - 1;

    pub const fn new(key: i64) -> Self {
        Self(key)
    }

    /// Encodes a partition-local counter value into a key.
    ///
    /// # Examples
    ///
    /// ```
    /// # use strand_types::{Key, PartitionId};
    /// let key = Key::encode(PartitionId::new(3), 42);
    /// assert_eq!(key.partition_id(), PartitionId::new(3));
    /// assert_eq!(key.local_key(), 42);
    /// ```
    pub fn encode(partition_id: PartitionId, local_key: i64) -> Self {
        debug_assert!(partition_id.as_u16() <= PartitionId::MAX);
        debug_assert!((0..=Self::LOCAL_MASK).contains(&local_key));
        Self((i64::from(partition_id.as_u16()) << Self::KEY_BITS) | local_key)
    }

    /// Extracts the partition that generated this key.
    pub fn partition_id(self) -> PartitionId {
        PartitionId::new((self.0 >> Self::KEY_BITS) as u16)
    }

    /// Extracts the per-partition counter.
    pub fn local_key(self) -> i64 {
        self.0 & Self::LOCAL_MASK
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn is_set(self) -> bool {
        self.0 >= 0
    }
}

impl Default for Key {
    fn default() -> Self {
        Self::UNSET
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Key> for i64 {
    fn from(key: Key) -> Self {
        key.0
    }
}

// ============================================================================
// Record Classification - Copy (small enums)
// ============================================================================

/// Kind of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
    /// A request to change state.
    #[default]
    Command = 0,
    /// A fact produced while processing a command.
    Event = 1,
    /// The negative answer to a command.
    CommandRejection = 2,
}

impl RecordType {
    pub const COUNT: usize = 3;

    pub const ALL: [RecordType; Self::COUNT] = [
        RecordType::Command,
        RecordType::Event,
        RecordType::CommandRejection,
    ];

    /// Dense index used by lookup tables.
    pub fn ordinal(self) -> usize {
        self as usize
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "COMMAND"),
            Self::Event => write!(f, "EVENT"),
            Self::CommandRejection => write!(f, "COMMAND_REJECTION"),
        }
    }
}

/// Kind of entity a record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ValueType {
    Deployment = 0,
    Process = 1,
    ProcessInstance = 2,
    ProcessInstanceCreation = 3,
    Job = 4,
    Incident = 5,
    Message = 6,
    MessageSubscription = 7,
    Timer = 8,
    Variable = 9,
    /// Value type of the ERROR events written by the engine itself.
    Error = 10,
}

impl ValueType {
    pub const COUNT: usize = 11;

    pub const ALL: [ValueType; Self::COUNT] = [
        ValueType::Deployment,
        ValueType::Process,
        ValueType::ProcessInstance,
        ValueType::ProcessInstanceCreation,
        ValueType::Job,
        ValueType::Incident,
        ValueType::Message,
        ValueType::MessageSubscription,
        ValueType::Timer,
        ValueType::Variable,
        ValueType::Error,
    ];

    /// Dense index used by lookup tables.
    pub fn ordinal(self) -> usize {
        self as usize
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Deployment => "DEPLOYMENT",
            Self::Process => "PROCESS",
            Self::ProcessInstance => "PROCESS_INSTANCE",
            Self::ProcessInstanceCreation => "PROCESS_INSTANCE_CREATION",
            Self::Job => "JOB",
            Self::Incident => "INCIDENT",
            Self::Message => "MESSAGE",
            Self::MessageSubscription => "MESSAGE_SUBSCRIPTION",
            Self::Timer => "TIMER",
            Self::Variable => "VARIABLE",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Intent of a record, scoped to its [`ValueType`].
///
/// The numeric value is only meaningful together with the value type: intent
/// `1` of a job is unrelated to intent `1` of a timer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Intent(u8);

impl Intent {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Dense index used by lookup tables.
    pub fn ordinal(self) -> usize {
        usize::from(self.0)
    }
}

impl Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for Intent {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Intents of [`ValueType::Error`] records.
pub struct ErrorIntent;

impl ErrorIntent {
    pub const CREATED: Intent = Intent::new(0);
}

/// Reason a command was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RejectionType {
    /// Not a rejection.
    #[default]
    NullVal,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
    /// The engine failed to process the command.
    ProcessingError,
}

impl Display for RejectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NullVal => "NULL_VAL",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::InvalidState => "INVALID_STATE",
            Self::ProcessingError => "PROCESSING_ERROR",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Record Layout
// ============================================================================

/// Identifies the client request a command came from, so that a response can
/// be routed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub request_id: i64,
    pub request_stream_id: i32,
}

/// Metadata carried by every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    /// Present when the record was written on behalf of a client request.
    pub request: Option<RequestMetadata>,
    pub rejection_type: RejectionType,
    pub rejection_reason: String,
}

impl RecordMetadata {
    pub fn new(record_type: RecordType, value_type: ValueType, intent: Intent) -> Self {
        Self {
            record_type,
            value_type,
            intent,
            request: None,
            rejection_type: RejectionType::NullVal,
            rejection_reason: String::new(),
        }
    }

    pub fn command(value_type: ValueType, intent: Intent) -> Self {
        Self::new(RecordType::Command, value_type, intent)
    }

    pub fn event(value_type: ValueType, intent: Intent) -> Self {
        Self::new(RecordType::Event, value_type, intent)
    }

    pub fn rejection(
        value_type: ValueType,
        intent: Intent,
        rejection_type: RejectionType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            rejection_type,
            rejection_reason: reason.into(),
            ..Self::new(RecordType::CommandRejection, value_type, intent)
        }
    }

    pub fn with_request(mut self, request: RequestMetadata) -> Self {
        self.request = Some(request);
        self
    }
}

/// Error returned when a record value cannot be encoded or decoded.
#[derive(thiserror::Error, Debug)]
pub enum ValueError {
    #[error("failed to encode record value: {0}")]
    Encode(#[source] postcard::Error),

    #[error("failed to decode record value: {0}")]
    Decode(#[source] postcard::Error),
}

/// Encoded record payload.
///
/// Cloning is cheap (reference-counted buffer). The engine never interprets
/// the payload except for its own [`ErrorRecord`]s.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RecordValue(Bytes);

impl RecordValue {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Encodes a typed value with postcard.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, ValueError> {
        postcard::to_allocvec(value)
            .map(|bytes| Self(Bytes::from(bytes)))
            .map_err(ValueError::Encode)
    }

    /// Decodes the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ValueError> {
        postcard::from_bytes(&self.0).map_err(ValueError::Decode)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An immutable entry of the log as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub position: Position,
    /// Position of the record that caused this one, or [`Position::UNSET`].
    pub source_event_position: Position,
    pub key: Key,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub metadata: RecordMetadata,
    pub value: RecordValue,
}

impl LoggedEvent {
    pub fn record_type(&self) -> RecordType {
        self.metadata.record_type
    }

    pub fn value_type(&self) -> ValueType {
        self.metadata.value_type
    }

    pub fn intent(&self) -> Intent {
        self.metadata.intent
    }

    pub fn has_source(&self) -> bool {
        self.source_event_position.is_set()
    }
}

// ============================================================================
// Error Events
// ============================================================================

/// Value of the ERROR events the engine writes when processing a record
/// failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Position of the record whose processing failed.
    pub error_event_position: Position,
    pub exception_message: String,
    /// The entity that was blacklisted, or [`Key::UNSET`].
    pub process_instance_key: Key,
}

impl ErrorRecord {
    pub fn new(
        error_event_position: Position,
        exception_message: impl Into<String>,
        process_instance_key: Key,
    ) -> Self {
        Self {
            error_event_position,
            exception_message: exception_message.into(),
            process_instance_key,
        }
    }
}

#[cfg(test)]
mod tests;
