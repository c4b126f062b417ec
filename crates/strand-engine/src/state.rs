//! Engine-owned state kept in the transactional store.
//!
//! All accessors are stateless and operate on the transaction they are
//! given, so their changes share the fate of the record being processed.

use std::sync::Arc;

use strand_types::{Intent, Key, PartitionId, Position, RecordValue, ValueType};

use crate::db::{ColumnFamily, Transaction, get_value, put_value};
use crate::error::{ProcessingError, StoreError};
use crate::record::TypedRecord;

const KEY_GENERATOR_KEY: &[u8] = b"next-key";
const LAST_PROCESSED_POSITION_KEY: &[u8] = b"last-processed-position";

// ============================================================================
// Key Generator
// ============================================================================

/// Monotonic, partition-encoded key sequence.
#[derive(Debug, Clone, Copy)]
pub struct KeyGenerator {
    partition_id: PartitionId,
}

impl KeyGenerator {
    pub fn new(partition_id: PartitionId) -> Self {
        Self { partition_id }
    }

    /// Last key handed out, or the partition's initial value.
    pub fn current_key(&self, transaction: &dyn Transaction) -> Result<Key, StoreError> {
        Ok(get_value::<i64>(transaction, ColumnFamily::KeyGenerator, KEY_GENERATOR_KEY)?
            .map_or_else(|| Key::encode(self.partition_id, 0), Key::new))
    }

    pub fn next_key(&self, transaction: &mut dyn Transaction) -> Result<Key, StoreError> {
        let next = Key::new(self.current_key(transaction)?.as_i64() + 1);
        put_value(
            transaction,
            ColumnFamily::KeyGenerator,
            KEY_GENERATOR_KEY,
            &next.as_i64(),
        )?;
        Ok(next)
    }

    /// Advances the sequence so that the next key is above `key`. Keys of
    /// other partitions are ignored.
    pub fn set_key_if_higher(
        &self,
        transaction: &mut dyn Transaction,
        key: Key,
    ) -> Result<(), StoreError> {
        if !key.is_set() || key.partition_id() != self.partition_id {
            return Ok(());
        }
        if key > self.current_key(transaction)? {
            put_value(
                transaction,
                ColumnFamily::KeyGenerator,
                KEY_GENERATOR_KEY,
                &key.as_i64(),
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// Last Processed Position
// ============================================================================

/// The recovery checkpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastProcessedPositionState;

impl LastProcessedPositionState {
    pub fn last_successful_processed_position(
        &self,
        transaction: &dyn Transaction,
    ) -> Result<Position, StoreError> {
        Ok(get_value::<i64>(
            transaction,
            ColumnFamily::LastProcessedPosition,
            LAST_PROCESSED_POSITION_KEY,
        )?
        .map_or(Position::UNSET, Position::new))
    }

    pub fn mark_as_processed(
        &self,
        transaction: &mut dyn Transaction,
        position: Position,
    ) -> Result<(), StoreError> {
        put_value(
            transaction,
            ColumnFamily::LastProcessedPosition,
            LAST_PROCESSED_POSITION_KEY,
            &position.as_i64(),
        )
    }
}

// ============================================================================
// Blacklist
// ============================================================================

/// Maps a record to the entity that is blacklisted when it fails.
pub trait BlacklistKeyResolver: Send + Sync {
    /// Returns [`Key::UNSET`] if the record belongs to no blacklistable
    /// entity.
    fn entity_key(&self, record: &TypedRecord) -> Key;
}

/// Uses the record key, except for the engine's own error records.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordKeyResolver;

impl BlacklistKeyResolver for RecordKeyResolver {
    fn entity_key(&self, record: &TypedRecord) -> Key {
        if record.value_type() == ValueType::Error {
            Key::UNSET
        } else {
            record.key()
        }
    }
}

/// Entities whose records are no longer processed.
#[derive(Clone)]
pub struct Blacklist {
    resolver: Arc<dyn BlacklistKeyResolver>,
}

impl Blacklist {
    pub fn new(resolver: Arc<dyn BlacklistKeyResolver>) -> Self {
        Self { resolver }
    }

    pub fn is_on_blacklist(
        &self,
        transaction: &dyn Transaction,
        record: &TypedRecord,
    ) -> Result<bool, StoreError> {
        let key = self.resolver.entity_key(record);
        if !key.is_set() {
            return Ok(false);
        }
        Ok(transaction
            .get(ColumnFamily::Blacklist, &key.as_i64().to_be_bytes())?
            .is_some())
    }

    /// Blacklists the record's entity and returns its key, or
    /// [`Key::UNSET`] if there is none.
    pub fn try_to_blacklist(
        &self,
        transaction: &mut dyn Transaction,
        record: &TypedRecord,
    ) -> Result<Key, StoreError> {
        let key = self.resolver.entity_key(record);
        if key.is_set() {
            transaction.put(
                ColumnFamily::Blacklist,
                &key.as_i64().to_be_bytes(),
                bytes::Bytes::new(),
            )?;
            tracing::debug!(key = %key, position = %record.position(), "entity blacklisted");
        }
        Ok(key)
    }

    /// Removes an entity from the blacklist.
    pub fn clear(&self, transaction: &mut dyn Transaction, key: Key) -> Result<(), StoreError> {
        transaction.delete(ColumnFamily::Blacklist, &key.as_i64().to_be_bytes())
    }
}

impl std::fmt::Debug for Blacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blacklist").finish_non_exhaustive()
    }
}

/// The engine state accessors of one partition.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub key_generator: KeyGenerator,
    pub last_processed: LastProcessedPositionState,
    pub blacklist: Blacklist,
}

impl EngineState {
    pub fn new(partition_id: PartitionId, resolver: Arc<dyn BlacklistKeyResolver>) -> Self {
        Self {
            key_generator: KeyGenerator::new(partition_id),
            last_processed: LastProcessedPositionState,
            blacklist: Blacklist::new(resolver),
        }
    }
}

// ============================================================================
// Event Applier
// ============================================================================

/// Applies events of migrated value types to state.
///
/// Invoked when such an event is appended during processing and when it is
/// replayed during reprocessing. It must be deterministic.
pub trait EventApplier: Send + Sync {
    fn apply_state(
        &self,
        transaction: &mut dyn Transaction,
        key: Key,
        value_type: ValueType,
        intent: Intent,
        value: &RecordValue,
    ) -> Result<(), ProcessingError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventApplier;

impl EventApplier for NoopEventApplier {
    fn apply_state(
        &self,
        _transaction: &mut dyn Transaction,
        _key: Key,
        _value_type: ValueType,
        _intent: Intent,
        _value: &RecordValue,
    ) -> Result<(), ProcessingError> {
        Ok(())
    }
}
