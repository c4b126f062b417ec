//! Transactional key-value store interfaces.
//!
//! Engine state (key generator, blacklist, last processed position) and the
//! state of processors live in one store. Every record is processed inside
//! the single open transaction of a [`TransactionContext`], so a record's
//! state changes become visible atomically on commit or not at all.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::StoreError;

/// Namespace of a stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ColumnFamily {
    KeyGenerator,
    LastProcessedPosition,
    Blacklist,
    /// Reserved for processor and event applier state.
    Custom(u16),
}

impl ColumnFamily {
    const CUSTOM_OFFSET: u32 = 16;

    /// Stable numeric id, suitable as a storage prefix.
    pub fn id(self) -> u32 {
        match self {
            Self::KeyGenerator => 0,
            Self::LastProcessedPosition => 1,
            Self::Blacklist => 2,
            Self::Custom(id) => Self::CUSTOM_OFFSET + u32::from(id),
        }
    }
}

pub trait Transaction: Send {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    fn put(&mut self, cf: ColumnFamily, key: &[u8], value: Bytes) -> Result<(), StoreError>;

    fn delete(&mut self, cf: ColumnFamily, key: &[u8]) -> Result<(), StoreError>;

    /// Makes all writes since the last commit or rollback durable. A failed
    /// commit leaves the writes pending so that it can be retried.
    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Owner of the single open transaction of a stream processor.
pub trait TransactionContext: Send {
    fn current_transaction(&mut self) -> &mut dyn Transaction;
}

pub trait Database: Send + Sync {
    fn create_context(&self) -> Box<dyn TransactionContext>;
}

/// Runs `op` in the current transaction, committing on success and rolling
/// back when either `op` or the commit fails.
///
/// If the rollback fails too, the writes of `op` stay pending. Callers that
/// retry on error must roll back before the next attempt.
pub fn run_in_transaction<T, E>(
    context: &mut dyn TransactionContext,
    op: impl FnOnce(&mut dyn Transaction) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<StoreError>,
{
    let transaction = context.current_transaction();
    let result = op(&mut *transaction).and_then(|value| {
        transaction.commit()?;
        Ok(value)
    });
    if result.is_err() {
        if let Err(rollback_error) = transaction.rollback() {
            tracing::warn!(error = %rollback_error, "failed to roll back transaction, writes are still pending");
        }
    }
    result
}

// ============================================================================
// Typed Access
// ============================================================================

pub fn get_value<T: DeserializeOwned>(
    transaction: &dyn Transaction,
    cf: ColumnFamily,
    key: &[u8],
) -> Result<Option<T>, StoreError> {
    transaction
        .get(cf, key)?
        .map(|bytes| postcard::from_bytes(&bytes).map_err(StoreError::from))
        .transpose()
}

pub fn put_value<T: Serialize>(
    transaction: &mut dyn Transaction,
    cf: ColumnFamily,
    key: &[u8],
    value: &T,
) -> Result<(), StoreError> {
    let bytes = postcard::to_allocvec(value)?;
    transaction.put(cf, key, Bytes::from(bytes))
}
