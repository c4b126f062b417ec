//! In-memory collaborators for testing and development.
//!
//! Not suitable for production: nothing survives the process. Clones share
//! their contents, so a log or database can be handed to a stream processor
//! and inspected (or reused after a restart) by the test.

use std::collections::BTreeMap;
use std::future::{Future, ready};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use strand_types::{
    Intent, Key, LoggedEvent, PartitionId, Position, RecordMetadata, RecordValue, RequestMetadata,
    ValueType,
};
use tokio::sync::watch;

use crate::db::{ColumnFamily, Database, Transaction, TransactionContext};
use crate::error::{LogError, StoreError};
use crate::lock;
use crate::log::{LogAppendEntry, LogStream, LogStreamReader, LogStreamWriter};
use crate::response::{CommandResponse, CommandResponseWriter};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

// ============================================================================
// Log
// ============================================================================

#[derive(Debug)]
struct LogInner {
    records: Vec<LoggedEvent>,
    /// Number of leading records visible to readers.
    committed: usize,
    commit_position: Position,
    auto_commit: bool,
    failing_writes: u32,
    rejected_writes: u32,
}

impl LogInner {
    fn last_position(&self) -> Position {
        self.records
            .last()
            .map_or(Position::UNSET, |record| record.position)
    }

    fn next_position(&self) -> Position {
        let last = self.last_position();
        Position::new(if last.is_set() { last.as_i64() + 1 } else { 1 })
    }

    fn commit(&mut self, position: Position, sender: &watch::Sender<Position>) {
        if position < self.commit_position {
            return;
        }
        self.committed = self
            .records
            .iter()
            .take_while(|record| record.position <= position)
            .count();
        if position > self.commit_position {
            self.commit_position = position;
            sender.send_replace(position);
        }
    }

    fn push(&mut self, event: LoggedEvent, sender: &watch::Sender<Position>) -> Position {
        let position = event.position;
        self.records.push(event);
        self.commit_if_auto(position, sender);
        position
    }

    fn commit_if_auto(&mut self, position: Position, sender: &watch::Sender<Position>) {
        if self.auto_commit {
            self.commit(position, sender);
        }
    }
}

/// A single log partition kept in memory.
///
/// Positions start at 1 and increase by one per record. Writes are committed
/// immediately unless the log was created with
/// [`with_manual_commit`](Self::with_manual_commit).
#[derive(Debug, Clone)]
pub struct InMemoryLogStream {
    partition_id: PartitionId,
    inner: Arc<Mutex<LogInner>>,
    commit_sender: Arc<watch::Sender<Position>>,
}

impl InMemoryLogStream {
    pub fn new(partition_id: PartitionId) -> Self {
        let (commit_sender, _) = watch::channel(Position::UNSET);
        Self {
            partition_id,
            inner: Arc::new(Mutex::new(LogInner {
                records: Vec::new(),
                committed: 0,
                commit_position: Position::UNSET,
                auto_commit: true,
                failing_writes: 0,
                rejected_writes: 0,
            })),
            commit_sender: Arc::new(commit_sender),
        }
    }

    /// Writes stay invisible to readers until [`commit`](Self::commit).
    pub fn with_manual_commit(self) -> Self {
        lock(&self.inner).auto_commit = false;
        self
    }

    pub fn commit(&self, position: Position) {
        lock(&self.inner).commit(position, &self.commit_sender);
    }

    pub fn commit_all(&self) {
        let mut inner = lock(&self.inner);
        let last = inner.last_position();
        inner.commit(last, &self.commit_sender);
    }

    /// Appends a client command, as the gateway would.
    pub fn append_command(
        &self,
        value_type: ValueType,
        intent: Intent,
        key: Key,
        value: RecordValue,
        request: Option<RequestMetadata>,
    ) -> Position {
        let mut metadata = RecordMetadata::command(value_type, intent);
        metadata.request = request;
        self.append_record(key, metadata, value, Position::UNSET)
    }

    pub fn append_record(
        &self,
        key: Key,
        metadata: RecordMetadata,
        value: RecordValue,
        source_event_position: Position,
    ) -> Position {
        let mut inner = lock(&self.inner);
        let event = LoggedEvent {
            position: inner.next_position(),
            source_event_position,
            key,
            timestamp: now_millis(),
            metadata,
            value,
        };
        inner.push(event, &self.commit_sender)
    }

    /// Appends `event` with the position it carries. Used to build logs that
    /// a writer would never produce.
    pub fn append_raw(&self, event: LoggedEvent) -> Position {
        lock(&self.inner).push(event, &self.commit_sender)
    }

    /// The next `count` writes fail with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        lock(&self.inner).failing_writes = count;
    }

    /// The next `count` writes are rejected permanently.
    pub fn reject_next_writes(&self, count: u32) {
        lock(&self.inner).rejected_writes = count;
    }

    /// All records, committed or not.
    pub fn records(&self) -> Vec<LoggedEvent> {
        lock(&self.inner).records.clone()
    }

    pub fn last_position(&self) -> Position {
        lock(&self.inner).last_position()
    }
}

impl LogStream for InMemoryLogStream {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn new_reader(
        &self,
    ) -> impl Future<Output = Result<Box<dyn LogStreamReader>, LogError>> + Send {
        let reader: Box<dyn LogStreamReader> = Box::new(InMemoryLogReader {
            inner: Arc::clone(&self.inner),
            next_index: 0,
            position: Position::UNSET,
        });
        ready(Ok(reader))
    }

    fn new_writer(
        &self,
    ) -> impl Future<Output = Result<Box<dyn LogStreamWriter>, LogError>> + Send {
        let writer: Box<dyn LogStreamWriter> = Box::new(InMemoryLogWriter {
            inner: Arc::clone(&self.inner),
            commit_sender: Arc::clone(&self.commit_sender),
        });
        ready(Ok(writer))
    }

    fn commit_position(&self) -> Position {
        lock(&self.inner).commit_position
    }

    fn subscribe_commit_position(&self) -> watch::Receiver<Position> {
        self.commit_sender.subscribe()
    }
}

struct InMemoryLogReader {
    inner: Arc<Mutex<LogInner>>,
    next_index: usize,
    position: Position,
}

impl LogStreamReader for InMemoryLogReader {
    fn has_next(&mut self) -> bool {
        self.next_index < lock(&self.inner).committed
    }

    fn next(&mut self) -> Option<LoggedEvent> {
        let inner = lock(&self.inner);
        if self.next_index >= inner.committed {
            return None;
        }
        let event = inner.records[self.next_index].clone();
        self.next_index += 1;
        self.position = event.position;
        Some(event)
    }

    fn seek(&mut self, position: Position) -> bool {
        let inner = lock(&self.inner);
        match inner.records[..inner.committed]
            .iter()
            .position(|record| record.position == position)
        {
            Some(index) => {
                self.next_index = index;
                true
            }
            None => false,
        }
    }

    fn seek_to_next_event(&mut self, position: Position) -> bool {
        if !position.is_set() {
            self.seek_to_first_event();
            return true;
        }
        let inner = lock(&self.inner);
        let committed = &inner.records[..inner.committed];
        self.next_index = committed
            .iter()
            .position(|record| record.position > position)
            .unwrap_or(committed.len());
        self.position = position;
        committed.iter().any(|record| record.position == position)
    }

    fn seek_to_first_event(&mut self) {
        self.next_index = 0;
        self.position = Position::UNSET;
    }

    fn position(&self) -> Position {
        self.position
    }
}

struct InMemoryLogWriter {
    inner: Arc<Mutex<LogInner>>,
    commit_sender: Arc<watch::Sender<Position>>,
}

impl LogStreamWriter for InMemoryLogWriter {
    fn try_write(
        &mut self,
        entries: &[LogAppendEntry],
        source_position: Position,
    ) -> Result<Position, LogError> {
        let mut inner = lock(&self.inner);
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(LogError::Unavailable("injected write failure".to_string()));
        }
        if inner.rejected_writes > 0 {
            inner.rejected_writes -= 1;
            return Err(LogError::Rejected("injected write rejection".to_string()));
        }

        let timestamp = now_millis();
        let mut last = Position::UNSET;
        for entry in entries {
            last = inner.next_position();
            inner.records.push(LoggedEvent {
                position: last,
                source_event_position: source_position,
                key: entry.key,
                timestamp,
                metadata: entry.metadata.clone(),
                value: entry.value.clone(),
            });
        }
        // the batch becomes visible at once
        if last.is_set() {
            inner.commit_if_auto(last, &self.commit_sender);
        }
        Ok(last)
    }
}

// ============================================================================
// Database
// ============================================================================

type StoreKey = (u32, Vec<u8>);

#[derive(Debug, Default)]
struct DatabaseInner {
    data: BTreeMap<StoreKey, Bytes>,
    failing_commits: u32,
    failing_rollbacks: u32,
    commits: u64,
}

/// A transactional key-value store kept in memory.
///
/// Contexts created from clones of the same database see each other's
/// committed writes, which makes it usable across simulated restarts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    inner: Arc<Mutex<DatabaseInner>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` commits fail with a transient error.
    pub fn fail_next_commits(&self, count: u32) {
        lock(&self.inner).failing_commits = count;
    }

    /// The next `count` rollbacks fail with a transient error.
    pub fn fail_next_rollbacks(&self, count: u32) {
        lock(&self.inner).failing_rollbacks = count;
    }

    pub fn commit_count(&self) -> u64 {
        lock(&self.inner).commits
    }

    /// Reads a committed value.
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<Bytes> {
        lock(&self.inner).data.get(&(cf.id(), key.to_vec())).cloned()
    }
}

impl Database for InMemoryDatabase {
    fn create_context(&self) -> Box<dyn TransactionContext> {
        Box::new(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            pending: BTreeMap::new(),
        })
    }
}

/// Buffers writes until commit. `None` marks a delete.
struct InMemoryTransaction {
    inner: Arc<Mutex<DatabaseInner>>,
    pending: BTreeMap<StoreKey, Option<Bytes>>,
}

impl TransactionContext for InMemoryTransaction {
    fn current_transaction(&mut self) -> &mut dyn Transaction {
        self
    }
}

impl Transaction for InMemoryTransaction {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let store_key = (cf.id(), key.to_vec());
        if let Some(pending) = self.pending.get(&store_key) {
            return Ok(pending.clone());
        }
        Ok(lock(&self.inner).data.get(&store_key).cloned())
    }

    fn put(&mut self, cf: ColumnFamily, key: &[u8], value: Bytes) -> Result<(), StoreError> {
        self.pending.insert((cf.id(), key.to_vec()), Some(value));
        Ok(())
    }

    fn delete(&mut self, cf: ColumnFamily, key: &[u8]) -> Result<(), StoreError> {
        self.pending.insert((cf.id(), key.to_vec()), None);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        if inner.failing_commits > 0 {
            inner.failing_commits -= 1;
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        for (key, value) in std::mem::take(&mut self.pending) {
            match value {
                Some(value) => {
                    inner.data.insert(key, value);
                }
                None => {
                    inner.data.remove(&key);
                }
            }
        }
        inner.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        if inner.failing_rollbacks > 0 {
            inner.failing_rollbacks -= 1;
            return Err(StoreError::Unavailable("injected rollback failure".to_string()));
        }
        self.pending.clear();
        Ok(())
    }
}

// ============================================================================
// Network
// ============================================================================

/// A response as it reached the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedResponse {
    pub request_stream_id: i32,
    pub request_id: i64,
    pub response: CommandResponse,
}

#[derive(Debug, Default)]
struct RecordingInner {
    responses: Vec<RecordedResponse>,
    failing: u32,
}

/// Collects every response instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingResponseWriter {
    inner: Mutex<RecordingInner>,
}

impl RecordingResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` sends fail.
    pub fn fail_next(&self, count: u32) {
        lock(&self.inner).failing = count;
    }

    pub fn responses(&self) -> Vec<RecordedResponse> {
        lock(&self.inner).responses.clone()
    }
}

impl CommandResponseWriter for RecordingResponseWriter {
    fn try_write_response(
        &self,
        request_stream_id: i32,
        request_id: i64,
        response: &CommandResponse,
    ) -> bool {
        let mut inner = lock(&self.inner);
        if inner.failing > 0 {
            inner.failing -= 1;
            return false;
        }
        inner.responses.push(RecordedResponse {
            request_stream_id,
            request_id,
            response: response.clone(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_value, put_value, run_in_transaction};

    #[tokio::test]
    async fn reader_sees_only_committed_records() {
        let log = InMemoryLogStream::new(PartitionId::new(1)).with_manual_commit();
        let mut reader = log.new_reader().await.unwrap();
        log.append_command(ValueType::Job, Intent::new(0), Key::UNSET, RecordValue::empty(), None);
        log.append_command(ValueType::Job, Intent::new(0), Key::UNSET, RecordValue::empty(), None);

        assert!(!reader.has_next());

        log.commit(Position::new(1));
        assert_eq!(reader.next().map(|r| r.position), Some(Position::new(1)));
        assert!(reader.next().is_none());

        log.commit_all();
        assert_eq!(reader.next().map(|r| r.position), Some(Position::new(2)));
        assert_eq!(log.commit_position(), Position::new(2));
    }

    #[tokio::test]
    async fn commit_position_is_published() {
        let log = InMemoryLogStream::new(PartitionId::new(1));
        let receiver = log.subscribe_commit_position();

        log.append_command(ValueType::Job, Intent::new(0), Key::UNSET, RecordValue::empty(), None);

        assert_eq!(*receiver.borrow(), Position::new(1));
    }

    #[tokio::test]
    async fn seek_to_next_event() {
        let log = InMemoryLogStream::new(PartitionId::new(1));
        for _ in 0..3 {
            log.append_command(ValueType::Job, Intent::new(0), Key::UNSET, RecordValue::empty(), None);
        }
        let mut reader = log.new_reader().await.unwrap();

        assert!(reader.seek_to_next_event(Position::new(2)));
        assert_eq!(reader.next().map(|r| r.position), Some(Position::new(3)));

        assert!(!reader.seek_to_next_event(Position::new(9)));
        assert!(!reader.has_next());

        assert!(reader.seek_to_next_event(Position::UNSET));
        assert_eq!(reader.next().map(|r| r.position), Some(Position::new(1)));

        assert!(reader.seek(Position::new(2)));
        assert_eq!(reader.next().map(|r| r.position), Some(Position::new(2)));
        assert!(!reader.seek(Position::new(7)));
    }

    #[tokio::test]
    async fn writer_assigns_consecutive_positions_and_source() {
        let log = InMemoryLogStream::new(PartitionId::new(1));
        log.append_command(ValueType::Job, Intent::new(0), Key::UNSET, RecordValue::empty(), None);
        let mut writer = log.new_writer().await.unwrap();
        let entry = LogAppendEntry {
            key: Key::new(3),
            metadata: RecordMetadata::event(ValueType::Job, Intent::new(1)),
            value: RecordValue::empty(),
        };

        let last = writer.try_write(&[entry.clone(), entry], Position::new(1)).unwrap();

        assert_eq!(last, Position::new(3));
        let records = log.records();
        assert_eq!(records[1].position, Position::new(2));
        assert_eq!(records[2].source_event_position, Position::new(1));
    }

    #[tokio::test]
    async fn injected_write_failures() {
        let log = InMemoryLogStream::new(PartitionId::new(1));
        let mut writer = log.new_writer().await.unwrap();
        let entry = LogAppendEntry {
            key: Key::new(3),
            metadata: RecordMetadata::event(ValueType::Job, Intent::new(1)),
            value: RecordValue::empty(),
        };
        log.fail_next_writes(1);
        log.reject_next_writes(1);

        assert!(matches!(writer.try_write(std::slice::from_ref(&entry), Position::UNSET), Err(LogError::Unavailable(_))));
        assert!(matches!(writer.try_write(std::slice::from_ref(&entry), Position::UNSET), Err(LogError::Rejected(_))));
        assert!(writer.try_write(&[entry], Position::UNSET).is_ok());
        assert_eq!(log.records().len(), 1);
    }

    #[tokio::test]
    async fn reader_position_follows_the_last_record_read() {
        let log = InMemoryLogStream::new(PartitionId::new(1));
        for _ in 0..3 {
            log.append_command(ValueType::Job, Intent::new(0), Key::UNSET, RecordValue::empty(), None);
        }
        let mut reader = log.new_reader().await.unwrap();
        assert_eq!(reader.position(), Position::UNSET);

        while reader.next().is_some() {}
        assert_eq!(reader.position(), Position::new(3));

        assert!(reader.seek_to_next_event(Position::new(1)));
        assert_eq!(reader.position(), Position::new(1));
        assert_eq!(reader.next().map(|r| r.position), Some(Position::new(2)));
        assert_eq!(reader.position(), Position::new(2));

        reader.seek_to_first_event();
        assert_eq!(reader.position(), Position::UNSET);
    }

    #[test]
    fn transaction_isolates_pending_writes() {
        let db = InMemoryDatabase::new();
        let mut writer = db.create_context();
        let mut other = db.create_context();

        put_value(writer.current_transaction(), ColumnFamily::Custom(1), b"k", &7u32).unwrap();
        let seen: Option<u32> = get_value(other.current_transaction(), ColumnFamily::Custom(1), b"k").unwrap();
        assert_eq!(seen, None);

        writer.current_transaction().commit().unwrap();
        let seen: Option<u32> = get_value(other.current_transaction(), ColumnFamily::Custom(1), b"k").unwrap();
        assert_eq!(seen, Some(7));
        assert_eq!(db.commit_count(), 1);
    }

    #[test]
    fn failed_commit_keeps_writes_pending() {
        let db = InMemoryDatabase::new();
        let mut context = db.create_context();
        db.fail_next_commits(1);

        context
            .current_transaction()
            .delete(ColumnFamily::Blacklist, b"x")
            .unwrap();
        context
            .current_transaction()
            .put(ColumnFamily::Blacklist, b"y", Bytes::new())
            .unwrap();

        assert!(context.current_transaction().commit().is_err());
        assert!(db.get(ColumnFamily::Blacklist, b"y").is_none());
        context.current_transaction().commit().unwrap();
        assert!(db.get(ColumnFamily::Blacklist, b"y").is_some());
    }

    #[test]
    fn rollback_discards_pending_writes() {
        let db = InMemoryDatabase::new();
        let mut context = db.create_context();

        context
            .current_transaction()
            .put(ColumnFamily::Blacklist, b"y", Bytes::new())
            .unwrap();
        context.current_transaction().rollback().unwrap();
        context.current_transaction().commit().unwrap();

        assert!(db.get(ColumnFamily::Blacklist, b"y").is_none());
    }

    #[test]
    fn run_in_transaction_rolls_back_a_failed_commit() {
        let db = InMemoryDatabase::new();
        let mut context = db.create_context();
        db.fail_next_commits(1);

        let result: Result<(), StoreError> = run_in_transaction(context.as_mut(), |transaction| {
            put_value(transaction, ColumnFamily::Custom(1), b"k", &1u32)
        });
        assert!(result.is_err());

        context.current_transaction().commit().unwrap();
        assert!(db.get(ColumnFamily::Custom(1), b"k").is_none());
    }
}
