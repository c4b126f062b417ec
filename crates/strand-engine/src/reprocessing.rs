//! Recovery of state after a restart.
//!
//! The snapshot in the state store reflects every record up to its last
//! processed position. Records after that position were processed before
//! the restart but their state changes were lost, so they are replayed
//! without writing anything to the log:
//!
//! 1. **Scan** from the snapshot to the end of the log. Collect the
//!    positions of failed records (from ERROR events), the highest source
//!    position, the highest follow-up position and the highest key.
//! 2. **Replay** up to the highest source or follow-up position. Failed
//!    records are blacklisted again, events of migrated value types are
//!    applied through the event applier, all other records run through
//!    their processor. What the processors append is compared with the
//!    follow-ups already in the log.
//! 3. **Restore** the key generator from the highest key seen.
//!
//! Live processing continues after the returned positions.

use std::collections::{BTreeMap, HashSet};

use strand_config::EngineConfig;
use strand_types::{ErrorRecord, Key, Position, RecordType, ValueType};

use crate::context::ProcessingContext;
use crate::db::{Transaction, run_in_transaction};
use crate::error::{EngineError, ProcessingError};
use crate::processor::{ProcessingScope, TypedRecordProcessor};
use crate::record::TypedRecord;
use crate::response::NoopResponseWriter;
use crate::retry::{AbortCondition, BackoffPolicy, RecoverableRetryStrategy};
use crate::side_effect::SideEffects;
use crate::writer::{ReprocessingStreamWriter, TypedStreamWriter};

/// Where live processing continues after recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastProcessingPositions {
    pub last_processed: Position,
    pub last_written: Position,
}

pub struct ReProcessingStateMachine {
    writer: ReprocessingStreamWriter,
    response_writer: NoopResponseWriter,
    side_effects: SideEffects,
    detect_inconsistency: bool,
    retry: RecoverableRetryStrategy,
    /// A failed attempt left writes in the transaction that are not rolled back yet.
    rollback_pending: bool,

    failed_positions: HashSet<Position>,
    /// Highest key of a migrated event per source position.
    migrated_keys_by_source: BTreeMap<Position, Key>,
    replayed_sources: HashSet<Position>,
    highest_key: Key,
    last_source_event_position: Position,
    last_follow_up_position: Position,
}

impl ReProcessingStateMachine {
    pub fn new(config: &EngineConfig, abort: AbortCondition) -> Self {
        Self {
            writer: ReprocessingStreamWriter::new(),
            response_writer: NoopResponseWriter,
            side_effects: SideEffects::new(),
            detect_inconsistency: config.detect_reprocessing_inconsistency,
            retry: RecoverableRetryStrategy::new(BackoffPolicy::from_config(config), abort),
            rollback_pending: false,
            failed_positions: HashSet::new(),
            migrated_keys_by_source: BTreeMap::new(),
            replayed_sources: HashSet::new(),
            highest_key: Key::UNSET,
            last_source_event_position: Position::UNSET,
            last_follow_up_position: Position::UNSET,
        }
    }

    /// Replays the log after `snapshot` and returns where live processing
    /// continues.
    pub async fn start_recover(
        &mut self,
        ctx: &mut ProcessingContext,
        snapshot: Position,
    ) -> Result<LastProcessingPositions, EngineError> {
        tracing::info!(partition_id = %ctx.partition_id, snapshot_position = %snapshot, "starting reprocessing");
        self.scan(ctx, snapshot)?;

        let positions = if !self.last_source_event_position.is_set()
            || self.last_source_event_position <= snapshot
        {
            tracing::info!(partition_id = %ctx.partition_id, "no records to reprocess");
            LastProcessingPositions {
                last_processed: snapshot,
                last_written: snapshot.max(self.last_follow_up_position),
            }
        } else {
            self.replay(ctx, snapshot).await?;
            if self.detect_inconsistency {
                self.verify_all_matched()?;
            }
            LastProcessingPositions {
                last_processed: snapshot.max(self.last_source_event_position),
                last_written: self.last_follow_up_position,
            }
        };

        self.restore_key_generator(ctx).await?;
        self.clear();
        tracing::info!(
            partition_id = %ctx.partition_id,
            last_processed_position = %positions.last_processed,
            last_written_position = %positions.last_written,
            "reprocessing finished"
        );
        Ok(positions)
    }

    fn scan(&mut self, ctx: &mut ProcessingContext, snapshot: Position) -> Result<(), EngineError> {
        ctx.reader.seek_to_next_event(snapshot);
        let mut previous = snapshot;

        while let Some(event) = ctx.reader.next() {
            if previous.is_set() && event.position <= previous {
                return Err(EngineError::NonIncreasingPosition {
                    previous,
                    current: event.position,
                });
            }
            previous = event.position;

            if event.record_type() == RecordType::Event && event.value_type() == ValueType::Error {
                let error: ErrorRecord = event.value.decode().map_err(|error| {
                    EngineError::Unrecoverable(format!(
                        "ERROR event at position {} cannot be decoded: {error}",
                        event.position
                    ))
                })?;
                self.failed_positions.insert(error.error_event_position);
            }

            if event.has_source() {
                let source = event.source_event_position;
                self.last_source_event_position = self.last_source_event_position.max(source);
                self.last_follow_up_position = self.last_follow_up_position.max(event.position);

                if event.record_type() == RecordType::Event
                    && ctx.migrated.contains(event.value_type())
                    && event.key.is_set()
                {
                    let highest = self.migrated_keys_by_source.entry(source).or_insert(event.key);
                    *highest = (*highest).max(event.key);
                }
            }

            if event.key.is_set() && event.key.partition_id() == ctx.partition_id {
                self.highest_key = self.highest_key.max(event.key);
            }
        }

        tracing::debug!(
            end_of_log = %ctx.reader.position(),
            last_source_event_position = %self.last_source_event_position,
            last_follow_up_position = %self.last_follow_up_position,
            failed_records = self.failed_positions.len(),
            "scanned log for reprocessing"
        );
        Ok(())
    }

    async fn replay(&mut self, ctx: &mut ProcessingContext, snapshot: Position) -> Result<(), EngineError> {
        let bound = self
            .last_source_event_position
            .max(self.last_follow_up_position);
        tracing::info!(
            from = %snapshot,
            to = %bound,
            "replaying records"
        );

        ctx.reader.seek_to_next_event(snapshot);
        while let Some(event) = ctx.reader.next() {
            if event.position > bound {
                break;
            }
            let record = TypedRecord::new(event);
            self.replay_record(ctx, &record, snapshot).await?;
        }
        Ok(())
    }

    async fn replay_record(
        &mut self,
        ctx: &mut ProcessingContext,
        record: &TypedRecord,
        snapshot: Position,
    ) -> Result<(), EngineError> {
        let source = record.source_event_position();
        if self.detect_inconsistency && source.is_set() && self.replayed_sources.contains(&source) {
            self.verify(record)?;
        }

        let position = record.position();
        let (record_type, value_type, intent) =
            (record.record_type(), record.value_type(), record.intent());
        let failed = self.failed_positions.contains(&position);
        if !failed && !ctx.migrated.accepts_for_replay(record_type, value_type) {
            return Ok(());
        }

        let migrated = ctx.migrated.contains(value_type);
        let apply_event = !failed && migrated && record_type == RecordType::Event && source > snapshot;
        let processor = if failed || migrated || position > self.last_source_event_position {
            None
        } else {
            ctx.processors.get(record_type, value_type, intent).cloned()
        };
        if !failed && !apply_event && processor.is_none() {
            return Ok(());
        }

        let retry = self.retry.clone();
        let mut replayed = false;
        let done = retry
            .run_with_retry(|| {
                let transaction = ctx.transaction_context.current_transaction();
                if !discard_failed_attempt(&mut self.rollback_pending, transaction) {
                    return Ok(false);
                }
                self.replay_in_transaction(ctx, record, processor.as_deref(), failed, apply_event)
                    .map(|processed| {
                        replayed = processed;
                        true
                    })
            })
            .await
            .map_err(|error| {
                EngineError::Unrecoverable(format!(
                    "failed to reprocess record at position {position}: {error}"
                ))
            })?;
        if !done {
            return Err(EngineError::Closed);
        }

        if replayed {
            self.replayed_sources.insert(position);
            self.migrated_keys_by_source = self.migrated_keys_by_source.split_off(&position);
        }
        ctx.metrics.increment_reprocessed();
        tracing::trace!(position = %position, record_type = %record_type, value_type = %value_type, "record reprocessed");
        Ok(())
    }

    /// Runs one replay step and commits it. Returns whether a processor ran.
    fn replay_in_transaction(
        &mut self,
        ctx: &mut ProcessingContext,
        record: &TypedRecord,
        processor: Option<&dyn TypedRecordProcessor>,
        failed: bool,
        apply_event: bool,
    ) -> Result<bool, ProcessingError> {
        self.writer.configure_source_context(record.position());
        self.writer.reset();
        self.side_effects.reset();

        let result = self.replay_steps(ctx, record, processor, failed, apply_event);
        let transaction = ctx.transaction_context.current_transaction();
        let result = result.and_then(|replayed| {
            transaction.commit()?;
            Ok(replayed)
        });
        if result.is_err() {
            self.rollback_pending = true;
            discard_failed_attempt(&mut self.rollback_pending, transaction);
            self.writer.reset();
        }
        result
    }

    fn replay_steps(
        &mut self,
        ctx: &mut ProcessingContext,
        record: &TypedRecord,
        processor: Option<&dyn TypedRecordProcessor>,
        failed: bool,
        apply_event: bool,
    ) -> Result<bool, ProcessingError> {
        let position = record.position();
        let transaction = ctx.transaction_context.current_transaction();
        let mut replayed = false;

        if failed {
            let key = ctx.state.blacklist.try_to_blacklist(transaction, record)?;
            tracing::debug!(position = %position, key = %key, "blacklisted failed record");
        } else if ctx.state.blacklist.is_on_blacklist(transaction, record)? {
            tracing::debug!(position = %position, key = %record.key(), "entity is blacklisted, record not reprocessed");
        } else if apply_event {
            ctx.event_applier.apply_state(
                transaction,
                record.key(),
                record.value_type(),
                record.intent(),
                record.value(),
            )?;
        } else if let Some(processor) = processor {
            // Keys handed out by migrated processors are only visible in the
            // log, so the generator must catch up before the legacy
            // processor generates its own.
            if let Some(key) = self.migrated_keys_by_source.range(..position).map(|(_, key)| *key).max() {
                ctx.state.key_generator.set_key_if_higher(transaction, key)?;
            }
            let mut scope = ProcessingScope::new(
                position,
                &mut *transaction,
                &ctx.state,
                &mut self.writer,
                &mut self.response_writer,
                &mut self.side_effects,
                None,
                &ctx.migrated,
            );
            processor.process_record(record, &mut scope)?;
            replayed = true;
        }

        ctx.state
            .last_processed
            .mark_as_processed(transaction, position)?;
        Ok(replayed)
    }

    fn verify(&mut self, record: &TypedRecord) -> Result<(), EngineError> {
        let source = record.source_event_position();
        let reason = match self.writer.take_next(source) {
            Some(expected)
                if expected.key == record.key()
                    && expected.intent == record.intent()
                    && expected.record_type == record.record_type() =>
            {
                return Ok(());
            }
            Some(expected) => format!(
                "expected {} {} {} with key {}, but the log contains {} {} {} with key {} at position {}",
                expected.record_type,
                expected.value_type,
                expected.intent,
                expected.key,
                record.record_type(),
                record.value_type(),
                record.intent(),
                record.key(),
                record.position()
            ),
            None => format!(
                "the log contains {} {} {} with key {} at position {}, which was not produced again",
                record.record_type(),
                record.value_type(),
                record.intent(),
                record.key(),
                record.position()
            ),
        };
        tracing::error!(source_position = %source, reason = %reason, "reprocessing is inconsistent with the log");
        Err(EngineError::InconsistentReprocessing {
            source_position: source,
            reason,
        })
    }

    fn verify_all_matched(&self) -> Result<(), EngineError> {
        let Some((source, record)) = self.writer.first_unmatched() else {
            return Ok(());
        };
        let reason = format!(
            "reprocessing produced {} {} {} with key {}, which is missing in the log",
            record.record_type, record.value_type, record.intent, record.key
        );
        tracing::error!(source_position = %source, reason = %reason, "reprocessing is inconsistent with the log");
        Err(EngineError::InconsistentReprocessing {
            source_position: source,
            reason,
        })
    }

    async fn restore_key_generator(&mut self, ctx: &mut ProcessingContext) -> Result<(), EngineError> {
        let highest = self.highest_key;
        let state = &ctx.state;
        let transaction_context = &mut ctx.transaction_context;
        let rollback_pending = &mut self.rollback_pending;
        let restored = self
            .retry
            .run_with_retry(|| {
                if !discard_failed_attempt(rollback_pending, transaction_context.current_transaction()) {
                    return Ok(false);
                }
                let result = run_in_transaction(transaction_context.as_mut(), |transaction| {
                    state.key_generator.set_key_if_higher(transaction, highest)
                });
                // the rollback inside may have failed as well
                *rollback_pending = result.is_err();
                result.map(|()| true)
            })
            .await?;
        if restored {
            Ok(())
        } else {
            Err(EngineError::Closed)
        }
    }

    fn clear(&mut self) {
        self.writer.clear();
        self.side_effects.reset();
        self.failed_positions.clear();
        self.migrated_keys_by_source.clear();
        self.replayed_sources.clear();
        self.highest_key = Key::UNSET;
        self.last_source_event_position = Position::UNSET;
        self.last_follow_up_position = Position::UNSET;
    }
}

/// Rolls back the writes a failed attempt left behind.
///
/// Returns `false` while the rollback itself fails. The flag stays set so the
/// next attempt rolls back again before anything runs on top of those writes.
fn discard_failed_attempt(rollback_pending: &mut bool, transaction: &mut dyn Transaction) -> bool {
    if !*rollback_pending {
        return true;
    }
    match transaction.rollback() {
        Ok(()) => {
            *rollback_pending = false;
            true
        }
        Err(error) => {
            tracing::warn!(error = %error, "failed to roll back reprocessing transaction, retrying");
            false
        }
    }
}
