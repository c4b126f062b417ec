//! Live processing of records.
//!
//! One call to [`ProcessingStateMachine::try_process_next`] handles one
//! record end to end:
//!
//! ```text
//! read -> filter -> dispatch -> apply in transaction -> write -> commit -> side effects
//!                         \                  \             \
//!                          +------ error path (rollback, reject, blacklist, ERROR event)
//! ```
//!
//! The record's state changes, its follow-up records and its position in
//! the last-processed-position state are committed together. If anything
//! fails before the commit, the transaction is rolled back and nothing of
//! the record remains.
//!
//! ## Failure handling
//!
//! - [`ProcessingError::Failed`] and write failures take the error path: a
//!   new transaction rejects the command, blacklists its entity and appends
//!   an ERROR event. Processing then continues with the next record, once the
//!   ERROR event is committed in the log.
//! - [`ProcessingError::Recoverable`] rolls back and asks the caller to retry
//!   the same record after the configured delay.
//! - [`ProcessingError::Unrecoverable`] rolls back and fails the caller.

use std::time::{Duration, Instant};

use strand_config::EngineConfig;
use strand_types::{
    ErrorIntent, ErrorRecord, Position, RecordType, RecordValue, RejectionType, ValueType,
};

use crate::context::ProcessingContext;
use crate::error::{EngineError, ProcessingError};
use crate::processor::{ProcessingScope, TypedRecordProcessor};
use crate::record::TypedRecord;
use crate::reprocessing::LastProcessingPositions;
use crate::retry::{AbortCondition, AbortableRetryStrategy, BackoffPolicy, EndlessRetryStrategy};
use crate::side_effect::SideEffects;

/// Error path runs without a successful record in between after which the
/// processor no longer counts as making progress.
pub const MAX_ERROR_RETRIES: u32 = 2;

/// Outcome of one [`ProcessingStateMachine::try_process_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingProgress {
    /// A record was processed and committed (possibly through the error path).
    Processed,
    /// A record was read but has no processor or is filtered out.
    Skipped,
    /// Nothing to do right now.
    Idle,
    /// The record failed recoverably and must be retried after the delay.
    RetryScheduled(Duration),
}

enum WriteFailure {
    Closed,
    Failed(String),
}

pub struct ProcessingStateMachine {
    record: Option<TypedRecord>,
    retry_pending: bool,
    side_effects: SideEffects,

    last_successful_processed_position: Position,
    last_written_position: Position,
    written_position: Position,

    in_error_handling: bool,
    error_record_position: Position,
    on_error_retries: u32,
    last_record_type: Option<RecordType>,

    processing_retry_delay: Duration,
    backoff: BackoffPolicy,
    write_retry: AbortableRetryStrategy,
    side_effect_retry: AbortableRetryStrategy,
    update_retry: EndlessRetryStrategy,
}

impl ProcessingStateMachine {
    pub fn new(config: &EngineConfig, abort: AbortCondition) -> Self {
        let backoff = BackoffPolicy::from_config(config);
        Self {
            record: None,
            retry_pending: false,
            side_effects: SideEffects::new(),
            last_successful_processed_position: Position::UNSET,
            last_written_position: Position::UNSET,
            written_position: Position::UNSET,
            in_error_handling: false,
            error_record_position: Position::UNSET,
            on_error_retries: 0,
            last_record_type: None,
            processing_retry_delay: config.processing_retry_delay(),
            backoff,
            write_retry: AbortableRetryStrategy::new(backoff, abort.clone()),
            side_effect_retry: AbortableRetryStrategy::new(backoff, abort.clone())
                .with_max_attempts(config.side_effect_attempt_limit()),
            update_retry: EndlessRetryStrategy::new(backoff, abort),
        }
    }

    /// Continues after the positions recovered by reprocessing.
    pub fn start_processing(&mut self, ctx: &mut ProcessingContext, positions: LastProcessingPositions) {
        self.last_successful_processed_position = positions.last_processed;
        self.last_written_position = positions.last_written;
        ctx.metrics
            .set_positions(positions.last_processed, positions.last_written);
        ctx.reader.seek_to_next_event(positions.last_processed);
        tracing::info!(
            partition_id = %ctx.partition_id,
            last_processed_position = %positions.last_processed,
            last_written_position = %positions.last_written,
            "processing started"
        );
    }

    pub fn last_successful_processed_position(&self) -> Position {
        self.last_successful_processed_position
    }

    pub fn last_written_position(&self) -> Position {
        self.last_written_position
    }

    pub fn is_making_progress(&self) -> bool {
        self.on_error_retries < MAX_ERROR_RETRIES
    }

    pub fn has_pending_retry(&self) -> bool {
        self.retry_pending
    }

    /// True if a new record may be read. While an ERROR event is not yet
    /// committed in the log, no new record is admitted.
    pub fn can_read_next(&mut self, ctx: &mut ProcessingContext) -> bool {
        if self.in_error_handling {
            if ctx.commit_position() < self.error_record_position {
                return false;
            }
            self.in_error_handling = false;
        }
        ctx.reader.has_next()
    }

    /// True if everything in the log was handled: the last record was not a
    /// command with follow-ups still to be read, there is no next record and
    /// everything written is committed.
    pub fn has_reached_end(&mut self, ctx: &mut ProcessingContext) -> bool {
        let follow_ups_pending =
            self.last_record_type == Some(RecordType::Command) && self.written_position.is_set();
        !self.retry_pending
            && !follow_ups_pending
            && !ctx.reader.has_next()
            && ctx.commit_position() >= self.last_written_position
    }

    /// Handles the next record, or retries the pending one.
    pub async fn try_process_next(
        &mut self,
        ctx: &mut ProcessingContext,
    ) -> Result<ProcessingProgress, EngineError> {
        let started = Instant::now();
        if !self.retry_pending {
            if !self.can_read_next(ctx) {
                return Ok(ProcessingProgress::Idle);
            }
            let Some(event) = ctx.reader.next() else {
                return Ok(ProcessingProgress::Idle);
            };
            match &mut self.record {
                Some(record) => record.wrap(event),
                None => self.record = Some(TypedRecord::new(event)),
            }
        }
        self.retry_pending = false;

        let Some(record) = self.record.take() else {
            return Ok(ProcessingProgress::Idle);
        };
        let result = self.process(ctx, &record, started).await;
        self.record = Some(record);
        result
    }

    async fn process(
        &mut self,
        ctx: &mut ProcessingContext,
        record: &TypedRecord,
        started: Instant,
    ) -> Result<ProcessingProgress, EngineError> {
        let (record_type, value_type, intent) =
            (record.record_type(), record.value_type(), record.intent());
        self.last_record_type = Some(record_type);
        self.written_position = Position::UNSET;

        if !ctx.migrated.accepts_for_processing(record_type, value_type) {
            return Ok(skip(ctx, record));
        }
        let Some(processor) = ctx.processors.get(record_type, value_type, intent).cloned() else {
            return Ok(skip(ctx, record));
        };

        match process_in_transaction(ctx, record, processor.as_ref(), &mut self.side_effects) {
            Ok(()) => match self.write_records(ctx).await {
                Ok(()) => {}
                Err(WriteFailure::Closed) => return Err(EngineError::Closed),
                Err(WriteFailure::Failed(message)) => self.on_error(ctx, record, message).await?,
            },
            Err(ProcessingError::Recoverable(message)) => {
                tracing::warn!(
                    position = %record.position(),
                    value_type = %value_type,
                    error = %message,
                    delay_ms = self.processing_retry_delay.as_millis(),
                    "recoverable failure, retrying record"
                );
                self.rollback(ctx).await?;
                ctx.metrics.increment_recoverable_retries();
                self.retry_pending = true;
                return Ok(ProcessingProgress::RetryScheduled(self.processing_retry_delay));
            }
            Err(ProcessingError::Unrecoverable(message)) => {
                tracing::error!(
                    position = %record.position(),
                    value_type = %value_type,
                    error = %message,
                    "unrecoverable failure while processing record"
                );
                ctx.metrics.increment_processing_errors();
                self.rollback(ctx).await?;
                return Err(EngineError::Unrecoverable(message));
            }
            Err(ProcessingError::Failed(message)) => self.on_error(ctx, record, message).await?,
        }

        self.commit(ctx, record.position()).await?;
        ctx.metrics.record_processing_latency(started.elapsed());
        self.execute_side_effects(ctx).await;

        ctx.metrics.increment_processed();
        if let Some(listener) = &ctx.listener {
            listener.on_processed(record);
        }
        self.on_error_retries = 0;
        ctx.metrics.set_error_retries(0);
        tracing::trace!(position = %record.position(), record_type = %record_type, value_type = %value_type, "record processed");
        Ok(ProcessingProgress::Processed)
    }

    /// Rolls back and replaces the record's output with a rejection, an
    /// ERROR event and a blacklist entry, then writes them. Re-enters itself
    /// until that succeeds or the processor is closed.
    async fn on_error(
        &mut self,
        ctx: &mut ProcessingContext,
        record: &TypedRecord,
        mut message: String,
    ) -> Result<(), EngineError> {
        loop {
            if ctx.abort.is_aborted() {
                return Err(EngineError::Closed);
            }
            self.on_error_retries += 1;
            ctx.metrics.increment_processing_errors();
            ctx.metrics.set_error_retries(self.on_error_retries);
            tracing::error!(
                position = %record.position(),
                record_type = %record.record_type(),
                value_type = %record.value_type(),
                intent = %record.intent(),
                error = %message,
                attempt = self.on_error_retries,
                "failed to process record"
            );
            if self.on_error_retries > 1 {
                tokio::time::sleep(self.backoff.delay_for_attempt(self.on_error_retries - 1)).await;
            }

            self.rollback(ctx).await?;
            self.written_position = Position::UNSET;
            if let Err(error) = write_error_records(ctx, record, &message, &mut self.side_effects) {
                message = error.to_string();
                continue;
            }

            self.in_error_handling = true;
            match self.write_records(ctx).await {
                Ok(()) => return Ok(()),
                Err(WriteFailure::Closed) => return Err(EngineError::Closed),
                Err(WriteFailure::Failed(error)) => message = error,
            }
        }
    }

    async fn write_records(&mut self, ctx: &mut ProcessingContext) -> Result<(), WriteFailure> {
        let mut written = Position::UNSET;
        let writer = &mut ctx.stream_writer;
        let result = self
            .write_retry
            .run_with_retry(|| match writer.flush() {
                Ok(position) => {
                    written = position;
                    Ok(true)
                }
                Err(error) if error.is_transient() => {
                    tracing::warn!(error = %error, "log unavailable, retrying write");
                    Ok(false)
                }
                Err(error) => Err(error),
            })
            .await;

        match result {
            Ok(true) => {
                if written.is_set() {
                    self.written_position = written;
                }
                Ok(())
            }
            Ok(false) if ctx.abort.is_aborted() => Err(WriteFailure::Closed),
            Ok(false) => Err(WriteFailure::Failed("failed to write follow-up records".to_string())),
            Err(error) => Err(WriteFailure::Failed(error.to_string())),
        }
    }

    async fn commit(&mut self, ctx: &mut ProcessingContext, position: Position) -> Result<(), EngineError> {
        let transaction_context = &mut ctx.transaction_context;
        let committed = self
            .update_retry
            .run_with_retry(|| {
                transaction_context
                    .current_transaction()
                    .commit()
                    .map(|()| true)
            })
            .await;
        if !committed {
            return Err(EngineError::Closed);
        }

        self.last_successful_processed_position = position;
        if self.written_position.is_set() {
            self.last_written_position = self.written_position;
        }
        if self.in_error_handling {
            self.error_record_position = self.written_position;
        }
        ctx.metrics
            .set_positions(position, self.last_written_position);
        Ok(())
    }

    async fn rollback(&mut self, ctx: &mut ProcessingContext) -> Result<(), EngineError> {
        let transaction_context = &mut ctx.transaction_context;
        let rolled_back = self
            .update_retry
            .run_with_retry(|| {
                transaction_context
                    .current_transaction()
                    .rollback()
                    .map(|()| true)
            })
            .await;
        if rolled_back {
            Ok(())
        } else {
            Err(EngineError::Closed)
        }
    }

    async fn execute_side_effects(&mut self, ctx: &mut ProcessingContext) {
        let side_effects = &mut self.side_effects;
        let response_writer = &mut ctx.response_writer;
        let Ok(done) = self
            .side_effect_retry
            .run_with_retry(|| {
                Ok::<_, std::convert::Infallible>(side_effects.flush(response_writer.as_mut()))
            })
            .await;

        if !done && !ctx.abort.is_aborted() {
            ctx.metrics.increment_side_effect_failures();
            tracing::error!(
                pending = self.side_effects.len(),
                "side effects could not be executed"
            );
        }
    }
}

fn skip(ctx: &ProcessingContext, record: &TypedRecord) -> ProcessingProgress {
    ctx.metrics.increment_skipped();
    if let Some(listener) = &ctx.listener {
        listener.on_skipped(record.event());
    }
    tracing::debug!(
        position = %record.position(),
        record_type = %record.record_type(),
        value_type = %record.value_type(),
        intent = %record.intent(),
        "skipping record"
    );
    ProcessingProgress::Skipped
}

fn process_in_transaction(
    ctx: &mut ProcessingContext,
    record: &TypedRecord,
    processor: &dyn TypedRecordProcessor,
    side_effects: &mut SideEffects,
) -> Result<(), ProcessingError> {
    let position = record.position();
    ctx.stream_writer.reset();
    ctx.stream_writer.configure_source_context(position);
    ctx.response_writer.reset();
    side_effects.reset();

    let transaction = ctx.transaction_context.current_transaction();
    if ctx.state.blacklist.is_on_blacklist(transaction, record)? {
        ctx.metrics.increment_blacklisted();
        tracing::debug!(position = %position, key = %record.key(), "entity is blacklisted, record not processed");
    } else {
        let mut scope = ProcessingScope::new(
            position,
            &mut *transaction,
            &ctx.state,
            ctx.stream_writer.as_mut(),
            ctx.response_writer.as_mut(),
            side_effects,
            Some(ctx.event_applier.as_ref()),
            &ctx.migrated,
        );
        processor.process_record(record, &mut scope)?;
    }
    ctx.state
        .last_processed
        .mark_as_processed(transaction, position)?;
    Ok(())
}

fn write_error_records(
    ctx: &mut ProcessingContext,
    record: &TypedRecord,
    message: &str,
    side_effects: &mut SideEffects,
) -> Result<(), ProcessingError> {
    let position = record.position();
    ctx.stream_writer.reset();
    ctx.stream_writer.configure_source_context(position);
    ctx.response_writer.reset();
    side_effects.reset();

    if record.record_type() == RecordType::Command {
        let reason = format!(
            "Expected to process command {} {} at position {} without errors, but failed: {}",
            record.value_type(),
            record.intent(),
            position,
            message
        );
        ctx.stream_writer
            .append_rejection(record, RejectionType::ProcessingError, &reason);
        ctx.response_writer
            .write_rejection_on_command(record, RejectionType::ProcessingError, &reason);
    }

    let transaction = ctx.transaction_context.current_transaction();
    let blacklisted = ctx.state.blacklist.try_to_blacklist(transaction, record)?;
    let error = ErrorRecord::new(position, message, blacklisted);
    ctx.stream_writer.append_follow_up_event(
        record.key(),
        ValueType::Error,
        ErrorIntent::CREATED,
        RecordValue::encode(&error)?,
    );
    ctx.state
        .last_processed
        .mark_as_processed(transaction, position)?;
    Ok(())
}
