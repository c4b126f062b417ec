//! Resources shared by the processing and reprocessing state machines.

use std::sync::Arc;

use strand_config::EngineConfig;
use strand_types::{PartitionId, Position};
use tokio::sync::watch;

use crate::db::TransactionContext;
use crate::log::LogStreamReader;
use crate::metrics::ProcessingMetrics;
use crate::processor::{RecordProcessorMap, StreamProcessorListener};
use crate::record::MigratedValueTypes;
use crate::response::TypedResponseWriter;
use crate::retry::AbortCondition;
use crate::state::{EngineState, EventApplier};
use crate::writer::{DisabledStreamWriter, TypedStreamWriter};

/// Everything a processing cycle needs.
///
/// Built once per stream processor. The only mutation after construction is
/// swapping the stream writer when switching from reprocessing to
/// processing.
pub struct ProcessingContext {
    pub(crate) partition_id: PartitionId,
    pub(crate) reader: Box<dyn LogStreamReader>,
    pub(crate) stream_writer: Box<dyn TypedStreamWriter>,
    pub(crate) response_writer: Box<dyn TypedResponseWriter>,
    pub(crate) transaction_context: Box<dyn TransactionContext>,
    pub(crate) state: EngineState,
    pub(crate) processors: Arc<RecordProcessorMap>,
    pub(crate) event_applier: Arc<dyn EventApplier>,
    pub(crate) listener: Option<Arc<dyn StreamProcessorListener>>,
    pub(crate) migrated: MigratedValueTypes,
    pub(crate) commit_position: watch::Receiver<Position>,
    pub(crate) abort: AbortCondition,
    pub(crate) metrics: Arc<ProcessingMetrics>,
}

impl ProcessingContext {
    /// Creates a context with a disabled stream writer.
    pub(crate) fn new(
        partition_id: PartitionId,
        reader: Box<dyn LogStreamReader>,
        response_writer: Box<dyn TypedResponseWriter>,
        transaction_context: Box<dyn TransactionContext>,
        state: EngineState,
        processors: Arc<RecordProcessorMap>,
        event_applier: Arc<dyn EventApplier>,
        commit_position: watch::Receiver<Position>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            partition_id,
            reader,
            stream_writer: Box::new(DisabledStreamWriter),
            response_writer,
            transaction_context,
            state,
            processors,
            event_applier,
            listener: None,
            migrated: MigratedValueTypes::new(config.migrated_value_types.iter().copied()),
            commit_position,
            abort: AbortCondition::new(),
            metrics: Arc::new(ProcessingMetrics::new()),
        }
    }

    pub(crate) fn with_listener(mut self, listener: Option<Arc<dyn StreamProcessorListener>>) -> Self {
        self.listener = listener;
        self
    }

    pub(crate) fn with_abort_condition(mut self, abort: AbortCondition) -> Self {
        self.abort = abort;
        self
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<ProcessingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn set_stream_writer(&mut self, writer: Box<dyn TypedStreamWriter>) {
        self.stream_writer = writer;
    }

    /// Current commit position of the log.
    pub fn commit_position(&self) -> Position {
        *self.commit_position.borrow()
    }
}
