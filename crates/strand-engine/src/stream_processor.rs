//! The stream processor of one partition.
//!
//! A single tokio task owns the processing context and both state machines.
//! It recovers state by reprocessing, then processes records as they are
//! committed in the log. A cloneable [`StreamProcessorHandle`] controls the
//! task through a channel and reads its phase, positions and health from
//! shared state.
//!
//! ```text
//!            open()
//!              |
//!              v
//!       +--------------+   error   +--------+
//!       | Reprocessing |---------->| Failed |
//!       +--------------+           +--------+
//!              |                       ^
//!              v                       | error
//!       +--------------+  pause   +--------+
//!       |  Processing  |<-------->| Paused |
//!       +--------------+  resume  +--------+
//! ```
//!
//! Control messages are only handled between two records, so a record in
//! flight (including a scheduled retry) always completes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strand_config::{EngineConfig, StrandConfig};
use strand_types::{PartitionId, Position};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::context::ProcessingContext;
use crate::db::Database;
use crate::error::EngineError;
use crate::lock;
use crate::log::LogStream;
use crate::metrics::{MetricsSnapshot, ProcessingMetrics};
use crate::processing::{MAX_ERROR_RETRIES, ProcessingProgress, ProcessingStateMachine};
use crate::processor::{
    RecordProcessorMap, StreamProcessorLifecycleAware, StreamProcessorListener,
    TypedRecordProcessors,
};
use crate::reprocessing::ReProcessingStateMachine;
use crate::response::{CommandResponseWriter, NoOpNetwork, ResponseWriter};
use crate::retry::AbortCondition;
use crate::state::{BlacklistKeyResolver, EngineState, EventApplier, NoopEventApplier, RecordKeyResolver};
use crate::writer::TypedStreamWriterImpl;

// ============================================================================
// Public Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Reprocessing,
    Processing,
    Paused,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reprocessing => "REPROCESSING",
            Self::Processing => "PROCESSING",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    Healthy,
    /// Running, but failed or not making progress.
    Unhealthy,
    /// Closed or failed for good.
    Dead,
}

/// Notified when the stream processor fails.
pub trait FailureListener: Send + Sync {
    fn on_failure(&self, error: &EngineError);

    fn on_unrecoverable_failure(&self, error: &EngineError);
}

#[derive(Debug)]
enum Control {
    Pause,
    Resume,
    Close,
}

// ============================================================================
// Shared State
// ============================================================================

struct Shared {
    partition_id: PartitionId,
    phase: Mutex<Phase>,
    closed: AtomicBool,
    failed_unrecoverably: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    health_check_interval: Duration,
    failure_listeners: Mutex<Vec<Arc<dyn FailureListener>>>,
    metrics: Arc<ProcessingMetrics>,
}

impl Shared {
    fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: Phase) {
        let previous = std::mem::replace(&mut *lock(&self.phase), phase);
        if previous != phase {
            tracing::info!(partition_id = %self.partition_id, from = %previous, to = %phase, "phase changed");
        }
    }

    fn heartbeat(&self) {
        *lock(&self.last_heartbeat) = Instant::now();
    }

    fn health_status(&self) -> HealthStatus {
        if self.closed.load(Ordering::Acquire) || self.failed_unrecoverably.load(Ordering::Acquire) {
            return HealthStatus::Dead;
        }
        let stale = lock(&self.last_heartbeat).elapsed() > self.health_check_interval * 2;
        if self.phase() == Phase::Failed || self.metrics.error_retries() >= MAX_ERROR_RETRIES || stale {
            return HealthStatus::Unhealthy;
        }
        HealthStatus::Healthy
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Controls a running stream processor.
#[derive(Clone)]
pub struct StreamProcessorHandle {
    control: mpsc::UnboundedSender<Control>,
    abort: AbortCondition,
    shared: Arc<Shared>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl StreamProcessorHandle {
    pub fn partition_id(&self) -> PartitionId {
        self.shared.partition_id
    }

    /// Stops processing and waits for the task to finish. Retry loops in
    /// flight give up immediately.
    pub async fn close(&self) {
        self.abort.abort();
        // the task may already be gone
        let _ = self.control.send(Control::Close);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                tracing::error!(partition_id = %self.shared.partition_id, error = %error, "stream processor task panicked");
            }
        }
    }

    /// Stops reading new records after the current one.
    pub fn pause(&self) {
        self.send(Control::Pause);
    }

    pub fn resume(&self) {
        self.send(Control::Resume);
    }

    fn send(&self, message: Control) {
        if self.control.send(message).is_err() {
            tracing::debug!(partition_id = %self.shared.partition_id, "stream processor already closed");
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn last_processed_position(&self) -> Position {
        self.shared.metrics.snapshot().last_processed_position
    }

    pub fn last_written_position(&self) -> Position {
        self.shared.metrics.snapshot().last_written_position
    }

    pub fn health_status(&self) -> HealthStatus {
        self.shared.health_status()
    }

    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        lock(&self.shared.failure_listeners).push(listener);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl fmt::Debug for StreamProcessorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamProcessorHandle")
            .field("partition_id", &self.shared.partition_id)
            .field("phase", &self.shared.phase())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and starts a stream processor.
///
/// # Example
///
/// ```ignore
/// let handle = StreamProcessorBuilder::new(Arc::new(log), Arc::new(db))
///     .processors(processors)
///     .command_response_writer(network)
///     .strand_config(&config)
///     .open()
///     .await?;
/// ```
pub struct StreamProcessorBuilder<L> {
    log: Arc<L>,
    database: Arc<dyn Database>,
    processors: TypedRecordProcessors,
    event_applier: Arc<dyn EventApplier>,
    response_writer: Arc<dyn CommandResponseWriter>,
    listener: Option<Arc<dyn StreamProcessorListener>>,
    key_resolver: Arc<dyn BlacklistKeyResolver>,
    failure_listeners: Vec<Arc<dyn FailureListener>>,
    config: EngineConfig,
    expected_partition: Option<PartitionId>,
}

impl<L: LogStream + 'static> StreamProcessorBuilder<L> {
    pub fn new(log: Arc<L>, database: Arc<dyn Database>) -> Self {
        Self {
            log,
            database,
            processors: TypedRecordProcessors::new(),
            event_applier: Arc::new(NoopEventApplier),
            response_writer: Arc::new(NoOpNetwork),
            listener: None,
            key_resolver: Arc::new(RecordKeyResolver),
            failure_listeners: Vec::new(),
            config: EngineConfig::default(),
            expected_partition: None,
        }
    }

    pub fn processors(mut self, processors: TypedRecordProcessors) -> Self {
        self.processors = processors;
        self
    }

    pub fn event_applier(mut self, applier: Arc<dyn EventApplier>) -> Self {
        self.event_applier = applier;
        self
    }

    pub fn command_response_writer(mut self, writer: Arc<dyn CommandResponseWriter>) -> Self {
        self.response_writer = writer;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StreamProcessorListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn blacklist_key_resolver(mut self, resolver: Arc<dyn BlacklistKeyResolver>) -> Self {
        self.key_resolver = resolver;
        self
    }

    pub fn failure_listener(mut self, listener: Arc<dyn FailureListener>) -> Self {
        self.failure_listeners.push(listener);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Takes the engine settings from `config` and refuses to open a log of
    /// any other partition than the configured one.
    pub fn strand_config(mut self, config: &StrandConfig) -> Self {
        self.config = config.engine.clone();
        self.expected_partition = Some(config.partition.partition_id());
        self
    }

    /// Spawns the stream processor and waits until it recovered.
    ///
    /// # Errors
    ///
    /// Returns the error that failed recovery. The task is stopped in that
    /// case. A log of another partition than the configured one is refused
    /// before anything is started.
    pub async fn open(self) -> Result<StreamProcessorHandle, EngineError> {
        let partition_id = self.log.partition_id();
        if let Some(configured) = self.expected_partition.filter(|&configured| configured != partition_id) {
            return Err(EngineError::PartitionMismatch {
                configured,
                log: partition_id,
            });
        }
        let abort = AbortCondition::new();
        let shared = Arc::new(Shared {
            partition_id,
            phase: Mutex::new(Phase::Reprocessing),
            closed: AtomicBool::new(false),
            failed_unrecoverably: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
            health_check_interval: self.config.health_check_interval(),
            failure_listeners: Mutex::new(self.failure_listeners),
            metrics: Arc::new(ProcessingMetrics::new()),
        });

        let (processors, lifecycle) = self.processors.into_parts();
        let actor = StreamProcessorActor {
            log: self.log,
            database: self.database,
            processors: Arc::new(processors),
            lifecycle,
            event_applier: self.event_applier,
            response_writer: self.response_writer,
            listener: self.listener,
            key_resolver: self.key_resolver,
            config: self.config,
            abort: abort.clone(),
            shared: Arc::clone(&shared),
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(actor.run(control_rx, ready_tx));

        let handle = StreamProcessorHandle {
            control: control_tx,
            abort,
            shared,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        };
        match ready_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(error)) => {
                handle.close().await;
                Err(error)
            }
            Err(_) => {
                handle.close().await;
                Err(EngineError::Closed)
            }
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct StreamProcessorActor<L> {
    log: Arc<L>,
    database: Arc<dyn Database>,
    processors: Arc<RecordProcessorMap>,
    lifecycle: Vec<Arc<dyn StreamProcessorLifecycleAware>>,
    event_applier: Arc<dyn EventApplier>,
    response_writer: Arc<dyn CommandResponseWriter>,
    listener: Option<Arc<dyn StreamProcessorListener>>,
    key_resolver: Arc<dyn BlacklistKeyResolver>,
    config: EngineConfig,
    abort: AbortCondition,
    shared: Arc<Shared>,
}

impl<L: LogStream + 'static> StreamProcessorActor<L> {
    async fn run(
        self,
        mut control: mpsc::UnboundedReceiver<Control>,
        ready: oneshot::Sender<Result<(), EngineError>>,
    ) {
        match self.recover().await {
            Ok((mut ctx, mut processing)) => {
                // the opener may have given up waiting
                let _ = ready.send(Ok(()));
                let result = self.process(&mut ctx, &mut processing, &mut control).await;
                drop(ctx);
                if let Err(error) = result {
                    self.fail(&error);
                    wait_for_close(&mut control).await;
                }
            }
            Err(EngineError::Closed) => {
                let _ = ready.send(Err(EngineError::Closed));
            }
            Err(error) => {
                self.fail(&error);
                let _ = ready.send(Err(error));
                wait_for_close(&mut control).await;
            }
        }

        self.notify_lifecycle(|listener| listener.on_close());
        self.shared.closed.store(true, Ordering::Release);
        tracing::info!(partition_id = %self.shared.partition_id, "stream processor closed");
    }

    async fn recover(&self) -> Result<(ProcessingContext, ProcessingStateMachine), EngineError> {
        let partition_id = self.shared.partition_id;
        self.shared.set_phase(Phase::Reprocessing);

        let mut reader = self.log.new_reader().await?;
        let writer = self.log.new_writer().await?;
        let mut transaction_context = self.database.create_context();
        let state = EngineState::new(partition_id, Arc::clone(&self.key_resolver));

        let snapshot = state
            .last_processed
            .last_successful_processed_position(transaction_context.current_transaction())?;
        if snapshot.is_set() && !reader.seek(snapshot) {
            return Err(EngineError::MissingSnapshotRecord(snapshot));
        }
        tracing::info!(partition_id = %partition_id, snapshot_position = %snapshot, "recovering stream processor");

        let response_writer = ResponseWriter::new(partition_id, Arc::clone(&self.response_writer));
        let mut ctx = ProcessingContext::new(
            partition_id,
            reader,
            Box::new(response_writer),
            transaction_context,
            state,
            Arc::clone(&self.processors),
            Arc::clone(&self.event_applier),
            self.log.subscribe_commit_position(),
            &self.config,
        )
        .with_listener(self.listener.clone())
        .with_abort_condition(self.abort.clone())
        .with_metrics(Arc::clone(&self.shared.metrics));

        let positions = ReProcessingStateMachine::new(&self.config, self.abort.clone())
            .start_recover(&mut ctx, snapshot)
            .await?;

        ctx.set_stream_writer(Box::new(TypedStreamWriterImpl::new(writer)));
        let mut processing = ProcessingStateMachine::new(&self.config, self.abort.clone());
        processing.start_processing(&mut ctx, positions);

        self.notify_lifecycle(|listener| listener.on_recovered(partition_id, positions.last_processed));
        self.shared.set_phase(Phase::Processing);
        Ok((ctx, processing))
    }

    /// Runs until closed or failed. Steps run outside of `select!` so that
    /// they are never cancelled halfway.
    async fn process(
        &self,
        ctx: &mut ProcessingContext,
        processing: &mut ProcessingStateMachine,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Result<(), EngineError> {
        let heartbeat_interval = self.config.health_check_interval();
        let mut commit_position = ctx.commit_position.clone();
        let mut commit_open = true;
        let mut next_heartbeat = Instant::now();
        let mut retry_at: Option<Instant> = None;
        let mut paused = false;

        loop {
            let now = Instant::now();
            if now >= next_heartbeat {
                self.shared.heartbeat();
                next_heartbeat = now + heartbeat_interval;
            }

            loop {
                match control.try_recv() {
                    Ok(message) => {
                        if self.handle_control(message, &mut paused) {
                            return Ok(());
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
                }
            }

            let retry_due = retry_at.is_some_and(|at| Instant::now() >= at);
            if retry_due || (!paused && retry_at.is_none() && processing.can_read_next(ctx)) {
                retry_at = None;
                match processing.try_process_next(ctx).await {
                    Ok(ProcessingProgress::RetryScheduled(delay)) => {
                        retry_at = Some(Instant::now() + delay);
                    }
                    Ok(_) => {}
                    Err(EngineError::Closed) => return Ok(()),
                    Err(error) => return Err(error),
                }
                tokio::task::yield_now().await;
                continue;
            }

            let retry_deadline = retry_at.unwrap_or(next_heartbeat);
            tokio::select! {
                message = control.recv() => match message {
                    Some(message) => {
                        if self.handle_control(message, &mut paused) {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
                changed = commit_position.changed(), if commit_open => {
                    if changed.is_err() {
                        commit_open = false;
                    }
                }
                () = tokio::time::sleep_until(next_heartbeat) => {}
                () = tokio::time::sleep_until(retry_deadline), if retry_at.is_some() => {}
            }
        }
    }

    /// Returns true if the processor should close.
    fn handle_control(&self, message: Control, paused: &mut bool) -> bool {
        match message {
            Control::Pause if !*paused => {
                *paused = true;
                self.shared.set_phase(Phase::Paused);
                self.notify_lifecycle(|listener| listener.on_paused());
            }
            Control::Resume if *paused => {
                *paused = false;
                self.shared.set_phase(Phase::Processing);
                self.notify_lifecycle(|listener| listener.on_resumed());
            }
            Control::Pause | Control::Resume => {}
            Control::Close => return true,
        }
        false
    }

    fn fail(&self, error: &EngineError) {
        let unrecoverable = error.is_unrecoverable();
        tracing::error!(
            partition_id = %self.shared.partition_id,
            error = %error,
            unrecoverable,
            "stream processor failed"
        );
        if unrecoverable {
            self.shared.failed_unrecoverably.store(true, Ordering::Release);
        }
        self.shared.set_phase(Phase::Failed);
        self.notify_lifecycle(|listener| listener.on_failed());

        let listeners = lock(&self.shared.failure_listeners).clone();
        for listener in listeners {
            if unrecoverable {
                listener.on_unrecoverable_failure(error);
            } else {
                listener.on_failure(error);
            }
        }
    }

    /// Calls `f` for registered listeners and lifecycle-aware processors.
    fn notify_lifecycle(&self, f: impl Fn(&dyn StreamProcessorLifecycleAware)) {
        for listener in &self.lifecycle {
            f(listener.as_ref());
        }
        for processor in self.processors.iter() {
            if let Some(listener) = processor.as_lifecycle_aware() {
                f(listener);
            }
        }
    }
}

async fn wait_for_close(control: &mut mpsc::UnboundedReceiver<Control>) {
    while let Some(message) = control.recv().await {
        if matches!(message, Control::Close) {
            break;
        }
    }
}
