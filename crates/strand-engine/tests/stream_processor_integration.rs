//! End-to-end tests of the stream processor actor against the in-memory log
//! and store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strand_config::{EngineConfig, PartitionConfig, StrandConfig};
use strand_engine::db::{get_value, put_value};
use strand_engine::{
    ColumnFamily, CommandControl, CommandProcessor, Database, EngineError, FailureListener,
    HealthStatus, InMemoryDatabase, InMemoryLogStream, LastProcessedPositionState, Phase,
    ProcessingError, ProcessingScope, RecordingResponseWriter, StreamProcessorBuilder,
    StreamProcessorHandle, StreamProcessorLifecycleAware, TypedRecord, TypedRecordProcessor,
    TypedRecordProcessors,
};
use strand_types::{
    Intent, Key, LoggedEvent, PartitionId, Position, RecordMetadata, RecordType, RecordValue,
    RejectionType, RequestMetadata, ValueType,
};

const PARTITION: PartitionId = PartitionId::new(3);
const JOBS: ColumnFamily = ColumnFamily::Custom(1);

const CREATE: Intent = Intent::new(0);
const CREATED: Intent = Intent::new(1);
const UPDATE: Intent = Intent::new(2);
const UPDATED: Intent = Intent::new(3);

fn job_key(local: i64) -> Key {
    Key::encode(PARTITION, local)
}

fn config() -> EngineConfig {
    EngineConfig {
        processing_retry_delay_ms: 50,
        health_check_interval_ms: 100,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..EngineConfig::default()
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting until {what}");
}

fn follow_ups(log: &InMemoryLogStream) -> Vec<LoggedEvent> {
    log.records().into_iter().filter(LoggedEvent::has_source).collect()
}

fn stored_version(db: &InMemoryDatabase, key: Key) -> Option<u32> {
    let mut context = db.create_context();
    get_value(context.current_transaction(), JOBS, &key.as_i64().to_be_bytes()).unwrap()
}

// ============================================================================
// Processors and listeners
// ============================================================================

/// Creates jobs and bumps their version on update. Counts its invocations.
#[derive(Clone, Default)]
struct Jobs {
    invocations: Arc<AtomicU32>,
}

impl CommandProcessor for Jobs {
    fn on_command(
        &self,
        command: &TypedRecord,
        control: &mut CommandControl<'_, '_>,
    ) -> Result<bool, ProcessingError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if command.intent() == CREATE {
            let key = control.accept(CREATED, RecordValue::empty())?;
            put_value(control.scope().transaction(), JOBS, &key.as_i64().to_be_bytes(), &1u32)?;
            return Ok(true);
        }

        let id = command.key().as_i64().to_be_bytes();
        let transaction = control.scope().transaction();
        match get_value::<u32>(transaction, JOBS, &id)? {
            Some(version) => {
                put_value(transaction, JOBS, &id, &(version + 1))?;
                control.accept(UPDATED, RecordValue::empty())?;
            }
            None => control.reject(RejectionType::NotFound, "job does not exist"),
        }
        Ok(true)
    }
}

impl Jobs {
    fn processors(&self) -> TypedRecordProcessors {
        TypedRecordProcessors::new()
            .on_command(ValueType::Job, CREATE, self.clone())
            .on_command(ValueType::Job, UPDATE, self.clone())
    }
}

/// Writes state, then fails with the configured error.
struct Exploding(ProcessingError);

impl TypedRecordProcessor for Exploding {
    fn process_record(
        &self,
        record: &TypedRecord,
        scope: &mut ProcessingScope<'_>,
    ) -> Result<(), ProcessingError> {
        put_value(scope.transaction(), JOBS, &record.key().as_i64().to_be_bytes(), &99u32)?;
        Err(self.0.clone())
    }
}

struct FlakyCreate {
    attempts: Arc<AtomicU32>,
}

impl CommandProcessor for FlakyCreate {
    fn on_command(
        &self,
        _command: &TypedRecord,
        control: &mut CommandControl<'_, '_>,
    ) -> Result<bool, ProcessingError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ProcessingError::recoverable("lock timeout"));
        }
        control.accept(CREATED, RecordValue::empty())?;
        Ok(true)
    }
}

#[derive(Clone, Default)]
struct Lifecycle {
    events: Arc<Mutex<Vec<String>>>,
}

impl Lifecycle {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl StreamProcessorLifecycleAware for Lifecycle {
    fn on_recovered(&self, _partition_id: PartitionId, last_processed_position: Position) {
        self.push(format!("recovered@{last_processed_position}"));
    }

    fn on_paused(&self) {
        self.push("paused");
    }

    fn on_resumed(&self) {
        self.push("resumed");
    }

    fn on_close(&self) {
        self.push("closed");
    }

    fn on_failed(&self) {
        self.push("failed");
    }
}

#[derive(Default)]
struct Failures {
    recoverable: Mutex<Vec<EngineError>>,
    unrecoverable: Mutex<Vec<EngineError>>,
}

impl FailureListener for Failures {
    fn on_failure(&self, error: &EngineError) {
        self.recoverable.lock().unwrap().push(error.clone());
    }

    fn on_unrecoverable_failure(&self, error: &EngineError) {
        self.unrecoverable.lock().unwrap().push(error.clone());
    }
}

struct Partition {
    log: Arc<InMemoryLogStream>,
    db: InMemoryDatabase,
    network: Arc<RecordingResponseWriter>,
}

impl Partition {
    fn new() -> Self {
        Self {
            log: Arc::new(InMemoryLogStream::new(PARTITION)),
            db: InMemoryDatabase::new(),
            network: Arc::new(RecordingResponseWriter::new()),
        }
    }

    fn builder(&self) -> StreamProcessorBuilder<InMemoryLogStream> {
        StreamProcessorBuilder::new(self.log.clone(), Arc::new(self.db.clone()))
            .command_response_writer(self.network.clone())
            .config(config())
    }

    async fn open(&self, processors: TypedRecordProcessors) -> StreamProcessorHandle {
        self.builder().processors(processors).open().await.unwrap()
    }

    fn command(&self, intent: Intent, key: Key) -> Position {
        self.log.append_command(
            ValueType::Job,
            intent,
            key,
            RecordValue::empty(),
            Some(RequestMetadata {
                request_id: 7,
                request_stream_id: 2,
            }),
        )
    }
}

// ============================================================================
// Processing
// ============================================================================

#[tokio::test]
async fn create_then_update_produces_ordered_events() {
    let partition = Partition::new();
    let handle = partition.open(Jobs::default().processors()).await;
    assert_eq!(handle.phase(), Phase::Processing);

    let create = partition.command(CREATE, Key::UNSET);
    eventually("the job is created", || follow_ups(&partition.log).len() == 1).await;
    let update = partition.command(UPDATE, job_key(1));
    eventually("the job is updated", || follow_ups(&partition.log).len() == 2).await;

    let events = follow_ups(&partition.log);
    assert_eq!(
        events
            .iter()
            .map(|event| (event.intent(), event.key, event.source_event_position))
            .collect::<Vec<_>>(),
        vec![(CREATED, job_key(1), create), (UPDATED, job_key(1), update)]
    );
    assert!(events[0].position < events[1].position);
    assert_eq!(stored_version(&partition.db, job_key(1)), Some(2));

    eventually("both clients are answered", || partition.network.responses().len() == 2).await;
    let responses = partition.network.responses();
    assert!(responses.iter().all(|sent| sent.request_id == 7 && sent.request_stream_id == 2));
    assert_eq!(responses[1].response.record_type, RecordType::Event);

    handle.close().await;
}

#[tokio::test]
async fn failing_processor_rejects_and_blacklists_the_job() {
    let partition = Partition::new();
    let jobs = Jobs::default();
    let processors = TypedRecordProcessors::new()
        .on_command(ValueType::Job, CREATE, jobs.clone())
        .on_record(
            RecordType::Command,
            ValueType::Job,
            UPDATE,
            Exploding(ProcessingError::failed("illegal transition")),
        );
    let handle = partition.open(processors).await;

    partition.command(CREATE, Key::UNSET);
    eventually("the job is created", || follow_ups(&partition.log).len() == 1).await;
    let update = partition.command(UPDATE, job_key(1));
    eventually("the failure is recorded", || follow_ups(&partition.log).len() == 3).await;

    let records = follow_ups(&partition.log);
    let rejection = &records[1];
    assert_eq!(rejection.record_type(), RecordType::CommandRejection);
    assert_eq!(rejection.metadata.rejection_type, RejectionType::ProcessingError);
    assert_eq!(rejection.source_event_position, update);
    let error = &records[2];
    assert_eq!(error.value_type(), ValueType::Error);
    assert_eq!(error.key, job_key(1));
    assert_eq!(stored_version(&partition.db, job_key(1)), Some(1));

    // blacklisted: consumed without output
    let ignored = partition.command(UPDATE, job_key(1));
    eventually("the blacklisted command is consumed", || {
        handle.last_processed_position() == ignored
    })
    .await;
    assert_eq!(follow_ups(&partition.log).len(), 3);
    assert_eq!(handle.metrics().records_blacklisted, 1);
    assert_eq!(handle.health_status(), HealthStatus::Healthy);

    handle.close().await;
}

#[tokio::test]
async fn restart_resumes_after_the_last_processed_position() {
    let partition = Partition::new();
    let jobs = Jobs::default();
    let handle = partition.open(jobs.processors()).await;
    for _ in 0..5 {
        partition.command(CREATE, Key::UNSET);
    }
    eventually("five jobs are created", || follow_ups(&partition.log).len() == 5).await;
    eventually("the last command is committed", || {
        handle.last_processed_position() == Position::new(9)
    })
    .await;
    handle.close().await;
    assert_eq!(partition.log.last_position(), Position::new(10));

    let lifecycle = Lifecycle::default();
    let handle = partition
        .open(jobs.processors().with_listener(lifecycle.clone()))
        .await;
    assert_eq!(handle.last_processed_position(), Position::new(9));
    assert_eq!(handle.last_written_position(), Position::new(10));
    assert_eq!(lifecycle.events(), vec!["recovered@9"]);

    let next = partition.command(CREATE, Key::UNSET);
    assert_eq!(next, Position::new(11));
    eventually("the new job is created", || follow_ups(&partition.log).len() == 6).await;

    assert_eq!(jobs.invocations.load(Ordering::SeqCst), 6);
    let sources: Vec<_> = follow_ups(&partition.log)
        .iter()
        .map(|event| event.source_event_position)
        .collect();
    assert_eq!(sources, [1, 3, 5, 7, 9, 11].map(Position::new));
    assert_eq!(follow_ups(&partition.log)[5].key, job_key(6));

    handle.close().await;
}

#[tokio::test]
async fn recoverable_failure_is_retried_after_the_delay() {
    let partition = Partition::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let processors = TypedRecordProcessors::new().on_command(
        ValueType::Job,
        CREATE,
        FlakyCreate {
            attempts: attempts.clone(),
        },
    );
    let handle = partition.open(processors).await;

    let started = tokio::time::Instant::now();
    partition.command(CREATE, Key::UNSET);
    eventually("the job is created", || follow_ups(&partition.log).len() == 1).await;

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(handle.metrics().recoverable_retries, 1);
    assert_eq!(follow_ups(&partition.log)[0].intent(), CREATED);

    handle.close().await;
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn processor_opens_on_its_configured_partition() {
    let partition = Partition::new();
    let config = StrandConfig {
        engine: config(),
        partition: PartitionConfig { partition_id: 3 },
    };
    let handle = partition
        .builder()
        .strand_config(&config)
        .processors(Jobs::default().processors())
        .open()
        .await
        .unwrap();
    assert_eq!(handle.partition_id(), PARTITION);

    partition.command(CREATE, Key::UNSET);
    eventually("the job is created", || follow_ups(&partition.log).len() == 1).await;
    handle.close().await;
}

#[tokio::test]
async fn processor_refuses_a_log_of_another_partition() {
    let partition = Partition::new();
    let config = StrandConfig {
        engine: config(),
        partition: PartitionConfig { partition_id: 4 },
    };
    let result = partition
        .builder()
        .strand_config(&config)
        .processors(Jobs::default().processors())
        .open()
        .await;

    assert!(matches!(
        result,
        Err(EngineError::PartitionMismatch { configured, log })
            if configured == PartitionId::new(4) && log == PARTITION
    ));
}

#[tokio::test]
async fn missing_snapshot_record_fails_startup() {
    let partition = Partition::new();
    let mut context = partition.db.create_context();
    let transaction = context.current_transaction();
    LastProcessedPositionState
        .mark_as_processed(transaction, Position::new(42))
        .unwrap();
    transaction.commit().unwrap();

    let failures = Arc::new(Failures::default());
    let result = partition
        .builder()
        .failure_listener(failures.clone())
        .open()
        .await;

    assert_eq!(
        result.unwrap_err(),
        EngineError::MissingSnapshotRecord(Position::new(42))
    );
    assert_eq!(failures.unrecoverable.lock().unwrap().len(), 1);
    assert!(failures.recoverable.lock().unwrap().is_empty());
}

#[tokio::test]
async fn inconsistent_log_fails_recovery() {
    let partition = Partition::new();
    let create = partition.command(CREATE, Key::UNSET);
    partition.log.append_record(
        job_key(1),
        RecordMetadata::event(ValueType::Job, UPDATED),
        RecordValue::empty(),
        create,
    );

    let result = partition
        .builder()
        .processors(Jobs::default().processors())
        .open()
        .await;

    assert!(matches!(
        result,
        Err(EngineError::InconsistentReprocessing { source_position, .. }) if source_position == create
    ));
}

#[tokio::test]
async fn key_generator_continues_after_the_highest_logged_key() {
    let partition = Partition::new();
    partition.log.append_record(
        job_key(41),
        RecordMetadata::event(ValueType::Job, CREATED),
        RecordValue::empty(),
        Position::UNSET,
    );
    let handle = partition.open(Jobs::default().processors()).await;

    partition.command(CREATE, Key::UNSET);
    eventually("the job is created", || follow_ups(&partition.log).len() == 1).await;

    assert_eq!(follow_ups(&partition.log)[0].key, job_key(42));
    handle.close().await;
}

// ============================================================================
// Lifecycle and health
// ============================================================================

#[tokio::test]
async fn paused_processor_reads_nothing_until_resumed() {
    let partition = Partition::new();
    let lifecycle = Lifecycle::default();
    let handle = partition
        .open(Jobs::default().processors().with_listener(lifecycle.clone()))
        .await;

    handle.pause();
    eventually("the processor is paused", || handle.phase() == Phase::Paused).await;
    partition.command(CREATE, Key::UNSET);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(follow_ups(&partition.log).is_empty());

    handle.resume();
    eventually("the job is created", || follow_ups(&partition.log).len() == 1).await;
    assert_eq!(handle.phase(), Phase::Processing);

    handle.close().await;
    assert!(handle.is_closed());
    assert_eq!(
        lifecycle.events(),
        vec!["recovered@-1", "paused", "resumed", "closed"]
    );
}

#[tokio::test]
async fn processor_stuck_in_error_handling_turns_unhealthy() {
    let partition = Partition::new();
    let handle = partition.open(Jobs::default().processors()).await;
    assert_eq!(handle.health_status(), HealthStatus::Healthy);

    partition.log.reject_next_writes(u32::MAX);
    partition.command(CREATE, Key::UNSET);
    eventually("the processor reports unhealthy", || {
        handle.health_status() == HealthStatus::Unhealthy
    })
    .await;
    assert!(handle.metrics().error_retries >= 2);

    handle.close().await;
    assert_eq!(handle.health_status(), HealthStatus::Dead);
}

#[tokio::test]
async fn processor_blocked_on_commits_misses_its_heartbeat() {
    let partition = Partition::new();
    let handle = partition.open(Jobs::default().processors()).await;
    assert_eq!(handle.health_status(), HealthStatus::Healthy);

    partition.db.fail_next_commits(u32::MAX);
    partition.command(CREATE, Key::UNSET);
    eventually("the heartbeat goes stale", || {
        handle.health_status() == HealthStatus::Unhealthy
    })
    .await;
    assert_eq!(handle.metrics().error_retries, 0);
    assert_eq!(handle.phase(), Phase::Processing);

    handle.close().await;
    assert_eq!(handle.health_status(), HealthStatus::Dead);
}

#[tokio::test]
async fn unrecoverable_failure_notifies_listeners() {
    let partition = Partition::new();
    let lifecycle = Lifecycle::default();
    let processors = TypedRecordProcessors::new()
        .on_record(
            RecordType::Command,
            ValueType::Job,
            UPDATE,
            Exploding(ProcessingError::unrecoverable("state is corrupt")),
        )
        .with_listener(lifecycle.clone());
    let handle = partition.open(processors).await;
    let failures = Arc::new(Failures::default());
    handle.add_failure_listener(failures.clone());

    partition.command(UPDATE, job_key(1));
    eventually("the processor fails", || handle.phase() == Phase::Failed).await;

    assert_eq!(handle.health_status(), HealthStatus::Dead);
    let errors = failures.unrecoverable.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], EngineError::Unrecoverable(message) if message.contains("state is corrupt")));
    assert!(follow_ups(&partition.log).is_empty());
    assert_eq!(stored_version(&partition.db, job_key(1)), None);

    handle.close().await;
    assert_eq!(lifecycle.events(), vec!["recovered@-1", "failed", "closed"]);
}
