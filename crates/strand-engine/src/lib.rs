//! # strand-engine: Event-sourced command processing
//!
//! The engine turns the records of a replicated log partition into state
//! changes. Every command is processed exactly once per log position: its
//! state changes, its follow-up records and its position are committed
//! together, and after a restart the same state is rebuilt by replaying the
//! log without answering clients a second time.
//!
//! ## Key Principles
//!
//! - **One task per partition**: all log and store access of a partition is
//!   sequential, so there is only ever one open transaction
//! - **Log first**: follow-up records are written before the state commit,
//!   so state never runs ahead of the log
//! - **Failures are records**: a record that fails to process is rejected,
//!   its entity is blacklisted and an ERROR event marks the position
//! - **Replay is deterministic**: reprocessing re-runs processors against
//!   the recording writer and compares the output with the log
//!
//! ## Architecture
//!
//! - [`processor`]: the processor trait, processing scope and dispatch table
//! - [`command`]: accept/reject command processors
//! - [`processing`]: the processing state machine
//! - [`reprocessing`]: the reprocessing state machine
//! - [`stream_processor`]: the actor owning both state machines
//! - [`log`], [`db`], [`response`]: collaborator interfaces
//! - [`in_memory`]: in-memory collaborators for tests and development
//!
//! ## Example
//!
//! ```ignore
//! use strand_engine::{InMemoryDatabase, InMemoryLogStream, StreamProcessorBuilder, TypedRecordProcessors};
//!
//! let log = Arc::new(InMemoryLogStream::new(PartitionId::new(1)));
//! let processors = TypedRecordProcessors::new()
//!     .on_command(ValueType::Job, JobIntent::CREATE, CreateJobProcessor);
//!
//! let handle = StreamProcessorBuilder::new(log.clone(), Arc::new(InMemoryDatabase::new()))
//!     .processors(processors)
//!     .open()
//!     .await?;
//!
//! log.append_command(ValueType::Job, JobIntent::CREATE, Key::UNSET, value, None);
//! // ...
//! handle.close().await;
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod command;
pub mod context;
pub mod db;
pub mod error;
pub mod in_memory;
pub mod log;
pub mod metrics;
pub mod processing;
pub mod processor;
pub mod record;
pub mod reprocessing;
pub mod response;
pub mod retry;
pub mod side_effect;
pub mod state;
pub mod stream_processor;
pub mod writer;


// Re-export commonly used items
pub use command::{CommandControl, CommandProcessor, CommandProcessorAdapter};
pub use db::{ColumnFamily, Database, Transaction, TransactionContext, run_in_transaction};
pub use error::{EngineError, LogError, ProcessingError, StoreError};
pub use in_memory::{InMemoryDatabase, InMemoryLogStream, RecordedResponse, RecordingResponseWriter};
pub use log::{LogAppendEntry, LogStream, LogStreamReader, LogStreamWriter};
pub use metrics::MetricsSnapshot;
pub use processor::{
    ProcessingScope, RecordProcessorMap, StreamProcessorLifecycleAware, StreamProcessorListener,
    TypedRecordProcessor, TypedRecordProcessors,
};
pub use record::{MigratedValueTypes, TypedRecord};
pub use reprocessing::LastProcessingPositions;
pub use response::{CommandResponse, CommandResponseWriter, NoOpNetwork, TypedResponseWriter};
pub use state::{
    Blacklist, BlacklistKeyResolver, EngineState, EventApplier, KeyGenerator,
    LastProcessedPositionState, NoopEventApplier, RecordKeyResolver,
};
pub use stream_processor::{
    FailureListener, HealthStatus, Phase, StreamProcessorBuilder, StreamProcessorHandle,
};
pub use writer::TypedStreamWriter;

/// Locks `mutex`, ignoring poisoning. Guarded data is only ever replaced as
/// a whole.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
