//! Command responses.
//!
//! A processor answers the client at most once per command. The answer is
//! buffered in a [`TypedResponseWriter`] and only sent as a side effect after
//! the record's transaction was committed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strand_types::{
    Intent, Key, PartitionId, RecordType, RecordValue, RejectionType, RequestMetadata, ValueType,
};

use crate::record::TypedRecord;

/// The response sent to a client for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub partition_id: PartitionId,
    pub key: Key,
    pub record_type: RecordType,
    pub value_type: ValueType,
    pub intent: Intent,
    pub rejection_type: RejectionType,
    pub rejection_reason: String,
    pub value: RecordValue,
}

/// Network side of command responses.
pub trait CommandResponseWriter: Send + Sync {
    /// Returns false if the response could not be sent and should be retried.
    fn try_write_response(
        &self,
        request_stream_id: i32,
        request_id: i64,
        response: &CommandResponse,
    ) -> bool;
}

pub trait TypedResponseWriter: Send {
    fn write_event_on_command(
        &mut self,
        key: Key,
        intent: Intent,
        value: &RecordValue,
        command: &TypedRecord,
    );

    fn write_rejection_on_command(
        &mut self,
        command: &TypedRecord,
        rejection_type: RejectionType,
        reason: &str,
    );

    fn reset(&mut self);

    /// Sends the buffered response. Returns false if it has to be retried.
    fn flush(&mut self) -> bool;
}

/// Buffers one response and hands it to a [`CommandResponseWriter`].
pub struct ResponseWriter {
    partition_id: PartitionId,
    network: Arc<dyn CommandResponseWriter>,
    pending: Option<(RequestMetadata, CommandResponse)>,
}

impl ResponseWriter {
    pub fn new(partition_id: PartitionId, network: Arc<dyn CommandResponseWriter>) -> Self {
        Self {
            partition_id,
            network,
            pending: None,
        }
    }

    fn stage(&mut self, command: &TypedRecord, response: CommandResponse) {
        // commands written by the engine itself have nobody to answer
        if let Some(request) = command.request() {
            self.pending = Some((request, response));
        }
    }
}

impl TypedResponseWriter for ResponseWriter {
    fn write_event_on_command(
        &mut self,
        key: Key,
        intent: Intent,
        value: &RecordValue,
        command: &TypedRecord,
    ) {
        let response = CommandResponse {
            partition_id: self.partition_id,
            key,
            record_type: RecordType::Event,
            value_type: command.value_type(),
            intent,
            rejection_type: RejectionType::NullVal,
            rejection_reason: String::new(),
            value: value.clone(),
        };
        self.stage(command, response);
    }

    fn write_rejection_on_command(
        &mut self,
        command: &TypedRecord,
        rejection_type: RejectionType,
        reason: &str,
    ) {
        let response = CommandResponse {
            partition_id: self.partition_id,
            key: command.key(),
            record_type: RecordType::CommandRejection,
            value_type: command.value_type(),
            intent: command.intent(),
            rejection_type,
            rejection_reason: reason.to_string(),
            value: command.value().clone(),
        };
        self.stage(command, response);
    }

    fn reset(&mut self) {
        self.pending = None;
    }

    fn flush(&mut self) -> bool {
        let Some((request, response)) = &self.pending else {
            return true;
        };
        if self
            .network
            .try_write_response(request.request_stream_id, request.request_id, response)
        {
            self.pending = None;
            true
        } else {
            false
        }
    }
}

/// Used during reprocessing: clients were already answered the first time.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResponseWriter;

impl TypedResponseWriter for NoopResponseWriter {
    fn write_event_on_command(
        &mut self,
        _key: Key,
        _intent: Intent,
        _value: &RecordValue,
        _command: &TypedRecord,
    ) {
    }

    fn write_rejection_on_command(
        &mut self,
        _command: &TypedRecord,
        _rejection_type: RejectionType,
        _reason: &str,
    ) {
    }

    fn reset(&mut self) {}

    fn flush(&mut self) -> bool {
        true
    }
}

/// Network layer for partitions without connected clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpNetwork;

impl CommandResponseWriter for NoOpNetwork {
    fn try_write_response(
        &self,
        _request_stream_id: i32,
        _request_id: i64,
        _response: &CommandResponse,
    ) -> bool {
        true
    }
}
