//! Accept/reject command processors.
//!
//! Most command processors only decide whether a command is accepted (and
//! with which event) or rejected. [`CommandProcessorAdapter`] turns such a
//! decision into exactly one follow-up record and an optional response.

use strand_types::{Intent, Key, RecordValue, RejectionType};

use crate::error::ProcessingError;
use crate::processor::{ProcessingScope, TypedRecordProcessor};
use crate::record::TypedRecord;

pub trait CommandProcessor: Send + Sync {
    /// Decides on `command` through `control`. Returns whether the client
    /// should receive a response.
    fn on_command(
        &self,
        command: &TypedRecord,
        control: &mut CommandControl<'_, '_>,
    ) -> Result<bool, ProcessingError>;
}

enum Decision {
    Accept { intent: Intent, value: RecordValue },
    Reject { rejection_type: RejectionType, reason: String },
}

/// Collects the decision of a [`CommandProcessor`]. The last call wins.
pub struct CommandControl<'s, 'a> {
    scope: &'s mut ProcessingScope<'a>,
    entity_key: Key,
    decision: Option<Decision>,
}

impl<'s, 'a> CommandControl<'s, 'a> {
    fn new(scope: &'s mut ProcessingScope<'a>, command_key: Key) -> Self {
        Self {
            scope,
            entity_key: command_key,
            decision: None,
        }
    }

    /// Accepts the command and returns the entity key. Commands without a
    /// key create an entity, so a new key is generated on first acceptance.
    pub fn accept(&mut self, intent: Intent, value: RecordValue) -> Result<Key, ProcessingError> {
        if !self.entity_key.is_set() {
            self.entity_key = self.scope.next_key()?;
        }
        self.decision = Some(Decision::Accept { intent, value });
        Ok(self.entity_key)
    }

    pub fn reject(&mut self, rejection_type: RejectionType, reason: impl Into<String>) {
        self.decision = Some(Decision::Reject {
            rejection_type,
            reason: reason.into(),
        });
    }

    /// Transaction, state and side effects of the current record.
    pub fn scope(&mut self) -> &mut ProcessingScope<'a> {
        &mut *self.scope
    }

    fn into_decision(self) -> (Key, Option<Decision>) {
        (self.entity_key, self.decision)
    }
}

/// Adapts a [`CommandProcessor`] to [`TypedRecordProcessor`].
pub struct CommandProcessorAdapter<P> {
    inner: P,
}

impl<P: CommandProcessor> CommandProcessorAdapter<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: CommandProcessor> TypedRecordProcessor for CommandProcessorAdapter<P> {
    fn process_record(
        &self,
        record: &TypedRecord,
        scope: &mut ProcessingScope<'_>,
    ) -> Result<(), ProcessingError> {
        let mut control = CommandControl::new(scope, record.key());
        let respond = self.inner.on_command(record, &mut control)?;
        let (entity_key, decision) = control.into_decision();

        match decision {
            Some(Decision::Accept { intent, value }) => {
                if respond {
                    scope
                        .response_writer()
                        .write_event_on_command(entity_key, intent, &value, record);
                }
                scope.append_follow_up_event(entity_key, record.value_type(), intent, value)
            }
            Some(Decision::Reject {
                rejection_type,
                reason,
            }) => {
                scope.append_rejection(record, rejection_type, &reason);
                if respond {
                    scope
                        .response_writer()
                        .write_rejection_on_command(record, rejection_type, &reason);
                }
                Ok(())
            }
            None => Err(ProcessingError::failed(format!(
                "command {} {} at position {} was neither accepted nor rejected",
                record.value_type(),
                record.intent(),
                record.position()
            ))),
        }
    }
}
