//! Side effects executed after a record's transaction was committed.

use crate::response::TypedResponseWriter;

/// An action with external visibility, e.g. pushing a job to a worker.
///
/// Side effects run at most once per successful processing and are never
/// run during reprocessing.
pub trait SideEffectProducer: Send {
    /// Returns false if the side effect should be retried.
    fn flush(&mut self) -> bool;
}

impl<F> SideEffectProducer for F
where
    F: FnMut() -> bool + Send,
{
    fn flush(&mut self) -> bool {
        self()
    }
}

/// The side effects of the record currently being processed.
///
/// By default the only side effect is flushing the response writer.
/// Processors may replace it or add further producers.
pub struct SideEffects {
    flush_response: bool,
    producers: Vec<Box<dyn SideEffectProducer>>,
}

impl Default for SideEffects {
    fn default() -> Self {
        Self::new()
    }
}

impl SideEffects {
    pub fn new() -> Self {
        Self {
            flush_response: true,
            producers: Vec::new(),
        }
    }

    /// Restores the default side effect.
    pub fn reset(&mut self) {
        self.flush_response = true;
        self.producers.clear();
    }

    /// Replaces all side effects, including the response flush.
    pub fn replace(&mut self, producer: Box<dyn SideEffectProducer>) {
        self.flush_response = false;
        self.producers.clear();
        self.producers.push(producer);
    }

    pub fn add(&mut self, producer: Box<dyn SideEffectProducer>) {
        self.producers.push(producer);
    }

    pub fn len(&self) -> usize {
        self.producers.len() + usize::from(self.flush_response)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the pending side effects. Successful ones are dropped, so a retry
    /// only repeats what failed.
    pub fn flush(&mut self, response_writer: &mut dyn TypedResponseWriter) -> bool {
        if self.flush_response {
            if !response_writer.flush() {
                return false;
            }
            self.flush_response = false;
        }
        self.producers.retain_mut(|producer| !producer.flush());
        self.producers.is_empty()
    }
}
