//! Listener traits
//!
//! Listeners are the engine's output surface: success listeners receive
//! each batch of identifiers, failure listeners receive failed page
//! fetches. Both run on the worker thread that produced the event and must
//! be thread-safe. Panics inside a listener are caught and logged by the
//! engine; they never affect pagination and never stop later listeners.

use crate::batch::{FailureEvent, QueryBatch};

/// Receives each successfully fetched batch, in registration order
pub trait BatchListener: Send + Sync {
    /// Process one batch
    fn on_batch(&self, batch: &QueryBatch);
}

/// Receives each failed page fetch, in registration order
pub trait FailureListener: Send + Sync {
    /// Process one failure event
    fn on_failure(&self, event: &FailureEvent);
}

impl<F> BatchListener for F
where
    F: Fn(&QueryBatch) + Send + Sync,
{
    fn on_batch(&self, batch: &QueryBatch) {
        self(batch)
    }
}

impl<F> FailureListener for F
where
    F: Fn(&FailureEvent) + Send + Sync,
{
    fn on_failure(&self, event: &FailureEvent) {
        self(event)
    }
}
