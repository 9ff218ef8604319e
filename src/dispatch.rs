//! Event delivery to the consumer.

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tracing::trace;
use tracing::warn;

use crate::protocol::Event;

/// Consumer of supervisor events.
///
/// Called inline from the supervisor's I/O tasks, so implementations must not
/// block. Errors and panics are logged and swallowed.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn handle_event(&self, event: Event) -> anyhow::Result<()>;
}

impl<F> EventSink for F
where
    F: Fn(Event) -> anyhow::Result<()> + Send + Sync,
{
    fn handle_event(&self, event: Event) -> anyhow::Result<()> {
        self(event)
    }
}

/// Per-process event gate.
///
/// Serializes delivery for one monitor instance and shuts for good once the
/// exit event has gone through, so late channel lines never follow `Exited`.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    sink: Arc<dyn EventSink>,
    open: Arc<Mutex<bool>>,
}

impl Dispatcher {
    pub(crate) fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            open: Arc::new(Mutex::new(true)),
        }
    }

    /// Deliver an event unless the gate has closed.
    pub(crate) fn dispatch(&self, event: Event) -> bool {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            trace!("Dropping event after exit: {:?}", event);
            return false;
        }

        deliver(self.sink.as_ref(), event);
        true
    }

    /// Deliver a final event and close the gate.
    pub(crate) fn close_with(&self, event: Event) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if *open {
            deliver(self.sink.as_ref(), event);
            *open = false;
        }
    }
}

fn deliver(sink: &dyn EventSink, event: Event) {
    match catch_unwind(AssertUnwindSafe(|| sink.handle_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Event consumer failed: {:#}", e),
        Err(_) => warn!("Event consumer panicked"),
    }
}
