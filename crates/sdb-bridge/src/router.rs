use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::protocol::{EventKind, NormalizedEvent, OutputStream, RawTargetEvent};

/// Consumer of normalized events, called from the router thread in the order
/// the target produced them.
pub trait NormalizedEventSink: Send + Sync {
    fn deliver(&self, event: NormalizedEvent);
}

/// Drains a session's notification channel on its own thread.
pub struct EventRouter {
    handle: Option<JoinHandle<()>>,
}

impl EventRouter {
    pub fn spawn(
        events: Receiver<RawTargetEvent>,
        sink: Arc<dyn NormalizedEventSink>,
        verbose: bool,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("sdb-event-router".to_string())
            .spawn(move || route(events, sink.as_ref(), verbose))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the router to drain. Returns once every sender is gone.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Event router thread panicked");
        }
    }
}

fn route(events: Receiver<RawTargetEvent>, sink: &dyn NormalizedEventSink, verbose: bool) {
    for raw in events.iter() {
        let event = NormalizedEvent::normalize(raw);
        log_event(&event, verbose);
        sink.deliver(event);
    }
    debug!("Event router finished");
}

fn log_event(event: &NormalizedEvent, verbose: bool) {
    match (event.kind, event.stream) {
        // Already reported by the session's exception policy.
        (EventKind::UnhandledException, _) => {}
        (EventKind::Log | EventKind::Output, Some(stream)) => {
            let text = event.payload.as_deref().unwrap_or_default();
            let text = text.trim_end_matches(['\n', '\r']);
            match stream {
                OutputStream::Error => error!(method = %event.kind, "{text}"),
                OutputStream::Normal => info!(method = %event.kind, "{text}"),
            }
        }
        _ => {
            let msg = match &event.thread {
                Some(thread) => format!(
                    "{}: Thread=({}, {}, {})",
                    event.kind, thread.id, thread.name, thread.location
                ),
                None => event.kind.to_string(),
            };
            if verbose {
                info!(payload = ?event.payload, "{msg}");
            } else {
                debug!(payload = ?event.payload, "{msg}");
            }
        }
    }
}
