use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nbhost_protocol::{EventKind, NotebookEvent};
use tokio::sync::broadcast;
use tracing::trace;

/// Callback registered for one [`EventKind`]. Removal compares the `Arc`.
pub type Listener = Arc<dyn Fn(&NotebookEvent) + Send + Sync>;

const CHANNEL_CAPACITY: usize = 256;

/// In-process publication of notebook events. Callback listeners run
/// synchronously in registration order; async consumers can take a
/// broadcast receiver instead.
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
    channel: broadcast::Sender<NotebookEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (channel, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            listeners: Mutex::new(HashMap::new()),
            channel,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Listener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on(&self, kind: EventKind, listener: Listener) {
        self.table().entry(kind).or_default().push(listener);
    }

    /// Removing a listener that was never added is a no-op.
    pub fn off(&self, kind: EventKind, listener: &Listener) {
        if let Some(list) = self.table().get_mut(&kind) {
            list.retain(|existing| !Arc::ptr_eq(existing, listener));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotebookEvent> {
        self.channel.subscribe()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.table().get(&kind).map_or(0, Vec::len)
    }

    pub fn emit(&self, event: NotebookEvent) {
        // Snapshot so listeners may call on/off without deadlocking.
        let listeners = self.table().get(&event.kind()).cloned().unwrap_or_default();
        trace!(kind = ?event.kind(), listeners = listeners.len(), "dispatching event");
        for listener in &listeners {
            listener(&event);
        }
        let _ = self.channel.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
