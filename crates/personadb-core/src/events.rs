//! Change notifications for the persona database
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  EventBus                                                       │
//! │  ├── queue: VecDeque<PersonaEvent>                              │
//! │  │   └── filled by committed transactions (post-commit queue)   │
//! │  ├── subscribers: Vec<(id, filter, handler)>                    │
//! │  │   └── called synchronously, in registration order            │
//! │  ├── broadcast_tx: broadcast::Sender<PersonaEvent>              │
//! │  │   └── async observers                                        │
//! │  └── notify: wakes the dispatcher task                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Emitting never delivers inline. Events sit in the queue until
//! [`EventBus::dispatch_pending`] runs, either called directly or from the
//! task started by [`EventBus::spawn_dispatcher`]. This keeps observers from
//! re-entering the store while a write is still on the call stack.
//!
//! Delivery is in-memory only; nothing survives a restart.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tracing::trace;

use crate::types::ProfileRecord;

/// Default buffer size for the broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a profile shows up in a `ProfilesChanged` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeReason {
    New,
    Update,
    Delete,
}

/// One entry of a `ProfilesChanged` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileChange {
    pub reason: ChangeReason,
    /// The affected record, if it could be read
    pub of: Option<ProfileRecord>,
}

impl ProfileChange {
    pub fn new(reason: ChangeReason, of: Option<ProfileRecord>) -> Self {
        Self { reason, of }
    }
}

/// Events published after a write transaction commits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum PersonaEvent {
    PersonaCreated,
    PersonaUpdated,
    IdentityCreated,
    IdentityUpdated,
    ProfilesChanged(Vec<ProfileChange>),
}

impl PersonaEvent {
    pub fn name(&self) -> EventName {
        match self {
            PersonaEvent::PersonaCreated => EventName::PersonaCreated,
            PersonaEvent::PersonaUpdated => EventName::PersonaUpdated,
            PersonaEvent::IdentityCreated => EventName::IdentityCreated,
            PersonaEvent::IdentityUpdated => EventName::IdentityUpdated,
            PersonaEvent::ProfilesChanged(_) => EventName::ProfilesChanged,
        }
    }

    /// `ProfilesChanged` with a single entry
    pub fn profile_changed(reason: ChangeReason, of: Option<ProfileRecord>) -> Self {
        PersonaEvent::ProfilesChanged(vec![ProfileChange::new(reason, of)])
    }
}

/// Name of an event, used to filter subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventName {
    PersonaCreated,
    PersonaUpdated,
    IdentityCreated,
    IdentityUpdated,
    ProfilesChanged,
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventName::PersonaCreated => "personaCreated",
            EventName::PersonaUpdated => "personaUpdated",
            EventName::IdentityCreated => "identityCreated",
            EventName::IdentityUpdated => "identityUpdated",
            EventName::ProfilesChanged => "profilesChanged",
        };
        f.write_str(name)
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&PersonaEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    filter: Option<EventName>,
    handler: Handler,
}

struct EventBusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    queue: Mutex<VecDeque<PersonaEvent>>,
    /// Held while delivering so batches never interleave
    dispatching: Mutex<()>,
    broadcast_tx: broadcast::Sender<PersonaEvent>,
    notify: Arc<Notify>,
    next_id: AtomicU64,
}

impl Drop for EventBusInner {
    fn drop(&mut self) {
        // Let a parked dispatcher task observe that the bus is gone.
        self.notify.notify_one();
    }
}

/// In-process publish/subscribe bus. Clones share the same queue and
/// subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }

    /// Create a bus whose broadcast channel buffers `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventBusInner {
                subscribers: RwLock::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                dispatching: Mutex::new(()),
                broadcast_tx,
                notify: Arc::new(Notify::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler for one event name.
    pub fn on<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&PersonaEvent) + Send + Sync + 'static,
    {
        self.register(Some(name), Arc::new(handler))
    }

    /// Register a handler for every event.
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PersonaEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, filter: Option<EventName>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.write().push(Subscriber {
            id,
            filter,
            handler,
        });
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Receive every delivered event asynchronously.
    ///
    /// If the receiver falls behind, older events are dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<PersonaEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Queue an event for the next dispatch.
    pub fn emit(&self, event: PersonaEvent) {
        trace!(event = %event.name(), "Queued event");
        self.inner.queue.lock().push_back(event);
        self.inner.notify.notify_one();
    }

    /// Queue a batch, preserving order.
    pub fn emit_all(&self, events: impl IntoIterator<Item = PersonaEvent>) {
        let mut queue = self.inner.queue.lock();
        let before = queue.len();
        queue.extend(events);
        let added = queue.len() - before;
        drop(queue);
        if added > 0 {
            trace!(count = added, "Queued events");
            self.inner.notify.notify_one();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Deliver every queued event, including events queued by handlers
    /// while this runs. Returns how many were delivered.
    ///
    /// A call made while another dispatch is in progress (for example from
    /// inside a handler) returns 0 immediately; the running dispatch picks
    /// up whatever was queued.
    pub fn dispatch_pending(&self) -> usize {
        let Some(_guard) = self.inner.dispatching.try_lock() else {
            return 0;
        };

        let mut delivered = 0;
        loop {
            let batch: Vec<PersonaEvent> = self.inner.queue.lock().drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for event in batch {
                self.deliver(&event);
                delivered += 1;
            }
        }
        delivered
    }

    fn deliver(&self, event: &PersonaEvent) {
        let name = event.name();
        let handlers: Vec<Handler> = self
            .inner
            .subscribers
            .read()
            .iter()
            .filter(|s| s.filter.map_or(true, |f| f == name))
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            handler(event);
        }

        // Ignore errors if no async subscribers
        let _ = self.inner.broadcast_tx.send(event.clone());
    }

    /// Start a task that dispatches whenever events are queued.
    ///
    /// The task ends once every clone of this bus has been dropped.
    pub fn spawn_dispatcher(&self) -> tokio::task::JoinHandle<()> {
        let notify = self.inner.notify.clone();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                notify.notified().await;
                match weak.upgrade() {
                    Some(inner) => {
                        EventBus { inner }.dispatch_pending();
                    }
                    None => break,
                }
            }
            trace!("Event dispatcher stopped");
        })
    }
}
