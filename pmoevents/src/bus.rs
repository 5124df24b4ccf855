//! Priority-ordered synchronous event bus.
//!
//! Listeners are grouped by event key and kept sorted by ascending priority;
//! listeners sharing a priority keep their insertion order. `publish` runs
//! every listener for the event's key on the calling thread, in order, before
//! returning.

use crate::error::{BusError, Result};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;
use uuid::Uuid;

/// An event that can travel through an [`EventBus`].
///
/// The key selects which listeners receive the event.
pub trait BusEvent: Send + Sync + 'static {
    type Key: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

/// Stable identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Registration options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Remove the listener right after its first invocation.
    pub once: bool,
    /// Lower values run first.
    pub priority: i32,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription<K> {
    id: ListenerId,
    key: K,
    priority: i32,
    once: bool,
}

impl<K: Copy> Subscription<K> {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn key(&self) -> K {
        self.key
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_once(&self) -> bool {
        self.once
    }
}

/// Either a subscription handle or a bare listener id.
#[derive(Debug, Clone, Copy)]
pub enum ListenerRef<K> {
    Handle(Subscription<K>),
    Id(ListenerId),
}

impl<K> From<Subscription<K>> for ListenerRef<K> {
    fn from(value: Subscription<K>) -> Self {
        Self::Handle(value)
    }
}

impl<K: Copy> From<&Subscription<K>> for ListenerRef<K> {
    fn from(value: &Subscription<K>) -> Self {
        Self::Handle(*value)
    }
}

impl<K> From<ListenerId> for ListenerRef<K> {
    fn from(value: ListenerId) -> Self {
        Self::Id(value)
    }
}

/// What a listener receives for one invocation.
pub struct Dispatch<'a, E: BusEvent> {
    event: &'a E,
    subscription: Subscription<E::Key>,
    stopped: &'a Cell<bool>,
}

impl<'a, E: BusEvent> Dispatch<'a, E> {
    pub fn data(&self) -> &'a E {
        self.event
    }

    pub fn subscription(&self) -> Subscription<E::Key> {
        self.subscription
    }

    /// Skip the remaining listeners of the current `publish` call.
    ///
    /// Listeners already invoked and later `publish` calls are unaffected.
    pub fn stop_propagation(&self) {
        self.stopped.set(true);
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.stopped.get()
    }
}

type Callback<E> = Arc<dyn Fn(&Dispatch<'_, E>) + Send + Sync>;

struct Listener<E: BusEvent> {
    subscription: Subscription<E::Key>,
    callback: Callback<E>,
}

impl<E: BusEvent> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            subscription: self.subscription,
            callback: Arc::clone(&self.callback),
        }
    }
}

struct BusState<E: BusEvent> {
    listeners: HashMap<E::Key, Vec<Listener<E>>>,
    torn_down: bool,
}

/// Typed publish/subscribe dispatcher.
///
/// ```
/// use pmoevents::{BusEvent, EventBus, SubscribeOptions};
///
/// #[derive(Debug)]
/// struct Warn(u8);
///
/// impl BusEvent for Warn {
///     type Key = &'static str;
///     fn key(&self) -> Self::Key {
///         "warn"
///     }
/// }
///
/// let bus: EventBus<Warn> = EventBus::new("example");
/// bus.subscribe("warn", SubscribeOptions::new().priority(100), |d| {
///     if d.data().0 >= 10 {
///         d.stop_propagation();
///     }
/// })?;
/// bus.publish(Warn(3))?;
/// # Ok::<(), pmoevents::BusError>(())
/// ```
pub struct EventBus<E: BusEvent> {
    label: String,
    state: Mutex<BusState<E>>,
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EventBus")
            .field("label", &self.label)
            .field("keys", &state.listeners.len())
            .field("torn_down", &state.torn_down)
            .finish()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(BusState {
                listeners: HashMap::new(),
                torn_down: false,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn lock(&self) -> MutexGuard<'_, BusState<E>> {
        // Callbacks never run under the lock, a poisoned guard still holds consistent data.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn torn_down(&self) -> BusError {
        BusError::TornDown(self.label.clone())
    }

    /// Register `callback` for events whose key is `key`.
    pub fn subscribe<F>(
        &self,
        key: E::Key,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscription<E::Key>>
    where
        F: Fn(&Dispatch<'_, E>) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        if state.torn_down {
            return Err(self.torn_down());
        }

        let subscription = Subscription {
            id: ListenerId::new(),
            key,
            priority: options.priority,
            once: options.once,
        };
        let listeners = state.listeners.entry(key).or_default();
        let position = listeners.partition_point(|l| l.subscription.priority <= options.priority);
        listeners.insert(
            position,
            Listener {
                subscription,
                callback: Arc::new(callback),
            },
        );

        trace!(bus = %self.label, ?key, listener = %subscription.id, "Listener added");
        Ok(subscription)
    }

    /// Dispatch `event` to the listeners of its key.
    pub fn publish(&self, event: E) -> Result<()> {
        self.publish_ref(&event)
    }

    /// Same as [`publish`](Self::publish) without taking ownership.
    ///
    /// The listener list is captured when the call starts: listeners added
    /// during dispatch only see later events, listeners removed during
    /// dispatch are skipped. A teardown requested during dispatch halts it
    /// before the next listener.
    pub fn publish_ref(&self, event: &E) -> Result<()> {
        let key = event.key();
        let snapshot: Vec<Listener<E>> = {
            let state = self.lock();
            if state.torn_down {
                return Err(self.torn_down());
            }
            state.listeners.get(&key).cloned().unwrap_or_default()
        };

        let stopped = Cell::new(false);
        for listener in snapshot {
            if !self.claim(key, &listener.subscription) {
                let state = self.lock();
                if state.torn_down {
                    break;
                }
                continue;
            }

            let dispatch = Dispatch {
                event,
                subscription: listener.subscription,
                stopped: &stopped,
            };
            (listener.callback)(&dispatch);

            if stopped.get() {
                trace!(bus = %self.label, ?key, listener = %listener.subscription.id, "Propagation stopped");
                break;
            }
        }

        Ok(())
    }

    /// Check that the listener is still registered, dropping it first when it
    /// is a one-shot listener so it can never run twice.
    fn claim(&self, key: E::Key, subscription: &Subscription<E::Key>) -> bool {
        let mut state = self.lock();
        if state.torn_down {
            return false;
        }
        let Some(listeners) = state.listeners.get_mut(&key) else {
            return false;
        };
        let Some(position) = listeners
            .iter()
            .position(|l| l.subscription.id == subscription.id)
        else {
            return false;
        };
        if subscription.once {
            listeners.remove(position);
        }
        true
    }

    /// Remove a listener, returning whether one was actually removed.
    pub fn unsubscribe(&self, target: impl Into<ListenerRef<E::Key>>) -> Result<bool> {
        let mut state = self.lock();
        if state.torn_down {
            return Err(self.torn_down());
        }

        let removed = match target.into() {
            ListenerRef::Handle(subscription) => state
                .listeners
                .get_mut(&subscription.key)
                .map(|listeners| remove_listener(listeners, subscription.id))
                .unwrap_or(false),
            ListenerRef::Id(id) => state
                .listeners
                .values_mut()
                .any(|listeners| remove_listener(listeners, id)),
        };

        Ok(removed)
    }

    /// Drop every listener. The bus is unusable afterwards.
    pub fn teardown(&self) -> Result<()> {
        let mut state = self.lock();
        if state.torn_down {
            return Err(self.torn_down());
        }
        state.torn_down = true;
        state.listeners.clear();
        trace!(bus = %self.label, "Event bus torn down");
        Ok(())
    }

    pub fn is_torn_down(&self) -> bool {
        self.lock().torn_down
    }

    pub fn listener_count(&self, key: E::Key) -> usize {
        self.lock().listeners.get(&key).map(Vec::len).unwrap_or(0)
    }
}

fn remove_listener<E: BusEvent>(listeners: &mut Vec<Listener<E>>, id: ListenerId) -> bool {
    let before = listeners.len();
    listeners.retain(|l| l.subscription.id != id);
    listeners.len() != before
}
