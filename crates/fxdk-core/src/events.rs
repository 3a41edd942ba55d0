//! Dynamic handler registration
//!
//! A [`HandlerSet`] is a list of callbacks for one event type. Every registration returns a
//! [`SubscriptionId`] that releases exactly that handler. A [`SubscriptionScope`] groups the
//! registrations made for one owner (an IPC connection) so they can be released together.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Command addressed to a single resource inside the running server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceCommand {
    Restart(String),
    Stop(String),
    Start(String),
    /// Ask the bridge resource for a resource state snapshot
    RequestState,
}

/// Token identifying one registration in a [`HandlerSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Handlers<T> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Handler<T>)>,
}

/// Shared set of event handlers
pub struct HandlerSet<T> {
    inner: Arc<Mutex<Handlers<T>>>,
}

impl<T> Clone for HandlerSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for HandlerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandlerSet<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Handlers {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Handlers<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut handlers = self.lock();
        let id = SubscriptionId(handlers.next_id);
        handlers.next_id += 1;
        handlers.entries.push((id, Arc::new(handler)));
        id
    }

    /// Release a handler. Returns false if it was already released.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.entries.len();
        handlers.entries.retain(|(entry_id, _)| *entry_id != id);
        handlers.entries.len() != before
    }

    /// Invoke every registered handler, returning how many ran
    pub fn emit(&self, event: &T) -> usize {
        // Handlers run outside the lock so they may (un)subscribe themselves.
        let snapshot: Vec<Handler<T>> = self
            .lock()
            .entries
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registrations owned by one scope, released together.
///
/// Dropping the scope releases whatever is still registered.
pub struct SubscriptionScope<T> {
    set: HandlerSet<T>,
    ids: Vec<SubscriptionId>,
}

impl<T> SubscriptionScope<T> {
    pub fn new(set: &HandlerSet<T>) -> Self {
        Self {
            set: set.clone(),
            ids: Vec::new(),
        }
    }

    /// Register a handler whose lifetime is tied to this scope
    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.set.subscribe(handler);
        self.ids.push(id);
        id
    }

    /// Number of live registrations in this scope
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Release every registration made through this scope
    pub fn release(&mut self) -> usize {
        let set = &self.set;
        let released = self.ids.drain(..).filter(|id| set.unsubscribe(*id)).count();
        if released > 0 {
            debug!("Released {} handler(s)", released);
        }
        released
    }
}

impl<T> Drop for SubscriptionScope<T> {
    fn drop(&mut self) {
        self.release();
    }
}
