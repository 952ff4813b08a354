use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::ledger::{Removable, RemoveError};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listeners<E> {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback<E>>,
}

/// A host-side event source (clicks on an injected button, a page's own
/// custom events) that hands out removal tokens.
pub struct EventTarget<E> {
    name: String,
    listeners: Arc<Mutex<Listeners<E>>>,
}

impl<E: 'static> EventTarget<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `callback`. It stays registered until the returned token is
    /// removed, typically by the ledger it was added to.
    pub fn listen<F>(&self, callback: F) -> Listener
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut listeners = lock(&self.listeners);
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.callbacks.insert(id, Arc::new(callback));
            id
        };

        let weak: Weak<Mutex<Listeners<E>>> = Arc::downgrade(&self.listeners);
        Listener {
            target: self.name.clone(),
            unregister: Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    lock(&listeners).callbacks.remove(&id);
                }
            }),
        }
    }

    /// Deliver `event` to every current listener. Returns how many ran.
    pub fn dispatch(&self, event: &E) -> usize {
        // Snapshot so callbacks may add or remove listeners.
        let callbacks: Vec<Callback<E>> = lock(&self.listeners).callbacks.values().cloned().collect();
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).callbacks.len()
    }
}

impl<E> fmt::Debug for EventTarget<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("name", &self.name)
            .field("listeners", &lock(&self.listeners).callbacks.len())
            .finish()
    }
}

/// Token for one registered listener. Removing it is idempotent.
pub struct Listener {
    target: String,
    unregister: Box<dyn Fn() + Send + Sync>,
}

impl Listener {
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Removable for Listener {
    fn remove(&self) -> Result<(), RemoveError> {
        (self.unregister)();
        Ok(())
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("target", &self.target).finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
