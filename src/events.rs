//! Typed event emitter shared by the pipeline components.
//!
//! Each component exposes a closed event enum and an [`EventEmitter`] over
//! it. Handlers are plain closures; a panicking handler is caught and logged
//! so one bad subscriber cannot break the emitter or its siblings.

use log::warn;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

/// Identifier returned by [`EventEmitter::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Box<dyn FnMut(&E) + Send>;

struct Inner<E> {
    handlers: Vec<(SubscriptionId, Handler<E>)>,
    next_id: u64,
}

/// Multi-subscriber event emitter over a component's event enum.
///
/// Cloning the emitter clones a handle to the same subscriber list, so a
/// component can hand out emit-capable clones to its background tasks.
pub struct EventEmitter<E> {
    inner: Arc<Mutex<Inner<E>>>,
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                handlers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Registers a handler and returns its subscription id.
    pub fn on<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&E) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.handlers.push((id, Box::new(handler)));
        id
    }

    /// Removes a handler. Returns false if the id was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.handlers.len();
        inner.handlers.retain(|(sub_id, _)| *sub_id != id);
        inner.handlers.len() != before
    }

    /// Delivers an event to every handler in subscription order.
    ///
    /// Handlers run without the subscriber lock held, so a handler may call
    /// [`EventEmitter::on`], [`EventEmitter::off`], or emit on this same
    /// emitter; handlers subscribed during delivery first see the next
    /// event, and a reentrant emit skips the handlers already running. A
    /// panicking handler is caught, logged, and removed; remaining handlers
    /// still receive the event.
    pub fn emit(&self, event: &E) {
        let mut batch = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut inner.handlers)
        };
        let mut poisoned = Vec::new();
        for (id, handler) in batch.iter_mut() {
            let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                warn!("event handler {:?} panicked; removing it", id);
                poisoned.push(*id);
            }
        }
        batch.retain(|(id, _)| !poisoned.contains(id));

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let added = std::mem::replace(&mut inner.handlers, batch);
        inner.handlers.extend(added);
    }

    /// Number of live subscriptions.
    pub fn handler_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handlers
            .len()
    }
}
