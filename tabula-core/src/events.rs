//! Listener lists with handle-based unsubscription.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

type Listener<E> = Rc<dyn Fn(&E)>;

struct Registry<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// A list of listeners for events of type `E`.
///
/// Cloning yields another handle to the same list. Listeners may subscribe
/// or unsubscribe while an event is being emitted; such changes take effect
/// from the next emission.
pub struct EventEmitter<E> {
    registry: Rc<RefCell<Registry<E>>>,
}

impl<E: 'static> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register `listener`. It stays registered until the returned handle is dropped.
    pub fn subscribe(&self, listener: impl Fn(&E) + 'static) -> Subscription {
        let id = {
            let mut registry = self.registry.borrow_mut();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, Rc::new(listener)));
            id
        };

        let weak = Rc::downgrade(&self.registry);
        Subscription::from_fn(move || {
            if let Some(registry) = weak.upgrade() {
                registry.borrow_mut().listeners.retain(|(key, _)| *key != id);
            }
        })
    }

    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .registry
            .borrow()
            .listeners
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry.borrow().listeners.len()
    }
}

impl<E: 'static> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Rc::clone(&self.registry),
        }
    }
}

impl<E> fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.registry.borrow().listeners.len())
            .finish()
    }
}

/// Handle returned by `subscribe`. Dropping it removes the listener.
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn from_fn(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Bundle several subscriptions into one handle.
    pub fn all(subscriptions: Vec<Subscription>) -> Self {
        Self::from_fn(move || drop(subscriptions))
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    /// Keep the listener registered for the lifetime of the emitter.
    pub fn detach(mut self) {
        self.cancel = None;
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_emit_reaches_listeners() {
        let emitter = EventEmitter::<u32>::new();
        let total = Rc::new(Cell::new(0));

        let t = Rc::clone(&total);
        let _a = emitter.subscribe(move |n| t.set(t.get() + n));
        let t = Rc::clone(&total);
        let _b = emitter.subscribe(move |n| t.set(t.get() + n * 10));

        emitter.emit(&2);
        assert_eq!(total.get(), 22);
        assert_eq!(emitter.listener_count(), 2);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let emitter = EventEmitter::<()>::new();
        let hits = Rc::new(Cell::new(0));

        let h = Rc::clone(&hits);
        let sub = emitter.subscribe(move |_| h.set(h.get() + 1));
        emitter.emit(&());
        drop(sub);
        emitter.emit(&());

        assert_eq!(hits.get(), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_subscription_all() {
        let emitter = EventEmitter::<()>::new();
        let subs = vec![emitter.subscribe(|_| {}), emitter.subscribe(|_| {})];
        let bundle = Subscription::all(subs);
        assert_eq!(emitter.listener_count(), 2);
        bundle.unsubscribe();
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_detach_keeps_listener() {
        let emitter = EventEmitter::<()>::new();
        emitter.subscribe(|_| {}).detach();
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_unsubscribe_during_emit() {
        let emitter = EventEmitter::<()>::new();
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let hits = Rc::new(Cell::new(0));

        let s = Rc::clone(&slot);
        let h = Rc::clone(&hits);
        let sub = emitter.subscribe(move |_| {
            h.set(h.get() + 1);
            s.borrow_mut().take();
        });
        *slot.borrow_mut() = Some(sub);

        emitter.emit(&());
        emitter.emit(&());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_subscription_outlives_emitter() {
        let emitter = EventEmitter::<()>::new();
        let sub = emitter.subscribe(|_| {});
        drop(emitter);
        drop(sub);
    }
}
