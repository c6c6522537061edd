#![forbid(unsafe_code)]

//! Path-keyed subscriber registry with isolated delivery.
//!
//! # Design
//!
//! [`Notifier`] maps a dotted path to the ordered list of callbacks
//! registered for exactly that path. There is no wildcard matching and no
//! bubbling from child to parent paths.
//!
//! Delivery collects the callbacks first and invokes them outside the
//! registry borrow, so a callback may subscribe, unsubscribe, or write to
//! the store. Before each call the registry is checked again, so a callback
//! removed mid-delivery is not invoked afterwards.
//!
//! # Performance
//!
//! | Operation       | Complexity                  |
//! |-----------------|-----------------------------|
//! | `subscribe()`   | O(1) amortized              |
//! | `unsubscribe()` | O(S) where S = path subscribers |
//! | `deliver()`     | O(S²) worst case (liveness re-check) |
//!
//! # Failure Modes
//!
//! - **Panicking subscriber**: the panic is caught, logged at `error`, and
//!   delivery continues with the next subscriber.
//! - **Forgotten guard**: a [`Subscription`] kept forever keeps its callback
//!   registered; use [`Subscription::detach`] to make that explicit.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use chatstate_core::Value;
use tracing::error;

/// Subscriber callback: `(new_value, old_value, path)`. `None` means the
/// path did not resolve to a value.
pub(crate) type Callback = dyn Fn(Option<&Value>, Option<&Value>, &str);

/// Opaque handle identifying one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

#[derive(Default)]
pub(crate) struct Notifier {
    subscribers: HashMap<String, Vec<(SubscriberId, Rc<Callback>)>>,
    next_id: u64,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("paths", &self.subscribers.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl Notifier {
    pub(crate) fn subscribe(&mut self, path: &str, callback: Rc<Callback>) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers
            .entry(path.to_owned())
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove one callback; drops the path entry once it is empty.
    pub(crate) fn unsubscribe(&mut self, path: &str, id: SubscriberId) -> bool {
        let Some(list) = self.subscribers.get_mut(path) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.subscribers.remove(path);
        }
        removed
    }

    pub(crate) fn is_registered(&self, path: &str, id: SubscriberId) -> bool {
        self.subscribers
            .get(path)
            .is_some_and(|list| list.iter().any(|(existing, _)| *existing == id))
    }

    pub(crate) fn callbacks_for(&self, path: &str) -> Vec<(SubscriberId, Rc<Callback>)> {
        self.subscribers.get(path).cloned().unwrap_or_default()
    }

    pub(crate) fn subscriber_count(&self, path: &str) -> usize {
        self.subscribers.get(path).map_or(0, Vec::len)
    }

    pub(crate) fn path_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Invoke every subscriber of `path` in registration order.
///
/// Takes the registry by `RefCell` so no borrow is held while callbacks run.
pub(crate) fn deliver(
    registry: &RefCell<Notifier>,
    path: &str,
    new_value: Option<&Value>,
    old_value: Option<&Value>,
) {
    let callbacks = registry.borrow().callbacks_for(path);
    for (id, callback) in callbacks {
        if !registry.borrow().is_registered(path, id) {
            continue;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            callback(new_value, old_value, path);
        }));
        if let Err(payload) = outcome {
            error!(
                path,
                subscriber = id.0,
                panic = panic_message(payload.as_ref()),
                "subscriber panicked; continuing delivery"
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// RAII guard for a path subscriber.
///
/// Dropping the `Subscription` unsubscribes the callback. Call
/// [`detach`](Self::detach) to keep the callback registered for the
/// lifetime of the store instead.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    id: SubscriberId,
    path: String,
    registry: Weak<RefCell<Notifier>>,
    active: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("active", &self.active)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(id: SubscriberId, path: &str, registry: &Rc<RefCell<Notifier>>) -> Self {
        Self {
            id,
            path: path.to_owned(),
            registry: Rc::downgrade(registry),
            active: true,
        }
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Unsubscribe now. Returns whether the callback was still registered.
    pub fn unsubscribe(mut self) -> bool {
        self.active = false;
        self.remove()
    }

    /// Keep the callback registered after this guard is gone. It can still
    /// be removed with `Store::unsubscribe(path, id)`.
    pub fn detach(mut self) -> SubscriberId {
        self.active = false;
        self.id
    }

    fn remove(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.borrow_mut().unsubscribe(&self.path, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.active {
            self.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn registry() -> Rc<RefCell<Notifier>> {
        Rc::new(RefCell::new(Notifier::default()))
    }

    fn subscribe(
        registry: &Rc<RefCell<Notifier>>,
        path: &str,
        callback: impl Fn(Option<&Value>, Option<&Value>, &str) + 'static,
    ) -> Subscription {
        let id = registry.borrow_mut().subscribe(path, Rc::new(callback));
        Subscription::new(id, path, registry)
    }

    #[test]
    fn delivers_new_old_and_path() {
        let registry = registry();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = Rc::clone(&seen);
        let _sub = subscribe(&registry, "user.name", move |new, old, path| {
            seen_clone
                .borrow_mut()
                .push((new.cloned(), old.cloned(), path.to_owned()));
        });

        deliver(&registry, "user.name", Some(&json!("Ann")), None);
        assert_eq!(
            *seen.borrow(),
            vec![(Some(json!("Ann")), None, "user.name".to_owned())]
        );
    }

    #[test]
    fn exact_path_only() {
        let registry = registry();
        let count = Rc::new(Cell::new(0u32));
        let count_clone = Rc::clone(&count);
        let _sub = subscribe(&registry, "flags", move |_, _, _| {
            count_clone.set(count_clone.get() + 1);
        });

        deliver(&registry, "flags.debug", None, None);
        deliver(&registry, "", None, None);
        assert_eq!(count.get(), 0);
        deliver(&registry, "flags", None, None);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn notification_order_is_registration_order() {
        let registry = registry();
        let log = Rc::new(RefCell::new(Vec::new()));
        let subs: Vec<Subscription> = ['A', 'B', 'C']
            .into_iter()
            .map(|tag| {
                let log = Rc::clone(&log);
                subscribe(&registry, "p", move |_, _, _| log.borrow_mut().push(tag))
            })
            .collect();

        deliver(&registry, "p", None, None);
        assert_eq!(*log.borrow(), vec!['A', 'B', 'C']);
        drop(subs);
    }

    #[test]
    fn drop_unsubscribes_and_removes_empty_path() {
        let registry = registry();
        let count = Rc::new(Cell::new(0u32));
        let count_clone = Rc::clone(&count);
        let sub = subscribe(&registry, "a", move |_, _, _| {
            count_clone.set(count_clone.get() + 1);
        });
        assert_eq!(registry.borrow().path_count(), 1);

        drop(sub);
        deliver(&registry, "a", None, None);
        assert_eq!(count.get(), 0);
        assert_eq!(registry.borrow().path_count(), 0);
    }

    #[test]
    fn partial_unsubscribe_keeps_path() {
        let registry = registry();
        let a = subscribe(&registry, "a", |_, _, _| {});
        let _b = subscribe(&registry, "a", |_, _, _| {});
        assert_eq!(registry.borrow().subscriber_count("a"), 2);

        assert!(a.unsubscribe());
        assert_eq!(registry.borrow().subscriber_count("a"), 1);
        assert_eq!(registry.borrow().path_count(), 1);
    }

    #[test]
    fn detached_subscription_outlives_guard() {
        let registry = registry();
        let count = Rc::new(Cell::new(0u32));
        let count_clone = Rc::clone(&count);
        let id = subscribe(&registry, "a", move |_, _, _| {
            count_clone.set(count_clone.get() + 1);
        })
        .detach();

        deliver(&registry, "a", None, None);
        assert_eq!(count.get(), 1);
        assert!(registry.borrow_mut().unsubscribe("a", id));
        assert!(!registry.borrow_mut().unsubscribe("a", id));
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let registry = registry();
        let reached = Rc::new(Cell::new(false));
        let reached_clone = Rc::clone(&reached);
        let _bad = subscribe(&registry, "x", |_, _, _| panic!("subscriber failure"));
        let _good = subscribe(&registry, "x", move |_, _, _| reached_clone.set(true));

        deliver(&registry, "x", Some(&json!(1)), None);
        assert!(reached.get());
    }

    #[test]
    fn unsubscribed_mid_delivery_is_skipped() {
        let registry = registry();
        let second_calls = Rc::new(Cell::new(0u32));
        let victim: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));

        let victim_clone = Rc::clone(&victim);
        let _first = subscribe(&registry, "p", move |_, _, _| {
            victim_clone.borrow_mut().take();
        });
        let calls = Rc::clone(&second_calls);
        *victim.borrow_mut() = Some(subscribe(&registry, "p", move |_, _, _| {
            calls.set(calls.get() + 1);
        }));

        deliver(&registry, "p", None, None);
        assert_eq!(second_calls.get(), 0);
        assert_eq!(registry.borrow().subscriber_count("p"), 1);
    }
}
