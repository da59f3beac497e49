use crate::{
    error::Result,
    record::Record,
    types::{AnyChangeListener, ChangeListener},
};
use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    fmt::Debug,
    rc::Rc,
};
use tracing::trace;

fn listener_id<T: ?Sized>(listener: &Rc<T>) -> usize {
    Rc::as_ptr(listener) as *const () as usize
}

fn same_value(a: &Option<Record>, b: &Option<Record>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.ptr_eq(b),
        _ => false,
    }
}

struct PendingCall {
    listener: ChangeListener,
    before:   Option<Record>,
    after:    Option<Record>,
}

#[derive(Default)]
struct Queues {
    unbatched:     VecDeque<PendingCall>,
    batched:       Vec<PendingCall>,
    batched_index: HashMap<usize, usize>,
    any_change:    Vec<AnyChangeListener>,
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.unbatched.is_empty() && self.batched.is_empty() && self.any_change.is_empty()
    }

    fn clear(&mut self) {
        self.unbatched.clear();
        self.batched.clear();
        self.batched_index.clear();
        self.any_change.clear();
    }
}

/// Defers and coalesces listener notifications for the duration of an operation.
///
/// Outside of a batch listeners are called right away. Inside one:
///
/// - unbatched listeners are queued in call order and flushed first; these are the internal relation listeners;
/// - a batched listener is called once, with the first `before` and the last `after` it was given;
/// - an any-change listener is called once, after everything else.
///
/// Listeners triggered while flushing are flushed in the same pass, so a cascade settles before the outermost
/// operation returns.
///
/// Notifications are only accepted while listeners are enabled, see [`ListenerBatcher::listeners_enabled`].
pub struct ListenerBatcher {
    active:  Cell<bool>,
    enabled: Cell<bool>,
    queues:  RefCell<Queues>,
}

/// Restores the previous listener-enabled state on drop.
pub struct ListenerScope<'a> {
    batcher:  &'a ListenerBatcher,
    previous: bool,
}

impl Drop for ListenerScope<'_> {
    fn drop(&mut self) {
        self.batcher.enabled.set(self.previous);
    }
}

struct BatchGuard<'a> {
    batcher: &'a ListenerBatcher,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        // Reached with non-empty queues only when the batch failed or a listener panicked.
        self.batcher.queues.borrow_mut().clear();
        self.batcher.active.set(false);
    }
}

impl ListenerBatcher {
    pub fn new() -> Self {
        Self {
            active:  Cell::new(false),
            enabled: Cell::new(false),
            queues:  RefCell::new(Queues::default()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    fn scope(&self, enabled: bool) -> ListenerScope<'_> {
        let previous = self.enabled.replace(enabled);
        ListenerScope {
            batcher: self,
            previous,
        }
    }

    /// Accept notifications until the returned scope is dropped.
    pub fn listeners_enabled(&self) -> ListenerScope<'_> {
        self.scope(true)
    }

    /// Drop notifications until the returned scope is dropped. Used for internal writes that must stay silent.
    pub fn listeners_suppressed(&self) -> ListenerScope<'_> {
        self.scope(false)
    }

    /// Run `f` as one batch and flush the collected notifications once it succeeds.
    ///
    /// Nested calls run inline as part of the outer batch. If `f` fails, pending notifications are discarded.
    pub fn batch<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.active.get() {
            return f();
        }

        self.active.set(true);
        let _guard = BatchGuard { batcher: self };
        let value = f()?;
        self.flush();
        Ok(value)
    }

    /// Notify a `(before, after)` listener.
    ///
    /// `batched` listeners are coalesced per batch; the others are queued one call per notification.
    pub fn call(&self, listener: &ChangeListener, before: Option<Record>, after: Option<Record>, batched: bool) {
        if !self.enabled.get() {
            return;
        }
        if !self.active.get() {
            listener(before, after);
            return;
        }

        let mut queues = self.queues.borrow_mut();
        if !batched {
            queues.unbatched.push_back(PendingCall {
                listener: listener.clone(),
                before,
                after,
            });
            return;
        }

        let id = listener_id(listener);
        if let Some(idx) = queues.batched_index.get(&id).copied() {
            queues.batched[idx].after = after;
        }
        else {
            let idx = queues.batched.len();
            queues.batched.push(PendingCall {
                listener: listener.clone(),
                before,
                after,
            });
            queues.batched_index.insert(id, idx);
        }
    }

    /// Notify a no-argument listener at most once per batch.
    pub fn call_all(&self, listener: &AnyChangeListener) {
        if !self.enabled.get() {
            return;
        }
        if !self.active.get() {
            listener();
            return;
        }

        let id = listener_id(listener);
        let mut queues = self.queues.borrow_mut();
        if !queues.any_change.iter().any(|queued| listener_id(queued) == id) {
            queues.any_change.push(listener.clone());
        }
    }

    fn flush(&self) {
        let _scope = self.listeners_enabled();
        let mut round = 0;
        loop {
            round += 1;
            trace!("flushing listener queues, round {round}");

            loop {
                let next = self.queues.borrow_mut().unbatched.pop_front();
                let Some(call) = next
                else {
                    break;
                };
                (call.listener)(call.before, call.after);
            }

            let batched = {
                let mut queues = self.queues.borrow_mut();
                queues.batched_index.clear();
                std::mem::take(&mut queues.batched)
            };
            for call in batched {
                if same_value(&call.before, &call.after) {
                    continue;
                }
                (call.listener)(call.before, call.after);
            }

            let any_change = std::mem::take(&mut self.queues.borrow_mut().any_change);
            for listener in any_change {
                listener();
            }

            if self.queues.borrow().is_empty() {
                break;
            }
        }
    }
}

impl Default for ListenerBatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ListenerBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBatcher")
            .field("active", &self.active.get())
            .field("enabled", &self.enabled.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{entity::EntityType, error::CacheError, registry::CacheSystem};
    use serde_json::json;

    fn records() -> (Rc<CacheSystem>, Record, Record, Record) {
        let system = CacheSystem::new();
        let user = system.register(EntityType::declare("User")).unwrap();
        let r1 = user.record(&json!({"id": 1})).unwrap();
        let r2 = user.record(&json!({"id": 2})).unwrap();
        let r3 = user.record(&json!({"id": 3})).unwrap();
        (system, r1, r2, r3)
    }

    fn recorder() -> (ChangeListener, Rc<RefCell<Vec<(Option<Record>, Option<Record>)>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        let listener: ChangeListener = Rc::new(move |before, after| sink.borrow_mut().push((before, after)));
        (listener, calls)
    }

    #[test]
    fn disabled_listeners_are_dropped() {
        let (_system, r1, ..) = records();
        let batcher = ListenerBatcher::new();
        let (listener, calls) = recorder();
        batcher.call(&listener, None, Some(r1.clone()), true);
        assert!(calls.borrow().is_empty());

        let _scope = batcher.listeners_enabled();
        batcher.call(&listener, None, Some(r1), true);
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn batched_calls_are_coalesced() {
        let (_system, r1, r2, r3) = records();
        let batcher = ListenerBatcher::new();
        let _scope = batcher.listeners_enabled();
        let (listener, calls) = recorder();

        batcher
            .batch(|| {
                batcher.call(&listener, Some(r1.clone()), Some(r2.clone()), true);
                batcher.call(&listener, Some(r2.clone()), Some(r3.clone()), true);
                Ok(())
            })
            .unwrap();

        let calls = calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.as_ref().unwrap().ptr_eq(&r1));
        assert!(calls[0].1.as_ref().unwrap().ptr_eq(&r3));
    }

    #[test]
    fn unbatched_run_first_and_any_change_last() {
        let (_system, r1, ..) = records();
        let batcher = Rc::new(ListenerBatcher::new());
        let _scope = batcher.listeners_enabled();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let batched: ChangeListener = Rc::new(move |_, _| o.borrow_mut().push("batched"));
        let o = order.clone();
        let unbatched: ChangeListener = Rc::new(move |_, _| o.borrow_mut().push("unbatched"));
        let o = order.clone();
        let any: AnyChangeListener = Rc::new(move || o.borrow_mut().push("any"));

        batcher
            .batch(|| {
                batcher.call_all(&any);
                batcher.call(&batched, None, Some(r1.clone()), true);
                batcher.call(&unbatched, None, Some(r1.clone()), false);
                batcher.call_all(&any);
                Ok(())
            })
            .unwrap();

        assert_eq!(*order.borrow(), ["unbatched", "batched", "any"]);
    }

    #[test]
    fn failed_batch_discards_notifications() {
        let (_system, r1, ..) = records();
        let batcher = ListenerBatcher::new();
        let _scope = batcher.listeners_enabled();
        let (listener, calls) = recorder();

        let result: Result<()> = batcher.batch(|| {
            batcher.call(&listener, None, Some(r1.clone()), true);
            Err(CacheError::internal("boom"))
        });
        assert!(result.is_err());
        assert!(!batcher.is_active());

        batcher.batch(|| Ok(())).unwrap();
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn listeners_fired_during_flush_are_flushed_too() {
        let (_system, r1, r2, _) = records();
        let batcher = Rc::new(ListenerBatcher::new());
        let _scope = batcher.listeners_enabled();
        let (second, calls) = recorder();

        let b = batcher.clone();
        let inner = second.clone();
        let r2c = r2.clone();
        let first: ChangeListener = Rc::new(move |_, _| b.call(&inner, None, Some(r2c.clone()), true));

        batcher
            .batch(|| {
                batcher.call(&first, None, Some(r1.clone()), false);
                Ok(())
            })
            .unwrap();

        let calls = calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.as_ref().unwrap().ptr_eq(&r2));
    }

    #[test]
    fn scopes_restore_previous_state() {
        let batcher = ListenerBatcher::new();
        assert!(!batcher.is_enabled());
        {
            let _enabled = batcher.listeners_enabled();
            assert!(batcher.is_enabled());
            {
                let _suppressed = batcher.listeners_suppressed();
                assert!(!batcher.is_enabled());
            }
            assert!(batcher.is_enabled());
        }
        assert!(!batcher.is_enabled());
    }
}
