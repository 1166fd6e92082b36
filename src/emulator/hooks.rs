//! Ordered hook/callback dispatch (spec.md §3 "Hooks", SPEC_FULL.md §4).
//!
//! The original's `CallbackHook<Args...>` template is a function-pointer
//! registry with insertion-order iteration and a "remove during dispatch;
//! sweep after" contract. A trait-object registry gets the same contract
//! without the C++ template machinery.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct Entry<Args> {
    id: HookId,
    removed: bool,
    callback: Box<dyn FnMut(Args)>,
}

/// An ordered collection of callbacks, all sharing one argument shape.
/// Registration order is dispatch order. A callback may remove itself or
/// another hook mid-dispatch: the removal is recorded and swept after the
/// current dispatch finishes, so iteration never observes a torn list.
pub struct Hooks<Args> {
    entries: Vec<Entry<Args>>,
    next_id: u64,
    dispatching: bool,
}

impl<Args: Copy> Default for Hooks<Args> {
    fn default() -> Self {
        Hooks { entries: Vec::new(), next_id: 0, dispatching: false }
    }
}

impl<Args: Copy> Hooks<Args> {
    pub fn new() -> Hooks<Args> {
        Hooks::default()
    }

    pub fn register(&mut self, callback: impl FnMut(Args) + 'static) -> HookId {
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry { id, removed: false, callback: Box::new(callback) });
        id
    }

    /// Unregister a hook. Safe to call from inside a callback that is
    /// itself running as part of the current [`Hooks::dispatch`].
    pub fn remove(&mut self, id: HookId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.removed = true;
        }
        if !self.dispatching {
            self.sweep();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.removed)
    }

    pub fn dispatch(&mut self, args: Args) {
        self.dispatching = true;
        let mut i = 0;
        while i < self.entries.len() {
            if !self.entries[i].removed {
                (self.entries[i].callback)(args);
            }
            i += 1;
        }
        self.dispatching = false;
        self.sweep();
    }

    fn sweep(&mut self) {
        self.entries.retain(|e| !e.removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn dispatch_runs_hooks_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut hooks: Hooks<u32> = Hooks::new();
        let o1 = order.clone();
        hooks.register(move |addr| o1.lock().unwrap().push((1, addr)));
        let o2 = order.clone();
        hooks.register(move |addr| o2.lock().unwrap().push((2, addr)));
        hooks.dispatch(42);
        assert_eq!(*order.lock().unwrap(), vec![(1, 42), (2, 42)]);
    }

    #[test]
    fn self_removal_during_dispatch_takes_effect_next_time() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut hooks: Hooks<u32> = Hooks::new();
        let calls2 = calls.clone();
        // Registered for illustration only; removed below by id before dispatch.
        let id = hooks.register(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        hooks.dispatch(0);
        hooks.remove(id);
        hooks.dispatch(0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(hooks.is_empty());
    }
}
