//! Cancellation and resource-lifecycle scopes.
//!
//! # Responsibilities
//! - Provide one composable primitive for "run cleanup exactly once"
//! - Fire abort callbacks in registration order on cancellation
//! - Fire end callbacks when the scope completes, cancelled or not
//! - Derive child scopes whose cancellation flows parent → child only
//!
//! # Design Decisions
//! - Once a callback set has been notified it is frozen: late registration
//!   logs a warning and returns an inert handle, it never panics. Defensive
//!   code must not cascade failures.
//! - A callback may unregister itself or a sibling mid-notification without
//!   skipping or double-running others (slots are consumed front-to-front
//!   under per-extraction locking, removal deletes by id).
//! - Callbacks run with the internal lock released, so re-entrant calls
//!   (abort inside an abort callback, unregistering a sibling) cannot
//!   deadlock.

mod race;

pub use race::{race, Contender};

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;

use crate::error::Aborted;

type Callback = Box<dyn FnOnce() + Send>;

/// Which callback list a handle points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Abort,
    End,
}

struct Slot {
    id: u64,
    cb: Callback,
}

struct Inner {
    aborted: bool,
    ended: bool,
    abort_frozen: bool,
    end_frozen: bool,
    next_id: u64,
    abort_callbacks: Vec<Slot>,
    end_callbacks: Vec<Slot>,
}

impl Inner {
    fn list(&mut self, list: List) -> &mut Vec<Slot> {
        match list {
            List::Abort => &mut self.abort_callbacks,
            List::End => &mut self.end_callbacks,
        }
    }
}

/// A cancellation scope. Cheap to clone; clones share state.
///
/// Created per server start, per connection, per request and per push
/// stream. All registered cleanup fires exactly once, on abort or on
/// [`end`](Operation::end), whichever comes first for the given list.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<Mutex<Inner>>,
    abort_tx: Arc<watch::Sender<bool>>,
    settled_tx: Arc<watch::Sender<bool>>,
}

impl Operation {
    /// Start a new root scope.
    pub fn start() -> Self {
        let (abort_tx, _) = watch::channel(false);
        let (settled_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                aborted: false,
                ended: false,
                abort_frozen: false,
                end_frozen: false,
                next_id: 1,
                abort_callbacks: Vec::new(),
                end_callbacks: Vec::new(),
            })),
            abort_tx: Arc::new(abort_tx),
            settled_tx: Arc::new(settled_tx),
        }
    }

    fn register(&self, list: List, cb: Callback) -> CallbackHandle {
        let mut inner = self.inner.lock().expect("operation lock poisoned");
        let frozen = match list {
            List::Abort => inner.abort_frozen,
            List::End => inner.end_frozen,
        };
        if frozen {
            tracing::warn!(
                list = ?list,
                "callback registered after scope was notified; ignoring"
            );
            return CallbackHandle::inert();
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.list(list).push(Slot { id, cb });
        CallbackHandle {
            inner: Arc::downgrade(&self.inner),
            id,
            list,
        }
    }

    /// Register a callback to run when the scope is aborted.
    pub fn on_abort(&self, f: impl FnOnce() + Send + 'static) -> CallbackHandle {
        self.register(List::Abort, Box::new(f))
    }

    /// Register a callback to run when the scope ends, aborted or not.
    pub fn on_end(&self, f: impl FnOnce() + Send + 'static) -> CallbackHandle {
        self.register(List::End, Box::new(f))
    }

    /// Take the next pending callback from `list`, holding the lock only
    /// for the extraction so callbacks run unlocked.
    fn take_next(&self, list: List) -> Option<Callback> {
        let mut inner = self.inner.lock().expect("operation lock poisoned");
        let slots = inner.list(list);
        if slots.is_empty() {
            None
        } else {
            Some(slots.remove(0).cb)
        }
    }

    /// Cancel the scope: freeze the abort list, run abort callbacks in
    /// registration order, then complete the scope (end callbacks).
    pub fn abort(&self) {
        {
            let mut inner = self.inner.lock().expect("operation lock poisoned");
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            inner.abort_frozen = true;
        }
        let _ = self.abort_tx.send(true);
        while let Some(cb) = self.take_next(List::Abort) {
            cb();
        }
        self.end(false);
    }

    /// Complete the scope: freeze the end list and run end callbacks once.
    ///
    /// With `abort_after_end` the scope is additionally aborted afterwards,
    /// which force-detaches once-style external listeners that only clean
    /// up on abort.
    pub fn end(&self, abort_after_end: bool) {
        let already = {
            let mut inner = self.inner.lock().expect("operation lock poisoned");
            let already = inner.ended;
            inner.ended = true;
            inner.end_frozen = true;
            already
        };
        if !already {
            while let Some(cb) = self.take_next(List::End) {
                cb();
            }
            let _ = self.settled_tx.send(true);
        }
        if abort_after_end {
            self.abort();
        }
    }

    /// Whether the scope has been cancelled.
    pub fn is_aborted(&self) -> bool {
        self.inner.lock().expect("operation lock poisoned").aborted
    }

    /// Whether the scope has completed (ended or aborted).
    pub fn is_settled(&self) -> bool {
        let inner = self.inner.lock().expect("operation lock poisoned");
        inner.aborted || inner.ended
    }

    /// Fail immediately if the scope was already cancelled.
    pub fn throw_if_aborted(&self) -> Result<(), Aborted> {
        if self.is_aborted() {
            Err(Aborted)
        } else {
            Ok(())
        }
    }

    /// Resolve when the scope is aborted. Never resolves on a normal end.
    pub async fn cancelled(&self) {
        let mut rx = self.abort_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        // Sender lives inside self, so changed() only errors once every
        // clone of the scope is gone.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    /// Resolve when the scope has settled (ended or aborted).
    pub async fn settled(&self) {
        if self.is_settled() {
            return;
        }
        let mut abort_rx = self.abort_tx.subscribe();
        let mut settle_rx = self.settled_tx.subscribe();
        loop {
            if self.is_settled() {
                return;
            }
            tokio::select! {
                r = abort_rx.changed() => { if r.is_err() { return; } }
                r = settle_rx.changed() => { if r.is_err() { return; } }
            }
        }
    }

    /// Derive a child scope. Aborting the parent aborts the child; the
    /// child's own abort or end never touches the parent. A normal parent
    /// end detaches the link.
    pub fn fork(&self) -> Operation {
        let child = Operation::start();
        let linked = child.clone();
        let link = self.on_abort(move || linked.abort());
        let detach = {
            let link = link.clone();
            self.on_end(move || link.unregister())
        };
        // A settled child gives its slots in the parent back, so a
        // long-lived parent (a keep-alive connection forking per request)
        // does not accumulate dead links.
        child.on_end(move || {
            link.unregister();
            detach.unregister();
        });
        child
    }

    /// Guard this scope with the calling future's lifetime: dropping the
    /// guard aborts the scope, [`complete`](ScopeGuard::complete) ends it
    /// normally. Transports hold one per request so a service future
    /// dropped mid-flight (peer hang-up) still settles its scope.
    pub fn guard(&self) -> ScopeGuard {
        ScopeGuard {
            op: Some(self.clone()),
        }
    }

    /// Link an external cancellation signal (a `watch` channel carrying
    /// `true` once cancelled) into this scope. The bridge detaches itself
    /// when either side fires or the scope ends; nothing leaks.
    pub fn link_signal(&self, mut rx: watch::Receiver<bool>) {
        if *rx.borrow() {
            self.abort();
            return;
        }
        let op = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = rx.changed() => {
                        match res {
                            Ok(()) if *rx.borrow() => {
                                op.abort();
                                return;
                            }
                            Ok(()) => continue,
                            Err(_) => return,
                        }
                    }
                    _ = op.settled() => return,
                }
            }
        });
    }

    /// Install a private cancellation origin. `setup` receives a handle to
    /// this scope (so the origin can abort it) and returns a teardown
    /// closure that runs exactly once, on abort or end, whichever first.
    pub fn abort_source<S, T>(&self, setup: S)
    where
        S: FnOnce(Operation) -> T,
        T: FnOnce() + Send + 'static,
    {
        let teardown = setup(self.clone());
        if self.is_settled() {
            teardown();
            return;
        }
        let teardown = Arc::new(Mutex::new(Some(teardown)));
        let on_abort = Arc::clone(&teardown);
        self.on_abort(move || {
            if let Some(t) = on_abort.lock().expect("teardown lock poisoned").take() {
                t();
            }
        });
        self.on_end(move || {
            if let Some(t) = teardown.lock().expect("teardown lock poisoned").take() {
                t();
            }
        });
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("operation lock poisoned");
        f.debug_struct("Operation")
            .field("aborted", &inner.aborted)
            .field("ended", &inner.ended)
            .field("abort_callbacks", &inner.abort_callbacks.len())
            .field("end_callbacks", &inner.end_callbacks.len())
            .finish()
    }
}

/// Settles a scope with the holding future's lifetime: dropped before
/// [`complete`](ScopeGuard::complete), it aborts the scope.
#[must_use = "a guard that is dropped immediately aborts the scope"]
pub struct ScopeGuard {
    op: Option<Operation>,
}

impl ScopeGuard {
    /// The guarded work finished; end the scope normally.
    pub fn complete(mut self) {
        if let Some(op) = self.op.take() {
            op.end(false);
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            op.abort();
        }
    }
}

/// Unregisters a previously registered callback. Safe to call at any time,
/// including from inside another callback of the same scope.
#[derive(Clone)]
pub struct CallbackHandle {
    inner: Weak<Mutex<Inner>>,
    id: u64,
    list: List,
}

impl CallbackHandle {
    fn inert() -> Self {
        Self {
            inner: Weak::new(),
            id: 0,
            list: List::Abort,
        }
    }

    /// Remove the callback. A callback that already ran (or was already
    /// removed) is a no-op; it never fires after this returns.
    pub fn unregister(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock().expect("operation lock poisoned");
        let id = self.id;
        let slots = inner.list(self.list);
        if let Some(pos) = slots.iter().position(|s| s.id == id) {
            slots.remove(pos);
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("list", &self.list)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let c = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&c);
        (c, move || r.load(Ordering::SeqCst))
    }

    #[test]
    fn abort_callbacks_fire_once_in_order() {
        let op = Operation::start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            op.on_abort(move || order.lock().unwrap().push(n));
        }
        op.abort();
        op.abort(); // second notify is a no-op
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn end_callbacks_fire_after_abort_callbacks() {
        let op = Operation::start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        op.on_end(move || o1.lock().unwrap().push("end"));
        let o2 = Arc::clone(&order);
        op.on_abort(move || o2.lock().unwrap().push("abort"));
        op.abort();
        assert_eq!(*order.lock().unwrap(), vec!["abort", "end"]);
    }

    #[test]
    fn unregister_during_notification_skips_nothing_else() {
        let op = Operation::start();
        let (count, read) = counter();

        // First callback removes the second; third must still run.
        let second = Arc::new(Mutex::new(None::<CallbackHandle>));
        let s = Arc::clone(&second);
        op.on_abort(move || {
            if let Some(h) = s.lock().unwrap().take() {
                h.unregister();
            }
        });
        let c = Arc::clone(&count);
        let h = op.on_abort(move || {
            c.fetch_add(10, Ordering::SeqCst);
        });
        *second.lock().unwrap() = Some(h);
        let c = Arc::clone(&count);
        op.on_abort(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        op.abort();
        assert_eq!(read(), 1, "removed sibling fired or later sibling skipped");
    }

    #[test]
    fn registration_after_notify_is_inert_not_fatal() {
        let op = Operation::start();
        op.abort();
        let (count, read) = counter();
        let c = Arc::clone(&count);
        let handle = op.on_abort(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        handle.unregister();
        assert_eq!(read(), 0);
    }

    #[test]
    fn fork_aborts_child_not_parent() {
        let parent = Operation::start();
        let child = parent.fork();
        child.abort();
        assert!(!parent.is_aborted());

        let parent = Operation::start();
        let child = parent.fork();
        parent.abort();
        assert!(child.is_aborted());
    }

    #[test]
    fn completed_fork_releases_parent_slots() {
        let parent = Operation::start();
        for _ in 0..64 {
            parent.fork().end(false);
        }
        let inner = parent.inner.lock().unwrap();
        assert_eq!(inner.abort_callbacks.len(), 0);
        assert_eq!(inner.end_callbacks.len(), 0);
    }

    #[test]
    fn aborted_fork_releases_parent_slots() {
        let parent = Operation::start();
        for _ in 0..8 {
            parent.fork().abort();
        }
        let inner = parent.inner.lock().unwrap();
        assert_eq!(inner.abort_callbacks.len(), 0);
        assert_eq!(inner.end_callbacks.len(), 0);
    }

    #[test]
    fn dropped_guard_aborts_the_scope() {
        let op = Operation::start();
        let (count, read) = counter();
        let c = Arc::clone(&count);
        op.on_end(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        {
            let _guard = op.guard();
        }
        assert!(op.is_aborted());
        assert_eq!(read(), 1, "end callbacks must run when the guard aborts");
    }

    #[test]
    fn completed_guard_ends_without_aborting() {
        let op = Operation::start();
        let guard = op.guard();
        guard.complete();
        assert!(op.is_settled());
        assert!(!op.is_aborted());
    }

    #[test]
    fn parent_end_detaches_fork_link() {
        let parent = Operation::start();
        let child = parent.fork();
        parent.end(false);
        // Aborting a parent that already ended normally must not reach the
        // detached child.
        parent.abort();
        assert!(!child.is_aborted());
    }

    #[test]
    fn end_with_abort_after_end_runs_both_lists() {
        let op = Operation::start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        op.on_abort(move || o.lock().unwrap().push("abort"));
        let o = Arc::clone(&order);
        op.on_end(move || o.lock().unwrap().push("end"));
        op.end(true);
        assert_eq!(*order.lock().unwrap(), vec!["end", "abort"]);
    }

    #[test]
    fn throw_if_aborted() {
        let op = Operation::start();
        assert!(op.throw_if_aborted().is_ok());
        op.abort();
        assert!(op.throw_if_aborted().is_err());
    }

    #[tokio::test]
    async fn cancelled_resolves_on_abort() {
        let op = Operation::start();
        let waiter = op.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        op.abort();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn link_signal_aborts_scope() {
        let (tx, rx) = watch::channel(false);
        let op = Operation::start();
        op.link_signal(rx);
        tx.send(true).unwrap();
        // The bridge task needs a poll to observe the change.
        for _ in 0..20 {
            if op.is_aborted() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(op.is_aborted());
    }

    #[test]
    fn abort_source_teardown_runs_once() {
        let op = Operation::start();
        let (count, read) = counter();
        let c = Arc::clone(&count);
        op.abort_source(|_op| move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        op.abort();
        op.end(false);
        assert_eq!(read(), 1);
    }
}
