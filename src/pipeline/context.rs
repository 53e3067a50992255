//! Cancellation scopes for the pipeline: a run-wide scope and per-file scopes derived from it.
//!
//! A [`ProcessingContext`] is cancelled explicitly (via its [`CancelHandle`] or a parent) or
//! when its deadline passes. Cancellation disconnects the scope's done channel, so every
//! blocking queue operation can `select!` against it instead of blocking unconditionally.

use crossbeam_channel::{Receiver, Sender, at, bounded, never, select};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Why a scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Canceled,
    DeadlineExceeded,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Canceled => "context canceled",
            CancelReason::DeadlineExceeded => "context deadline exceeded",
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Granularity of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Background,
    Overall,
    File,
}

struct Inner {
    scope: Scope,
    deadline: Option<Instant>,
    reason: Mutex<Option<CancelReason>>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new(scope: Scope, deadline: Option<Instant>) -> Arc<Self> {
        // Nothing is ever sent; dropping the sender is the broadcast.
        let (done_tx, done_rx) = bounded::<()>(0);
        Arc::new(Inner {
            scope,
            deadline,
            reason: Mutex::new(None),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self, reason: CancelReason) {
        {
            let mut slot = self.reason.lock().unwrap();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }
        self.done_tx.lock().unwrap().take();
        let children: Vec<Arc<Inner>> = self
            .children
            .lock()
            .unwrap()
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        for child in children {
            child.cancel(reason);
        }
    }
}

/// Cancellation scope shared by the stages of one run. Cheap to clone.
#[derive(Clone)]
pub struct ProcessingContext {
    inner: Arc<Inner>,
}

/// Cancels its scope when [`cancel`](CancelHandle::cancel) is called or when dropped.
pub struct CancelHandle {
    inner: Arc<Inner>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.inner.cancel(CancelReason::Canceled);
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.inner.cancel(CancelReason::Canceled);
    }
}

/// Cancels the scope if dropped while its thread is unwinding.
pub(crate) struct CancelOnPanic(ProcessingContext);

impl Drop for CancelOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.cancel();
        }
    }
}

impl std::fmt::Debug for ProcessingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("scope", &self.inner.scope)
            .field("deadline", &self.inner.deadline)
            .field("reason", &*self.inner.reason.lock().unwrap())
            .finish()
    }
}

impl ProcessingContext {
    /// Root scope: never cancelled, no deadline.
    pub fn background() -> Self {
        ProcessingContext {
            inner: Inner::new(Scope::Background, None),
        }
    }

    /// Child scope cancelled only by its handle or a parent.
    pub fn with_cancel(&self) -> (ProcessingContext, CancelHandle) {
        self.child(self.inner.scope, None)
    }

    /// Child scope that also ends after `timeout`.
    pub fn with_timeout(
        &self,
        scope: Scope,
        timeout: Duration,
    ) -> (ProcessingContext, CancelHandle) {
        self.child(scope, Some(timeout))
    }

    /// Child scope of the given granularity. The effective deadline never outlives the parent's.
    pub fn child(
        &self,
        scope: Scope,
        timeout: Option<Duration>,
    ) -> (ProcessingContext, CancelHandle) {
        let own_deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let deadline = match (self.inner.deadline, own_deadline) {
            (Some(p), Some(c)) => Some(p.min(c)),
            (p, c) => p.or(c),
        };
        let child = Inner::new(scope, deadline);
        {
            let mut children = self.inner.children.lock().unwrap();
            children.retain(|w| w.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // Parent may already be done; inherit that immediately.
        if let Some(reason) = self.err() {
            child.cancel(reason);
        }
        (
            ProcessingContext {
                inner: Arc::clone(&child),
            },
            CancelHandle { inner: child },
        )
    }

    pub fn scope(&self) -> Scope {
        self.inner.scope
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// `Some(reason)` once the scope is done. Notices an expired deadline lazily.
    pub fn err(&self) -> Option<CancelReason> {
        if let Some(reason) = *self.inner.reason.lock().unwrap() {
            return Some(reason);
        }
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            self.inner.cancel(CancelReason::DeadlineExceeded);
            return *self.inner.reason.lock().unwrap();
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Cancel this scope (and its children) from inside the pipeline, e.g. on a fatal write error.
    pub(crate) fn cancel(&self) {
        self.inner.cancel(CancelReason::Canceled);
    }

    /// Guard for a pipeline thread: a panic there cancels this scope so no peer blocks on it.
    pub(crate) fn cancel_on_panic(&self) -> CancelOnPanic {
        CancelOnPanic(self.clone())
    }

    /// Disconnected once the scope is cancelled.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }

    fn deadline_timer(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(d) => at(d),
            None => never(),
        }
    }

    fn expired(&self) -> CancelReason {
        self.inner.cancel(CancelReason::DeadlineExceeded);
        self.err().unwrap_or(CancelReason::DeadlineExceeded)
    }

    fn cancelled(&self) -> CancelReason {
        self.err().unwrap_or(CancelReason::Canceled)
    }

    /// Send `item` on a bounded queue, giving up when the scope ends.
    /// `Ok(false)` means the receiving side is gone.
    pub fn send<T>(&self, tx: &Sender<T>, item: T) -> Result<bool, CancelReason> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        let timer = self.deadline_timer();
        select! {
            send(tx, item) -> res => Ok(res.is_ok()),
            recv(self.done()) -> _ => Err(self.cancelled()),
            recv(timer) -> _ => Err(self.expired()),
        }
    }

    /// Receive from a queue, giving up when the scope ends. `Ok(None)` means closed and drained.
    pub fn recv<T>(&self, rx: &Receiver<T>) -> Result<Option<T>, CancelReason> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        let timer = self.deadline_timer();
        select! {
            recv(rx) -> msg => Ok(msg.ok()),
            recv(self.done()) -> _ => Err(self.cancelled()),
            recv(timer) -> _ => Err(self.expired()),
        }
    }

    /// Sleep for `dur` unless the scope ends first.
    pub fn sleep(&self, dur: Duration) -> Result<(), CancelReason> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        let timer = self.deadline_timer();
        let wake = crossbeam_channel::after(dur);
        select! {
            recv(wake) -> _ => Ok(()),
            recv(self.done()) -> _ => Err(self.cancelled()),
            recv(timer) -> _ => Err(self.expired()),
        }
    }
}
