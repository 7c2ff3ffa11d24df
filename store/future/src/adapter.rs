//! Future adapter: single-assignment awaitable result.
//!
//! The state is a single atomic slot holding a stack of wait nodes. A node is
//! either a parked thread or a listener callback. Completion stores the
//! terminal value exactly once, seals the stack, and notifies the nodes in
//! LIFO order. Waiters that give up tombstone their node; a racing completion
//! simply skips tombstoned nodes.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::interrupt::Interrupt;

/// Errors surfaced by [`FutureAdapter`] waits and terminal states.
#[derive(Debug, Clone)]
pub enum FutureError {
    /// The future was cancelled via [`FutureAdapter::on_cancelled`].
    Cancelled,
    /// A timed wait elapsed before the future completed.
    Timeout,
    /// The wait was aborted by an [`Interrupt`].
    Interrupted,
    /// The future completed with an error.
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "future was cancelled"),
            Self::Timeout => write!(f, "timeout was reached before completion"),
            Self::Interrupted => write!(f, "interrupted while waiting for completion"),
            Self::Failed(err) => write!(f, "future failed: {err}"),
        }
    }
}

impl std::error::Error for FutureError {}

/// Minimal executor abstraction for running chained-future callbacks off the
/// completer's thread.
pub trait Executor: Send + Sync {
    /// Run the task, now or later, on some thread.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Terminal state of a future. Stored exactly once.
enum Terminal<T> {
    Value(T),
    Error(FutureError),
}

type ListenerFn<T> = Box<dyn FnOnce(&FutureAdapter<T>) + Send>;

enum Waiter<T> {
    /// A parked thread to unpark on completion.
    Thread(Thread),
    /// A callback to invoke on completion. Consumed at most once.
    Listener(Mutex<Option<ListenerFn<T>>>),
}

struct WaitNode<T> {
    waiter: Waiter<T>,
    /// Next node down the stack. Written before publication, read only by
    /// whoever pops the stack.
    next: AtomicPtr<WaitNode<T>>,
    /// Tombstone set by waiters that gave up (timeout, interrupt).
    cancelled: AtomicBool,
}

impl<T> WaitNode<T> {
    fn thread(t: Thread) -> Arc<Self> {
        Arc::new(Self {
            waiter: Waiter::Thread(t),
            next: AtomicPtr::new(std::ptr::null_mut()),
            cancelled: AtomicBool::new(false),
        })
    }

    fn listener(cb: ListenerFn<T>) -> Arc<Self> {
        Arc::new(Self {
            waiter: Waiter::Listener(Mutex::new(Some(cb))),
            next: AtomicPtr::new(std::ptr::null_mut()),
            cancelled: AtomicBool::new(false),
        })
    }
}

/// Sentinel stack head meaning "completed, no further registrations".
/// Never dereferenced.
fn sealed<T>() -> *mut WaitNode<T> {
    1usize as *mut WaitNode<T>
}

/// Awaitable single-assignment result.
///
/// # Contracts
///
/// - [`on_done`](Self::on_done) / [`on_error`](Self::on_error) /
///   [`on_cancelled`](Self::on_cancelled) transition to a terminal state
///   exactly once and report whether this call effected the transition.
/// - [`get`](Self::get) and friends park the calling thread until the
///   terminal state is available.
/// - [`listen`](Self::listen) never blocks; if the future is already
///   complete the callback runs synchronously on the calling thread,
///   otherwise on the completer's thread.
/// - Listeners and waiters are notified in LIFO registration order.
pub struct FutureAdapter<T> {
    /// Stack head: null = no waiters, `sealed()` = completed.
    waiters: AtomicPtr<WaitNode<T>>,
    terminal: OnceLock<Terminal<T>>,
    ignore_interrupts: AtomicBool,
}

impl<T> Default for FutureAdapter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FutureAdapter<T> {
    /// Create a new, incomplete future.
    pub fn new() -> Self {
        Self {
            waiters: AtomicPtr::new(std::ptr::null_mut()),
            terminal: OnceLock::new(),
            ignore_interrupts: AtomicBool::new(false),
        }
    }

    /// When set, interrupts observed during a wait are recorded and
    /// re-asserted on return instead of aborting the wait.
    pub fn set_ignore_interrupts(&self, ignore: bool) {
        self.ignore_interrupts.store(ignore, Ordering::Relaxed);
    }

    /// Whether the future has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.terminal.get().is_some()
    }

    /// Whether the future was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.terminal.get(),
            Some(Terminal::Error(FutureError::Cancelled))
        )
    }

    /// Whether the future completed with an error (not cancellation).
    pub fn is_failed(&self) -> bool {
        matches!(
            self.terminal.get(),
            Some(Terminal::Error(FutureError::Failed(_)))
        )
    }

    /// The terminal error, if the future failed or was cancelled.
    pub fn error(&self) -> Option<FutureError> {
        match self.terminal.get() {
            Some(Terminal::Error(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Complete the future with a value. Returns whether this call effected
    /// the transition; a second completion of any kind returns `false` and
    /// leaves the first result intact.
    pub fn on_done(&self, res: T) -> bool {
        self.complete(Terminal::Value(res))
    }

    /// Complete the future with an error.
    pub fn on_error(&self, err: impl std::error::Error + Send + Sync + 'static) -> bool {
        self.complete(Terminal::Error(FutureError::Failed(Arc::new(err))))
    }

    /// Cancel the future. Waiters observe [`FutureError::Cancelled`].
    pub fn on_cancelled(&self) -> bool {
        self.complete(Terminal::Error(FutureError::Cancelled))
    }

    /// Register a completion callback.
    ///
    /// If the future is already complete the callback is invoked
    /// synchronously before this method returns.
    pub fn listen<F>(&self, cb: F)
    where
        F: FnOnce(&FutureAdapter<T>) + Send + 'static,
    {
        if self.terminal.get().is_some() {
            cb(self);
            return;
        }

        let node = WaitNode::listener(Box::new(cb));

        if !self.register(Arc::clone(&node)) {
            // Completion won the race; we still own the only callback handle.
            if let Waiter::Listener(slot) = &node.waiter {
                if let Some(cb) = slot.lock().take() {
                    cb(self);
                }
            }
        }
    }

    /// Push a node onto the waiter stack. Returns `false` if the stack is
    /// already sealed by a completion.
    fn register(&self, node: Arc<WaitNode<T>>) -> bool {
        let raw = Arc::into_raw(node) as *mut WaitNode<T>;

        loop {
            let head = self.waiters.load(Ordering::Acquire);

            if head == sealed() {
                // Reclaim the reference we were about to hand to the stack.
                unsafe { drop(Arc::from_raw(raw)) };
                return false;
            }

            unsafe { (*raw).next.store(head, Ordering::Relaxed) };

            if self
                .waiters
                .compare_exchange(head, raw, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Store the terminal state and notify the waiter stack. The terminal
    /// value is always visible before the stack is sealed, so a failed
    /// registration can rely on `terminal` being set.
    fn complete(&self, terminal: Terminal<T>) -> bool {
        if self.terminal.set(terminal).is_err() {
            return false;
        }

        let mut head = self.waiters.swap(sealed(), Ordering::AcqRel);

        while !head.is_null() && head != sealed() {
            // The stack's reference; dropped at the end of this iteration.
            let node = unsafe { Arc::from_raw(head) };
            head = node.next.load(Ordering::Relaxed);

            if node.cancelled.load(Ordering::Acquire) {
                continue;
            }

            match &node.waiter {
                Waiter::Thread(t) => t.unpark(),
                Waiter::Listener(slot) => {
                    if let Some(cb) = slot.lock().take() {
                        cb(self);
                    }
                }
            }
        }

        true
    }
}

impl<T: Clone> FutureAdapter<T> {
    /// The terminal result, if completed successfully.
    pub fn result(&self) -> Option<T> {
        match self.terminal.get() {
            Some(Terminal::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// The terminal outcome, if any.
    fn outcome(&self) -> Option<Result<T, FutureError>> {
        match self.terminal.get()? {
            Terminal::Value(v) => Some(Ok(v.clone())),
            Terminal::Error(e) => Some(Err(e.clone())),
        }
    }

    /// Block until the future completes and return its outcome.
    pub fn get(&self) -> Result<T, FutureError> {
        if let Some(out) = self.outcome() {
            return out;
        }

        let node = WaitNode::thread(thread::current());

        if !self.register(Arc::clone(&node)) {
            return self.outcome().expect("sealed future without terminal state");
        }

        loop {
            thread::park();

            if let Some(out) = self.outcome() {
                return out;
            }
        }
    }

    /// Block until the future completes or the timeout elapses.
    ///
    /// On timeout the caller's wait node is tombstoned and
    /// [`FutureError::Timeout`] is returned; other waiters are unaffected.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, FutureError> {
        if let Some(out) = self.outcome() {
            return out;
        }

        let node = WaitNode::thread(thread::current());

        if !self.register(Arc::clone(&node)) {
            return self.outcome().expect("sealed future without terminal state");
        }

        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();

            if now >= deadline {
                node.cancelled.store(true, Ordering::Release);

                // A completion may have landed right at the deadline.
                if let Some(out) = self.outcome() {
                    return out;
                }

                return Err(FutureError::Timeout);
            }

            thread::park_timeout(deadline - now);

            if let Some(out) = self.outcome() {
                return out;
            }
        }
    }

    /// Block until the future completes, honoring the interrupt handle.
    ///
    /// With `ignore_interrupts` unset an observed interrupt aborts the wait
    /// with [`FutureError::Interrupted`], consuming the signal. With it set,
    /// the interrupt is recorded, the wait continues, and the signal is
    /// re-asserted on the handle before returning.
    pub fn get_interruptible(&self, interrupt: &Interrupt) -> Result<T, FutureError> {
        if let Some(out) = self.outcome() {
            return out;
        }

        let node = WaitNode::thread(thread::current());

        if !self.register(Arc::clone(&node)) {
            return self.outcome().expect("sealed future without terminal state");
        }

        interrupt.register_current();

        let ignore = self.ignore_interrupts.load(Ordering::Relaxed);
        let mut interrupted = false;

        let out = loop {
            if let Some(out) = self.outcome() {
                break out;
            }

            if interrupt.take() {
                interrupted = true;

                if !ignore {
                    node.cancelled.store(true, Ordering::Release);
                    interrupt.unregister();

                    return Err(FutureError::Interrupted);
                }
            }

            thread::park();
        };

        interrupt.unregister();

        if interrupted {
            // Deferred interrupt is re-asserted for the caller to observe.
            interrupt.set();
        }

        out
    }
}

impl<T: Clone + Send + Sync + 'static> FutureAdapter<T> {
    /// Produce a new future resolved by applying `map` to this future's
    /// terminal outcome, on the completer's thread.
    pub fn chain<U, F>(&self, map: F) -> Arc<FutureAdapter<U>>
    where
        U: Send + Sync + 'static,
        F: FnOnce(Result<T, FutureError>) -> Result<U, FutureError> + Send + 'static,
    {
        let chained = Arc::new(FutureAdapter::new());
        let out = Arc::clone(&chained);

        self.listen(move |fut| {
            let res = fut.outcome().expect("listener fired before completion");
            out.complete_mapped(map(res));
        });

        chained
    }

    /// Like [`chain`](Self::chain), but runs `map` on the supplied executor.
    pub fn chain_with<U, F>(&self, exec: Arc<dyn Executor>, map: F) -> Arc<FutureAdapter<U>>
    where
        U: Send + Sync + 'static,
        F: FnOnce(Result<T, FutureError>) -> Result<U, FutureError> + Send + 'static,
    {
        let chained = Arc::new(FutureAdapter::new());
        let out = Arc::clone(&chained);

        self.listen(move |fut| {
            let res = fut.outcome().expect("listener fired before completion");

            exec.execute(Box::new(move || {
                out.complete_mapped(map(res));
            }));
        });

        chained
    }
}

impl<T> FutureAdapter<T> {
    /// Complete with a mapped outcome, preserving cancellation.
    fn complete_mapped(&self, res: Result<T, FutureError>) -> bool {
        match res {
            Ok(v) => self.on_done(v),
            Err(FutureError::Cancelled) => self.on_cancelled(),
            Err(FutureError::Failed(err)) => {
                self.complete(Terminal::Error(FutureError::Failed(err)))
            }
            Err(other) => self.complete(Terminal::Error(FutureError::Failed(Arc::new(other)))),
        }
    }
}

impl<T> Drop for FutureAdapter<T> {
    fn drop(&mut self) {
        // Reclaim any nodes still on the stack (never-completed future).
        let mut head = *self.waiters.get_mut();

        while !head.is_null() && head != sealed() {
            let node = unsafe { Arc::from_raw(head) };
            head = node.next.load(Ordering::Relaxed);
        }
    }
}

/// Debug renders the coarse state only; results may not be `Debug`.
impl<T> fmt::Debug for FutureAdapter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.terminal.get() {
            None => "INIT",
            Some(Terminal::Value(_)) => "DONE",
            Some(Terminal::Error(FutureError::Cancelled)) => "CANCELLED",
            Some(Terminal::Error(_)) => "FAILED",
        };

        f.debug_struct("FutureAdapter").field("state", &state).finish()
    }
}
