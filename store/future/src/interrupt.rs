//! Cooperative interrupt handle for blocked waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use parking_lot::Mutex;

/// A cloneable interrupt signal.
///
/// A thread about to block registers itself with [`Interrupt::register_current`]
/// and checks [`Interrupt::take`] after every wakeup. Another thread calling
/// [`Interrupt::interrupt`] sets the flag and unparks the registered waiter.
///
/// Whether an observed interrupt aborts the wait or is merely recorded (and
/// re-asserted on return) is up to the waiter; see
/// [`FutureAdapter::set_ignore_interrupts`](crate::FutureAdapter::set_ignore_interrupts).
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    target: Mutex<Option<Thread>>,
}

impl Interrupt {
    /// Create a new, unset interrupt handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the interrupt: set the flag and wake the registered waiter.
    pub fn interrupt(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);

        if let Some(t) = self.inner.target.lock().as_ref() {
            t.unpark();
        }
    }

    /// Whether the interrupt flag is currently set.
    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Consume the interrupt flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.inner.flag.swap(false, Ordering::SeqCst)
    }

    /// Re-assert the interrupt flag without waking anyone.
    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
    }

    /// Register the current thread as the wait target.
    pub fn register_current(&self) {
        *self.inner.target.lock() = Some(thread::current());
    }

    /// Clear the wait target.
    pub fn unregister(&self) {
        *self.inner.target.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_consumes_flag() {
        let int = Interrupt::new();
        assert!(!int.is_set());

        int.interrupt();
        assert!(int.is_set());
        assert!(int.take());
        assert!(!int.is_set());
        assert!(!int.take());
    }

    #[test]
    fn test_interrupt_unparks_registered_thread() {
        let int = Interrupt::new();
        let int2 = int.clone();

        let handle = thread::spawn(move || {
            int2.register_current();
            while !int2.take() {
                thread::park();
            }
            int2.unregister();
        });

        // Give the waiter a moment to park, then interrupt it.
        thread::sleep(std::time::Duration::from_millis(20));
        int.interrupt();

        handle.join().unwrap();
    }
}
