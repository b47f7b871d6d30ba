//! Concurrency primitives used by the engine.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A counting semaphore bounding concurrent partition selects.
pub struct Semaphore {
    permits: AtomicUsize,
    capacity: usize,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl Semaphore {
    /// Creates a semaphore with the given number of permits (at least one).
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            permits: AtomicUsize::new(permits),
            capacity: permits,
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
        }
    }

    /// Acquires a permit, blocking until one is available.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            let mut lock = self.mutex.lock();
            while self.permits.load(Ordering::Acquire) == 0 {
                self.condvar.wait(&mut lock);
            }
        }
    }

    /// Tries to acquire a permit without blocking.
    pub fn try_acquire(&self) -> Option<SemaphoreGuard<'_>> {
        let mut current = self.permits.load(Ordering::Acquire);
        while current > 0 {
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(SemaphoreGuard { semaphore: self }),
                Err(observed) => current = observed,
            }
        }
        None
    }

    /// Returns the total number of permits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of currently available permits.
    pub fn available_permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.permits.fetch_add(1, Ordering::AcqRel);
        let _lock = self.mutex.lock();
        self.condvar.notify_all();
    }
}

/// Releases its permit when dropped.
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// A cloneable cancellation flag for long-running selects.
///
/// The engine checks the token between partitions; disk partition decode
/// loops check it between points.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_semaphore_counts_permits() {
        let sem = Semaphore::new(2);

        let guard1 = sem.acquire();
        assert_eq!(sem.available_permits(), 1);
        let _guard2 = sem.acquire();
        assert_eq!(sem.available_permits(), 0);
        assert!(sem.try_acquire().is_none());

        drop(guard1);
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn test_semaphore_unblocks_waiter() {
        let sem = Arc::new(Semaphore::new(1));
        let guard = sem.acquire();

        let sem_clone = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            let _guard = sem_clone.acquire();
        });

        thread::sleep(Duration::from_millis(10));
        drop(guard);
        handle.join().unwrap();
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
