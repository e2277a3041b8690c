use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::cell::UnsafeCell;
#[cfg(not(loom))]
use crate::sync::hint;
use crate::sync::thread;
use std::marker::PhantomData;
use std::ops::Deref;

const UNOWNED: usize = 0;

/// Spins before the waiting thread starts yielding its time slice.
#[cfg(not(loom))]
const SPINS_BEFORE_YIELD: u32 = 64;

/// A lock the owning thread may acquire again while already holding it.
///
/// Ownership is tracked as a per-thread token plus a nesting depth. Only
/// shared access to the protected value is handed out, so callers that need
/// mutation wrap it in a `RefCell` and treat a failed borrow as "re-entered
/// from inside my own critical section".
///
/// Acquisition spins briefly, then yields. There is no parking: the lock is
/// taken from inside `malloc`, where futex-backed primitives that allocate on
/// first use are not an option.
pub(crate) struct ReentrantLock<T> {
    owner: AtomicUsize,
    /// Touched only by the thread whose token is in `owner`.
    depth: UnsafeCell<usize>,
    data: T,
}

// Safety: the value is only reachable through a guard, and guards for
// different threads never coexist.
unsafe impl<T: Send> Send for ReentrantLock<T> {}
// Safety: see above; `T` itself need not be `Sync`.
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    #[cfg(not(loom))]
    pub(crate) const fn new(data: T) -> Self {
        Self {
            owner: AtomicUsize::new(UNOWNED),
            depth: UnsafeCell::new(0),
            data,
        }
    }

    #[cfg(loom)]
    pub(crate) fn new(data: T) -> Self {
        Self {
            owner: AtomicUsize::new(UNOWNED),
            depth: UnsafeCell::new(0),
            data,
        }
    }

    pub(crate) fn lock(&self) -> ReentrantGuard<'_, T> {
        self.raw_lock();
        ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire without a guard. Pair with [`raw_unlock`](Self::raw_unlock)
    /// on the same thread.
    ///
    /// Used by the fork hooks, where acquisition and release happen in
    /// different callbacks.
    pub(crate) fn raw_lock(&self) {
        let me = thread::current_token();

        // Only this thread can have stored its own token.
        if self.owner.load(Ordering::Relaxed) == me {
            // Safety: we own the lock, so we have exclusive access to depth.
            let depth = crate::sync::unsafe_cell_get_mut!(self.depth);
            *depth += 1;
            return;
        }

        #[cfg(not(loom))]
        let mut spins = 0u32;
        while self
            .owner
            .compare_exchange_weak(UNOWNED, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            #[cfg(not(loom))]
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
            #[cfg(loom)]
            thread::yield_now();
        }

        // Safety: the CAS above made us the owner.
        let depth = crate::sync::unsafe_cell_get_mut!(self.depth);
        *depth = 1;
    }

    /// Release one level of ownership.
    ///
    /// # Safety
    /// The calling thread must hold the lock through a matching
    /// [`raw_lock`](Self::raw_lock).
    pub(crate) unsafe fn raw_unlock(&self) {
        debug_assert!(
            self.is_owned_by_current_thread(),
            "raw_unlock called by a thread that does not hold the lock"
        );
        // Safety: caller owns the lock.
        let depth = crate::sync::unsafe_cell_get_mut!(self.depth);
        *depth -= 1;
        if *depth == 0 {
            self.owner.store(UNOWNED, Ordering::Release);
        }
    }

    pub(crate) fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == thread::current_token()
    }

    /// Nesting depth as seen by the calling thread (0 unless it owns the lock).
    #[allow(dead_code)]
    pub(crate) fn depth(&self) -> usize {
        if !self.is_owned_by_current_thread() {
            return 0;
        }
        // Safety: we own the lock.
        *crate::sync::unsafe_cell_get_mut!(self.depth)
    }
}

/// Scoped ownership of a [`ReentrantLock`]. Not `Send`: it must be dropped
/// on the thread that took it.
pub(crate) struct ReentrantGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for ReentrantGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T> Drop for ReentrantGuard<'_, T> {
    fn drop(&mut self) {
        // Safety: the guard exists only while this thread holds the lock.
        unsafe { self.lock.raw_unlock() }
    }
}
