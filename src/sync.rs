// Synchronization primitives, switched between `std` and `loom`.
//
// Code in this crate reaches atomics, cells, threads and locks only through
// this module. Importing the `std` versions directly would hide those
// accesses from loom's scheduler under `--cfg loom`.
#![allow(unused_imports, unused_macros)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicUsize, Ordering};
}

// ---------------------------------------------------------------------------
// Arc, Mutex, RwLock
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex, RwLock};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex, RwLock};

// ---------------------------------------------------------------------------
// cell
//
// loom's `UnsafeCell::get` hands back a tracked pointer wrapper rather than
// `*mut T`; go through `unsafe_cell_get_mut!` to stay portable.
// ---------------------------------------------------------------------------
pub(crate) mod cell {
    #[cfg(loom)]
    pub(crate) use loom::cell::{Cell, UnsafeCell};

    #[cfg(not(loom))]
    pub(crate) use std::cell::{Cell, UnsafeCell};
}

/// `&mut T` from an `UnsafeCell<T>` under either backend.
///
/// # Safety
/// The caller must have exclusive access to the cell's contents.
macro_rules! unsafe_cell_get_mut {
    ($cell:expr) => {{
        #[cfg(not(loom))]
        {
            // Safety: exclusivity upheld by the caller.
            unsafe { &mut *$cell.get() }
        }
        #[cfg(loom)]
        {
            // Safety: exclusivity upheld by the caller.
            unsafe { $cell.with_mut(|p| &mut *p) }
        }
    }};
}
pub(crate) use unsafe_cell_get_mut;

// ---------------------------------------------------------------------------
// hint
// ---------------------------------------------------------------------------
pub(crate) mod hint {
    #[cfg(loom)]
    pub(crate) use loom::hint::spin_loop;

    #[cfg(not(loom))]
    pub(crate) use std::hint::spin_loop;
}

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{spawn, yield_now};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{spawn, yield_now};

    /// Non-zero token unique to the calling thread for as long as it lives.
    ///
    /// Taken from the address of a thread-local byte. The byte has no
    /// destructor, so reading it never allocates and stays valid while the
    /// thread tears down its other thread-locals (which matters when this is
    /// reached from inside `free`).
    pub(crate) fn current_token() -> usize {
        #[cfg(not(loom))]
        std::thread_local! {
            static TOKEN: u8 = const { 0 };
        }
        #[cfg(loom)]
        loom::thread_local! {
            static TOKEN: u8 = 0;
        }
        TOKEN.with(|byte| std::ptr::from_ref(byte) as usize)
    }
}

// ---------------------------------------------------------------------------
// barrier (std tests only; loom has no Barrier)
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) mod barrier {
    pub(crate) use std::sync::Barrier;
}

// ---------------------------------------------------------------------------
// statics
// ---------------------------------------------------------------------------

/// `pub static` lock usable under both backends: a `const` initializer
/// with `std`, `loom::lazy_static!` under loom (whose locks are not const).
macro_rules! static_rwlock {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_rwlock;
