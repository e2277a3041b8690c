use super::config::{Advice, CowMode, DEFAULT_THRESHOLD};
use super::engine::Engine;
use crate::sync::atomic::{AtomicU8, Ordering};
use std::alloc::{GlobalAlloc, Layout};

#[cfg(not(feature = "preload"))]
pub type DefaultPlatform = super::platform::LibcAlloc;
#[cfg(feature = "preload")]
pub type DefaultPlatform = super::platform::NextAlloc;

/// The process-wide engine behind [`MapAlloc`], the C symbols and the
/// [`api`](crate::api) functions.
static ENGINE: Engine<DefaultPlatform> = Engine::from_parts(
    DefaultPlatform::new(),
    DEFAULT_THRESHOLD,
    None,
    Advice::Sequential,
    CowMode::InCore,
);

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

static INIT: AtomicU8 = AtomicU8::new(IDLE);

/// The process-wide engine, initialized on first use.
#[inline]
pub fn engine() -> &'static Engine<DefaultPlatform> {
    ensure_init();
    &ENGINE
}

#[inline]
pub(crate) fn ensure_init() {
    if INIT.load(Ordering::Acquire) != DONE {
        init_slow();
    }
}

/// Resolve the platform allocator, read the environment, register the
/// exit and fork hooks, then start routing.
///
/// Anything that allocates while this runs (including `dlsym`, `atexit`
/// and other threads racing the first call) sees a pending engine and is
/// served by the platform allocator or the bootstrap arena.
#[cold]
fn init_slow() {
    if INIT
        .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    #[cfg(feature = "preload")]
    ENGINE.platform.resolve_all();

    ENGINE.apply_env();

    // Safety: FFI calls registering `extern "C"` handlers with static
    // lifetime.
    unsafe {
        if libc::atexit(at_exit) != 0 {
            log::warn!("atexit registration failed; backing files will outlive the process");
        }
        if libc::pthread_atfork(Some(before_fork), Some(after_fork_parent), Some(after_fork_child))
            != 0
        {
            log::warn!("pthread_atfork registration failed; children will share mappings");
        }
    }

    ENGINE.activate();
    INIT.store(DONE, Ordering::Release);
    log::debug!(
        "mapalloc active: threshold {} bytes, directory {:?}, cow {:?}",
        ENGINE.threshold(),
        ENGINE.directory(),
        ENGINE.cow_mode()
    );
}

extern "C" fn at_exit() {
    ENGINE.shutdown();
}

unsafe extern "C" fn before_fork() {
    ENGINE.fork_prepare();
}

unsafe extern "C" fn after_fork_parent() {
    // Safety: `before_fork` ran on this thread.
    unsafe { ENGINE.fork_parent() }
}

unsafe extern "C" fn after_fork_child() {
    // Safety: `before_fork` ran on the thread that forked.
    unsafe { ENGINE.fork_child() }
}

/// Guaranteed alignment of the platform `malloc` on 64-bit Linux.
const MIN_ALIGN: usize = 16;

/// `#[global_allocator]` front end for the process-wide engine.
///
/// ```no_run
/// #[global_allocator]
/// static GLOBAL: mapalloc::MapAlloc = mapalloc::MapAlloc;
///
/// fn main() {}
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct MapAlloc;

impl MapAlloc {
    #[inline]
    fn plain(layout: Layout) -> bool {
        layout.align() <= MIN_ALIGN && layout.align() <= layout.size()
    }
}

// Safety: Implementation follows GlobalAlloc contract; every pointer is
// released through the engine that produced it.
unsafe impl GlobalAlloc for MapAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let engine = engine();
        if Self::plain(layout) {
            engine.allocate(layout.size())
        } else {
            engine.aligned_allocate(layout.align(), layout.size())
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let engine = engine();
        if Self::plain(layout) {
            return engine.zero_allocate(1, layout.size());
        }
        let ptr = engine.aligned_allocate(layout.align(), layout.size());
        if !ptr.is_null() && !engine.is_tracked(ptr) {
            // Safety: fresh block of `size` bytes.
            unsafe { std::ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        engine().release(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let engine = engine();
        if layout.align() <= MIN_ALIGN && layout.align() <= new_size {
            return engine.resize(ptr, new_size);
        }
        // Safety: caller guarantees a valid layout for `new_size`.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        // Safety: forwarded contract.
        let new = unsafe { self.alloc(new_layout) };
        if !new.is_null() {
            // Safety: both blocks hold at least the copied length.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    /// Point the process-wide engine at `dir` with a small threshold for
    /// the duration of a test.
    struct Scoped {
        threshold: usize,
        dir: std::path::PathBuf,
    }

    impl Scoped {
        fn new(dir: &std::path::Path, threshold: usize) -> Self {
            let e = engine();
            let saved = Self {
                threshold: e.threshold(),
                dir: e.directory(),
            };
            e.set_threshold(threshold);
            e.set_directory(dir);
            saved
        }
    }

    impl Drop for Scoped {
        fn drop(&mut self) {
            let e = engine();
            e.set_threshold(self.threshold);
            e.set_directory(self.dir.clone());
        }
    }

    #[test]
    fn test_engine_initializes_once() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = engine();
        let b = engine();
        assert!(std::ptr::eq(a, b));
        assert!(a.is_active());
        assert_eq!(INIT.load(Ordering::Acquire), DONE);
    }

    #[test]
    fn test_global_alloc_small_and_aligned() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = MapAlloc;
        for (size, align) in [(64, 8), (8, 64), (100, 4096)] {
            let layout = Layout::from_size_align(size, align).unwrap();
            // Safety: Test code.
            unsafe {
                let ptr = alloc.alloc(layout);
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % align, 0);
                std::ptr::write_volatile(ptr, 0xCC);
                assert_eq!(std::ptr::read_volatile(ptr), 0xCC);
                alloc.dealloc(ptr, layout);
            }
        }
    }

    #[test]
    fn test_global_alloc_large_is_file_backed() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let _scope = Scoped::new(dir.path(), 1 << 20);
        let alloc = MapAlloc;
        let layout = Layout::from_size_align(2 << 20, 8).unwrap();
        // Safety: Test code.
        unsafe {
            let ptr = alloc.alloc_zeroed(layout);
            assert!(engine().is_tracked(ptr));
            assert_eq!(*ptr.add((2 << 20) - 1), 0);
            *ptr = 1;

            let grown = alloc.realloc(ptr, layout, 4 << 20);
            assert!(engine().is_tracked(grown));
            assert_eq!(*grown, 1);

            let grown_layout = Layout::from_size_align(4 << 20, 8).unwrap();
            alloc.dealloc(grown, grown_layout);
            assert!(!engine().is_tracked(grown));
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_global_realloc_over_aligned_copies() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = MapAlloc;
        let layout = Layout::from_size_align(32, 64).unwrap();
        // Safety: Test code.
        unsafe {
            let ptr = alloc.alloc_zeroed(layout);
            assert!((0..32).all(|i| *ptr.add(i) == 0));
            *ptr.add(31) = 9;
            let grown = alloc.realloc(ptr, layout, 256);
            assert_eq!(grown as usize % 64, 0);
            assert_eq!(*grown.add(31), 9);
            alloc.dealloc(grown, Layout::from_size_align(256, 64).unwrap());
        }
    }
}
