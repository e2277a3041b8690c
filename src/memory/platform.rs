use libc::c_void;

/// The unhooked allocation family that small requests, bookkeeping and
/// every non-file-backed pointer are handed to.
///
/// Exactly one implementation is chosen per process-wide engine: direct libc
/// calls when installed as a Rust `#[global_allocator]`, or the next
/// definitions in symbol lookup order when the crate itself exports
/// `malloc` and friends (the `preload` feature).
///
/// # Safety
/// Implementations must behave like the C functions they are named after:
/// null on failure, `free`/`realloc` accept exactly the pointers produced by
/// the same implementation.
pub unsafe trait PlatformAlloc: Sync {
    /// # Safety
    /// See [`libc::malloc`].
    unsafe fn malloc(&self, size: usize) -> *mut c_void;

    /// # Safety
    /// `ptr` must be null or come from this allocator.
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;

    /// # Safety
    /// `ptr` must be null or come from this allocator.
    unsafe fn free(&self, ptr: *mut c_void);

    /// Aligned allocation; `align` is a power of two.
    ///
    /// # Safety
    /// See `memalign(3)`.
    unsafe fn memalign(&self, align: usize, size: usize) -> *mut c_void;

    /// # Safety
    /// `ptr` must be null or come from this allocator.
    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize;

    /// Zeroed allocation built on [`malloc`](Self::malloc).
    ///
    /// # Safety
    /// See [`libc::calloc`].
    unsafe fn calloc(&self, size: usize) -> *mut c_void {
        // Safety: forwarded contract.
        let ptr = unsafe { self.malloc(size) };
        if !ptr.is_null() {
            // Safety: malloc returned at least `size` writable bytes.
            unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0, size) };
        }
        ptr
    }
}

/// Direct calls into the C library allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcAlloc;

impl LibcAlloc {
    pub const fn new() -> Self {
        Self
    }
}

// Safety: thin forwarding to libc.
unsafe impl PlatformAlloc for LibcAlloc {
    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        // Safety: FFI call to malloc.
        unsafe { libc::malloc(size) }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        // Safety: forwarded contract.
        unsafe { libc::realloc(ptr, size) }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        // Safety: forwarded contract.
        unsafe { libc::free(ptr) }
    }

    unsafe fn memalign(&self, align: usize, size: usize) -> *mut c_void {
        let mut out: *mut c_void = std::ptr::null_mut();
        // posix_memalign wants at least pointer alignment.
        let align = align.max(std::mem::size_of::<usize>());
        // Safety: FFI call; `out` is a valid out-pointer.
        if unsafe { libc::posix_memalign(&mut out, align, size) } != 0 {
            return std::ptr::null_mut();
        }
        out
    }

    unsafe fn calloc(&self, size: usize) -> *mut c_void {
        // Safety: FFI call to calloc.
        unsafe { libc::calloc(1, size) }
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        // Safety: forwarded contract.
        unsafe { libc::malloc_usable_size(ptr) }
    }
}

#[cfg(feature = "preload")]
pub use next::NextAlloc;

#[cfg(feature = "preload")]
mod next {
    use super::PlatformAlloc;
    use crate::memory::bootstrap;
    use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use libc::c_void;
    use std::ffi::CStr;

    type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
    type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
    type FreeFn = unsafe extern "C" fn(*mut c_void);
    type MemalignFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
    type UsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

    /// The allocator that would have served the process had this library not
    /// been preloaded, found with `dlsym(RTLD_NEXT, ..)`.
    ///
    /// `dlsym` itself allocates. While a lookup is in flight every request is
    /// served from the bootstrap arena instead of recursing into the lookup.
    pub struct NextAlloc {
        malloc: AtomicUsize,
        realloc: AtomicUsize,
        free: AtomicUsize,
        memalign: AtomicUsize,
        usable_size: AtomicUsize,
        resolving: AtomicBool,
    }

    impl Default for NextAlloc {
        fn default() -> Self {
            Self::new()
        }
    }

    impl NextAlloc {
        pub const fn new() -> Self {
            Self {
                malloc: AtomicUsize::new(0),
                realloc: AtomicUsize::new(0),
                free: AtomicUsize::new(0),
                memalign: AtomicUsize::new(0),
                usable_size: AtomicUsize::new(0),
                resolving: AtomicBool::new(false),
            }
        }

        /// Resolve every symbol up front. Aborts the process if one is
        /// missing: continuing without the real allocator is not possible.
        pub fn resolve_all(&self) {
            for (slot, name) in self.slots() {
                if Self::resolve(slot, name, &self.resolving) == 0 {
                    log::error!("failed to resolve {name:?} with dlsym(RTLD_NEXT)");
                    std::process::abort();
                }
            }
        }

        fn slots(&self) -> [(&AtomicUsize, &'static CStr); 5] {
            [
                (&self.malloc, c"malloc"),
                (&self.realloc, c"realloc"),
                (&self.free, c"free"),
                (&self.memalign, c"memalign"),
                (&self.usable_size, c"malloc_usable_size"),
            ]
        }

        fn resolve(slot: &AtomicUsize, name: &CStr, resolving: &AtomicBool) -> usize {
            let cached = slot.load(Ordering::Acquire);
            if cached != 0 {
                return cached;
            }
            if resolving.swap(true, Ordering::AcqRel) {
                return 0;
            }
            // Safety: FFI call to dlsym with a NUL-terminated name.
            let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) } as usize;
            slot.store(sym, Ordering::Release);
            resolving.store(false, Ordering::Release);
            sym
        }

        fn lookup(&self, slot: &AtomicUsize, name: &CStr) -> usize {
            Self::resolve(slot, name, &self.resolving)
        }
    }

    // Safety: forwards to the next allocator in lookup order; bootstrap
    // blocks are only produced while that allocator is unreachable.
    unsafe impl PlatformAlloc for NextAlloc {
        unsafe fn malloc(&self, size: usize) -> *mut c_void {
            match self.lookup(&self.malloc, c"malloc") {
                0 => bootstrap::ARENA.alloc(size).cast(),
                f => {
                    // Safety: `f` is the address of the next `malloc`.
                    let f: MallocFn = unsafe { std::mem::transmute::<usize, MallocFn>(f) };
                    // Safety: FFI call.
                    unsafe { f(size) }
                }
            }
        }

        unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
            match self.lookup(&self.realloc, c"realloc") {
                0 => std::ptr::null_mut(),
                f => {
                    // Safety: `f` is the address of the next `realloc`.
                    let f: ReallocFn = unsafe { std::mem::transmute::<usize, ReallocFn>(f) };
                    // Safety: FFI call.
                    unsafe { f(ptr, size) }
                }
            }
        }

        unsafe fn free(&self, ptr: *mut c_void) {
            // Leaking is the only option if `free` cannot be found.
            if let f @ 1.. = self.lookup(&self.free, c"free") {
                // Safety: `f` is the address of the next `free`.
                let f: FreeFn = unsafe { std::mem::transmute::<usize, FreeFn>(f) };
                // Safety: FFI call.
                unsafe { f(ptr) }
            }
        }

        unsafe fn memalign(&self, align: usize, size: usize) -> *mut c_void {
            match self.lookup(&self.memalign, c"memalign") {
                0 => std::ptr::null_mut(),
                f => {
                    // Safety: `f` is the address of the next `memalign`.
                    let f: MemalignFn = unsafe { std::mem::transmute::<usize, MemalignFn>(f) };
                    // Safety: FFI call.
                    unsafe { f(align, size) }
                }
            }
        }

        unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
            match self.lookup(&self.usable_size, c"malloc_usable_size") {
                0 => 0,
                f => {
                    // Safety: `f` is the address of the next `malloc_usable_size`.
                    let f: UsableSizeFn =
                        unsafe { std::mem::transmute::<usize, UsableSizeFn>(f) };
                    // Safety: FFI call.
                    unsafe { f(ptr) }
                }
            }
        }
    }
}
