//! C ABI.
//!
//! `c_api` exports the configuration functions as `mapalloc_*`. `preload`
//! additionally exports the allocation family itself, so that the cdylib
//! can be injected with `LD_PRELOAD` into programs that were never built
//! against it. `memcpy` is deliberately left alone; callers that want the
//! kernel copy use `mapalloc_memcpy`.
//!
//! Strings returned by these functions are allocated with `strdup` and
//! must be released with `free`.

use crate::api;
use crate::memory::config::Advice;
use crate::memory::global::engine;
use libc::{c_char, c_int, c_void};
use std::ffi::CStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fn dup_path(path: &Path) -> *mut c_char {
    let mut bytes = path.as_os_str().as_bytes().to_vec();
    bytes.push(0);
    // Safety: `bytes` is NUL-terminated.
    unsafe { libc::strdup(bytes.as_ptr().cast()) }
}

/// NUL-terminated crate version. Static; do not free.
#[unsafe(no_mangle)]
pub extern "C" fn mapalloc_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr().cast()
}

/// Set the threshold if `proposed > 0`; return the current value.
#[unsafe(no_mangle)]
pub extern "C" fn mapalloc_threshold(proposed: usize) -> usize {
    api::threshold(proposed)
}

/// With a null `path`, return a copy of the current backing directory.
/// Otherwise set it and return `path`.
///
/// # Safety
/// `path` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapalloc_path(path: *const c_char) -> *mut c_char {
    if path.is_null() {
        return dup_path(&api::path(None));
    }
    // Safety: caller passes a NUL-terminated string.
    let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
    api::path(Some(Path::new(std::ffi::OsStr::from_bytes(bytes))));
    path.cast_mut()
}

/// `madvise` over the whole mapping starting at `addr`. 0 or -1.
#[unsafe(no_mangle)]
pub extern "C" fn mapalloc_madvise(addr: *mut c_void, advice: c_int) -> c_int {
    match api::madvise(addr.cast(), advice) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Set the default access hint for new mappings if `advice` is a known
/// `MADV_*` code; return the current one.
#[unsafe(no_mangle)]
pub extern "C" fn mapalloc_advice(advice: c_int) -> c_int {
    api::advice(Advice::from_raw(advice)).as_raw()
}

/// Set the fork copy-on-write mode; return the current value.
#[unsafe(no_mangle)]
pub extern "C" fn mapalloc_cow(mode: c_int) -> c_int {
    api::cow(mode)
}

/// Copy of the backing file path of the mapping at `addr`, or null.
#[unsafe(no_mangle)]
pub extern "C" fn mapalloc_lookup(addr: *mut c_void) -> *mut c_char {
    match api::lookup(addr.cast()) {
        Some(path) => dup_path(&path),
        None => std::ptr::null_mut(),
    }
}

/// Print every mapping to stderr.
#[unsafe(no_mangle)]
pub extern "C" fn mapalloc_debug_list() {
    api::debug_list();
}

/// # Safety
/// Same contract as `memmove`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapalloc_memcpy(
    dest: *mut c_void,
    src: *const c_void,
    n: usize,
) -> *mut c_void {
    // Safety: forwarded contract.
    unsafe { api::copy_region(dest.cast(), src.cast(), n) }.cast()
}

#[cfg(feature = "preload")]
mod preload {
    use super::engine;
    use libc::{c_int, c_void};

    #[unsafe(no_mangle)]
    pub extern "C" fn malloc(size: usize) -> *mut c_void {
        engine().allocate(size).cast()
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
        engine().zero_allocate(count, size).cast()
    }

    /// # Safety
    /// `ptr` must be null or come from this allocator.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        engine().resize(ptr.cast(), size).cast()
    }

    /// # Safety
    /// `ptr` must be null or come from this allocator.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        engine().release(ptr.cast());
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn valloc(size: usize) -> *mut c_void {
        engine().page_aligned_allocate(size).cast()
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
        engine().aligned_allocate(align, size).cast()
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
        engine().aligned_allocate(align, size).cast()
    }

    /// # Safety
    /// `out` must be valid for a pointer write.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn posix_memalign(
        out: *mut *mut c_void,
        align: usize,
        size: usize,
    ) -> c_int {
        if !align.is_power_of_two() || align % std::mem::size_of::<*mut c_void>() != 0 {
            return libc::EINVAL;
        }
        let ptr = engine().aligned_allocate(align, size);
        if ptr.is_null() {
            return libc::ENOMEM;
        }
        // Safety: caller passes a writable out-pointer.
        unsafe { out.write(ptr.cast()) };
        0
    }

    /// # Safety
    /// `ptr` must be null or come from this allocator.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
        engine().usable_size(ptr.cast())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_nul_terminated() {
        // Safety: Test code.
        let v = unsafe { CStr::from_ptr(mapalloc_version()) };
        assert_eq!(v.to_str().unwrap(), api::version());
    }

    #[test]
    fn test_path_returns_copy_or_input() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // Safety: Test code.
        unsafe {
            let current = mapalloc_path(std::ptr::null());
            assert!(!current.is_null());
            let saved = CStr::from_ptr(current).to_owned();
            libc::free(current.cast());

            let proposed = c"/var/tmp";
            let out = mapalloc_path(proposed.as_ptr());
            assert_eq!(out.cast_const(), proposed.as_ptr());

            let now = mapalloc_path(std::ptr::null());
            assert_eq!(CStr::from_ptr(now), proposed);
            libc::free(now.cast());

            mapalloc_path(saved.as_ptr());
        }
    }

    #[test]
    fn test_lookup_and_madvise_on_untracked() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut x = 0u64;
        let p: *mut c_void = std::ptr::from_mut(&mut x).cast();
        assert!(mapalloc_lookup(p).is_null());
        assert_eq!(mapalloc_madvise(p, libc::MADV_NORMAL), -1);
    }

    #[test]
    fn test_memcpy_copies() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        // Safety: Test code.
        let out = unsafe { mapalloc_memcpy(dst.as_mut_ptr().cast(), src.as_ptr().cast(), 4) };
        assert_eq!(out, dst.as_mut_ptr().cast());
        assert_eq!(dst, src);
    }

    #[test]
    fn test_advice_sets_known_codes_only() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let saved = mapalloc_advice(-1);
        assert_eq!(mapalloc_advice(libc::MADV_RANDOM), libc::MADV_RANDOM);
        assert_eq!(mapalloc_advice(-1), libc::MADV_RANDOM);
        assert_eq!(mapalloc_advice(12345), libc::MADV_RANDOM);
        assert_eq!(mapalloc_advice(libc::MADV_SEQUENTIAL), libc::MADV_SEQUENTIAL);
        mapalloc_advice(saved);
    }

    #[test]
    fn test_threshold_and_cow_passthrough() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let saved = mapalloc_threshold(0);
        assert_eq!(mapalloc_threshold(777), 777);
        mapalloc_threshold(saved);
        assert_eq!(mapalloc_cow(2), 2);
        assert_eq!(mapalloc_cow(1), 1);
    }
}
