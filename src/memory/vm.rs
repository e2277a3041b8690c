use super::error::MapError;
use std::os::fd::RawFd;
use std::ptr::NonNull;

/// How a backing file is mapped into this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// `MAP_SHARED`: writes reach the file and every other shared view.
    Shared,
    /// `MAP_PRIVATE`: copy-on-write; writes stay in this process.
    Private,
}

impl View {
    fn flags(self) -> libc::c_int {
        match self {
            View::Shared => libc::MAP_SHARED,
            View::Private => libc::MAP_PRIVATE,
        }
    }
}

/// Abstract interface for the file-mapping syscalls.
pub(crate) trait VmOps {
    /// Map `len` bytes of `fd` from offset 0, read-write.
    ///
    /// With `at`, the range replaces whatever is mapped there
    /// (`MAP_FIXED`); used to swap the view under an existing address.
    unsafe fn map_file(
        fd: RawFd,
        len: usize,
        view: View,
        at: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, MapError>;

    /// Grow or shrink a mapping. The range may move.
    unsafe fn remap(ptr: NonNull<u8>, old_len: usize, new_len: usize)
    -> Result<NonNull<u8>, MapError>;

    /// Remove a mapping (after which pointers into it are invalid).
    unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), MapError>;

    /// Apply a raw `MADV_*` hint to a range.
    unsafe fn advise(ptr: NonNull<u8>, len: usize, advice: libc::c_int) -> Result<(), MapError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(target_os = "linux", not(miri)))]
mod linux {
    use super::{MapError, NonNull, PlatformVmOps, RawFd, View, VmOps};
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn map_file(
            fd: RawFd,
            len: usize,
            view: View,
            at: Option<NonNull<u8>>,
        ) -> Result<NonNull<u8>, MapError> {
            let (hint, fixed) = match at {
                Some(p) => (p.as_ptr().cast::<libc::c_void>(), libc::MAP_FIXED),
                None => (std::ptr::null_mut(), 0),
            };
            // Safety: FFI call to mmap. With MAP_FIXED the caller owns the
            // range being replaced.
            let ptr = unsafe {
                libc::mmap(
                    hint,
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    view.flags() | fixed,
                    fd,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(MapError::last_os(|source| MapError::Map { len, source }));
            }

            NonNull::new(ptr.cast::<u8>()).ok_or_else(|| MapError::Map {
                len,
                source: io::Error::other("mmap returned null"),
            })
        }

        unsafe fn remap(
            ptr: NonNull<u8>,
            old_len: usize,
            new_len: usize,
        ) -> Result<NonNull<u8>, MapError> {
            // Safety: FFI call to mremap; the caller owns the mapping.
            let moved = unsafe {
                libc::mremap(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    old_len,
                    new_len,
                    libc::MREMAP_MAYMOVE,
                )
            };

            if moved == libc::MAP_FAILED {
                return Err(MapError::last_os(|source| MapError::Remap {
                    old_len,
                    new_len,
                    source,
                }));
            }

            NonNull::new(moved.cast::<u8>()).ok_or_else(|| MapError::Remap {
                old_len,
                new_len,
                source: io::Error::other("mremap returned null"),
            })
        }

        unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), MapError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) } != 0 {
                return Err(MapError::last_os(|source| MapError::Unmap {
                    addr: ptr.as_ptr() as usize,
                    len,
                    source,
                }));
            }
            Ok(())
        }

        unsafe fn advise(
            ptr: NonNull<u8>,
            len: usize,
            advice: libc::c_int,
        ) -> Result<(), MapError> {
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), len, advice) } != 0 {
                return Err(MapError::last_os(MapError::Advise));
            }
            Ok(())
        }

        fn page_size() -> usize {
            static CACHED: AtomicUsize = AtomicUsize::new(0);
            let cached = CACHED.load(Ordering::Relaxed);
            if cached != 0 {
                return cached;
            }
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            // sysconf cannot fail for _SC_PAGESIZE on Linux; 4 KiB is the
            // smallest page any supported target uses.
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let size = if raw > 0 { raw as usize } else { 4096 };
            CACHED.store(size, Ordering::Relaxed);
            size
        }
    }
}
