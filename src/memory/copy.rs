use super::backing;
use super::engine::Engine;
use super::platform::PlatformAlloc;
use super::vm::View;
use std::fs::File;
use std::ptr;

impl<P: PlatformAlloc> Engine<P> {
    /// `memcpy` that notices whole-mapping copies.
    ///
    /// When `src` is exactly one shared mapping of `n` bytes and `dest` a
    /// shared mapping of at least `n`, the backing files are copied inside
    /// the kernel instead of faulting every page through user space. The
    /// result is the same as a byte copy either way.
    ///
    /// # Safety
    /// Same contract as [`ptr::copy`]: both ranges valid for `n` bytes.
    pub unsafe fn copy_region(&self, dest: *mut u8, src: *const u8, n: usize) -> *mut u8 {
        if n == 0 || ptr::eq(dest, src) {
            return dest;
        }
        if let Some((from, to)) = self.region_files(dest, src, n) {
            match backing::copy_range(&from, &to, n) {
                Ok(()) => return dest,
                Err(e) => log::debug!("kernel copy failed, copying bytes: {e}"),
            }
        }
        // Safety: forwarded contract.
        unsafe { ptr::copy(src, dest, n) };
        dest
    }

    /// Open both backing files if the fast path applies. The copy itself
    /// runs after the lock is released.
    fn region_files(&self, dest: *mut u8, src: *const u8, n: usize) -> Option<(File, File)> {
        if !self.has_tracked() {
            return None;
        }
        self.with_state(|st| {
            let s = st.registry.get(src as usize)?;
            let d = st.registry.get(dest as usize)?;
            let eligible = s.mapped
                && d.mapped
                && s.view == View::Shared
                && d.view == View::Shared
                && s.length == n
                && d.length >= n;
            if !eligible {
                return None;
            }
            let from = backing::open_rw(&s.path).ok()?;
            let to = backing::open_rw(&d.path).ok()?;
            Some((from, to))
        })
        .flatten()
    }
}
