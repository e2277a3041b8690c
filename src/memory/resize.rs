use super::backing;
use super::bootstrap;
use super::engine::{Engine, State, current_pid};
use super::error::MapError;
use super::platform::PlatformAlloc;
use super::vm::{PlatformVmOps, VmOps};
use std::ptr::{self, NonNull};

impl<P: PlatformAlloc> Engine<P> {
    /// `free`.
    ///
    /// The owning process unmaps, unlinks and forgets a file-backed block.
    /// Any other process only drops its own view; the entry and the file
    /// stay with their owner.
    pub fn release(&self, ptr: *mut u8) {
        if ptr.is_null() || bootstrap::ARENA.contains(ptr) {
            return;
        }
        if self.was_activated() && self.has_tracked() {
            let handled = self.with_state(|st| self.release_tracked(st, ptr as usize));
            if handled == Some(true) {
                return;
            }
        }
        // Safety: not tracked, so it came from the platform.
        unsafe { self.platform.free(ptr.cast()) }
    }

    /// Whether `ptr` is the start of a tracked mapping.
    pub fn is_tracked(&self, ptr: *const u8) -> bool {
        self.has_tracked()
            && self
                .with_state(|st| st.registry.get(ptr as usize).is_some())
                .unwrap_or(false)
    }

    /// Returns false if `addr` is not tracked.
    fn release_tracked(&self, st: &mut State, addr: usize) -> bool {
        let pid = current_pid();
        let Some(m) = st.registry.get_mut(addr) else {
            return false;
        };

        if m.owner_pid != pid {
            if m.mapped {
                // Safety: this process's view of a tracked mapping.
                if let Err(e) = unsafe { PlatformVmOps::unmap(m.ptr(), m.length) } {
                    log::error!("{e}");
                }
                m.mapped = false;
                self.stats.mapping_removed(m.length);
                log::debug!("dropped inherited view at {addr:#x}, owner pid {}", m.owner_pid);
            }
            return true;
        }

        let Some(m) = st.registry.remove(addr) else {
            return false;
        };
        if m.mapped {
            // Safety: the registry owned this mapping.
            if let Err(e) = unsafe { PlatformVmOps::unmap(m.ptr(), m.length) } {
                log::error!("{e}");
            }
            self.stats.mapping_removed(m.length);
        }
        if m.owns_file {
            if let Err(e) = backing::unlink(&m.path) {
                log::warn!("failed to unlink {:?}: {e}", m.path);
            }
        }
        log::debug!("released {} bytes at {addr:#x}", m.length);
        true
    }

    /// `realloc`.
    ///
    /// On failure the old block is left intact and null is returned.
    pub fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            self.release(ptr);
            return ptr::null_mut();
        }
        if bootstrap::ARENA.contains(ptr) {
            // Safety: pointers into the arena are block starts.
            let old_len = unsafe { bootstrap::ARENA.block_len(ptr) };
            let new = self.allocate(new_size);
            if !new.is_null() {
                // Safety: both blocks hold at least the copied length.
                unsafe { ptr::copy_nonoverlapping(ptr, new, old_len.min(new_size)) };
            }
            return new;
        }
        if self.was_activated() && self.has_tracked() {
            let outcome = self
                .with_state(|st| self.resize_tracked(st, ptr as usize, new_size))
                .flatten();
            if let Some(result) = outcome {
                return result;
            }
        }
        // Safety: not tracked, so it came from the platform.
        unsafe { self.platform.realloc(ptr.cast(), new_size) }.cast()
    }

    /// `None` if `addr` is not tracked.
    fn resize_tracked(&self, st: &mut State, addr: usize, new_size: usize) -> Option<*mut u8> {
        let pid = current_pid();
        let m = st.registry.get(addr)?;
        let owned = m.owns_backing(pid) && m.mapped;
        if !self.is_active() {
            return Some(self.move_to_platform(st, addr, new_size));
        }
        let result = if owned {
            self.resize_owned(st, addr, new_size)
        } else {
            self.relocate(st, addr, new_size)
        };
        Some(match result {
            Ok(p) => p.as_ptr(),
            Err(e) => {
                log::warn!("resize of {addr:#x} to {new_size} bytes failed: {e}");
                ptr::null_mut()
            }
        })
    }

    /// Resize the file and the view of a mapping this process owns.
    fn resize_owned(
        &self,
        st: &mut State,
        addr: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, MapError> {
        let m = st
            .registry
            .get_mut(addr)
            .ok_or(MapError::NotTracked { addr })?;
        let old_len = m.length;
        if new_size == old_len {
            return Ok(m.ptr());
        }

        let moved = if new_size > old_len {
            backing::truncate(&m.path, new_size)?;
            // Safety: the registry owns this mapping.
            match unsafe { PlatformVmOps::remap(m.ptr(), old_len, new_size) } {
                Ok(p) => p,
                Err(e) => {
                    if let Err(undo) = backing::truncate(&m.path, old_len) {
                        log::error!("failed to restore {:?}: {undo}", m.path);
                    }
                    return Err(e);
                }
            }
        } else {
            // Shrink the view before the file so the dropped tail is never
            // reachable past end of file.
            // Safety: the registry owns this mapping.
            let p = unsafe { PlatformVmOps::remap(m.ptr(), old_len, new_size)? };
            if let Err(e) = backing::truncate(&m.path, new_size) {
                log::warn!("{e}; {:?} keeps its old length", m.path);
            }
            p
        };

        m.length = new_size;
        self.stats.mapping_resized(old_len, new_size);

        let new_addr = moved.as_ptr() as usize;
        if new_addr != addr {
            self.rekey(st, addr, moved)?;
        }
        log::debug!("resized {addr:#x} -> {new_addr:#x}: {old_len} -> {new_size} bytes");
        Ok(moved)
    }

    /// Move the entry at `addr` to the address its view was remapped to.
    ///
    /// If a live entry already sits there the moved view is dropped along
    /// with the file it owns, so nothing is left untracked.
    fn rekey(&self, st: &mut State, addr: usize, moved: NonNull<u8>) -> Result<(), MapError> {
        let new_addr = moved.as_ptr() as usize;
        let Some(mut m) = st.registry.remove(addr) else {
            return Err(MapError::NotTracked { addr });
        };
        if st.registry.get(new_addr).is_some_and(|e| e.mapped) {
            log::error!("registry already tracks a live mapping at {new_addr:#x}");
            // Safety: the view was just remapped here on behalf of `m`.
            if let Err(e) = unsafe { PlatformVmOps::unmap(moved, m.length) } {
                log::error!("{e}");
            }
            if m.owns_file {
                drop(backing::unlink(&m.path));
            }
            self.stats.mapping_removed(m.length);
            return Err(MapError::Collision { addr: new_addr });
        }
        m.addr = new_addr;
        if let Some(stale) = st.registry.insert(m)? {
            log::debug!("replaced stale entry at {new_addr:#x} left by pid {}", stale.owner_pid);
        }
        Ok(())
    }

    /// Once the engine is no longer active no new backing file may appear,
    /// so a tracked block that changes size moves to the platform heap.
    fn move_to_platform(&self, st: &mut State, addr: usize, new_size: usize) -> *mut u8 {
        let old = match st.registry.get(addr) {
            Some(m) if m.mapped => (m.ptr(), m.length),
            _ => {
                log::warn!("resize of {}", MapError::Dangling { addr });
                return ptr::null_mut();
            }
        };
        // Safety: plain forwarding.
        let new = unsafe { self.platform.malloc(new_size) }.cast::<u8>();
        if new.is_null() {
            return new;
        }
        // Safety: a live mapping and a fresh heap block, both at least this long.
        unsafe { ptr::copy_nonoverlapping(old.0.as_ptr(), new, old.1.min(new_size)) };
        self.release_tracked(st, addr);
        new
    }

    /// Copy-on-demand for a view this process does not own: give the
    /// contents a new backing file of its own, then drop the old view.
    fn relocate(
        &self,
        st: &mut State,
        addr: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, MapError> {
        let (old, old_len, old_owner) = match st.registry.get(addr) {
            Some(m) if m.mapped => (m.ptr(), m.length, m.owner_pid),
            Some(_) => return Err(MapError::Dangling { addr }),
            None => return Err(MapError::NotTracked { addr }),
        };

        let new = self.map_new(st, new_size)?;
        // Safety: distinct live mappings, both at least this long.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_len.min(new_size)) };

        // Safety: this process's view of a tracked mapping.
        if let Err(e) = unsafe { PlatformVmOps::unmap(old, old_len) } {
            log::error!("{e}");
        }
        self.stats.mapping_removed(old_len);
        if old_owner == current_pid() {
            // A private view over another process's file; nothing else
            // refers to the entry.
            st.registry.remove(addr);
        } else if let Some(m) = st.registry.get_mut(addr) {
            m.mapped = false;
        }
        log::debug!(
            "relocated {addr:#x} ({old_len} bytes, owner pid {old_owner}) to {:#x}",
            new.as_ptr() as usize
        );
        Ok(new)
    }
}
