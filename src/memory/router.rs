use super::backing::BackingFile;
use super::bootstrap;
use super::engine::{Engine, State, current_pid};
use super::error::MapError;
use super::platform::PlatformAlloc;
use super::registry::Mapping;
use super::vm::{PlatformVmOps, View, VmOps};
use std::ptr::{self, NonNull};

impl<P: PlatformAlloc> Engine<P> {
    /// `malloc`.
    ///
    /// Requests of at least [`threshold`](Self::threshold) bytes become a
    /// fresh backing file mapped into memory. Everything else, and every
    /// request while the engine is not active, goes to the platform.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 || size < self.threshold() || !self.is_active() {
            // Safety: plain forwarding.
            let ptr = unsafe { self.platform.malloc(size) }.cast::<u8>();
            if !ptr.is_null() || size == 0 || !self.is_active() {
                return ptr;
            }
            // The heap is out; a file may still fit.
            self.stats.fallbacks.add(1);
        }
        self.allocate_mapped(size)
    }

    fn allocate_mapped(&self, size: usize) -> *mut u8 {
        let outcome = self.with_state(|st| match self.map_new(st, size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(e) => {
                log::warn!("file-backed allocation of {size} bytes failed: {e}");
                ptr::null_mut()
            }
        });
        match outcome {
            Some(ptr) => ptr,
            // Bookkeeping from inside the engine.
            // Safety: plain forwarding.
            None => unsafe { self.platform.malloc(size) }.cast(),
        }
    }

    /// `calloc`.
    pub fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        if !self.was_activated() {
            let ptr = bootstrap::ARENA.alloc(total);
            if !ptr.is_null() {
                return ptr;
            }
        }
        if total == 0 || total < self.threshold() || !self.is_active() {
            // Safety: plain forwarding.
            let ptr = unsafe { self.platform.calloc(total) }.cast::<u8>();
            if !ptr.is_null() || total == 0 || !self.is_active() {
                return ptr;
            }
            self.stats.fallbacks.add(1);
        }
        // A freshly truncated file reads as zeros.
        self.allocate_mapped(total)
    }

    /// `memalign` / `aligned_alloc`.
    ///
    /// Mappings start on a page boundary, so any alignment up to the page
    /// size is satisfied by the file path.
    pub fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
        if self.is_active() && size > self.threshold() && align <= PlatformVmOps::page_size() {
            return self.allocate(size);
        }
        // Safety: plain forwarding.
        unsafe { self.platform.memalign(align, size) }.cast()
    }

    /// `valloc`.
    pub fn page_aligned_allocate(&self, size: usize) -> *mut u8 {
        self.aligned_allocate(PlatformVmOps::page_size(), size)
    }

    /// `malloc_usable_size`.
    pub fn usable_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        if bootstrap::ARENA.contains(ptr) {
            // Safety: pointers into the arena are block starts.
            return unsafe { bootstrap::ARENA.block_len(ptr) };
        }
        if self.has_tracked() {
            let tracked = self
                .with_state(|st| st.registry.get(ptr as usize).map(|m| m.length))
                .flatten();
            if let Some(len) = tracked {
                return len;
            }
        }
        // Safety: not ours, so it came from the platform.
        unsafe { self.platform.usable_size(ptr.cast_mut().cast()) }
    }

    /// Create, size, map and register a backing file of `len` bytes.
    ///
    /// On error nothing is left behind: the file guard unlinks the file and
    /// any mapping is removed before returning.
    pub(crate) fn map_new(&self, st: &mut State, len: usize) -> Result<NonNull<u8>, MapError> {
        if !self.is_active() {
            return Err(MapError::Inactive);
        }
        let pid = current_pid();
        let file = BackingFile::create(st.directory(), pid)?;
        self.stats.files_created.add(1);
        file.set_len(len)?;

        // Safety: fresh descriptor, fresh range.
        let ptr = unsafe { PlatformVmOps::map_file(file.fd(), len, View::Shared, None)? };

        let addr = ptr.as_ptr() as usize;
        if st.registry.get(addr).is_some_and(|m| m.mapped) {
            // The kernel just handed us this range, so a live entry for it
            // means the registry is corrupt.
            log::error!("registry already tracks a live mapping at {addr:#x}");
            // Safety: mapped above.
            drop(unsafe { PlatformVmOps::unmap(ptr, len) });
            return Err(MapError::Collision { addr });
        }

        // Safety: mapped above.
        if let Err(e) = unsafe { PlatformVmOps::advise(ptr, len, st.advice.as_raw()) } {
            log::debug!("{e}");
        }

        let mapping = Mapping::new(ptr, file.persist(), len, pid);
        log::debug!("mapped {len} bytes at {addr:#x} from {:?}", mapping.path);
        if let Some(stale) = st.registry.insert(mapping)? {
            log::debug!(
                "replaced stale entry at {addr:#x} left by pid {}",
                stale.owner_pid
            );
        }
        self.stats.mapping_added(len);
        Ok(ptr)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::config::Config;
    use crate::memory::platform::LibcAlloc;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    const THRESHOLD: usize = 64 * 1024;

    fn engine(dir: &Path) -> Engine<LibcAlloc> {
        let engine = Engine::new(
            LibcAlloc::new(),
            Config::DEFAULT.with_threshold(THRESHOLD).with_directory(dir),
        );
        engine.activate();
        engine
    }

    fn backing_len(engine: &Engine<LibcAlloc>, ptr: *mut u8) -> u64 {
        let path = engine.lookup(ptr).expect("tracked");
        std::fs::metadata(path).unwrap().len()
    }

    #[test]
    fn test_small_allocation_is_not_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let ptr = engine.allocate(THRESHOLD - 1);
        assert!(!ptr.is_null());
        assert!(engine.lookup(ptr).is_none());
        assert!(engine.mappings().is_empty());
        engine.release(ptr);
    }

    #[test]
    fn test_large_allocation_is_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let ptr = engine.allocate(THRESHOLD);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % PlatformVmOps::page_size(), 0);

        let maps = engine.mappings();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].addr, ptr as usize);
        assert_eq!(maps[0].length, THRESHOLD);
        assert_eq!(maps[0].owner_pid, current_pid());
        assert_eq!(maps[0].path.parent().unwrap(), dir.path());
        assert_eq!(backing_len(&engine, ptr), THRESHOLD as u64);
        assert_eq!(engine.usable_size(ptr), THRESHOLD);

        let stats = engine.stats();
        assert_eq!(stats.live_mappings, 1);
        assert_eq!(stats.mapped_bytes, THRESHOLD);
        assert_eq!(stats.files_created, 1);
        engine.release(ptr);
    }

    #[test]
    fn test_roundtrip_below_and_above_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        for size in [1024, THRESHOLD * 2] {
            let ptr = engine.allocate(size);
            assert!(!ptr.is_null());
            // Safety: Test code.
            unsafe {
                for i in 0..size {
                    *ptr.add(i) = (i % 253) as u8;
                }
                for i in (0..size).step_by(97) {
                    assert_eq!(*ptr.add(i), (i % 253) as u8);
                }
            }
            engine.release(ptr);
        }
    }

    #[test]
    fn test_inactive_engine_uses_platform() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(
            LibcAlloc::new(),
            Config::DEFAULT.with_threshold(THRESHOLD).with_directory(dir.path()),
        );
        let ptr = engine.allocate(THRESHOLD * 2);
        assert!(!ptr.is_null());
        assert!(engine.mappings().is_empty());
        engine.release(ptr);
    }

    #[test]
    fn test_zero_size_goes_to_platform() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.set_threshold(0);
        let ptr = engine.allocate(0);
        assert!(engine.mappings().is_empty());
        engine.release(ptr);
    }

    #[test]
    fn test_zero_allocate_is_zeroed_on_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        for (count, size) in [(16, 64), (THRESHOLD / 8, 16)] {
            let ptr = engine.zero_allocate(count, size);
            assert!(!ptr.is_null());
            // Safety: Test code.
            let bytes = unsafe { std::slice::from_raw_parts(ptr, count * size) };
            assert!(bytes.iter().all(|&b| b == 0));
            engine.release(ptr);
        }
        assert!(engine.mappings().is_empty());
    }

    #[test]
    fn test_zero_allocate_overflow_is_null() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert!(engine.zero_allocate(usize::MAX, 2).is_null());
    }

    #[test]
    fn test_zero_allocate_before_activation_uses_bootstrap() {
        let engine = Engine::new(LibcAlloc::new(), Config::DEFAULT);
        let ptr = engine.zero_allocate(4, 8);
        assert!(bootstrap::ARENA.contains(ptr));
        assert_eq!(engine.usable_size(ptr), 32);
        // Releasing a bootstrap block is a no-op.
        engine.release(ptr);
    }

    #[test]
    fn test_aligned_allocate_routes_by_size_and_alignment() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let page = PlatformVmOps::page_size();

        let big = engine.aligned_allocate(64, THRESHOLD + 1);
        assert!(engine.lookup(big).is_some());
        assert_eq!(big as usize % 64, 0);

        // Exactly the threshold is not "above" it.
        let edge = engine.aligned_allocate(64, THRESHOLD);
        assert!(engine.lookup(edge).is_none());

        let over_aligned = engine.aligned_allocate(page * 2, THRESHOLD + 1);
        assert!(engine.lookup(over_aligned).is_none());
        assert_eq!(over_aligned as usize % (page * 2), 0);

        let valloc = engine.page_aligned_allocate(100);
        assert_eq!(valloc as usize % page, 0);

        for p in [big, edge, over_aligned, valloc] {
            engine.release(p);
        }
        assert!(engine.mappings().is_empty());
    }

    #[test]
    fn test_failed_file_creation_returns_null_and_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path().join("missing"));
        assert!(engine.allocate(THRESHOLD).is_null());
        assert!(engine.mappings().is_empty());
        assert_eq!(engine.stats().live_mappings, 0);
    }

    #[test]
    fn test_failed_map_unlinks_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        // The file is created, then sizing or mapping 128 TiB fails.
        assert!(engine.allocate(1 << 47).is_null());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(engine.mappings().is_empty());
        let stats = engine.stats();
        assert_eq!(stats.files_created, 1);
        assert_eq!(stats.live_mappings, 0);
        assert_eq!(stats.mapped_bytes, 0);
    }

    #[test]
    fn test_map_new_refuses_unless_active() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.shutdown();
        let res = engine.with_state(|st| engine.map_new(st, THRESHOLD)).unwrap();
        assert!(matches!(res, Err(MapError::Inactive)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(engine.stats().files_created, 0);
    }

    #[test]
    fn test_backing_file_names_carry_pid() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let ptr = engine.allocate(THRESHOLD);
        let path = engine.lookup(ptr).unwrap();
        let name = path.file_name().unwrap();
        let prefix = format!("mapalloc{}_", current_pid());
        assert!(name.as_bytes().starts_with(prefix.as_bytes()));
        assert_eq!(
            OsStr::from_bytes(&name.as_bytes()[prefix.len()..]).len(),
            6
        );
        engine.release(ptr);
    }
}
