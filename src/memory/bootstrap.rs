use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::cell::UnsafeCell;

/// Block alignment and header size.
const ALIGN: usize = 16;

/// Capacity of the process-wide arena.
pub(crate) const CAPACITY: usize = 64 * 1024;

/// Serves the zeroed allocations the dynamic loader and the C runtime make
/// before the platform allocator can be reached (or while `dlsym` is busy
/// resolving it).
pub(crate) static ARENA: BootstrapArena<CAPACITY> = BootstrapArena::new();

#[repr(C, align(16))]
struct Storage<const N: usize>(UnsafeCell<[u8; N]>);

/// A one-way bump allocator over static storage.
///
/// Blocks are never handed back: `release` of a bootstrap pointer is a no-op
/// and `resize` copies out of it. Because nothing is reused, every block is
/// still zero when it is handed out.
///
/// Each block is preceded by a 16-byte header holding its requested length.
pub(crate) struct BootstrapArena<const N: usize> {
    storage: Storage<N>,
    cursor: AtomicUsize,
}

// Safety: the cursor hands out disjoint ranges; headers are written once by
// the thread that claimed the range.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> BootstrapArena<N> {
    pub(crate) const fn new() -> Self {
        Self {
            storage: Storage(UnsafeCell::new([0; N])),
            cursor: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.storage.0.get().cast::<u8>()
    }

    /// Claim `size` zeroed bytes. Null once the arena is exhausted.
    pub(crate) fn alloc(&self, size: usize) -> *mut u8 {
        let Some(need) = size
            .checked_next_multiple_of(ALIGN)
            .and_then(|s| s.checked_add(ALIGN))
        else {
            return std::ptr::null_mut();
        };

        let mut start = self.cursor.load(Ordering::Relaxed);
        loop {
            let Some(end) = start.checked_add(need).filter(|&end| end <= N) else {
                return std::ptr::null_mut();
            };
            match self
                .cursor
                .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => start = actual,
            }
        }

        // Safety: [start, start + need) was claimed above and lies inside
        // the storage; `start` is a multiple of ALIGN.
        unsafe {
            let header = self.base().add(start);
            header.cast::<usize>().write(size);
            header.add(ALIGN)
        }
    }

    /// Whether `ptr` points into this arena.
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base() as usize;
        (base..base + N).contains(&(ptr as usize))
    }

    /// Requested length of a block returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    /// `ptr` must be a block start handed out by this arena.
    pub(crate) unsafe fn block_len(&self, ptr: *const u8) -> usize {
        debug_assert!(self.contains(ptr));
        // Safety: every block is preceded by its header.
        unsafe { ptr.sub(ALIGN).cast::<usize>().read() }
    }

    #[cfg(test)]
    pub(crate) fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}
