//! Engine counters for diagnostics. Relaxed throughout: a snapshot taken
//! while other threads allocate may mix old and new values, and nothing in
//! the allocation path ever reads them back.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Signed gauge that reads as unsigned.
///
/// A release racing ahead of the matching allocation can push the raw value
/// below zero for a moment; [`get`](Self::get) reports that as 0.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    /// Saturate at `isize::MAX` rather than wrap.
    #[inline]
    fn signed(n: usize) -> isize {
        isize::try_from(n).unwrap_or(isize::MAX)
    }

    #[inline]
    pub fn add(&self, n: usize) {
        self.0.fetch_add(Self::signed(n), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, n: usize) {
        self.0.fetch_sub(Self::signed(n), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        usize::try_from(self.0.load(Ordering::Relaxed)).unwrap_or(0)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-engine counters.
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) live_mappings: Counter,
    pub(crate) mapped_bytes: Counter,
    /// Backing files created over the engine's lifetime, including
    /// fork-time copies.
    pub(crate) files_created: Counter,
    /// Requests below the threshold served by the file path because the
    /// platform allocator failed.
    pub(crate) fallbacks: Counter,
}

impl Stats {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            live_mappings: Counter::new(),
            mapped_bytes: Counter::new(),
            files_created: Counter::new(),
            fallbacks: Counter::new(),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn mapping_added(&self, len: usize) {
        self.live_mappings.add(1);
        self.mapped_bytes.add(len);
    }

    pub(crate) fn mapping_removed(&self, len: usize) {
        self.live_mappings.sub(1);
        self.mapped_bytes.sub(len);
    }

    pub(crate) fn mapping_resized(&self, old_len: usize, new_len: usize) {
        self.mapped_bytes.add(new_len);
        self.mapped_bytes.sub(old_len);
    }

    pub(crate) fn snapshot(&self) -> MapStats {
        MapStats {
            live_mappings: self.live_mappings.get(),
            mapped_bytes: self.mapped_bytes.get(),
            files_created: self.files_created.get(),
            fallbacks: self.fallbacks.get(),
        }
    }
}

/// Snapshot returned by [`Engine::stats`](super::engine::Engine::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    /// Entries currently mapped in this process.
    pub live_mappings: usize,
    pub mapped_bytes: usize,
    pub files_created: usize,
    pub fallbacks: usize,
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(5);
        assert_eq!(c.get(), 0);
        c.add(8);
        assert_eq!(c.get(), 3);
    }

    #[test]
    fn test_counter_clamps_huge_delta() {
        let c = Counter::new();
        c.add(usize::MAX);
        assert_eq!(c.get(), isize::MAX as usize);
    }

    #[test]
    fn test_stats_snapshot_tracks_mappings() {
        let s = Stats::new();
        s.files_created.add(2);
        s.mapping_added(4096);
        s.mapping_added(8192);
        s.mapping_resized(4096, 16384);
        s.mapping_removed(8192);
        assert_eq!(
            s.snapshot(),
            MapStats {
                live_mappings: 1,
                mapped_bytes: 16384,
                files_created: 2,
                fallbacks: 0,
            }
        );
    }
}
