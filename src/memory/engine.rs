use super::backing;
use super::config::{Advice, Config, CowMode, DEFAULT_DIRECTORY};
use super::error::MapError;
use super::lock::ReentrantLock;
use super::platform::PlatformAlloc;
use super::registry::{MappingInfo, Registry};
use super::stats::{MapStats, Stats};
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::cell::RefCell;
use std::path::{Path, PathBuf};

const PENDING: u8 = 0;
const ACTIVE: u8 = 1;
const SHUT_DOWN: u8 = 2;

/// Lifecycle of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Created, not yet routing anything to files.
    Pending,
    /// Routing requests at or above the threshold to backing files.
    Active,
    /// Torn down at exit. New requests go to the platform allocator, but
    /// tracked blocks are still recognised on release.
    ShutDown,
}

/// Everything the reentrant lock protects.
pub(crate) struct State {
    pub(crate) registry: Registry,
    pub(crate) directory: Option<PathBuf>,
    pub(crate) advice: Advice,
    pub(crate) cow_mode: CowMode,
}

impl State {
    pub(crate) fn directory(&self) -> &Path {
        self.directory
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_DIRECTORY))
    }
}

/// The allocation-interception engine.
///
/// One engine owns one registry of file-backed mappings and the
/// configuration that governs it. The process-wide instance lives in
/// [`global`](super::global); tests and embedders may create their own.
///
/// All lock-protected state is reached through [`with_state`](Self::with_state).
/// A thread that re-enters the engine while it already has the state
/// borrowed (an allocation made by the engine's own bookkeeping) is served by
/// the platform allocator.
pub struct Engine<P: PlatformAlloc> {
    pub(crate) platform: P,
    ready: AtomicU8,
    threshold: AtomicUsize,
    /// Mirror of the registry length, so that releases of untracked
    /// pointers can skip the lock while nothing is mapped.
    tracked: AtomicUsize,
    state: ReentrantLock<RefCell<State>>,
    pub(crate) stats: Stats,
}

impl<P: PlatformAlloc> Engine<P> {
    pub fn new(platform: P, config: Config) -> Self {
        let Config {
            threshold,
            backing_directory,
            default_advice,
            cow_mode,
        } = config;
        Self::from_parts(platform, threshold, backing_directory, default_advice, cow_mode)
    }

    /// Const form of [`new`](Self::new) for `static` engines. Takes the
    /// configuration field by field, since a `Config` cannot be taken apart
    /// during const evaluation.
    pub const fn from_parts(
        platform: P,
        threshold: usize,
        directory: Option<PathBuf>,
        advice: Advice,
        cow_mode: CowMode,
    ) -> Self {
        Self {
            platform,
            ready: AtomicU8::new(PENDING),
            threshold: AtomicUsize::new(threshold),
            tracked: AtomicUsize::new(0),
            state: ReentrantLock::new(RefCell::new(State {
                registry: Registry::new(),
                directory,
                advice,
                cow_mode,
            })),
            stats: Stats::new(),
        }
    }

    /// Run `f` on the lock-protected state.
    ///
    /// Returns `None` when the calling thread already has the state
    /// borrowed further up its stack.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> Option<R> {
        let guard = self.state.lock();
        let mut state = guard.try_borrow_mut().ok()?;
        let out = f(&mut state);
        self.tracked.store(state.registry.len(), Ordering::Release);
        Some(out)
    }

    pub(crate) fn lock(&self) -> &ReentrantLock<RefCell<State>> {
        &self.state
    }

    pub(crate) fn has_tracked(&self) -> bool {
        self.tracked.load(Ordering::Acquire) != 0
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn ready_state(&self) -> ReadyState {
        match self.ready.load(Ordering::Acquire) {
            PENDING => ReadyState::Pending,
            ACTIVE => ReadyState::Active,
            _ => ReadyState::ShutDown,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.ready.load(Ordering::Acquire) == ACTIVE
    }

    /// Whether [`activate`](Self::activate) ever succeeded.
    #[inline]
    pub(crate) fn was_activated(&self) -> bool {
        self.ready.load(Ordering::Acquire) != PENDING
    }

    /// Start routing large requests to backing files. Only the first call
    /// on a pending engine has an effect.
    pub fn activate(&self) -> bool {
        let _guard = self.state.lock();
        self.ready
            .compare_exchange(PENDING, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Exit-time teardown.
    ///
    /// Unlinks every backing file this process owns. Mappings stay in place
    /// and tracked, since destructors that run after this may still read
    /// them or hand them back to `release`.
    pub fn shutdown(&self) {
        let pid = current_pid();
        self.with_state(|st| {
            self.ready.store(SHUT_DOWN, Ordering::Release);
            let mut unlinked = 0usize;
            for m in st.registry.iter_mut() {
                if m.owns_backing(pid) {
                    if let Err(e) = backing::unlink(&m.path) {
                        log::warn!("failed to unlink {:?} at exit: {e}", m.path);
                    }
                    m.owns_file = false;
                    unlinked += 1;
                }
            }
            log::debug!("shutdown: unlinked {unlinked} backing files");
        });
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    #[inline]
    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    pub fn set_threshold(&self, threshold: usize) {
        let _guard = self.state.lock();
        self.threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn directory(&self) -> PathBuf {
        self.with_state(|st| st.directory().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIRECTORY))
    }

    pub fn set_directory(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.with_state(|st| st.directory = Some(dir));
    }

    pub fn default_advice(&self) -> Advice {
        self.with_state(|st| st.advice).unwrap_or(Advice::Sequential)
    }

    pub fn set_default_advice(&self, advice: Advice) {
        self.with_state(|st| st.advice = advice);
    }

    pub fn cow_mode(&self) -> CowMode {
        self.with_state(|st| st.cow_mode).unwrap_or(CowMode::InCore)
    }

    pub fn set_cow_mode(&self, mode: CowMode) {
        self.with_state(|st| st.cow_mode = mode);
    }

    /// Overlay the environment onto the live configuration.
    pub fn apply_env(&self) {
        let mut config = Config {
            threshold: self.threshold(),
            backing_directory: None,
            default_advice: Advice::Sequential,
            cow_mode: self.cow_mode(),
        };
        config.apply_env();
        self.set_threshold(config.threshold);
        self.set_cow_mode(config.cow_mode);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Backing file of the mapping that starts at `addr`.
    pub fn lookup(&self, addr: *const u8) -> Option<PathBuf> {
        self.with_state(|st| st.registry.get(addr as usize).map(|m| m.info().path))
            .flatten()
    }

    /// Every tracked mapping, in ascending address order.
    pub fn mappings(&self) -> Vec<MappingInfo> {
        self.with_state(|st| st.registry.iter().map(|m| m.info()).collect())
            .unwrap_or_default()
    }

    /// Apply a raw `MADV_*` hint to the whole mapping starting at `addr`.
    pub fn advise(&self, addr: *const u8, advice: libc::c_int) -> Result<(), MapError> {
        let addr = addr as usize;
        self.with_state(|st| {
            let m = st
                .registry
                .get(addr)
                .ok_or(MapError::NotTracked { addr })?;
            if !m.mapped {
                return Err(MapError::Dangling { addr });
            }
            // Safety: the range is a live mapping owned by the registry.
            unsafe { PlatformVmOps::advise(m.ptr(), m.length, advice) }
        })
        .unwrap_or(Err(MapError::NotTracked { addr }))
    }

    pub fn stats(&self) -> MapStats {
        self.stats.snapshot()
    }
}

impl<P: PlatformAlloc> Drop for Engine<P> {
    fn drop(&mut self) {
        let pid = current_pid();
        self.with_state(|st| {
            for m in st.registry.drain() {
                if m.mapped {
                    // Safety: the registry owned this mapping.
                    if let Err(e) = unsafe { PlatformVmOps::unmap(m.ptr(), m.length) } {
                        log::error!("{e}");
                    }
                }
                if m.owns_backing(pid) {
                    drop(backing::unlink(&m.path));
                }
            }
        });
    }
}

pub(crate) fn current_pid() -> libc::pid_t {
    // Safety: FFI call to getpid.
    unsafe { libc::getpid() }
}
