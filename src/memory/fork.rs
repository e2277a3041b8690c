use super::backing::{self, BackingFile};
use super::config::{CowMode, DEFAULT_DIRECTORY};
use super::engine::{Engine, State, current_pid};
use super::error::MapError;
use super::platform::PlatformAlloc;
use super::registry::Mapping;
use super::stats::Stats;
use super::vm::{PlatformVmOps, View, VmOps};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;

impl<P: PlatformAlloc> Engine<P> {
    /// `pthread_atfork` prepare hook: hold the engine lock across `fork`
    /// so the child never inherits it mid-update.
    pub fn fork_prepare(&self) {
        self.lock().raw_lock();
    }

    /// `pthread_atfork` parent hook.
    ///
    /// # Safety
    /// Must follow [`fork_prepare`](Self::fork_prepare) on the same thread.
    pub unsafe fn fork_parent(&self) {
        // Safety: forwarded contract.
        unsafe { self.lock().raw_unlock() }
    }

    /// `pthread_atfork` child hook: reconcile inherited mappings, then
    /// release the lock taken by `fork_prepare`.
    ///
    /// # Safety
    /// Must follow [`fork_prepare`](Self::fork_prepare) on the thread that
    /// called `fork`.
    pub unsafe fn fork_child(&self) {
        self.reconcile_after_fork();
        // Safety: forwarded contract.
        unsafe { self.lock().raw_unlock() }
    }

    /// Apply the copy-on-write policy to every mapping inherited from the
    /// parent. Failures are logged and leave the range unmapped; the child
    /// carries on.
    pub(crate) fn reconcile_after_fork(&self) {
        let pid = current_pid();
        self.with_state(|st| {
            let State {
                registry,
                directory,
                cow_mode,
                ..
            } = st;
            let dir = directory.as_deref().unwrap_or(Path::new(DEFAULT_DIRECTORY));
            let inherited = registry
                .iter_mut()
                .filter(|m| m.mapped && m.owner_pid != pid);

            match *cow_mode {
                CowMode::Shared => {}
                CowMode::Reserved(n) => {
                    log::debug!("cow mode {n} is reserved; inherited mappings stay shared");
                }
                CowMode::InCore => {
                    for m in inherited {
                        if let Err(e) = privatize(m, pid) {
                            abandon(m, &self.stats, &e);
                        }
                    }
                }
                CowMode::FullCopy => {
                    for m in inherited {
                        if let Err(e) = duplicate(m, dir, pid, &self.stats) {
                            abandon(m, &self.stats, &e);
                        }
                    }
                }
            }
        });
    }
}

/// In-core copy-on-write: swap a shared view for a private one over the
/// same file at the same address. The parent keeps the file.
fn privatize(m: &mut Mapping, pid: libc::pid_t) -> Result<(), MapError> {
    if m.view == View::Shared {
        let file = backing::open_rw(&m.path)?;
        // Safety: replaces this process's own view of the range.
        unsafe {
            PlatformVmOps::map_file(file.as_raw_fd(), m.length, View::Private, Some(m.ptr()))?;
        }
        m.view = View::Private;
    }
    // Private views were already isolated by fork itself.
    m.owner_pid = pid;
    m.owns_file = false;
    Ok(())
}

/// Full copy: the child gets a backing file of its own with the current
/// contents, mapped shared at the same address.
fn duplicate(
    m: &mut Mapping,
    dir: &Path,
    pid: libc::pid_t,
    stats: &Stats,
) -> Result<(), MapError> {
    let file = BackingFile::create(dir, pid)?;
    stats.files_created.add(1);
    file.set_len(m.length)?;

    match m.view {
        View::Shared => {
            let src = backing::open_rw(&m.path)?;
            backing::copy_range(&src, file.file(), m.length)?;
        }
        View::Private => {
            // The view differs from its file; copy what this process sees.
            // Safety: live mapping of `length` bytes.
            let bytes = unsafe { std::slice::from_raw_parts(m.ptr().as_ptr(), m.length) };
            file.file().write_all_at(bytes, 0).map_err(MapError::Copy)?;
        }
    }

    // Safety: replaces this process's own view of the range.
    unsafe { PlatformVmOps::map_file(file.fd(), m.length, View::Shared, Some(m.ptr()))? };

    m.path = file.persist();
    m.owner_pid = pid;
    m.owns_file = true;
    m.view = View::Shared;
    log::debug!("fork: {:#x} now backed by {:?}", m.addr, m.path);
    Ok(())
}

fn abandon(m: &mut Mapping, stats: &Stats, err: &MapError) {
    log::error!("fork: could not reconcile mapping at {:#x}: {err}", m.addr);
    // Safety: this process's view of the range.
    drop(unsafe { PlatformVmOps::unmap(m.ptr(), m.length) });
    m.mapped = false;
    stats.mapping_removed(m.length);
}
