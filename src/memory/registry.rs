use super::error::MapError;
use super::vm::View;
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr::NonNull;

/// One live file-backed region as this process sees it.
#[derive(Debug)]
pub(crate) struct Mapping {
    pub(crate) addr: usize,
    /// Absolute path of the backing file. Kept as a C string so that
    /// reopening or unlinking it needs no allocation.
    pub(crate) path: CString,
    /// Mapped length, equal to the backing file's size.
    pub(crate) length: usize,
    /// Process that created (or last re-created) the mapping.
    pub(crate) owner_pid: libc::pid_t,
    pub(crate) view: View,
    /// Whether this process may unlink or truncate the backing file.
    pub(crate) owns_file: bool,
    /// Whether `[addr, addr + length)` is currently mapped here.
    pub(crate) mapped: bool,
}

impl Mapping {
    pub(crate) fn new(addr: NonNull<u8>, path: CString, length: usize, pid: libc::pid_t) -> Self {
        Self {
            addr: addr.as_ptr() as usize,
            path,
            length,
            owner_pid: pid,
            view: View::Shared,
            owns_file: true,
            mapped: true,
        }
    }

    pub(crate) fn ptr(&self) -> NonNull<u8> {
        // Safety: entries are only created from non-null mappings.
        unsafe { NonNull::new_unchecked(self.addr as *mut u8) }
    }

    /// Owner in the sense of the unlink/truncate rule.
    pub(crate) fn owns_backing(&self, pid: libc::pid_t) -> bool {
        self.owner_pid == pid && self.owns_file
    }

    pub(crate) fn info(&self) -> MappingInfo {
        MappingInfo {
            addr: self.addr,
            path: PathBuf::from(std::ffi::OsStr::from_bytes(self.path.to_bytes())),
            length: self.length,
            owner_pid: self.owner_pid,
            view: self.view,
            owns_file: self.owns_file,
            mapped: self.mapped,
        }
    }
}

/// Point-in-time copy of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    pub addr: usize,
    pub path: PathBuf,
    pub length: usize,
    pub owner_pid: libc::pid_t,
    pub view: View,
    pub owns_file: bool,
    pub mapped: bool,
}

/// Address-ordered map of live mappings.
///
/// Performs no locking; the engine only reaches it through its reentrant
/// lock.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: BTreeMap<usize, Mapping>,
}

impl Registry {
    pub(crate) const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Track a new mapping.
    ///
    /// An entry left behind by a view that is no longer mapped here (an
    /// inherited record whose range the kernel handed out again) is
    /// replaced and returned. A live entry at the same address is an
    /// invariant violation.
    pub(crate) fn insert(&mut self, mapping: Mapping) -> Result<Option<Mapping>, MapError> {
        match self.entries.entry(mapping.addr) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(mapping);
                Ok(None)
            }
            btree_map::Entry::Occupied(slot) if slot.get().mapped => Err(MapError::Collision {
                addr: mapping.addr,
            }),
            btree_map::Entry::Occupied(mut slot) => Ok(Some(slot.insert(mapping))),
        }
    }

    pub(crate) fn get(&self, addr: usize) -> Option<&Mapping> {
        self.entries.get(&addr)
    }

    pub(crate) fn get_mut(&mut self, addr: usize) -> Option<&mut Mapping> {
        self.entries.get_mut(&addr)
    }

    pub(crate) fn remove(&mut self, addr: usize) -> Option<Mapping> {
        self.entries.remove(&addr)
    }

    /// Ascending by address.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.entries.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Mapping> {
        self.entries.values_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, handing them to the caller.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Mapping> {
        std::mem::take(&mut self.entries).into_values()
    }
}
