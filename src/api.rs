//! Configuration and introspection of the process-wide engine.
//!
//! Every function initializes the engine on first use. The same operations
//! are exported as `mapalloc_*` C symbols under the `c_api` feature.

use crate::memory::config::{Advice, CowMode};
use crate::memory::error::MapError;
use crate::memory::global::engine;
use crate::memory::registry::MappingInfo;
use crate::memory::stats::MapStats;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Set the size threshold if `proposed > 0`; return the current value.
pub fn threshold(proposed: usize) -> usize {
    let engine = engine();
    if proposed > 0 {
        engine.set_threshold(proposed);
    }
    engine.threshold()
}

/// Set the backing directory if one is given; return the current value.
///
/// Only files created afterwards are placed in the new directory.
pub fn path(proposed: Option<&Path>) -> PathBuf {
    let engine = engine();
    if let Some(dir) = proposed {
        engine.set_directory(dir);
    }
    engine.directory()
}

/// Apply a raw `MADV_*` hint to the mapping that starts at `addr`.
pub fn madvise(addr: *const u8, advice: libc::c_int) -> Result<(), MapError> {
    engine().advise(addr, advice)
}

/// Typed form of [`madvise`].
pub fn advise(addr: *const u8, advice: Advice) -> Result<(), MapError> {
    madvise(addr, advice.as_raw())
}

/// Set the access hint applied to mappings created from now on, if one is
/// given; return the current value.
pub fn advice(proposed: Option<Advice>) -> Advice {
    let engine = engine();
    if let Some(advice) = proposed {
        engine.set_default_advice(advice);
    }
    engine.default_advice()
}

/// Set the copy-on-write policy applied at future forks; return the
/// current value. Values `<= 0` read back as `0`.
pub fn cow(mode: i32) -> i32 {
    let engine = engine();
    engine.set_cow_mode(CowMode::from_raw(mode));
    engine.cow_mode().as_raw()
}

/// Backing file of the mapping that starts at `addr`.
pub fn lookup(addr: *const u8) -> Option<PathBuf> {
    engine().lookup(addr)
}

/// Every tracked mapping, ascending by address.
pub fn mappings() -> Vec<MappingInfo> {
    engine().mappings()
}

pub fn stats() -> MapStats {
    engine().stats()
}

/// Print `address, length, path` for every mapping to stderr.
pub fn debug_list() {
    // Best effort; stderr may be closed.
    drop(write_debug_list(&mut io::stderr().lock()));
}

/// [`debug_list`] into any writer.
pub fn write_debug_list(out: &mut impl Write) -> io::Result<()> {
    for m in mappings() {
        writeln!(out, "{:#x}, {}, {}", m.addr, m.length, m.path.display())?;
    }
    Ok(())
}

/// `memcpy` that copies whole file-backed mappings inside the kernel.
///
/// # Safety
/// Same contract as [`std::ptr::copy`].
pub unsafe fn copy_region(dest: *mut u8, src: *const u8, n: usize) -> *mut u8 {
    // Safety: forwarded contract.
    unsafe { engine().copy_region(dest, src, n) }
}
