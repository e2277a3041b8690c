use std::io;

/// Failures inside the file-backed allocation path.
///
/// None of these escape the allocation family: `allocate`, `resize` and
/// friends turn them into a null return after unwinding whatever was already
/// created. They surface in logs and through the typed API.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("failed to create backing file: {0}")]
    Create(#[source] io::Error),

    #[error("backing directory path is not representable as a C string")]
    BadPath,

    #[error("failed to resize backing file to {len} bytes: {source}")]
    Truncate {
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to map {len} bytes: {source}")]
    Map {
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to remap {old_len} -> {new_len} bytes: {source}")]
    Remap {
        old_len: usize,
        new_len: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to unmap {len} bytes at {addr:#x}: {source}")]
    Unmap {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("madvise failed: {0}")]
    Advise(#[source] io::Error),

    #[error("file-to-file copy failed: {0}")]
    Copy(#[source] io::Error),

    #[error("address {addr:#x} is already tracked by a live mapping")]
    Collision { addr: usize },

    #[error("address {addr:#x} is not a tracked mapping")]
    NotTracked { addr: usize },

    #[error("mapping at {addr:#x} is no longer mapped in this process")]
    Dangling { addr: usize },

    #[error("engine is not active; no backing file created")]
    Inactive,
}

impl MapError {
    pub(crate) fn last_os(wrap: impl FnOnce(io::Error) -> Self) -> Self {
        wrap(io::Error::last_os_error())
    }
}
