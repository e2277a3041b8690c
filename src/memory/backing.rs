use super::error::MapError;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// File name prefix of every backing file.
pub(crate) const FILE_PREFIX: &str = "mapalloc";

/// A freshly created backing file, unlinked on drop unless
/// [`persist`](Self::persist)ed.
///
/// Holding the open descriptor is only needed until the file is mapped; the
/// mapping keeps the inode alive on its own.
pub(crate) struct BackingFile {
    file: File,
    path: CString,
    armed: bool,
}

impl BackingFile {
    /// Create `<dir>/mapalloc<pid>_XXXXXX` with `mkostemp(O_CLOEXEC)`.
    pub(crate) fn create(dir: &Path, pid: libc::pid_t) -> Result<Self, MapError> {
        let mut template = file_template(dir, pid)?;
        // Safety: `template` is NUL-terminated and writable.
        let fd = unsafe { libc::mkostemp(template.as_mut_ptr().cast(), libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(MapError::last_os(MapError::Create));
        }
        // Safety: mkostemp returned a fresh descriptor we now own.
        let file = unsafe { File::from_raw_fd(fd) };
        let path = CString::from_vec_with_nul(template).map_err(|_| MapError::BadPath)?;
        Ok(Self {
            file,
            path,
            armed: true,
        })
    }

    pub(crate) fn set_len(&self, len: usize) -> Result<(), MapError> {
        self.file
            .set_len(len as u64)
            .map_err(|source| MapError::Truncate { len, source })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &CStr {
        &self.path
    }

    /// Keep the file on disk and hand its path to the caller. The
    /// descriptor is closed.
    pub(crate) fn persist(mut self) -> CString {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for BackingFile {
    fn drop(&mut self) {
        if self.armed {
            drop(unlink(&self.path));
        }
    }
}

fn file_template(dir: &Path, pid: libc::pid_t) -> Result<Vec<u8>, MapError> {
    let dir = dir.as_os_str().as_bytes();
    if dir.contains(&0) {
        return Err(MapError::BadPath);
    }
    let mut template = Vec::with_capacity(dir.len() + 32);
    template.extend_from_slice(dir);
    if !dir.ends_with(b"/") {
        template.push(b'/');
    }
    write!(template, "{FILE_PREFIX}{pid}_XXXXXX\0").map_err(MapError::Create)?;
    Ok(template)
}

/// Open an existing backing file read-write.
pub(crate) fn open_rw(path: &CStr) -> Result<File, MapError> {
    // Safety: `path` is NUL-terminated.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(MapError::last_os(MapError::Create));
    }
    // Safety: fresh descriptor we now own.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Resize a backing file by path.
pub(crate) fn truncate(path: &CStr, len: usize) -> Result<(), MapError> {
    let Ok(off) = libc::off_t::try_from(len) else {
        return Err(MapError::Truncate {
            len,
            source: io::Error::from_raw_os_error(libc::EFBIG),
        });
    };
    // Safety: `path` is NUL-terminated.
    if unsafe { libc::truncate(path.as_ptr(), off) } != 0 {
        return Err(MapError::last_os(|source| MapError::Truncate { len, source }));
    }
    Ok(())
}

pub(crate) fn unlink(path: &CStr) -> io::Result<()> {
    // Safety: `path` is NUL-terminated.
    if unsafe { libc::unlink(path.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Copy the first `len` bytes of `src` into `dst` inside the kernel.
pub(crate) fn copy_range(src: &File, dst: &File, len: usize) -> Result<(), MapError> {
    let mut src_off: libc::loff_t = 0;
    let mut dst_off: libc::loff_t = 0;
    let mut remaining = len;
    while remaining > 0 {
        // Safety: both descriptors are open; offsets are valid out-pointers.
        let n = unsafe {
            libc::copy_file_range(
                src.as_raw_fd(),
                &mut src_off,
                dst.as_raw_fd(),
                &mut dst_off,
                remaining,
                0,
            )
        };
        match n {
            n if n < 0 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(MapError::Copy(err));
            }
            0 => {
                return Err(MapError::Copy(io::Error::from(
                    io::ErrorKind::UnexpectedEof,
                )));
            }
            #[allow(clippy::cast_sign_loss)]
            n => remaining -= n as usize,
        }
    }
    Ok(())
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::unix::ffi::OsStrExt;

    fn exists(path: &CStr) -> bool {
        Path::new(std::ffi::OsStr::from_bytes(path.to_bytes())).exists()
    }

    #[test]
    fn test_create_uses_prefix_and_pid() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackingFile::create(dir.path(), 4242).unwrap();
        let name = Path::new(std::ffi::OsStr::from_bytes(file.path().to_bytes()));
        assert_eq!(name.parent().unwrap(), dir.path());
        let stem = name.file_name().unwrap().to_str().unwrap();
        assert!(stem.starts_with("mapalloc4242_"), "{stem}");
        assert_eq!(stem.len(), "mapalloc4242_".len() + 6);
        assert!(exists(file.path()));
    }

    #[test]
    fn test_drop_unlinks_unless_persisted() {
        let dir = tempfile::tempdir().unwrap();

        let file = BackingFile::create(dir.path(), 1).unwrap();
        let path = file.path().to_owned();
        drop(file);
        assert!(!exists(&path));

        let file = BackingFile::create(dir.path(), 1).unwrap();
        let path = file.persist();
        assert!(exists(&path));
        unlink(&path).unwrap();
        assert!(!exists(&path));
        assert!(unlink(&path).is_err());
    }

    #[test]
    fn test_trailing_slash_is_not_doubled() {
        let dir = tempfile::tempdir().unwrap();
        let mut with_slash = dir.path().as_os_str().to_owned();
        with_slash.push("/");
        let file = BackingFile::create(Path::new(&with_slash), 7).unwrap();
        assert!(!file.path().to_bytes().windows(2).any(|w| w == b"//"));
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            BackingFile::create(&missing, 1),
            Err(MapError::Create(_))
        ));
    }

    #[test]
    fn test_nul_in_directory_is_rejected() {
        let bad = Path::new(std::ffi::OsStr::from_bytes(b"/tmp/a\0b"));
        assert!(matches!(BackingFile::create(bad, 1), Err(MapError::BadPath)));
    }

    #[test]
    fn test_truncate_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackingFile::create(dir.path(), 1).unwrap();
        file.set_len(100).unwrap();
        let path = file.persist();

        truncate(&path, 4096).unwrap();
        let reopened = open_rw(&path).unwrap();
        assert_eq!(reopened.metadata().unwrap().len(), 4096);
        unlink(&path).unwrap();
        assert!(open_rw(&path).is_err());
    }

    #[test]
    fn test_copy_range_duplicates_contents() {
        let dir = tempfile::tempdir().unwrap();
        let src = BackingFile::create(dir.path(), 1).unwrap();
        let dst = BackingFile::create(dir.path(), 1).unwrap();

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        src.file().write_all(&data).unwrap();
        dst.set_len(data.len()).unwrap();

        copy_range(src.file(), dst.file(), data.len()).unwrap();

        let mut out = Vec::new();
        let mut f = dst.file();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_copy_range_past_eof_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = BackingFile::create(dir.path(), 1).unwrap();
        let dst = BackingFile::create(dir.path(), 1).unwrap();
        src.set_len(10).unwrap();
        assert!(matches!(
            copy_range(src.file(), dst.file(), 20),
            Err(MapError::Copy(_))
        ));
    }
}
