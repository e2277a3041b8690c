use std::ffi::CStr;
use std::path::PathBuf;

/// Directory backing files are created in unless configured otherwise.
pub const DEFAULT_DIRECTORY: &str = "/tmp";

/// Size in bytes at or above which allocations become file-backed.
pub const DEFAULT_THRESHOLD: usize = 2_000_000_000;

pub const ENV_THRESHOLD: &CStr = c"MAPALLOC_THRESHOLD";
pub const ENV_COW: &CStr = c"MAPALLOC_COW";

/// Access-pattern hint applied to new mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Random,
    Sequential,
    WillNeed,
    DontNeed,
}

impl Advice {
    pub const fn as_raw(self) -> libc::c_int {
        match self {
            Advice::Normal => libc::MADV_NORMAL,
            Advice::Random => libc::MADV_RANDOM,
            Advice::Sequential => libc::MADV_SEQUENTIAL,
            Advice::WillNeed => libc::MADV_WILLNEED,
            Advice::DontNeed => libc::MADV_DONTNEED,
        }
    }

    pub const fn from_raw(raw: libc::c_int) -> Option<Self> {
        Some(match raw {
            libc::MADV_NORMAL => Advice::Normal,
            libc::MADV_RANDOM => Advice::Random,
            libc::MADV_SEQUENTIAL => Advice::Sequential,
            libc::MADV_WILLNEED => Advice::WillNeed,
            libc::MADV_DONTNEED => Advice::DontNeed,
            _ => return None,
        })
    }
}

/// What a forked child does with the mappings it inherits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowMode {
    /// Parent and child keep sharing the same pages and file.
    Shared,
    /// The child's views become private copy-on-write views of the
    /// parent's files.
    InCore,
    /// The child gets its own copy of every backing file.
    FullCopy,
    /// Accepted and stored, but behaves like a no-op at fork.
    Reserved(i32),
}

impl CowMode {
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            i32::MIN..=0 => CowMode::Shared,
            1 => CowMode::InCore,
            2 => CowMode::FullCopy,
            n => CowMode::Reserved(n),
        }
    }

    pub const fn as_raw(self) -> i32 {
        match self {
            CowMode::Shared => 0,
            CowMode::InCore => 1,
            CowMode::FullCopy => 2,
            CowMode::Reserved(n) => n,
        }
    }
}

/// Startup configuration of an [`Engine`](super::engine::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub threshold: usize,
    /// `None` means [`DEFAULT_DIRECTORY`].
    pub backing_directory: Option<PathBuf>,
    pub default_advice: Advice,
    pub cow_mode: CowMode,
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Config {
    pub const DEFAULT: Self = Self {
        threshold: DEFAULT_THRESHOLD,
        backing_directory: None,
        default_advice: Advice::Sequential,
        cow_mode: CowMode::InCore,
    };

    #[must_use]
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backing_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_cow_mode(mut self, mode: CowMode) -> Self {
        self.cow_mode = mode;
        self
    }

    pub fn directory(&self) -> PathBuf {
        self.backing_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIRECTORY))
    }

    /// Overlay `MAPALLOC_THRESHOLD` and `MAPALLOC_COW` from the process
    /// environment. Malformed values are ignored.
    ///
    /// Uses `getenv` directly so that it can run during allocator
    /// initialization.
    pub fn apply_env(&mut self) {
        self.apply_vars(getenv(ENV_THRESHOLD), getenv(ENV_COW));
    }

    fn apply_vars(&mut self, threshold: Option<&[u8]>, cow: Option<&[u8]>) {
        if let Some(raw) = threshold {
            match parse_unsigned(raw) {
                Some(v) => self.threshold = v,
                None => log::warn!("ignoring malformed {ENV_THRESHOLD:?}"),
            }
        }
        if let Some(raw) = cow {
            match parse_signed(raw) {
                Some(v) => self.cow_mode = CowMode::from_raw(v),
                None => log::warn!("ignoring malformed {ENV_COW:?}"),
            }
        }
    }
}

fn getenv(name: &CStr) -> Option<&'static [u8]> {
    // Safety: `name` is NUL-terminated. The returned string is owned by the
    // environment block and outlives initialization.
    let raw = unsafe { libc::getenv(name.as_ptr()) };
    if raw.is_null() {
        return None;
    }
    // Safety: getenv returns a NUL-terminated string.
    Some(unsafe { CStr::from_ptr(raw) }.to_bytes())
}

fn trim_ascii_start(s: &[u8]) -> &[u8] {
    let skip = s.iter().take_while(|b| b.is_ascii_whitespace()).count();
    &s[skip..]
}

/// `strtoul(s, _, 0)` syntax: decimal, `0x` hexadecimal or leading-`0`
/// octal. The whole string has to be consumed.
fn parse_unsigned(s: &[u8]) -> Option<usize> {
    let s = trim_ascii_start(s);
    let s = s.strip_prefix(b"+").unwrap_or(s);
    let (digits, radix) = if let Some(hex) = s
        .strip_prefix(b"0x")
        .or_else(|| s.strip_prefix(b"0X"))
    {
        (hex, 16)
    } else if s.len() > 1 && s[0] == b'0' {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() {
        return None;
    }
    let digits = std::str::from_utf8(digits).ok()?;
    usize::from_str_radix(digits, radix).ok()
}

/// Signed decimal, as `strtol(s, _, 10)` with the whole string consumed.
fn parse_signed(s: &[u8]) -> Option<i32> {
    let s = trim_ascii_start(s);
    std::str::from_utf8(s).ok()?.parse().ok()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.threshold, 2_000_000_000);
        assert_eq!(c.directory(), PathBuf::from("/tmp"));
        assert_eq!(c.default_advice, Advice::Sequential);
        assert_eq!(c.cow_mode, CowMode::InCore);
    }

    #[test]
    fn test_cow_mode_raw_mapping() {
        assert_eq!(CowMode::from_raw(-3), CowMode::Shared);
        assert_eq!(CowMode::from_raw(0), CowMode::Shared);
        assert_eq!(CowMode::from_raw(1), CowMode::InCore);
        assert_eq!(CowMode::from_raw(2), CowMode::FullCopy);
        assert_eq!(CowMode::from_raw(7), CowMode::Reserved(7));
        assert_eq!(CowMode::Reserved(7).as_raw(), 7);
        assert_eq!(CowMode::Shared.as_raw(), 0);
    }

    #[test]
    fn test_advice_raw_mapping() {
        for a in [
            Advice::Normal,
            Advice::Random,
            Advice::Sequential,
            Advice::WillNeed,
            Advice::DontNeed,
        ] {
            assert_eq!(Advice::from_raw(a.as_raw()), Some(a));
        }
        assert_eq!(Advice::from_raw(-1), None);
    }

    #[test]
    fn test_parse_unsigned_bases() {
        assert_eq!(parse_unsigned(b"4096"), Some(4096));
        assert_eq!(parse_unsigned(b"0x1000"), Some(4096));
        assert_eq!(parse_unsigned(b"0X1000"), Some(4096));
        assert_eq!(parse_unsigned(b"010"), Some(8));
        assert_eq!(parse_unsigned(b"0"), Some(0));
        assert_eq!(parse_unsigned(b"  +12"), Some(12));
        assert_eq!(parse_unsigned(b""), None);
        assert_eq!(parse_unsigned(b"0x"), None);
        assert_eq!(parse_unsigned(b"12k"), None);
        assert_eq!(parse_unsigned(b"09"), None);
        assert_eq!(parse_unsigned(b"-1"), None);
        assert_eq!(parse_unsigned(b"99999999999999999999999"), None);
    }

    #[test]
    fn test_parse_signed() {
        assert_eq!(parse_signed(b"2"), Some(2));
        assert_eq!(parse_signed(b"-1"), Some(-1));
        assert_eq!(parse_signed(b" 3"), Some(3));
        assert_eq!(parse_signed(b"0x2"), None);
        assert_eq!(parse_signed(b"two"), None);
    }

    #[test]
    fn test_env_overlay_applies_valid_values() {
        let mut c = Config::DEFAULT;
        c.apply_vars(Some(b"0x100000"), Some(b"2"));
        assert_eq!(c.threshold, 0x10_0000);
        assert_eq!(c.cow_mode, CowMode::FullCopy);
    }

    #[test]
    fn test_env_overlay_ignores_malformed_values() {
        let mut c = Config::DEFAULT.with_threshold(123);
        c.apply_vars(Some(b"lots"), Some(b"1.5"));
        assert_eq!(c.threshold, 123);
        assert_eq!(c.cow_mode, CowMode::InCore);

        c.apply_vars(None, None);
        assert_eq!(c, Config::DEFAULT.with_threshold(123));
    }

    #[test]
    fn test_apply_env_reads_process_environment() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // Safety: no other test touches these variables, and the write
        // guard keeps the engine tests that read the environment out.
        unsafe {
            std::env::set_var("MAPALLOC_THRESHOLD", "65536");
            std::env::set_var("MAPALLOC_COW", "0");
        }
        let mut c = Config::DEFAULT;
        c.apply_env();
        // Safety: see above.
        unsafe {
            std::env::remove_var("MAPALLOC_THRESHOLD");
            std::env::remove_var("MAPALLOC_COW");
        }
        assert_eq!(c.threshold, 65536);
        assert_eq!(c.cow_mode, CowMode::Shared);
    }
}
