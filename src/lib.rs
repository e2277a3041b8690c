#[cfg(not(target_os = "linux"))]
compile_error!("mapalloc relies on mremap, copy_file_range and pthread_atfork; only Linux is supported.");

#[cfg(not(target_pointer_width = "64"))]
compile_error!("mapalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

#[cfg(not(loom))]
pub mod api;

#[cfg(all(feature = "c_api", not(loom)))]
pub mod ffi;

// engine
#[cfg(not(loom))]
pub use memory::engine::{Engine, ReadyState};
#[cfg(not(loom))]
pub use memory::global::{DefaultPlatform, MapAlloc, engine};
#[cfg(not(loom))]
pub use memory::platform::{LibcAlloc, PlatformAlloc};
#[cfg(all(feature = "preload", not(loom)))]
pub use memory::platform::NextAlloc;

// config/introspection
#[cfg(not(loom))]
pub use memory::config::{Advice, Config, CowMode};
#[cfg(not(loom))]
pub use memory::registry::MappingInfo;
#[cfg(not(loom))]
pub use memory::stats::MapStats;
#[cfg(not(loom))]
pub use memory::vm::View;

// errors
#[cfg(not(loom))]
pub use memory::error::MapError;
