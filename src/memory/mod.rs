pub(crate) mod lock;
pub(crate) mod stats;

#[cfg(not(loom))]
pub(crate) mod backing;
#[cfg(not(loom))]
pub(crate) mod bootstrap;
#[cfg(not(loom))]
pub(crate) mod config;
#[cfg(not(loom))]
mod copy;
#[cfg(not(loom))]
pub(crate) mod engine;
#[cfg(not(loom))]
pub(crate) mod error;
#[cfg(not(loom))]
mod fork;
#[cfg(not(loom))]
pub(crate) mod global;
#[cfg(not(loom))]
pub(crate) mod platform;
#[cfg(not(loom))]
pub(crate) mod registry;
#[cfg(not(loom))]
mod resize;
#[cfg(not(loom))]
mod router;
#[cfg(not(loom))]
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
