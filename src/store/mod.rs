//! Atomic document store.
//!
//! Every other component persists through this module: advisory locks for
//! coordination, temp-file-and-rename for crash safety.
mod atomic;
mod cache;
mod lock;

pub use atomic::{
    find_orphan_temps, is_temp_file_name, sweep_orphan_temps, to_document_bytes, AtomicStore,
    ExclusiveGuard, SharedGuard,
};
pub use cache::DocumentCache;
pub use lock::{FileLock, LockMode};
pub(crate) use atomic::write_atomic;
