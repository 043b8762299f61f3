//! Shared dependency cache for flow executions
//!
//! Provides content-addressed dependency directories keyed by the fingerprint
//! of a flow's package specs. Entries are sealed read-only once ready, so many
//! isolation slots can bind the same entry at once.
//!
//! # Entry States
//!
//! | State | Bindable | Description |
//! |-------|----------|-------------|
//! | Building | no | Install in progress, or crashed and awaiting rebuild |
//! | Ready | yes | Installed, sealed, reference counted |

pub mod entry;
pub mod fingerprint;
pub mod pool;

pub use entry::{
    dir_size, format_bytes, list_entries, remove_tree, CacheManifest, CacheRef, CacheState,
    MANIFEST_FILE,
};
pub use fingerprint::{DependencyFingerprint, PackageSource, PackageSpec};
pub use pool::{CacheEntryStatus, CachePool};
