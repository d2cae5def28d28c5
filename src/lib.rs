//! alsync workspace root
//!
//! Re-exports the workspace crates and hosts the cross-crate integration
//! tests.

pub use alsync_remote as remote;
pub use alsync_store as store;
pub use alsync_sync as sync;
