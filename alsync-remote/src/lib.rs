//! Access to the remote file service holding the item directories

pub mod alist;
pub mod entry;
pub mod errors;
pub mod memory;
pub mod storage;

pub use alist::AlistClient;
pub use entry::{ListPage, RemoteEntry};
pub use errors::{RemoteError, Result};
pub use memory::MemoryRemote;
pub use storage::{list, DirListing, RemoteStorage, DEFAULT_PAGE_SIZE};
