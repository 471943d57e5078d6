pub mod config;
pub mod error;
pub mod eviction;
pub mod memory;
pub mod testing;
pub mod vfs;

pub mod prelude {
    pub use crate::config::StorageConfig;
    pub use crate::error::{FileError, Result, VfsError};
    pub use crate::eviction::{EvictionOutcome, LargeResultEvictor, ToolMessage};
    pub use crate::memory::{FileStore, InMemoryStore, Store};
    pub use crate::vfs::{
        Backend, BlockingBackend, CompositeBackend, DiskBackend, EphemeralBackend, FileState,
        GrepOutputMode, StoreBackend,
    };
}
