//! 持久化存储底座
//!
//! [`Store`] 是跨会话的命名空间 KV 存储，[`StoreBackend`](crate::vfs::StoreBackend)
//! 在其上实现文件语义：
//!
//! | 实现 | 介质 | 用途 |
//! |------|------|------|
//! | [`InMemoryStore`] | 进程内存 | 测试、短生命周期 |
//! | [`FileStore`] | 单个 JSON 文件 | 本地持久化 |
//!
//! ```rust,no_run
//! use echo_vfs::memory::store::{FileStore, Store};
//! use echo_vfs::vfs::{Backend, StoreBackend};
//! use std::sync::Arc;
//!
//! # async fn example() -> echo_vfs::error::Result<()> {
//! let store: Arc<dyn Store> = Arc::new(FileStore::new("~/.echo-vfs/store.json")?);
//! let backend = StoreBackend::new(store, Some("alice"));
//! backend.write("/memories/prefs.md", "深色主题").await?;
//! # Ok(())
//! # }
//! ```

pub mod store;

pub use store::{FileStore, InMemoryStore, Store, StoreItem};
