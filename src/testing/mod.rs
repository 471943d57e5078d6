//! 测试基础设施
//!
//! 提供在不依赖真实磁盘 / 外部存储的情况下测试各后端的工具集。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`RecordingStore`] | 内存 Store，记录每次 `search` 的分页参数 |
//! | [`FailingStore`] | 总是返回错误，用于测试批量操作的容错路径 |
//!
//! # 设计原则
//!
//! - **零磁盘访问**：所有替身都完全在内存中运行
//! - **可观测**：通过 `search_calls()` / `search_offsets()` 检查调用情况
//! - **线程安全**：内部使用 `Arc<Mutex<_>>`，可安全地在多任务测试中共享
//!
//! # 使用示例
//!
//! ```rust
//! use echo_vfs::testing::RecordingStore;
//! use echo_vfs::vfs::{Backend, StoreBackend};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> echo_vfs::error::Result<()> {
//! let store = Arc::new(RecordingStore::new());
//! let backend = StoreBackend::new(store.clone(), None).with_page_size(2);
//! for i in 0..3 {
//!     backend.write(&format!("/f{i}.txt"), "x").await?;
//! }
//! store.clear_calls();
//!
//! let entries = backend.ls_info("/").await?;
//! assert_eq!(entries.len(), 3);
//! assert_eq!(store.search_offsets(), vec![0, 2]);
//! # Ok(())
//! # }
//! ```

pub mod mock_store;

pub use mock_store::{FailingStore, RecordingStore, SearchCall};
