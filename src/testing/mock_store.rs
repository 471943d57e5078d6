//! 可观测的 Store 替身，用于验证分页与错误路径。
//!
//! # 示例
//!
//! ```rust
//! use echo_vfs::testing::RecordingStore;
//! use echo_vfs::memory::Store;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = RecordingStore::new();
//! store.put(&["fs"], "/a", serde_json::json!(1)).await.unwrap();
//! let page = store.search(&["fs"], None, 100, 0).await.unwrap();
//! assert_eq!(page.len(), 1);
//! assert_eq!(store.search_offsets(), vec![0]);
//! # }
//! ```

use crate::error::{Result, StoreError};
use crate::memory::store::{InMemoryStore, Store, StoreItem};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

/// 一次 `search` 调用的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchCall {
    pub limit: usize,
    pub offset: usize,
}

/// 包装 [`InMemoryStore`]，记录每次 `search` 的分页参数
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryStore,
    calls: Arc<Mutex<Vec<SearchCall>>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有历史 `search` 调用（按时序排列）
    pub fn search_calls(&self) -> Vec<SearchCall> {
        self.calls.lock().unwrap().clone()
    }

    /// 各次 `search` 请求的 offset
    pub fn search_offsets(&self) -> Vec<usize> {
        self.search_calls().iter().map(|c| c.offset).collect()
    }

    /// 清空已记录的调用历史
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn put(&self, namespace: &[&str], key: &str, value: Value) -> Result<()> {
        self.inner.put(namespace, key, value).await
    }

    async fn get(&self, namespace: &[&str], key: &str) -> Result<Option<StoreItem>> {
        self.inner.get(namespace, key).await
    }

    async fn search(
        &self,
        namespace: &[&str],
        filter: Option<&Map<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoreItem>> {
        self.calls.lock().unwrap().push(SearchCall { limit, offset });
        self.inner.search(namespace, filter, limit, offset).await
    }

    async fn delete(&self, namespace: &[&str], key: &str) -> Result<bool> {
        self.inner.delete(namespace, key).await
    }

    async fn list_namespaces(&self, prefix: Option<&[&str]>) -> Result<Vec<Vec<String>>> {
        self.inner.list_namespaces(prefix).await
    }
}

/// 每个调用都失败的 Store，用于测试后端的容错路径
pub struct FailingStore {
    message: String,
}

impl FailingStore {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(StoreError::IoError(self.message.clone()).into())
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn put(&self, _namespace: &[&str], _key: &str, _value: Value) -> Result<()> {
        self.fail()
    }

    async fn get(&self, _namespace: &[&str], _key: &str) -> Result<Option<StoreItem>> {
        self.fail()
    }

    async fn search(
        &self,
        _namespace: &[&str],
        _filter: Option<&Map<String, Value>>,
        _limit: usize,
        _offset: usize,
    ) -> Result<Vec<StoreItem>> {
        self.fail()
    }

    async fn delete(&self, _namespace: &[&str], _key: &str) -> Result<bool> {
        self.fail()
    }

    async fn list_namespaces(&self, _prefix: Option<&[&str]>) -> Result<Vec<Vec<String>>> {
        self.fail()
    }
}
