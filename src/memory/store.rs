//! 持久化 KV Store
//!
//! 以 `namespace / key / value` 三元组组织数据，namespace 是 `&[&str]` 切片
//! （如 `&["alice", "filesystem"]`），不同所属实体天然隔离。
//!
//! `search` 只支持按 key 顺序分页读取（可带顶层字段相等过滤），
//! 调用方必须自己循环翻页，不能假设一页装得下整个命名空间。
//!
//! ## 内置实现
//!
//! - [`InMemoryStore`]：进程内存，适合测试
//! - [`FileStore`]：JSON 文件持久化
//!
//! ## 快速上手
//!
//! ```rust,no_run
//! use echo_vfs::memory::store::{FileStore, Store};
//! use std::sync::Arc;
//!
//! # async fn example() -> echo_vfs::error::Result<()> {
//! let store = Arc::new(FileStore::new("~/.echo-vfs/store.json")?);
//!
//! store.put(&["alice", "filesystem"], "/notes.md", serde_json::json!({
//!     "content": ["深色主题"],
//!     "created_at": "2024-01-01T00:00:00Z",
//!     "modified_at": "2024-01-01T00:00:00Z"
//! })).await?;
//!
//! let page = store.search(&["alice", "filesystem"], None, 100, 0).await?;
//! println!("{} 条记录", page.len());
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, StoreError};
use crate::vfs::record::now_rfc3339;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// namespace_key → (key → item)，key 有序以保证分页稳定
type Buckets = HashMap<String, BTreeMap<String, StoreItem>>;

// ── StoreItem ────────────────────────────────────────────────────────────────

/// Store 中的单条记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreItem {
    /// 命名空间（如 `["alice", "filesystem"]`）
    pub namespace: Vec<String>,
    /// 条目唯一键
    pub key: String,
    /// 任意 JSON 值
    pub value: Value,
    /// 创建时间（RFC 3339）
    pub created_at: String,
    /// 最后更新时间（RFC 3339）
    pub updated_at: String,
}

impl StoreItem {
    fn new(namespace: Vec<String>, key: String, value: Value) -> Self {
        let now = now_rfc3339();
        Self {
            namespace,
            key,
            value,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

// ── Store trait ───────────────────────────────────────────────────────────────

/// 命名空间 KV 存储接口
#[async_trait]
pub trait Store: Send + Sync {
    /// 写入或更新一条记录（upsert）
    async fn put(&self, namespace: &[&str], key: &str, value: Value) -> Result<()>;

    /// 按 key 精确获取
    async fn get(&self, namespace: &[&str], key: &str) -> Result<Option<StoreItem>>;

    /// 按 key 顺序返回 `[offset, offset + limit)` 的一页
    ///
    /// `filter` 中每个字段都须与 value 的同名顶层字段相等。
    async fn search(
        &self,
        namespace: &[&str],
        filter: Option<&Map<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoreItem>>;

    /// 删除指定 key，返回是否存在并删除
    async fn delete(&self, namespace: &[&str], key: &str) -> Result<bool>;

    /// 列举以 `prefix` 开头的所有命名空间
    async fn list_namespaces(&self, prefix: Option<&[&str]>) -> Result<Vec<Vec<String>>>;
}

// ── InMemoryStore ─────────────────────────────────────────────────────────────

/// 进程内存 Store，不持久化，适合测试和短生命周期使用
#[derive(Default)]
pub struct InMemoryStore {
    data: RwLock<Buckets>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(&self, namespace: &[&str], key: &str, value: Value) -> Result<()> {
        let ns_key = namespace_key(namespace)?;
        let mut data = self.data.write().await;
        upsert(&mut data, ns_key, namespace, key, value);
        Ok(())
    }

    async fn get(&self, namespace: &[&str], key: &str) -> Result<Option<StoreItem>> {
        let ns_key = namespace_key(namespace)?;
        let data = self.data.read().await;
        Ok(data.get(&ns_key).and_then(|b| b.get(key)).cloned())
    }

    async fn search(
        &self,
        namespace: &[&str],
        filter: Option<&Map<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoreItem>> {
        let ns_key = namespace_key(namespace)?;
        let data = self.data.read().await;
        Ok(page(data.get(&ns_key), filter, limit, offset))
    }

    async fn delete(&self, namespace: &[&str], key: &str) -> Result<bool> {
        let ns_key = namespace_key(namespace)?;
        let mut data = self.data.write().await;
        Ok(data
            .get_mut(&ns_key)
            .map(|b| b.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list_namespaces(&self, prefix: Option<&[&str]>) -> Result<Vec<Vec<String>>> {
        let data = self.data.read().await;
        Ok(namespaces(&data, prefix))
    }
}

// ── FileStore ─────────────────────────────────────────────────────────────────

/// 基于 JSON 文件的持久化 Store
///
/// 存储格式（命名空间键是段列表的 JSON 编码，`["a/b"]` 与 `["a","b"]` 不会混淆）：
/// ```json
/// {
///   "[\"alice\",\"filesystem\"]": {
///     "/notes.md": { "namespace": [...], "key": "/notes.md", "value": {...}, "created_at": "...", "updated_at": "..." }
///   }
/// }
/// ```
pub struct FileStore {
    path: PathBuf,
    data: RwLock<Buckets>,
    /// 串行化落盘，较新的快照总在较旧的之后 rename
    flush_lock: Mutex<()>,
}

impl FileStore {
    /// 打开或创建 Store 文件，自动建父目录
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_tilde(path.as_ref());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::IoError(format!("创建目录失败: {e}")))?;
        }
        let data: Buckets = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::IoError(format!("读取 store 文件失败: {e}")))?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Store 文件解析失败，从空状态开始: {e}");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        let ns_count = data.len();
        let item_count: usize = data.values().map(BTreeMap::len).sum();
        info!(path = %path.display(), namespaces = ns_count, items = item_count, "🗄️ FileStore 初始化");
        Ok(Self {
            path,
            data: RwLock::new(data),
            flush_lock: Mutex::new(()),
        })
    }

    /// 先写临时文件再 rename，进程中断不会留下半截 JSON
    async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let data = self.data.read().await;
        let json = serde_json::to_string_pretty(&*data)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::IoError(format!("写入 store 文件失败: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::IoError(format!("替换 store 文件失败: {e}")))?;
        debug!(path = %self.path.display(), "💾 Store 已持久化");
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn put(&self, namespace: &[&str], key: &str, value: Value) -> Result<()> {
        let ns_key = namespace_key(namespace)?;
        {
            let mut data = self.data.write().await;
            upsert(&mut data, ns_key, namespace, key, value);
        }
        self.flush().await
    }

    async fn get(&self, namespace: &[&str], key: &str) -> Result<Option<StoreItem>> {
        let ns_key = namespace_key(namespace)?;
        let data = self.data.read().await;
        Ok(data.get(&ns_key).and_then(|b| b.get(key)).cloned())
    }

    async fn search(
        &self,
        namespace: &[&str],
        filter: Option<&Map<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoreItem>> {
        let ns_key = namespace_key(namespace)?;
        let data = self.data.read().await;
        let items = page(data.get(&ns_key), filter, limit, offset);
        debug!(namespace = %ns_key, offset, hits = items.len(), "🔍 Store 分页读取");
        Ok(items)
    }

    async fn delete(&self, namespace: &[&str], key: &str) -> Result<bool> {
        let ns_key = namespace_key(namespace)?;
        let found = {
            let mut data = self.data.write().await;
            data.get_mut(&ns_key)
                .map(|b| b.remove(key).is_some())
                .unwrap_or(false)
        };
        if found {
            self.flush().await?;
        }
        Ok(found)
    }

    async fn list_namespaces(&self, prefix: Option<&[&str]>) -> Result<Vec<Vec<String>>> {
        let data = self.data.read().await;
        Ok(namespaces(&data, prefix))
    }
}

// ── 私有工具函数 ──────────────────────────────────────────────────────────────

fn namespace_key(namespace: &[&str]) -> Result<String> {
    Ok(serde_json::to_string(namespace)?)
}

fn upsert(data: &mut Buckets, ns_key: String, namespace: &[&str], key: &str, value: Value) {
    let bucket = data.entry(ns_key).or_default();
    match bucket.get_mut(key) {
        Some(item) => {
            item.value = value;
            item.updated_at = now_rfc3339();
        }
        None => {
            let ns_vec = namespace.iter().map(|s| s.to_string()).collect();
            bucket.insert(key.to_string(), StoreItem::new(ns_vec, key.to_string(), value));
        }
    }
}

fn page(
    bucket: Option<&BTreeMap<String, StoreItem>>,
    filter: Option<&Map<String, Value>>,
    limit: usize,
    offset: usize,
) -> Vec<StoreItem> {
    let Some(bucket) = bucket else {
        return vec![];
    };
    bucket
        .values()
        .filter(|item| filter.is_none_or(|f| matches_filter(&item.value, f)))
        .skip(offset)
        .take(limit)
        .cloned()
        .collect()
}

fn matches_filter(value: &Value, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(field, expected)| value.get(field) == Some(expected))
}

fn namespaces(data: &Buckets, prefix: Option<&[&str]>) -> Vec<Vec<String>> {
    let mut out: Vec<Vec<String>> = data
        .keys()
        .filter_map(|k| serde_json::from_str::<Vec<String>>(k).ok())
        .filter(|ns| {
            prefix.is_none_or(|p| {
                ns.len() >= p.len() && ns.iter().zip(p.iter()).all(|(a, b)| a.as_str() == *b)
            })
        })
        .collect();
    out.sort();
    out
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/")
        && let Some(home) = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())
    {
        return PathBuf::from(home).join(&s[2..]);
    }
    path.to_path_buf()
}
