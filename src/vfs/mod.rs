//! 虚拟文件存储层
//!
//! Agent 的工具层只面对 [`Backend`] 这一套操作，不关心路径背后是哪种介质：
//!
//! | 后端 | 介质 | 生命周期 |
//! |------|------|----------|
//! | [`EphemeralBackend`] | 会话内存状态 | 随会话丢弃 |
//! | [`StoreBackend`] | 命名空间 KV Store（分页扫描） | 跨会话持久 |
//! | [`DiskBackend`] | 真实目录树（可虚拟根） | 与磁盘一致 |
//! | [`CompositeBackend`] | 按最长前缀路由到以上后端 | 不持有数据 |
//!
//! 所有后端都没有“目录”实体，目录由 [`listing`] 从路径前缀推导。
//!
//! ## 快速上手
//!
//! ```rust,no_run
//! use echo_vfs::memory::InMemoryStore;
//! use echo_vfs::vfs::{Backend, CompositeBackend, DiskBackend, StoreBackend};
//! use std::sync::Arc;
//!
//! # async fn example() -> echo_vfs::error::Result<()> {
//! let disk = Arc::new(DiskBackend::new("/tmp/workspace", true)?);
//! let memories = Arc::new(StoreBackend::new(Arc::new(InMemoryStore::new()), Some("alice")));
//! let fs = CompositeBackend::new(disk).route("/memories/", memories)?;
//!
//! fs.write("/memories/prefs.md", "深色主题").await?;
//! println!("{:?}", fs.ls("/").await?);
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod composite;
pub mod disk;
pub mod ephemeral;
pub mod format;
pub mod listing;
pub mod path;
pub mod record;
pub mod search;
pub mod store_backend;

pub use blocking::BlockingBackend;
pub use composite::CompositeBackend;
pub use disk::DiskBackend;
pub use ephemeral::EphemeralBackend;
pub use format::OutputLimits;
pub use record::{FileEncoding, FileRecord, FileState, FilesUpdate};
pub use store_backend::StoreBackend;

use crate::error::{FileError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ── 协议类型 ──────────────────────────────────────────────────────────────────

/// `ls` / `glob` 的条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// 完整路径，目录以 `/` 结尾
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_at: Option<String>,
}

impl FileInfo {
    pub fn file(path: impl Into<String>, size: u64, modified_at: Option<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            size,
            modified_at,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
            size: 0,
            modified_at: None,
        }
    }

    pub(crate) fn from_record(path: &str, record: &FileRecord) -> Self {
        Self::file(path, record.size(), Some(record.modified_at.clone()))
    }
}

/// `write` / `overwrite` 的结果
///
/// 会话内存后端不直接落盘，而是返回 `files_update` 交给调用方合并。
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub path: String,
    pub files_update: Option<FilesUpdate>,
}

/// `edit` 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct EditResult {
    pub path: String,
    /// 实际替换次数
    pub occurrences: usize,
    pub files_update: Option<FilesUpdate>,
}

/// 一处 grep 命中
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    /// 1-based 行号
    pub line: usize,
    pub text: String,
}

/// grep 输出模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrepOutputMode {
    /// 仅列出包含匹配的路径
    #[default]
    FilesWithMatches,
    /// 路径 + 行号 + 命中行
    Content,
    /// 路径 + 命中次数
    Count,
}

/// 批量上传中单项的结果，与输入位置一一对应
#[derive(Debug, Clone, PartialEq)]
pub struct FileUploadResponse {
    pub path: String,
    pub error: Option<FileError>,
    pub files_update: Option<FilesUpdate>,
}

impl FileUploadResponse {
    pub(crate) fn ok(path: impl Into<String>, files_update: Option<FilesUpdate>) -> Self {
        Self {
            path: path.into(),
            error: None,
            files_update,
        }
    }

    pub(crate) fn failed(path: impl Into<String>, error: FileError) -> Self {
        Self {
            path: path.into(),
            error: Some(error),
            files_update: None,
        }
    }
}

/// 批量下载中单项的结果
#[derive(Debug, Clone, PartialEq)]
pub struct FileDownloadResponse {
    pub path: String,
    pub content: Option<Vec<u8>>,
    pub error: Option<FileError>,
}

impl FileDownloadResponse {
    pub(crate) fn ok(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content: Some(content),
            error: None,
        }
    }

    pub(crate) fn failed(path: impl Into<String>, error: FileError) -> Self {
        Self {
            path: path.into(),
            content: None,
            error: Some(error),
        }
    }
}

/// 后端种类（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ephemeral,
    Durable,
    Disk,
    Composite,
}

// ── Backend trait ────────────────────────────────────────────────────────────

/// 所有存储后端共享的操作契约
///
/// `ls_info` / `glob_info` / `grep_raw` 返回未截断的结构化结果；
/// `ls` / `glob` / `grep` 是在其上套用 token 预算的版本，供工具层直接使用。
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn output_limits(&self) -> OutputLimits {
        OutputLimits::default()
    }

    /// 列出直接子项；不存在的目录返回空
    async fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// 读取 `[offset, offset + limit)` 行（offset 从 0 开始），带行号渲染
    async fn read(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String>;

    /// 新建文件；目标已存在时返回 `AlreadyExists`
    async fn write(&self, path: &str, content: &str) -> Result<WriteResult>;

    /// 新建或整体替换，保留已有记录的 `created_at`
    async fn overwrite(&self, path: &str, content: &str) -> Result<WriteResult>;

    async fn edit(
        &self,
        path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult>;

    async fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>>;

    async fn grep_raw(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
    ) -> Result<Vec<GrepMatch>>;

    async fn upload_files(&self, files: Vec<(String, Vec<u8>)>) -> Vec<FileUploadResponse>;

    async fn download_files(&self, paths: &[String]) -> Vec<FileDownloadResponse>;

    /// 预算内的目录列表，目录带 `/` 后缀
    async fn ls(&self, path: &str) -> Result<Vec<String>> {
        let entries = self.ls_info(path).await?;
        let paths = entries.into_iter().map(|e| e.path).collect();
        Ok(format::truncate_lines(paths, self.output_limits().token_limit))
    }

    /// 预算内的 glob 结果
    async fn glob(&self, pattern: &str, path: &str) -> Result<Vec<String>> {
        let entries = self.glob_info(pattern, path).await?;
        let paths = entries.into_iter().map(|e| e.path).collect();
        Ok(format::truncate_lines(paths, self.output_limits().token_limit))
    }

    /// 预算内的 grep 结果，按 `mode` 渲染
    async fn grep(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
        mode: GrepOutputMode,
    ) -> Result<Vec<String>> {
        let matches = self.grep_raw(pattern, path, glob).await?;
        let lines = search::render_grep(&matches, mode);
        Ok(format::truncate_lines(lines, self.output_limits().token_limit))
    }
}
