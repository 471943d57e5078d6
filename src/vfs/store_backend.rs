//! 持久化 KV 后端
//!
//! 每个文件是 [`Store`] 中的一条记录：key 为虚拟路径，value 为序列化的
//! [`FileRecord`]。命名空间为 `(<assistant_id>, "filesystem")`，未给出所属实体时为
//! `("filesystem",)`，不同实体即使请求同一路径也互不可见。
//!
//! Store 只提供分页枚举，`ls` / `glob` / `grep` 都以固定页大小循环翻页，
//! 直到遇到空页或不满一页为止。

use crate::config::StorageConfig;
use crate::error::{FileError, Result, StoreError};
use crate::memory::store::Store;
use crate::vfs::listing::{has_descendants, immediate_children};
use crate::vfs::path::{ancestors, as_dir, directory_prefix, normalize_virtual_path};
use crate::vfs::record::{FileEncoding, FileRecord, replace_in_content};
use crate::vfs::search::{GlobPattern, compile_regex, glob_entries, grep_lines};
use crate::vfs::{
    Backend, BackendKind, EditResult, FileDownloadResponse, FileInfo, FileUploadResponse,
    GrepMatch, OutputLimits, WriteResult,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const FILESYSTEM_NAMESPACE: &str = "filesystem";
const DEFAULT_PAGE_SIZE: usize = 100;

pub struct StoreBackend {
    store: Arc<dyn Store>,
    namespace: Vec<String>,
    page_size: usize,
    limits: OutputLimits,
}

impl StoreBackend {
    pub fn new(store: Arc<dyn Store>, assistant_id: Option<&str>) -> Self {
        let namespace = match assistant_id {
            Some(id) => vec![id.to_string(), FILESYSTEM_NAMESPACE.to_string()],
            None => vec![FILESYSTEM_NAMESPACE.to_string()],
        };
        info!(namespace = ?namespace, "🗂️ StoreBackend 初始化");
        Self {
            store,
            namespace,
            page_size: DEFAULT_PAGE_SIZE,
            limits: OutputLimits::default(),
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &StorageConfig) -> Self {
        Self::new(store, config.store.assistant_id.as_deref())
            .with_page_size(config.store.page_size)
            .with_limits(OutputLimits::from_config(config))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_limits(mut self, limits: OutputLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn namespace(&self) -> &[String] {
        &self.namespace
    }

    fn ns(&self) -> Vec<&str> {
        self.namespace.iter().map(String::as_str).collect()
    }

    fn decode(key: &str, value: Value) -> Result<FileRecord> {
        serde_json::from_value(value).map_err(|e| {
            StoreError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    async fn get_record(&self, path: &str) -> Result<Option<FileRecord>> {
        match self.store.get(&self.ns(), path).await? {
            Some(item) => Ok(Some(Self::decode(path, item.value)?)),
            None => Ok(None),
        }
    }

    async fn put_record(&self, path: &str, record: &FileRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.store.put(&self.ns(), path, value).await
    }

    /// 分页拉取整个命名空间；无法解析的记录跳过并告警
    async fn scan(&self) -> Result<Vec<(String, FileRecord)>> {
        let ns = self.ns();
        let mut records = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.store.search(&ns, None, self.page_size, offset).await?;
            let fetched = page.len();
            for item in page {
                match Self::decode(&item.key, item.value) {
                    Ok(record) => records.push((item.key, record)),
                    Err(e) => warn!(key = %item.key, error = %e, "⚠️ 跳过无法解析的记录"),
                }
            }
            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }
        debug!(namespace = ?self.namespace, records = records.len(), "📚 分页扫描完成");
        Ok(records)
    }

    async fn is_synthetic_dir(&self, normalized: &str) -> Result<bool> {
        let dir = as_dir(normalized);
        let records = self.scan().await?;
        Ok(has_descendants(&dir, records.iter().map(|(p, _)| p.as_str())))
    }

    async fn require_record(&self, normalized: &str) -> Result<FileRecord> {
        match self.get_record(normalized).await? {
            Some(record) => Ok(record),
            None if normalized == "/" || self.is_synthetic_dir(normalized).await? => {
                Err(FileError::IsDirectory(normalized.to_string()).into())
            }
            None => Err(FileError::NotFound(normalized.to_string()).into()),
        }
    }

    /// 目标不能是（合成的）目录，祖先路径不能是已有文件
    async fn check_parents(&self, normalized: &str) -> Result<()> {
        if normalized == "/" || self.is_synthetic_dir(normalized).await? {
            return Err(FileError::IsDirectory(normalized.to_string()).into());
        }
        for ancestor in ancestors(normalized) {
            if self.store.get(&self.ns(), ancestor).await?.is_some() {
                return Err(FileError::ParentNotFound(normalized.to_string()).into());
            }
        }
        Ok(())
    }

    async fn upload_one(&self, path: &str, bytes: &[u8]) -> Result<String> {
        let normalized = normalize_virtual_path(path)?;
        let mut record = FileRecord::from_bytes(bytes);
        match self.get_record(&normalized).await? {
            Some(existing) => record.created_at = existing.created_at,
            None => self.check_parents(&normalized).await?,
        }
        self.put_record(&normalized, &record).await?;
        Ok(normalized)
    }

    async fn download_one(&self, path: &str) -> Result<Vec<u8>> {
        let normalized = normalize_virtual_path(path)?;
        Ok(self.require_record(&normalized).await?.to_bytes())
    }
}

#[async_trait]
impl Backend for StoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    fn output_limits(&self) -> OutputLimits {
        self.limits
    }

    async fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>> {
        let dir = directory_prefix(path)?;
        let records = self.scan().await?;
        let entries = records
            .iter()
            .map(|(p, record)| FileInfo::from_record(p, record));
        Ok(immediate_children(&dir, entries))
    }

    async fn read(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
        let normalized = normalize_virtual_path(path)?;
        let record = self.require_record(&normalized).await?;
        Ok(self.limits.render_read(&record, offset, limit))
    }

    async fn write(&self, path: &str, content: &str) -> Result<WriteResult> {
        let normalized = normalize_virtual_path(path)?;
        if self.get_record(&normalized).await?.is_some() {
            return Err(FileError::AlreadyExists(normalized).into());
        }
        self.check_parents(&normalized).await?;
        self.put_record(&normalized, &FileRecord::new(content)).await?;
        debug!(path = %normalized, bytes = content.len(), "📝 写入持久文件");
        Ok(WriteResult {
            path: normalized,
            files_update: None,
        })
    }

    async fn overwrite(&self, path: &str, content: &str) -> Result<WriteResult> {
        let normalized = normalize_virtual_path(path)?;
        let record = match self.get_record(&normalized).await? {
            Some(existing) => existing.updated(content),
            None => {
                self.check_parents(&normalized).await?;
                FileRecord::new(content)
            }
        };
        self.put_record(&normalized, &record).await?;
        Ok(WriteResult {
            path: normalized,
            files_update: None,
        })
    }

    async fn edit(
        &self,
        path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult> {
        let normalized = normalize_virtual_path(path)?;
        let record = self.require_record(&normalized).await?;
        let (text, occurrences) =
            replace_in_content(&normalized, &record.text(), old_string, new_string, replace_all)?;
        self.put_record(&normalized, &record.updated(&text)).await?;
        debug!(path = %normalized, occurrences, "✏️ 编辑持久文件");
        Ok(EditResult {
            path: normalized,
            occurrences,
            files_update: None,
        })
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>> {
        let pattern = GlobPattern::new(pattern)?;
        let dir = directory_prefix(path)?;
        let records = self.scan().await?;
        let entries = records
            .iter()
            .map(|(p, record)| FileInfo::from_record(p, record));
        Ok(glob_entries(&pattern, &dir, entries))
    }

    async fn grep_raw(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
    ) -> Result<Vec<GrepMatch>> {
        let regex = compile_regex(pattern)?;
        let filter = glob.map(GlobPattern::new).transpose()?;
        let normalized = normalize_virtual_path(path)?;

        if let Some(record) = self.get_record(&normalized).await? {
            return Ok(grep_lines(
                &normalized,
                record.content.iter().map(String::as_str),
                &regex,
            ));
        }

        let dir = as_dir(&normalized);
        let mut matches = Vec::new();
        for (file_path, record) in self.scan().await? {
            let Some(relative) = file_path.strip_prefix(dir.as_str()) else {
                continue;
            };
            if filter.as_ref().is_some_and(|f| !f.matches_file(relative)) {
                continue;
            }
            if record.encoding != FileEncoding::Utf8 {
                continue;
            }
            matches.extend(grep_lines(
                &file_path,
                record.content.iter().map(String::as_str),
                &regex,
            ));
        }
        Ok(matches)
    }

    async fn upload_files(&self, files: Vec<(String, Vec<u8>)>) -> Vec<FileUploadResponse> {
        let mut results = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            let response = match self.upload_one(&path, &bytes).await {
                Ok(normalized) => FileUploadResponse::ok(normalized, None),
                Err(e) => {
                    let err = e.to_item_error(&path);
                    warn!(path = %path, kind = err.kind(), "⚠️ 上传失败");
                    FileUploadResponse::failed(path, err)
                }
            };
            results.push(response);
        }
        results
    }

    async fn download_files(&self, paths: &[String]) -> Vec<FileDownloadResponse> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let response = match self.download_one(path).await {
                Ok(bytes) => FileDownloadResponse::ok(path.clone(), bytes),
                Err(e) => FileDownloadResponse::failed(path.clone(), e.to_item_error(path)),
            };
            results.push(response);
        }
        results
    }
}
