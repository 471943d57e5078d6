//! 磁盘后端
//!
//! 以一个真实目录为根，支持两种寻址：
//!
//! - **普通模式**：调用方给出真实路径（绝对路径原样使用，相对路径拼到根下），
//!   必须位于根目录之内
//! - **虚拟模式**：`/notes.md` 映射到 `<root>/notes.md`，返回的路径也还原成虚拟形式
//!
//! 任何文件系统调用之前都先做越界检查（读操作同样检查）：
//! 词法规范化 → `starts_with(root)` → 规范化最深的已存在祖先再检查一次，
//! 使符号链接也无法逃出根目录。
//!
//! 写入先落到同目录下的临时文件，再通过硬链接（新建）或 rename（覆盖）原子就位，
//! 读者不会看到写了一半的内容。
//!
//! 每个操作都有同步版本（`*_blocking`）；[`Backend`] 实现把同步版本交给
//! `spawn_blocking`，由信号量限制并发，并受超时与取消令牌约束。

use crate::config::StorageConfig;
use crate::error::{FileError, Result, VfsError};
use crate::vfs::format::OutputLimits;
use crate::vfs::listing::immediate_children;
use crate::vfs::path::{as_dir, normalize_virtual_path};
use crate::vfs::record::{FileRecord, replace_in_content};
use crate::vfs::search::{GlobPattern, compile_regex, glob_entries, grep_lines};
use crate::vfs::{
    Backend, BackendKind, EditResult, FileDownloadResponse, FileInfo, FileUploadResponse,
    GrepMatch, WriteResult,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const DEFAULT_MAX_GREP_FILE_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_IO_CONCURRENCY: usize = 8;
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

// ── 同步核心 ─────────────────────────────────────────────────────────────────

/// 根目录与寻址规则；所有同步 IO 都在这里完成
struct DiskRoot {
    /// 规范化后的根目录（已解析符号链接）
    root: PathBuf,
    /// 调用方给出的根目录，仅做词法规范化；普通模式下两种前缀都接受
    lexical_root: PathBuf,
    virtual_mode: bool,
    max_grep_file_size: u64,
    limits: OutputLimits,
}

impl DiskRoot {
    /// 将调用方路径解析为根目录内的真实路径
    fn resolve(&self, path: &str) -> std::result::Result<PathBuf, FileError> {
        if path.contains('\0') {
            return Err(FileError::invalid_path(path, "path contains a null byte"));
        }

        let candidate = if self.virtual_mode {
            let normalized = normalize_virtual_path(path)?;
            match normalized.trim_start_matches('/') {
                "" => self.root.clone(),
                relative => self.root.join(relative),
            }
        } else {
            let requested = Path::new(path);
            let joined = if requested.is_absolute() {
                requested.to_path_buf()
            } else {
                self.lexical_root.join(requested)
            };
            lexical_normalize(&joined)
                .ok_or_else(|| FileError::invalid_path(path, "path traversal not allowed"))?
        };

        if !candidate.starts_with(&self.root) && !candidate.starts_with(&self.lexical_root) {
            return Err(FileError::invalid_path(path, "path is outside the root directory"));
        }

        // 符号链接可能把根内路径指向根外
        let anchor = deepest_existing(&candidate);
        let canonical = anchor
            .canonicalize()
            .map_err(|e| FileError::from_io(path, &e))?;
        if !canonical.starts_with(&self.root) {
            return Err(FileError::invalid_path(path, "path resolves outside the root directory"));
        }
        Ok(candidate)
    }

    /// 真实路径 → 返回给调用方的路径
    fn display(&self, real: &Path) -> String {
        if !self.virtual_mode {
            return real.to_string_lossy().into_owned();
        }
        let relative = real
            .strip_prefix(&self.root)
            .or_else(|_| real.strip_prefix(&self.lexical_root))
            .unwrap_or(real);
        let segments: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        format!("/{}", segments.join("/"))
    }

    fn io_error(&self, real: &Path, err: std::io::Error) -> VfsError {
        FileError::from_io(&self.display(real), &err).into()
    }

    fn entry_info(&self, real: &Path, meta: &fs::Metadata) -> FileInfo {
        let modified = meta.modified().ok().map(rfc3339);
        if meta.is_dir() {
            let mut info = FileInfo::dir(as_dir(&self.display(real)));
            info.modified_at = modified;
            info
        } else {
            FileInfo::file(self.display(real), meta.len(), modified)
        }
    }

    /// 以文件系统时间戳构造记录
    fn load_record(&self, real: &Path) -> Result<FileRecord> {
        let meta = fs::metadata(real).map_err(|e| self.io_error(real, e))?;
        if meta.is_dir() {
            return Err(FileError::IsDirectory(self.display(real)).into());
        }
        let bytes = fs::read(real).map_err(|e| self.io_error(real, e))?;
        let mut record = FileRecord::from_bytes(&bytes);
        if let Ok(modified) = meta.modified() {
            record.modified_at = rfc3339(modified);
            record.created_at = meta.created().map(rfc3339).unwrap_or_else(|_| rfc3339(modified));
        }
        Ok(record)
    }

    fn read_text(&self, real: &Path) -> Result<String> {
        let meta = fs::metadata(real).map_err(|e| self.io_error(real, e))?;
        if meta.is_dir() {
            return Err(FileError::IsDirectory(self.display(real)).into());
        }
        let bytes = fs::read(real).map_err(|e| self.io_error(real, e))?;
        String::from_utf8(bytes)
            .map_err(|_| FileError::invalid_path(self.display(real), "file is not valid UTF-8").into())
    }

    /// 创建缺失的父目录；父路径上有文件挡路时为 `ParentNotFound`
    fn ensure_parent(&self, real: &Path) -> Result<()> {
        let Some(parent) = real.parent() else {
            return Ok(());
        };
        fs::create_dir_all(parent).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists | ErrorKind::NotADirectory => {
                FileError::ParentNotFound(self.display(real)).into()
            }
            _ => self.io_error(real, e),
        })
    }

    /// 原子新建：目标已存在时失败，不覆盖
    fn atomic_create(&self, real: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = temp_sibling(real);
        write_temp(&tmp, bytes).map_err(|e| self.io_error(real, e))?;
        match fs::hard_link(&tmp, real) {
            Ok(()) => {
                let _ = fs::remove_file(&tmp);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&tmp);
                Err(FileError::AlreadyExists(self.display(real)).into())
            }
            Err(e) => {
                // 不支持硬链接的文件系统退回 rename
                debug!(path = %real.display(), error = %e, "硬链接不可用，改用 rename");
                if fs::symlink_metadata(real).is_ok() {
                    let _ = fs::remove_file(&tmp);
                    return Err(FileError::AlreadyExists(self.display(real)).into());
                }
                fs::rename(&tmp, real).map_err(|e| {
                    let _ = fs::remove_file(&tmp);
                    self.io_error(real, e)
                })
            }
        }
    }

    /// 原子替换：目标存在则整体换掉
    fn atomic_replace(&self, real: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = temp_sibling(real);
        write_temp(&tmp, bytes).map_err(|e| self.io_error(real, e))?;
        fs::rename(&tmp, real).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            self.io_error(real, e)
        })
    }

    fn reject_directory(&self, real: &Path) -> Result<()> {
        if real.is_dir() {
            return Err(FileError::IsDirectory(self.display(real)).into());
        }
        Ok(())
    }

    // ── 操作 ──

    fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>> {
        let real = self.resolve(path)?;
        if !real.is_dir() {
            return Ok(Vec::new());
        }
        let dir = as_dir(&self.display(&real));
        let mut entries = Vec::new();
        for entry in fs::read_dir(&real).map_err(|e| self.io_error(&real, e))? {
            let Ok(entry) = entry else { continue };
            let child = entry.path();
            match fs::metadata(&child) {
                Ok(meta) => entries.push(self.entry_info(&child, &meta)),
                Err(e) => debug!(path = %child.display(), error = %e, "跳过无法读取的条目"),
            }
        }
        Ok(immediate_children(&dir, entries))
    }

    fn read(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
        let real = self.resolve(path)?;
        let record = self.load_record(&real)?;
        Ok(self.limits.render_read(&record, offset, limit))
    }

    fn write(&self, path: &str, content: &str) -> Result<WriteResult> {
        let real = self.resolve(path)?;
        if let Ok(meta) = fs::symlink_metadata(&real) {
            let err = if meta.is_dir() {
                FileError::IsDirectory(self.display(&real))
            } else {
                FileError::AlreadyExists(self.display(&real))
            };
            return Err(err.into());
        }
        self.ensure_parent(&real)?;
        self.atomic_create(&real, content.as_bytes())?;
        debug!(path = %real.display(), bytes = content.len(), "📝 写入磁盘文件");
        Ok(WriteResult {
            path: self.display(&real),
            files_update: None,
        })
    }

    fn overwrite(&self, path: &str, content: &str) -> Result<WriteResult> {
        let real = self.resolve(path)?;
        self.reject_directory(&real)?;
        self.ensure_parent(&real)?;
        self.atomic_replace(&real, content.as_bytes())?;
        Ok(WriteResult {
            path: self.display(&real),
            files_update: None,
        })
    }

    fn edit(
        &self,
        path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult> {
        let real = self.resolve(path)?;
        let shown = self.display(&real);
        let text = self.read_text(&real)?;
        let (updated, occurrences) =
            replace_in_content(&shown, &text, old_string, new_string, replace_all)?;
        self.atomic_replace(&real, updated.as_bytes())?;
        debug!(path = %real.display(), occurrences, "✏️ 编辑磁盘文件");
        Ok(EditResult {
            path: shown,
            occurrences,
            files_update: None,
        })
    }

    fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>> {
        let pattern = GlobPattern::new(pattern)?;
        let base = self.resolve(path)?;
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        let dir = as_dir(&self.display(&base));
        let mut walker = WalkDir::new(&base).min_depth(1);
        if let Some(depth) = pattern.max_depth() {
            walker = walker.max_depth(depth);
        }
        let entries = walker
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                Some(self.entry_info(entry.path(), &meta))
            });
        Ok(glob_entries(&pattern, &dir, entries))
    }

    fn grep_raw(&self, pattern: &str, path: &str, glob: Option<&str>) -> Result<Vec<GrepMatch>> {
        let regex = compile_regex(pattern)?;
        let filter = glob.map(GlobPattern::new).transpose()?;
        let base = self.resolve(path)?;

        if base.is_file() {
            return Ok(self.grep_file(&base, &regex).unwrap_or_default());
        }
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut matches = Vec::new();
        let walker = WalkDir::new(&base).min_depth(1).sort_by_file_name();
        for entry in walker.into_iter().filter_map(|entry| entry.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(filter) = &filter {
                let relative = entry
                    .path()
                    .strip_prefix(&base)
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                if !filter.matches_file(&relative) {
                    continue;
                }
            }
            if let Some(found) = self.grep_file(entry.path(), &regex) {
                matches.extend(found);
            }
        }
        Ok(matches)
    }

    /// 过大或非 UTF-8 的文件返回 None
    fn grep_file(&self, real: &Path, regex: &regex::Regex) -> Option<Vec<GrepMatch>> {
        let size = fs::metadata(real).ok()?.len();
        if size > self.max_grep_file_size {
            debug!(path = %real.display(), size, "跳过过大的文件");
            return None;
        }
        let text = String::from_utf8(fs::read(real).ok()?).ok()?;
        Some(grep_lines(&self.display(real), text.split('\n'), regex))
    }

    fn upload_one(&self, path: &str, bytes: &[u8]) -> Result<String> {
        let real = self.resolve(path)?;
        self.reject_directory(&real)?;
        self.ensure_parent(&real)?;
        self.atomic_replace(&real, bytes)?;
        Ok(self.display(&real))
    }

    fn download_one(&self, path: &str) -> Result<Vec<u8>> {
        let real = self.resolve(path)?;
        self.reject_directory(&real)?;
        fs::read(&real).map_err(|e| self.io_error(&real, e))
    }

    fn upload_files(&self, files: Vec<(String, Vec<u8>)>) -> Vec<FileUploadResponse> {
        files
            .into_iter()
            .map(|(path, bytes)| match self.upload_one(&path, &bytes) {
                Ok(shown) => FileUploadResponse::ok(shown, None),
                Err(e) => {
                    let err = e.to_item_error(&path);
                    warn!(path = %path, kind = err.kind(), "⚠️ 上传失败");
                    FileUploadResponse::failed(path, err)
                }
            })
            .collect()
    }

    fn download_files(&self, paths: &[String]) -> Vec<FileDownloadResponse> {
        paths
            .iter()
            .map(|path| match self.download_one(path) {
                Ok(bytes) => FileDownloadResponse::ok(path.clone(), bytes),
                Err(e) => FileDownloadResponse::failed(path.clone(), e.to_item_error(path)),
            })
            .collect()
    }
}

/// 不访问文件系统的规范化；`..` 越过文件系统根时返回 None
fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut components: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                _ => return None,
            },
            Component::CurDir => {}
            c => components.push(c),
        }
    }
    Some(components.iter().collect())
}

fn deepest_existing(path: &Path) -> &Path {
    let mut current = path;
    while fs::symlink_metadata(current).is_err() {
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_name = format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple());
    target.with_file_name(tmp_name)
}

fn write_temp(tmp: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let written = File::create_new(tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if written.is_err() {
        let _ = fs::remove_file(tmp);
    }
    written
}

fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── DiskBackend ──────────────────────────────────────────────────────────────

/// 真实目录树上的后端
#[derive(Clone)]
pub struct DiskBackend {
    inner: Arc<DiskRoot>,
    /// 阻塞 IO 并发限流
    io_permits: Arc<Semaphore>,
    /// 单次操作超时；`None` = 不限
    io_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl DiskBackend {
    /// 以 `root` 为根创建后端，目录不存在时自动创建
    pub fn new(root: impl AsRef<Path>, virtual_mode: bool) -> Result<Self> {
        Self::build(
            root.as_ref(),
            virtual_mode,
            DEFAULT_MAX_GREP_FILE_SIZE,
            OutputLimits::default(),
        )
    }

    /// 按 `disk` 配置段创建；未配置根目录时使用当前工作目录
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let root = match &config.disk.root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        let backend = Self::build(
            &root,
            config.disk.virtual_mode,
            config.disk.max_grep_file_size_mb * 1024 * 1024,
            OutputLimits::from_config(config),
        )?;
        let timeout = match config.disk.io_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Ok(backend
            .with_io_concurrency(config.disk.io_concurrency)
            .with_io_timeout(timeout))
    }

    fn build(
        given: &Path,
        virtual_mode: bool,
        max_grep_file_size: u64,
        limits: OutputLimits,
    ) -> Result<Self> {
        let absolute = if given.is_absolute() {
            given.to_path_buf()
        } else {
            std::env::current_dir()?.join(given)
        };
        let lexical_root = lexical_normalize(&absolute).ok_or_else(|| {
            FileError::invalid_path(given.to_string_lossy(), "root escapes the filesystem root")
        })?;
        fs::create_dir_all(&lexical_root)?;
        let canonical = lexical_root.canonicalize()?;

        info!(
            root = %canonical.display(),
            virtual_mode,
            "💾 DiskBackend 初始化"
        );
        Ok(Self {
            inner: Arc::new(DiskRoot {
                root: canonical,
                lexical_root,
                virtual_mode,
                max_grep_file_size,
                limits,
            }),
            io_permits: Arc::new(Semaphore::new(DEFAULT_IO_CONCURRENCY)),
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_io_concurrency(mut self, permits: usize) -> Self {
        self.io_permits = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn is_virtual(&self) -> bool {
        self.inner.virtual_mode
    }

    /// 与本后端共享的取消令牌，可由外部触发
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 取消所有在途操作，此后的调用返回 `Cancelled`
    pub fn shutdown(&self) {
        info!(root = %self.inner.root.display(), "🛑 DiskBackend 关闭");
        self.cancel.cancel();
    }

    // ── 同步入口 ──

    pub fn ls_info_blocking(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.inner.ls_info(path)
    }

    pub fn read_blocking(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
        self.inner.read(path, offset, limit)
    }

    pub fn write_blocking(&self, path: &str, content: &str) -> Result<WriteResult> {
        self.inner.write(path, content)
    }

    pub fn overwrite_blocking(&self, path: &str, content: &str) -> Result<WriteResult> {
        self.inner.overwrite(path, content)
    }

    pub fn edit_blocking(
        &self,
        path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult> {
        self.inner.edit(path, old_string, new_string, replace_all)
    }

    pub fn glob_info_blocking(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>> {
        self.inner.glob_info(pattern, path)
    }

    pub fn grep_raw_blocking(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
    ) -> Result<Vec<GrepMatch>> {
        self.inner.grep_raw(pattern, path, glob)
    }

    pub fn upload_files_blocking(&self, files: Vec<(String, Vec<u8>)>) -> Vec<FileUploadResponse> {
        self.inner.upload_files(files)
    }

    pub fn download_files_blocking(&self, paths: &[String]) -> Vec<FileDownloadResponse> {
        self.inner.download_files(paths)
    }

    /// 把同步操作交给阻塞线程池
    ///
    /// 超时从排队等待许可时开始计算。取消或超时后，已经开始的阻塞任务仍会跑完；
    /// 写入经临时文件原子就位，因此不会留下半截内容。
    async fn offload<T, F>(&self, op: &'static str, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DiskRoot) -> Result<T> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(VfsError::Cancelled);
        }

        let inner = self.inner.clone();
        let permits = self.io_permits.clone();
        let run = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| VfsError::Cancelled)?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                task(&inner)
            })
            .await
            .map_err(|e| VfsError::Other(format!("disk task '{}' failed: {}", op, e)))?
        };
        let bounded = async {
            match self.io_timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                    warn!(op, timeout_ms = limit.as_millis() as u64, "⏱️ 磁盘操作超时");
                    VfsError::Timeout(op.to_string())
                })?,
                None => run.await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!(op, "🛑 磁盘操作被取消");
                Err(VfsError::Cancelled)
            }
            result = bounded => result,
        }
    }
}

#[async_trait]
impl Backend for DiskBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }

    fn output_limits(&self) -> OutputLimits {
        self.inner.limits
    }

    async fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>> {
        let path = path.to_string();
        self.offload("ls", move |root| root.ls_info(&path)).await
    }

    async fn read(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
        let path = path.to_string();
        self.offload("read", move |root| root.read(&path, offset, limit))
            .await
    }

    async fn write(&self, path: &str, content: &str) -> Result<WriteResult> {
        let (path, content) = (path.to_string(), content.to_string());
        self.offload("write", move |root| root.write(&path, &content))
            .await
    }

    async fn overwrite(&self, path: &str, content: &str) -> Result<WriteResult> {
        let (path, content) = (path.to_string(), content.to_string());
        self.offload("overwrite", move |root| root.overwrite(&path, &content))
            .await
    }

    async fn edit(
        &self,
        path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult> {
        let path = path.to_string();
        let (old_string, new_string) = (old_string.to_string(), new_string.to_string());
        self.offload("edit", move |root| {
            root.edit(&path, &old_string, &new_string, replace_all)
        })
        .await
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>> {
        let (pattern, path) = (pattern.to_string(), path.to_string());
        self.offload("glob", move |root| root.glob_info(&pattern, &path))
            .await
    }

    async fn grep_raw(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
    ) -> Result<Vec<GrepMatch>> {
        let (pattern, path) = (pattern.to_string(), path.to_string());
        let glob = glob.map(str::to_string);
        self.offload("grep", move |root| {
            root.grep_raw(&pattern, &path, glob.as_deref())
        })
        .await
    }

    /// 整批超时或被取消时每一项都报告失败，但后台任务可能已经写入了其中一部分；
    /// 调用方需要时应通过 `download_files` 或 `ls` 核对实际落盘情况
    async fn upload_files(&self, files: Vec<(String, Vec<u8>)>) -> Vec<FileUploadResponse> {
        let paths: Vec<String> = files.iter().map(|(path, _)| path.clone()).collect();
        match self
            .offload("upload_files", move |root| Ok(root.upload_files(files)))
            .await
        {
            Ok(results) => results,
            Err(e) => paths
                .into_iter()
                .map(|path| {
                    let err = e.to_item_error(&path);
                    FileUploadResponse::failed(path, err)
                })
                .collect(),
        }
    }

    async fn download_files(&self, paths: &[String]) -> Vec<FileDownloadResponse> {
        let owned = paths.to_vec();
        match self
            .offload("download_files", move |root| Ok(root.download_files(&owned)))
            .await
        {
            Ok(results) => results,
            Err(e) => paths
                .iter()
                .map(|path| FileDownloadResponse::failed(path.clone(), e.to_item_error(path)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace(virtual_mode: bool) -> (TempDir, DiskBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path().join("ws"), virtual_mode).unwrap();
        (dir, backend)
    }

    fn file_err(err: VfsError) -> FileError {
        match err {
            VfsError::File(e) => e,
            other => panic!("expected file error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_path_escape_rejected_in_both_modes() {
        for virtual_mode in [true, false] {
            let (_dir, be) = workspace(virtual_mode);
            let err = file_err(be.read("/../etc/passwd", 0, None).await.unwrap_err());
            assert_eq!(err.kind(), "invalid_path", "virtual_mode = {virtual_mode}");
        }

        let (_dir, be) = workspace(false);
        let err = file_err(be.read("../outside.txt", 0, None).await.unwrap_err());
        assert_eq!(err.kind(), "invalid_path");
        let err = file_err(be.read("/etc/passwd", 0, None).await.unwrap_err());
        assert_eq!(err.kind(), "invalid_path");
    }

    #[tokio::test]
    async fn test_listing_depth() {
        let (_dir, be) = workspace(true);
        be.write("/a.txt", "a").await.unwrap();
        be.write("/dir/b.txt", "b").await.unwrap();
        be.write("/dir/sub/c.txt", "c").await.unwrap();

        let root: Vec<String> = be.ls_info("/").await.unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(root, vec!["/a.txt", "/dir/"]);
        let nested: Vec<String> = be
            .ls_info("/dir/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(nested, vec!["/dir/b.txt", "/dir/sub/"]);
        assert!(be.ls_info("/missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_once_and_no_temp_leftovers() {
        let (dir, be) = workspace(true);
        be.write("/note.md", "first").await.unwrap();
        let err = file_err(be.write("/note.md", "second").await.unwrap_err());
        assert_eq!(err, FileError::AlreadyExists("/note.md".into()));
        assert!(be.read("/note.md", 0, None).await.unwrap().contains("first"));

        let names: Vec<_> = fs::read_dir(dir.path().join("ws"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("note.md")]);
    }

    #[tokio::test]
    async fn test_edit_overwrite_and_directory_errors() {
        let (_dir, be) = workspace(true);
        be.write("/code.rs", "let a = 1;\nlet a = 1;\n").await.unwrap();

        let err = file_err(be.edit("/code.rs", "let a", "let b", false).await.unwrap_err());
        assert!(matches!(err, FileError::AmbiguousMatch { occurrences: 2, .. }));
        let edit = be.edit("/code.rs", "let a", "let b", true).await.unwrap();
        assert_eq!(edit.occurrences, 2);

        be.overwrite("/code.rs", "fn main() {}").await.unwrap();
        assert!(be.read("/code.rs", 0, None).await.unwrap().contains("fn main"));

        be.write("/dir/x.txt", "x").await.unwrap();
        let err = file_err(be.read("/dir", 0, None).await.unwrap_err());
        assert_eq!(err.kind(), "is_directory");
        let err = file_err(be.write("/dir", "x").await.unwrap_err());
        assert_eq!(err.kind(), "is_directory");
        let err = file_err(be.write("/dir/x.txt/y.txt", "y").await.unwrap_err());
        assert_eq!(err.kind(), "parent_not_found");
        let err = file_err(be.read("/nope.txt", 0, None).await.unwrap_err());
        assert_eq!(err, FileError::NotFound("/nope.txt".into()));
    }

    #[tokio::test]
    async fn test_glob_and_grep() {
        let (_dir, be) = workspace(true);
        be.write("/src/main.rs", "fn main() {\n    todo!()\n}").await.unwrap();
        be.write("/src/lib.rs", "pub fn lib() {}").await.unwrap();
        be.write("/README.md", "fn in docs").await.unwrap();

        let top: Vec<String> = be.glob("*.rs", "/").await.unwrap();
        assert!(top.is_empty());
        let all = be.glob("**/*.{rs,md}", "/").await.unwrap();
        assert_eq!(all, vec!["/README.md", "/src/lib.rs", "/src/main.rs"]);

        let hits = be.grep_raw("fn ", "/", Some("*.rs")).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|m| m.path.ends_with(".rs")));

        let single = be.grep_raw("todo", "/src/main.rs", None).await.unwrap();
        assert_eq!(single[0].line, 2);

        let err = file_err(be.grep_raw("(", "/", None).await.unwrap_err());
        assert_eq!(err.kind(), "invalid_pattern");
    }

    #[tokio::test]
    async fn test_batch_partial_success_and_binary_roundtrip() {
        let (dir, be) = workspace(true);
        let results = be
            .upload_files(vec![
                ("/ok.txt".into(), b"x".to_vec()),
                ("/../bad.txt".into(), b"y".to_vec()),
            ])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].error.is_none());
        assert_eq!(results[1].error.as_ref().map(FileError::kind), Some("invalid_path"));
        assert!(dir.path().join("ws/ok.txt").exists());
        assert!(!dir.path().join("bad.txt").exists());

        let payload: Vec<u8> = (0..=255u8).collect();
        let uploaded = be.upload_files(vec![("/bin/all.dat".into(), payload.clone())]).await;
        let downloads = be.download_files(&[uploaded[0].path.clone()]).await;
        assert_eq!(downloads[0].content.as_deref(), Some(payload.as_slice()));
    }

    #[tokio::test]
    async fn test_normal_mode_uses_real_paths() {
        let (dir, be) = workspace(false);
        let target = be.root().join("notes.md");
        let target_str = target.to_string_lossy().to_string();
        let written = be.write(&target_str, "hello").await.unwrap();
        assert_eq!(written.path, target_str);

        let relative = be.read("notes.md", 0, None).await.unwrap();
        assert!(relative.contains("hello"));
        assert!(dir.path().join("ws/notes.md").exists());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_operations() {
        let (_dir, be) = workspace(true);
        let token = be.cancellation_token();
        be.shutdown();
        assert!(token.is_cancelled());
        let err = be.read("/a.txt", 0, None).await.unwrap_err();
        assert!(matches!(err, VfsError::Cancelled));

        let results = be.upload_files(vec![("/a.txt".into(), b"a".to_vec())]).await;
        assert_eq!(results[0].error.as_ref().map(FileError::kind), Some("invalid_path"));
    }

    #[tokio::test]
    async fn test_slow_task_times_out() {
        let (_dir, be) = workspace(true);
        let be = be.with_io_timeout(Some(Duration::from_millis(20)));
        let err = be
            .offload("sleep", |_| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::Timeout(ref op) if op == "sleep"));
    }

    #[tokio::test]
    async fn test_queued_call_times_out_and_batch_reports_per_item() {
        let (_dir, be) = workspace(true);
        let be = be
            .with_io_concurrency(1)
            .with_io_timeout(Some(Duration::from_millis(50)));

        // 占住唯一的许可
        let busy = be.clone().with_io_timeout(None);
        let holder = tokio::spawn(async move {
            busy.offload("hold", |_| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = be.ls_info("/").await.unwrap_err();
        assert!(matches!(err, VfsError::Timeout(ref op) if op == "ls"));

        let results = be.upload_files(vec![("/late.txt".into(), b"x".to_vec())]).await;
        let err = results[0].error.as_ref().unwrap();
        assert_eq!(err.kind(), "invalid_path");
        assert!(err.to_string().contains("timed out"));

        holder.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_cannot_escape_root() {
        let (dir, be) = workspace(true);
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(&outside, dir.path().join("ws/link")).unwrap();

        let err = file_err(be.read("/link/secret.txt", 0, None).await.unwrap_err());
        assert_eq!(err.kind(), "invalid_path");
        let err = file_err(be.write("/link/new.txt", "x").await.unwrap_err());
        assert_eq!(err.kind(), "invalid_path");
        assert!(!outside.join("new.txt").exists());
    }

    #[test]
    fn test_blocking_twins() {
        let dir = tempfile::tempdir().unwrap();
        let be = DiskBackend::new(dir.path(), true).unwrap();
        be.write_blocking("/a.txt", "one\ntwo").unwrap();
        assert!(be.read_blocking("/a.txt", 1, Some(1)).unwrap().contains("two"));
        assert_eq!(be.ls_info_blocking("/").unwrap().len(), 1);
        assert_eq!(be.glob_info_blocking("*.txt", "/").unwrap().len(), 1);
        assert_eq!(be.grep_raw_blocking("one", "/", None).unwrap().len(), 1);
    }

    #[test]
    fn test_lexical_normalize() {
        assert_eq!(
            lexical_normalize(Path::new("/a/./b/../c")),
            Some(PathBuf::from("/a/c"))
        );
        assert_eq!(lexical_normalize(Path::new("/../etc")), None);
    }
}
