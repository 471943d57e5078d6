//! 会话内存后端
//!
//! 持有执行上下文给出的 [`FileState`] 快照，只读不改：写操作生成
//! [`FilesUpdate`] 交还调用方，由其在两个处理步骤之间按顺序合并。
//! 同一会话不会并发写入，因此这里不需要任何锁；所有操作都不会挂起，
//! 除 trait 实现外另提供同名的同步方法。
//!
//! ```rust
//! use echo_vfs::vfs::{EphemeralBackend, FileState};
//! use std::sync::Arc;
//!
//! let mut state = Arc::new(FileState::new());
//! let backend = EphemeralBackend::new(state.clone());
//! let result = backend.write_now("/notes.md", "hello").unwrap();
//! Arc::make_mut(&mut state).apply(result.files_update.unwrap_or_default());
//! assert!(state.contains("/notes.md"));
//! ```

use crate::error::{FileError, Result};
use crate::vfs::listing::{has_descendants, immediate_children};
use crate::vfs::path::{ancestors, as_dir, directory_prefix, normalize_virtual_path};
use crate::vfs::record::{FileEncoding, FileRecord, FileState, FilesUpdate, replace_in_content};
use crate::vfs::search::{GlobPattern, compile_regex, glob_entries, grep_lines};
use crate::vfs::{
    Backend, BackendKind, EditResult, FileDownloadResponse, FileInfo, FileUploadResponse,
    GrepMatch, OutputLimits, WriteResult,
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct EphemeralBackend {
    state: Arc<FileState>,
    limits: OutputLimits,
}

impl EphemeralBackend {
    pub fn new(state: Arc<FileState>) -> Self {
        Self {
            state,
            limits: OutputLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: OutputLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn state(&self) -> &FileState {
        &self.state
    }

    fn is_synthetic_dir(&self, normalized: &str) -> bool {
        let dir = as_dir(normalized);
        has_descendants(&dir, self.state.iter().map(|(p, _)| p.as_str()))
    }

    /// 新记录的落点检查：不能是目录，祖先也不能是文件
    fn check_target(&self, normalized: &str) -> std::result::Result<(), FileError> {
        self.check_target_among(normalized, &BTreeSet::new())
    }

    /// 同上，并把同一批次里已接受但尚未合并的路径 `pending` 视为已存在
    fn check_target_among(
        &self,
        normalized: &str,
        pending: &BTreeSet<String>,
    ) -> std::result::Result<(), FileError> {
        let dir = as_dir(normalized);
        if normalized == "/"
            || self.is_synthetic_dir(normalized)
            || has_descendants(&dir, pending.iter().map(String::as_str))
        {
            return Err(FileError::IsDirectory(normalized.to_string()));
        }
        if ancestors(normalized).any(|a| self.state.contains(a) || pending.contains(a)) {
            return Err(FileError::ParentNotFound(normalized.to_string()));
        }
        Ok(())
    }

    fn lookup(&self, normalized: &str) -> std::result::Result<&FileRecord, FileError> {
        match self.state.get(normalized) {
            Some(record) => Ok(record),
            None if normalized == "/" || self.is_synthetic_dir(normalized) => {
                Err(FileError::IsDirectory(normalized.to_string()))
            }
            None => Err(FileError::NotFound(normalized.to_string())),
        }
    }

    fn entries(&self) -> impl Iterator<Item = FileInfo> + '_ {
        self.state
            .iter()
            .map(|(path, record)| FileInfo::from_record(path, record))
    }

    // ── 同步操作 ──────────────────────────────────────────────────────────────

    pub fn ls_info_now(&self, path: &str) -> Result<Vec<FileInfo>> {
        let dir = directory_prefix(path)?;
        Ok(immediate_children(&dir, self.entries()))
    }

    pub fn read_now(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
        let normalized = normalize_virtual_path(path)?;
        let record = self.lookup(&normalized)?;
        Ok(self.limits.render_read(record, offset, limit))
    }

    pub fn write_now(&self, path: &str, content: &str) -> Result<WriteResult> {
        let normalized = normalize_virtual_path(path)?;
        if self.state.contains(&normalized) {
            return Err(FileError::AlreadyExists(normalized).into());
        }
        self.check_target(&normalized)?;
        debug!(path = %normalized, bytes = content.len(), "📝 写入会话文件");
        let mut update = FilesUpdate::new();
        update.insert(normalized.clone(), FileRecord::new(content));
        Ok(WriteResult {
            path: normalized,
            files_update: Some(update),
        })
    }

    pub fn overwrite_now(&self, path: &str, content: &str) -> Result<WriteResult> {
        let normalized = normalize_virtual_path(path)?;
        let record = match self.state.get(&normalized) {
            Some(existing) => existing.updated(content),
            None => {
                self.check_target(&normalized)?;
                FileRecord::new(content)
            }
        };
        let mut update = FilesUpdate::new();
        update.insert(normalized.clone(), record);
        Ok(WriteResult {
            path: normalized,
            files_update: Some(update),
        })
    }

    pub fn edit_now(
        &self,
        path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult> {
        let normalized = normalize_virtual_path(path)?;
        let record = self.lookup(&normalized)?;
        let (text, occurrences) =
            replace_in_content(&normalized, &record.text(), old_string, new_string, replace_all)?;
        debug!(path = %normalized, occurrences, "✏️ 编辑会话文件");
        let mut update = FilesUpdate::new();
        update.insert(normalized.clone(), record.updated(&text));
        Ok(EditResult {
            path: normalized,
            occurrences,
            files_update: Some(update),
        })
    }

    pub fn glob_info_now(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>> {
        let pattern = GlobPattern::new(pattern)?;
        let dir = directory_prefix(path)?;
        Ok(glob_entries(&pattern, &dir, self.entries()))
    }

    pub fn grep_raw_now(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
    ) -> Result<Vec<GrepMatch>> {
        let regex = compile_regex(pattern)?;
        let filter = glob.map(GlobPattern::new).transpose()?;
        let normalized = normalize_virtual_path(path)?;

        // 路径本身是文件时只搜该文件
        if let Some(record) = self.state.get(&normalized) {
            return Ok(grep_lines(
                &normalized,
                record.content.iter().map(String::as_str),
                &regex,
            ));
        }

        let dir = as_dir(&normalized);
        let mut matches = Vec::new();
        for (file_path, record) in self.state.iter() {
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
                file_path,
                record.content.iter().map(String::as_str),
                &regex,
            ));
        }
        Ok(matches)
    }

    /// 批量上传；同批次中先被接受的条目参与后续条目的落点检查
    pub fn upload_files_now(&self, files: Vec<(String, Vec<u8>)>) -> Vec<FileUploadResponse> {
        let mut pending: BTreeSet<String> = BTreeSet::new();
        files
            .into_iter()
            .map(|(path, bytes)| {
                let normalized = match normalize_virtual_path(&path) {
                    Ok(p) => p,
                    Err(e) => return FileUploadResponse::failed(path, e),
                };
                let mut record = FileRecord::from_bytes(&bytes);
                match self.state.get(&normalized) {
                    Some(existing) => record.created_at = existing.created_at.clone(),
                    None => {
                        if let Err(e) = self.check_target_among(&normalized, &pending) {
                            return FileUploadResponse::failed(normalized, e);
                        }
                    }
                }
                pending.insert(normalized.clone());
                let mut update = FilesUpdate::new();
                update.insert(normalized.clone(), record);
                FileUploadResponse::ok(normalized, Some(update))
            })
            .collect()
    }

    pub fn download_files_now(&self, paths: &[String]) -> Vec<FileDownloadResponse> {
        paths
            .iter()
            .map(|path| {
                let looked_up = normalize_virtual_path(path)
                    .and_then(|normalized| self.lookup(&normalized).map(FileRecord::to_bytes));
                match looked_up {
                    Ok(bytes) => FileDownloadResponse::ok(path.clone(), bytes),
                    Err(e) => FileDownloadResponse::failed(path.clone(), e),
                }
            })
            .collect()
    }
}

#[async_trait]
impl Backend for EphemeralBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ephemeral
    }

    fn output_limits(&self) -> OutputLimits {
        self.limits
    }

    async fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.ls_info_now(path)
    }

    async fn read(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
        self.read_now(path, offset, limit)
    }

    async fn write(&self, path: &str, content: &str) -> Result<WriteResult> {
        self.write_now(path, content)
    }

    async fn overwrite(&self, path: &str, content: &str) -> Result<WriteResult> {
        self.overwrite_now(path, content)
    }

    async fn edit(
        &self,
        path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult> {
        self.edit_now(path, old_string, new_string, replace_all)
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>> {
        self.glob_info_now(pattern, path)
    }

    async fn grep_raw(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
    ) -> Result<Vec<GrepMatch>> {
        self.grep_raw_now(pattern, path, glob)
    }

    async fn upload_files(&self, files: Vec<(String, Vec<u8>)>) -> Vec<FileUploadResponse> {
        self.upload_files_now(files)
    }

    async fn download_files(&self, paths: &[String]) -> Vec<FileDownloadResponse> {
        self.download_files_now(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VfsError;
    use crate::vfs::GrepOutputMode;

    fn backend_with(files: &[(&str, &str)]) -> EphemeralBackend {
        let state = files
            .iter()
            .fold(FileState::new(), |s, (p, c)| s.with_file(*p, c));
        EphemeralBackend::new(Arc::new(state))
    }

    fn apply(state: &mut Arc<FileState>, update: Option<FilesUpdate>) {
        Arc::make_mut(state).apply(update.unwrap_or_default());
    }

    fn file_err(err: VfsError) -> FileError {
        match err {
            VfsError::File(e) => e,
            other => panic!("expected file error, got {other}"),
        }
    }

    #[test]
    fn test_write_read_edit_cycle() {
        let mut state = Arc::new(FileState::new());
        let be = EphemeralBackend::new(state.clone());
        let res = be.write_now("/notes.txt", "hello world").unwrap();
        assert_eq!(res.path, "/notes.txt");
        apply(&mut state, res.files_update);

        let be = EphemeralBackend::new(state.clone());
        let content = be.read_now("/notes.txt", 0, None).unwrap();
        assert!(content.contains("hello world"));

        let edit = be.edit_now("/notes.txt", "hello", "hi", false).unwrap();
        assert_eq!(edit.occurrences, 1);
        apply(&mut state, edit.files_update);

        let be = EphemeralBackend::new(state.clone());
        assert!(be.read_now("/notes.txt", 0, None).unwrap().contains("hi world"));
    }

    #[test]
    fn test_write_once() {
        let be = backend_with(&[("/a.txt", "c1")]);
        let err = file_err(be.write_now("/a.txt", "c2").unwrap_err());
        assert_eq!(err, FileError::AlreadyExists("/a.txt".into()));
        assert_eq!(be.state().get("/a.txt").unwrap().text(), "c1");
    }

    #[test]
    fn test_edit_ambiguity() {
        let be = backend_with(&[("/f.txt", "dup dup")]);
        let err = file_err(be.edit_now("/f.txt", "dup", "x", false).unwrap_err());
        assert_eq!(
            err,
            FileError::AmbiguousMatch {
                path: "/f.txt".into(),
                occurrences: 2
            }
        );
        let ok = be.edit_now("/f.txt", "dup", "x", true).unwrap();
        assert_eq!(ok.occurrences, 2);
        let update = ok.files_update.unwrap();
        assert_eq!(update["/f.txt"].text(), "x x");
    }

    #[test]
    fn test_read_errors() {
        let be = backend_with(&[("/dir/a.txt", "x")]);
        assert_eq!(
            file_err(be.read_now("/missing.txt", 0, None).unwrap_err()),
            FileError::NotFound("/missing.txt".into())
        );
        assert_eq!(
            file_err(be.read_now("/dir", 0, None).unwrap_err()),
            FileError::IsDirectory("/dir".into())
        );
    }

    #[test]
    fn test_write_into_file_parent_or_dir() {
        let be = backend_with(&[("/a.txt", "x"), ("/dir/b.txt", "y")]);
        assert_eq!(
            file_err(be.write_now("/a.txt/child", "z").unwrap_err()),
            FileError::ParentNotFound("/a.txt/child".into())
        );
        assert_eq!(
            file_err(be.write_now("/dir", "z").unwrap_err()),
            FileError::IsDirectory("/dir".into())
        );
    }

    #[test]
    fn test_ls_depth_and_trailing_slash() {
        let be = backend_with(&[
            ("/a.txt", "a"),
            ("/dir/b.txt", "b"),
            ("/dir/sub/c.txt", "c"),
        ]);
        let root: Vec<String> = be.ls_info_now("/").unwrap().into_iter().map(|i| i.path).collect();
        assert_eq!(root, vec!["/a.txt", "/dir/"]);

        let with_slash = be.ls_info_now("/dir/").unwrap();
        let without = be.ls_info_now("/dir").unwrap();
        assert_eq!(with_slash, without);
        let names: Vec<&str> = with_slash.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(names, vec!["/dir/b.txt", "/dir/sub/"]);

        assert!(be.ls_info_now("/nonexistent/").unwrap().is_empty());
    }

    #[test]
    fn test_glob_and_grep() {
        let be = backend_with(&[
            ("/test.py", "import os\nimport sys\nx = 1"),
            ("/src/main.py", "import json"),
            ("/src/types.pyi", "x: int"),
            ("/readme.md", "no imports here"),
        ]);
        let root: Vec<String> = be
            .glob_info_now("*.py", "/")
            .unwrap()
            .into_iter()
            .map(|i| i.path)
            .collect();
        assert_eq!(root, vec!["/test.py"]);

        let deep = be.glob_info_now("**/*.py", "/").unwrap();
        assert_eq!(deep.len(), 2);
        let scoped = be.glob_info_now("*.{py,pyi}", "/src").unwrap();
        assert_eq!(scoped.len(), 2);

        let matches = be.grep_raw_now("^import", "/", None).unwrap();
        assert_eq!(matches.len(), 3);
        let filtered = be.grep_raw_now("import", "/", Some("*.py")).unwrap();
        assert!(filtered.iter().all(|m| m.path.ends_with(".py")));

        assert!(matches!(
            be.grep_raw_now("[", "/", None),
            Err(VfsError::File(FileError::InvalidPattern { .. }))
        ));
    }

    #[tokio::test]
    async fn test_budgeted_grep_through_trait() {
        let be = backend_with(&[("/test.py", "import os\nimport sys")]);
        let count = be
            .grep("import", "/", None, GrepOutputMode::Count)
            .await
            .unwrap();
        assert_eq!(count, vec!["/test.py: 2"]);
        let none = be
            .grep("zzz", "/", None, GrepOutputMode::Content)
            .await
            .unwrap();
        assert_eq!(none, vec!["No matches found"]);
    }

    #[test]
    fn test_partial_batch_and_binary_roundtrip() {
        let mut state = Arc::new(FileState::new());
        let be = EphemeralBackend::new(state.clone());
        let payload: Vec<u8> = (0..=255u8).collect();
        let results = be.upload_files_now(vec![
            ("/ok.bin".to_string(), payload.clone()),
            ("/../bad.txt".to_string(), b"y".to_vec()),
        ]);
        assert_eq!(results.len(), 2);
        assert!(results[0].error.is_none());
        assert_eq!(results[1].error.as_ref().map(FileError::kind), Some("invalid_path"));
        assert!(results[1].files_update.is_none());
        for r in results {
            apply(&mut state, r.files_update);
        }

        let be = EphemeralBackend::new(state.clone());
        let downloads = be.download_files_now(&["/ok.bin".to_string(), "/nope".to_string()]);
        assert_eq!(downloads[0].content.as_deref(), Some(payload.as_slice()));
        assert_eq!(
            downloads[1].error,
            Some(FileError::NotFound("/nope".into()))
        );
    }

    #[test]
    fn test_batch_items_see_each_other() {
        let mut state = Arc::new(FileState::new());
        let be = EphemeralBackend::new(state.clone());
        let results = be.upload_files_now(vec![
            ("/a".to_string(), b"x".to_vec()),
            ("/a/b".to_string(), b"y".to_vec()),
            ("/c/d".to_string(), b"z".to_vec()),
            ("/c".to_string(), b"w".to_vec()),
        ]);
        assert!(results[0].error.is_none());
        assert_eq!(results[1].error, Some(FileError::ParentNotFound("/a/b".into())));
        assert!(results[2].error.is_none());
        assert_eq!(results[3].error, Some(FileError::IsDirectory("/c".into())));
        for r in results {
            apply(&mut state, r.files_update);
        }

        let be = EphemeralBackend::new(state.clone());
        let listed: Vec<String> = be.ls_info_now("/").unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(listed, vec!["/a", "/c/"]);
    }

    #[test]
    fn test_overwrite_keeps_created_at() {
        let mut state = FileState::new().with_file("/r.txt", "one");
        let mut record = state.get("/r.txt").unwrap().clone();
        record.created_at = "2020-01-01T00:00:00Z".into();
        let mut update = FilesUpdate::new();
        update.insert("/r.txt".into(), record);
        state.apply(update);

        let be = EphemeralBackend::new(Arc::new(state));
        let res = be.overwrite_now("/r.txt", "two").unwrap();
        let rec = &res.files_update.unwrap()["/r.txt"];
        assert_eq!(rec.created_at, "2020-01-01T00:00:00Z");
        assert_eq!(rec.text(), "two");
    }
}
