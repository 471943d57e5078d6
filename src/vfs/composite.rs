//! 按路径前缀路由的组合后端
//!
//! 持有一个默认后端和若干 `(前缀, 后端)` 路由。每个操作选取**最长**匹配前缀的
//! 后端；都不匹配时交给默认后端。子后端看到的是完整路径，不做前缀剥离。
//!
//! 在挂载点的祖先目录上（包括嵌套挂载时外层路由内部的目录）：
//!
//! - `ls` 把挂载点显示为一个合成子目录，不会把子后端的内容摊平到外层的列表里
//! - `glob` / `grep` 并发扇出到路径所属后端和其下的所有挂载后端，结果按路径合并
//! - 每条结果只保留其最长前缀所属后端给出的那一份，被遮蔽的内容不可见
//!
//! ```rust
//! use echo_vfs::memory::InMemoryStore;
//! use echo_vfs::vfs::{Backend, CompositeBackend, StoreBackend};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> echo_vfs::error::Result<()> {
//! let scratch = Arc::new(StoreBackend::new(Arc::new(InMemoryStore::new()), None));
//! let memories = Arc::new(StoreBackend::new(Arc::new(InMemoryStore::new()), Some("alice")));
//! let fs = CompositeBackend::new(scratch).route("/memories/", memories)?;
//!
//! fs.write("/notes.txt", "scratch").await?;
//! fs.write("/memories/prefs.md", "dark mode").await?;
//! assert_eq!(fs.ls("/").await?, vec!["/memories/", "/notes.txt"]);
//! # Ok(())
//! # }
//! ```

use crate::error::{FileError, Result};
use crate::vfs::listing::immediate_children;
use crate::vfs::path::{as_dir, directory_prefix, normalize_virtual_path};
use crate::vfs::{
    Backend, BackendKind, EditResult, FileDownloadResponse, FileInfo, FileUploadResponse,
    GrepMatch, OutputLimits, WriteResult,
};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// 路由目标：`None` 为默认后端，`Some(i)` 为第 i 条路由
type Target = Option<usize>;

pub struct CompositeBackend {
    default: Arc<dyn Backend>,
    /// 前缀以 `/` 结尾，按长度降序
    routes: Vec<(String, Arc<dyn Backend>)>,
}

impl CompositeBackend {
    pub fn new(default: Arc<dyn Backend>) -> Self {
        Self {
            default,
            routes: Vec::new(),
        }
    }

    /// 挂载 `backend` 到 `prefix`；同一前缀重复挂载时替换
    pub fn route(mut self, prefix: &str, backend: Arc<dyn Backend>) -> Result<Self> {
        let prefix = directory_prefix(prefix)?;
        if prefix == "/" {
            return Err(FileError::invalid_path(prefix, "cannot route the root; use the default backend").into());
        }
        info!(prefix = %prefix, kind = ?backend.kind(), "🔀 挂载路由");
        self.routes.retain(|(existing, _)| *existing != prefix);
        self.routes.push((prefix, backend));
        self.routes
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Ok(self)
    }

    /// 已挂载的前缀（最长优先）
    pub fn prefixes(&self) -> Vec<&str> {
        self.routes.iter().map(|(p, _)| p.as_str()).collect()
    }

    fn target(&self, path: &str) -> Target {
        let Ok(normalized) = normalize_virtual_path(path) else {
            return None;
        };
        let dir = as_dir(&normalized);
        self.routes
            .iter()
            .position(|(prefix, _)| dir.starts_with(prefix.as_str()))
    }

    fn backend(&self, target: Target) -> &Arc<dyn Backend> {
        match target {
            Some(idx) => &self.routes[idx].1,
            None => &self.default,
        }
    }

    fn select(&self, path: &str) -> &Arc<dyn Backend> {
        self.backend(self.target(path))
    }

    /// 严格位于 `dir` 之下的挂载点
    fn mounted_under(&self, dir: &str) -> Vec<usize> {
        self.routes
            .iter()
            .enumerate()
            .filter(|(_, (prefix, _))| prefix.len() > dir.len() && prefix.starts_with(dir))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// 查询 `path` 时参与的后端：路径所属的后端在前，其后是路径之下的挂载点
    fn participants(&self, path: &str) -> Vec<Target> {
        let mut targets = vec![self.target(path)];
        if let Ok(dir) = directory_prefix(path) {
            targets.extend(self.mounted_under(&dir).into_iter().map(Some));
        }
        targets
    }

    /// 结果路径确实归 `target` 所有；被更深挂载点遮蔽的内容返回 false
    fn owns(&self, target: Target, path: &str) -> bool {
        self.target(path) == target
    }
}

#[async_trait]
impl Backend for CompositeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Composite
    }

    fn output_limits(&self) -> OutputLimits {
        self.default.output_limits()
    }

    async fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>> {
        let base = self.target(path);
        let Ok(dir) = directory_prefix(path) else {
            return self.backend(base).ls_info(path).await;
        };
        let mounted = self.mounted_under(&dir);
        if mounted.is_empty() {
            return self.backend(base).ls_info(path).await;
        }

        let mut merged: BTreeMap<String, FileInfo> = self
            .backend(base)
            .ls_info(path)
            .await?
            .into_iter()
            .filter(|e| self.owns(base, &e.path))
            .map(|e| (e.path.clone(), e))
            .collect();
        let mounts = mounted
            .iter()
            .map(|&idx| FileInfo::dir(self.routes[idx].0.clone()));
        for child in immediate_children(&dir, mounts) {
            merged.entry(child.path.clone()).or_insert(child);
        }
        Ok(merged.into_values().collect())
    }

    async fn read(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
        self.select(path).read(path, offset, limit).await
    }

    async fn write(&self, path: &str, content: &str) -> Result<WriteResult> {
        self.select(path).write(path, content).await
    }

    async fn overwrite(&self, path: &str, content: &str) -> Result<WriteResult> {
        self.select(path).overwrite(path, content).await
    }

    async fn edit(
        &self,
        path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult> {
        self.select(path)
            .edit(path, old_string, new_string, replace_all)
            .await
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>> {
        let targets = self.participants(path);
        if let &[only] = targets.as_slice() {
            return self.backend(only).glob_info(pattern, path).await;
        }

        let results =
            join_all(targets.iter().map(|&t| self.backend(t).glob_info(pattern, path))).await;
        let mut hits = Vec::new();
        for (&target, result) in targets.iter().zip(results) {
            hits.extend(result?.into_iter().filter(|info| self.owns(target, &info.path)));
        }
        hits.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(pattern, path, backends = targets.len(), hits = hits.len(), "🔎 glob 扇出完成");
        Ok(hits)
    }

    async fn grep_raw(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
    ) -> Result<Vec<GrepMatch>> {
        let targets = self.participants(path);
        if let &[only] = targets.as_slice() {
            return self.backend(only).grep_raw(pattern, path, glob).await;
        }

        let results =
            join_all(targets.iter().map(|&t| self.backend(t).grep_raw(pattern, path, glob))).await;
        let mut matches = Vec::new();
        for (&target, result) in targets.iter().zip(results) {
            matches.extend(result?.into_iter().filter(|m| self.owns(target, &m.path)));
        }
        matches.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
        Ok(matches)
    }

    async fn upload_files(&self, files: Vec<(String, Vec<u8>)>) -> Vec<FileUploadResponse> {
        let paths: Vec<String> = files.iter().map(|(p, _)| p.clone()).collect();
        let mut groups: BTreeMap<Target, (Vec<usize>, Vec<(String, Vec<u8>)>)> = BTreeMap::new();
        for (idx, (path, bytes)) in files.into_iter().enumerate() {
            let group = groups.entry(self.target(&path)).or_default();
            group.0.push(idx);
            group.1.push((path, bytes));
        }

        let mut slots: Vec<Option<FileUploadResponse>> = vec![None; paths.len()];
        let (targets, batches): (Vec<_>, Vec<_>) = groups
            .into_iter()
            .map(|(target, (indices, batch))| ((target, indices), batch))
            .unzip();
        let results = join_all(
            targets
                .iter()
                .zip(batches)
                .map(|((target, _), batch)| self.backend(*target).upload_files(batch)),
        )
        .await;
        for ((_, indices), responses) in targets.into_iter().zip(results) {
            for (idx, response) in indices.into_iter().zip(responses) {
                slots[idx] = Some(response);
            }
        }

        slots
            .into_iter()
            .zip(paths)
            .map(|(slot, path)| {
                slot.unwrap_or_else(|| {
                    let err = FileError::invalid_path(&path, "backend returned no result");
                    FileUploadResponse::failed(path, err)
                })
            })
            .collect()
    }

    async fn download_files(&self, paths: &[String]) -> Vec<FileDownloadResponse> {
        let mut groups: BTreeMap<Target, (Vec<usize>, Vec<String>)> = BTreeMap::new();
        for (idx, path) in paths.iter().enumerate() {
            let group = groups.entry(self.target(path)).or_default();
            group.0.push(idx);
            group.1.push(path.clone());
        }

        let mut slots: Vec<Option<FileDownloadResponse>> = vec![None; paths.len()];
        let groups: Vec<_> = groups.into_iter().collect();
        let results = join_all(
            groups
                .iter()
                .map(|(target, (_, batch))| self.backend(*target).download_files(batch)),
        )
        .await;
        for ((_, (indices, _)), responses) in groups.iter().zip(results) {
            for (idx, response) in indices.iter().zip(responses) {
                slots[*idx] = Some(response);
            }
        }

        slots
            .into_iter()
            .zip(paths)
            .map(|(slot, path)| {
                slot.unwrap_or_else(|| {
                    let err = FileError::invalid_path(path, "backend returned no result");
                    FileDownloadResponse::failed(path.clone(), err)
                })
            })
            .collect()
    }
}
