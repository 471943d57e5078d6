//! 同步调用入口
//!
//! 供不在 async 上下文中的调用方使用（脚本、同步测试、CLI）。内部持有一个
//! current-thread 运行时，逐个阻塞执行被包装后端的操作。
//!
//! 不要在 tokio 运行时内部调用这些方法，`block_on` 会 panic。

use crate::error::Result;
use crate::vfs::{
    Backend, EditResult, FileDownloadResponse, FileInfo, FileUploadResponse, GrepMatch,
    GrepOutputMode, WriteResult,
};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

pub struct BlockingBackend {
    inner: Arc<dyn Backend>,
    runtime: Runtime,
}

impl BlockingBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { inner, runtime })
    }

    /// 被包装的异步后端
    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.inner
    }

    pub fn ls_info(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.runtime.block_on(self.inner.ls_info(path))
    }

    pub fn ls(&self, path: &str) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.ls(path))
    }

    pub fn read(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
        self.runtime.block_on(self.inner.read(path, offset, limit))
    }

    pub fn write(&self, path: &str, content: &str) -> Result<WriteResult> {
        self.runtime.block_on(self.inner.write(path, content))
    }

    pub fn overwrite(&self, path: &str, content: &str) -> Result<WriteResult> {
        self.runtime.block_on(self.inner.overwrite(path, content))
    }

    pub fn edit(
        &self,
        path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<EditResult> {
        self.runtime
            .block_on(self.inner.edit(path, old_string, new_string, replace_all))
    }

    pub fn glob_info(&self, pattern: &str, path: &str) -> Result<Vec<FileInfo>> {
        self.runtime.block_on(self.inner.glob_info(pattern, path))
    }

    pub fn glob(&self, pattern: &str, path: &str) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.glob(pattern, path))
    }

    pub fn grep_raw(&self, pattern: &str, path: &str, glob: Option<&str>) -> Result<Vec<GrepMatch>> {
        self.runtime.block_on(self.inner.grep_raw(pattern, path, glob))
    }

    pub fn grep(
        &self,
        pattern: &str,
        path: &str,
        glob: Option<&str>,
        mode: GrepOutputMode,
    ) -> Result<Vec<String>> {
        self.runtime
            .block_on(self.inner.grep(pattern, path, glob, mode))
    }

    pub fn upload_files(&self, files: Vec<(String, Vec<u8>)>) -> Vec<FileUploadResponse> {
        self.runtime.block_on(self.inner.upload_files(files))
    }

    pub fn download_files(&self, paths: &[String]) -> Vec<FileDownloadResponse> {
        self.runtime.block_on(self.inner.download_files(paths))
    }
}
