//! 大结果驱逐
//!
//! 工具执行后、结果写入对话记录前调用。结果不超预算时原样放行；超出时把完整内容
//! 转存到 `/large_tool_results/<id>`，对话里只留一条指向该路径的短消息和前几行预览。
//!
//! ```rust
//! use echo_vfs::eviction::{EvictionOutcome, LargeResultEvictor, ToolMessage};
//! use echo_vfs::memory::InMemoryStore;
//! use echo_vfs::vfs::StoreBackend;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> echo_vfs::error::Result<()> {
//! let backend = Arc::new(StoreBackend::new(Arc::new(InMemoryStore::new()), None));
//! let evictor = LargeResultEvictor::new(backend);
//!
//! let huge = "row\n".repeat(30_000);
//! let outcome = evictor.intercept(ToolMessage::text("call_1", Some("sql"), huge)).await?;
//! assert!(matches!(outcome, EvictionOutcome::Evicted { .. }));
//! # Ok(())
//! # }
//! ```

use crate::config::{EvictionConfig, StorageConfig};
use crate::error::Result;
use crate::vfs::format::{CHARS_PER_TOKEN, format_with_line_numbers};
use crate::vfs::path::sanitize_tool_call_id;
use crate::vfs::{Backend, FilesUpdate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const LARGE_RESULTS_DIR: &str = "/large_tool_results";

// ── 工具消息 ──────────────────────────────────────────────────────────────────

/// 工具结果内容：纯文本或内容块列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl ToolContent {
    /// 序列化后的字符数，用于估算 token
    pub fn serialized_len(&self) -> usize {
        match self {
            ToolContent::Text(text) => text.chars().count(),
            ToolContent::Blocks(blocks) => serde_json::to_string(blocks)
                .map(|s| s.chars().count())
                .unwrap_or(0),
        }
    }

    /// 转存的正文：单个文本块取其文本，其余情况保留整个结构的 JSON
    pub fn body(&self) -> String {
        match self {
            ToolContent::Text(text) => text.clone(),
            ToolContent::Blocks(blocks) => match blocks.as_slice() {
                [block] if block.get("type").and_then(Value::as_str) == Some("text") => block
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| block.to_string()),
                _ => Value::Array(blocks.clone()).to_string(),
            },
        }
    }
}

/// 一次工具调用的结果消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMessage {
    pub tool_call_id: String,
    /// 产生结果的工具名
    pub name: Option<String>,
    pub content: ToolContent,
}

impl ToolMessage {
    pub fn text(
        tool_call_id: impl Into<String>,
        name: Option<&str>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.map(str::to_string),
            content: ToolContent::Text(text.into()),
        }
    }

    pub fn blocks(tool_call_id: impl Into<String>, name: Option<&str>, blocks: Vec<Value>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.map(str::to_string),
            content: ToolContent::Blocks(blocks),
        }
    }
}

/// 拦截结果
#[derive(Debug, Clone, PartialEq)]
pub enum EvictionOutcome {
    /// 未超预算，原样放行
    Passthrough(ToolMessage),
    /// 已转存，`message` 为替换后的指针消息
    Evicted {
        message: ToolMessage,
        path: String,
        /// 会话内存后端产生的状态增量，由调用方合并
        files_update: Option<FilesUpdate>,
    },
}

impl EvictionOutcome {
    pub fn message(&self) -> &ToolMessage {
        match self {
            EvictionOutcome::Passthrough(message) => message,
            EvictionOutcome::Evicted { message, .. } => message,
        }
    }

    pub fn into_message(self) -> ToolMessage {
        match self {
            EvictionOutcome::Passthrough(message) => message,
            EvictionOutcome::Evicted { message, .. } => message,
        }
    }

    pub fn is_evicted(&self) -> bool {
        matches!(self, EvictionOutcome::Evicted { .. })
    }
}

// ── 驱逐器 ────────────────────────────────────────────────────────────────────

/// 无状态的驱逐策略，持有目标后端与预算
pub struct LargeResultEvictor {
    backend: Arc<dyn Backend>,
    config: EvictionConfig,
}

impl LargeResultEvictor {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_config(backend, EvictionConfig::default())
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: EvictionConfig) -> Self {
        Self { backend, config }
    }

    pub fn from_config(backend: Arc<dyn Backend>, config: &StorageConfig) -> Self {
        Self::with_config(backend, config.eviction.clone())
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    pub fn should_evict(&self, message: &ToolMessage) -> bool {
        let excluded = message
            .name
            .as_ref()
            .is_some_and(|name| self.config.excluded_tools.iter().any(|t| t == name));
        if excluded {
            return false;
        }
        message.content.serialized_len() > self.config.token_limit.saturating_mul(CHARS_PER_TOKEN)
    }

    /// 结果转存的路径；空 id 会落到目录本身，改用随机 id
    pub fn storage_path(tool_call_id: &str) -> String {
        let mut id = sanitize_tool_call_id(tool_call_id.trim());
        if id.is_empty() {
            id = format!("anonymous_{}", Uuid::new_v4().simple());
        }
        format!("{}/{}", LARGE_RESULTS_DIR, id)
    }

    pub async fn intercept(&self, message: ToolMessage) -> Result<EvictionOutcome> {
        if !self.should_evict(&message) {
            debug!(tool_call_id = %message.tool_call_id, "工具结果未超预算");
            return Ok(EvictionOutcome::Passthrough(message));
        }

        let body = message.content.body();
        let path = Self::storage_path(&message.tool_call_id);
        // 同一 id 重复转存时覆盖，不报已存在
        let written = self.backend.overwrite(&path, &body).await?;
        info!(
            tool_call_id = %message.tool_call_id,
            path = %path,
            chars = body.len(),
            "📦 大结果已转存"
        );

        let text = format!(
            "Tool result too large, the result of this tool call {id} was saved in the filesystem at this path: {path}\n\
             You can read the result from the filesystem by using the read_file tool, but make sure to only read part of the result at a time.\n\
             You can do this by specifying an offset and limit in the read_file tool call.\n\
             For example, to read the first 100 lines, you can use the read_file tool with offset=0 and limit=100.\n\n\
             Here are the first {n} lines of the result:\n{preview}",
            id = message.tool_call_id,
            path = path,
            n = self.config.preview_lines,
            preview = self.preview(&body),
        );

        Ok(EvictionOutcome::Evicted {
            message: ToolMessage {
                tool_call_id: message.tool_call_id,
                name: message.name,
                content: ToolContent::Text(text),
            },
            path,
            files_update: written.files_update,
        })
    }

    /// 前若干行，每行截到上限后带行号渲染
    fn preview(&self, body: &str) -> String {
        let width = self.config.preview_line_chars;
        let lines: Vec<String> = body
            .split('\n')
            .take(self.config.preview_lines)
            .map(|line| line.chars().take(width).collect())
            .collect();
        format_with_line_numbers(&lines, 1, width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::vfs::{EphemeralBackend, FileState, StoreBackend};
    use serde_json::json;

    fn small_budget() -> EvictionConfig {
        EvictionConfig::default().token_limit(100)
    }

    fn store_evictor() -> (Arc<StoreBackend>, LargeResultEvictor) {
        let backend = Arc::new(StoreBackend::new(Arc::new(InMemoryStore::new()), None));
        let evictor = LargeResultEvictor::with_config(backend.clone(), small_budget());
        (backend, evictor)
    }

    #[tokio::test]
    async fn test_small_result_passes_through() {
        let (_, evictor) = store_evictor();
        let message = ToolMessage::text("call_1", Some("search"), "short");
        let outcome = evictor.intercept(message.clone()).await.unwrap();
        assert_eq!(outcome, EvictionOutcome::Passthrough(message));
    }

    #[tokio::test]
    async fn test_eviction_is_idempotent() {
        let (backend, evictor) = store_evictor();
        let big = "x".repeat(1000);

        let first = evictor
            .intercept(ToolMessage::text("call/1.a", Some("search"), big.clone()))
            .await
            .unwrap();
        let second = evictor
            .intercept(ToolMessage::text("call/1.a", Some("search"), big + "y"))
            .await
            .unwrap();

        let (EvictionOutcome::Evicted { path: p1, message: m1, .. }, EvictionOutcome::Evicted { path: p2, message: m2, .. }) =
            (first, second)
        else {
            panic!("both results should be evicted");
        };
        assert_eq!(p1, "/large_tool_results/call_1_a");
        assert_eq!(p1, p2);
        assert_eq!(m1.content, m2.content);
        let stored = backend.read(&p1, 0, None).await.unwrap();
        assert!(stored.contains('y'));
    }

    #[tokio::test]
    async fn test_empty_tool_call_id_gets_own_file() {
        let (backend, evictor) = store_evictor();
        let big = "z".repeat(800);
        evictor
            .intercept(ToolMessage::text("call_9", None, big.clone()))
            .await
            .unwrap();

        let outcome = evictor
            .intercept(ToolMessage::text("", None, big.clone()))
            .await
            .unwrap();
        let EvictionOutcome::Evicted { path, .. } = outcome else {
            panic!("empty id result should still be evicted");
        };
        assert!(path.starts_with("/large_tool_results/anonymous_"));
        assert!(backend.read(&path, 0, None).await.unwrap().contains('z'));
        assert_ne!(
            LargeResultEvictor::storage_path(""),
            LargeResultEvictor::storage_path("")
        );
    }

    #[tokio::test]
    async fn test_pointer_message_and_preview() {
        let (_, evictor) = store_evictor();
        let mut lines = vec!["short line".to_string(), "a".repeat(1500)];
        lines.extend((0..20).map(|i| format!("row {i}")));
        let outcome = evictor
            .intercept(ToolMessage::text("call_2", None, lines.join("\n")))
            .await
            .unwrap();

        let ToolContent::Text(text) = &outcome.message().content else {
            panic!("pointer message is plain text");
        };
        assert!(text.starts_with("Tool result too large, the result of this tool call call_2"));
        assert!(text.contains("/large_tool_results/call_2"));
        assert!(text.contains("Here are the first 10 lines of the result:"));
        assert!(text.contains("     1\tshort line"));
        assert!(text.contains(&format!("     2\t{}", "a".repeat(1000))));
        assert!(!text.contains(&"a".repeat(1001)));
        assert!(text.contains("row 7"));
        assert!(!text.contains("row 8"));
    }

    #[tokio::test]
    async fn test_block_bodies() {
        let (backend, evictor) = store_evictor();

        let single = vec![json!({"type": "text", "text": "Hello world! ".repeat(100)})];
        evictor
            .intercept(ToolMessage::blocks("single", None, single))
            .await
            .unwrap();
        let stored = backend.read("/large_tool_results/single", 0, None).await.unwrap();
        assert!(stored.contains("\tHello world!"));

        let mixed = vec![
            json!({"type": "text", "text": "Some text ".repeat(100)}),
            json!({"type": "image", "url": "https://example.com/image.png"}),
        ];
        evictor
            .intercept(ToolMessage::blocks("mixed", None, mixed))
            .await
            .unwrap();
        let stored = backend.read("/large_tool_results/mixed", 0, None).await.unwrap();
        assert!(stored.contains("\t[{"));
        assert!(stored.contains("\"type\":\"image\""));
    }

    #[tokio::test]
    async fn test_excluded_tools_never_evicted() {
        let (_, evictor) = store_evictor();
        let big = "z".repeat(5000);
        assert!(!evictor.should_evict(&ToolMessage::text("c", Some("read_file"), big.clone())));
        assert!(evictor.should_evict(&ToolMessage::text("c", Some("web_fetch"), big.clone())));
        assert!(evictor.should_evict(&ToolMessage::text("c", None, big)));
    }

    #[tokio::test]
    async fn test_ephemeral_backend_returns_update() {
        let backend = Arc::new(EphemeralBackend::new(Arc::new(FileState::new())));
        let evictor = LargeResultEvictor::with_config(backend, small_budget());
        let outcome = evictor
            .intercept(ToolMessage::text("test_123", None, "q".repeat(800)))
            .await
            .unwrap();
        let EvictionOutcome::Evicted { files_update, .. } = outcome else {
            panic!("expected eviction");
        };
        let update = files_update.unwrap();
        assert_eq!(update["/large_tool_results/test_123"].text(), "q".repeat(800));
    }
}
