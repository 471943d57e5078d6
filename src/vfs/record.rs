//! FileRecord：存储的基本单元
//!
//! 内容按 `\n` 切分为行序列；空文件即单个空行 `[""]`，
//! `"a\n"` 切分为 `["a", ""]`，拼接后还原末尾换行。

use crate::error::FileError;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 内容编码；二进制上传以 hex 形式落在文本行里
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileEncoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "hex")]
    Hex,
}

impl FileEncoding {
    fn is_utf8(&self) -> bool {
        matches!(self, FileEncoding::Utf8)
    }
}

/// 单个文件记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub content: Vec<String>,
    /// RFC 3339，创建后不再改变
    pub created_at: String,
    /// RFC 3339，每次成功写入/编辑后更新
    pub modified_at: String,
    #[serde(default, skip_serializing_if = "FileEncoding::is_utf8")]
    pub encoding: FileEncoding,
}

impl FileRecord {
    /// 以当前时间创建新记录
    pub fn new(text: &str) -> Self {
        let now = now_rfc3339();
        Self {
            content: split_lines(text),
            created_at: now.clone(),
            modified_at: now,
            encoding: FileEncoding::Utf8,
        }
    }

    /// 按字节创建：非 UTF-8 内容以 hex 保存
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::new(text),
            Err(_) => {
                let mut record = Self::new(&hex::encode(bytes));
                record.encoding = FileEncoding::Hex;
                record
            }
        }
    }

    /// 替换内容，保留 `created_at`
    pub fn updated(&self, text: &str) -> Self {
        Self {
            content: split_lines(text),
            created_at: self.created_at.clone(),
            modified_at: now_rfc3339(),
            encoding: FileEncoding::Utf8,
        }
    }

    pub fn text(&self) -> String {
        self.content.join("\n")
    }

    /// 还原原始字节
    pub fn to_bytes(&self) -> Vec<u8> {
        let text = self.text();
        match self.encoding {
            FileEncoding::Utf8 => text.into_bytes(),
            FileEncoding::Hex => hex::decode(text.trim()).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.iter().all(|line| line.is_empty()) && self.content.len() <= 1
    }

    /// 拼接后的字节长度
    pub fn size(&self) -> u64 {
        let lines: usize = self.content.iter().map(|l| l.len()).sum();
        (lines + self.content.len().saturating_sub(1)) as u64
    }
}

pub(crate) fn split_lines(text: &str) -> Vec<String> {
    text.split('\n').map(String::from).collect()
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── 会话状态 ──────────────────────────────────────────────────────────────────

/// 一次写入产生的状态增量（path → 新记录）
pub type FilesUpdate = BTreeMap<String, FileRecord>;

/// 单个会话的文件映射，由执行上下文持有
///
/// [`EphemeralBackend`](crate::vfs::EphemeralBackend) 只读取快照，
/// 写操作返回 [`FilesUpdate`]，由调用方在步骤之间依次 [`apply`](Self::apply)。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    files: BTreeMap<String, FileRecord>,
}

impl FileState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, text: &str) -> Self {
        self.files.insert(path.into(), FileRecord::new(text));
        self
    }

    pub fn apply(&mut self, update: FilesUpdate) {
        self.files.extend(update);
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// 按路径字典序遍历
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        self.files.iter()
    }
}

// ── 字符串替换 ────────────────────────────────────────────────────────────────

/// 在 `content` 中替换 `old`，返回新内容与替换次数
///
/// 出现 0 次为 `NoMatch`；出现多次且 `replace_all` 为 false 为 `AmbiguousMatch`，
/// 失败时不做任何修改。
pub fn replace_in_content(
    path: &str,
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<(String, usize), FileError> {
    if old.is_empty() {
        return Err(FileError::NoMatch {
            path: path.to_string(),
        });
    }
    let occurrences = content.matches(old).count();
    match occurrences {
        0 => Err(FileError::NoMatch {
            path: path.to_string(),
        }),
        1 => Ok((content.replacen(old, new, 1), 1)),
        n if replace_all => Ok((content.replace(old, new), n)),
        n => Err(FileError::AmbiguousMatch {
            path: path.to_string(),
            occurrences: n,
        }),
    }
}
