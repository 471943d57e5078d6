//! 输出渲染与预算截断
//!
//! token 估算沿用 `字符数 / 4` 的近似。

use crate::config::StorageConfig;
use crate::vfs::record::FileRecord;

/// 单次结果的近似 token 上限
pub const TOOL_RESULT_TOKEN_LIMIT: usize = 20_000;
/// 每 token 的近似字符数
pub const CHARS_PER_TOKEN: usize = 4;
/// `read` 未给出 limit 时的行数
pub const DEFAULT_READ_LIMIT: usize = 2000;
/// 单行显示宽度上限，超出部分按续行输出
pub const MAX_LINE_LENGTH: usize = 10_000;
/// 行号列宽
const LINE_NUMBER_WIDTH: usize = 6;

pub const TRUNCATION_GUIDANCE: &str =
    "... [results truncated, try being more specific with your parameters]";

/// 后端输出预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimits {
    pub token_limit: usize,
    pub default_read_limit: usize,
    pub max_line_length: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            token_limit: TOOL_RESULT_TOKEN_LIMIT,
            default_read_limit: DEFAULT_READ_LIMIT,
            max_line_length: MAX_LINE_LENGTH,
        }
    }
}

impl OutputLimits {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            token_limit: config.budget.token_limit,
            default_read_limit: config.read.default_limit,
            max_line_length: config.read.max_line_length,
        }
    }

    /// 渲染 `read` 结果：窗口截取、行号、超长行续行，最后做预算截断
    pub fn render_read(&self, record: &FileRecord, offset: usize, limit: Option<usize>) -> String {
        let limit = limit.unwrap_or(self.default_read_limit);
        let text = format_read_response(record, offset, limit, self.max_line_length);
        truncate_text(text, self.token_limit)
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// 带行号渲染，`start_line` 为首行的 1-based 行号
///
/// 超长行拆成 `n`、`n.1`、`n.2`… 多段，每段不超过 `max_line_length` 字符。
pub fn format_with_line_numbers(
    lines: &[String],
    start_line: usize,
    max_line_length: usize,
) -> String {
    let width = max_line_length.max(1);
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let number = start_line + i;
        if line.chars().count() <= width {
            out.push(format!("{:>w$}\t{}", number, line, w = LINE_NUMBER_WIDTH));
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        for (k, chunk) in chars.chunks(width).enumerate() {
            let chunk: String = chunk.iter().collect();
            let label = if k == 0 {
                number.to_string()
            } else {
                format!("{}.{}", number, k)
            };
            out.push(format!("{:>w$}\t{}", label, chunk, w = LINE_NUMBER_WIDTH));
        }
    }
    out.join("\n")
}

/// 按 0-based `offset` 与 `limit` 截取记录并渲染
///
/// 空文件或 offset 越界返回空串。
pub fn format_read_response(
    record: &FileRecord,
    offset: usize,
    limit: usize,
    max_line_length: usize,
) -> String {
    if record.is_empty() || offset >= record.content.len() {
        return String::new();
    }
    let end = offset.saturating_add(limit).min(record.content.len());
    format_with_line_numbers(&record.content[offset..end], offset + 1, max_line_length)
}

/// 字符串结果超出预算时截断并追加提示
pub fn truncate_text(text: String, token_limit: usize) -> String {
    let budget = token_limit.saturating_mul(CHARS_PER_TOKEN);
    if text.chars().count() <= budget {
        return text;
    }
    let mut cut: String = text.chars().take(budget).collect();
    cut.push('\n');
    cut.push_str(TRUNCATION_GUIDANCE);
    cut
}

/// 列表结果超出预算时保留前缀并以提示作为最后一项
pub fn truncate_lines(items: Vec<String>, token_limit: usize) -> Vec<String> {
    let budget = token_limit.saturating_mul(CHARS_PER_TOKEN);
    let total: usize = items.iter().map(|s| s.chars().count() + 1).sum();
    if total <= budget {
        return items;
    }
    let mut used = 0;
    let mut kept = Vec::new();
    for item in items {
        used += item.chars().count() + 1;
        if used > budget {
            break;
        }
        kept.push(item);
    }
    kept.push(TRUNCATION_GUIDANCE.to_string());
    kept
}
