//! glob / grep 共用实现
//!
//! 三种后端枚举文件的方式各不相同（内存映射、分页扫描、目录遍历），
//! 但匹配语义统一在这里：
//!
//! | 语法 | 含义 |
//! |------|------|
//! | `*` | 段内任意字符（不跨 `/`） |
//! | `?` | 段内单个字符 |
//! | `[a-z]` / `[!x]` | 字符类 |
//! | `**` | 零个或多个完整路径段 |
//! | `{a,b}` | 备选（可嵌套），匹配前展开 |
//!
//! 模式总是相对于搜索目录求值，开头的 `/` 会被忽略。

use crate::error::FileError;
use crate::vfs::{FileInfo, GrepMatch, GrepOutputMode};
use regex::Regex;
use std::collections::BTreeMap;

/// 单个模式每次匹配允许的最大步数，防止病态模式拖垮调用方
const MAX_MATCH_STEPS: usize = 100_000;
/// 花括号展开后的备选上限
const MAX_ALTERNATIVES: usize = 1024;

pub const NO_MATCHES: &str = "No matches found";

// ── GlobPattern ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Globstar,
    Pattern(Vec<char>),
}

/// 预编译的 glob 模式
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    alternatives: Vec<Vec<Segment>>,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, FileError> {
        let trimmed = pattern.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(FileError::InvalidPattern {
                pattern: pattern.to_string(),
                message: "empty glob pattern".to_string(),
            });
        }
        let expanded = expand_braces(trimmed);
        if expanded.len() > MAX_ALTERNATIVES {
            return Err(FileError::InvalidPattern {
                pattern: pattern.to_string(),
                message: format!("brace expansion exceeds {} alternatives", MAX_ALTERNATIVES),
            });
        }
        let alternatives = expanded.iter().map(|alt| parse_segments(alt)).collect();
        Ok(Self {
            source: trimmed.to_string(),
            alternatives,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// 匹配相对路径（以 `/` 分段）
    pub fn is_match(&self, relative: &str) -> bool {
        let parts: Vec<&str> = relative.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return false;
        }
        let mut budget = MAX_MATCH_STEPS;
        self.alternatives
            .iter()
            .any(|segments| match_segments(segments, &parts, &mut budget))
    }

    /// 含 `**` 时需要遍历整棵子树
    pub fn is_recursive(&self) -> bool {
        self.alternatives
            .iter()
            .any(|segs| segs.contains(&Segment::Globstar))
    }

    /// 非递归模式能触及的最大深度，用于限制目录遍历
    pub fn max_depth(&self) -> Option<usize> {
        if self.is_recursive() {
            return None;
        }
        self.alternatives.iter().map(Vec::len).max()
    }

    /// grep 的过滤器：不含 `/` 时只比对文件名
    pub fn matches_file(&self, relative: &str) -> bool {
        if self.source.contains('/') {
            self.is_match(relative)
        } else {
            let name = relative.rsplit('/').next().unwrap_or(relative);
            self.is_match(name)
        }
    }
}

fn parse_segments(pattern: &str) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    for part in pattern.split('/').filter(|p| !p.is_empty()) {
        if part == "**" {
            if segments.last() != Some(&Segment::Globstar) {
                segments.push(Segment::Globstar);
            }
        } else {
            segments.push(Segment::Pattern(part.chars().collect()));
        }
    }
    segments
}

fn match_segments(segments: &[Segment], parts: &[&str], budget: &mut usize) -> bool {
    if *budget == 0 {
        return false;
    }
    *budget -= 1;
    match segments.split_first() {
        None => parts.is_empty(),
        Some((Segment::Globstar, rest)) => {
            (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..], &mut *budget))
        }
        Some((Segment::Pattern(pattern), rest)) => match parts.split_first() {
            Some((head, tail)) => {
                let text: Vec<char> = head.chars().collect();
                match_segment(pattern, &text, budget) && match_segments(rest, tail, budget)
            }
            None => false,
        },
    }
}

/// 单段匹配：`*` 回溯采用“记住最近一个星号”的迭代法
fn match_segment(pattern: &[char], text: &[char], budget: &mut usize) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if *budget == 0 {
            return false;
        }
        *budget -= 1;

        let advanced = match pattern.get(p).copied() {
            Some('*') => {
                star = Some((p, t));
                p += 1;
                continue;
            }
            Some('?') => Some(1),
            Some('[') => match parse_class(&pattern[p..], text[t]) {
                Some((true, consumed)) => Some(consumed),
                Some((false, _)) => None,
                None if text[t] == '[' => Some(1),
                None => None,
            },
            Some('\\') if p + 1 < pattern.len() => (pattern[p + 1] == text[t]).then_some(2),
            Some(c) => (c == text[t]).then_some(1),
            None => None,
        };

        match advanced {
            Some(step) => {
                p += step;
                t += 1;
            }
            None => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// 解析 `[...]`，返回（是否命中, 消耗的模式字符数）；未闭合返回 None
fn parse_class(pattern: &[char], ch: char) -> Option<(bool, usize)> {
    let mut idx = 1;
    let negate = matches!(pattern.get(idx), Some('!') | Some('^'));
    if negate {
        idx += 1;
    }
    let first = idx;
    let mut matched = false;

    while idx < pattern.len() {
        let c = pattern[idx];
        if c == ']' && idx > first {
            return Some((matched != negate, idx + 1));
        }
        if idx + 2 < pattern.len() && pattern[idx + 1] == '-' && pattern[idx + 2] != ']' {
            if (c..=pattern[idx + 2]).contains(&ch) {
                matched = true;
            }
            idx += 3;
            continue;
        }
        if c == ch {
            matched = true;
        }
        idx += 1;
    }
    None
}

/// 展开花括号备选，支持嵌套；无逗号的 `{x}` 视为字面量
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut depth = 0usize;
    let mut open = None;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '{' => {
                if depth == 0 {
                    open = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(start) = open.take()
                {
                    let inner: String = chars[start + 1..i].iter().collect();
                    let alternatives = split_alternatives(&inner);
                    if alternatives.len() > 1 {
                        let prefix: String = chars[..start].iter().collect();
                        let suffix: String = chars[i + 1..].iter().collect();
                        let mut expanded = Vec::new();
                        for alt in alternatives {
                            expanded.extend(expand_braces(&format!("{prefix}{alt}{suffix}")));
                            if expanded.len() > MAX_ALTERNATIVES {
                                break;
                            }
                        }
                        return expanded;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    vec![pattern.to_string()]
}

fn split_alternatives(content: &str) -> Vec<String> {
    let mut alternatives = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in content.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => alternatives.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    alternatives.push(current);
    alternatives
}

/// 在扁平条目上执行 glob：只考虑 `dir` 之下的条目，按路径排序
pub fn glob_entries<I>(pattern: &GlobPattern, dir: &str, entries: I) -> Vec<FileInfo>
where
    I: IntoIterator<Item = FileInfo>,
{
    let mut hits: Vec<FileInfo> = entries
        .into_iter()
        .filter(|info| !info.is_dir)
        .filter(|info| {
            info.path
                .strip_prefix(dir)
                .is_some_and(|relative| pattern.is_match(relative))
        })
        .collect();
    hits.sort_by(|a, b| a.path.cmp(&b.path));
    hits
}

// ── grep ─────────────────────────────────────────────────────────────────────

pub fn compile_regex(pattern: &str) -> Result<Regex, FileError> {
    Regex::new(pattern).map_err(|e| FileError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// 对一个文件的各行执行正则，行号从 1 开始
pub fn grep_lines<'a, I>(path: &str, lines: I, regex: &Regex) -> Vec<GrepMatch>
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .enumerate()
        .filter(|(_, line)| regex.is_match(line))
        .map(|(idx, line)| GrepMatch {
            path: path.to_string(),
            line: idx + 1,
            text: line.to_string(),
        })
        .collect()
}

/// 将原始匹配渲染为按模式组织的行
pub fn render_grep(matches: &[GrepMatch], mode: GrepOutputMode) -> Vec<String> {
    if matches.is_empty() {
        return vec![NO_MATCHES.to_string()];
    }
    let mut grouped: BTreeMap<&str, Vec<&GrepMatch>> = BTreeMap::new();
    for m in matches {
        grouped.entry(m.path.as_str()).or_default().push(m);
    }
    match mode {
        GrepOutputMode::FilesWithMatches => grouped.keys().map(|p| p.to_string()).collect(),
        GrepOutputMode::Count => grouped
            .iter()
            .map(|(path, hits)| format!("{}: {}", path, hits.len()))
            .collect(),
        GrepOutputMode::Content => {
            let mut out = Vec::new();
            for (path, hits) in grouped {
                out.push(format!("{}:", path));
                out.extend(hits.iter().map(|m| format!("  {}: {}", m.line, m.text)));
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(p: &str) -> GlobPattern {
        GlobPattern::new(p).unwrap()
    }

    #[test]
    fn test_star_stays_in_segment() {
        let pattern = glob("*.py");
        assert!(pattern.is_match("main.py"));
        assert!(!pattern.is_match("src/main.py"));
        assert!(!pattern.is_recursive());
        assert_eq!(pattern.max_depth(), Some(1));
    }

    #[test]
    fn test_globstar() {
        let pattern = glob("**/*.py");
        assert!(pattern.is_match("main.py"));
        assert!(pattern.is_match("src/utils/helper.py"));
        assert!(!pattern.is_match("src/readme.md"));
        assert!(pattern.is_recursive());
        assert_eq!(pattern.max_depth(), None);

        let mid = glob("src/**/test_*.rs");
        assert!(mid.is_match("src/test_a.rs"));
        assert!(mid.is_match("src/a/b/test_b.rs"));
        assert!(!mid.is_match("lib/test_a.rs"));
    }

    #[test]
    fn test_braces() {
        assert_eq!(expand_braces("*.{py,pyi}"), vec!["*.py", "*.pyi"]);
        assert_eq!(
            expand_braces("{a,b{c,d}}.txt"),
            vec!["a.txt", "bc.txt", "bd.txt"]
        );
        assert_eq!(expand_braces("{solo}.txt"), vec!["{solo}.txt"]);
        let pattern = glob("*.{py,pyi}");
        assert!(pattern.is_match("types.pyi"));
        assert!(pattern.is_match("main.py"));
        assert!(!pattern.is_match("main.rs"));
    }

    #[test]
    fn test_classes_and_escapes() {
        assert!(glob("file[0-9].txt").is_match("file7.txt"));
        assert!(!glob("file[!0-9].txt").is_match("file7.txt"));
        assert!(glob("a?c").is_match("abc"));
        assert!(glob("lit\\*").is_match("lit*"));
        assert!(!glob("lit\\*").is_match("litx"));
        assert!(glob("[abc").is_match("[abc"));
    }

    #[test]
    fn test_leading_slash_ignored_and_empty_rejected() {
        assert!(glob("/*.md").is_match("readme.md"));
        assert!(matches!(
            GlobPattern::new("/"),
            Err(FileError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_pathological_pattern_is_bounded() {
        let pattern = glob(&"*a".repeat(30));
        let text = "a".repeat(60) + "b";
        assert!(!pattern.is_match(&text));
    }

    #[test]
    fn test_glob_entries_relative_to_dir() {
        let entries = vec![
            FileInfo::file("/src/main.py", 1, None),
            FileInfo::file("/src/lib/util.py", 1, None),
            FileInfo::file("/test.py", 1, None),
        ];
        let hits = glob_entries(&glob("*.py"), "/src/", entries.clone());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/src/main.py");

        let all = glob_entries(&glob("**/*.py"), "/", entries);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].path, "/src/lib/util.py");
    }

    #[test]
    fn test_file_filter_matches_name_only() {
        let filter = glob("*.py");
        assert!(filter.matches_file("deep/nested/x.py"));
        let scoped = glob("src/*.py");
        assert!(!scoped.matches_file("lib/x.py"));
        assert!(scoped.matches_file("src/x.py"));
    }

    #[test]
    fn test_invalid_regex() {
        let err = compile_regex("[unclosed").unwrap_err();
        assert_eq!(err.kind(), "invalid_pattern");
        assert!(err.to_string().contains("Invalid regex pattern"));
    }

    #[test]
    fn test_render_modes() {
        let regex = compile_regex("import").unwrap();
        let matches = grep_lines("/test.py", ["import os", "x = 1", "import sys"], &regex);
        assert_eq!(matches.len(), 2);

        let files = render_grep(&matches, GrepOutputMode::FilesWithMatches);
        assert_eq!(files, vec!["/test.py"]);

        let count = render_grep(&matches, GrepOutputMode::Count);
        assert_eq!(count, vec!["/test.py: 2"]);

        let content = render_grep(&matches, GrepOutputMode::Content).join("\n");
        assert!(content.contains("/test.py:"));
        assert!(content.contains("1: import os"));
        assert!(content.contains("3: import sys"));

        assert_eq!(render_grep(&[], GrepOutputMode::Content), vec![NO_MATCHES]);
    }
}
