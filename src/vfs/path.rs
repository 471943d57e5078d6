//! 虚拟路径校验与规范化
//!
//! | 输入 | 结果 |
//! |------|------|
//! | `foo/bar` | `/foo/bar` |
//! | `/./foo//bar` | `/foo/bar` |
//! | `C:\\data` | `InvalidPath` |
//! | `/../etc` / `~/x` | `InvalidPath` |

use crate::error::FileError;

/// 校验并规范化虚拟路径，返回不带末尾 `/` 的形式（根目录为 `/`）
pub fn normalize_virtual_path(path: &str) -> Result<String, FileError> {
    let unified = path.replace('\\', "/");

    if unified.trim().is_empty() {
        return Err(FileError::invalid_path(path, "path is empty"));
    }
    if unified.starts_with('~') {
        return Err(FileError::invalid_path(path, "path traversal not allowed"));
    }
    if is_windows_absolute(&unified) {
        return Err(FileError::invalid_path(
            path,
            "windows absolute paths are not supported",
        ));
    }
    if unified.contains('\0') {
        return Err(FileError::invalid_path(path, "path contains a null byte"));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(FileError::invalid_path(path, "path traversal not allowed")),
            s => segments.push(s),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// 目录查询形式：`/dir` 与 `/dir/` 都变成 `/dir/`，根目录为 `/`
pub fn directory_prefix(path: &str) -> Result<String, FileError> {
    let normalized = normalize_virtual_path(path)?;
    Ok(as_dir(&normalized))
}

pub(crate) fn as_dir(normalized: &str) -> String {
    if normalized.ends_with('/') {
        normalized.to_string()
    } else {
        format!("{}/", normalized)
    }
}

/// `path` 的所有真祖先（不含根）
pub(crate) fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .map(|(idx, _)| idx)
        .filter(|&idx| idx > 0)
        .map(move |idx| &path[..idx])
}

fn is_windows_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// 将 tool call id 转为安全的文件名
pub fn sanitize_tool_call_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' | '.' | '\0' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize_virtual_path("/a/b.txt").unwrap(), "/a/b.txt");
        assert_eq!(normalize_virtual_path("a/b.txt").unwrap(), "/a/b.txt");
        assert_eq!(normalize_virtual_path("/./a//b/").unwrap(), "/a/b");
        assert_eq!(normalize_virtual_path("\\a\\b").unwrap(), "/a/b");
        assert_eq!(normalize_virtual_path("/").unwrap(), "/");
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        for bad in ["/../etc/passwd", "/a/../../b", "~/secret", "../x"] {
            let err = normalize_virtual_path(bad).unwrap_err();
            assert_eq!(err.kind(), "invalid_path", "{bad}");
            assert!(err.to_string().contains("traversal"), "{bad}");
        }
    }

    #[test]
    fn test_normalize_rejects_windows_and_empty() {
        assert!(normalize_virtual_path("C:\\Users\\x").is_err());
        assert!(normalize_virtual_path("d:/data").is_err());
        assert!(normalize_virtual_path("").is_err());
    }

    #[test]
    fn test_directory_prefix() {
        assert_eq!(directory_prefix("/dir").unwrap(), "/dir/");
        assert_eq!(directory_prefix("/dir/").unwrap(), "/dir/");
        assert_eq!(directory_prefix("/").unwrap(), "/");
    }

    #[test]
    fn test_ancestors() {
        let list: Vec<&str> = ancestors("/a/b/c.txt").collect();
        assert_eq!(list, vec!["/a", "/a/b"]);
        assert_eq!(ancestors("/top.txt").count(), 0);
    }

    #[test]
    fn test_sanitize_tool_call_id() {
        assert_eq!(sanitize_tool_call_id("call/1.2\0x"), "call_1_2_x");
        assert_eq!(sanitize_tool_call_id("abc-123"), "abc-123");
    }
}
