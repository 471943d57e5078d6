//! 合成目录
//!
//! 后端都不显式存目录：只要有记录以某前缀开头，该目录就“存在”。
//! 本模块从扁平的条目集合推导某一层的直接子项，所有后端共用。

use crate::vfs::FileInfo;
use std::collections::BTreeMap;

/// 推导 `dir`（以 `/` 结尾）下的直接子项，按路径字典序返回
///
/// 深度恰好在本层的文件原样保留；更深的条目折叠成一个带 `/` 后缀的目录项，
/// 绝不继续向下展开。已带元数据的目录条目（如磁盘的 `read_dir` 结果）优先保留。
pub fn immediate_children<I>(dir: &str, entries: I) -> Vec<FileInfo>
where
    I: IntoIterator<Item = FileInfo>,
{
    let mut children: BTreeMap<String, FileInfo> = BTreeMap::new();
    for entry in entries {
        let Some(rest) = entry.path.strip_prefix(dir) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        match rest.find('/') {
            Some(idx) => {
                let child = format!("{}{}/", dir, &rest[..idx]);
                if entry.is_dir && idx + 1 == rest.len() {
                    children.insert(child, entry);
                } else {
                    children
                        .entry(child.clone())
                        .or_insert_with(|| FileInfo::dir(child));
                }
            }
            None => {
                children.insert(entry.path.clone(), entry);
            }
        }
    }
    children.into_values().collect()
}

/// 是否存在以 `dir` 为前缀的条目（即该目录隐式存在）
pub fn has_descendants<'a, I>(dir: &str, paths: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    paths
        .into_iter()
        .any(|p| p.len() > dir.len() && p.starts_with(dir))
}
