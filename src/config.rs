//! 存储层配置
//!
//! 支持两种来源：
//!
//! - YAML 文件：[`StorageConfig::load`]
//! - 环境变量（自动读取 `.env`）：[`StorageConfig::from_env`]
//!
//! ```yaml
//! budget:
//!   token_limit: 20000
//! store:
//!   assistant_id: alice
//!   page_size: 100
//! disk:
//!   root: /tmp/workspace
//!   virtual_mode: true
//! eviction:
//!   token_limit: 20000
//! ```
//!
//! 环境变量：
//!
//! | 变量 | 字段 |
//! |------|------|
//! | `ECHO_VFS_ROOT` | `disk.root` |
//! | `ECHO_VFS_VIRTUAL_MODE` | `disk.virtual_mode` |
//! | `ECHO_VFS_ASSISTANT_ID` | `store.assistant_id` |
//! | `ECHO_VFS_TOKEN_LIMIT` | `budget.token_limit` / `eviction.token_limit` |
//! | `ECHO_VFS_IO_TIMEOUT_MS` | `disk.io_timeout_ms` |

use crate::error::{ConfigError, Result};
use crate::vfs::format::{DEFAULT_READ_LIMIT, MAX_LINE_LENGTH, TOOL_RESULT_TOKEN_LIMIT};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 读操作的输出预算
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// 单次结果允许的近似 token 数（字符数 / 4）
    pub token_limit: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            token_limit: TOOL_RESULT_TOKEN_LIMIT,
        }
    }
}

/// `read` 的默认窗口与行宽
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    pub default_limit: usize,
    pub max_line_length: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_READ_LIMIT,
            max_line_length: MAX_LINE_LENGTH,
        }
    }
}

/// 持久化 Store 后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 所属实体 ID；为空时命名空间为 `("filesystem",)`
    pub assistant_id: Option<String>,
    /// 分页扫描的每页条数
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            assistant_id: None,
            page_size: 100,
        }
    }
}

/// 磁盘后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// 根目录（None 表示当前工作目录）
    pub root: Option<PathBuf>,
    /// 虚拟模式：`/x` 映射到 `<root>/x`
    pub virtual_mode: bool,
    /// grep 跳过超过该大小的文件
    pub max_grep_file_size_mb: u64,
    /// 阻塞 IO 线程并发上限
    pub io_concurrency: usize,
    /// 单次磁盘操作超时（毫秒，0 表示不限）
    pub io_timeout_ms: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            root: None,
            virtual_mode: false,
            max_grep_file_size_mb: 10,
            io_concurrency: 8,
            io_timeout_ms: 30_000,
        }
    }
}

/// 大结果驱逐配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub token_limit: usize,
    /// 自身已做截断的工具，结果不驱逐
    pub excluded_tools: Vec<String>,
    pub preview_lines: usize,
    pub preview_line_chars: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            token_limit: TOOL_RESULT_TOKEN_LIMIT,
            excluded_tools: ["ls", "glob", "grep", "read_file", "edit_file", "write_file"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            preview_lines: 10,
            preview_line_chars: 1000,
        }
    }
}

impl EvictionConfig {
    pub fn token_limit(mut self, limit: usize) -> Self {
        self.token_limit = limit;
        self
    }

    pub fn exclude_tool(mut self, name: impl Into<String>) -> Self {
        self.excluded_tools.push(name.into());
        self
    }
}

/// 存储层总配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub budget: BudgetConfig,
    pub read: ReadConfig,
    pub store: StoreConfig,
    pub disk: DiskConfig,
    pub eviction: EvictionConfig,
}

impl StorageConfig {
    pub fn load(path: &str) -> Result<Self> {
        let file =
            std::fs::File::open(path).map_err(|_| ConfigError::FileNotFound(path.to_string()))?;
        let config: StorageConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// 在默认值基础上叠加 `ECHO_VFS_*` 环境变量
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::default().apply_env(std::env::vars())
    }

    fn apply_env(mut self, vars: impl Iterator<Item = (String, String)>) -> Result<Self> {
        for (key, value) in vars {
            match key.as_str() {
                "ECHO_VFS_ROOT" => self.disk.root = Some(PathBuf::from(value)),
                "ECHO_VFS_VIRTUAL_MODE" => {
                    self.disk.virtual_mode = parse_env(&key, &value)?;
                }
                "ECHO_VFS_ASSISTANT_ID" => {
                    self.store.assistant_id = Some(value).filter(|v| !v.is_empty());
                }
                "ECHO_VFS_TOKEN_LIMIT" => {
                    let limit: usize = parse_env(&key, &value)?;
                    self.budget.token_limit = limit;
                    self.eviction.token_limit = limit;
                }
                "ECHO_VFS_IO_TIMEOUT_MS" => self.disk.io_timeout_ms = parse_env(&key, &value)?,
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.store.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.page_size".to_string(),
                message: "must be greater than 0".to_string(),
            }
            .into());
        }
        if self.read.max_line_length == 0 {
            return Err(ConfigError::InvalidValue {
                field: "read.max_line_length".to_string(),
                message: "must be greater than 0".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn disk_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.disk.root = Some(root.into());
        self
    }

    pub fn virtual_mode(mut self, enabled: bool) -> Self {
        self.disk.virtual_mode = enabled;
        self
    }

    pub fn assistant_id(mut self, id: impl Into<String>) -> Self {
        self.store.assistant_id = Some(id.into());
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::InvalidValue {
            field: key.to_string(),
            message: format!("cannot parse '{}'", value),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.budget.token_limit, 20_000);
        assert_eq!(config.read.default_limit, 2000);
        assert_eq!(config.store.page_size, 100);
        assert!(!config.disk.virtual_mode);
        assert!(config.eviction.excluded_tools.contains(&"grep".to_string()));
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "store:\n  assistant_id: alice\ndisk:\n  root: /tmp/ws\n  virtual_mode: true\n"
        )
        .unwrap();
        let config = StorageConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.store.assistant_id.as_deref(), Some("alice"));
        assert_eq!(config.store.page_size, 100);
        assert_eq!(config.disk.root, Some(PathBuf::from("/tmp/ws")));
        assert!(config.disk.virtual_mode);
    }

    #[test]
    fn test_load_missing_file() {
        let err = StorageConfig::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, crate::error::VfsError::Config(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("ECHO_VFS_TOKEN_LIMIT".to_string(), "500".to_string()),
            ("ECHO_VFS_VIRTUAL_MODE".to_string(), "true".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let config = StorageConfig::default().apply_env(vars.into_iter()).unwrap();
        assert_eq!(config.budget.token_limit, 500);
        assert_eq!(config.eviction.token_limit, 500);
        assert!(config.disk.virtual_mode);
    }

    #[test]
    fn test_env_bad_value() {
        let vars = vec![("ECHO_VFS_TOKEN_LIMIT".to_string(), "lots".to_string())];
        assert!(StorageConfig::default().apply_env(vars.into_iter()).is_err());
    }
}
