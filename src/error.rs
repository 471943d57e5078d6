use std::fmt;

/// echo-vfs 的统一错误类型
#[derive(Debug)]
pub enum VfsError {
    /// 文件操作错误（封闭集合，调用方按 kind 分支）
    File(FileError),
    /// 持久化 Store 错误
    Store(StoreError),
    /// 配置错误
    Config(ConfigError),
    /// IO 错误
    Io(std::io::Error),
    /// 操作超时（携带操作名）
    Timeout(String),
    /// 操作被取消
    Cancelled,
    /// 其他错误
    Other(String),
}

/// 文件操作错误
///
/// 后端对外暴露的错误种类是封闭的，工具层据此渲染自然语言提示。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileError {
    /// 路径上没有记录
    NotFound(String),
    /// 路径只是一个（合成的）目录
    IsDirectory(String),
    /// 路径非法（穿越、越界等）
    InvalidPath { path: String, reason: String },
    /// 父路径不可用（被文件占据）
    ParentNotFound(String),
    /// 目标已存在，`write` 拒绝覆盖
    AlreadyExists(String),
    /// `old_string` 出现多次且未指定 replace_all
    AmbiguousMatch { path: String, occurrences: usize },
    /// `old_string` 未出现
    NoMatch { path: String },
    /// glob / 正则模式无效
    InvalidPattern { pattern: String, message: String },
}

/// Store 错误
#[derive(Debug)]
pub enum StoreError {
    /// 读写底层文件失败
    IoError(String),
    /// 序列化/反序列化失败
    SerializationError(String),
    /// 存储值无法解析为预期结构
    Corrupt { key: String, message: String },
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),
    /// 配置解析失败
    ParseFailed(String),
    /// 配置值无效
    InvalidValue { field: String, message: String },
}

impl FileError {
    /// 稳定的错误码，便于批量结果按种类归档
    pub fn kind(&self) -> &'static str {
        match self {
            FileError::NotFound(_) => "file_not_found",
            FileError::IsDirectory(_) => "is_directory",
            FileError::InvalidPath { .. } => "invalid_path",
            FileError::ParentNotFound(_) => "parent_not_found",
            FileError::AlreadyExists(_) => "already_exists",
            FileError::AmbiguousMatch { .. } => "ambiguous_match",
            FileError::NoMatch { .. } => "no_match",
            FileError::InvalidPattern { .. } => "invalid_pattern",
        }
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        FileError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// 将针对某个路径的 IO 错误归入封闭集合
    pub fn from_io(path: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => FileError::NotFound(path.to_string()),
            ErrorKind::IsADirectory => FileError::IsDirectory(path.to_string()),
            ErrorKind::NotADirectory => FileError::ParentNotFound(path.to_string()),
            ErrorKind::AlreadyExists => FileError::AlreadyExists(path.to_string()),
            ErrorKind::PermissionDenied => FileError::invalid_path(path, "permission denied"),
            _ => FileError::invalid_path(path, err.to_string()),
        }
    }
}

// 实现 Display trait
impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VfsError::File(e) => write!(f, "File Error: {}", e),
            VfsError::Store(e) => write!(f, "Store Error: {}", e),
            VfsError::Config(e) => write!(f, "Config Error: {}", e),
            VfsError::Io(e) => write!(f, "IO Error: {}", e),
            VfsError::Timeout(op) => write!(f, "Operation '{}' timed out", op),
            VfsError::Cancelled => write!(f, "Operation cancelled"),
            VfsError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileError::NotFound(path) => write!(f, "File '{}' not found", path),
            FileError::IsDirectory(path) => write!(f, "Path '{}' is a directory", path),
            FileError::InvalidPath { path, reason } => {
                write!(f, "Invalid path '{}': {}", path, reason)
            }
            FileError::ParentNotFound(path) => {
                write!(f, "Parent directory of '{}' not found", path)
            }
            FileError::AlreadyExists(path) => write!(f, "File '{}' already exists", path),
            FileError::AmbiguousMatch { path, occurrences } => write!(
                f,
                "String appears {} times in '{}'; use replace_all or a more specific string",
                occurrences, path
            ),
            FileError::NoMatch { path } => write!(f, "String not found in file '{}'", path),
            FileError::InvalidPattern { pattern, message } => {
                write!(f, "Invalid regex pattern '{}': {}", pattern, message)
            }
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::IoError(msg) => write!(f, "IO error: {}", msg),
            StoreError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            StoreError::Corrupt { key, message } => {
                write!(f, "Corrupt value at '{}': {}", key, message)
            }
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseFailed(msg) => write!(f, "Config parse failed: {}", msg),
            ConfigError::InvalidValue { field, message } => {
                write!(f, "Invalid value for '{}': {}", field, message)
            }
        }
    }
}

// 实现 std::error::Error trait
impl std::error::Error for VfsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VfsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for FileError {}
impl std::error::Error for StoreError {}
impl std::error::Error for ConfigError {}

// From 转换
impl From<FileError> for VfsError {
    fn from(err: FileError) -> Self {
        VfsError::File(err)
    }
}

impl From<StoreError> for VfsError {
    fn from(err: StoreError) -> Self {
        VfsError::Store(err)
    }
}

impl From<ConfigError> for VfsError {
    fn from(err: ConfigError) -> Self {
        VfsError::Config(err)
    }
}

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        VfsError::Io(err)
    }
}

impl From<serde_json::Error> for VfsError {
    fn from(err: serde_json::Error) -> Self {
        VfsError::Store(StoreError::SerializationError(err.to_string()))
    }
}

impl From<serde_yaml::Error> for VfsError {
    fn from(err: serde_yaml::Error) -> Self {
        VfsError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

impl VfsError {
    /// 若为文件错误则返回其引用，便于调用方按种类分支
    pub fn as_file_error(&self) -> Option<&FileError> {
        match self {
            VfsError::File(e) => Some(e),
            _ => None,
        }
    }

    /// 批量操作的单项错误：非文件错误（Store 故障、超时等）按路径归入 `InvalidPath`
    pub fn to_item_error(&self, path: &str) -> FileError {
        match self {
            VfsError::File(e) => e.clone(),
            other => FileError::invalid_path(path, other.to_string()),
        }
    }
}

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_error_kind_codes() {
        assert_eq!(FileError::NotFound("/a".into()).kind(), "file_not_found");
        assert_eq!(
            FileError::invalid_path("/../a", "path traversal not allowed").kind(),
            "invalid_path"
        );
        assert_eq!(
            FileError::AmbiguousMatch {
                path: "/a".into(),
                occurrences: 2
            }
            .kind(),
            "ambiguous_match"
        );
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(
            FileError::from_io("/x", &err),
            FileError::NotFound("/x".into())
        );
        let err = std::io::Error::from(std::io::ErrorKind::AlreadyExists);
        assert_eq!(
            FileError::from_io("/x", &err),
            FileError::AlreadyExists("/x".into())
        );
    }

    #[test]
    fn test_display_mentions_key_phrases() {
        assert!(FileError::NotFound("/a".into()).to_string().contains("not found"));
        assert!(
            FileError::AlreadyExists("/a".into())
                .to_string()
                .contains("already exists")
        );
        let e = FileError::InvalidPattern {
            pattern: "[".into(),
            message: "unclosed".into(),
        };
        assert!(e.to_string().contains("Invalid regex pattern"));
        let wrapped: VfsError = e.clone().into();
        assert_eq!(wrapped.as_file_error(), Some(&e));
    }
}
