//! echo-vfs —— 磁盘工作区检查工具
//!
//! 以与 Agent 工具层相同的视角（行号、预算截断、合成目录）查看一个目录：
//!
//! ```bash
//! echo-vfs --root ./workspace --virtual ls /
//! echo-vfs --root ./workspace --virtual read /notes.md --offset 0 --limit 50
//! echo-vfs --root ./workspace --virtual grep "TODO" --glob "*.rs" --mode content
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use echo_vfs::config::StorageConfig;
use echo_vfs::error::Result;
use echo_vfs::vfs::{Backend, DiskBackend, GrepOutputMode};
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "echo-vfs", version, about = "Inspect a workspace through the virtual file layer")]
struct Cli {
    /// 根目录（覆盖配置文件与 ECHO_VFS_ROOT）
    #[arg(long, env = "ECHO_VFS_ROOT")]
    root: Option<PathBuf>,

    /// 虚拟模式：`/x` 映射到 `<root>/x`
    #[arg(long = "virtual")]
    virtual_mode: bool,

    /// YAML 配置文件
    #[arg(long, short)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 列出直接子项
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// 带行号读取文件
    Read {
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// 按 glob 查找文件
    Glob {
        pattern: String,
        #[arg(long, default_value = "/")]
        path: String,
    },
    /// 按正则搜索内容
    Grep {
        pattern: String,
        #[arg(long, default_value = "/")]
        path: String,
        #[arg(long)]
        glob: Option<String>,
        #[arg(long, value_enum, default_value_t = Mode::Files)]
        mode: Mode,
    },
    /// 新建文件（已存在时失败）
    Write { path: String, content: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Files,
    Content,
    Count,
}

impl From<Mode> for GrepOutputMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Files => GrepOutputMode::FilesWithMatches,
            Mode::Content => GrepOutputMode::Content,
            Mode::Count => GrepOutputMode::Count,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "echo_vfs=info".into()))
        .init();

    let mut config = match &cli.config {
        Some(path) => StorageConfig::load(path)?,
        None => StorageConfig::from_env()?,
    };
    if let Some(root) = cli.root {
        config = config.disk_root(root);
    }
    if cli.virtual_mode {
        config = config.virtual_mode(true);
    }
    debug!(?config, "配置已加载");

    let fs = DiskBackend::from_config(&config)?;
    let lines = match cli.command {
        Command::Ls { path } => fs.ls(&path).await?,
        Command::Read { path, offset, limit } => vec![fs.read(&path, offset, limit).await?],
        Command::Glob { pattern, path } => fs.glob(&pattern, &path).await?,
        Command::Grep {
            pattern,
            path,
            glob,
            mode,
        } => fs.grep(&pattern, &path, glob.as_deref(), mode.into()).await?,
        Command::Write { path, content } => {
            let written = fs.write(&path, &content).await?;
            vec![format!("✅ 已写入 {}", written.path)]
        }
    };

    for line in lines {
        println!("{}", line);
    }
    Ok(())
}
