use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;

use crate::cli::*;
use crate::kdtree::KdTreeOptions;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let path = ProjectDirs::from("", "", "imknn")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".imknn"));
    ConfDir { path }
});

pub const DEFAULT_COMPONENTS: usize = 1024;
pub const DEFAULT_MAX_SAMPLES: usize = 50_000;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_SUFFIX: &str = "jpg,jpeg,png,gif";
pub const DEFAULT_COUNT: usize = 20;

#[derive(Parser, Debug, Clone)]
pub struct PcaOptions {
    /// 保留的主成分数量，超过输入维度或样本数时会被自动缩小
    #[arg(short = 'p', long, value_name = "P", default_value_t = DEFAULT_COMPONENTS)]
    pub components: usize,
    /// 训练 PCA 时最多使用的样本数量
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_SAMPLES)]
    pub max_samples: usize,
    /// 抽样使用的随机种子
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,
}

impl Default for PcaOptions {
    fn default() -> Self {
        Self { components: DEFAULT_COMPONENTS, max_samples: DEFAULT_MAX_SAMPLES, seed: DEFAULT_SEED }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ScanOptions {
    /// 扫描的文件后缀名，多个后缀用逗号分隔，不区分大小写
    #[arg(short, long, default_value = DEFAULT_SUFFIX)]
    pub suffix: String,
    /// 最多添加的图片数量
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self { suffix: DEFAULT_SUFFIX.to_string(), limit: None }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 显示的结果数量
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_COUNT)]
    pub count: usize,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { count: DEFAULT_COUNT, output_format: OutputFormat::Table }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

/// 构建索引所需的全部参数
#[derive(Debug, Clone, Default)]
pub struct IndexConfig {
    pub pca: PcaOptions,
    pub kdtree: KdTreeOptions,
    pub scan: ScanOptions,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "imknn", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// imknn 数据目录
    #[arg(short, long, default_value_t = CONF_DIR.clone())]
    pub conf_dir: ConfDir,
    /// 并行计算使用的线程数，默认为 CPU 核心数
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 扫描目录并将图片添加到数据库
    Add(AddCommand),
    /// 根据已保存的特征重新构建 KD 树
    Build(BuildCommand),
    /// 从数据库中搜索相似图片
    Search(SearchCommand),
    /// 随机选取一张已添加的图片进行搜索
    Sample(SampleCommand),
    /// 显示数据库信息
    Show(ShowCommand),
    /// 导出投影后的特征矩阵
    Export(ExportCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回特征文件的路径
    pub fn features(&self) -> PathBuf {
        self.path.join("features.dat")
    }

    /// 返回 KD 树文件的路径
    pub fn kdtree(&self) -> PathBuf {
        self.path.join("kdtree.bin")
    }
}

impl std::fmt::Display for ConfDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}
