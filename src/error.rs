use std::path::PathBuf;

use thiserror::Error;

/// imknn 中所有可能出现的错误
#[derive(Debug, Error)]
pub enum Error {
    /// 向量长度与 D 或 P 不一致
    #[error("向量维度不匹配: 期望 {expected}，实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 训练 PCA 的样本数量少于主成分数量
    #[error("样本数量不足: 至少需要 {required} 个，实际 {actual} 个")]
    InsufficientSamples { required: usize, actual: usize },

    /// 主成分数量为 0 或大于输入维度
    #[error("无效的主成分数量 {requested}，输入维度为 {dim}")]
    InvalidComponents { requested: usize, dim: usize },

    #[error("PCA 尚未训练")]
    NotFitted,

    #[error("索引为空")]
    EmptyIndex,

    #[error("无效的 k 值: {0}")]
    InvalidK(usize),

    #[error("下标越界: {0}")]
    IndexOutOfRange(usize),

    #[error("图片已存在: {0}")]
    DuplicateKey(String),

    /// PCA 状态内部不一致
    #[error("PCA 状态损坏: {0}")]
    CorruptState(String),

    /// 持久化文件结构不一致
    #[error("文件损坏: {0}")]
    CorruptFile(String),

    #[error("文件不存在: {}", .0.display())]
    FileNotFound(PathBuf),

    /// 单张图片的特征提取失败
    #[error("特征提取失败 {path}: {reason}")]
    Encoding { path: String, reason: String },

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 构造 CorruptFile 错误
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptFile(msg.into())
    }

    /// 打开文件时，将 NotFound 转换为 FileNotFound
    pub(crate) fn from_open(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound(path.into()),
            _ => Self::Io(err),
        }
    }
}
