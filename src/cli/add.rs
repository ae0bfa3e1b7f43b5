use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::config::{IndexConfig, Opts, PcaOptions, ScanOptions};
use crate::encoder::{Encoder, EncoderOptions, ThumbnailEncoder};
use crate::imdb::IMDB;
use crate::kdtree::KdTreeOptions;

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub scan: ScanOptions,
    #[command(flatten)]
    pub pca: PcaOptions,
    #[command(flatten)]
    pub kdtree: KdTreeOptions,
    #[command(flatten)]
    pub encoder: EncoderOptions,
    /// 图片所在目录
    pub path: PathBuf,
    /// 使用全部图片重新训练 PCA，否则沿用已有的 PCA 投影新图片
    #[arg(long)]
    pub refit: bool,
}

impl SubCommandExtend for AddCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let encoder = ThumbnailEncoder::from(&self.encoder);
        let mut db = if opts.conf_dir.features().exists() {
            IMDB::open(&opts.conf_dir, &self.kdtree)?
        } else {
            IMDB::new()
        };

        if let Some(dim) = db.pca().input_dim() {
            if dim != encoder.dimension() && !self.refit {
                bail!(
                    "特征维度 {} 与数据库中的 {} 不一致，请使用相同的 --thumbnail-size 或指定 --refit",
                    encoder.dimension(),
                    dim
                );
            }
        }

        let config = IndexConfig {
            pca: self.pca.clone(),
            kdtree: self.kdtree.clone(),
            scan: self.scan.clone(),
        };
        let summary = db.add_dir(&self.path, &encoder, &config, self.refit)?;
        db.save(&opts.conf_dir)?;

        info!(
            "图片添加完成: 新增 {} 张，跳过 {} 张，失败 {} 张，共 {} 张",
            summary.added,
            summary.skipped,
            summary.failed.len(),
            db.len()
        );
        Ok(())
    }
}
