use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use ndarray_npy::write_npy;

use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::imdb::IMDB;
use crate::kdtree::KdTreeOptions;

#[derive(Parser, Debug, Clone)]
pub struct ExportCommand {
    /// 输出文件路径
    #[arg(default_value = "projected.npy")]
    pub output: PathBuf,
}

impl SubCommandExtend for ExportCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let db = IMDB::open(&opts.conf_dir, &KdTreeOptions::default())?;
        let data = db.export()?;
        write_npy(&self.output, &data)?;
        info!("导出成功: {}", self.output.display());
        Ok(())
    }
}
