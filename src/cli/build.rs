use anyhow::Result;
use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::codec;
use crate::config::Opts;
use crate::kdtree::{KdTree, KdTreeOptions};

#[derive(Parser, Debug, Clone)]
pub struct BuildCommand {
    #[command(flatten)]
    pub kdtree: KdTreeOptions,
}

impl SubCommandExtend for BuildCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let (collection, _) = codec::load(opts.conf_dir.features())?;
        let tree = KdTree::build(&collection.projections(), &self.kdtree)?;
        tree.save(opts.conf_dir.kdtree())?;
        info!("构建索引成功: {} 张图片", tree.len());
        Ok(())
    }
}
