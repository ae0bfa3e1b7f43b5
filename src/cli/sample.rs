use anyhow::{Result, bail};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cli::{SubCommandExtend, print_result};
use crate::config::{Opts, SearchOptions};
use crate::imdb::IMDB;
use crate::kdtree::KdTreeOptions;

#[derive(Parser, Debug, Clone)]
pub struct SampleCommand {
    #[command(flatten)]
    pub search: SearchOptions,
    /// 随机种子，不指定时每次随机
    #[arg(long)]
    pub seed: Option<u64>,
}

impl SubCommandExtend for SampleCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let db = IMDB::open(&opts.conf_dir, &KdTreeOptions::default())?;
        if db.is_empty() {
            bail!("数据库为空");
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let index = rng.random_range(0..db.len());
        let record = &db.collection().records()[index];
        println!("{}", record.filename);

        let result = db.search_similar(index, self.search.count)?;
        print_result(&result, self.search.output_format)
    }
}
