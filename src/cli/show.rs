use anyhow::Result;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::codec;
use crate::config::Opts;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {
    /// 显示的主成分数量
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub top: usize,
}

impl SubCommandExtend for ShowCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let (collection, state) = codec::load(opts.conf_dir.features())?;
        println!("图片数量: {}", collection.len());
        println!("输入维度: {}", state.input_dim());
        println!("主成分数量: {}", state.n_components());

        // 占比为相对于保留的全部主成分
        let total = state.explained_variance.sum();
        let mut cumulative = 0.0;
        for (i, &v) in state.explained_variance.iter().take(self.top).enumerate() {
            let ratio = if total > 0.0 { v / total } else { 0.0 };
            cumulative += ratio;
            println!("{:>4}\t{:.6}\t{:>6.2}%\t{:>6.2}%", i, v, ratio * 100.0, cumulative * 100.0);
        }
        Ok(())
    }
}
