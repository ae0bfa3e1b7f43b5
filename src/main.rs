use anyhow::Result;
use clap::Parser;
use log::debug;

use imknn::Opts;
use imknn::cli::SubCommandExtend;
use imknn::config::SubCommand;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() -> Result<()> {
    env_logger::init();

    let opts = Opts::parse();

    let threads = opts.threads.unwrap_or_else(num_cpus::get);
    rayon::ThreadPoolBuilder::new().num_threads(threads).build_global()?;
    debug!("使用 {} 个线程", threads);

    match &opts.subcmd {
        SubCommand::Add(config) => config.run(&opts),
        SubCommand::Build(config) => config.run(&opts),
        SubCommand::Search(config) => config.run(&opts),
        SubCommand::Sample(config) => config.run(&opts),
        SubCommand::Show(config) => config.run(&opts),
        SubCommand::Export(config) => config.run(&opts),
    }
}
