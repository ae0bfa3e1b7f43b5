mod add;
mod build;
mod export;
mod sample;
mod search;
mod show;

pub use add::*;
pub use build::*;
pub use export::*;
pub use sample::*;
pub use search::*;
pub use show::*;

use anyhow::Result;

use crate::config::{Opts, OutputFormat};
use crate::imdb::SearchResult;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> Result<()>;
}

fn print_result(result: &[SearchResult], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for r in result {
                println!("{:.4}\t{}", r.distance, r.path);
            }
        }
    }
    Ok(())
}
