use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::debug;
use serde_json::json;

use crate::cli::{SubCommandExtend, print_result};
use crate::config::{Opts, OutputFormat, SearchOptions};
use crate::encoder::{EncoderOptions, ThumbnailEncoder};
use crate::imdb::IMDB;
use crate::kdtree::KdTreeOptions;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub search: SearchOptions,
    #[command(flatten)]
    pub encoder: EncoderOptions,
    /// 被搜索的图片路径
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
}

impl SubCommandExtend for SearchCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let db = IMDB::open(&opts.conf_dir, &KdTreeOptions::default())?;
        let encoder = ThumbnailEncoder::from(&self.encoder);

        let mut results = vec![];
        for image in &self.images {
            debug!("搜索: {}", image.display());
            results.push(db.search_file(image, &encoder, self.search.count)?);
        }

        match (self.images.as_slice(), results.as_slice()) {
            ([_], [result]) => print_result(result, self.search.output_format)?,
            _ if self.search.output_format == OutputFormat::Json => {
                let output = self
                    .images
                    .iter()
                    .zip(&results)
                    .map(|(image, result)| json!({ "image": image, "result": result }))
                    .collect::<Vec<_>>();
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            _ => {
                for (image, result) in self.images.iter().zip(&results) {
                    println!("{}:", image.display());
                    print_result(result, self.search.output_format)?;
                }
            }
        }
        Ok(())
    }
}
