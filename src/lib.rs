pub mod cli;
pub mod codec;
pub mod config;
pub mod encoder;
pub mod error;
pub mod imdb;
pub mod kdtree;
pub mod pca;
pub mod store;
pub mod utils;

pub use config::{ConfDir, IndexConfig, Opts};
pub use encoder::{Encoder, ThumbnailEncoder};
pub use error::{Error, Result};
pub use imdb::{IMDB, SearchResult, SharedIMDB};
pub use kdtree::{KdTree, Neighbor};
pub use pca::{Pca, PcaState};
pub use store::{Collection, ImageRecord};
