use std::path::Path;

use clap::Parser;
use image::imageops::FilterType;

use crate::error::{Error, Result};

pub const DEFAULT_THUMBNAIL_SIZE: u32 = 16;

/// 图片特征提取器
///
/// 对同一张图片和同一配置，输出必须是确定的，且长度固定为 `dimension()`。
/// 实现需要能在 rayon 线程池中并发调用。
pub trait Encoder: Sync {
    /// 输出向量的长度 D
    fn dimension(&self) -> usize;

    /// 提取一张图片的特征向量
    fn encode(&self, path: &Path) -> Result<Vec<f32>>;
}

#[derive(Parser, Debug, Clone)]
pub struct EncoderOptions {
    /// 缩略图边长，特征维度为 3 * SIZE * SIZE
    #[arg(long = "thumbnail-size", value_name = "SIZE", default_value_t = DEFAULT_THUMBNAIL_SIZE)]
    pub thumbnail_size: u32,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self { thumbnail_size: DEFAULT_THUMBNAIL_SIZE }
    }
}

/// 内置的缩略图特征
///
/// 将图片缩放到 S×S 的 RGB 图像，每个通道归一化到 [0, 1]。
#[derive(Debug, Clone)]
pub struct ThumbnailEncoder {
    size: u32,
}

impl ThumbnailEncoder {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }
}

impl From<&EncoderOptions> for ThumbnailEncoder {
    fn from(opts: &EncoderOptions) -> Self {
        Self::new(opts.thumbnail_size)
    }
}

impl Encoder for ThumbnailEncoder {
    fn dimension(&self) -> usize {
        3 * (self.size * self.size) as usize
    }

    fn encode(&self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path).map_err(|e| Error::Encoding {
            path: path.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;
        let thumb = img.resize_exact(self.size, self.size, FilterType::Triangle).to_rgb8();
        Ok(thumb.into_raw().into_iter().map(|v| v as f32 / 255.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_thumbnail_dimension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("red.png");
        RgbImage::from_pixel(40, 30, Rgb([255, 0, 0])).save(&path).unwrap();

        let encoder = ThumbnailEncoder::new(4);
        let v = encoder.encode(&path).unwrap();
        assert_eq!(v.len(), encoder.dimension());
        assert_eq!(v.len(), 48);
        assert_eq!(&v[..3], &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_thumbnail_broken_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let encoder = ThumbnailEncoder::new(4);
        assert!(matches!(encoder.encode(&path), Err(Error::Encoding { .. })));
    }
}
