use std::collections::HashMap;
use std::path::Path;

use crate::encoder::Encoder;
use crate::error::{Error, Result};

/// 一张图片的记录
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageRecord {
    /// 图片路径，同时也是唯一标识
    pub filename: String,
    /// 原始特征，长度为 D，未计算时为空
    pub raw: Vec<f32>,
    /// PCA 投影后的特征，长度为 P，未投影时为空
    pub projected: Vec<f32>,
}

impl ImageRecord {
    pub fn new(filename: impl Into<String>) -> Self {
        Self { filename: filename.into(), ..Default::default() }
    }

    pub fn with_raw(filename: impl Into<String>, raw: Vec<f32>) -> Self {
        Self { filename: filename.into(), raw, projected: vec![] }
    }

    pub fn with_projected(filename: impl Into<String>, projected: Vec<f32>) -> Self {
        Self { filename: filename.into(), raw: vec![], projected }
    }
}

/// 图片集合
///
/// 插入顺序即为 KD 树和搜索结果中使用的下标。
/// 集合会记住第一次出现的 D 和 P，之后长度不一致的向量都会被拒绝。
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: Vec<ImageRecord>,
    lookup: HashMap<String, usize>,
    raw_dim: Option<usize>,
    projected_dim: Option<usize>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn raw_dim(&self) -> Option<usize> {
        self.raw_dim
    }

    pub fn projected_dim(&self) -> Option<usize> {
        self.projected_dim
    }

    pub fn get(&self, index: usize) -> Option<&ImageRecord> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageRecord> {
        self.records.iter()
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.lookup.contains_key(filename)
    }

    /// 根据文件名查找下标
    pub fn find(&self, filename: &str) -> Option<usize> {
        self.lookup.get(filename).copied()
    }

    /// 添加一条记录，返回它的下标
    pub fn add(&mut self, record: ImageRecord) -> Result<usize> {
        if self.lookup.contains_key(&record.filename) {
            return Err(Error::DuplicateKey(record.filename));
        }
        if !record.raw.is_empty() {
            check_dim(self.raw_dim, record.raw.len())?;
        }
        if !record.projected.is_empty() {
            check_dim(self.projected_dim, record.projected.len())?;
        }

        if !record.raw.is_empty() {
            self.raw_dim = Some(record.raw.len());
        }
        if !record.projected.is_empty() {
            self.projected_dim = Some(record.projected.len());
        }
        let index = self.records.len();
        self.lookup.insert(record.filename.clone(), index);
        self.records.push(record);
        Ok(index)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.lookup.clear();
        self.raw_dim = None;
        self.projected_dim = None;
    }

    /// 返回已缓存的原始特征，不存在时调用 encoder 计算并缓存
    pub fn raw_or_encode<E: Encoder + ?Sized>(
        &mut self,
        index: usize,
        encoder: &E,
    ) -> Result<&[f32]> {
        let Some(record) = self.records.get(index) else {
            return Err(Error::IndexOutOfRange(index));
        };
        if record.raw.is_empty() {
            let raw = encoder.encode(Path::new(&record.filename))?;
            check_dim(self.raw_dim, raw.len())?;
            self.raw_dim = Some(raw.len());
            self.records[index].raw = raw;
        }
        Ok(&self.records[index].raw)
    }

    /// 写入一批原始特征，`raw` 为 (下标, 特征) 列表
    ///
    /// 所有长度在写入前统一校验，失败时集合保持不变。
    pub fn set_raw(&mut self, raw: Vec<(usize, Vec<f32>)>) -> Result<()> {
        let mut dim = self.raw_dim;
        for (index, v) in &raw {
            if *index >= self.records.len() {
                return Err(Error::IndexOutOfRange(*index));
            }
            check_dim(dim, v.len())?;
            dim = Some(v.len());
        }
        for (index, v) in raw {
            self.records[index].raw = v;
        }
        if dim.is_some() {
            self.raw_dim = dim;
        }
        Ok(())
    }

    /// 用一次 PCA 训练的结果替换全部投影
    ///
    /// 必须一次性给出每条记录的投影，避免混用不同训练结果。
    pub fn set_projections(&mut self, projections: Vec<Vec<f32>>) -> Result<()> {
        if projections.len() != self.records.len() {
            return Err(Error::DimensionMismatch {
                expected: self.records.len(),
                actual: projections.len(),
            });
        }
        let dim = projections.first().map(Vec::len);
        for p in &projections {
            check_dim(dim, p.len())?;
        }
        for (record, p) in self.records.iter_mut().zip(projections) {
            record.projected = p;
        }
        self.projected_dim = dim;
        Ok(())
    }

    /// 所有记录的投影，顺序与下标一致
    pub fn projections(&self) -> Vec<&[f32]> {
        self.records.iter().map(|r| r.projected.as_slice()).collect()
    }
}

fn check_dim(expected: Option<usize>, actual: usize) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(Error::DimensionMismatch { expected, actual }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingEncoder {
        calls: AtomicUsize,
    }

    impl Encoder for CountingEncoder {
        fn dimension(&self) -> usize {
            2
        }

        fn encode(&self, _path: &Path) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1.0, 2.0])
        }
    }

    #[test]
    fn test_add_and_find() {
        let mut c = Collection::new();
        assert_eq!(c.add(ImageRecord::new("a.jpg")).unwrap(), 0);
        assert_eq!(c.add(ImageRecord::new("b.jpg")).unwrap(), 1);
        assert_eq!(c.find("b.jpg"), Some(1));
        assert_eq!(c.find("c.jpg"), None);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_add_duplicate() {
        let mut c = Collection::new();
        c.add(ImageRecord::new("a.jpg")).unwrap();
        let err = c.add(ImageRecord::new("a.jpg")).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(name) if name == "a.jpg"));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_add_dimension_mismatch() {
        let mut c = Collection::new();
        c.add(ImageRecord::with_raw("a.jpg", vec![0.0; 3])).unwrap();
        let err = c.add(ImageRecord::with_raw("b.jpg", vec![0.0; 4])).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 4 }));
        assert_eq!(c.len(), 1);
        assert!(!c.contains("b.jpg"));

        c.add(ImageRecord::with_projected("c.jpg", vec![0.0; 2])).unwrap();
        let err = c.add(ImageRecord::with_projected("d.jpg", vec![0.0; 1])).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 1 }));
    }

    #[test]
    fn test_raw_or_encode_memoized() {
        let encoder = CountingEncoder { calls: AtomicUsize::new(0) };
        let mut c = Collection::new();
        c.add(ImageRecord::new("a.jpg")).unwrap();

        assert_eq!(c.raw_or_encode(0, &encoder).unwrap(), &[1.0, 2.0]);
        assert_eq!(c.raw_or_encode(0, &encoder).unwrap(), &[1.0, 2.0]);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.raw_dim(), Some(2));
    }

    #[test]
    fn test_raw_or_encode_uses_existing() {
        let encoder = CountingEncoder { calls: AtomicUsize::new(0) };
        let mut c = Collection::new();
        c.add(ImageRecord::with_raw("a.jpg", vec![5.0, 6.0])).unwrap();
        assert_eq!(c.raw_or_encode(0, &encoder).unwrap(), &[5.0, 6.0]);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_set_projections() {
        let mut c = Collection::new();
        c.add(ImageRecord::new("a.jpg")).unwrap();
        c.add(ImageRecord::new("b.jpg")).unwrap();

        let err = c.set_projections(vec![vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert!(c.get(0).unwrap().projected.is_empty());

        c.set_projections(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(c.projected_dim(), Some(2));
        assert_eq!(c.projections(), vec![&[1.0, 2.0][..], &[3.0, 4.0][..]]);
    }

    #[test]
    fn test_set_raw_validates_before_write() {
        let mut c = Collection::new();
        c.add(ImageRecord::new("a.jpg")).unwrap();
        c.add(ImageRecord::new("b.jpg")).unwrap();

        let err = c.set_raw(vec![(0, vec![1.0]), (1, vec![1.0, 2.0])]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert!(c.get(0).unwrap().raw.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut c = Collection::new();
        c.add(ImageRecord::with_raw("a.jpg", vec![1.0])).unwrap();
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.raw_dim(), None);
        c.add(ImageRecord::with_raw("a.jpg", vec![1.0, 2.0])).unwrap();
    }
}
