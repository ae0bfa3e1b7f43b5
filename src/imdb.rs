use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{debug, info, warn};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::Serialize;

use crate::codec;
use crate::config::{ConfDir, IndexConfig, PcaOptions};
use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::kdtree::{KdTree, KdTreeOptions};
use crate::pca::Pca;
use crate::store::{Collection, ImageRecord};
use crate::utils::{pb_style, scan_images, suffix_regex};

/// 一条搜索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub path: String,
    pub distance: f32,
}

/// 一次添加操作的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddSummary {
    /// 新添加的图片数量
    pub added: usize,
    /// 已存在而跳过的图片数量
    pub skipped: usize,
    /// 特征提取失败的图片
    pub failed: Vec<PathBuf>,
}

/// 并行提取图片特征
///
/// 结果顺序与输入一致。提取失败或维度不正确的图片会被记录并跳过，不影响其他图片。
pub fn extract_features<E: Encoder + ?Sized>(
    paths: &[PathBuf],
    encoder: &E,
) -> (Vec<ImageRecord>, Vec<PathBuf>) {
    let start = Instant::now();
    let dim = encoder.dimension();
    let pb = ProgressBar::new(paths.len() as u64).with_style(pb_style());
    let results = paths
        .par_iter()
        .progress_with(pb.clone())
        .map(|path| {
            let raw = encoder.encode(path).and_then(|raw| match raw.len() == dim {
                true => Ok(raw),
                false => Err(Error::DimensionMismatch { expected: dim, actual: raw.len() }),
            });
            (path, raw)
        })
        .collect::<Vec<_>>();
    pb.finish_and_clear();

    let mut records = Vec::with_capacity(results.len());
    let mut failed = vec![];
    for (path, raw) in results {
        match raw {
            Ok(raw) => records.push(ImageRecord::with_raw(path.to_string_lossy(), raw)),
            Err(e) => {
                warn!("跳过图片 {}: {}", path.display(), e);
                failed.push(path.clone());
            }
        }
    }
    info!(
        "特征提取完成: 成功 {} 张，失败 {} 张，耗时 {:.2?}",
        records.len(),
        failed.len(),
        start.elapsed()
    );
    (records, failed)
}

/// 从 `0..n` 中确定性地均匀抽取至多 `max` 个下标，结果升序
pub fn sample_indices(n: usize, max: usize, seed: u64) -> Vec<usize> {
    let mut indices = (0..n).collect::<Vec<_>>();
    if n > max {
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        indices.truncate(max);
        indices.sort_unstable();
    }
    indices
}

/// 图片数据库
///
/// 持有图片集合、PCA 和基于当前投影构建的 KD 树。
/// 重新训练 PCA 或添加图片都会使 KD 树失效，需要调用 `build_tree` 重建。
#[derive(Debug, Clone, Default)]
pub struct IMDB {
    collection: Collection,
    pca: Pca,
    tree: Option<KdTree>,
}

impl IMDB {
    pub fn new() -> Self {
        Self::default()
    }

    /// 扫描目录，提取特征，训练 PCA 并构建 KD 树
    pub fn build<E: Encoder + ?Sized>(
        dir: impl AsRef<Path>,
        encoder: &E,
        config: &IndexConfig,
    ) -> Result<Self> {
        let mut db = Self::new();
        db.add_dir(dir, encoder, config, true)?;
        Ok(db)
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn pca(&self) -> &Pca {
        &self.pca
    }

    pub fn tree(&self) -> Option<&KdTree> {
        self.tree.as_ref()
    }

    pub fn len(&self) -> usize {
        self.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collection.is_empty()
    }

    /// 扫描目录并添加其中的新图片
    pub fn add_dir<E: Encoder + ?Sized>(
        &mut self,
        dir: impl AsRef<Path>,
        encoder: &E,
        config: &IndexConfig,
        refit: bool,
    ) -> Result<AddSummary> {
        let mut paths = scan_images(dir, &suffix_regex(&config.scan.suffix));
        if let Some(limit) = config.scan.limit {
            if paths.len() > limit {
                info!("仅添加前 {} 张图片", limit);
                paths.truncate(limit);
            }
        }
        self.add_images(&paths, encoder, config, refit)
    }

    /// 添加图片，已存在的图片会被跳过
    ///
    /// PCA 未训练或 `refit` 为真时，使用全部图片重新训练 PCA 并重新投影，
    /// 否则只用现有的 PCA 投影新图片。完成后重建 KD 树。
    pub fn add_images<E: Encoder + ?Sized>(
        &mut self,
        paths: &[PathBuf],
        encoder: &E,
        config: &IndexConfig,
        refit: bool,
    ) -> Result<AddSummary> {
        let (new_paths, known): (Vec<_>, Vec<_>) =
            paths.iter().cloned().partition(|p| !self.collection.contains(&p.to_string_lossy()));
        for path in &known {
            debug!("跳过已添加的图片: {}", path.display());
        }
        if !known.is_empty() {
            info!("跳过 {} 张已添加的图片", known.len());
        }

        let (mut records, failed) = extract_features(&new_paths, encoder);
        let added = records.len();
        let refit = refit || !self.pca.is_fitted();

        if !refit && !records.is_empty() {
            let raws = records.iter().map(|r| r.raw.as_slice()).collect::<Vec<_>>();
            let projected = self.pca.project_batch(&raws)?;
            for (record, p) in records.iter_mut().zip(projected) {
                record.projected = p;
            }
        }

        // 在副本上完成全部步骤，失败时数据库保持不变
        let mut next = Self { collection: self.collection.clone(), pca: self.pca.clone(), tree: None };
        for record in records {
            next.collection.add(record)?;
        }
        if refit {
            next.fit(encoder, &config.pca)?;
        }
        next.build_tree(&config.kdtree)?;
        *self = next;

        Ok(AddSummary { added, skipped: known.len(), failed })
    }

    /// 使用集合中的图片训练 PCA，并重新投影全部图片
    ///
    /// 缺少原始特征的图片会先重新提取，任何一张失败都会中止训练。
    pub fn fit<E: Encoder + ?Sized>(&mut self, encoder: &E, opts: &PcaOptions) -> Result<()> {
        let n = self.collection.len();
        if n == 0 {
            return Err(Error::InsufficientSamples { required: 1, actual: 0 });
        }
        self.fill_raw(encoder)?;

        let indices = sample_indices(n, opts.max_samples.max(1), opts.seed);
        let records = self.collection.records();
        let samples = indices.iter().map(|&i| records[i].raw.as_slice()).collect::<Vec<_>>();
        let dim = samples[0].len();

        let limit = dim.min(samples.len());
        let n_components = if opts.components > limit {
            warn!("主成分数量 {} 超过上限，已调整为 {}", opts.components, limit);
            limit
        } else {
            opts.components
        };

        info!("开始训练 PCA: {} 个样本，{} → {}", samples.len(), dim, n_components);
        let mut pca = Pca::new();
        pca.fit(&samples, n_components)?;

        let raws = records.iter().map(|r| r.raw.as_slice()).collect::<Vec<_>>();
        let projections = pca.project_batch(&raws)?;
        self.collection.set_projections(projections)?;
        self.pca = pca;
        self.tree = None;
        info!("已重新投影 {} 张图片", n);
        Ok(())
    }

    /// 为缺少原始特征的图片重新提取特征
    fn fill_raw<E: Encoder + ?Sized>(&mut self, encoder: &E) -> Result<()> {
        let missing = self
            .collection
            .iter()
            .enumerate()
            .filter(|(_, r)| r.raw.is_empty())
            .map(|(i, r)| (i, PathBuf::from(&r.filename)))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(());
        }

        info!("重新提取 {} 张图片的原始特征", missing.len());
        let pb = ProgressBar::new(missing.len() as u64).with_style(pb_style());
        let raw = missing
            .par_iter()
            .progress_with(pb.clone())
            .map(|(i, path)| encoder.encode(path).map(|v| (*i, v)))
            .collect::<Result<Vec<_>>>();
        pb.finish_and_clear();
        self.collection.set_raw(raw?)
    }

    /// 使用当前投影重建 KD 树
    pub fn build_tree(&mut self, opts: &KdTreeOptions) -> Result<()> {
        let start = Instant::now();
        let tree = KdTree::build(&self.collection.projections(), opts)?;
        info!("KD 树构建完成: {} 个点，耗时 {:.2?}", tree.len(), start.elapsed());
        self.tree = Some(tree);
        Ok(())
    }

    /// 使用原始特征搜索最相近的 k 张图片，结果按距离升序
    pub fn search(&self, raw: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        let query = self.pca.project(raw)?;
        let tree = self.tree.as_ref().ok_or(Error::NotFitted)?;
        let neighbors = tree.knn(&query, k)?;
        Ok(neighbors.into_iter().map(|n| self.to_result(n.index, n.distance)).collect())
    }

    /// 提取图片特征后搜索
    pub fn search_file<E: Encoder + ?Sized>(
        &self,
        path: impl AsRef<Path>,
        encoder: &E,
        k: usize,
    ) -> Result<Vec<SearchResult>> {
        let raw = encoder.encode(path.as_ref())?;
        self.search(&raw, k)
    }

    /// 搜索与第 `index` 张图片最相近的 k 张其他图片
    pub fn search_similar(&self, index: usize, k: usize) -> Result<Vec<SearchResult>> {
        if k == 0 {
            return Err(Error::InvalidK(k));
        }
        let record = self.collection.get(index).ok_or(Error::IndexOutOfRange(index))?;
        let tree = self.tree.as_ref().ok_or(Error::NotFitted)?;
        let neighbors = tree.knn(&record.projected, k.saturating_add(1).min(tree.len()))?;
        Ok(neighbors
            .into_iter()
            .filter(|n| n.index != index)
            .take(k)
            .map(|n| self.to_result(n.index, n.distance))
            .collect())
    }

    fn to_result(&self, index: usize, distance: f32) -> SearchResult {
        let path = self.collection.get(index).map(|r| r.filename.clone()).unwrap_or_default();
        SearchResult { path, distance }
    }

    /// 导出 N × P 的投影矩阵
    pub fn export(&self) -> Result<Array2<f32>> {
        let p = self.pca.n_components().ok_or(Error::NotFitted)?;
        let data = self.collection.iter().flat_map(|r| r.projected.iter().copied()).collect();
        Array2::from_shape_vec((self.collection.len(), p), data)
            .map_err(|e| Error::CorruptState(e.to_string()))
    }

    /// 保存特征文件和 KD 树
    pub fn save(&self, conf_dir: &ConfDir) -> Result<()> {
        let state = self.pca.state().ok_or(Error::NotFitted)?;
        std::fs::create_dir_all(conf_dir.path())?;
        codec::save(&self.collection, state, conf_dir.features())?;
        if let Some(tree) = &self.tree {
            tree.save(conf_dir.kdtree())?;
        }
        Ok(())
    }

    /// 读取特征文件和 KD 树
    ///
    /// KD 树文件不存在或与特征不一致时，会使用 `opts` 重新构建。
    pub fn open(conf_dir: &ConfDir, opts: &KdTreeOptions) -> Result<Self> {
        let (collection, state) = codec::load(conf_dir.features())?;
        let pca = Pca::from_state(state)?;
        let mut db = Self { collection, pca, tree: None };

        match KdTree::load(conf_dir.kdtree(), &db.collection.projections()) {
            Ok(tree) => db.tree = Some(tree),
            Err(e @ (Error::FileNotFound(_) | Error::CorruptFile(_))) => {
                warn!("无法使用 KD 树文件，重新构建: {}", e);
                db.build_tree(opts)?;
            }
            Err(e) => return Err(e),
        }
        Ok(db)
    }
}

/// 可在多个线程间共享的数据库
///
/// 读者拿到的是某一时刻的快照，重建完成后整体替换，读者不会看到构建到一半的索引。
#[derive(Debug, Default)]
pub struct SharedIMDB {
    inner: RwLock<Arc<IMDB>>,
}

impl SharedIMDB {
    pub fn new(db: IMDB) -> Self {
        Self { inner: RwLock::new(Arc::new(db)) }
    }

    /// 获取当前数据库的快照
    pub fn snapshot(&self) -> Arc<IMDB> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 替换数据库，返回旧的数据库
    pub fn replace(&self, db: IMDB) -> Arc<IMDB> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(db))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;

    /// 按文件名返回预设特征的 encoder
    struct MapEncoder {
        dim: usize,
        vectors: HashMap<String, Vec<f32>>,
    }

    impl Encoder for MapEncoder {
        fn dimension(&self) -> usize {
            self.dim
        }

        fn encode(&self, path: &Path) -> Result<Vec<f32>> {
            self.vectors.get(&*path.to_string_lossy()).cloned().ok_or_else(|| Error::Encoding {
                path: path.display().to_string(),
                reason: "unknown".to_string(),
            })
        }
    }

    fn encoder() -> MapEncoder {
        let mut vectors = HashMap::new();
        for i in 0..12 {
            let x = i as f32;
            vectors.insert(format!("img{i}"), vec![x, 2.0 * x + 0.1 * (i % 3) as f32, -x, 1.0]);
        }
        vectors.insert("bad".to_string(), vec![1.0]);
        MapEncoder { dim: 4, vectors }
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    fn config(components: usize) -> IndexConfig {
        let mut config = IndexConfig::default();
        config.pca.components = components;
        config
    }

    #[test]
    fn test_extract_skips_failures() {
        let enc = encoder();
        let (records, failed) = extract_features(&paths(&["img0", "missing", "img1", "bad"]), &enc);
        let names = records.iter().map(|r| r.filename.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["img0", "img1"]);
        assert_eq!(failed, paths(&["missing", "bad"]));
    }

    #[test]
    fn test_sample_indices() {
        assert_eq!(sample_indices(5, 10, 1), vec![0, 1, 2, 3, 4]);
        let a = sample_indices(100, 10, 7);
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(a, sample_indices(100, 10, 7));
    }

    #[test]
    fn test_add_and_search() {
        let enc = encoder();
        let mut db = IMDB::new();
        let names = (0..8).map(|i| format!("img{i}")).collect::<Vec<_>>();
        let names = names.iter().map(String::as_str).collect::<Vec<_>>();
        let summary = db.add_images(&paths(&names), &enc, &config(2), false).unwrap();
        assert_eq!(summary.added, 8);
        assert_eq!(db.pca().n_components(), Some(2));

        let result = db.search(&enc.vectors["img3"], 3).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].path, "img3");
        assert!(result[0].distance < 1e-4);

        let similar = db.search_similar(3, 3).unwrap();
        assert_eq!(similar.len(), 3);
        assert!(similar.iter().all(|r| r.path != "img3"));
        assert_eq!(similar[0].path, result[1].path);

        assert_eq!(db.search_similar(3, 100).unwrap().len(), 7);
        assert!(matches!(db.search_similar(8, 1), Err(Error::IndexOutOfRange(8))));
        assert!(matches!(db.search_similar(0, 0), Err(Error::InvalidK(0))));
    }

    #[test]
    fn test_incremental_add() {
        let enc = encoder();
        let mut db = IMDB::new();
        db.add_images(&paths(&["img0", "img1", "img2", "img3"]), &enc, &config(2), false).unwrap();
        let state = db.pca().state().cloned();

        let summary =
            db.add_images(&paths(&["img2", "img4", "img5"]), &enc, &config(2), false).unwrap();
        assert_eq!(summary, AddSummary { added: 2, skipped: 1, failed: vec![] });
        assert_eq!(db.len(), 6);
        assert_eq!(db.pca().state().cloned(), state);
        assert_eq!(db.tree().map(KdTree::len), Some(6));
        assert_eq!(db.search(&enc.vectors["img5"], 1).unwrap()[0].path, "img5");

        db.add_images(&paths(&["img6"]), &enc, &config(3), true).unwrap();
        assert_eq!(db.pca().n_components(), Some(3));
        assert!(db.collection().iter().all(|r| r.projected.len() == 3));
    }

    #[test]
    fn test_components_clamped() {
        let enc = encoder();
        let mut db = IMDB::new();
        db.add_images(&paths(&["img0", "img1", "img2"]), &enc, &config(1024), false).unwrap();
        assert_eq!(db.pca().n_components(), Some(3));
    }

    #[test]
    fn test_empty() {
        let enc = encoder();
        let mut db = IMDB::new();
        assert!(matches!(db.search(&[0.0; 4], 1), Err(Error::NotFitted)));
        assert!(matches!(
            db.add_images(&[], &enc, &config(2), false),
            Err(Error::InsufficientSamples { .. })
        ));
        assert!(matches!(db.save(&ConfDir::new("/nonexistent")), Err(Error::NotFitted)));
    }

    #[test]
    fn test_save_open() {
        let dir = TempDir::new().unwrap();
        let conf_dir = ConfDir::new(dir.path().join("db"));
        let enc = encoder();
        let mut db = IMDB::new();
        let names = (0..10).map(|i| format!("img{i}")).collect::<Vec<_>>();
        let names = names.iter().map(String::as_str).collect::<Vec<_>>();
        db.add_images(&paths(&names), &enc, &config(2), false).unwrap();
        db.save(&conf_dir).unwrap();

        let opts = KdTreeOptions::default();
        let loaded = IMDB::open(&conf_dir, &opts).unwrap();
        assert_eq!(loaded.len(), 10);
        assert_eq!(loaded.pca().state(), db.pca().state());
        assert_eq!(loaded.search_similar(4, 3).unwrap(), db.search_similar(4, 3).unwrap());

        // KD 树文件丢失时自动重建
        std::fs::remove_file(conf_dir.kdtree()).unwrap();
        let rebuilt = IMDB::open(&conf_dir, &opts).unwrap();
        assert_eq!(rebuilt.search_similar(4, 3).unwrap(), db.search_similar(4, 3).unwrap());

        // 加载后的数据库可以继续重新训练
        let mut loaded = loaded;
        loaded.fit(&enc, &config(3).pca).unwrap();
        assert_eq!(loaded.pca().n_components(), Some(3));
        assert!(loaded.tree().is_none());
    }

    #[test]
    fn test_search_before_build_tree() {
        let enc = encoder();
        let mut db = IMDB::new();
        for name in ["img0", "img1", "img2"] {
            let raw = enc.encode(Path::new(name)).unwrap();
            db.collection.add(ImageRecord::with_raw(name, raw)).unwrap();
        }
        db.fit(&enc, &PcaOptions { components: 2, ..Default::default() }).unwrap();

        let raw = enc.encode(Path::new("img0")).unwrap();
        assert!(matches!(db.search(&raw, 1), Err(Error::NotFitted)));
        assert!(matches!(db.search_similar(0, 1), Err(Error::NotFitted)));

        db.build_tree(&KdTreeOptions::default()).unwrap();
        assert_eq!(db.search(&raw, 1).unwrap()[0].path, "img0");

        // 已建树但没有任何点
        let points: Vec<Vec<f32>> = vec![];
        let empty = IMDB {
            collection: Collection::new(),
            pca: db.pca.clone(),
            tree: Some(KdTree::build(&points, &KdTreeOptions::default()).unwrap()),
        };
        assert!(matches!(empty.search(&raw, 1), Err(Error::EmptyIndex)));
    }

    #[test]
    fn test_export() {
        let enc = encoder();
        let mut db = IMDB::new();
        db.add_images(&paths(&["img0", "img1", "img2", "img3"]), &enc, &config(2), false).unwrap();
        let data = db.export().unwrap();
        assert_eq!(data.dim(), (4, 2));
        assert_eq!(data.row(1).to_vec(), db.collection().get(1).unwrap().projected);
    }

    #[test]
    fn test_shared_swap() {
        let enc = encoder();
        let mut db = IMDB::new();
        db.add_images(&paths(&["img0", "img1", "img2"]), &enc, &config(2), false).unwrap();
        let shared = SharedIMDB::new(db.clone());
        let before = shared.snapshot();

        db.add_images(&paths(&["img3", "img4"]), &enc, &config(2), false).unwrap();
        let old = shared.replace(db);
        assert_eq!(old.len(), 3);
        assert_eq!(before.len(), 3);
        assert_eq!(shared.snapshot().len(), 5);
    }
}
