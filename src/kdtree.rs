use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use bincode::Options;
use clap::{Parser, ValueEnum};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::write_atomic;

pub const DEFAULT_LEAF_SIZE: usize = 8;

/// 分割维度的选择方式
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SplitPolicy {
    /// 选择当前子集中跨度最大的维度
    #[default]
    Spread,
    /// 按深度轮流选择维度
    Cycle,
}

impl FromStr for SplitPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "spread" => Ok(Self::Spread),
            "cycle" => Ok(Self::Cycle),
            _ => Err(format!("无效的分割方式: {}", s)),
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct KdTreeOptions {
    /// 叶子节点最多包含的点数
    #[arg(long, value_name = "N", default_value_t = DEFAULT_LEAF_SIZE)]
    pub leaf_size: usize,
    /// 分割维度的选择方式
    #[arg(long, value_enum, default_value_t = SplitPolicy::Spread)]
    pub split: SplitPolicy,
}

impl Default for KdTreeOptions {
    fn default() -> Self {
        Self { leaf_size: DEFAULT_LEAF_SIZE, split: SplitPolicy::Spread }
    }
}

/// 一个近邻结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// 点在建树时的下标
    pub index: usize,
    /// 欧氏距离
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum Node {
    /// `order[start..end]` 中的点
    Leaf { start: u32, end: u32 },
    /// 左子树在 axis 上的坐标 <= value，右子树 >= value
    Split { axis: u32, value: f32, left: u32, right: u32 },
}

/// KD 树
///
/// 建树后不可修改，更新数据需要重新建树。
#[derive(Debug, Clone)]
pub struct KdTree {
    dim: usize,
    leaf_size: usize,
    /// 展平的 n × dim 点集快照
    points: Vec<f32>,
    /// 点的排列，叶子节点引用其中的连续区间
    order: Vec<u32>,
    nodes: Vec<Node>,
}

impl KdTree {
    /// 从点集构建 KD 树，所有点的长度必须一致
    pub fn build<V: AsRef<[f32]>>(points: &[V], opts: &KdTreeOptions) -> Result<Self> {
        let start = Instant::now();
        let dim = points.first().map(|p| p.as_ref().len()).unwrap_or(0);
        let mut flat = Vec::with_capacity(points.len() * dim);
        for p in points {
            let p = p.as_ref();
            if p.len() != dim {
                return Err(Error::DimensionMismatch { expected: dim, actual: p.len() });
            }
            flat.extend_from_slice(p);
        }

        let mut tree = Self {
            dim,
            leaf_size: opts.leaf_size.max(1),
            points: flat,
            order: (0..points.len() as u32).collect(),
            nodes: Vec::with_capacity(2 * points.len() / opts.leaf_size.max(1) + 1),
        };
        if !points.is_empty() {
            tree.build_node(0, points.len(), 0, opts.split);
        }

        debug!(
            "KD 树构建完成: {} 个点，{} 个节点，耗时 {:.2?}",
            tree.len(),
            tree.nodes.len(),
            start.elapsed()
        );
        Ok(tree)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline(always)]
    fn point(&self, i: u32) -> &[f32] {
        let i = i as usize;
        &self.points[i * self.dim..(i + 1) * self.dim]
    }

    /// 递归构建 `order[start..end]`，返回节点下标
    ///
    /// 每次按中位数二分，递归深度不超过 log2(n)。
    fn build_node(&mut self, start: usize, end: usize, depth: usize, split: SplitPolicy) -> u32 {
        let id = self.nodes.len() as u32;
        if end - start <= self.leaf_size || self.dim == 0 {
            self.nodes.push(Node::Leaf { start: start as u32, end: end as u32 });
            return id;
        }

        let axis = match split {
            SplitPolicy::Cycle => depth % self.dim,
            SplitPolicy::Spread => self.widest_axis(start, end),
        };
        let mid = start + (end - start) / 2;
        {
            let (dim, points) = (self.dim, &self.points);
            let coord = |i: u32| points[i as usize * dim + axis];
            self.order[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
                coord(a).total_cmp(&coord(b)).then(a.cmp(&b))
            });
        }
        let value = self.point(self.order[mid])[axis];

        // 先占位，子节点建完后再回填
        self.nodes.push(Node::Leaf { start: 0, end: 0 });
        let left = self.build_node(start, mid, depth + 1, split);
        let right = self.build_node(mid, end, depth + 1, split);
        self.nodes[id as usize] = Node::Split { axis: axis as u32, value, left, right };
        id
    }

    fn widest_axis(&self, start: usize, end: usize) -> usize {
        let mut lo = vec![f32::INFINITY; self.dim];
        let mut hi = vec![f32::NEG_INFINITY; self.dim];
        for &i in &self.order[start..end] {
            for (d, &x) in self.point(i).iter().enumerate() {
                lo[d] = lo[d].min(x);
                hi[d] = hi[d].max(x);
            }
        }
        let mut best = 0;
        for d in 1..self.dim {
            if hi[d] - lo[d] > hi[best] - lo[best] {
                best = d;
            }
        }
        best
    }

    /// 搜索距离 query 最近的 k 个点，按距离升序排列，距离相同时下标小的在前
    ///
    /// k 为 0 时返回 InvalidK，k 大于点数时截断为点数。
    pub fn knn(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if self.is_empty() {
            return Err(Error::EmptyIndex);
        }
        if k == 0 {
            return Err(Error::InvalidK(k));
        }
        if query.len() != self.dim {
            return Err(Error::DimensionMismatch { expected: self.dim, actual: query.len() });
        }

        let mut top = TopKNeighbors::new(k.min(self.len()));
        self.search_node(0, query, &mut top);
        Ok(top
            .into_sorted_vec()
            .into_iter()
            .map(|c| Neighbor { index: c.index as usize, distance: c.dist2.sqrt() })
            .collect())
    }

    fn search_node(&self, node: u32, query: &[f32], top: &mut TopKNeighbors) {
        match self.nodes[node as usize] {
            Node::Leaf { start, end } => {
                for &i in &self.order[start as usize..end as usize] {
                    top.push(Candidate { dist2: squared_l2(query, self.point(i)), index: i });
                }
            }
            Node::Split { axis, value, left, right } => {
                let diff = query[axis as usize] - value;
                let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                self.search_node(near, query, top);
                // 使用 <= 以便访问可能存在的同距离、下标更小的点
                if diff * diff <= top.worst() {
                    self.search_node(far, query, top);
                }
            }
        }
    }

    /// 保存到文件，加载时需要提供相同的点集
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = KdTreeFile {
            magic: KDTREE_MAGIC,
            version: KDTREE_VERSION,
            dim: self.dim as u64,
            len: self.len() as u64,
            leaf_size: self.leaf_size as u64,
            fingerprint: fingerprint(self.dim, &self.points, &self.order, &self.nodes),
            order: self.order.clone(),
            nodes: self.nodes.clone(),
        };
        write_atomic(path, |writer: &mut BufWriter<File>| {
            bincode::serialize_into(writer, &file).map_err(bincode_error)
        })
    }

    /// 从文件加载，`points` 必须与保存时的点集（数量、顺序和数值）完全一致
    pub fn load<V: AsRef<[f32]>>(path: impl AsRef<Path>, points: &[V]) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::from_open(e, path))?;
        let size = file.metadata()?.len();
        let file: KdTreeFile = bincode::options()
            .with_fixint_encoding()
            .with_limit(size)
            .deserialize_from(BufReader::new(file))
            .map_err(bincode_error)?;

        if file.magic != KDTREE_MAGIC {
            return Err(Error::corrupt("不是 KD 树文件"));
        }
        if file.version != KDTREE_VERSION {
            return Err(Error::corrupt(format!("不支持的版本: {}", file.version)));
        }
        if file.len != points.len() as u64 {
            return Err(Error::corrupt(format!(
                "点的数量不一致: 文件中为 {}，实际为 {}",
                file.len,
                points.len()
            )));
        }

        let dim = file.dim as usize;
        let mut flat = Vec::with_capacity(points.len() * dim);
        for p in points {
            let p = p.as_ref();
            if p.len() != dim {
                return Err(Error::corrupt(format!("点的维度不一致: 期望 {}，实际 {}", dim, p.len())));
            }
            flat.extend_from_slice(p);
        }
        if file.fingerprint != fingerprint(dim, &flat, &file.order, &file.nodes) {
            return Err(Error::corrupt("点集与 KD 树文件不匹配"));
        }

        let tree = Self {
            dim,
            leaf_size: file.leaf_size as usize,
            points: flat,
            order: file.order,
            nodes: file.nodes,
        };
        tree.check_structure()?;
        Ok(tree)
    }

    /// 检查节点和排列是否构成一棵合法的树
    ///
    /// 从根节点遍历，要求每个节点恰好被访问一次，叶子按顺序恰好覆盖 `0..n`，
    /// 且每个分割节点左侧的点不大于分割值、右侧的点不小于分割值。
    fn check_structure(&self) -> Result<()> {
        let n = self.len();
        let mut seen = vec![false; n];
        for &i in &self.order {
            match seen.get_mut(i as usize) {
                Some(s) if !*s => *s = true,
                _ => return Err(Error::corrupt("点的排列无效")),
            }
        }
        if n == 0 {
            return match self.nodes.is_empty() {
                true => Ok(()),
                false => Err(Error::corrupt("节点数据无效")),
            };
        }
        if self.nodes.is_empty() {
            return Err(Error::corrupt("缺少节点"));
        }

        let mut visited = vec![false; self.nodes.len()];
        let (start, end) = self.check_node(0, 0, &mut visited)?;
        if start != 0 || end != n {
            return Err(Error::corrupt(format!("叶子节点覆盖了 {start}..{end}，应为 0..{n}")));
        }
        if visited.iter().any(|v| !v) {
            return Err(Error::corrupt("存在无法访问的节点"));
        }
        Ok(())
    }

    /// 检查以 `id` 为根的子树，返回其覆盖的 `order` 区间
    fn check_node(&self, id: u32, depth: usize, visited: &mut [bool]) -> Result<(usize, usize)> {
        if depth > MAX_DEPTH {
            return Err(Error::corrupt("树的深度过大"));
        }
        match visited.get_mut(id as usize) {
            Some(v) if !*v => *v = true,
            _ => return Err(Error::corrupt("节点数据无效")),
        }
        match self.nodes[id as usize] {
            Node::Leaf { start, end } => {
                let (start, end) = (start as usize, end as usize);
                if start > end || end > self.len() {
                    return Err(Error::corrupt("叶子节点区间无效"));
                }
                Ok((start, end))
            }
            Node::Split { axis, value, left, right } => {
                let axis = axis as usize;
                if axis >= self.dim {
                    return Err(Error::corrupt("分割维度无效"));
                }
                let (l_start, l_end) = self.check_node(left, depth + 1, visited)?;
                let (r_start, r_end) = self.check_node(right, depth + 1, visited)?;
                if l_end != r_start {
                    return Err(Error::corrupt("叶子节点区间不连续"));
                }
                let coord = |i: u32| self.point(i)[axis];
                let left_ok =
                    self.order[l_start..l_end].iter().all(|&i| coord(i).total_cmp(&value).is_le());
                let right_ok =
                    self.order[r_start..r_end].iter().all(|&i| coord(i).total_cmp(&value).is_ge());
                if !left_ok || !right_ok {
                    return Err(Error::corrupt("分割值与点集不符"));
                }
                Ok((l_start, r_end))
            }
        }
    }
}

/// 中位数分割的树深度不会超过点数的位数
const MAX_DEPTH: usize = 64;
const KDTREE_MAGIC: [u8; 8] = *b"IMKNNKD\0";
const KDTREE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct KdTreeFile {
    magic: [u8; 8],
    version: u32,
    dim: u64,
    len: u64,
    leaf_size: u64,
    /// 点集、排列和节点的 blake3 哈希
    fingerprint: [u8; 32],
    order: Vec<u32>,
    nodes: Vec<Node>,
}

fn fingerprint(dim: usize, points: &[f32], order: &[u32], nodes: &[Node]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(dim as u64).to_le_bytes());
    hasher.update(&(points.len() as u64).to_le_bytes());
    hasher.update(bytemuck::cast_slice(points));
    hasher.update(&(order.len() as u64).to_le_bytes());
    hasher.update(bytemuck::cast_slice(order));
    hasher.update(&(nodes.len() as u64).to_le_bytes());
    for node in nodes {
        let words = match *node {
            Node::Leaf { start, end } => [0, start, end, 0, 0],
            Node::Split { axis, value, left, right } => [1, axis, value.to_bits(), left, right],
        };
        hasher.update(bytemuck::cast_slice(&words[..]));
    }
    *hasher.finalize().as_bytes()
}

fn bincode_error(err: bincode::Error) -> Error {
    match *err {
        bincode::ErrorKind::Io(e) if e.kind() != std::io::ErrorKind::UnexpectedEof => Error::Io(e),
        e => Error::corrupt(e.to_string()),
    }
}

#[inline(always)]
fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist2: f32,
    index: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist2.total_cmp(&other.dist2).then(self.index.cmp(&other.index))
    }
}

/// 保留最近的 k 个候选，堆顶为当前最差的一个
struct TopKNeighbors {
    heap: BinaryHeap<Candidate>,
    k: usize,
}

impl TopKNeighbors {
    fn new(k: usize) -> Self {
        Self { heap: BinaryHeap::with_capacity(k + 1), k }
    }

    fn push(&mut self, c: Candidate) {
        if self.heap.len() < self.k {
            self.heap.push(c);
        } else if self.heap.peek().is_some_and(|worst| c < *worst) {
            self.heap.pop();
            self.heap.push(c);
        }
    }

    /// 当前第 k 近的距离平方，不足 k 个时为无穷大
    fn worst(&self) -> f32 {
        if self.heap.len() < self.k {
            f32::INFINITY
        } else {
            self.heap.peek().map_or(f32::INFINITY, |c| c.dist2)
        }
    }

    fn into_sorted_vec(self) -> Vec<Candidate> {
        self.heap.into_sorted_vec()
    }
}
