use std::time::Instant;

use log::{debug, warn};
use ndarray::prelude::*;
use rayon::prelude::*;

use crate::error::{Error, Result};

/// Jacobi 迭代的最大轮数
const MAX_SWEEPS: usize = 100;
/// 判断向量分量是否为 0 的阈值，用于统一特征向量的符号
const SIGN_EPS: f64 = 1e-9;
/// 相对最大特征值小于该比例的特征值视为 0
const RANK_EPS: f64 = 1e-10;
/// 特征分解矩阵的阶数超过该值时提示耗时
const LARGE_EIGEN: usize = 2048;

/// PCA 训练结果
#[derive(Debug, Clone, PartialEq)]
pub struct PcaState {
    /// D×P 矩阵，每一列是一个主成分方向
    pub components: Array2<f32>,
    /// 每个主成分对应的方差，长度为 P
    pub explained_variance: Array1<f32>,
    /// 每个维度的均值，长度为 D
    pub mean: Array1<f32>,
}

impl PcaState {
    /// 输入维度 D
    pub fn input_dim(&self) -> usize {
        self.components.nrows()
    }

    /// 主成分数量 P
    pub fn n_components(&self) -> usize {
        self.components.ncols()
    }

    fn validate(&self) -> Result<()> {
        let (d, p) = self.components.dim();
        if p == 0 {
            return Err(Error::CorruptState("主成分数量为 0".to_string()));
        }
        if self.mean.len() != d {
            return Err(Error::CorruptState(format!(
                "均值长度 {} 与主成分行数 {} 不一致",
                self.mean.len(),
                d
            )));
        }
        if self.explained_variance.len() != p {
            return Err(Error::CorruptState(format!(
                "方差长度 {} 与主成分列数 {} 不一致",
                self.explained_variance.len(),
                p
            )));
        }
        Ok(())
    }
}

/// 主成分分析降维
#[derive(Debug, Clone, Default)]
pub struct Pca {
    state: Option<PcaState>,
}

impl Pca {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从保存的状态恢复
    pub fn from_state(state: PcaState) -> Result<Self> {
        let mut pca = Self::new();
        pca.set_state(state)?;
        Ok(pca)
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&PcaState> {
        self.state.as_ref()
    }

    pub fn into_state(self) -> Option<PcaState> {
        self.state
    }

    /// 替换当前状态，校验失败时保留原状态
    pub fn set_state(&mut self, state: PcaState) -> Result<()> {
        state.validate()?;
        self.state = Some(state);
        Ok(())
    }

    pub fn input_dim(&self) -> Option<usize> {
        self.state.as_ref().map(PcaState::input_dim)
    }

    pub fn n_components(&self) -> Option<usize> {
        self.state.as_ref().map(PcaState::n_components)
    }

    /// 使用样本训练 PCA，保留前 `n_components` 个主成分
    ///
    /// 当样本数小于维度时，对 N×N 的 Gram 矩阵做特征分解，否则对 D×D 的协方差矩阵做分解。
    /// 结果只与样本内容和顺序有关，与数据的整体缩放无关。
    ///
    /// 特征分解使用 Jacobi 迭代，每轮的开销为 min(N, D) 的三次方。
    /// D 在数千以上时应把样本数控制在 D 以下，以走 Gram 分支。
    pub fn fit<V: AsRef<[f32]>>(&mut self, samples: &[V], n_components: usize) -> Result<()> {
        let n = samples.len();
        if n == 0 || n < n_components {
            return Err(Error::InsufficientSamples { required: n_components.max(1), actual: n });
        }
        let d = samples[0].as_ref().len();
        for s in samples {
            if s.as_ref().len() != d {
                return Err(Error::DimensionMismatch { expected: d, actual: s.as_ref().len() });
            }
        }
        if n_components == 0 || n_components > d {
            return Err(Error::InvalidComponents { requested: n_components, dim: d });
        }

        let start = Instant::now();

        let mut x = Array2::<f64>::zeros((n, d));
        for (mut row, s) in x.rows_mut().into_iter().zip(samples) {
            row.iter_mut().zip(s.as_ref()).for_each(|(a, b)| *a = *b as f64);
        }
        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(d));
        x -= &mean;

        let size = n.min(d);
        if size > LARGE_EIGEN {
            warn!("特征分解矩阵为 {size}×{size}，可能需要较长时间，可以减少训练样本数量");
        }

        let denom = (n.max(2) - 1) as f64;
        let (values, mut vectors) = if n < d {
            let gram = x.dot(&x.t()) / denom;
            let (values, u) = symmetric_eigen(gram);
            let cutoff = values[0].max(0.0) * RANK_EPS;
            let values = values.slice(s![..n_components]).to_owned();
            let mut v = Array2::<f64>::zeros((d, n_components));
            for j in 0..n_components {
                let scale = (values[j] * denom).sqrt();
                if values[j] > cutoff && scale > 0.0 {
                    let col = x.t().dot(&u.column(j)) / scale;
                    v.column_mut(j).assign(&col);
                }
            }
            complete_orthonormal(&mut v);
            (values, v)
        } else {
            let cov = x.t().dot(&x) / denom;
            let (values, v) = symmetric_eigen(cov);
            (values.slice(s![..n_components]).to_owned(), v.slice(s![.., ..n_components]).to_owned())
        };
        fix_signs(&mut vectors);

        debug!("PCA 训练完成: {n} 个样本，{d} → {n_components}，耗时 {:.2?}", start.elapsed());

        self.state = Some(PcaState {
            components: vectors.mapv(|v| v as f32),
            explained_variance: values.mapv(|v| v.max(0.0) as f32),
            mean: mean.mapv(|v| v as f32),
        });
        Ok(())
    }

    /// 将一个长度为 D 的向量投影到主成分空间
    pub fn project(&self, v: &[f32]) -> Result<Vec<f32>> {
        let state = self.state.as_ref().ok_or(Error::NotFitted)?;
        if v.len() != state.input_dim() {
            return Err(Error::DimensionMismatch { expected: state.input_dim(), actual: v.len() });
        }
        let centered = ArrayView1::from(v).to_owned() - &state.mean;
        Ok(centered.dot(&state.components).to_vec())
    }

    /// 并行投影多个向量，任意一个失败则整体失败
    pub fn project_batch<V: AsRef<[f32]> + Sync>(&self, vs: &[V]) -> Result<Vec<Vec<f32>>> {
        vs.par_iter().map(|v| self.project(v.as_ref())).collect()
    }
}

/// 使用循环 Jacobi 旋转求实对称矩阵的全部特征值和特征向量
///
/// 返回的特征值按降序排列，特征向量为对应的列。
fn symmetric_eigen(mut a: Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let m = a.nrows();
    let mut v = Array2::<f64>::eye(m);

    let scale = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let tol = scale * 1e-12;

    for _ in 0..MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..m {
            for q in p + 1..m {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off.sqrt() <= tol {
            break;
        }

        for p in 0..m {
            for q in p + 1..m {
                let apq = a[[p, q]];
                if apq.abs() <= f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let sign = if theta >= 0.0 { 1.0 } else { -1.0 };
                let t = sign / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                a[[p, p]] -= t * apq;
                a[[q, q]] += t * apq;
                a[[p, q]] = 0.0;
                a[[q, p]] = 0.0;
                for r in 0..m {
                    if r != p && r != q {
                        let (g, h) = (a[[r, p]], a[[r, q]]);
                        a[[r, p]] = c * g - s * h;
                        a[[p, r]] = a[[r, p]];
                        a[[r, q]] = s * g + c * h;
                        a[[q, r]] = a[[r, q]];
                    }
                }
                for r in 0..m {
                    let (g, h) = (v[[r, p]], v[[r, q]]);
                    v[[r, p]] = c * g - s * h;
                    v[[r, q]] = s * g + c * h;
                }
            }
        }
    }

    let mut order = (0..m).collect::<Vec<_>>();
    // 稳定排序，相同特征值保持原有顺序
    order.sort_by(|&i, &j| a[[j, j]].total_cmp(&a[[i, i]]));

    let values = order.iter().map(|&i| a[[i, i]]).collect::<Array1<_>>();
    let mut vectors = Array2::<f64>::zeros((m, m));
    for (dst, &src) in order.iter().enumerate() {
        vectors.column_mut(dst).assign(&v.column(src));
    }
    (values, vectors)
}

/// 将全 0 的列替换为与其他列正交的单位向量
///
/// 当请求的主成分数量超过样本的秩时，多出来的方向方差为 0，这里用标准基做 Gram-Schmidt 补齐。
fn complete_orthonormal(v: &mut Array2<f64>) {
    let (d, p) = v.dim();
    let mut basis = 0;
    for j in 0..p {
        if v.column(j).dot(&v.column(j)) > 0.5 {
            continue;
        }
        while basis < d {
            let mut e = Array1::<f64>::zeros(d);
            e[basis] = 1.0;
            basis += 1;
            for k in 0..p {
                if k == j {
                    continue;
                }
                let col = v.column(k);
                let dot = col.dot(&e);
                e.scaled_add(-dot, &col);
            }
            let norm = e.dot(&e).sqrt();
            if norm > 1e-6 {
                v.column_mut(j).assign(&(e / norm));
                break;
            }
        }
    }
}

/// 统一符号：每一列第一个非 0 分量为正
fn fix_signs(v: &mut Array2<f64>) {
    for mut col in v.columns_mut() {
        if let Some(first) = col.iter().find(|x| x.abs() > SIGN_EPS) {
            if *first < 0.0 {
                col.mapv_inplace(|x| -x);
            }
        }
    }
}
