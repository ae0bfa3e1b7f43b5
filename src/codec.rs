//! 特征文件的读写
//!
//! 文件布局，整数均为 u64 小端序，浮点数均为 f32 小端序：
//!
//! 1. 魔数 `IMKNNFT\0`，版本号 (u32)
//! 2. 图片数量 N，投影维度 P，N × P 个投影特征
//! 3. N 个文件名，每个为字节长度 + UTF-8 内容
//! 4. 主成分矩阵：D，P，D × P 个数值，行优先（每行对应一个输入维度）
//! 5. 方差：P，P 个数值
//! 6. 均值：D，D 个数值
//!
//! 原始特征和 KD 树不在此文件中保存。

use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use ndarray::{Array1, Array2};

use crate::error::{Error, Result};
use crate::pca::PcaState;
use crate::store::{Collection, ImageRecord};
use crate::utils::write_atomic;

const MAGIC: [u8; 8] = *b"IMKNNFT\0";
const VERSION: u32 = 1;

/// 保存图片集合的投影特征和 PCA 状态，已存在的文件会被覆盖
pub fn save(collection: &Collection, state: &PcaState, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let p = state.n_components();
    for record in collection.iter() {
        if record.projected.len() != p {
            return Err(Error::DimensionMismatch { expected: p, actual: record.projected.len() });
        }
    }

    write_atomic(path, |w| {
        w.write_all(&MAGIC)?;
        w.write_u32::<LittleEndian>(VERSION)?;

        write_len(w, collection.len())?;
        write_len(w, p)?;
        for record in collection.iter() {
            write_f32s(w, &record.projected)?;
        }

        for record in collection.iter() {
            write_len(w, record.filename.len())?;
            w.write_all(record.filename.as_bytes())?;
        }

        let (d, p) = state.components.dim();
        write_len(w, d)?;
        write_len(w, p)?;
        for row in state.components.rows() {
            for &v in row {
                w.write_f32::<LittleEndian>(v)?;
            }
        }

        write_len(w, state.explained_variance.len())?;
        for &v in &state.explained_variance {
            w.write_f32::<LittleEndian>(v)?;
        }

        write_len(w, state.mean.len())?;
        for &v in &state.mean {
            w.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    })?;

    info!("已保存 {} 张图片的特征到 {}", collection.len(), path.display());
    Ok(())
}

/// 读取特征文件，返回只包含文件名和投影特征的图片集合以及 PCA 状态
pub fn load(path: impl AsRef<Path>) -> Result<(Collection, PcaState)> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| Error::from_open(e, path))?;
    let mut r = Reader { cursor: Cursor::new(&data) };

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(Error::corrupt("不是特征文件"));
    }
    let version = r.cursor.read_u32::<LittleEndian>().map_err(eof)?;
    if version != VERSION {
        return Err(Error::corrupt(format!("不支持的版本: {}", version)));
    }

    let n = r.read_len()?;
    let p = r.read_len()?;
    if p == 0 {
        return Err(Error::corrupt("主成分数量为 0"));
    }
    let projected = r.read_f32s(mul(n, p)?)?;

    let mut filenames = Vec::with_capacity(n.min(r.remaining()));
    let mut seen = HashSet::new();
    for _ in 0..n {
        let len = r.read_len()?;
        let bytes = r.read_bytes(len)?;
        let name = String::from_utf8(bytes).map_err(|_| Error::corrupt("文件名不是合法的 UTF-8"))?;
        if !seen.insert(name.clone()) {
            return Err(Error::corrupt(format!("重复的文件名: {}", name)));
        }
        filenames.push(name);
    }

    let d = r.read_len()?;
    let basis_p = r.read_len()?;
    if basis_p != p {
        return Err(Error::corrupt(format!("投影维度 {} 与主成分数量 {} 不一致", p, basis_p)));
    }
    if p > d {
        return Err(Error::corrupt(format!("主成分数量 {} 超过输入维度 {}", p, d)));
    }
    let components = r.read_f32s(mul(d, p)?)?;

    let var_len = r.read_len()?;
    if var_len != p {
        return Err(Error::corrupt(format!("方差长度 {} 与主成分数量 {} 不一致", var_len, p)));
    }
    let explained_variance = r.read_f32s(p)?;

    let mean_len = r.read_len()?;
    if mean_len != d {
        return Err(Error::corrupt(format!("均值长度 {} 与输入维度 {} 不一致", mean_len, d)));
    }
    let mean = r.read_f32s(d)?;

    if r.remaining() != 0 {
        return Err(Error::corrupt(format!("文件末尾有 {} 字节多余数据", r.remaining())));
    }

    let components = Array2::from_shape_vec((d, p), components)
        .map_err(|e| Error::corrupt(e.to_string()))?;
    let state = PcaState {
        components,
        explained_variance: Array1::from(explained_variance),
        mean: Array1::from(mean),
    };

    let mut collection = Collection::new();
    for (name, chunk) in filenames.into_iter().zip(projected.chunks_exact(p)) {
        collection.add(ImageRecord::with_projected(name, chunk.to_vec()))?;
    }

    info!("已从 {} 读取 {} 张图片的特征", path.display(), collection.len());
    Ok((collection, state))
}

fn write_len<W: Write>(w: &mut W, len: usize) -> Result<()> {
    w.write_u64::<LittleEndian>(len as u64)?;
    Ok(())
}

fn write_f32s<W: Write>(w: &mut W, values: &[f32]) -> Result<()> {
    for &v in values {
        w.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

fn mul(a: usize, b: usize) -> Result<usize> {
    a.checked_mul(b).ok_or_else(|| Error::corrupt("长度溢出"))
}

/// 读取到文件末尾意味着文件被截断
fn eof(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::corrupt("文件被截断"),
        _ => Error::Io(err),
    }
}

struct Reader<'a> {
    cursor: Cursor<&'a Vec<u8>>,
}

impl Reader<'_> {
    fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.cursor.position() as usize)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.cursor.read_exact(buf).map_err(eof)
    }

    fn read_len(&mut self) -> Result<usize> {
        let len = self.cursor.read_u64::<LittleEndian>().map_err(eof)?;
        usize::try_from(len).map_err(|_| Error::corrupt("长度溢出"))
    }

    /// 读取前先检查剩余字节数，避免损坏的长度导致巨量内存分配
    fn read_f32s(&mut self, len: usize) -> Result<Vec<f32>> {
        if mul(len, 4)? > self.remaining() {
            return Err(Error::corrupt("文件被截断"));
        }
        let mut values = vec![0f32; len];
        self.cursor.read_f32_into::<LittleEndian>(&mut values).map_err(eof)?;
        Ok(values)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > self.remaining() {
            return Err(Error::corrupt("文件被截断"));
        }
        let mut bytes = vec![0u8; len];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}
