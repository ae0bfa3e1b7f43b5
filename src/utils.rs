use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use indicatif::{ProgressBar, ProgressIterator, ProgressStyle};
use log::{info, warn};
use regex::Regex;
use walkdir::WalkDir;

use crate::error::Result;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {wide_msg}",
    )
    .expect("invalid progress bar template")
    .progress_chars("##-")
}

/// 根据逗号分隔的后缀名构建大小写不敏感的正则
pub fn suffix_regex(suffix: &str) -> Regex {
    let re = format!("(?i)^({})$", suffix.split(',').map(regex::escape).collect::<Vec<_>>().join("|"));
    Regex::new(&re).expect("failed to build regex")
}

/// 递归扫描目录下的图片
///
/// 每一层按文件名排序，结果去重且顺序稳定。
pub fn scan_images(root: impl AsRef<Path>, re_suf: &Regex) -> Vec<PathBuf> {
    let root = root.as_ref();
    info!("开始扫描目录: {}", root.display());
    let pb = ProgressBar::no_length().with_style(pb_style());
    let mut seen = HashSet::new();
    let entries = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .progress_with(pb)
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("无法访问: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry.path().extension().is_some_and(|ext| re_suf.is_match(&ext.to_string_lossy()))
        })
        .map(|entry| entry.into_path())
        .filter(|path| seen.insert(path.clone()))
        .collect::<Vec<_>>();
    info!("扫描完成，共 {} 张图片", entries.len());
    entries
}

/// 原子地写入文件
///
/// 先写入同目录下的临时文件，成功后再重命名覆盖目标文件。失败时目标文件保持不变。
pub fn write_atomic<P, F>(path: P, f: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let path = path.as_ref();
    let tmp = tmp_path(path);

    let result: Result<()> = File::create(&tmp).map_err(Into::into).and_then(|file| {
        let mut writer = BufWriter::new(file);
        f(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    });

    match result.and_then(|_| std::fs::rename(&tmp, path).map_err(Into::into)) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// 临时文件名带上进程号和序号，同时进行的写入互不干扰
fn tmp_path(path: &Path) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(".{}.{}.tmp", std::process::id(), seq));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::error::Error;

    #[test]
    fn test_suffix_regex() {
        let re = suffix_regex("jpg,png");
        assert!(re.is_match("jpg"));
        assert!(re.is_match("PNG"));
        assert!(!re.is_match("jpgx"));
        assert!(!re.is_match("gif"));
    }

    #[test]
    fn test_scan_images() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("b");
        std::fs::create_dir(&sub).unwrap();
        for name in ["c.JPG", "a.png", "skip.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::write(sub.join("d.jpeg"), b"").unwrap();

        let found = scan_images(dir.path(), &suffix_regex("jpg,jpeg,png"));
        let names = found
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.png", "b/d.jpeg", "c.JPG"]);
    }

    #[test]
    fn test_write_atomic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");

        write_atomic(&path, |w| Ok(w.write_all(b"first")?)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        let err = write_atomic(&path, |w| {
            w.write_all(b"second")?;
            Err(Error::corrupt("boom"))
        });
        assert!(err.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_atomic_concurrent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        assert_ne!(tmp_path(&path), tmp_path(&path));

        let contents = (0..8).map(|i| vec![i as u8; 64 * 1024]).collect::<Vec<_>>();
        std::thread::scope(|s| {
            for data in &contents {
                let path = &path;
                s.spawn(move || write_atomic(path, |w| Ok(w.write_all(data)?)).unwrap());
            }
        });

        let written = std::fs::read(&path).unwrap();
        assert!(contents.contains(&written));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
