//! 临时写入与原子替换：将已完成的上传复制到额外目标。

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// 与目标同目录的临时文件，完成后原子替换目标。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    pub fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = File::create(&temp_path)?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃写入并删除临时文件。
    pub fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path);
    }

    /// 同步数据后替换目标文件。
    pub fn finalize(self) -> io::Result<()> {
        self.file.sync_all()?;
        drop(self.file);
        if let Err(err) = fs::rename(&self.temp_path, &self.target) {
            let _ = fs::remove_file(&self.temp_path);
            return Err(err);
        }
        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent);
        }
        Ok(())
    }
}

/// 经由临时文件复制 `from` 到 `to`，读者永远看不到半个文件。
pub fn copy_atomic(from: &Path, to: &Path) -> io::Result<u64> {
    let mut source = File::open(from)?;
    let mut atomic = AtomicFile::new(to)?;
    match io::copy(&mut source, atomic.file_mut()) {
        Ok(copied) => {
            atomic.finalize()?;
            Ok(copied)
        }
        Err(err) => {
            atomic.cleanup();
            Err(err)
        }
    }
}

/// 移动文件；跨设备时退化为复制后删除。
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            copy_atomic(from, to)?;
            fs::remove_file(from)
        }
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
