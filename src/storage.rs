//! 目标目录：把客户端给出的相对名称解析为安全的落盘路径。

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};

/// 上传完成后落盘的根目录。
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 解析相对名称；拒绝 `..`、绝对路径以及根目录下的符号链接。
    pub fn resolve_target(&self, name: &str) -> Result<PathBuf, StorageError> {
        let relative = normalize(name)?;
        let mut current = self.root.clone();
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current) {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    let is_leaf = components.peek().is_none();
                    if (is_leaf && metadata.is_dir()) || (!is_leaf && !metadata.is_dir()) {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    current.extend(components);
                    return Ok(current);
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(current)
    }
}

fn normalize(name: &str) -> Result<PathBuf, StorageError> {
    let trimmed = name.trim().trim_start_matches(['/', '\\']);
    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath);
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(StorageError::InvalidPath);
    }
    Ok(normalized)
}
