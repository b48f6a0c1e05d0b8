//! 分片缓存文件状态机：加锁写入、续传与最终落盘。

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::atomic::{copy_atomic, move_file};
use crate::config::COPY_BUFFER_SIZE;
use crate::error::UploadError;
use crate::request_id::RequestId;
use crate::session::{UploadSession, ensure_writable_dir};
use crate::source::UploadedFile;

/// [`ChunkHandler`] 的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerStatus {
    Waiting,
    Checking,
    Ready,
    NotReady,
    /// 从 0 开始写入截断后的缓存文件。
    Begin,
    /// 追加到已有缓存文件。
    Resume,
    Fail,
}

/// 单个上传会话的文件状态。
///
/// 缓存文件长度即已接收字节数，任何请求都能凭会话标识重建处理器。
pub struct ChunkHandler<'a, F> {
    session: &'a UploadSession,
    request_id: RequestId,
    source: F,
    limit: Option<u64>,
    cache_path: PathBuf,
    status: HandlerStatus,
    file: Option<File>,
    written: u64,
    size: u64,
    moved_file: Option<PathBuf>,
    last_put: Option<PathBuf>,
}

impl<'a, F: UploadedFile> ChunkHandler<'a, F> {
    pub fn new(session: &'a UploadSession, request_id: RequestId, source: F) -> Self {
        let cache_path = session.cache_path(&request_id);
        Self {
            session,
            request_id,
            source,
            limit: None,
            cache_path,
            status: HandlerStatus::Waiting,
            file: None,
            written: 0,
            size: 0,
            moved_file: None,
            last_put: None,
        }
    }

    /// 限制 `start` 从数据源复制的字节数。
    pub(crate) fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn status(&self) -> HandlerStatus {
        self.status
    }

    /// 本次 `start` 写入的字节数。
    pub fn written(&self) -> u64 {
        self.written
    }

    /// 最近一次读取到的缓存文件大小。
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn moved_file(&self) -> Option<&Path> {
        self.moved_file.as_deref()
    }

    pub fn last_put(&self) -> Option<&Path> {
        self.last_put.as_deref()
    }

    /// 重新读取缓存文件大小。
    pub fn refresh_size(&mut self) -> Result<u64, UploadError> {
        self.size = stat_size(&self.cache_path)?;
        Ok(self.size)
    }

    /// 校验缓存目录并读取当前缓存大小。
    pub fn check(&mut self) -> Result<(), UploadError> {
        match self.status {
            HandlerStatus::Waiting | HandlerStatus::NotReady => {}
            HandlerStatus::Fail => {
                return Err(UploadError::Io(io::Error::other(
                    "upload handler failed earlier and cannot be reused",
                )));
            }
            _ => return Ok(()),
        }

        self.status = HandlerStatus::Checking;
        if let Err(err) = ensure_writable_dir(self.session.storage_dir()) {
            self.status = HandlerStatus::NotReady;
            return Err(err);
        }
        match stat_size(&self.cache_path) {
            Ok(size) => self.size = size,
            Err(err) => {
                self.status = HandlerStatus::NotReady;
                return Err(err.into());
            }
        }
        self.status = HandlerStatus::Ready;
        Ok(())
    }

    /// 在 `position` 处写入数据流，返回写入字节数。
    ///
    /// `position` 默认为当前缓存大小，只能是 0 或该大小。独占锁不等待，
    /// 并发写入者会得到 [`UploadError::FileLocked`]。
    pub fn start(&mut self, position: Option<u64>) -> Result<u64, UploadError> {
        self.check()?;
        self.close();

        let position = position.unwrap_or(self.size);
        if position != 0 && position != self.size {
            return Err(UploadError::InvalidOffsetPosition {
                expected: self.size,
                actual: position,
            });
        }

        // Truncation waits until the lock is held.
        let mut file = match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.cache_path)
        {
            Ok(file) => file,
            Err(err) => return Err(self.fail(err)),
        };
        if let Err(err) = FileExt::try_lock_exclusive(&file) {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
                || err.kind() == ErrorKind::WouldBlock
            {
                debug!(request_id = self.request_id.as_str(), "cache file locked");
                return Err(UploadError::FileLocked(self.cache_path.clone()));
            }
            return Err(self.fail(err));
        }

        let current = match file.metadata() {
            Ok(metadata) => metadata.len(),
            Err(err) => return Err(self.fail(err)),
        };
        if position != 0 && position != current {
            let _ = FileExt::unlock(&file);
            self.size = current;
            return Err(UploadError::InvalidOffsetPosition {
                expected: current,
                actual: position,
            });
        }

        self.status = if position == 0 {
            HandlerStatus::Begin
        } else {
            HandlerStatus::Resume
        };
        match self.write_locked(&mut file, position) {
            Ok(written) => {
                self.written = written;
                self.file = Some(file);
                debug!(
                    request_id = self.request_id.as_str(),
                    position,
                    bytes = written,
                    size = self.size,
                    "chunk written"
                );
                Ok(written)
            }
            Err(err) => {
                let _ = FileExt::unlock(&file);
                Err(self.fail(err))
            }
        }
    }

    fn write_locked(&mut self, file: &mut File, position: u64) -> io::Result<u64> {
        if position == 0 {
            file.set_len(0)?;
        }
        file.seek(SeekFrom::Start(position))?;
        self.source.rewind()?;

        let limit = self.limit.unwrap_or(u64::MAX);
        let written = copy_chunk(&mut self.source, file, limit)?;
        file.flush()?;
        file.sync_data()?;
        self.size = file.metadata()?.len();
        // flock 降级并非原子操作，拿不到共享锁时不等待。
        if let Err(err) = FileExt::try_lock_shared(&*file) {
            debug!(
                request_id = self.request_id.as_str(),
                error = %err,
                "shared lock not kept after write"
            );
        }
        Ok(written)
    }

    /// 将上传结果落盘到 `target`。
    ///
    /// 首次成功时重命名缓存文件，之后从已移动的文件复制，可保存到多个位置。
    /// 目标已存在且 `overwrite`、`increment` 均未开启时返回 `Ok(None)`。
    pub fn put(
        &mut self,
        target: impl AsRef<Path>,
        overwrite: bool,
        increment: bool,
    ) -> Result<Option<PathBuf>, UploadError> {
        if self.status == HandlerStatus::Waiting {
            self.check()?;
        }
        let source = self
            .moved_file
            .clone()
            .unwrap_or_else(|| self.cache_path.clone());
        if !source.is_file() {
            return Err(UploadError::SourceFileNotFound(source));
        }
        if !matches!(
            self.status,
            HandlerStatus::Ready | HandlerStatus::Begin | HandlerStatus::Resume
        ) {
            return Err(UploadError::SourceFileMoved(self.cache_path.clone()));
        }
        self.close();

        let mut target = std::path::absolute(target.as_ref())?;
        match fs::symlink_metadata(&target) {
            Ok(metadata) => {
                if overwrite {
                    if metadata.permissions().readonly() {
                        return Err(UploadError::FileUnwritable(target));
                    }
                } else if increment {
                    target = self.next_free_name(&target)?;
                } else {
                    info!(
                        request_id = self.request_id.as_str(),
                        target = ?target,
                        "target exists, upload not moved"
                    );
                    return Ok(None);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| UploadError::DirectoryNotFound(target.clone()))?;
        if let Err(err) = fs::create_dir_all(&parent) {
            warn!(path = ?parent, error = %err, "failed to create target directory");
            return Err(UploadError::DirectoryUnwritable(parent));
        }
        ensure_writable_dir(&parent)?;

        match &self.moved_file {
            None => {
                move_file(&self.cache_path, &target)?;
                self.moved_file = Some(target.clone());
            }
            Some(moved) => {
                copy_atomic(moved, &target)?;
            }
        }
        info!(
            request_id = self.request_id.as_str(),
            target = ?target,
            "upload finalized"
        );
        self.last_put = Some(target.clone());
        Ok(Some(target))
    }

    fn next_free_name(&self, target: &Path) -> Result<PathBuf, UploadError> {
        let separator = self.session.increment_separator();
        let max = self.session.max_increment();
        let parent = target.parent().unwrap_or_else(|| Path::new(""));
        let stem = target
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = target
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let base = strip_increment(&stem, separator);

        for n in 1..=max {
            let candidate = parent.join(format!("{base}{separator}{n}{extension}"));
            match fs::symlink_metadata(&candidate) {
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(candidate),
                Err(err) => return Err(err.into()),
                Ok(_) => continue,
            }
        }
        Err(UploadError::MaxIncrementExceeded {
            target: target.to_path_buf(),
            attempts: max,
        })
    }

    /// 关闭并删除缓存文件。
    pub fn remove(&mut self) -> Result<bool, UploadError> {
        self.close();
        self.session.discard(&self.request_id)
    }

    /// 刷新、解锁并关闭缓存文件，可重复调用。
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
            let _ = FileExt::unlock(&file);
        }
    }

    fn fail(&mut self, err: io::Error) -> UploadError {
        warn!(
            request_id = self.request_id.as_str(),
            path = ?self.cache_path,
            error = %err,
            "chunk write failed"
        );
        self.status = HandlerStatus::Fail;
        UploadError::Io(err)
    }
}

impl<F> Drop for ChunkHandler<'_, F> {
    fn drop(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
            let _ = FileExt::unlock(&file);
        }
    }
}

fn stat_size(path: &Path) -> io::Result<u64> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(metadata.len()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

fn copy_chunk(source: &mut impl Read, file: &mut File, limit: u64) -> io::Result<u64> {
    let mut reader = source.take(limit);
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    let mut written = 0;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        file.write_all(&buffer[..read])?;
        written += read as u64;
    }
    Ok(written)
}

/// 分隔符为 `-` 时 `photo-3` → `photo`，其余原样返回。
fn strip_increment<'s>(stem: &'s str, separator: &str) -> &'s str {
    if separator.is_empty() {
        return stem;
    }
    match stem.rsplit_once(separator) {
        Some((base, number))
            if !base.is_empty()
                && !number.is_empty()
                && number.bytes().all(|byte| byte.is_ascii_digit()) =>
        {
            base
        }
        _ => stem,
    }
}
