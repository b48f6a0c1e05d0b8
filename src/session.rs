//! 上传会话：缓存目录配置、处理器构建与过期分片清理。

use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{
    DEFAULT_ACCEPTED_UNIT, DEFAULT_INCREMENT_SEPARATOR, DEFAULT_MAX_AGE_SECS,
    DEFAULT_MAX_DELETION_COUNT, DEFAULT_MAX_INCREMENT, DEFAULT_PARTIAL_EXTENSION,
};
use crate::content_range::{CONTENT_RANGE_HEADER, ContentRangeHeader};
use crate::error::UploadError;
use crate::processor::ChunkProcessor;
use crate::request_id::{REQUEST_ID_HEADER, RequestId, RequestIdHeader};
use crate::source::{HeaderSource, UploadedFile};

/// 同一缓存目录下所有上传共用的配置。
#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub storage_dir: PathBuf,
    pub partial_extension: String,
    pub max_file_size: Option<u64>,
    pub min_chunk_size: Option<u64>,
    pub max_deletion_count: usize,
    pub max_age: Duration,
    pub accepted_units: Vec<String>,
    pub increment_separator: String,
    pub max_increment: u32,
    pub clean_on_drop: bool,
}

impl UploadConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            partial_extension: DEFAULT_PARTIAL_EXTENSION.to_string(),
            max_file_size: None,
            min_chunk_size: None,
            max_deletion_count: DEFAULT_MAX_DELETION_COUNT,
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            accepted_units: vec![DEFAULT_ACCEPTED_UNIT.to_string()],
            increment_separator: DEFAULT_INCREMENT_SEPARATOR.to_string(),
            max_increment: DEFAULT_MAX_INCREMENT,
            clean_on_drop: true,
        }
    }
}

/// 缓存目录及其策略的持有者。
///
/// 缓存目录是进行中上传的唯一登记处：每个上传对应一个
/// `<request id>.<partial extension>` 文件，长度即已接收字节数。
#[derive(Debug)]
pub struct UploadSession {
    config: UploadConfig,
}

impl UploadSession {
    /// 校验缓存目录后创建会话。
    pub fn new(config: UploadConfig) -> Result<Self, UploadError> {
        validate_storage_dir(&config.storage_dir)?;
        if config.partial_extension.trim().is_empty() {
            return Err(UploadError::EmptyArgument("partial_extension"));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    pub fn set_storage_dir(&mut self, storage_dir: impl Into<PathBuf>) -> Result<(), UploadError> {
        let storage_dir = storage_dir.into();
        validate_storage_dir(&storage_dir)?;
        self.config.storage_dir = storage_dir;
        Ok(())
    }

    pub fn partial_extension(&self) -> &str {
        &self.config.partial_extension
    }

    pub fn set_partial_extension(&mut self, extension: &str) -> Result<(), UploadError> {
        let extension = extension.trim().trim_start_matches('.');
        if extension.is_empty() {
            return Err(UploadError::EmptyArgument("partial_extension"));
        }
        self.config.partial_extension = extension.to_string();
        Ok(())
    }

    pub fn max_file_size(&self) -> Option<u64> {
        self.config.max_file_size
    }

    pub fn set_max_file_size(&mut self, size: Option<u64>) {
        self.config.max_file_size = size;
    }

    pub fn min_chunk_size(&self) -> Option<u64> {
        self.config.min_chunk_size
    }

    pub fn set_min_chunk_size(&mut self, size: Option<u64>) {
        self.config.min_chunk_size = size;
    }

    pub fn max_deletion_count(&self) -> usize {
        self.config.max_deletion_count
    }

    pub fn set_max_deletion_count(&mut self, count: usize) {
        self.config.max_deletion_count = count;
    }

    pub fn max_age(&self) -> Duration {
        self.config.max_age
    }

    pub fn set_max_age(&mut self, age: Duration) {
        self.config.max_age = age;
    }

    pub fn accepted_units(&self) -> &[String] {
        &self.config.accepted_units
    }

    pub fn set_accepted_units(&mut self, units: Vec<String>) {
        self.config.accepted_units = units;
    }

    pub fn increment_separator(&self) -> &str {
        &self.config.increment_separator
    }

    pub fn set_increment_separator(&mut self, separator: &str) {
        self.config.increment_separator = separator.to_string();
    }

    pub fn max_increment(&self) -> u32 {
        self.config.max_increment
    }

    pub fn set_max_increment(&mut self, max: u32) {
        self.config.max_increment = max;
    }

    pub fn set_clean_on_drop(&mut self, enabled: bool) {
        self.config.clean_on_drop = enabled;
    }

    /// 分片缓存文件路径：`<storage_dir>/<request_id>.<ext>`。
    pub fn cache_path(&self, request_id: &RequestId) -> PathBuf {
        self.config.storage_dir.join(format!(
            "{}.{}",
            request_id.as_str(),
            self.config.partial_extension
        ))
    }

    /// 已接收字节数；会话不存在时返回 `None`。
    pub fn cache_size(&self, request_id: &RequestId) -> Result<Option<u64>, UploadError> {
        match fs::metadata(self.cache_path(request_id)) {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// 删除未完成的分片文件，返回是否确实删除。
    pub fn discard(&self, request_id: &RequestId) -> Result<bool, UploadError> {
        match fs::remove_file(self.cache_path(request_id)) {
            Ok(()) => {
                info!(request_id = request_id.as_str(), "partial upload discarded");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// 从 `Content-Range` 与 `X-Request-Id` 请求头构建处理器。
    pub fn create_processor<F, R>(&self, file: F, request: &R) -> ChunkProcessor<'_, F>
    where
        F: UploadedFile,
        R: HeaderSource + ?Sized,
    {
        self.processor(
            file,
            ContentRangeHeader::parse(&request.header_line(CONTENT_RANGE_HEADER)),
            RequestIdHeader::parse(&request.header_line(REQUEST_ID_HEADER)),
        )
    }

    pub fn processor<F: UploadedFile>(
        &self,
        file: F,
        content_range: impl Into<ContentRangeHeader>,
        request_id: impl Into<RequestIdHeader>,
    ) -> ChunkProcessor<'_, F> {
        ChunkProcessor::new(self, file, content_range, request_id)
    }

    /// 删除过期分片文件，最多 `max` 个（默认取配置）。
    ///
    /// 修改时间距今不小于 `max_age` 即为过期；只读文件保留。
    pub fn clean(&self, max: Option<usize>) -> Result<usize, UploadError> {
        let max = max.unwrap_or(self.config.max_deletion_count);
        let extension = OsStr::new(&self.config.partial_extension);
        let now = SystemTime::now();
        let mut deleted = 0;

        for entry in fs::read_dir(&self.config.storage_dir)? {
            if deleted >= max {
                break;
            }
            let entry = entry?;
            let path = entry.path();
            if path.extension() != Some(extension) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(value) => value,
                Err(_) => continue,
            };
            if !metadata.is_file() || metadata.permissions().readonly() {
                continue;
            }
            let modified = match metadata.modified() {
                Ok(value) => value,
                Err(_) => continue,
            };
            let age = match now.duration_since(modified) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if age < self.config.max_age {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    info!(path = ?path, age_secs = age.as_secs(), "removed stale partial upload");
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(path = ?path, error = %err, "failed to remove stale partial upload"),
            }
        }

        Ok(deleted)
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if !self.config.clean_on_drop {
            return;
        }
        if let Err(err) = self.clean(None) {
            debug!(error = %err, "sweep on session teardown failed");
        }
    }
}

/// 确认目录存在且可写。
pub(crate) fn ensure_writable_dir(path: &Path) -> Result<(), UploadError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(UploadError::DirectoryNotFound(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    if !metadata.is_dir() {
        return Err(UploadError::DirectoryNotFound(path.to_path_buf()));
    }
    if metadata.permissions().readonly() {
        return Err(UploadError::DirectoryUnwritable(path.to_path_buf()));
    }

    // 权限位不反映属主，真正创建一个文件再删除。
    let check_file = path.join(format!(".write-check-{}", Uuid::new_v4()));
    match OpenOptions::new().write(true).create_new(true).open(&check_file) {
        Ok(file) => {
            drop(file);
            let _ = fs::remove_file(&check_file);
            Ok(())
        }
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem
            ) =>
        {
            Err(UploadError::DirectoryUnwritable(path.to_path_buf()))
        }
        Err(err) => Err(err.into()),
    }
}

fn validate_storage_dir(path: &Path) -> Result<(), UploadError> {
    if path.as_os_str().to_string_lossy().trim().is_empty() {
        return Err(UploadError::EmptyArgument("storage_dir"));
    }
    ensure_writable_dir(path)
}
