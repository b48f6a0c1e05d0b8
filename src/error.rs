//! 上传引擎错误类型与 HTTP 错误响应转换。

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use std::io::{self, ErrorKind};
use std::path::PathBuf;

use crate::storage::StorageError;

/// 分片上传引擎的错误。
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("argument must not be empty: {0}")]
    EmptyArgument(&'static str),

    #[error("directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("directory is not writable: {}", .0.display())]
    DirectoryUnwritable(PathBuf),

    #[error("file is not writable: {}", .0.display())]
    FileUnwritable(PathBuf),

    #[error("invalid request id: {0:?}")]
    InvalidRequestId(String),

    #[error("invalid content range: {0}")]
    InvalidContentRange(String),

    #[error("content range cannot be fulfilled: {0}")]
    ContentRangeUnfulfillable(String),

    #[error("invalid offset position {actual}, expected {expected}")]
    InvalidOffsetPosition { expected: u64, actual: u64 },

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("file is locked by another writer: {}", .0.display())]
    FileLocked(PathBuf),

    #[error("source file not found: {}", .0.display())]
    SourceFileNotFound(PathBuf),

    #[error("source file already moved: {}", .0.display())]
    SourceFileMoved(PathBuf),

    #[error("no free file name for {} after {attempts} attempts", .target.display())]
    MaxIncrementExceeded { target: PathBuf, attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// 错误分类，决定调用方是否可以重试。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Protocol,
    Contention,
    Finalization,
    Io,
}

impl UploadError {
    /// 返回错误所属分类。
    pub fn class(&self) -> ErrorClass {
        match self {
            UploadError::EmptyArgument(_)
            | UploadError::DirectoryNotFound(_)
            | UploadError::DirectoryUnwritable(_)
            | UploadError::FileUnwritable(_) => ErrorClass::Configuration,
            UploadError::InvalidRequestId(_)
            | UploadError::InvalidContentRange(_)
            | UploadError::ContentRangeUnfulfillable(_)
            | UploadError::InvalidOffsetPosition { .. }
            | UploadError::OutOfRange(_) => ErrorClass::Protocol,
            UploadError::FileLocked(_) => ErrorClass::Contention,
            UploadError::SourceFileNotFound(_)
            | UploadError::SourceFileMoved(_)
            | UploadError::MaxIncrementExceeded { .. } => ErrorClass::Finalization,
            UploadError::Io(_) => ErrorClass::Io,
        }
    }

    /// 稳定的错误码，可作为翻译键使用。
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::EmptyArgument(_) => "empty_argument",
            UploadError::DirectoryNotFound(_) => "directory_not_found",
            UploadError::DirectoryUnwritable(_) => "directory_unwritable",
            UploadError::FileUnwritable(_) => "file_unwritable",
            UploadError::InvalidRequestId(_) => "invalid_request_id",
            UploadError::InvalidContentRange(_) => "invalid_content_range",
            UploadError::ContentRangeUnfulfillable(_) => "content_range_unfulfillable",
            UploadError::InvalidOffsetPosition { .. } => "invalid_offset_position",
            UploadError::OutOfRange(_) => "out_of_range",
            UploadError::FileLocked(_) => "file_locked",
            UploadError::SourceFileNotFound(_) => "source_file_not_found",
            UploadError::SourceFileMoved(_) => "source_file_moved",
            UploadError::MaxIncrementExceeded { .. } => "max_increment_exceeded",
            UploadError::Io(_) => "io_error",
        }
    }

    /// 客户端修正输入或稍后重试即可恢复。
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Protocol | ErrorClass::Contention)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// 目标已存在；`request_id` 让客户端带上 `overwrite` 重新提交。
    Conflict {
        message: String,
        request_id: Option<String>,
    },
    Internal(String),
    Upload(UploadError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => error_response(
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                "bad_request",
                message,
            ),
            ApiError::NotFound(message) => {
                error_response(StatusCode::NOT_FOUND, HeaderMap::new(), "not_found", message)
            }
            ApiError::Conflict {
                message,
                request_id,
            } => {
                let mut headers = HeaderMap::new();
                if let Some(value) = request_id
                    .as_deref()
                    .and_then(|id| HeaderValue::from_str(id).ok())
                {
                    headers.insert(HeaderName::from_static("x-request-id"), value);
                    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
                }
                let body = ErrorBody {
                    code: "conflict",
                    message,
                    request_id,
                };
                (StatusCode::CONFLICT, headers, Json(body)).into_response()
            }
            ApiError::Internal(message) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                HeaderMap::new(),
                "internal",
                message,
            ),
            ApiError::Upload(err) => {
                let mut headers = HeaderMap::new();
                let status = match (&err, err.class()) {
                    (UploadError::ContentRangeUnfulfillable(_), _) => {
                        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes */*"));
                        StatusCode::RANGE_NOT_SATISFIABLE
                    }
                    (_, ErrorClass::Protocol) => StatusCode::BAD_REQUEST,
                    (_, ErrorClass::Contention) => {
                        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
                        StatusCode::CONFLICT
                    }
                    (UploadError::SourceFileNotFound(_), _) => StatusCode::NOT_FOUND,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                error_response(status, headers, err.code(), err.to_string())
            }
        }
    }
}

fn error_response(
    status: StatusCode,
    headers: HeaderMap,
    code: &'static str,
    message: String,
) -> Response {
    let body = ErrorBody {
        code,
        message,
        request_id: None,
    };
    (status, headers, Json(body)).into_response()
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        ApiError::Upload(error)
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}
