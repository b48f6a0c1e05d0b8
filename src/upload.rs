//! 分片上传接口：接收分片、查询进度、放弃上传。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::MAX_CHUNK_SIZE;
use crate::error::{ApiError, UploadError};
use crate::http::{FILE_NAME_HEADER, UPLOAD_OFFSET_HEADER};
use crate::progress::StartProgress;
use crate::request_id::{REQUEST_ID_HEADER, RequestId, RequestIdHeader};
use crate::session::UploadSession;
use crate::source::{HeaderSource, MemoryFile};
use crate::storage::Storage;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    name: Option<String>,
    #[serde(default)]
    overwrite: bool,
    #[serde(default = "default_increment")]
    increment: bool,
}

fn default_increment() -> bool {
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    request_id: String,
    received: u64,
    total: Option<u64>,
    done: bool,
    remaining_requests: Option<u64>,
    path: Option<String>,
}

/// 接收一个分片（POST/PUT）。未完成返回 202，完成并落盘后返回 201。
pub async fn upload_chunk(
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    Extension(session): Extension<Arc<UploadSession>>,
    Extension(storage): Extension<Arc<Storage>>,
    body: AxumBody,
) -> Result<Response, ApiError> {
    let name = query
        .name
        .clone()
        .or_else(|| Some(headers.header_line(FILE_NAME_HEADER)))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::BadRequest("file name is required".into()))?;

    let data = read_chunk_body(body).await?;
    let response = tokio::task::spawn_blocking(move || {
        process_chunk(
            &session,
            &storage,
            &headers,
            data,
            &name,
            query.overwrite,
            query.increment,
        )
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))??;

    let status = if response.done {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    let mut headers = offset_headers(&response.request_id, response.received)?;
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok((status, headers, JsonResponse(response)).into_response())
}

/// 查询会话已接收的字节数（HEAD），客户端据此续传。
pub async fn upload_status(
    headers: HeaderMap,
    Extension(session): Extension<Arc<UploadSession>>,
) -> Result<Response, ApiError> {
    let request_id = required_request_id(&headers)?;
    let lookup = request_id.clone();
    let size = tokio::task::spawn_blocking(move || session.cache_size(&lookup))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;

    match size {
        Some(size) => {
            let headers = offset_headers(request_id.as_str(), size)?;
            Ok((StatusCode::NO_CONTENT, headers).into_response())
        }
        None => Err(ApiError::NotFound("upload session not found".into())),
    }
}

/// 放弃上传并删除缓存文件（DELETE）。
pub async fn abort_upload(
    headers: HeaderMap,
    Extension(session): Extension<Arc<UploadSession>>,
) -> Result<StatusCode, ApiError> {
    let request_id = required_request_id(&headers)?;
    let lookup = request_id.clone();
    let removed = tokio::task::spawn_blocking(move || session.discard(&lookup))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;

    if removed {
        info!(request_id = %request_id, "upload aborted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("upload session not found".into()))
    }
}

async fn read_chunk_body(body: AxumBody) -> Result<Vec<u8>, ApiError> {
    let mut data_stream = BodyExt::into_data_stream(body);
    let mut data = Vec::new();
    while let Some(chunk) = data_stream.next().await {
        let chunk = chunk.map_err(|err: AxumError| ApiError::Internal(err.to_string()))?;
        if chunk.is_empty() {
            continue;
        }
        if (data.len() + chunk.len()) as u64 > MAX_CHUNK_SIZE {
            return Err(ApiError::BadRequest("chunk too large".into()));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

fn process_chunk(
    session: &UploadSession,
    storage: &Storage,
    headers: &HeaderMap,
    data: Vec<u8>,
    name: &str,
    overwrite: bool,
    increment: bool,
) -> Result<UploadResponse, ApiError> {
    let target = storage.resolve_target(name)?;
    let file = MemoryFile::new(data).with_filename(name);
    let processor = session.create_processor(file, headers);
    let new_session = processor.is_new_session();
    let mut progress = StartProgress::new(processor)?;
    let request_id = progress.request_id().to_string();
    if new_session {
        info!(request_id = request_id.as_str(), name, "upload session started");
    }

    let done = progress.is_done();
    let mut path = None;
    if done {
        match progress.put(&target, overwrite, increment)? {
            Some(placed) => path = Some(display_path(storage.root_path(), &placed)),
            None => {
                return Err(ApiError::Conflict {
                    message: format!("{name} already exists"),
                    request_id: Some(request_id),
                });
            }
        }
    }

    Ok(UploadResponse {
        request_id,
        received: progress.size(),
        total: progress.content_range().and_then(|range| range.size()),
        done,
        remaining_requests: progress.remaining_requests(),
        path,
    })
}

fn required_request_id(headers: &HeaderMap) -> Result<RequestId, ApiError> {
    match RequestIdHeader::parse(&headers.header_line(REQUEST_ID_HEADER)) {
        RequestIdHeader::Valid(request_id) => Ok(request_id),
        RequestIdHeader::Missing => Err(ApiError::BadRequest(format!(
            "{REQUEST_ID_HEADER} header is required"
        ))),
        RequestIdHeader::Invalid(raw) => Err(UploadError::InvalidRequestId(raw).into()),
    }
}

/// `X-Request-Id`、`Upload-Offset` 以及已接收区间 `Range: bytes=0-<n-1>`。
fn offset_headers(request_id: &str, offset: u64) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-request-id"),
        header_value(request_id)?,
    );
    headers.insert(
        HeaderName::from_static(UPLOAD_OFFSET_HEADER),
        HeaderValue::from(offset),
    );
    if offset > 0 {
        headers.insert(header::RANGE, header_value(&format!("bytes=0-{}", offset - 1))?);
    }
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|err| ApiError::Internal(err.to_string()))
}

/// 相对存储根目录的展示路径，统一使用 `/` 分隔。
fn display_path(root: &Path, placed: &Path) -> String {
    match placed.strip_prefix(root) {
        Ok(relative) => relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => placed.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::UploadConfig;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        temp: TempDir,
        session: Arc<UploadSession>,
        storage: Arc<Storage>,
    }

    fn make_fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let cache = temp.path().join("cache");
        std::fs::create_dir_all(&cache).expect("cache dir");
        let root = std::path::absolute(temp.path().join("storage")).expect("absolute");
        let storage = Storage::new(root);
        storage.ensure_root().expect("storage root");
        let mut session = UploadSession::new(UploadConfig::new(cache)).expect("session");
        session.set_clean_on_drop(false);
        Fixture {
            temp,
            session: Arc::new(session),
            storage: Arc::new(storage),
        }
    }

    fn query(name: &str, overwrite: bool, increment: bool) -> Query<UploadQuery> {
        Query(UploadQuery {
            name: Some(name.to_string()),
            overwrite,
            increment,
        })
    }

    fn chunk_headers(range: Option<&str>, request_id: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(range) = range {
            headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(range).expect("range header"),
            );
        }
        if let Some(request_id) = request_id {
            headers.insert(
                "x-request-id",
                HeaderValue::from_str(request_id).expect("request id header"),
            );
        }
        headers
    }

    async fn send(
        fixture: &Fixture,
        query: Query<UploadQuery>,
        headers: HeaderMap,
        body: &'static str,
    ) -> Result<Response, ApiError> {
        upload_chunk(
            query,
            headers,
            Extension(fixture.session.clone()),
            Extension(fixture.storage.clone()),
            AxumBody::from(body),
        )
        .await
    }

    fn response_request_id(response: &Response) -> String {
        response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .expect("x-request-id header")
            .to_string()
    }

    fn stored(fixture: &Fixture, name: &str) -> Vec<u8> {
        std::fs::read(fixture.temp.path().join("storage").join(name)).expect("stored file")
    }

    #[tokio::test]
    async fn single_request_upload_is_finalized() {
        let fixture = make_fixture();
        let response = send(
            &fixture,
            query("docs/file.bin", false, true),
            HeaderMap::new(),
            "abc",
        )
        .await
        .unwrap_or_else(|_| panic!("upload failed"));

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response_request_id(&response).len(), 64);
        assert_eq!(
            response.headers().get(header::RANGE),
            Some(&HeaderValue::from_static("bytes=0-2"))
        );
        assert_eq!(stored(&fixture, "docs/file.bin"), b"abc");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["received"], 3);
        assert_eq!(json["done"], true);
        assert_eq!(json["path"], "docs/file.bin");
        assert!(json["total"].is_null());
    }

    #[tokio::test]
    async fn two_chunk_upload_resumes_with_request_id() {
        let fixture = make_fixture();
        let first = send(
            &fixture,
            query("file.bin", false, true),
            chunk_headers(Some("bytes 0-2/6"), None),
            "abc",
        )
        .await
        .unwrap_or_else(|_| panic!("first chunk failed"));
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let request_id = response_request_id(&first);

        let mut status_headers = HeaderMap::new();
        status_headers.insert(
            "x-request-id",
            HeaderValue::from_str(&request_id).expect("header"),
        );
        let status = upload_status(status_headers.clone(), Extension(fixture.session.clone()))
            .await
            .unwrap_or_else(|_| panic!("status failed"));
        assert_eq!(status.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            status.headers().get(UPLOAD_OFFSET_HEADER),
            Some(&HeaderValue::from(3u64))
        );
        assert_eq!(
            status.headers().get(header::RANGE),
            Some(&HeaderValue::from_static("bytes=0-2"))
        );

        let second = send(
            &fixture,
            query("file.bin", false, true),
            chunk_headers(Some("bytes 3-5/6"), Some(&request_id)),
            "def",
        )
        .await
        .unwrap_or_else(|_| panic!("second chunk failed"));
        assert_eq!(second.status(), StatusCode::CREATED);
        assert_eq!(response_request_id(&second), request_id);
        assert_eq!(stored(&fixture, "file.bin"), b"abcdef");

        // 缓存文件已移动到存储目录。
        let result = upload_status(status_headers, Extension(fixture.session.clone())).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn continuation_restarting_at_origin_is_rejected() {
        let fixture = make_fixture();
        let first = send(
            &fixture,
            query("file.bin", false, true),
            chunk_headers(Some("bytes 0-2/9"), None),
            "abc",
        )
        .await
        .unwrap_or_else(|_| panic!("first chunk failed"));
        let request_id = response_request_id(&first);

        let result = send(
            &fixture,
            query("file.bin", false, true),
            chunk_headers(Some("bytes 0-2/9"), Some(&request_id)),
            "abc",
        )
        .await;
        assert!(matches!(
            result,
            Err(ApiError::Upload(UploadError::InvalidOffsetPosition { .. }))
        ));
    }

    #[tokio::test]
    async fn upload_rejects_traversal_and_missing_name() {
        let fixture = make_fixture();
        let result = send(
            &fixture,
            query("../secret.txt", false, true),
            HeaderMap::new(),
            "abc",
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let result = send(
            &fixture,
            Query(UploadQuery {
                name: None,
                overwrite: false,
                increment: true,
            }),
            HeaderMap::new(),
            "abc",
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn file_name_header_is_used_without_query() {
        let fixture = make_fixture();
        let mut headers = HeaderMap::new();
        headers.insert(FILE_NAME_HEADER, HeaderValue::from_static("from-header.txt"));
        send(
            &fixture,
            Query(UploadQuery {
                name: None,
                overwrite: false,
                increment: true,
            }),
            headers,
            "xyz",
        )
        .await
        .unwrap_or_else(|_| panic!("upload failed"));
        assert_eq!(stored(&fixture, "from-header.txt"), b"xyz");
    }

    #[tokio::test]
    async fn existing_target_conflicts_until_overwrite() {
        let fixture = make_fixture();
        send(&fixture, query("file.bin", false, true), HeaderMap::new(), "old")
            .await
            .unwrap_or_else(|_| panic!("first upload failed"));

        let result = send(
            &fixture,
            query("file.bin", false, false),
            chunk_headers(Some("bytes 0-2/3"), None),
            "new",
        )
        .await;
        let Err(ApiError::Conflict {
            request_id: Some(request_id),
            ..
        }) = result
        else {
            panic!("expected conflict carrying the request id");
        };
        assert_eq!(stored(&fixture, "file.bin"), b"old");

        // 不重传数据，只带会话标识与 overwrite 完成落盘。
        let response = send(
            &fixture,
            query("file.bin", true, false),
            chunk_headers(None, Some(&request_id)),
            "",
        )
        .await
        .unwrap_or_else(|_| panic!("finalize retry failed"));
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response_request_id(&response), request_id);
        assert_eq!(stored(&fixture, "file.bin"), b"new");
    }

    #[tokio::test]
    async fn conflict_response_carries_request_id_header() {
        let fixture = make_fixture();
        send(&fixture, query("f.bin", false, true), HeaderMap::new(), "abc")
            .await
            .unwrap_or_else(|_| panic!("first upload failed"));

        let result = send(&fixture, query("f.bin", false, false), HeaderMap::new(), "xyz").await;
        let response = match result {
            Ok(_) => panic!("expected conflict"),
            Err(err) => err.into_response(),
        };
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let request_id = response_request_id(&response);
        let id = RequestId::new(&request_id).expect("valid id");
        assert_eq!(fixture.session.cache_size(&id).expect("size"), Some(3));
    }

    #[tokio::test]
    async fn increment_picks_free_name() {
        let fixture = make_fixture();
        for body in ["one", "two"] {
            send(&fixture, query("file.bin", false, true), HeaderMap::new(), body)
                .await
                .unwrap_or_else(|_| panic!("upload failed"));
        }
        assert_eq!(stored(&fixture, "file.bin"), b"one");
        assert_eq!(stored(&fixture, "file-1.bin"), b"two");
    }

    #[tokio::test]
    async fn abort_discards_partial_upload() {
        let fixture = make_fixture();
        let first = send(
            &fixture,
            query("file.bin", false, true),
            chunk_headers(Some("bytes 0-2/6"), None),
            "abc",
        )
        .await
        .unwrap_or_else(|_| panic!("first chunk failed"));
        let request_id = response_request_id(&first);

        let headers = chunk_headers(None, Some(&request_id));
        let status = abort_upload(headers.clone(), Extension(fixture.session.clone()))
            .await
            .unwrap_or_else(|_| panic!("abort failed"));
        assert_eq!(status, StatusCode::NO_CONTENT);

        let result = abort_upload(headers, Extension(fixture.session.clone())).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn status_requires_valid_request_id() {
        let fixture = make_fixture();
        let result = upload_status(HeaderMap::new(), Extension(fixture.session.clone())).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let headers = chunk_headers(None, Some("bad id!"));
        let result = upload_status(headers, Extension(fixture.session.clone())).await;
        assert!(matches!(
            result,
            Err(ApiError::Upload(UploadError::InvalidRequestId(_)))
        ));
    }
}
