//! 分片请求校验：在写入任何字节之前检查协议约束。

use tracing::{debug, warn};

use crate::content_range::{ContentRange, ContentRangeHeader};
use crate::error::UploadError;
use crate::handler::ChunkHandler;
use crate::request_id::{RequestId, RequestIdHeader};
use crate::session::UploadSession;
use crate::source::UploadedFile;

/// 在一次请求内绑定分片数据与解析后的请求头。
pub struct ChunkProcessor<'a, F> {
    session: &'a UploadSession,
    file: F,
    content_range: ContentRangeHeader,
    request_id: RequestIdHeader,
}

impl<'a, F: UploadedFile> ChunkProcessor<'a, F> {
    pub fn new(
        session: &'a UploadSession,
        file: F,
        content_range: impl Into<ContentRangeHeader>,
        request_id: impl Into<RequestIdHeader>,
    ) -> Self {
        Self {
            session,
            file,
            content_range: content_range.into(),
            request_id: request_id.into(),
        }
    }

    pub fn content_range(&self) -> &ContentRangeHeader {
        &self.content_range
    }

    pub fn request_id_header(&self) -> &RequestIdHeader {
        &self.request_id
    }

    /// 未携带会话标识，即新上传的第一个分片。
    pub fn is_new_session(&self) -> bool {
        self.request_id.is_missing()
    }

    /// 校验请求并返回负责写入的处理器。
    ///
    /// 这里不写入任何字节。唯一的副作用：续传请求从 0 开始时，
    /// 其分片文件视为损坏，先删除再返回错误。
    pub fn handler(self) -> Result<ChunkHandler<'a, F>, UploadError> {
        let range = match &self.content_range {
            ContentRangeHeader::Absent => None,
            ContentRangeHeader::Invalid(raw) => {
                return Err(UploadError::InvalidContentRange(raw.clone()));
            }
            ContentRangeHeader::Parsed(parsed) => Some(parsed),
        };
        if let Some(range) = range {
            self.check_declared_range(range)?;
        }
        let start = range.and_then(ContentRange::start);

        let request_id = match &self.request_id {
            RequestIdHeader::Missing => {
                if let Some(start) = start.filter(|start| *start > 0) {
                    return Err(UploadError::InvalidOffsetPosition {
                        expected: 0,
                        actual: start,
                    });
                }
                RequestId::generate(self.file.client_filename().unwrap_or_default())
            }
            RequestIdHeader::Invalid(raw) => {
                return Err(UploadError::InvalidRequestId(raw.clone()));
            }
            RequestIdHeader::Valid(id) => {
                let current = self.session.cache_size(id)?.unwrap_or(0);
                if start == Some(0) {
                    self.session.discard(id)?;
                    warn!(
                        request_id = id.as_str(),
                        current, "continuation restarted at origin, partial upload dropped"
                    );
                    return Err(UploadError::InvalidOffsetPosition {
                        expected: current,
                        actual: 0,
                    });
                }
                id.clone()
            }
        };

        let stream_size = self.file.size();
        let limit = match range {
            Some(range) => {
                self.check_stream_against_range(range, stream_size)?;
                range.len()
            }
            None => {
                if let (Some(max), Some(size)) = (self.session.max_file_size(), stream_size)
                    && size > max
                {
                    return Err(UploadError::OutOfRange(format!(
                        "upload of {size} bytes exceeds limit of {max}"
                    )));
                }
                None
            }
        };

        if let Some(start) = start
            && !self.request_id.is_missing()
        {
            let current = self.session.cache_size(&request_id)?.unwrap_or(0);
            if start != current {
                return Err(UploadError::InvalidOffsetPosition {
                    expected: current,
                    actual: start,
                });
            }
        }

        debug!(
            request_id = request_id.as_str(),
            start,
            length = limit,
            total = range.and_then(ContentRange::size),
            "chunk accepted"
        );
        Ok(ChunkHandler::new(self.session, request_id, self.file).with_limit(limit))
    }

    fn check_declared_range(&self, range: &ContentRange) -> Result<(), UploadError> {
        if !range.is_unit_accepted(self.session.accepted_units()) {
            return Err(UploadError::InvalidContentRange(format!(
                "unit {:?} is not accepted",
                range.unit()
            )));
        }
        let Some(size) = range.size() else {
            return Err(UploadError::ContentRangeUnfulfillable(
                "total size must be declared".into(),
            ));
        };
        let Some(bytes) = range.range() else {
            return Err(UploadError::ContentRangeUnfulfillable(
                "a concrete byte range is required".into(),
            ));
        };
        if let Some(max) = self.session.max_file_size()
            && (size > max || bytes.end.saturating_add(1) > max)
        {
            return Err(UploadError::OutOfRange(format!(
                "upload of {size} bytes exceeds limit of {max}"
            )));
        }
        if let Some(min) = self.session.min_chunk_size()
            && bytes.len() < min
            && !range.is_last_chunk()
        {
            return Err(UploadError::OutOfRange(format!(
                "chunk of {} bytes is below minimum of {min}",
                bytes.len()
            )));
        }
        Ok(())
    }

    fn check_stream_against_range(
        &self,
        range: &ContentRange,
        stream_size: Option<u64>,
    ) -> Result<(), UploadError> {
        let (Some(bytes), Some(size)) = (range.range(), range.size()) else {
            return Ok(());
        };
        if let Some(stream_size) = stream_size {
            if stream_size < bytes.len() {
                return Err(UploadError::OutOfRange(format!(
                    "body has {stream_size} bytes, range declares {}",
                    bytes.len()
                )));
            }
            if size < stream_size {
                return Err(UploadError::OutOfRange(format!(
                    "body has {stream_size} bytes, total size is {size}"
                )));
            }
        }
        if bytes.end >= size {
            return Err(UploadError::OutOfRange(format!(
                "range ends at {} but total size is {size}",
                bytes.end
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::UploadConfig;
    use crate::source::MemoryFile;
    use tempfile::{TempDir, tempdir};

    fn make_session() -> (TempDir, UploadSession) {
        let temp = tempdir().expect("tempdir");
        let mut session = UploadSession::new(UploadConfig::new(temp.path())).expect("session");
        session.set_clean_on_drop(false);
        (temp, session)
    }

    fn body(len: usize) -> MemoryFile<Vec<u8>> {
        MemoryFile::new(vec![b'x'; len]).with_filename("file.bin")
    }

    fn seed(session: &UploadSession, id: &str, len: usize) {
        let id = RequestId::new(id).expect("id");
        std::fs::write(session.cache_path(&id), vec![b'x'; len]).expect("seed");
    }

    #[test]
    fn absent_range_mints_new_id() {
        let (_temp, session) = make_session();
        let handler = session
            .processor(body(3), "", RequestIdHeader::Missing)
            .handler()
            .expect("handler");
        assert_eq!(handler.request_id().as_str().len(), 64);
    }

    #[test]
    fn invalid_range_and_unit_are_rejected() {
        let (_temp, session) = make_session();
        let result = session.processor(body(5), "bytes 4-0/10", "").handler();
        assert!(matches!(result, Err(UploadError::InvalidContentRange(_))));

        let result = session.processor(body(5), "items 0-4/10", "").handler();
        assert!(matches!(result, Err(UploadError::InvalidContentRange(_))));
    }

    #[test]
    fn unknown_total_size_is_unfulfillable() {
        let (_temp, session) = make_session();
        let result = session.processor(body(5), "bytes 0-4/*", "").handler();
        assert!(matches!(
            result,
            Err(UploadError::ContentRangeUnfulfillable(_))
        ));
        let result = session.processor(body(5), "bytes */10", "").handler();
        assert!(matches!(
            result,
            Err(UploadError::ContentRangeUnfulfillable(_))
        ));
    }

    #[test]
    fn max_file_size_is_enforced() {
        let (_temp, mut session) = make_session();
        session.set_max_file_size(Some(8));
        let result = session.processor(body(5), "bytes 0-4/10", "").handler();
        assert!(matches!(result, Err(UploadError::OutOfRange(_))));

        let result = session.processor(body(9), "", "").handler();
        assert!(matches!(result, Err(UploadError::OutOfRange(_))));
    }

    #[test]
    fn short_final_chunk_passes_minimum_size() {
        let (_temp, mut session) = make_session();
        session.set_min_chunk_size(Some(4));

        let result = session.processor(body(2), "bytes 0-1/10", "").handler();
        assert!(matches!(result, Err(UploadError::OutOfRange(_))));

        seed(&session, "tail", 8);
        session
            .processor(body(2), "bytes 8-9/10", "tail")
            .handler()
            .expect("last chunk may be short");
    }

    #[test]
    fn new_session_must_start_at_zero() {
        let (_temp, session) = make_session();
        let result = session.processor(body(5), "bytes 5-9/10", "").handler();
        assert!(matches!(
            result,
            Err(UploadError::InvalidOffsetPosition {
                expected: 0,
                actual: 5
            })
        ));
    }

    #[test]
    fn invalid_request_id_is_rejected() {
        let (_temp, session) = make_session();
        let result = session.processor(body(5), "bytes 5-9/10", "../x").handler();
        assert!(matches!(result, Err(UploadError::InvalidRequestId(_))));
    }

    #[test]
    fn continuation_at_origin_drops_partial_file() {
        let (_temp, session) = make_session();
        seed(&session, "abc123", 5);
        let result = session.processor(body(5), "bytes 0-4/10", "abc123").handler();
        assert!(matches!(
            result,
            Err(UploadError::InvalidOffsetPosition {
                expected: 5,
                actual: 0
            })
        ));
        let id = RequestId::new("abc123").expect("id");
        assert!(!session.cache_path(&id).exists());
    }

    #[test]
    fn continuation_must_match_cache_size() {
        let (_temp, session) = make_session();
        seed(&session, "abc123", 3);
        let result = session.processor(body(5), "bytes 5-9/10", "abc123").handler();
        assert!(matches!(
            result,
            Err(UploadError::InvalidOffsetPosition {
                expected: 3,
                actual: 5
            })
        ));
        let id = RequestId::new("abc123").expect("id");
        assert_eq!(session.cache_size(&id).expect("size"), Some(3));
    }

    #[test]
    fn body_shorter_than_range_is_rejected() {
        let (_temp, session) = make_session();
        let result = session.processor(body(3), "bytes 0-4/10", "").handler();
        assert!(matches!(result, Err(UploadError::OutOfRange(_))));
    }

    #[test]
    fn body_larger_than_total_is_rejected() {
        let (_temp, session) = make_session();
        let result = session.processor(body(12), "bytes 0-4/10", "").handler();
        assert!(matches!(result, Err(UploadError::OutOfRange(_))));

        let result = session.processor(body(5), "bytes 0-10/10", "").handler();
        assert!(matches!(result, Err(UploadError::OutOfRange(_))));
    }

    #[test]
    fn overflowing_range_end_is_invalid() {
        let (_temp, session) = make_session();
        let result = session
            .processor(
                body(4),
                "bytes 0-18446744073709551615/18446744073709551615",
                "",
            )
            .handler();
        assert!(matches!(result, Err(UploadError::InvalidContentRange(_))));

        let result = session
            .processor(
                body(4),
                "bytes 0-18446744073709551614/18446744073709551615",
                "",
            )
            .handler();
        assert!(matches!(result, Err(UploadError::OutOfRange(_))));
    }

    #[test]
    fn headers_are_read_from_request() {
        let (_temp, session) = make_session();
        seed(&session, "abc123", 5);
        let request = [("content-range", "bytes 5-9/10"), ("x-request-id", "abc123")];
        let processor = session.create_processor(body(5), &request);
        assert!(!processor.is_new_session());
        let handler = processor.handler().expect("handler");
        assert_eq!(handler.request_id().as_str(), "abc123");
    }
}
