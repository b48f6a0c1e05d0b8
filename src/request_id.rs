//! `X-Request-Id` 头解析与上传会话标识生成。

use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;

/// 携带上传会话标识的请求头。
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

const MAX_REQUEST_ID_LEN: usize = 128;
const RANDOM_BYTES: usize = 16;

/// 校验过的上传会话标识。
///
/// 只接受 `[A-Za-z0-9_-]`，可以直接用作缓存目录中的文件名。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// 校验并构造标识，不合法时返回 `None`。
    pub fn new(value: &str) -> Option<Self> {
        is_valid_request_id(value).then(|| Self(value.to_string()))
    }

    /// 基于客户端文件名与随机字节生成新的会话标识。
    pub fn generate(client_filename: &str) -> Self {
        let mut salt = [0u8; RANDOM_BYTES];
        rand::thread_rng().fill(&mut salt);
        let mut hasher = Sha256::new();
        hasher.update(client_filename.as_bytes());
        hasher.update(salt);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `X-Request-Id` 请求头的解析结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestIdHeader {
    /// 缺失或为空：开启新会话。
    Missing,
    /// 存在但不是合法标识。
    Invalid(String),
    Valid(RequestId),
}

impl RequestIdHeader {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return RequestIdHeader::Missing;
        }
        match RequestId::new(trimmed) {
            Some(id) => RequestIdHeader::Valid(id),
            None => RequestIdHeader::Invalid(raw.to_string()),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, RequestIdHeader::Missing)
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, RequestIdHeader::Valid(_))
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            RequestIdHeader::Valid(id) => Some(id),
            _ => None,
        }
    }
}

impl From<&str> for RequestIdHeader {
    fn from(raw: &str) -> Self {
        RequestIdHeader::parse(raw)
    }
}

impl From<Option<&str>> for RequestIdHeader {
    fn from(raw: Option<&str>) -> Self {
        raw.map(RequestIdHeader::parse)
            .unwrap_or(RequestIdHeader::Missing)
    }
}

fn is_valid_request_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_header_is_missing() {
        assert_eq!(RequestIdHeader::parse(""), RequestIdHeader::Missing);
        assert_eq!(RequestIdHeader::parse("   "), RequestIdHeader::Missing);
        assert_eq!(RequestIdHeader::from(None), RequestIdHeader::Missing);
    }

    #[test]
    fn accepts_plain_tokens_unchanged() {
        let header = RequestIdHeader::parse("abc123");
        assert!(header.is_valid());
        assert_eq!(header.request_id().map(RequestId::as_str), Some("abc123"));

        let uuid = "0d6f1e0c-8f7a-4a7e-9d55-0c4a4b4c0f11";
        assert_eq!(
            RequestIdHeader::parse(uuid).request_id().map(RequestId::as_str),
            Some(uuid)
        );
    }

    #[test]
    fn rejects_path_like_and_oversized_values() {
        assert!(matches!(
            RequestIdHeader::parse("../etc/passwd"),
            RequestIdHeader::Invalid(_)
        ));
        assert!(matches!(
            RequestIdHeader::parse("abc.part"),
            RequestIdHeader::Invalid(_)
        ));
        let long = "a".repeat(MAX_REQUEST_ID_LEN + 1);
        assert!(matches!(
            RequestIdHeader::parse(&long),
            RequestIdHeader::Invalid(_)
        ));
    }

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let a = RequestId::generate("movie.mkv");
        let b = RequestId::generate("movie.mkv");
        assert_eq!(a.as_str().len(), 64);
        assert!(RequestId::new(a.as_str()).is_some());
        assert_ne!(a, b);
    }
}
