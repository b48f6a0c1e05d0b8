//! `Content-Range` 头解析：`<unit> <start>-<end>/<size>`。

/// 描述分片在整个文件中位置的请求头。
pub const CONTENT_RANGE_HEADER: &str = "Content-Range";

/// 单个分片携带的闭区间字节范围。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }
}

/// 语法合法的 `Content-Range` 值。
///
/// `bytes */100` 的 `range` 为 `None`，`bytes 0-9/*` 的 `size` 为 `None`。
/// 两者都能解析，但上传校验会拒绝。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentRange {
    unit: String,
    range: Option<ByteRange>,
    size: Option<u64>,
}

impl ContentRange {
    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn range(&self) -> Option<ByteRange> {
        self.range
    }

    pub fn start(&self) -> Option<u64> {
        self.range.map(|range| range.start)
    }

    pub fn end(&self) -> Option<u64> {
        self.range.map(|range| range.end)
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// 当前分片的字节数。
    pub fn len(&self) -> Option<u64> {
        self.range.map(|range| range.len())
    }

    /// 分片末尾是否恰好到达声明的总大小。
    pub fn is_last_chunk(&self) -> bool {
        match (self.range, self.size) {
            (Some(range), Some(size)) => range.end.saturating_add(1) >= size,
            _ => false,
        }
    }

    pub fn is_unit_accepted(&self, accepted: &[String]) -> bool {
        accepted
            .iter()
            .any(|unit| unit.eq_ignore_ascii_case(&self.unit))
    }
}

/// `Content-Range` 请求头的解析结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentRangeHeader {
    /// 无此头：请求体就是完整文件。
    Absent,
    Invalid(String),
    Parsed(ContentRange),
}

impl ContentRangeHeader {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return ContentRangeHeader::Absent;
        }
        match parse_content_range(trimmed) {
            Some(parsed) => ContentRangeHeader::Parsed(parsed),
            None => ContentRangeHeader::Invalid(raw.to_string()),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, ContentRangeHeader::Absent)
    }

    pub fn content_range(&self) -> Option<&ContentRange> {
        match self {
            ContentRangeHeader::Parsed(parsed) => Some(parsed),
            _ => None,
        }
    }
}

impl From<&str> for ContentRangeHeader {
    fn from(raw: &str) -> Self {
        ContentRangeHeader::parse(raw)
    }
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let (unit, rest) = value.split_once(char::is_whitespace)?;
    if unit.is_empty() || !unit.bytes().all(|byte| byte.is_ascii_alphanumeric()) {
        return None;
    }
    let (range_part, size_part) = rest.trim().split_once('/')?;

    let range = match range_part {
        "*" => None,
        _ => {
            let (start, end) = range_part.split_once('-')?;
            let start = parse_number(start)?;
            let end = parse_number(end)?;
            // `end + 1` must stay representable.
            if start > end || end == u64::MAX {
                return None;
            }
            Some(ByteRange { start, end })
        }
    };
    let size = match size_part {
        "*" => None,
        _ => Some(parse_number(size_part)?),
    };
    if range.is_none() && size.is_none() {
        return None;
    }

    Some(ContentRange {
        unit: unit.to_string(),
        range,
        size,
    })
}

// `u64::from_str` accepts a leading `+`; the header grammar does not.
fn parse_number(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
