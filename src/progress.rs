//! 上传进度门面：计算写入偏移并立即写入当前分片。

use std::ops::{Deref, DerefMut};

use crate::content_range::ContentRange;
use crate::error::UploadError;
use crate::handler::ChunkHandler;
use crate::processor::ChunkProcessor;
use crate::source::UploadedFile;

/// 已写入当前分片的 [`ChunkHandler`]。
///
/// 通过 `Deref` 直接调用处理器的 `put`、`size` 等方法。
pub struct StartProgress<'a, F: UploadedFile> {
    handler: ChunkHandler<'a, F>,
    content_range: Option<ContentRange>,
}

impl<'a, F: UploadedFile> StartProgress<'a, F> {
    /// 校验请求并写入分片。
    ///
    /// 新会话从 0 写入，续传从声明的起点写入，无 `Content-Range` 时追加到缓存末尾。
    pub fn new(processor: ChunkProcessor<'a, F>) -> Result<Self, UploadError> {
        let content_range = processor.content_range().content_range().cloned();
        let offset = if processor.is_new_session() {
            Some(0)
        } else {
            content_range.as_ref().and_then(ContentRange::start)
        };
        let mut handler = processor.handler()?;
        handler.start(offset)?;
        Ok(Self {
            handler,
            content_range,
        })
    }

    pub fn content_range(&self) -> Option<&ContentRange> {
        self.content_range.as_ref()
    }

    /// 无分片头，或缓存大小已达到声明总大小。
    pub fn is_done(&self) -> bool {
        match self.content_range.as_ref().and_then(ContentRange::size) {
            None => true,
            Some(total) => self.handler.size() >= total,
        }
    }

    /// 按当前分片长度还需要的请求数，无法计算时为 `None`。
    pub fn remaining_requests(&self) -> Option<u64> {
        let range = self.content_range.as_ref()?;
        let total = range.size()?;
        let length = range.len().filter(|length| *length > 0)?;
        let current = self.handler.size();
        Some(
            total
                .div_ceil(length)
                .saturating_sub(current.div_ceil(length)),
        )
    }

    pub fn into_handler(self) -> ChunkHandler<'a, F> {
        self.handler
    }
}

impl<'a, F: UploadedFile> Deref for StartProgress<'a, F> {
    type Target = ChunkHandler<'a, F>;

    fn deref(&self) -> &Self::Target {
        &self.handler
    }
}

impl<F: UploadedFile> DerefMut for StartProgress<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.handler
    }
}
