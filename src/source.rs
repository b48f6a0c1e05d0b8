//! 传输层协作接口：上传字节流与请求头读取。

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

/// 传输层交来的单个分片字节流。
pub trait UploadedFile: Read {
    /// 数据流总字节数，传输层已知时提供。
    fn size(&self) -> Option<u64>;

    /// 客户端声明的文件名，用于生成新会话标识。
    fn client_filename(&self) -> Option<&str> {
        None
    }

    /// 回到第一个字节；不可定位的数据流返回 `false`。
    fn rewind(&mut self) -> io::Result<bool> {
        Ok(false)
    }
}

/// 请求头读取接口。
pub trait HeaderSource {
    /// `name` 的所有取值以 `", "` 连接，缺失时为空字符串。
    fn header_line(&self, name: &str) -> String;
}

impl HeaderSource for [(&str, &str)] {
    fn header_line(&self, name: &str) -> String {
        self.iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl<const N: usize> HeaderSource for [(&str, &str); N] {
    fn header_line(&self, name: &str) -> String {
        self.as_slice().header_line(name)
    }
}

/// 已缓冲在内存中的上传数据。
pub struct MemoryFile<T> {
    cursor: Cursor<T>,
    filename: Option<String>,
}

impl<T: AsRef<[u8]>> MemoryFile<T> {
    pub fn new(data: T) -> Self {
        Self {
            cursor: Cursor::new(data),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

impl<T: AsRef<[u8]>> Read for MemoryFile<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl<T: AsRef<[u8]>> UploadedFile for MemoryFile<T> {
    fn size(&self) -> Option<u64> {
        Some(self.cursor.get_ref().as_ref().len() as u64)
    }

    fn client_filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    fn rewind(&mut self) -> io::Result<bool> {
        self.cursor.set_position(0);
        Ok(true)
    }
}

/// 传输层暂存到磁盘文件的上传数据。
pub struct DiskFile {
    file: File,
    size: u64,
    filename: Option<String>,
}

impl DiskFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            filename: None,
        })
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

impl Read for DiskFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl UploadedFile for DiskFile {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn client_filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    fn rewind(&mut self) -> io::Result<bool> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(true)
    }
}
