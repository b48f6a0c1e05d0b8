//! chunkdrop: a resumable chunked-upload engine.
//!
//! Clients send a file as a series of `Content-Range` chunks tied together by
//! an `X-Request-Id` session identifier. Each chunk is appended to a partial
//! file in the cache directory under an exclusive lock; once the declared size
//! is reached the partial file is moved into its final location. Abandoned
//! partial files are swept by age.
//!
//! The engine itself is synchronous and transport independent. The [`upload`]
//! module exposes it over axum.

pub mod atomic;
pub mod background;
pub mod config;
pub mod content_range;
pub mod error;
pub mod handler;
pub mod http;
pub mod logging;
pub mod processor;
pub mod progress;
pub mod request_id;
pub mod session;
pub mod source;
pub mod storage;
pub mod upload;

pub use content_range::{ByteRange, ContentRange, ContentRangeHeader};
pub use error::{ErrorClass, UploadError};
pub use handler::{ChunkHandler, HandlerStatus};
pub use processor::ChunkProcessor;
pub use progress::StartProgress;
pub use request_id::{RequestId, RequestIdHeader};
pub use session::{UploadConfig, UploadSession};
pub use source::{DiskFile, HeaderSource, MemoryFile, UploadedFile};
