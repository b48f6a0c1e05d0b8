//! CLI arguments and upload engine defaults.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::UploadConfig;

pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const COPY_BUFFER_SIZE: usize = 2 * 1024;
pub const DEFAULT_PARTIAL_EXTENSION: &str = "part";
pub const DEFAULT_ACCEPTED_UNIT: &str = "bytes";
pub const DEFAULT_INCREMENT_SEPARATOR: &str = "-";
pub const DEFAULT_MAX_INCREMENT: u32 = 100;
pub const DEFAULT_MAX_DELETION_COUNT: usize = 100;
pub const DEFAULT_MAX_AGE_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 900;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "chunkdrop", version, about = "Resumable chunked upload server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "CHUNKDROP_STORAGE_DIR",
        default_value = ".chunkdrop/storage",
        help = "Destination directory for completed uploads"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'c',
        long,
        env = "CHUNKDROP_CACHE_DIR",
        default_value = ".chunkdrop/cache",
        help = "Directory holding partial uploads"
    )]
    pub cache_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "CHUNKDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CHUNKDROP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "CHUNKDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "CHUNKDROP_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload total size in bytes (0 to disable)"
    )]
    pub max_size: u64,
    #[arg(
        long,
        env = "CHUNKDROP_MIN_CHUNK_SIZE",
        default_value_t = 0,
        help = "Min size of every chunk but the last, in bytes (0 to disable)"
    )]
    pub min_chunk_size: u64,
    #[arg(
        long,
        env = "CHUNKDROP_PARTIAL_EXTENSION",
        default_value = DEFAULT_PARTIAL_EXTENSION,
        help = "File extension of partial uploads"
    )]
    pub partial_extension: String,
    #[arg(
        long,
        env = "CHUNKDROP_MAX_AGE_SECS",
        default_value_t = DEFAULT_MAX_AGE_SECS,
        help = "Age in seconds after which a partial upload is swept"
    )]
    pub max_age_secs: u64,
    #[arg(
        long,
        env = "CHUNKDROP_MAX_DELETIONS",
        default_value_t = DEFAULT_MAX_DELETION_COUNT,
        help = "Max partial uploads deleted per sweep"
    )]
    pub max_deletions: usize,
    #[arg(
        long,
        env = "CHUNKDROP_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        help = "Sweep interval in seconds (0 to disable)"
    )]
    pub sweep_interval_secs: u64,
    #[arg(
        long,
        env = "CHUNKDROP_MAX_INCREMENT",
        default_value_t = DEFAULT_MAX_INCREMENT,
        help = "Max numbered names tried when a destination exists"
    )]
    pub max_increment: u32,
    #[arg(
        long,
        env = "CHUNKDROP_INCREMENT_SEPARATOR",
        default_value = DEFAULT_INCREMENT_SEPARATOR,
        help = "Separator between file stem and number"
    )]
    pub increment_separator: String,
}

impl Args {
    /// 根据命令行参数构建上传引擎配置。
    pub fn upload_config(&self) -> UploadConfig {
        let mut config = UploadConfig::new(PathBuf::from(&self.cache_dir));
        config.partial_extension = self.partial_extension.clone();
        config.max_file_size = (self.max_size > 0).then_some(self.max_size);
        config.min_chunk_size = (self.min_chunk_size > 0).then_some(self.min_chunk_size);
        config.max_age = Duration::from_secs(self.max_age_secs);
        config.max_deletion_count = self.max_deletions;
        config.max_increment = self.max_increment;
        config.increment_separator = self.increment_separator.clone();
        config
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}
