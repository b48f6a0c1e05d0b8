//! 过期分片文件的定时清理任务。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::UploadSession;

/// 按固定间隔在阻塞线程池中执行 `clean`，错误只记录不上抛。
pub fn spawn_sweep_task(session: Arc<UploadSession>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let session = session.clone();
            match tokio::task::spawn_blocking(move || session.clean(None)).await {
                Ok(Ok(deleted)) => debug!(deleted, "partial upload sweep finished"),
                Ok(Err(err)) => warn!(error = %err, "partial upload sweep failed"),
                Err(err) => warn!(error = %err, "partial upload sweep panicked"),
            }
        }
    })
}
