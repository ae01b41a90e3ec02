//! 文件存储抽象
//!
//! 恢复核心只通过这个窄接口访问文件系统：存在性检查、元数据、
//! 复制、移动、删除与目录列举。默认实现 `LocalFileStore` 基于 `tokio::fs`。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs as async_fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::models::{AppError, AppErrorType};

type Result<T> = std::result::Result<T, AppError>;

/// 复制失败时的最大重试次数（不含首次尝试）
const COPY_RETRY_TIMES: usize = 2;

/// 复制重试的初始延迟
const COPY_RETRY_MIN_DELAY: Duration = Duration::from_millis(50);

/// 文件元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// 路径是否存在（必须准确）
    async fn exists(&self, path: &Path) -> bool;

    /// 读取元数据；存在但无法读取元数据的文件会被视为损坏
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// 复制文件，返回写入的字节数。目标的父目录不存在时自动创建。
    async fn copy(&self, from: &Path, to: &Path) -> Result<u64>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn remove(&self, path: &Path) -> Result<()>;

    /// 列举目录的直接子项
    async fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// 递归列举目录下的所有非目录项
    async fn walk_files(&self, root: &Path) -> Result<Vec<PathBuf>>;

    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;
}

/// 为 IO 错误附加上下文，同时保留 NotFound / Capacity 分类
fn io_error(action: &str, path: &Path, err: std::io::Error) -> AppError {
    let base = AppError::from(err);
    AppError::new(
        base.error_type,
        format!("{}失败 {}: {}", action, path.display(), base.message),
    )
}

/// 本地文件系统实现
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore;

impl LocalFileStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn exists(&self, path: &Path) -> bool {
        async_fs::try_exists(path).await.unwrap_or(false)
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let meta = async_fs::metadata(path)
            .await
            .map_err(|e| io_error("读取元数据", path, e))?;
        let modified = meta
            .modified()
            .map_err(|e| io_error("读取修改时间", path, e))?;
        Ok(FileMetadata {
            size: meta.len(),
            modified: DateTime::<Utc>::from(modified),
            is_dir: meta.is_dir(),
        })
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        if let Some(parent) = to.parent() {
            async_fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("创建目录", parent, e))?;
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(COPY_RETRY_MIN_DELAY)
            .with_max_times(COPY_RETRY_TIMES);

        let bytes = (|| async { async_fs::copy(from, to).await })
            .retry(&backoff)
            .when(|e: &std::io::Error| e.kind() != std::io::ErrorKind::NotFound)
            .notify(|e: &std::io::Error, delay: Duration| {
                warn!(
                    "[FileStore] 复制失败，{:?} 后重试: {} -> {}: {}",
                    delay,
                    from.display(),
                    to.display(),
                    e
                );
            })
            .await
            .map_err(|e| io_error("复制文件", from, e))?;

        debug!(
            "[FileStore] 已复制 {} -> {} ({} bytes)",
            from.display(),
            to.display(),
            bytes
        );
        Ok(bytes)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        async_fs::rename(from, to)
            .await
            .map_err(|e| io_error("移动文件", from, e))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        async_fs::remove_file(path)
            .await
            .map_err(|e| io_error("删除文件", path, e))
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = async_fs::read_dir(path)
            .await
            .map_err(|e| io_error("读取目录", path, e))?;
        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => paths.push(entry.path()),
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "[FileStore] Directory entry read error (skipped): {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
        Ok(paths)
    }

    async fn walk_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("[FileStore] Directory entry read error (skipped): {}", e);
                        None
                    }
                })
                .filter(|entry| !entry.file_type().is_dir())
                .map(|entry| entry.into_path())
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| AppError::new(AppErrorType::Unknown, format!("目录扫描任务失败: {}", e)))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        async_fs::read(path)
            .await
            .map_err(|e| io_error("读取文件", path, e))
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        async_fs::create_dir_all(path)
            .await
            .map_err(|e| io_error("创建目录", path, e))
    }
}
