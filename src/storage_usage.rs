//! 存储用量来源
//!
//! 仅用于健康检查阈值（75% 警告 / 90% 严重）。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::AppError;

type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub available_bytes: u64,
    pub used_bytes: u64,
}

impl StorageUsage {
    pub fn total_bytes(&self) -> u64 {
        self.available_bytes.saturating_add(self.used_bytes)
    }

    /// 已用百分比 (0.0 - 100.0)，总量为 0 时视为 0
    pub fn usage_percent(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / total as f64 * 100.0
    }
}

#[async_trait]
pub trait StorageUsageSource: Send + Sync {
    async fn usage(&self) -> Result<StorageUsage>;
}

/// 通过 statvfs 读取受管目录所在文件系统的用量
#[derive(Debug, Clone)]
pub struct DiskUsageSource {
    path: PathBuf,
}

impl DiskUsageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StorageUsageSource for DiskUsageSource {
    async fn usage(&self) -> Result<StorageUsage> {
        let path = existing_ancestor(&self.path);
        tokio::task::spawn_blocking(move || statvfs_usage(&path))
            .await
            .map_err(|e| AppError::unknown(format!("存储用量查询任务失败: {}", e)))?
    }
}

/// 向上查找第一个存在的目录，都不存在时回退到根目录
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(unix)]
fn statvfs_usage(path: &Path) -> Result<StorageUsage> {
    use std::ffi::CString;

    let path_str = path
        .to_str()
        .ok_or_else(|| AppError::validation("路径包含无效 UTF-8 字符".to_string()))?;

    let c_path = CString::new(path_str)
        .map_err(|e| AppError::validation(format!("路径包含空字节，无法传递给 statvfs: {}", e)))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };

    if ret != 0 {
        let errno = std::io::Error::last_os_error();
        return Err(AppError::file_system(format!(
            "statvfs 调用失败 (path={:?}): {}",
            path, errno
        )));
    }

    // f_bavail: 非特权进程可用的块数；f_bfree 包含保留块
    let frsize = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * frsize;
    let free = stat.f_bfree as u64 * frsize;
    let available = stat.f_bavail as u64 * frsize;
    let used = total.saturating_sub(free);

    tracing::debug!(
        "[StorageUsage] statvfs 成功: path={}, used={} bytes, available={} bytes",
        path_str,
        used,
        available
    );

    Ok(StorageUsage {
        available_bytes: available,
        used_bytes: used,
    })
}

#[cfg(not(unix))]
fn statvfs_usage(path: &Path) -> Result<StorageUsage> {
    Err(AppError::configuration(format!(
        "当前平台不支持读取存储用量: {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_percent() {
        let usage = StorageUsage {
            available_bytes: 25,
            used_bytes: 75,
        };
        assert_eq!(usage.total_bytes(), 100);
        assert!((usage.usage_percent() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_usage_percent_zero_total() {
        let usage = StorageUsage {
            available_bytes: 0,
            used_bytes: 0,
        };
        assert_eq!(usage.usage_percent(), 0.0);
    }

    #[test]
    fn test_existing_ancestor_falls_back_to_parent() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("a").join("b");
        assert_eq!(existing_ancestor(&missing), dir.path());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disk_usage_source_reads_tempdir() {
        let dir = tempfile::TempDir::new().unwrap();
        let usage = DiskUsageSource::new(dir.path()).usage().await.unwrap();
        assert!(usage.total_bytes() > 0);
        let percent = usage.usage_percent();
        assert!((0.0..=100.0).contains(&percent));
    }
}
