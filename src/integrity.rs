//! 备份完整性校验策略
//!
//! 默认的 `FingerprintStrategy` 只取「大小 + 修改时间」，代价极低，
//! 但无法发现同大小的内容损坏；需要更强保证时换用 `Sha256Strategy`。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::file_store::FileStore;
use crate::models::AppError;

type Result<T> = std::result::Result<T, AppError>;

/// 可配置的策略名
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityMode {
    #[default]
    Fingerprint,
    Sha256,
}

impl IntegrityMode {
    pub fn strategy(self) -> Arc<dyn IntegrityStrategy> {
        match self {
            IntegrityMode::Fingerprint => Arc::new(FingerprintStrategy),
            IntegrityMode::Sha256 => Arc::new(Sha256Strategy),
        }
    }
}

#[async_trait]
pub trait IntegrityStrategy: Send + Sync {
    /// 写入 BackupRecord.integrity_method 的名字
    fn name(&self) -> &'static str;

    async fn compute(&self, files: &dyn FileStore, path: &Path) -> Result<String>;

    async fn verify(&self, files: &dyn FileStore, path: &Path, expected: &str) -> Result<bool> {
        Ok(self.compute(files, path).await? == expected)
    }
}

/// 大小 + 修改时间（毫秒）
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintStrategy;

pub const FINGERPRINT_METHOD: &str = "fingerprint";
pub const SHA256_METHOD: &str = "sha256";

#[async_trait]
impl IntegrityStrategy for FingerprintStrategy {
    fn name(&self) -> &'static str {
        FINGERPRINT_METHOD
    }

    async fn compute(&self, files: &dyn FileStore, path: &Path) -> Result<String> {
        let meta = files.metadata(path).await?;
        Ok(format!("{}-{}", meta.size, meta.modified.timestamp_millis()))
    }
}

/// 内容 SHA256
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Strategy;

#[async_trait]
impl IntegrityStrategy for Sha256Strategy {
    fn name(&self) -> &'static str {
        SHA256_METHOD
    }

    async fn compute(&self, files: &dyn FileStore, path: &Path) -> Result<String> {
        let data = files.read(path).await?;
        Ok(calculate_bytes_hash(&data))
    }
}

/// 计算字节数组的SHA256哈希值（十六进制）
pub fn calculate_bytes_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
