//! 持久化错误记录
//!
//! 恢复流程中出现的错误按类别落盘（`error_log` 键），健康检查据此判断
//! 是否出现过磁盘已满或文件损坏。记录数有上限，超出时淘汰最旧的。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::kv_store::{get_json, set_json, KeyValueStore};
use crate::models::{AppError, AppErrorType};

type Result<T> = std::result::Result<T, AppError>;

pub const ERROR_LOG_KEY: &str = "error_log";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    DiskFull,
    FileCorruption,
    NotFound,
    Unknown,
}

impl ErrorCategory {
    /// 出现即视为系统严重问题的类别
    pub fn is_critical(&self) -> bool {
        matches!(self, ErrorCategory::DiskFull | ErrorCategory::FileCorruption)
    }
}

impl From<&AppError> for ErrorCategory {
    fn from(err: &AppError) -> Self {
        match err.error_type {
            AppErrorType::Capacity => ErrorCategory::DiskFull,
            AppErrorType::Integrity => ErrorCategory::FileCorruption,
            AppErrorType::NotFound => ErrorCategory::NotFound,
            _ => ErrorCategory::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: String,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct ErrorLog {
    store: Arc<dyn KeyValueStore>,
    max_records: usize,
    // 串行化 读-改-写
    write_lock: Mutex<()>,
}

impl ErrorLog {
    pub fn new(store: Arc<dyn KeyValueStore>, max_records: usize) -> Self {
        Self {
            store,
            max_records: max_records.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn record(
        &self,
        category: ErrorCategory,
        message: impl Into<String>,
        context: Option<&str>,
    ) -> Result<ErrorRecord> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load_records().await;
        let record = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            category,
            message: message.into(),
            context: context.map(str::to_string),
            timestamp: Utc::now(),
        };
        records.push(record.clone());
        if records.len() > self.max_records {
            let overflow = records.len() - self.max_records;
            records.drain(..overflow);
        }
        set_json(self.store.as_ref(), ERROR_LOG_KEY, &records).await?;
        Ok(record)
    }

    pub async fn record_error(&self, err: &AppError, context: Option<&str>) -> Result<ErrorRecord> {
        self.record(ErrorCategory::from(err), err.message.clone(), context)
            .await
    }

    /// 按时间倒序返回全部记录
    pub async fn records(&self) -> Vec<ErrorRecord> {
        let mut records = self.load_records().await;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    pub async fn has_critical_errors(&self) -> bool {
        self.load_records()
            .await
            .iter()
            .any(|r| r.category.is_critical())
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.delete(ERROR_LOG_KEY).await
    }

    async fn load_records(&self) -> Vec<ErrorRecord> {
        match get_json::<Vec<ErrorRecord>>(self.store.as_ref(), ERROR_LOG_KEY).await {
            Ok(records) => records.unwrap_or_default(),
            Err(e) => {
                warn!("[ErrorLog] 读取错误记录失败，按空列表处理: {}", e);
                Vec::new()
            }
        }
    }
}
