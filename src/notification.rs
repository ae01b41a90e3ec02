//! 用户通知接口
//!
//! 只用于展示结果（撤销成功/失败等），从不参与逻辑判断。

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// 即发即弃的通知接收端
pub trait NotificationSink: Send + Sync {
    fn notify(&self, level: NotificationLevel, title: &str, message: &str);
}

/// 默认实现：写入 tracing 日志
#[derive(Debug, Clone, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, level: NotificationLevel, title: &str, message: &str) {
        match level {
            NotificationLevel::Info => info!("[Notify] {}: {}", title, message),
            NotificationLevel::Warning => warn!("[Notify] {}: {}", title, message),
            NotificationLevel::Error | NotificationLevel::Critical => {
                error!("[Notify] {:?} {}: {}", level, title, message)
            }
        }
    }
}
