use serde::{Deserialize, Serialize};

/// 错误来源分类
///
/// 按来源而非异常类型划分：未找到、完整性、容量、部分失败，
/// 以及底层文件系统/持久化层的错误。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppErrorType {
    NotFound,
    Integrity,
    Capacity,
    PartialFailure,
    FileSystem,
    Storage,
    Serialization,
    Configuration,
    Validation,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct AppError {
    pub error_type: AppErrorType,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(error_type: AppErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error_type: AppErrorType,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::NotFound, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Integrity, message)
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Capacity, message)
    }

    pub fn file_system(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::FileSystem, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Storage, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Serialization, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Configuration, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Validation, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Unknown, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.error_type == AppErrorType::NotFound
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return AppError::not_found(format!("文件不存在: {}", err));
        }
        #[cfg(unix)]
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return AppError::capacity(format!("磁盘空间不足: {}", err));
        }
        AppError::file_system(format!("文件系统错误: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::serialization(format!("JSON序列化错误: {}", err))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::storage(format!("持久化存储错误: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::configuration(format!("配置加载错误: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::unknown(err.to_string())
    }
}
