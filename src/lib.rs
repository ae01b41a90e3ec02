// doc-safeguard library entry
// 文档应用的恢复核心：操作前备份与回滚、工作会话自动保存、恢复协调与健康检查。

pub mod auto_save;
pub mod backup_manager;
pub mod error_log;
pub mod file_store;
pub mod integrity;
pub mod kv_store;
pub mod logging;
pub mod models;
pub mod notification;
pub mod recovery;
pub mod recovery_config;
pub mod storage_usage;

pub use auto_save::{AutoSaveManager, SessionKind, SessionState, WorkSession};
pub use backup_manager::{
    BackupManager, BackupRecord, BackupStats, CleanupReport, OperationKind, OperationRecord,
};
pub use error_log::{ErrorCategory, ErrorLog, ErrorRecord};
pub use file_store::{FileMetadata, FileStore, LocalFileStore};
pub use integrity::{IntegrityMode, IntegrityStrategy};
pub use kv_store::{KeyValueStore, MemoryKvStore, SqliteKvStore};
pub use models::{AppError, AppErrorType};
pub use notification::{NotificationLevel, NotificationSink, TracingNotificationSink};
pub use recovery::{
    AutoRecoveryResult, CleanupSummary, HealthIssue, HealthStatus, IssueSeverity,
    RecoveryComponents, RecoveryCoordinator, RecoveryOptions, RecoverySuggestion,
    SuggestedAction, SuggestionCategory, SuggestionPriority, SystemHealth,
};
pub use recovery_config::RecoveryConfig;
pub use storage_usage::{DiskUsageSource, StorageUsage, StorageUsageSource};
