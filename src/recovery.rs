//! # 恢复协调器
//!
//! 汇总备份管理器与自动保存管理器的状态，生成按优先级排序的恢复建议，
//! 执行自动恢复，并给出系统健康结论。
//!
//! 协调器只调用两个管理器的公开接口，不直接读写它们的持久化数据。
//!
//! ## 自动恢复顺序
//!
//! 1. 最近的若干工作会话（原文件仍存在才算恢复，否则丢弃会话）
//! 2. 被判定为损坏的文件（先按操作历史找备份，再找引用它的会话）
//! 3. 存储清理（旧备份、旧会话、过期缓存文件）
//!
//! 每一步的失败都只累积到结果中，不会中断后续步骤。

use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auto_save::{AutoSaveManager, WorkSession};
use crate::backup_manager::{BackupManager, OperationRecord};
use crate::error_log::{ErrorCategory, ErrorLog};
use crate::file_store::FileStore;
use crate::models::AppError;
use crate::notification::{NotificationLevel, NotificationSink};
use crate::recovery_config::RecoveryConfig;
use crate::storage_usage::{StorageUsage, StorageUsageSource};

type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SuggestionCategory {
    ResumeWork,
    UndoOperation,
    RepairFile,
    FreeStorage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionPriority {
    High,
    Medium,
    Low,
}

impl SuggestionPriority {
    /// 排序权重
    pub fn weight(&self) -> u8 {
        match self {
            SuggestionPriority::High => 3,
            SuggestionPriority::Medium => 2,
            SuggestionPriority::Low => 1,
        }
    }
}

/// 建议对应的可执行动作，由 [`RecoveryCoordinator::execute_suggestion`] 执行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuggestedAction {
    ResumeSession { session_id: String },
    UndoOperation { operation_id: String },
    RepairFiles { paths: Vec<PathBuf> },
    FreeStorage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySuggestion {
    pub category: SuggestionCategory,
    pub title: String,
    pub description: String,
    pub priority: SuggestionPriority,
    pub action: SuggestedAction,
}

/// 每次调用重新计算，不持久化
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOptions {
    pub sessions: Vec<WorkSession>,
    pub undoable_operations: Vec<OperationRecord>,
    pub corrupted_files: Vec<PathBuf>,
    pub suggestions: Vec<RecoverySuggestion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoRecoveryResult {
    pub success: bool,
    pub recovered_files: Vec<PathBuf>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub severity: IssueSeverity,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSummary {
    pub backups_removed: usize,
    pub sessions_removed: usize,
    pub cache_files_removed: usize,
    pub errors: Vec<String>,
}

/// 协调器依赖的组件，全部在启动时构造一次后共享
#[derive(Clone)]
pub struct RecoveryComponents {
    pub backups: Arc<BackupManager>,
    pub auto_save: Arc<AutoSaveManager>,
    pub files: Arc<dyn FileStore>,
    pub storage: Arc<dyn StorageUsageSource>,
    pub notifier: Arc<dyn NotificationSink>,
    pub error_log: Arc<ErrorLog>,
}

pub struct RecoveryCoordinator {
    backups: Arc<BackupManager>,
    auto_save: Arc<AutoSaveManager>,
    files: Arc<dyn FileStore>,
    storage: Arc<dyn StorageUsageSource>,
    notifier: Arc<dyn NotificationSink>,
    error_log: Arc<ErrorLog>,
    config: RecoveryConfig,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig, components: RecoveryComponents) -> Self {
        Self {
            backups: components.backups,
            auto_save: components.auto_save,
            files: components.files,
            storage: components.storage,
            notifier: components.notifier,
            error_log: components.error_log,
            config,
        }
    }

    /// 汇总当前可用的恢复选项；任何内部失败都降级为空列表
    pub async fn analyze_recovery_options(&self) -> RecoveryOptions {
        let sessions = self.auto_save.get_auto_save_sessions().await;
        let undoable_operations = self.backups.get_undoable_operations().await;
        let corrupted_files = match self.scan_corrupted_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!("[Recovery] 损坏文件扫描失败，按无损坏处理: {}", e);
                Vec::new()
            }
        };
        let usage_percent = match self.storage.usage().await {
            Ok(usage) => Some(usage.usage_percent()),
            Err(e) => {
                warn!("[Recovery] 读取存储用量失败: {}", e);
                None
            }
        };

        let suggestions = self.build_suggestions(
            &sessions,
            &undoable_operations,
            &corrupted_files,
            usage_percent,
        );
        debug!(
            "[Recovery] 恢复选项: {} 个会话, {} 个可撤销操作, {} 个损坏文件, {} 条建议",
            sessions.len(),
            undoable_operations.len(),
            corrupted_files.len(),
            suggestions.len()
        );

        RecoveryOptions {
            sessions,
            undoable_operations,
            corrupted_files,
            suggestions,
        }
    }

    /// 按关注点依次生成建议，再按优先级稳定排序
    fn build_suggestions(
        &self,
        sessions: &[WorkSession],
        undoable: &[OperationRecord],
        corrupted: &[PathBuf],
        usage_percent: Option<f64>,
    ) -> Vec<RecoverySuggestion> {
        let mut suggestions = Vec::new();

        if let Some(latest) = sessions.first() {
            suggestions.push(RecoverySuggestion {
                category: SuggestionCategory::ResumeWork,
                title: "继续未完成的工作".to_string(),
                description: format!(
                    "发现 {} 个未完成的工作会话，最近一个为「{}」（进度 {}%）",
                    sessions.len(),
                    latest.metadata.operation,
                    latest.metadata.progress
                ),
                priority: SuggestionPriority::High,
                action: SuggestedAction::ResumeSession {
                    session_id: latest.id.clone(),
                },
            });
        }

        if let Some(last) = undoable.first() {
            suggestions.push(RecoverySuggestion {
                category: SuggestionCategory::UndoOperation,
                title: "撤销上一次操作".to_string(),
                description: format!(
                    "撤销 {:?} 操作，恢复 {} 个原始文件",
                    last.kind,
                    last.backup_ids.len()
                ),
                priority: SuggestionPriority::Medium,
                action: SuggestedAction::UndoOperation {
                    operation_id: last.id.clone(),
                },
            });
        }

        if !corrupted.is_empty() {
            suggestions.push(RecoverySuggestion {
                category: SuggestionCategory::RepairFile,
                title: "修复损坏的文件".to_string(),
                description: format!("{} 个文件无法读取，尝试从备份恢复", corrupted.len()),
                priority: SuggestionPriority::High,
                action: SuggestedAction::RepairFiles {
                    paths: corrupted.to_vec(),
                },
            });
        }

        if let Some(percent) = usage_percent {
            if percent >= self.config.storage_warning_percent {
                let priority = if percent >= self.config.storage_critical_percent {
                    SuggestionPriority::High
                } else {
                    SuggestionPriority::Medium
                };
                suggestions.push(RecoverySuggestion {
                    category: SuggestionCategory::FreeStorage,
                    title: "释放存储空间".to_string(),
                    description: format!(
                        "存储已使用 {:.1}%，清理旧备份、过期会话与缓存",
                        percent
                    ),
                    priority,
                    action: SuggestedAction::FreeStorage,
                });
            }
        }

        // sort_by_key 是稳定排序，同优先级保持生成顺序
        suggestions.sort_by_key(|s| Reverse(s.priority.weight()));
        suggestions
    }

    /// 执行一条建议，返回是否成功
    pub async fn execute_suggestion(&self, suggestion: &RecoverySuggestion) -> bool {
        info!("[Recovery] 执行建议: {}", suggestion.title);
        match &suggestion.action {
            SuggestedAction::ResumeSession { session_id } => {
                self.auto_save.recover_work_session(session_id).await.is_some()
            }
            SuggestedAction::UndoOperation { operation_id } => {
                self.backups.rollback_operation(operation_id).await
            }
            SuggestedAction::RepairFiles { paths } => {
                let mut all_repaired = true;
                for path in paths {
                    if let Err(e) = self.recover_corrupted_file(path).await {
                        warn!("[Recovery] 修复失败 {}: {}", path.display(), e);
                        self.log_error(&e, "repair_file").await;
                        all_repaired = false;
                    }
                }
                all_repaired
            }
            SuggestedAction::FreeStorage => self.clean_storage().await.errors.is_empty(),
        }
    }

    /// 自动恢复：会话 → 损坏文件 → 存储清理；从不返回错误
    pub async fn perform_auto_recovery(&self) -> AutoRecoveryResult {
        let mut result = AutoRecoveryResult::default();
        info!("[Recovery] 开始自动恢复");

        if let Err(e) = self.auto_save.load_persisted_sessions().await {
            result.errors.push(format!("加载持久化会话失败: {}", e));
            self.log_error(&e, "load_sessions").await;
        }

        // (a) 最近的工作会话
        let sessions = self.auto_save.get_auto_save_sessions().await;
        for session in sessions.iter().take(self.config.max_sessions_to_recover) {
            let mut existing = Vec::new();
            for path in &session.original_paths {
                if self.files.exists(path).await {
                    existing.push(path.clone());
                }
            }

            if existing.is_empty() {
                info!(
                    "[Recovery] 会话 {} 的原文件均已不存在，丢弃",
                    session.id
                );
                if let Err(e) = self.auto_save.complete_work_session(&session.id).await {
                    result
                        .errors
                        .push(format!("丢弃会话 {} 失败: {}", session.id, e));
                }
                continue;
            }

            match self.auto_save.recover_work_session(&session.id).await {
                Some(_) => result.recovered_files.extend(existing),
                None => result
                    .errors
                    .push(format!("恢复会话 {} 失败", session.id)),
            }
        }

        // (b) 损坏文件
        match self.scan_corrupted_files().await {
            Ok(corrupted) => {
                for path in corrupted {
                    match self.recover_corrupted_file(&path).await {
                        Ok(()) => result.recovered_files.push(path),
                        Err(e) => {
                            self.log_error(&e, "recover_corrupted_file").await;
                            result.errors.push(e.message);
                        }
                    }
                }
            }
            Err(e) => {
                self.log_error(&e, "scan_corrupted_files").await;
                result.errors.push(format!("损坏文件扫描失败: {}", e));
            }
        }

        // (c) 存储清理
        let cleanup = self.clean_storage().await;
        result.errors.extend(cleanup.errors);

        result.success = result.errors.is_empty();
        info!(
            "[Recovery] 自动恢复完成: 恢复 {} 个文件, {} 个错误",
            result.recovered_files.len(),
            result.errors.len()
        );
        if result.success {
            self.notifier.notify(
                NotificationLevel::Info,
                "自动恢复完成",
                &format!("已恢复 {} 个文件", result.recovered_files.len()),
            );
        } else {
            self.notifier.notify(
                NotificationLevel::Warning,
                "自动恢复部分失败",
                &format!(
                    "已恢复 {} 个文件，{} 个问题未解决",
                    result.recovered_files.len(),
                    result.errors.len()
                ),
            );
        }
        result
    }

    /// 回滚最近一次可撤销的操作
    pub async fn undo_last_operation(&self) -> bool {
        let undoable = self.backups.get_undoable_operations().await;
        let Some(last) = undoable.first() else {
            self.notifier
                .notify(NotificationLevel::Info, "无法撤销", "没有可撤销的操作");
            return false;
        };

        let restored = self.backups.rollback_operation(&last.id).await;
        if restored {
            self.notifier.notify(
                NotificationLevel::Info,
                "撤销成功",
                &format!("已撤销 {:?} 操作", last.kind),
            );
        } else {
            self.notifier.notify(
                NotificationLevel::Error,
                "撤销失败",
                &format!("{:?} 操作的备份均无法恢复", last.kind),
            );
        }
        restored
    }

    /// 系统健康检查
    pub async fn get_system_health(&self) -> SystemHealth {
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        let storage = match self.storage.usage().await {
            Ok(usage) => {
                let percent = usage.usage_percent();
                if percent >= self.config.storage_critical_percent {
                    issues.push(HealthIssue {
                        severity: IssueSeverity::Critical,
                        description: format!("存储空间严重不足，已使用 {:.1}%", percent),
                    });
                    recommendations.push("立即清理旧备份与缓存文件".to_string());
                } else if percent >= self.config.storage_warning_percent {
                    issues.push(HealthIssue {
                        severity: IssueSeverity::Warning,
                        description: format!("存储空间偏紧，已使用 {:.1}%", percent),
                    });
                    recommendations.push("考虑清理旧备份".to_string());
                }
                Some(usage)
            }
            Err(e) => {
                issues.push(HealthIssue {
                    severity: IssueSeverity::Warning,
                    description: format!("无法读取存储用量: {}", e),
                });
                None
            }
        };

        match self.backups.get_backup_stats().await {
            Ok(stats) if stats.count == 0 => {
                recommendations.push("在重要操作前创建备份".to_string());
            }
            Ok(_) => {}
            Err(e) => issues.push(HealthIssue {
                severity: IssueSeverity::Warning,
                description: format!("无法读取备份记录: {}", e),
            }),
        }

        if !self.auto_save.is_enabled() {
            issues.push(HealthIssue {
                severity: IssueSeverity::Warning,
                description: "自动保存已停用".to_string(),
            });
            recommendations.push("启用自动保存以防止工作丢失".to_string());
        }

        let records = self.error_log.records().await;
        if records.iter().any(|r| r.category == ErrorCategory::DiskFull) {
            issues.push(HealthIssue {
                severity: IssueSeverity::Critical,
                description: "曾发生磁盘已满错误".to_string(),
            });
        }
        if records
            .iter()
            .any(|r| r.category == ErrorCategory::FileCorruption)
        {
            issues.push(HealthIssue {
                severity: IssueSeverity::Critical,
                description: "检测到文件损坏".to_string(),
            });
            recommendations.push("运行自动恢复以修复损坏的文件".to_string());
        }

        let status = if issues
            .iter()
            .any(|issue| issue.severity == IssueSeverity::Critical)
        {
            HealthStatus::Critical
        } else if !issues.is_empty() {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        if status != HealthStatus::Healthy {
            debug!("[Recovery] 健康状态 {:?}: {} 个问题", status, issues.len());
        }

        SystemHealth {
            status,
            issues,
            recommendations,
            storage,
        }
    }

    /// 存储清理：旧备份、过期会话、过期缓存文件
    pub async fn clean_storage(&self) -> CleanupSummary {
        let mut summary = CleanupSummary::default();

        let report = self.backups.cleanup_old_backups().await;
        summary.backups_removed = report.removed.len();
        summary
            .errors
            .extend(report.failed.iter().map(|id| format!("删除备份失败: {}", id)));

        summary.sessions_removed = self
            .auto_save
            .cleanup_old_sessions(self.config.session_max_age())
            .await;

        let (cache_removed, cache_errors) = self.sweep_cache().await;
        summary.cache_files_removed = cache_removed;
        summary.errors.extend(cache_errors);

        info!(
            "[Recovery] 存储清理: 备份 {}, 会话 {}, 缓存文件 {}",
            summary.backups_removed, summary.sessions_removed, summary.cache_files_removed
        );
        summary
    }

    /// 删除过期缓存文件，返回删除数量与逐个文件的错误
    async fn sweep_cache(&self) -> (usize, Vec<String>) {
        let cache_dir = &self.config.cache_dir;
        if !self.files.exists(cache_dir).await {
            return (0, Vec::new());
        }

        let paths = match self.files.walk_files(cache_dir).await {
            Ok(paths) => paths,
            Err(e) => return (0, vec![format!("扫描缓存目录失败: {}", e)]),
        };

        let cutoff = Utc::now() - self.config.cache_max_age();
        let mut removed = 0;
        let mut errors = Vec::new();
        for path in paths {
            let meta = match self.files.metadata(&path).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("[Recovery] 读取缓存文件元数据失败 {}: {}", path.display(), e);
                    continue;
                }
            };
            if meta.modified >= cutoff {
                continue;
            }
            match self.files.remove(&path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!("[Recovery] 删除缓存文件失败 {}: {}", path.display(), e);
                    errors.push(format!("删除缓存文件失败 {}: {}", path.display(), e));
                }
            }
        }
        (removed, errors)
    }

    /// 文档目录下元数据无法读取的文件
    async fn scan_corrupted_files(&self) -> Result<Vec<PathBuf>> {
        let document_dir = &self.config.document_dir;
        if !self.files.exists(document_dir).await {
            return Ok(Vec::new());
        }

        let mut corrupted = Vec::new();
        for path in self.files.walk_files(document_dir).await? {
            if let Err(e) = self.files.metadata(&path).await {
                debug!("[Recovery] 疑似损坏 {}: {}", path.display(), e);
                corrupted.push(path);
            }
        }
        if !corrupted.is_empty() {
            warn!("[Recovery] 发现 {} 个疑似损坏的文件", corrupted.len());
        }
        Ok(corrupted)
    }

    /// 先按操作历史（最新在前）找覆盖该路径的备份，再找引用它的会话
    async fn recover_corrupted_file(&self, path: &Path) -> Result<()> {
        for operation in self.backups.get_operation_history().await {
            for backup_id in &operation.backup_ids {
                let covers_path = matches!(
                    self.backups.get_backup(backup_id).await,
                    Ok(Some(record)) if record.original_path == path
                );
                if !covers_path {
                    continue;
                }
                if self.backups.restore_from_backup(backup_id).await.is_some() {
                    info!(
                        "[Recovery] 已从备份 {} 修复 {}",
                        backup_id,
                        path.display()
                    );
                    return Ok(());
                }
            }
        }

        let sessions = self.auto_save.get_auto_save_sessions().await;
        if let Some(session) = sessions
            .iter()
            .find(|s| s.original_paths.iter().any(|p| p == path))
        {
            if self.auto_save.recover_work_session(&session.id).await.is_some() {
                info!(
                    "[Recovery] {} 可通过工作会话 {} 恢复",
                    path.display(),
                    session.id
                );
                return Ok(());
            }
        }

        Err(AppError::integrity(format!(
            "无法修复损坏的文件，未找到可用备份或会话: {}",
            path.display()
        )))
    }

    async fn log_error(&self, err: &AppError, context: &str) {
        if let Err(e) = self.error_log.record_error(err, Some(context)).await {
            warn!("[Recovery] 写入错误记录失败: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_save::SessionKind;
    use crate::backup_manager::OperationKind;
    use crate::file_store::{FileMetadata, LocalFileStore};
    use crate::kv_store::{KeyValueStore, MemoryKvStore};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct FixedUsage(f64);

    #[async_trait]
    impl StorageUsageSource for FixedUsage {
        async fn usage(&self) -> Result<StorageUsage> {
            let used = (self.0 * 10.0) as u64;
            Ok(StorageUsage {
                available_bytes: 1000 - used,
                used_bytes: used,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        messages: StdMutex<Vec<(NotificationLevel, String)>>,
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, level: NotificationLevel, title: &str, _message: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((level, title.to_string()));
        }
    }

    /// 对标记过的路径报告元数据不可读或无法删除
    #[derive(Default)]
    struct FlakyMetadataStore {
        inner: LocalFileStore,
        unreadable: StdMutex<HashSet<PathBuf>>,
        undeletable: StdMutex<HashSet<PathBuf>>,
    }

    impl FlakyMetadataStore {
        fn mark_unreadable(&self, path: &Path) {
            self.unreadable.lock().unwrap().insert(path.to_path_buf());
        }

        fn mark_undeletable(&self, path: &Path) {
            self.undeletable.lock().unwrap().insert(path.to_path_buf());
        }
    }

    #[async_trait]
    impl FileStore for FlakyMetadataStore {
        async fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path).await
        }
        async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
            if self.unreadable.lock().unwrap().contains(path) {
                return Err(AppError::file_system("模拟元数据读取失败"));
            }
            self.inner.metadata(path).await
        }
        async fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
            self.inner.copy(from, to).await
        }
        async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
            self.inner.rename(from, to).await
        }
        async fn remove(&self, path: &Path) -> Result<()> {
            if self.undeletable.lock().unwrap().contains(path) {
                return Err(AppError::file_system("模拟删除失败: EBUSY"));
            }
            self.inner.remove(path).await
        }
        async fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
            self.inner.list_dir(path).await
        }
        async fn walk_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
            self.inner.walk_files(root).await
        }
        async fn read(&self, path: &Path) -> Result<Vec<u8>> {
            self.inner.read(path).await
        }
        async fn create_dir_all(&self, path: &Path) -> Result<()> {
            self.inner.create_dir_all(path).await
        }
    }

    struct Harness {
        coordinator: RecoveryCoordinator,
        backups: Arc<BackupManager>,
        auto_save: Arc<AutoSaveManager>,
        error_log: Arc<ErrorLog>,
        files: Arc<FlakyMetadataStore>,
        sink: Arc<RecordingSink>,
        config: RecoveryConfig,
        _root: TempDir,
    }

    async fn harness_with(usage: f64, auto_save_enabled: bool) -> Harness {
        let root = TempDir::new().unwrap();
        let config = RecoveryConfig {
            auto_save_enabled,
            ..RecoveryConfig::with_root(root.path())
        };
        std::fs::create_dir_all(&config.document_dir).unwrap();

        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let flaky = Arc::new(FlakyMetadataStore::default());
        let files: Arc<dyn FileStore> = flaky.clone();
        let backups = Arc::new(
            BackupManager::new(&config, files.clone(), store.clone())
                .await
                .unwrap(),
        );
        let auto_save = Arc::new(AutoSaveManager::new(&config, store.clone()).await);
        let error_log = Arc::new(ErrorLog::new(store, config.max_error_records));
        let sink = Arc::new(RecordingSink::default());

        let coordinator = RecoveryCoordinator::new(
            config.clone(),
            RecoveryComponents {
                backups: backups.clone(),
                auto_save: auto_save.clone(),
                files,
                storage: Arc::new(FixedUsage(usage)),
                notifier: sink.clone(),
                error_log: error_log.clone(),
            },
        );

        Harness {
            coordinator,
            backups,
            auto_save,
            error_log,
            files: flaky,
            sink,
            config,
            _root: root,
        }
    }

    async fn harness(usage: f64) -> Harness {
        harness_with(usage, true).await
    }

    fn write_doc(h: &Harness, name: &str, content: &[u8]) -> PathBuf {
        let path = h.config.document_dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_health_critical_at_95_percent() {
        let h = harness(95.0).await;
        let health = h.coordinator.get_system_health().await;
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_health_healthy_at_20_percent_with_auto_save() {
        let h = harness(20.0).await;
        let health = h.coordinator.get_system_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.issues.is_empty());
        assert!(
            !health.recommendations.is_empty(),
            "没有备份时只给出建议，不算问题"
        );
    }

    #[tokio::test]
    async fn test_health_warning_levels() {
        let h = harness(80.0).await;
        assert_eq!(h.coordinator.get_system_health().await.status, HealthStatus::Warning);

        let h = harness_with(10.0, false).await;
        let health = h.coordinator.get_system_health().await;
        assert_eq!(health.status, HealthStatus::Warning);
        assert_matches!(
            health.issues.as_slice(),
            [HealthIssue { severity: IssueSeverity::Warning, .. }]
        );
    }

    #[tokio::test]
    async fn test_health_critical_after_disk_full_error() {
        let h = harness(10.0).await;
        h.error_log
            .record_error(&AppError::capacity("磁盘已满"), Some("create_backup"))
            .await
            .unwrap();

        let health = h.coordinator.get_system_health().await;
        assert_eq!(health.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_suggestions_ranked_by_priority_then_generation_order() {
        let h = harness(80.0).await;
        let doc = write_doc(&h, "a.pdf", b"a");
        let backup = h.backups.create_backup(&doc, "edit").await.unwrap();
        h.backups
            .record_operation(OperationKind::Edit, vec![doc.clone()], vec![], vec![backup], Map::new())
            .await
            .unwrap();
        h.auto_save
            .start_work_session(SessionKind::Merge, vec![doc], "merge")
            .await
            .unwrap();

        let options = h.coordinator.analyze_recovery_options().await;
        let categories: Vec<_> = options.suggestions.iter().map(|s| s.category).collect();
        assert_eq!(
            categories,
            vec![
                SuggestionCategory::ResumeWork,
                SuggestionCategory::UndoOperation,
                SuggestionCategory::FreeStorage,
            ]
        );
        assert_eq!(options.suggestions[2].priority, SuggestionPriority::Medium);
    }

    #[tokio::test]
    async fn test_free_storage_is_high_priority_when_critical() {
        let h = harness(92.0).await;
        let doc = write_doc(&h, "a.pdf", b"a");
        let backup = h.backups.create_backup(&doc, "edit").await.unwrap();
        h.backups
            .record_operation(OperationKind::Edit, vec![doc], vec![], vec![backup], Map::new())
            .await
            .unwrap();

        let options = h.coordinator.analyze_recovery_options().await;
        let categories: Vec<_> = options.suggestions.iter().map(|s| s.category).collect();
        assert_eq!(
            categories,
            vec![SuggestionCategory::FreeStorage, SuggestionCategory::UndoOperation]
        );
    }

    #[tokio::test]
    async fn test_analyze_reports_corrupted_files() {
        let h = harness(10.0).await;
        write_doc(&h, "fine.pdf", b"ok");
        let broken = write_doc(&h, "broken.pdf", b"??");
        h.files.mark_unreadable(&broken);

        let options = h.coordinator.analyze_recovery_options().await;
        assert_eq!(options.corrupted_files, vec![broken.clone()]);
        assert_matches!(
            &options.suggestions[0].action,
            SuggestedAction::RepairFiles { paths } if paths == &vec![broken.clone()]
        );
    }

    #[tokio::test]
    async fn test_auto_recovery_restores_corrupted_file_from_backup() {
        let h = harness(10.0).await;
        let broken = write_doc(&h, "broken.pdf", b"good data");
        let backup = h.backups.create_backup(&broken, "edit").await.unwrap();
        h.backups
            .record_operation(OperationKind::Edit, vec![broken.clone()], vec![], vec![backup], Map::new())
            .await
            .unwrap();
        std::fs::write(&broken, b"garbage").unwrap();
        h.files.mark_unreadable(&broken);

        let result = h.coordinator.perform_auto_recovery().await;

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.recovered_files, vec![broken.clone()]);
        assert_eq!(std::fs::read(&broken).unwrap(), b"good data");
    }

    #[tokio::test]
    async fn test_auto_recovery_records_unrecoverable_files() {
        let h = harness(10.0).await;
        let broken = write_doc(&h, "broken.pdf", b"??");
        h.files.mark_unreadable(&broken);

        let result = h.coordinator.perform_auto_recovery().await;

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(h.error_log.has_critical_errors().await, "损坏应记入错误日志");
        let last = h.sink.messages.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.0, NotificationLevel::Warning);
    }

    #[tokio::test]
    async fn test_auto_recovery_discards_sessions_without_originals() {
        let h = harness(10.0).await;
        let kept = write_doc(&h, "kept.pdf", b"k");
        let live = h
            .auto_save
            .start_work_session(SessionKind::Edit, vec![kept.clone()], "edit")
            .await
            .unwrap();
        let gone = h
            .auto_save
            .start_work_session(
                SessionKind::Merge,
                vec![h.config.document_dir.join("missing.pdf")],
                "merge",
            )
            .await
            .unwrap();

        let result = h.coordinator.perform_auto_recovery().await;

        assert!(result.success);
        assert_eq!(result.recovered_files, vec![kept]);
        assert!(h.auto_save.recover_work_session(&live).await.is_some());
        assert!(h.auto_save.recover_work_session(&gone).await.is_none());
    }

    #[tokio::test]
    async fn test_undo_last_operation_without_history_notifies() {
        let h = harness(10.0).await;
        assert!(!h.coordinator.undo_last_operation().await);
        let messages = h.sink.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, NotificationLevel::Info);
    }

    #[tokio::test]
    async fn test_undo_last_operation_rolls_back_newest() {
        let h = harness(10.0).await;
        let doc = write_doc(&h, "doc.pdf", b"v1");
        let backup = h.backups.create_backup(&doc, "edit").await.unwrap();
        std::fs::write(&doc, b"v2-longer").unwrap();
        h.backups
            .record_operation(OperationKind::Edit, vec![doc.clone()], vec![doc.clone()], vec![backup], Map::new())
            .await
            .unwrap();

        assert!(h.coordinator.undo_last_operation().await);
        assert_eq!(std::fs::read(&doc).unwrap(), b"v1");
        assert!(h.backups.get_undoable_operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_clean_storage_sweeps_stale_cache_files() {
        let h = harness(10.0).await;
        std::fs::create_dir_all(&h.config.cache_dir).unwrap();
        let stale = h.config.cache_dir.join("thumb_old.png");
        let fresh = h.config.cache_dir.join("thumb_new.png");
        std::fs::write(&stale, b"old").unwrap();
        std::fs::write(&fresh, b"new").unwrap();
        age_file(&stale, 48);

        let summary = h.coordinator.clean_storage().await;

        assert_eq!(summary.cache_files_removed, 1);
        assert!(summary.errors.is_empty());
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    fn age_file(path: &Path, hours: u64) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(hours * 3600))
            .unwrap();
    }

    #[tokio::test]
    async fn test_clean_storage_continues_past_undeletable_cache_file() {
        let h = harness(10.0).await;
        std::fs::create_dir_all(&h.config.cache_dir).unwrap();
        let locked = h.config.cache_dir.join("a_locked.png");
        let others = [
            h.config.cache_dir.join("b_stale.png"),
            h.config.cache_dir.join("c_stale.png"),
        ];
        for path in std::iter::once(&locked).chain(others.iter()) {
            std::fs::write(path, b"stale").unwrap();
            age_file(path, 48);
        }
        h.files.mark_undeletable(&locked);

        let summary = h.coordinator.clean_storage().await;

        assert_eq!(summary.cache_files_removed, 2, "其余过期文件仍应被删除");
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("a_locked.png"));
        assert!(locked.exists());
        assert!(others.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_execute_resume_suggestion() {
        let h = harness(10.0).await;
        let doc = write_doc(&h, "doc.pdf", b"x");
        h.auto_save
            .start_work_session(SessionKind::Split, vec![doc], "split")
            .await
            .unwrap();

        let options = h.coordinator.analyze_recovery_options().await;
        assert!(h.coordinator.execute_suggestion(&options.suggestions[0]).await);
    }

    #[test]
    fn test_priority_weights() {
        assert_eq!(SuggestionPriority::High.weight(), 3);
        assert_eq!(SuggestionPriority::Medium.weight(), 2);
        assert_eq!(SuggestionPriority::Low.weight(), 1);
    }
}
