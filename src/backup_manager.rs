//! # 备份与回滚管理器
//!
//! 在破坏性操作（合并、拆分、编辑、批注、删除）之前为文件创建快照，
//! 记录操作历史，并在需要时恢复到操作前的状态。
//!
//! ## 持久化
//!
//! - 每条备份记录单独存放在 `backup_<id>` 键下
//! - 操作历史作为一个列表存放在 `operation_history` 键下，有上限，最旧的先淘汰
//!
//! ## 批量备份
//!
//! `create_multiple_backups` 严格串行执行；任意一个文件失败时，会删除本批次
//! 已经创建的全部备份（文件 + 记录）后再返回错误，调用方看到的是全有或全无。
//!
//! ## 回滚
//!
//! 回滚对每个备份尽力而为：单个恢复失败不会中断其它恢复，只要至少一个文件
//! 恢复成功就返回 true。多文件操作因此可能只被部分回滚，失败的备份 id 会写入
//! 操作记录的 `rollbackFailedBackups` 元数据。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::file_store::FileStore;
use crate::integrity::{IntegrityStrategy, FINGERPRINT_METHOD};
use crate::kv_store::{get_json, set_json, KeyValueStore};
use crate::models::{AppError, AppErrorType};
use crate::recovery_config::RecoveryConfig;
use crate::storage_usage::StorageUsageSource;

type Result<T> = std::result::Result<T, AppError>;

pub const BACKUP_KEY_PREFIX: &str = "backup_";
pub const OPERATION_HISTORY_KEY: &str = "operation_history";

/// 元数据键：回滚标记与回滚时间
pub const META_ROLLED_BACK: &str = "rolledBack";
pub const META_ROLLBACK_TIMESTAMP: &str = "rollbackTimestamp";
pub const META_ROLLBACK_FAILED: &str = "rollbackFailedBackups";

/// 复制中的备份文件后缀；校验通过后才改名为正式文件
const STAGING_SUFFIX: &str = ".partial";

fn staging_path(backup_path: &Path) -> PathBuf {
    let mut raw = backup_path.as_os_str().to_os_string();
    raw.push(STAGING_SUFFIX);
    PathBuf::from(raw)
}

fn backup_key(id: &str) -> String {
    format!("{}{}", BACKUP_KEY_PREFIX, id)
}

/// 生成带时间戳前缀的备份 ID，便于排序与排查
fn generate_backup_id_at(now: DateTime<Utc>) -> String {
    let timestamp = now.format("%Y%m%d_%H%M%S").to_string();
    let millis = now.timestamp_subsec_millis();
    let rand8 = &Uuid::new_v4().simple().to_string()[..8];
    format!("{}_{:03}_{}", timestamp, millis, rand8)
}

fn default_integrity_method() -> String {
    FINGERPRINT_METHOD.to_string()
}

/// 操作类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Merge,
    Split,
    Edit,
    Annotate,
    Delete,
}

/// 单个文件快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    /// 触发备份的操作名
    pub operation: String,
    pub created_at: DateTime<Utc>,
    pub original_size: u64,
    /// 完整性令牌（默认：大小 + 修改时间）
    pub integrity_token: String,
    #[serde(default = "default_integrity_method")]
    pub integrity_method: String,
}

/// 一次完成（或尝试过）的多文件变换
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: String,
    pub kind: OperationKind,
    pub timestamp: DateTime<Utc>,
    pub original_paths: Vec<PathBuf>,
    pub result_paths: Vec<PathBuf>,
    pub backup_ids: Vec<String>,
    /// 有备份且尚未回滚时为 true；回滚后永久为 false
    pub undoable: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl OperationRecord {
    pub fn is_rolled_back(&self) -> bool {
        self.metadata
            .get(META_ROLLED_BACK)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub count: usize,
    pub total_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// 清理结果
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// 备份保留策略
#[derive(Debug, Clone)]
pub struct BackupPolicy {
    pub backup_dir: PathBuf,
    pub max_age: chrono::Duration,
    pub max_count: usize,
    pub max_history: usize,
}

impl From<&RecoveryConfig> for BackupPolicy {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            backup_dir: config.backup_dir.clone(),
            max_age: config.backup_max_age(),
            max_count: config.max_backup_count,
            max_history: config.max_operation_history,
        }
    }
}

pub struct BackupManager {
    files: Arc<dyn FileStore>,
    store: Arc<dyn KeyValueStore>,
    integrity: Arc<dyn IntegrityStrategy>,
    storage: Option<Arc<dyn StorageUsageSource>>,
    policy: BackupPolicy,
    /// 操作历史，按时间正序（最旧在前）
    history: Mutex<Vec<OperationRecord>>,
}

impl BackupManager {
    /// 创建管理器并加载已持久化的操作历史
    pub async fn new(
        config: &RecoveryConfig,
        files: Arc<dyn FileStore>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let policy = BackupPolicy::from(config);
        files.create_dir_all(&policy.backup_dir).await?;

        let history =
            match get_json::<Vec<OperationRecord>>(store.as_ref(), OPERATION_HISTORY_KEY).await {
                Ok(history) => history.unwrap_or_default(),
                Err(e) => {
                    warn!("[BackupManager] 操作历史解析失败，从空历史开始: {}", e);
                    Vec::new()
                }
            };
        debug!("[BackupManager] 已加载 {} 条操作历史", history.len());

        Ok(Self {
            files,
            store,
            integrity: config.integrity.strategy(),
            storage: None,
            policy,
            history: Mutex::new(history),
        })
    }

    pub fn with_integrity(mut self, integrity: Arc<dyn IntegrityStrategy>) -> Self {
        self.integrity = integrity;
        self
    }

    /// 挂载存储用量来源后，创建备份前会检查可用空间
    pub fn with_storage_source(mut self, storage: Arc<dyn StorageUsageSource>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.policy.backup_dir
    }

    /// 为单个文件创建备份，返回备份 ID
    pub async fn create_backup(&self, path: &Path, operation: &str) -> Result<String> {
        if !self.files.exists(path).await {
            return Err(AppError::not_found(format!(
                "无法备份，文件不存在: {}",
                path.display()
            )));
        }

        let meta = self.files.metadata(path).await?;
        self.ensure_capacity(meta.size).await?;

        let now = Utc::now();
        let id = generate_backup_id_at(now);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let backup_path = self.policy.backup_dir.join(format!("{}_{}", id, file_name));

        let staging = staging_path(&backup_path);
        self.files.copy(path, &staging).await?;

        let integrity_token = match self.integrity.compute(self.files.as_ref(), &staging).await {
            Ok(token) => token,
            Err(e) => {
                self.discard_file(&staging).await;
                return Err(e);
            }
        };
        if let Err(e) = self.files.rename(&staging, &backup_path).await {
            self.discard_file(&staging).await;
            return Err(e);
        }

        let record = BackupRecord {
            id: id.clone(),
            original_path: path.to_path_buf(),
            backup_path: backup_path.clone(),
            operation: operation.to_string(),
            created_at: now,
            original_size: meta.size,
            integrity_token,
            integrity_method: self.integrity.name().to_string(),
        };

        if let Err(e) = set_json(self.store.as_ref(), &backup_key(&id), &record).await {
            self.discard_file(&backup_path).await;
            return Err(e);
        }

        info!(
            "[BackupManager] 已创建备份 {} ({}): {} -> {}",
            id,
            operation,
            path.display(),
            backup_path.display()
        );
        Ok(id)
    }

    /// 串行为多个文件创建备份；任一失败则撤销本批次已创建的备份
    pub async fn create_multiple_backups(
        &self,
        paths: &[PathBuf],
        operation: &str,
    ) -> Result<Vec<String>> {
        let mut created = Vec::with_capacity(paths.len());

        for (index, path) in paths.iter().enumerate() {
            match self.create_backup(path, operation).await {
                Ok(id) => created.push(id),
                Err(e) => {
                    warn!(
                        "[BackupManager] 批量备份在第 {}/{} 个文件失败，撤销 {} 个已创建的备份: {}",
                        index + 1,
                        paths.len(),
                        created.len(),
                        e
                    );
                    for id in &created {
                        if let Err(cleanup_err) = self.delete_backup(id).await {
                            error!(
                                "[BackupManager] 撤销批量备份 {} 失败: {}",
                                id, cleanup_err
                            );
                        }
                    }
                    let message = format!(
                        "批量备份失败 ({}/{}): {}",
                        index + 1,
                        paths.len(),
                        e.message
                    );
                    if created.is_empty() {
                        return Err(AppError::new(e.error_type, message));
                    }
                    return Err(AppError::with_details(
                        AppErrorType::PartialFailure,
                        message,
                        serde_json::json!({
                            "failedPath": path.display().to_string(),
                            "cause": e.error_type,
                            "rolledBack": created,
                        }),
                    ));
                }
            }
        }

        Ok(created)
    }

    /// 记录一次已完成的操作，有备份时可撤销
    pub async fn record_operation(
        &self,
        kind: OperationKind,
        original_paths: Vec<PathBuf>,
        result_paths: Vec<PathBuf>,
        backup_ids: Vec<String>,
        metadata: Map<String, Value>,
    ) -> Result<String> {
        let record = OperationRecord {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            original_paths,
            result_paths,
            undoable: !backup_ids.is_empty(),
            backup_ids,
            metadata,
        };
        let id = record.id.clone();

        // 先写存储再替换内存，写入失败时内存保持原样
        let mut history = self.history.lock().await;
        let mut updated = history.clone();
        updated.push(record);
        if updated.len() > self.policy.max_history {
            let overflow = updated.len() - self.policy.max_history;
            updated.drain(..overflow);
            debug!("[BackupManager] 操作历史超出上限，淘汰 {} 条最旧记录", overflow);
        }
        set_json(self.store.as_ref(), OPERATION_HISTORY_KEY, &updated).await?;
        *history = updated;

        info!("[BackupManager] 已记录操作 {} ({:?})", id, kind);
        Ok(id)
    }

    /// 回滚操作：恢复所有关联备份并删除结果文件
    ///
    /// 未知或不可撤销的操作返回 false；至少恢复了一个文件时返回 true。
    pub async fn rollback_operation(&self, operation_id: &str) -> bool {
        let mut history = self.history.lock().await;

        let Some(index) = history.iter().position(|op| op.id == operation_id) else {
            warn!("[BackupManager] 回滚失败，操作不存在: {}", operation_id);
            return false;
        };
        if !history[index].undoable {
            warn!("[BackupManager] 回滚失败，操作不可撤销: {}", operation_id);
            return false;
        }

        let operation = history[index].clone();
        let mut restored = 0usize;
        let mut failed_backups = Vec::new();

        for backup_id in &operation.backup_ids {
            match self.restore_from_backup(backup_id).await {
                Some(path) => {
                    debug!("[BackupManager] 已恢复 {}", path.display());
                    restored += 1;
                }
                None => failed_backups.push(backup_id.clone()),
            }
        }

        for result_path in &operation.result_paths {
            // 原地编辑时结果路径与原路径相同，刚恢复的文件不能删
            if operation.original_paths.contains(result_path) {
                continue;
            }
            if self.files.exists(result_path).await {
                if let Err(e) = self.files.remove(result_path).await {
                    warn!(
                        "[BackupManager] 删除结果文件失败 {}: {}",
                        result_path.display(),
                        e
                    );
                }
            }
        }

        let entry = &mut history[index];
        entry.undoable = false;
        entry
            .metadata
            .insert(META_ROLLED_BACK.to_string(), Value::Bool(true));
        entry.metadata.insert(
            META_ROLLBACK_TIMESTAMP.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        if !failed_backups.is_empty() {
            warn!(
                "[BackupManager] 操作 {} 仅部分回滚: {}/{} 个备份恢复失败",
                operation_id,
                failed_backups.len(),
                operation.backup_ids.len()
            );
            entry.metadata.insert(
                META_ROLLBACK_FAILED.to_string(),
                Value::Array(failed_backups.into_iter().map(Value::String).collect()),
            );
        }

        if let Err(e) = set_json(self.store.as_ref(), OPERATION_HISTORY_KEY, &*history).await {
            error!("[BackupManager] 持久化回滚状态失败: {}", e);
        }

        info!(
            "[BackupManager] 操作 {} 回滚完成，恢复 {} 个文件",
            operation_id, restored
        );
        restored > 0
    }

    /// 从备份恢复文件到原路径
    ///
    /// 备份文件缺失、大小与记录不符或完整性令牌不匹配时返回 None，不做任何恢复。
    pub async fn restore_from_backup(&self, backup_id: &str) -> Option<PathBuf> {
        let record = match self.get_backup(backup_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("[BackupManager] 备份记录不存在: {}", backup_id);
                return None;
            }
            Err(e) => {
                warn!("[BackupManager] 读取备份记录失败 {}: {}", backup_id, e);
                return None;
            }
        };

        if let Err(e) = self.verify_backup(&record).await {
            warn!("[BackupManager] 备份 {} 校验失败，放弃恢复: {}", backup_id, e);
            return None;
        }

        match self
            .files
            .copy(&record.backup_path, &record.original_path)
            .await
        {
            Ok(_) => {
                info!(
                    "[BackupManager] 已从备份 {} 恢复 {}",
                    backup_id,
                    record.original_path.display()
                );
                Some(record.original_path)
            }
            Err(e) => {
                warn!(
                    "[BackupManager] 从备份 {} 恢复失败 {}: {}",
                    backup_id,
                    record.original_path.display(),
                    e
                );
                None
            }
        }
    }

    /// 校验备份文件仍存在、大小一致且完整性令牌匹配
    pub async fn verify_backup(&self, record: &BackupRecord) -> Result<()> {
        if !self.files.exists(&record.backup_path).await {
            return Err(AppError::not_found(format!(
                "备份文件不存在: {}",
                record.backup_path.display()
            )));
        }

        let meta = self
            .files
            .metadata(&record.backup_path)
            .await
            .map_err(|e| AppError::integrity(format!("无法读取备份元数据: {}", e)))?;
        if meta.size != record.original_size {
            return Err(AppError::integrity(format!(
                "备份大小不符: 记录 {} 字节，实际 {} 字节",
                record.original_size, meta.size
            )));
        }

        if record.integrity_method != self.integrity.name() {
            warn!(
                "[BackupManager] 备份 {} 使用 {} 校验，当前策略为 {}，仅校验大小",
                record.id,
                record.integrity_method,
                self.integrity.name()
            );
            return Ok(());
        }

        let matches = self
            .integrity
            .verify(self.files.as_ref(), &record.backup_path, &record.integrity_token)
            .await
            .map_err(|e| AppError::integrity(format!("计算完整性令牌失败: {}", e)))?;
        if !matches {
            return Err(AppError::integrity(format!(
                "完整性令牌不匹配: {}",
                record.backup_path.display()
            )));
        }
        Ok(())
    }

    /// 操作历史（最新在前）
    pub async fn get_operation_history(&self) -> Vec<OperationRecord> {
        let history = self.history.lock().await;
        let mut records = history.clone();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    /// 可撤销操作（最新在前）
    pub async fn get_undoable_operations(&self) -> Vec<OperationRecord> {
        self.get_operation_history()
            .await
            .into_iter()
            .filter(|op| op.undoable)
            .collect()
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        get_json(self.store.as_ref(), &backup_key(backup_id)).await
    }

    /// 全部备份记录（最新在前），无法解析的记录会被跳过
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let keys = self.store.keys_with_prefix(BACKUP_KEY_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match get_json::<BackupRecord>(self.store.as_ref(), &key).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("[BackupManager] 备份记录解析失败 {} (skipped): {}", key, e),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// 删除备份文件及其记录；文件已不存在时只删除记录
    pub async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        if let Some(record) = self.get_backup(backup_id).await? {
            match self.files.remove(&record.backup_path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(
                        "[BackupManager] 备份文件已不存在: {}",
                        record.backup_path.display()
                    );
                }
                Err(e) => return Err(e),
            }
        }
        self.store.delete(&backup_key(backup_id)).await
    }

    pub async fn get_backup_stats(&self) -> Result<BackupStats> {
        let records = self.list_backups().await?;
        Ok(BackupStats {
            count: records.len(),
            total_bytes: records.iter().map(|r| r.original_size).sum(),
            oldest: records.iter().map(|r| r.created_at).min(),
            newest: records.iter().map(|r| r.created_at).max(),
        })
    }

    /// 清理过期备份并裁剪到最大数量，取二者中删除更多的一方
    pub async fn cleanup_old_backups(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        let mut records = match self.list_backups().await {
            Ok(records) => records,
            Err(e) => {
                warn!("[BackupManager] 列举备份失败，跳过清理: {}", e);
                return report;
            }
        };
        // 最旧在前
        records.reverse();

        self.sweep_staging_files().await;

        let cutoff = Utc::now() - self.policy.max_age;
        let expired = records.iter().filter(|r| r.created_at < cutoff).count();
        let over_limit = records.len().saturating_sub(self.policy.max_count);
        let to_remove = expired.max(over_limit);

        if to_remove == 0 {
            return report;
        }

        info!(
            "[BackupManager] 清理备份: 共 {} 个，过期 {} 个，超出上限 {} 个，将删除 {} 个",
            records.len(),
            expired,
            over_limit,
            to_remove
        );

        for record in records.iter().take(to_remove) {
            match self.delete_backup(&record.id).await {
                Ok(()) => report.removed.push(record.id.clone()),
                Err(e) => {
                    warn!("[BackupManager] 删除旧备份失败 {}: {}", record.id, e);
                    report.failed.push(record.id.clone());
                }
            }
        }

        report
    }

    async fn ensure_capacity(&self, required_bytes: u64) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        match storage.usage().await {
            Ok(usage) if usage.available_bytes < required_bytes => Err(AppError::capacity(format!(
                "存储空间不足: 需要 {} 字节，可用 {} 字节",
                required_bytes, usage.available_bytes
            ))),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("[BackupManager] 读取存储用量失败，跳过容量检查: {}", e);
                Ok(())
            }
        }
    }

    /// 删除进程中断时残留的暂存文件
    async fn sweep_staging_files(&self) {
        let entries = match self.files.list_dir(&self.policy.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                warn!("[BackupManager] 列举备份目录失败: {}", e);
                return;
            }
        };
        let mut removed = 0;
        for path in entries {
            let is_staging = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(STAGING_SUFFIX))
                .unwrap_or(false);
            if is_staging {
                self.discard_file(&path).await;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("[BackupManager] 已清理 {} 个残留暂存文件", removed);
        }
    }

    async fn discard_file(&self, path: &Path) {
        if let Err(e) = self.files.remove(path).await {
            warn!("[BackupManager] 清理残留备份文件失败 {}: {}", path.display(), e);
        }
    }
}
