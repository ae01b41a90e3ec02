//! 恢复核心配置模块
//!
//! 提供以下设置的加载与持久化：
//! - 文档/备份/缓存目录
//! - 备份保留期限与最大数量
//! - 自动保存开关与间隔
//! - 健康检查阈值

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::integrity::IntegrityMode;
use crate::kv_store::{get_json, set_json, KeyValueStore};
use crate::models::AppError;

type Result<T> = std::result::Result<T, AppError>;

/// 配置存储键
pub const RECOVERY_CONFIG_KEY: &str = "recovery.config";

/// 环境变量前缀（如 `DOC_SAFEGUARD__MAX_BACKUP_COUNT=20`）
pub const ENV_PREFIX: &str = "DOC_SAFEGUARD";

/// 字段名保持 snake_case：`config` crate 会把文件与环境变量的键统一成小写
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    /// 受管文档目录（损坏扫描范围）
    #[serde(default = "default_document_dir")]
    pub document_dir: PathBuf,

    /// 备份文件存放目录
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// 缓存目录（超过 cache_max_age_hours 的文件会被清理）
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_backup_max_age_days")]
    pub backup_max_age_days: u32,

    #[serde(default = "default_max_backup_count")]
    pub max_backup_count: usize,

    /// 操作历史上限，超出时淘汰最旧的记录
    #[serde(default = "default_max_operation_history")]
    pub max_operation_history: usize,

    #[serde(default = "default_true")]
    pub auto_save_enabled: bool,

    #[serde(default = "default_auto_save_interval_secs")]
    pub auto_save_interval_secs: u64,

    #[serde(default = "default_session_max_age_hours")]
    pub session_max_age_hours: u32,

    #[serde(default = "default_cache_max_age_hours")]
    pub cache_max_age_hours: u32,

    /// 自动恢复时最多处理的会话数
    #[serde(default = "default_max_sessions_to_recover")]
    pub max_sessions_to_recover: usize,

    #[serde(default = "default_storage_warning_percent")]
    pub storage_warning_percent: f64,

    #[serde(default = "default_storage_critical_percent")]
    pub storage_critical_percent: f64,

    #[serde(default)]
    pub integrity: IntegrityMode,

    #[serde(default = "default_max_error_records")]
    pub max_error_records: usize,
}

fn default_document_dir() -> PathBuf {
    PathBuf::from("documents")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_backup_max_age_days() -> u32 {
    7
}

fn default_max_backup_count() -> usize {
    50
}

fn default_max_operation_history() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_auto_save_interval_secs() -> u64 {
    30
}

fn default_session_max_age_hours() -> u32 {
    24
}

fn default_cache_max_age_hours() -> u32 {
    24
}

fn default_max_sessions_to_recover() -> usize {
    5
}

fn default_storage_warning_percent() -> f64 {
    75.0
}

fn default_storage_critical_percent() -> f64 {
    90.0
}

fn default_max_error_records() -> usize {
    100
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            document_dir: default_document_dir(),
            backup_dir: default_backup_dir(),
            cache_dir: default_cache_dir(),
            backup_max_age_days: default_backup_max_age_days(),
            max_backup_count: default_max_backup_count(),
            max_operation_history: default_max_operation_history(),
            auto_save_enabled: true,
            auto_save_interval_secs: default_auto_save_interval_secs(),
            session_max_age_hours: default_session_max_age_hours(),
            cache_max_age_hours: default_cache_max_age_hours(),
            max_sessions_to_recover: default_max_sessions_to_recover(),
            storage_warning_percent: default_storage_warning_percent(),
            storage_critical_percent: default_storage_critical_percent(),
            integrity: IntegrityMode::default(),
            max_error_records: default_max_error_records(),
        }
    }
}

impl RecoveryConfig {
    /// 以 `root` 为应用数据根目录生成默认配置
    pub fn with_root(root: &Path) -> Self {
        Self {
            document_dir: root.join("documents"),
            backup_dir: root.join("backups"),
            cache_dir: root.join("cache"),
            ..Self::default()
        }
    }

    /// 默认值 ← 可选 TOML 文件 ← 环境变量
    pub fn from_env_and_file(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            } else {
                tracing::warn!(
                    "[RecoveryConfig] 配置文件不存在: {}，使用默认配置",
                    path.display()
                );
            }
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let loaded: RecoveryConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// 从键值存储加载配置，不存在时返回默认值
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self> {
        match get_json::<RecoveryConfig>(store, RECOVERY_CONFIG_KEY).await {
            Ok(Some(config)) => Ok(config),
            Ok(None) => Ok(Self::default()),
            Err(e) => Err(AppError::configuration(format!("解析恢复配置失败: {}", e))),
        }
    }

    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        self.validate()?;
        set_json(store, RECOVERY_CONFIG_KEY, self).await
    }

    pub fn validate(&self) -> Result<()> {
        if self.auto_save_interval_secs == 0 {
            return Err(AppError::configuration("自动保存间隔必须大于 0"));
        }
        if self.max_backup_count == 0 {
            return Err(AppError::configuration("最大备份数必须大于 0"));
        }
        if self.max_operation_history == 0 {
            return Err(AppError::configuration("操作历史上限必须大于 0"));
        }
        if !(0.0..=100.0).contains(&self.storage_warning_percent)
            || !(0.0..=100.0).contains(&self.storage_critical_percent)
            || self.storage_warning_percent > self.storage_critical_percent
        {
            return Err(AppError::configuration(format!(
                "存储阈值无效: warning={} critical={}",
                self.storage_warning_percent, self.storage_critical_percent
            )));
        }
        Ok(())
    }

    pub fn backup_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.backup_max_age_days as i64)
    }

    pub fn session_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_max_age_hours as i64)
    }

    pub fn cache_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_max_age_hours as i64)
    }

    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.auto_save_interval_secs)
    }
}
