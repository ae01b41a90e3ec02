//! # 工作会话自动保存
//!
//! 长时间运行的文档操作（合并、拆分、编辑、批注）以「工作会话」的形式登记，
//! 中间结果定期落盘，进程崩溃或重启后可以继续。
//!
//! ## 会话状态
//!
//! ```text
//! Active → Persisted → (Active ↔ Persisted)* → Completed | Expired
//! ```
//!
//! 终止状态不再保存在会话表中，而是记入一个有界 LRU，完成后仍可查询。
//!
//! ## 定时器
//!
//! 后台任务按固定间隔（默认 30 秒）持久化所有会话。定时器与显式持久化
//! 同时写同一会话时以后写入者为准。

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::kv_store::{get_json, safe_lock, set_json, KeyValueStore};
use crate::models::AppError;
use crate::recovery_config::RecoveryConfig;

type Result<T> = std::result::Result<T, AppError>;

pub const AUTOSAVE_KEY_PREFIX: &str = "autosave_";

/// 记住最近多少个已结束会话的终止状态
const FINISHED_STATE_CAPACITY: usize = 256;

fn session_key(id: &str) -> String {
    format!("{}{}", AUTOSAVE_KEY_PREFIX, id)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Merge,
    Split,
    Edit,
    Annotate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// 操作标签（展示用）
    pub operation: String,
    /// 0-100，按调用方提供的值保存
    pub progress: u8,
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub id: String,
    pub kind: SessionKind,
    pub started_at: DateTime<Utc>,
    pub original_paths: Vec<PathBuf>,
    /// 调用方自定义的中间结果
    #[serde(default)]
    pub work_in_progress: Map<String, Value>,
    pub metadata: SessionMetadata,
}

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 内存中有未落盘的修改
    Active,
    /// 内存与持久化一致
    Persisted,
    Completed,
    Expired,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Expired)
    }

    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;
        match (self, target) {
            (Active, Persisted) | (Persisted, Active) => true,
            (Active, Active) | (Persisted, Persisted) => true,
            (Active | Persisted, Completed | Expired) => true,
            _ => false,
        }
    }
}

struct TrackedSession {
    session: WorkSession,
    state: SessionState,
}

impl TrackedSession {
    fn transition(&mut self, target: SessionState) {
        if self.state.can_transition_to(&target) {
            self.state = target;
        } else {
            warn!(
                "[AutoSave] 非法状态转换 {:?} -> {:?} (session={})",
                self.state, target, self.session.id
            );
        }
    }
}

/// 会话表与持久化，定时任务与管理器共享
struct SessionTable {
    store: Arc<dyn KeyValueStore>,
    sessions: Mutex<HashMap<String, TrackedSession>>,
    finished: std::sync::Mutex<LruCache<String, SessionState>>,
}

impl SessionTable {
    async fn persist(&self, tracked: &mut TrackedSession) -> Result<()> {
        tracked.session.metadata.last_saved = Some(Utc::now());
        set_json(
            self.store.as_ref(),
            &session_key(&tracked.session.id),
            &tracked.session,
        )
        .await?;
        tracked.transition(SessionState::Persisted);
        Ok(())
    }

    /// 持久化所有会话，返回成功写入的数量
    async fn save_all(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let mut saved = 0;
        for tracked in sessions.values_mut() {
            match self.persist(tracked).await {
                Ok(()) => saved += 1,
                Err(e) => warn!(
                    "[AutoSave] 自动保存会话失败 {}: {}",
                    tracked.session.id, e
                ),
            }
        }
        if saved > 0 {
            debug!("[AutoSave] 已自动保存 {} 个会话", saved);
        }
        saved
    }

    fn remember_finished(&self, id: &str, state: SessionState) {
        safe_lock(&self.finished).put(id.to_string(), state);
    }
}

struct TimerState {
    enabled: bool,
    interval: Duration,
    cancel: Option<CancellationToken>,
}

pub struct AutoSaveManager {
    table: Arc<SessionTable>,
    max_age: chrono::Duration,
    timer: std::sync::Mutex<TimerState>,
    /// 定时器任务所在的运行时；同步的 setter 可能在运行时之外被调用
    runtime: tokio::runtime::Handle,
}

impl AutoSaveManager {
    /// 创建管理器并加载持久化会话；配置启用自动保存时立即启动定时器
    pub async fn new(config: &RecoveryConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let capacity =
            NonZeroUsize::new(FINISHED_STATE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        let manager = Self {
            table: Arc::new(SessionTable {
                store,
                sessions: Mutex::new(HashMap::new()),
                finished: std::sync::Mutex::new(LruCache::new(capacity)),
            }),
            max_age: config.session_max_age(),
            timer: std::sync::Mutex::new(TimerState {
                enabled: config.auto_save_enabled,
                interval: config.auto_save_interval(),
                cancel: None,
            }),
            runtime: tokio::runtime::Handle::current(),
        };
        if let Err(e) = manager.load_persisted_sessions().await {
            warn!("[AutoSave] 启动时加载持久化会话失败: {}", e);
        }
        if config.auto_save_enabled {
            manager.restart_timer();
        }
        manager
    }

    pub async fn start_work_session(
        &self,
        kind: SessionKind,
        original_paths: Vec<PathBuf>,
        operation: &str,
    ) -> Result<String> {
        let session = WorkSession {
            id: Uuid::new_v4().to_string(),
            kind,
            started_at: Utc::now(),
            original_paths,
            work_in_progress: Map::new(),
            metadata: SessionMetadata {
                operation: operation.to_string(),
                progress: 0,
                last_saved: None,
            },
        };
        let id = session.id.clone();
        let mut tracked = TrackedSession {
            session,
            state: SessionState::Active,
        };

        let mut sessions = self.table.sessions.lock().await;
        self.table.persist(&mut tracked).await?;
        sessions.insert(id.clone(), tracked);

        info!("[AutoSave] 开始工作会话 {} ({:?}, {})", id, kind, operation);
        Ok(id)
    }

    /// 浅合并中间结果；progress > 0 时立即持久化，否则等待下一次定时保存
    ///
    /// 未知会话与持久化失败都只记录警告，内存中的更新保留，由定时器重试。
    pub async fn update_work_in_progress(
        &self,
        session_id: &str,
        partial: Map<String, Value>,
        progress: u8,
    ) -> Result<()> {
        let mut sessions = self.table.sessions.lock().await;
        let Some(tracked) = sessions.get_mut(session_id) else {
            warn!("[AutoSave] 更新未知会话，忽略: {}", session_id);
            return Ok(());
        };

        tracked.session.work_in_progress.extend(partial);
        tracked.session.metadata.progress = progress.min(100);
        tracked.transition(SessionState::Active);

        if progress > 0 {
            if let Err(e) = self.table.persist(tracked).await {
                warn!("[AutoSave] 持久化会话 {} 失败，等待下次保存: {}", session_id, e);
            }
        }
        Ok(())
    }

    /// 完成会话：从内存与持久化中移除
    pub async fn complete_work_session(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.table.sessions.lock().await;
        sessions.remove(session_id);
        self.table.store.delete(&session_key(session_id)).await?;
        self.table
            .remember_finished(session_id, SessionState::Completed);
        info!("[AutoSave] 工作会话已完成 {}", session_id);
        Ok(())
    }

    /// 当前跟踪的会话（最新在前）
    pub async fn get_auto_save_sessions(&self) -> Vec<WorkSession> {
        let sessions = self.table.sessions.lock().await;
        let mut list: Vec<WorkSession> =
            sessions.values().map(|t| t.session.clone()).collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        list
    }

    /// 先查内存，再从持久化重新加载并重新跟踪
    pub async fn recover_work_session(&self, session_id: &str) -> Option<WorkSession> {
        let mut sessions = self.table.sessions.lock().await;
        if let Some(tracked) = sessions.get(session_id) {
            return Some(tracked.session.clone());
        }

        match get_json::<WorkSession>(self.table.store.as_ref(), &session_key(session_id)).await
        {
            Ok(Some(session)) => {
                info!("[AutoSave] 已从持久化恢复会话 {}", session_id);
                sessions.insert(
                    session_id.to_string(),
                    TrackedSession {
                        session: session.clone(),
                        state: SessionState::Persisted,
                    },
                );
                Some(session)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("[AutoSave] 读取会话失败 {}: {}", session_id, e);
                None
            }
        }
    }

    /// 删除早于 `max_age` 的会话（内存与持久化），返回删除数量
    pub async fn cleanup_old_sessions(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut sessions = self.table.sessions.lock().await;

        let expired: Vec<String> = sessions
            .values()
            .filter(|t| t.session.started_at < cutoff)
            .map(|t| t.session.id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }

        let mut removed = expired.len();
        for id in &expired {
            if let Err(e) = self.table.store.delete(&session_key(id)).await {
                warn!("[AutoSave] 删除过期会话失败 {}: {}", id, e);
            }
            self.table.remember_finished(id, SessionState::Expired);
        }

        // 未被跟踪的持久化会话
        let keys = match self.table.store.keys_with_prefix(AUTOSAVE_KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("[AutoSave] 列举持久化会话失败: {}", e);
                return removed;
            }
        };
        for key in keys {
            let id = &key[AUTOSAVE_KEY_PREFIX.len()..];
            if sessions.contains_key(id) {
                continue;
            }
            let stale = match get_json::<WorkSession>(self.table.store.as_ref(), &key).await {
                Ok(Some(session)) => session.started_at < cutoff,
                Ok(None) => false,
                Err(e) => {
                    warn!("[AutoSave] 会话记录损坏，删除 {}: {}", key, e);
                    true
                }
            };
            if stale {
                match self.table.store.delete(&key).await {
                    Ok(()) => {
                        removed += 1;
                        self.table.remember_finished(id, SessionState::Expired);
                    }
                    Err(e) => warn!("[AutoSave] 删除过期会话失败 {}: {}", key, e),
                }
            }
        }

        if removed > 0 {
            info!("[AutoSave] 已清理 {} 个过期会话", removed);
        }
        removed
    }

    /// 启动时加载所有持久化会话，过期与损坏的记录直接删除
    pub async fn load_persisted_sessions(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.max_age;
        let keys = self
            .table
            .store
            .keys_with_prefix(AUTOSAVE_KEY_PREFIX)
            .await?;
        let mut sessions = self.table.sessions.lock().await;
        let mut loaded = 0;

        for key in keys {
            match get_json::<WorkSession>(self.table.store.as_ref(), &key).await {
                Ok(Some(session)) if session.started_at < cutoff => {
                    debug!("[AutoSave] 丢弃过期会话 {}", session.id);
                    self.table.store.delete(&key).await?;
                    self.table
                        .remember_finished(&session.id, SessionState::Expired);
                }
                Ok(Some(session)) => {
                    if !sessions.contains_key(&session.id) {
                        sessions.insert(
                            session.id.clone(),
                            TrackedSession {
                                session,
                                state: SessionState::Persisted,
                            },
                        );
                        loaded += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("[AutoSave] 会话记录损坏，删除 {}: {}", key, e);
                    self.table.store.delete(&key).await?;
                }
            }
        }

        info!("[AutoSave] 已加载 {} 个持久化会话", loaded);
        Ok(loaded)
    }

    /// 立即持久化所有会话（定时器调用的同一逻辑）
    pub async fn save_all_sessions(&self) -> usize {
        self.table.save_all().await
    }

    pub async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        if let Some(tracked) = self.table.sessions.lock().await.get(session_id) {
            return Some(tracked.state);
        }
        safe_lock(&self.table.finished).get(session_id).copied()
    }

    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut timer = safe_lock(&self.timer);
            if timer.enabled == enabled {
                return;
            }
            timer.enabled = enabled;
        }
        if enabled {
            self.restart_timer();
        } else {
            self.stop_timer();
        }
        info!("[AutoSave] 自动保存已{}", if enabled { "启用" } else { "停用" });
    }

    /// 修改间隔；启用状态下会重启定时器
    pub fn set_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(AppError::validation("自动保存间隔必须大于 0"));
        }
        let enabled = {
            let mut timer = safe_lock(&self.timer);
            timer.interval = interval;
            timer.enabled
        };
        if enabled {
            self.restart_timer();
        }
        debug!("[AutoSave] 自动保存间隔设置为 {:?}", interval);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        safe_lock(&self.timer).enabled
    }

    pub fn interval(&self) -> Duration {
        safe_lock(&self.timer).interval
    }

    /// 停止定时器，不改变启用标志
    pub fn shutdown(&self) {
        self.stop_timer();
    }

    fn stop_timer(&self) {
        if let Some(token) = safe_lock(&self.timer).cancel.take() {
            token.cancel();
        }
    }

    fn restart_timer(&self) {
        let mut timer = safe_lock(&self.timer);
        if let Some(old) = timer.cancel.take() {
            old.cancel();
        }
        let token = CancellationToken::new();
        timer.cancel = Some(token.clone());

        let table = self.table.clone();
        let period = timer.interval;
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("[AutoSave] 定时器已停止");
                        break;
                    }
                    _ = ticker.tick() => {
                        table.save_all().await;
                    }
                }
            }
        });
    }
}

impl Drop for AutoSaveManager {
    fn drop(&mut self) {
        self.stop_timer();
    }
}
