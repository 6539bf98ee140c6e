//! 活跃执行登记表
//!
//! 执行引擎、循环执行器、并行执行器各持有一份：记录正在运行的执行单元，
//! 为每个单元分配 CancellationToken，支持按 ID 取消与进度查询。
//! 取消是协作式的：执行方在步骤之间检查令牌，不会强行中断正在进行的外部调用。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 登记项快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveStatus {
    pub id: String,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    /// 总步数（迭代数 / 任务数），未知时为 0
    pub total: usize,
    pub completed: usize,
    /// 完成比例 0.0-1.0
    pub progress: f64,
    #[serde(default)]
    pub info: HashMap<String, Value>,
}

#[derive(Debug)]
struct ActiveEntry {
    kind: String,
    token: CancellationToken,
    started_at: DateTime<Utc>,
    total: usize,
    completed: usize,
    info: HashMap<String, Value>,
}

/// 活跃执行登记表
#[derive(Debug, Default)]
pub struct ActiveRegistry {
    entries: RwLock<HashMap<String, ActiveEntry>>,
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记执行单元，返回其取消令牌；给定 parent 时令牌随父令牌一起取消
    pub async fn register(
        &self,
        id: impl Into<String>,
        kind: impl Into<String>,
        total: usize,
        parent: Option<&CancellationToken>,
    ) -> CancellationToken {
        let token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let entry = ActiveEntry {
            kind: kind.into(),
            token: token.clone(),
            started_at: Utc::now(),
            total,
            completed: 0,
            info: HashMap::new(),
        };
        self.entries.write().await.insert(id.into(), entry);
        token
    }

    /// 推进已完成步数
    pub async fn advance(&self, id: &str, completed: usize) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.completed = completed;
        }
    }

    pub async fn set_info(&self, id: &str, key: impl Into<String>, value: Value) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.info.insert(key.into(), value);
        }
    }

    /// 执行结束后注销
    pub async fn remove(&self, id: &str) {
        self.entries.write().await.remove(id);
    }

    /// 取消并注销；ID 不存在时返回 false
    pub async fn cancel(&self, id: &str) -> bool {
        match self.entries.write().await.remove(id) {
            Some(entry) => {
                entry.token.cancel();
                tracing::info!(id = %id, kind = %entry.kind, "Execution unit cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn status(&self, id: &str) -> Option<ActiveStatus> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| Self::to_status(id, entry))
    }

    pub async fn list(&self) -> Vec<ActiveStatus> {
        let entries = self.entries.read().await;
        let mut all: Vec<ActiveStatus> = entries
            .iter()
            .map(|(id, entry)| Self::to_status(id, entry))
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    fn to_status(id: &str, entry: &ActiveEntry) -> ActiveStatus {
        let progress = if entry.total == 0 {
            0.0
        } else {
            (entry.completed as f64 / entry.total as f64).min(1.0)
        };
        ActiveStatus {
            id: id.to_string(),
            kind: entry.kind.clone(),
            started_at: entry.started_at,
            total: entry.total,
            completed: entry.completed,
            progress,
            info: entry.info.clone(),
        }
    }
}
