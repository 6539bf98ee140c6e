//! 长期记忆存储
//!
//! 编排器在处理请求前检索相关记忆、处理完成后写回对话记录。
//! 记忆是尽力而为的：检索或写入失败只记日志，不影响请求结果。
//! 当前实现为 InMemoryMemoryStore（关键词重叠），后续可接真实向量库。

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 记忆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Conversation,
    Planning,
    Reflection,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Conversation => "conversation",
            MemoryKind::Planning => "planning",
            MemoryKind::Reflection => "reflection",
        }
    }
}

/// 一条记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub content: String,
    pub user_id: String,
    pub execution_id: String,
    pub kind: MemoryKind,
    /// 重要性 0.0-1.0
    pub importance: f32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(
        content: impl Into<String>,
        user_id: impl Into<String>,
        execution_id: impl Into<String>,
        kind: MemoryKind,
        importance: f32,
    ) -> Self {
        Self {
            content: content.into(),
            user_id: user_id.into(),
            execution_id: execution_id.into(),
            kind,
            importance: importance.clamp(0.0, 1.0),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 记忆存储 trait：写入与按查询检索
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 检索与 query 相关的至多 limit 条记忆（同一用户）
    async fn retrieve(&self, query: &str, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>, String>;

    async fn store(&self, record: MemoryRecord) -> Result<(), String>;

    /// 是否启用（Noop 实现返回 false）
    fn enabled(&self) -> bool {
        true
    }
}

/// 空实现：未启用记忆时使用
#[derive(Debug, Clone, Default)]
pub struct NoopMemory;

#[async_trait]
impl MemoryStore for NoopMemory {
    async fn retrieve(&self, _query: &str, _user_id: &str, _limit: usize) -> Result<Vec<MemoryRecord>, String> {
        Ok(Vec::new())
    }

    async fn store(&self, _record: MemoryRecord) -> Result<(), String> {
        Ok(())
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// 切分为小写词集合：ASCII 按词，CJK 按相邻字二元组
fn tokenize(s: &str) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let mut cjk_prev: Option<char> = None;
    for word in s.split(|c: char| !c.is_alphanumeric()) {
        let mut ascii = String::new();
        for c in word.chars() {
            if c.is_ascii() {
                ascii.push(c.to_ascii_lowercase());
                cjk_prev = None;
            } else {
                if let Some(prev) = cjk_prev {
                    tokens.insert(format!("{prev}{c}"));
                }
                cjk_prev = Some(c);
            }
        }
        if ascii.len() > 1 {
            tokens.insert(ascii);
        }
        cjk_prev = None;
    }
    tokens
}

/// 内存实现：按词重叠数 + 重要性排序
#[derive(Debug)]
pub struct InMemoryMemoryStore {
    records: RwLock<Vec<(MemoryRecord, HashSet<String>)>>,
    max_entries: usize,
}

impl InMemoryMemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 某用户的全部记忆（按写入顺序）
    pub fn records_for(&self, user_id: &str) -> Vec<MemoryRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(r, _)| r.user_id == user_id)
            .map(|(r, _)| r.clone())
            .collect()
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn retrieve(&self, query: &str, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>, String> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(usize, f32, &MemoryRecord)> = records
            .iter()
            .filter(|(r, _)| r.user_id == user_id)
            .map(|(r, tokens)| (query_tokens.intersection(tokens).count(), r.importance, r))
            .filter(|(score, _, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        });
        Ok(scored.into_iter().take(limit).map(|(_, _, r)| r.clone()).collect())
    }

    async fn store(&self, record: MemoryRecord) -> Result<(), String> {
        if record.content.trim().is_empty() {
            return Err("memory content is empty".to_string());
        }
        let tokens = tokenize(&record.content);
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.push((record, tokens));
        let n = records.len();
        if n > self.max_entries {
            records.drain(0..n - self.max_entries);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_mixed_text() {
        let tokens = tokenize("Deploy the 数据分析 service");
        assert!(tokens.contains("deploy"));
        assert!(tokens.contains("service"));
        assert!(tokens.contains("数据"));
        assert!(tokens.contains("分析"));
    }

    #[tokio::test]
    async fn test_retrieve_by_overlap_and_user() {
        let store = InMemoryMemoryStore::new(10);
        store
            .store(MemoryRecord::new("rust tokio runtime", "u1", "e1", MemoryKind::Conversation, 0.5))
            .await
            .unwrap();
        store
            .store(MemoryRecord::new("python asyncio", "u1", "e2", MemoryKind::Conversation, 0.5))
            .await
            .unwrap();
        store
            .store(MemoryRecord::new("rust tokio", "u2", "e3", MemoryKind::Planning, 0.9))
            .await
            .unwrap();

        let found = store.retrieve("tokio question", "u1", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].execution_id, "e1");
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let store = InMemoryMemoryStore::new(2);
        for i in 0..3 {
            store
                .store(MemoryRecord::new(format!("note {i}"), "u", "e", MemoryKind::Conversation, 0.5))
                .await
                .unwrap();
        }
        let all = store.records_for("u");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "note 1");
    }

    #[tokio::test]
    async fn test_noop_memory() {
        let noop = NoopMemory;
        assert!(!noop.enabled());
        assert!(noop.retrieve("x", "u", 5).await.unwrap().is_empty());
    }
}
