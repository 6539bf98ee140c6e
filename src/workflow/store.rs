//! 任务记录存储
//!
//! 执行引擎通过 `TaskStore` 持久化任务记录与状态变化；默认提供内存实现。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::workflow::types::*;

/// 任务记录（运行时状态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub execution_id: ExecutionId,
    pub kind: TaskKind,
    pub description: String,
    pub status: TaskStatus,
    pub priority: u8,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// 新建任务记录的参数
#[derive(Debug, Clone)]
pub struct NewTask {
    pub execution_id: ExecutionId,
    pub kind: TaskKind,
    pub description: String,
    pub priority: u8,
    pub metadata: HashMap<String, Value>,
}

/// 任务存储
///
/// 存储失败属于结构性错误，会中止所在的计划执行。
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 创建任务记录（初始状态 Pending），返回新 ID
    async fn create_task(&self, task: NewTask) -> Result<TaskId, WorkflowError>;

    /// 更新状态；终态只能写入一次
    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), WorkflowError>;

    /// 按执行 ID 查询任务记录（按 ID 升序）
    async fn get_by_execution(&self, execution_id: &str) -> Result<Vec<TaskRecord>, WorkflowError>;

    /// 记录前置任务 ID
    async fn set_dependencies(&self, _id: TaskId, _dependencies: Vec<TaskId>) -> Result<(), WorkflowError> {
        Ok(())
    }

    /// 记录重试次数
    async fn record_retries(&self, _id: TaskId, _retry_count: u32) -> Result<(), WorkflowError> {
        Ok(())
    }
}

/// 内存任务存储
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    next_id: AtomicU64,
    records: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// 清除某次执行的全部记录
    pub async fn clear_execution(&self, execution_id: &str) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.execution_id != execution_id);
        before - records.len()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: NewTask) -> Result<TaskId, WorkflowError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = TaskRecord {
            id,
            execution_id: task.execution_id,
            kind: task.kind,
            description: task.description,
            status: TaskStatus::Pending,
            priority: task.priority,
            dependencies: Vec::new(),
            metadata: task.metadata,
            result: None,
            error: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.records.write().await.insert(id, record);
        Ok(id)
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), WorkflowError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::Store(format!("task record {id} not found")))?;

        if record.status.is_terminal() {
            return Err(WorkflowError::Store(format!(
                "task record {id} already finished as {:?}",
                record.status
            )));
        }

        let now = Utc::now();
        if status == TaskStatus::Running && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if status.is_terminal() {
            record.completed_at = Some(now);
        }
        record.status = status;
        if result.is_some() {
            record.result = result;
        }
        if error.is_some() {
            record.error = error;
        }
        Ok(())
    }

    async fn get_by_execution(&self, execution_id: &str) -> Result<Vec<TaskRecord>, WorkflowError> {
        let records = self.records.read().await;
        let mut found: Vec<TaskRecord> = records
            .values()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.id);
        Ok(found)
    }

    async fn set_dependencies(&self, id: TaskId, dependencies: Vec<TaskId>) -> Result<(), WorkflowError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::Store(format!("task record {id} not found")))?;
        record.dependencies = dependencies;
        Ok(())
    }

    async fn record_retries(&self, id: TaskId, retry_count: u32) -> Result<(), WorkflowError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::Store(format!("task record {id} not found")))?;
        record.retry_count = retry_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_task(execution_id: &str) -> NewTask {
        NewTask {
            execution_id: execution_id.to_string(),
            kind: TaskKind::Execute,
            description: "do something".to_string(),
            priority: 5,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_record_lifecycle() {
        let store = InMemoryTaskStore::new();
        let id = store.create_task(new_task("e1")).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Pending);

        store.update_status(id, TaskStatus::Running, None, None).await.unwrap();
        let running = store.get(id).await.unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        store
            .update_status(id, TaskStatus::Completed, Some(json!("done")), None)
            .await
            .unwrap();
        let done = store.get(id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!("done")));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_status_written_once() {
        let store = InMemoryTaskStore::new();
        let id = store.create_task(new_task("e1")).await.unwrap();
        store
            .update_status(id, TaskStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();
        let err = store
            .update_status(id, TaskStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Store(_)));
        assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_get_by_execution() {
        let store = InMemoryTaskStore::new();
        let a = store.create_task(new_task("e1")).await.unwrap();
        store.create_task(new_task("e2")).await.unwrap();
        let c = store.create_task(new_task("e1")).await.unwrap();
        store.set_dependencies(c, vec![a]).await.unwrap();

        let records = store.get_by_execution("e1").await.unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(records[1].dependencies, vec![a]);

        assert_eq!(store.clear_execution("e1").await, 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_record() {
        let store = InMemoryTaskStore::new();
        assert!(store.update_status(42, TaskStatus::Running, None, None).await.is_err());
    }
}
