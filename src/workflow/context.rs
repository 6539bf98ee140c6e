//! 工作流执行上下文
//!
//! 一次计划执行内所有任务共享：变量、任务结果、元数据。
//! 并发任务通过内部读写锁安全地读写。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::workflow::types::{Condition, ExecutionId};

/// 条件求值时任务结果挂载的变量名（`results.<任务名>...`）
pub const RESULTS_VARIABLE: &str = "results";

/// 工作流上下文
#[derive(Debug)]
pub struct WorkflowContext {
    execution_id: ExecutionId,
    user_id: Option<String>,
    variables: RwLock<HashMap<String, Value>>,
    task_results: RwLock<HashMap<String, Value>>,
    metadata: RwLock<HashMap<String, Value>>,
    created_at: DateTime<Utc>,
    updated_at: RwLock<DateTime<Utc>>,
    /// 所属执行的取消令牌；循环、并行组在其上派生子令牌
    cancel_token: CancellationToken,
}

/// 上下文快照（可序列化，用于状态查询）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub execution_id: ExecutionId,
    pub user_id: Option<String>,
    pub variables: HashMap<String, Value>,
    pub task_results: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowContext {
    pub fn new(execution_id: impl Into<ExecutionId>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.into(),
            user_id: None,
            variables: RwLock::new(HashMap::new()),
            task_results: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            created_at: now,
            updated_at: RwLock::new(now),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// 预置初始变量（共享之前调用）
    pub fn with_variables(self, variables: HashMap<String, Value>) -> Self {
        Self {
            variables: RwLock::new(variables),
            ..self
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    async fn touch(&self) {
        *self.updated_at.write().await = Utc::now();
    }

    pub async fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.read().await.get(name).cloned()
    }

    pub async fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.write().await.insert(name.into(), value);
        self.touch().await;
    }

    pub async fn remove_variable(&self, name: &str) -> Option<Value> {
        let removed = self.variables.write().await.remove(name);
        self.touch().await;
        removed
    }

    pub async fn variables(&self) -> HashMap<String, Value> {
        self.variables.read().await.clone()
    }

    pub async fn get_task_result(&self, task_name: &str) -> Option<Value> {
        self.task_results.read().await.get(task_name).cloned()
    }

    pub async fn set_task_result(&self, task_name: impl Into<String>, result: Value) {
        self.task_results.write().await.insert(task_name.into(), result);
        self.touch().await;
    }

    pub async fn task_results(&self) -> HashMap<String, Value> {
        self.task_results.read().await.clone()
    }

    pub async fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata.write().await.insert(key.into(), value);
        self.touch().await;
    }

    pub async fn metadata(&self) -> HashMap<String, Value> {
        self.metadata.read().await.clone()
    }

    /// 条件求值视图：变量 + `results` 下挂载的任务结果（变量中已有同名键时不覆盖）
    pub async fn condition_view(&self) -> HashMap<String, Value> {
        let mut view = self.variables().await;
        if !view.contains_key(RESULTS_VARIABLE) {
            let results: serde_json::Map<String, Value> =
                self.task_results().await.into_iter().collect();
            view.insert(RESULTS_VARIABLE.to_string(), Value::Object(results));
        }
        view
    }

    /// 所有条件均满足时返回 true（空条件列表视为满足）
    pub async fn conditions_met(&self, conditions: &[Condition]) -> bool {
        if conditions.is_empty() {
            return true;
        }
        let view = self.condition_view().await;
        conditions.iter().all(|c| c.evaluate(&view))
    }

    pub async fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            execution_id: self.execution_id.clone(),
            user_id: self.user_id.clone(),
            variables: self.variables().await,
            task_results: self.task_results().await,
            metadata: self.metadata().await,
            created_at: self.created_at,
            updated_at: *self.updated_at.read().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::ConditionOperator;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_result_writes() {
        let ctx = Arc::new(WorkflowContext::new("exec_1"));
        let mut handles = Vec::new();
        for i in 0..20 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                ctx.set_task_result(format!("task_{i}"), json!(i)).await;
                ctx.set_variable("last", json!(i)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ctx.task_results().await.len(), 20);
        assert!(ctx.get_variable("last").await.is_some());
    }

    #[tokio::test]
    async fn test_conditions_see_task_results() {
        let ctx = WorkflowContext::new("exec_2");
        ctx.set_task_result("fetch", json!({"status": "ok"})).await;
        ctx.set_variable("env", json!("dev")).await;

        let conditions = vec![
            Condition::new("results.fetch.status", ConditionOperator::Eq, "ok"),
            Condition::new("env", ConditionOperator::Eq, "dev"),
        ];
        assert!(ctx.conditions_met(&conditions).await);
        assert!(
            !ctx.conditions_met(&[Condition::new("results.missing", ConditionOperator::Exists, Value::Null)])
                .await
        );
        assert!(ctx.conditions_met(&[]).await);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let ctx = WorkflowContext::new("exec_3")
            .with_user("alice")
            .with_variables([("k".to_string(), json!(1))].into());
        ctx.set_metadata("plan_name", json!("demo")).await;
        let snap = ctx.snapshot().await;
        assert_eq!(snap.execution_id, "exec_3");
        assert_eq!(snap.user_id.as_deref(), Some("alice"));
        assert_eq!(snap.variables["k"], json!(1));
        assert_eq!(snap.metadata["plan_name"], json!("demo"));
        assert!(snap.updated_at >= snap.created_at);
    }
}
