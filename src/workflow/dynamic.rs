//! 动态计划修改
//!
//! 根据执行反馈在运行时修改任务计划：追加任务、按失败/耗时/资源/用户反馈调整优先级、
//! 按约束选择执行偏好。本模块从不执行任务，只产出新的 `TaskPlan` 交给工作流引擎；
//! 每一项调整都会追加到计划元数据中的审计记录（`modifications` / `adjustments`）。

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::workflow::types::*;

const MODIFICATIONS_KEY: &str = "modifications";
const ADJUSTMENTS_KEY: &str = "adjustments";
const LAST_ADJUSTED_KEY: &str = "last_adjusted";
/// 未应用的运行时修改最多保留条数，超出时淘汰最早的
const MAX_ACTIVE_MODIFICATIONS: usize = 256;

/// 计算密集型任务的描述关键词
const COMPUTE_WORDS: &[&str] = &["计算", "分析", "compute", "analy", "calculat"];
/// 质量相关任务的描述关键词
const QUALITY_WORDS: &[&str] = &["验证", "检查", "verify", "check", "validat"];

/// 失败任务反馈
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTask {
    pub name: String,
    #[serde(default)]
    pub error: String,
}

/// 资源使用率（0.0-1.0）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub cpu: f64,
}

/// 用户建议
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSuggestion {
    /// 目前只处理 "add_task"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserFeedback {
    /// 满意度 0.0-1.0
    #[serde(default)]
    pub satisfaction: Option<f64>,
    #[serde(default)]
    pub suggestions: Vec<TaskSuggestion>,
}

/// 执行反馈
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFeedback {
    #[serde(default)]
    pub failed_tasks: Vec<FailedTask>,
    /// 任务名 -> 耗时（秒）
    #[serde(default)]
    pub execution_times: HashMap<String, f64>,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default)]
    pub user_feedback: Option<UserFeedback>,
}

impl ExecutionFeedback {
    /// 从执行结果提取失败任务与耗时
    pub fn from_result(result: &ExecutionResult) -> Self {
        let failed_tasks = result
            .failed_tasks()
            .into_iter()
            .map(|o| FailedTask {
                name: o.task_name.clone(),
                error: o.error.clone().unwrap_or_default(),
            })
            .collect();
        let execution_times = result
            .metadata
            .get("execution_times")
            .and_then(Value::as_object)
            .map(|times| {
                times
                    .iter()
                    .filter_map(|(name, secs)| secs.as_f64().map(|s| (name.clone(), s)))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            failed_tasks,
            execution_times,
            resource_usage: None,
            user_feedback: None,
        }
    }

    pub fn with_resource_usage(mut self, memory: f64, cpu: f64) -> Self {
        self.resource_usage = Some(ResourceUsage { memory, cpu });
        self
    }

    pub fn with_user_feedback(mut self, feedback: UserFeedback) -> Self {
        self.user_feedback = Some(feedback);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_limit")]
    pub memory: f64,
    #[serde(default = "default_limit")]
    pub cpu: f64,
}

fn default_limit() -> f64 {
    1.0
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: 1.0,
            cpu: 1.0,
        }
    }
}

/// 路径选择约束
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanConstraints {
    /// 总时长上限（秒）
    #[serde(default)]
    pub max_time: Option<f64>,
    #[serde(default)]
    pub max_resources: Option<ResourceLimits>,
    #[serde(default)]
    pub min_quality: Option<f64>,
}

/// 调整类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    AddRetry,
    ReducePriority,
    IncreasePriority,
    AdjustDependencies,
    AddUserSuggestedTask,
}

/// 一项计划调整（写入计划元数据的审计记录）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adjustment {
    #[serde(rename = "type")]
    pub kind: AdjustmentKind,
    pub task_name: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    pub timestamp: String,
}

impl Adjustment {
    fn new(kind: AdjustmentKind, task_name: &str, reason: &str) -> Self {
        Self {
            kind,
            task_name: task_name.to_string(),
            reason: reason.to_string(),
            old_priority: None,
            new_priority: None,
            detail: None,
            timestamp: timestamp(),
        }
    }

    fn priority(mut self, old: u8, new: u8) -> Self {
        self.old_priority = Some(old);
        self.new_priority = Some(new);
        self
    }

    fn detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// 运行时追加任务的记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Modification {
    pub id: String,
    pub parent_task: String,
    pub task: TaskDefinition,
    pub created_at: DateTime<Utc>,
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn raise(priority: u8, by: u8) -> u8 {
    priority.saturating_add(by).min(10)
}

fn lower(priority: u8, by: u8) -> u8 {
    priority.saturating_sub(by).max(1)
}

fn push_audit(plan: &mut TaskPlan, key: &str, entries: Vec<Value>) {
    let slot = plan
        .metadata
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    if let Value::Array(list) = slot {
        list.extend(entries);
    }
}

/// 动态计划修改器
#[derive(Debug, Default)]
pub struct DynamicPlanner {
    active: RwLock<HashMap<String, Modification>>,
}

impl DynamicPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 运行时追加任务，新任务依赖 `parent`（按任务名标识）
    pub fn add_task_runtime(
        &self,
        parent: &str,
        new_task: TaskDefinition,
        plan: &TaskPlan,
    ) -> Result<TaskPlan, WorkflowError> {
        if !plan.contains_task(parent) {
            return Err(WorkflowError::UnknownTask(parent.to_string()));
        }
        if plan.contains_task(&new_task.name) {
            return Err(WorkflowError::DuplicateTask(new_task.name.clone()));
        }

        let now = Utc::now();
        let id = format!("add_{}_{}", new_task.name, now.timestamp_micros());
        tracing::info!(task = %new_task.name, parent = %parent, modification = %id, "Adding task at runtime");

        let mut modified = plan.clone();
        modified
            .dependencies
            .entry(new_task.name.clone())
            .or_default()
            .push(parent.to_string());
        push_audit(
            &mut modified,
            MODIFICATIONS_KEY,
            vec![json!({
                "id": id,
                "type": "add_task",
                "task_name": new_task.name,
                "parent_task": parent,
                "timestamp": timestamp(),
            })],
        );
        modified.tasks.push(new_task.clone());

        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.len() >= MAX_ACTIVE_MODIFICATIONS {
            if let Some(oldest) = active
                .values()
                .min_by_key(|m| m.created_at)
                .map(|m| m.id.clone())
            {
                tracing::warn!(modification = %oldest, "Evicting oldest pending modification");
                active.remove(&oldest);
            }
        }
        active.insert(
            id.clone(),
            Modification {
                id,
                parent_task: parent.to_string(),
                task: new_task,
                created_at: now,
            },
        );
        Ok(modified)
    }

    /// 根据执行反馈调整计划
    pub fn adjust_plan(&self, plan: &TaskPlan, feedback: &ExecutionFeedback) -> TaskPlan {
        let mut modified = plan.clone();
        let mut adjustments = Vec::new();

        if !feedback.failed_tasks.is_empty() {
            adjustments.extend(Self::handle_failed_tasks(&mut modified, &feedback.failed_tasks));
        }
        if !feedback.execution_times.is_empty() {
            adjustments.extend(Self::adjust_by_time(&mut modified, &feedback.execution_times));
        }
        if let Some(usage) = &feedback.resource_usage {
            adjustments.extend(Self::adjust_for_resources(&mut modified, usage));
        }
        if let Some(user) = &feedback.user_feedback {
            adjustments.extend(Self::adjust_for_feedback(&mut modified, user));
        }

        tracing::info!(plan = %modified.name, adjustments = adjustments.len(), "Plan adjusted");
        if !adjustments.is_empty() {
            let entries = adjustments
                .iter()
                .filter_map(|a| serde_json::to_value(a).ok())
                .collect();
            push_audit(&mut modified, ADJUSTMENTS_KEY, entries);
            modified
                .metadata
                .insert(LAST_ADJUSTED_KEY.to_string(), json!(timestamp()));
        }
        modified
    }

    fn handle_failed_tasks(plan: &mut TaskPlan, failed: &[FailedTask]) -> Vec<Adjustment> {
        let mut adjustments = Vec::new();
        for failure in failed {
            let error = failure.error.to_lowercase();
            let Some(task) = plan.task(&failure.name).cloned() else {
                continue;
            };

            if error.contains("timeout") || error.contains("timed out") {
                let retry_name = format!("{}_retry", task.name);
                if plan.contains_task(&retry_name) {
                    continue;
                }
                let mut retry = TaskDefinition::new(retry_name.clone(), TaskKind::Retry)
                    .with_description(format!("重试任务: {}", task.description))
                    .with_priority(raise(task.priority, 1))
                    .with_metadata("original_task", json!(task.name))
                    .with_metadata("retry_count", json!(1));
                retry.tool = task.tool.clone();
                plan.tasks.push(retry);
                plan.dependencies.insert(retry_name.clone(), vec![task.name.clone()]);
                adjustments.push(
                    Adjustment::new(AdjustmentKind::AddRetry, &task.name, "timeout_error")
                        .detail(json!({ "retry_task": retry_name })),
                );
            } else if error.contains("resource") {
                let new = lower(task.priority, 2);
                if let Some(t) = plan.task_mut(&task.name) {
                    t.priority = new;
                }
                adjustments.push(
                    Adjustment::new(AdjustmentKind::ReducePriority, &task.name, "resource_error")
                        .priority(task.priority, new),
                );
            } else if error.contains("dependency") {
                adjustments.push(Adjustment::new(
                    AdjustmentKind::AdjustDependencies,
                    &task.name,
                    "dependency_error",
                ));
            }
        }
        adjustments
    }

    /// 耗时超过均值 2 倍降低优先级，不足一半提高优先级；没有耗时记录的任务按均值处理
    fn adjust_by_time(plan: &mut TaskPlan, times: &HashMap<String, f64>) -> Vec<Adjustment> {
        let avg = times.values().sum::<f64>() / times.len() as f64;
        let mut adjustments = Vec::new();
        for task in &mut plan.tasks {
            let elapsed = times.get(&task.name).copied().unwrap_or(avg);
            let old = task.priority;
            let (kind, reason, new) = if elapsed > avg * 2.0 {
                (AdjustmentKind::ReducePriority, "long_execution_time", lower(old, 1))
            } else if elapsed < avg * 0.5 {
                (AdjustmentKind::IncreasePriority, "short_execution_time", raise(old, 1))
            } else {
                continue;
            };
            task.priority = new;
            adjustments.push(
                Adjustment::new(kind, &task.name, reason)
                    .priority(old, new)
                    .detail(json!({ "execution_time": elapsed })),
            );
        }
        adjustments
    }

    fn adjust_for_resources(plan: &mut TaskPlan, usage: &ResourceUsage) -> Vec<Adjustment> {
        let mut adjustments = Vec::new();
        if usage.memory > 0.8 {
            for task in plan.tasks.iter_mut().filter(|t| t.kind == TaskKind::Parallel) {
                let old = task.priority;
                task.priority = raise(old, 1);
                adjustments.push(
                    Adjustment::new(AdjustmentKind::IncreasePriority, &task.name, "high_memory_usage")
                        .priority(old, task.priority)
                        .detail(json!({ "memory_usage": usage.memory })),
                );
            }
        }
        if usage.cpu > 0.9 {
            for task in &mut plan.tasks {
                let desc = task.description.to_lowercase();
                if !COMPUTE_WORDS.iter().any(|w| desc.contains(w)) {
                    continue;
                }
                let old = task.priority;
                task.priority = lower(old, 1);
                adjustments.push(
                    Adjustment::new(AdjustmentKind::ReducePriority, &task.name, "high_cpu_usage")
                        .priority(old, task.priority)
                        .detail(json!({ "cpu_usage": usage.cpu })),
                );
            }
        }
        adjustments
    }

    fn adjust_for_feedback(plan: &mut TaskPlan, feedback: &UserFeedback) -> Vec<Adjustment> {
        let mut adjustments = Vec::new();
        if let Some(satisfaction) = feedback.satisfaction.filter(|s| *s < 0.5) {
            for task in plan.tasks.iter_mut().filter(|t| t.kind == TaskKind::Reflect) {
                let old = task.priority;
                task.priority = raise(old, 2);
                adjustments.push(
                    Adjustment::new(AdjustmentKind::IncreasePriority, &task.name, "low_satisfaction")
                        .priority(old, task.priority)
                        .detail(json!({ "satisfaction": satisfaction })),
                );
            }
        }

        for suggestion in feedback.suggestions.iter().filter(|s| s.kind == "add_task") {
            let name = suggestion
                .name
                .clone()
                .unwrap_or_else(|| format!("user_suggested_{}", Utc::now().timestamp_micros()));
            if plan.contains_task(&name) {
                tracing::warn!(task = %name, "Suggested task already exists, ignoring");
                continue;
            }
            let task = TaskDefinition::new(name.clone(), TaskKind::Execute)
                .with_description(
                    suggestion
                        .description
                        .clone()
                        .unwrap_or_else(|| "用户建议的任务".to_string()),
                )
                .with_priority(suggestion.priority.unwrap_or(5))
                .with_metadata("source", json!("user_suggestion"))
                .with_metadata("suggestion", serde_json::to_value(suggestion).unwrap_or(Value::Null));
            plan.tasks.push(task);
            adjustments.push(Adjustment::new(
                AdjustmentKind::AddUserSuggestedTask,
                &name,
                "user_suggestion",
            ));
        }
        adjustments
    }

    /// 按约束调整优先级偏好；不删除任务
    pub fn select_optimal_path(&self, plan: &TaskPlan, constraints: &PlanConstraints) -> TaskPlan {
        let mut optimized = plan.clone();

        if constraints.max_time.is_some() {
            for task in &mut optimized.tasks {
                let estimated = task
                    .metadata
                    .get("estimated_time")
                    .and_then(Value::as_f64)
                    .unwrap_or(300.0);
                if estimated < 60.0 {
                    task.priority = raise(task.priority, 1);
                }
            }
        }

        if let Some(limits) = &constraints.max_resources {
            for task in &mut optimized.tasks {
                let Some(req) = task.metadata.get("resource_requirement") else {
                    continue;
                };
                let memory = req.get("memory").and_then(Value::as_f64).unwrap_or(0.0);
                let cpu = req.get("cpu").and_then(Value::as_f64).unwrap_or(0.0);
                if memory > limits.memory * 0.5 {
                    task.priority = lower(task.priority, 1);
                }
                if cpu > limits.cpu * 0.5 {
                    task.priority = lower(task.priority, 1);
                }
            }
        }

        if constraints.min_quality.is_some() {
            for task in &mut optimized.tasks {
                let desc = task.description.to_lowercase();
                if task.kind == TaskKind::Reflect || QUALITY_WORDS.iter().any(|w| desc.contains(w)) {
                    task.priority = raise(task.priority, 1);
                }
            }
        }

        tracing::debug!(plan = %optimized.name, "Optimal path selected");
        optimized
    }

    /// 修改与调整记录，按时间倒序
    pub fn get_modification_history(&self, plan: &TaskPlan) -> Vec<Value> {
        let mut history: Vec<Value> = [MODIFICATIONS_KEY, ADJUSTMENTS_KEY]
            .iter()
            .filter_map(|key| plan.metadata.get(*key).and_then(Value::as_array))
            .flatten()
            .cloned()
            .collect();
        history.sort_by(|a, b| {
            let ts = |v: &Value| {
                v.get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            };
            ts(b).cmp(&ts(a))
        });
        history
    }

    pub fn get_active_modifications(&self) -> HashMap<String, Modification> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 移除已经随计划执行过的修改（新任务在结果中已到达终态），返回移除条数
    pub fn prune_applied(&self, result: &ExecutionResult) -> usize {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        let before = active.len();
        active.retain(|_, m| {
            !result
                .outcome(&m.task.name)
                .is_some_and(|o| o.status.is_terminal())
        });
        let pruned = before - active.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Applied modifications pruned");
        }
        pruned
    }

    pub fn cancel_modification(&self, id: &str) -> bool {
        let removed = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        if removed {
            tracing::info!(modification = %id, "Modification cancelled");
        }
        removed
    }
}
