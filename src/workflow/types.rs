//! 工作流类型定义
//!
//! 定义任务定义、任务计划、执行条件、循环/并行配置、执行结果等核心数据类型

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::ErrorKind;

pub type TaskId = u64;
pub type ExecutionId = String;

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// 规划类（分析、设计、制定方案）
    Plan,
    /// 执行类（具体操作）
    Execute,
    /// 反思类（检查、验证、评估）
    Reflect,
    /// 工具调用
    ToolCall,
    /// 条件分支
    Conditional,
    /// 循环
    Loop,
    /// 并行组
    Parallel,
    /// 带退避的重试
    Retry,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Plan => "plan",
            TaskKind::Execute => "execute",
            TaskKind::Reflect => "reflect",
            TaskKind::ToolCall => "tool_call",
            TaskKind::Conditional => "conditional",
            TaskKind::Loop => "loop",
            TaskKind::Parallel => "parallel",
            TaskKind::Retry => "retry",
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 已创建，等待所在层级被调度
    Pending,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消（执行被提前终止）
    Cancelled,
    /// 跳过（条件不满足）
    Skipped,
}

impl TaskStatus {
    /// 终态只能写入一次
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }
}

/// 条件操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "=", alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = ">=")]
    Ge,
    #[serde(alias = "<=")]
    Le,
    Contains,
    NotContains,
    In,
    NotIn,
    Exists,
    NotExists,
}

/// 执行条件：字段路径（点号分隔，如 `result.status`）、操作符、期望值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// 对变量表求值；路径不存在时字段视为 null
    pub fn evaluate(&self, variables: &HashMap<String, Value>) -> bool {
        let field_value = lookup_path(variables, &self.field);

        match self.operator {
            ConditionOperator::Eq => values_equal(&field_value, &self.value),
            ConditionOperator::Ne => !values_equal(&field_value, &self.value),
            ConditionOperator::Gt => compare(&field_value, &self.value) == Some(Ordering::Greater),
            ConditionOperator::Lt => compare(&field_value, &self.value) == Some(Ordering::Less),
            ConditionOperator::Ge => matches!(
                compare(&field_value, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ConditionOperator::Le => matches!(
                compare(&field_value, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            ConditionOperator::Contains => contains(&field_value, &self.value),
            ConditionOperator::NotContains => !contains(&field_value, &self.value),
            ConditionOperator::In => contains(&self.value, &field_value),
            ConditionOperator::NotIn => !contains(&self.value, &field_value),
            ConditionOperator::Exists => !field_value.is_null(),
            ConditionOperator::NotExists => field_value.is_null(),
        }
    }
}

/// 按点号路径取值，路径不存在时返回 null
pub(crate) fn lookup_path(variables: &HashMap<String, Value>, path: &str) -> Value {
    let mut keys = path.split('.');
    let Some(first) = keys.next() else {
        return Value::Null;
    };
    let mut current = match variables.get(first) {
        Some(v) => v,
        None => return Value::Null,
    };
    for key in keys {
        current = match current {
            Value::Object(map) => match map.get(key) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match key.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// 数字按数值比较（1 与 1.0 相等），其余按 JSON 值比较
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// haystack 为数组时判断成员关系，为字符串时判断子串
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            Value::Null => false,
            other => s.contains(&other.to_string()),
        },
        Value::Object(map) => needle.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        Value::Null => false,
        other => match needle {
            Value::String(n) => other.to_string().contains(n.as_str()),
            n => other.to_string().contains(&n.to_string()),
        },
    }
}

/// 工具绑定：工具名 + 参数（JSON 对象）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBinding {
    pub name: String,
    #[serde(default = "empty_object")]
    pub params: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_priority() -> u8 {
    5
}

/// 任务定义（计划构建完成后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// 任务名称（计划内唯一）
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "task_type", alias = "kind")]
    pub kind: TaskKind,
    /// 优先级 0-10
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolBinding>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            priority: default_priority(),
            conditions: Vec::new(),
            tool: None,
            metadata: HashMap::new(),
        }
    }

    /// 工具调用任务的快捷构造
    pub fn tool_call(name: impl Into<String>, tool: impl Into<String>, params: Value) -> Self {
        Self::new(name, TaskKind::ToolCall).with_tool(tool, params)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(10);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>, params: Value) -> Self {
        self.tool = Some(ToolBinding {
            name: tool.into(),
            params,
        });
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 任务计划：任务列表 + 依赖表（任务名 -> 前置任务名列表）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl TaskPlan {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tasks: Vec::new(),
            dependencies: HashMap::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut TaskDefinition> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }

    pub fn contains_task(&self, name: &str) -> bool {
        self.tasks.iter().any(|t| t.name == name)
    }

    /// 某任务的前置任务
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.dependencies.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 没有前置任务的根任务
    pub fn root_tasks(&self) -> Vec<&TaskDefinition> {
        self.tasks
            .iter()
            .filter(|t| self.dependencies_of(&t.name).is_empty())
            .collect()
    }

    /// 校验：名称唯一、优先级 0-10、依赖表中的名称均存在、无环
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut names = HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(WorkflowError::InvalidConfiguration(
                    "task name must not be empty".to_string(),
                ));
            }
            if !names.insert(task.name.as_str()) {
                return Err(WorkflowError::DuplicateTask(task.name.clone()));
            }
            if task.priority > 10 {
                return Err(WorkflowError::InvalidConfiguration(format!(
                    "task '{}' has priority {} (expected 0-10)",
                    task.name, task.priority
                )));
            }
        }

        for (task_name, deps) in &self.dependencies {
            if !names.contains(task_name.as_str()) {
                return Err(WorkflowError::UnknownTask(task_name.clone()));
            }
            for dep in deps {
                if !names.contains(dep.as_str()) {
                    return Err(WorkflowError::UnknownTask(dep.clone()));
                }
            }
        }

        if has_cycle(&self.dependencies) {
            return Err(WorkflowError::CyclicDependency);
        }
        Ok(())
    }

    /// 按依赖调整优先级：根任务 +2（上限 10），有依赖的任务 -1（下限 1）
    pub fn optimize_priorities(&mut self) {
        let dependencies = &self.dependencies;
        for task in &mut self.tasks {
            let is_root = dependencies
                .get(&task.name)
                .map(|deps| deps.is_empty())
                .unwrap_or(true);
            task.priority = if is_root {
                (task.priority + 2).min(10)
            } else {
                task.priority.saturating_sub(1).max(1)
            };
        }
    }
}

/// 三色 DFS 检测依赖表中的环（边方向：任务 -> 前置任务）
pub fn has_cycle(dependencies: &HashMap<String, Vec<String>>) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        Gray,
        Black,
    }

    fn visit<'a>(
        node: &'a str,
        dependencies: &'a HashMap<String, Vec<String>>,
        color: &mut HashMap<&'a str, Color>,
    ) -> bool {
        match color.get(node) {
            Some(Color::Gray) => return true,
            Some(Color::Black) => return false,
            None => {}
        }
        color.insert(node, Color::Gray);
        if let Some(deps) = dependencies.get(node) {
            for dep in deps {
                if visit(dep, dependencies, color) {
                    return true;
                }
            }
        }
        color.insert(node, Color::Black);
        false
    }

    let mut color = HashMap::new();
    dependencies
        .keys()
        .any(|node| visit(node, dependencies, &mut color))
}

/// 单个任务的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub task_name: String,
    pub status: TaskStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 失败任务的错误类别
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub elapsed_ms: u64,
}

impl TaskOutcome {
    /// 跳过视为中性成功
    pub fn is_success(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Skipped)
    }

    pub fn is_failure(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

/// 计划执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    /// 任务名 -> 执行结果
    pub task_results: HashMap<String, TaskOutcome>,
    /// 执行耗时（秒）
    pub execution_time: f64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn outcome(&self, task_name: &str) -> Option<&TaskOutcome> {
        self.task_results.get(task_name)
    }

    pub fn failed_tasks(&self) -> Vec<&TaskOutcome> {
        let mut failed: Vec<_> = self.task_results.values().filter(|o| o.is_failure()).collect();
        failed.sort_by_key(|o| o.task_id);
        failed
    }
}

fn default_max_iterations() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    3
}

/// 循环配置
///
/// While 循环必须给出条件和最大迭代次数（硬上限，保证终止）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopConfig {
    For {
        items: Vec<Value>,
    },
    While {
        condition: Condition,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
    Retry {
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        #[serde(default = "default_retry_delay_ms")]
        retry_delay_ms: u64,
        #[serde(default = "default_backoff_factor")]
        backoff_factor: f64,
    },
}

impl LoopConfig {
    pub fn for_each(items: Vec<Value>) -> Self {
        LoopConfig::For { items }
    }

    pub fn while_condition(condition: Condition, max_iterations: u32) -> Self {
        LoopConfig::While {
            condition,
            max_iterations,
        }
    }

    pub fn retry(max_retries: u32, retry_delay: Duration, backoff_factor: f64) -> Self {
        LoopConfig::Retry {
            max_retries,
            retry_delay_ms: retry_delay.as_millis() as u64,
            backoff_factor,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            LoopConfig::For { .. } => "for",
            LoopConfig::While { .. } => "while",
            LoopConfig::Retry { .. } => "retry",
        }
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        match self {
            LoopConfig::For { .. } => Ok(()),
            LoopConfig::While { max_iterations, .. } => {
                if *max_iterations == 0 {
                    return Err(WorkflowError::InvalidConfiguration(
                        "while loop requires max_iterations >= 1".to_string(),
                    ));
                }
                Ok(())
            }
            LoopConfig::Retry { backoff_factor, .. } => {
                if !backoff_factor.is_finite() || *backoff_factor < 1.0 {
                    return Err(WorkflowError::InvalidConfiguration(format!(
                        "retry backoff_factor must be >= 1.0, got {backoff_factor}"
                    )));
                }
                Ok(())
            }
        }
    }
}

fn default_wait_all() -> bool {
    true
}

/// 并行执行组（至少 2 个任务）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub task_names: Vec<String>,
    /// false 时首个成功的任务返回后放弃其余任务
    #[serde(default = "default_wait_all")]
    pub wait_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

impl ParallelGroup {
    pub fn new(task_names: Vec<String>) -> Self {
        Self {
            task_names,
            wait_all: true,
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    pub fn first_success(mut self) -> Self {
        self.wait_all = false;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.task_names.len() < 2 {
            return Err(WorkflowError::InvalidConfiguration(
                "parallel group requires at least 2 tasks".to_string(),
            ));
        }
        Ok(())
    }
}

/// 工作流结构性错误：在任何任务运行前中止整个执行
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Cyclic dependency detected")]
    CyclicDependency,
    #[error("Unknown task: {0}")]
    UnknownTask(String),
    #[error("Duplicate task name: {0}")]
    DuplicateTask(String),
    #[error("Node not found: {0}")]
    NodeNotFound(TaskId),
    #[error("Invalid workflow configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Task store error: {0}")]
    Store(String),
    #[error("Execution already running: {0}")]
    AlreadyRunning(String),
}
