//! 任务分解
//!
//! `Decomposer` 把自然语言请求分解为 `TaskPlan`。`LlmDecomposer` 让 LLM 输出 JSON 计划，
//! 解析后校验（重名、未知依赖、环）并优化优先级；`StaticDecomposer` 返回固定计划。
//! 解析或校验失败是结构性错误，LLM 调用失败按 LLM 错误上报。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::core::OrchestratorError;
use crate::llm::{LlmClient, DECOMPOSE_MARKER};
use crate::memory::Message;
use crate::workflow::graph::TaskGraph;
use crate::workflow::types::*;

/// 任务分解器
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, request: &str, context: &Value) -> Result<TaskPlan, OrchestratorError>;
}

/// 固定计划（测试与直接运行计划文件时使用）
#[derive(Debug, Clone)]
pub struct StaticDecomposer {
    plan: TaskPlan,
}

impl StaticDecomposer {
    pub fn new(plan: TaskPlan) -> Self {
        Self { plan }
    }
}

#[async_trait]
impl Decomposer for StaticDecomposer {
    async fn decompose(&self, _request: &str, _context: &Value) -> Result<TaskPlan, OrchestratorError> {
        self.plan.validate()?;
        Ok(self.plan.clone())
    }
}

const DECOMPOSE_PROMPT: &str = r#"你是一个专业的任务规划专家，负责把用户的复杂请求分解为结构化的任务计划。

## 任务类型
- plan: 规划类任务（分析、设计、制定方案）
- execute: 执行类任务（具体操作）
- reflect: 反思类任务（检查、验证、评估）
- tool_call: 工具调用任务（必须给出 tool_name 与 tool_params）

## 依赖规则
- 分析类任务通常在其他任务之前
- 执行类任务依赖规划类任务，验证类任务依赖执行类任务
- 彼此独立的任务不要声明依赖，以便并行执行
- 不允许循环依赖

## 输出格式
只输出一个 JSON 对象：
{"name": "计划名称", "description": "计划描述",
 "tasks": [{"name": "...", "description": "...", "task_type": "plan|execute|reflect|tool_call",
            "priority": 1-10, "tool_name": "...", "tool_params": {}, "dependencies": ["..."]}],
 "dependencies": {"任务名": ["前置任务名"]}}"#;

#[derive(Debug, Deserialize)]
struct RawPlan {
    name: String,
    description: String,
    tasks: Vec<RawTask>,
    #[serde(default)]
    dependencies: HashMap<String, Vec<String>>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(alias = "type", alias = "kind")]
    task_type: TaskKind,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    tool_params: Option<Value>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

/// 从回答中取出 JSON：优先 ```json 代码块，否则取第一个 `{` 到最后一个 `}`
pub fn extract_json(response: &str) -> Option<&str> {
    if let Some(start) = response.find("```") {
        let body = &response[start + 3..];
        let body = body.strip_prefix("json").unwrap_or(body);
        if let Some(end) = body.find("```") {
            let block = body[..end].trim();
            if block.starts_with('{') {
                return Some(block);
            }
        }
    }
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}

/// 解析 LLM 给出的计划文本：校验后执行优先级优化
pub fn parse_plan(response: &str) -> Result<TaskPlan, WorkflowError> {
    let json = extract_json(response).ok_or_else(|| {
        WorkflowError::InvalidConfiguration("no JSON object found in decomposition output".to_string())
    })?;
    let raw: RawPlan = serde_json::from_str(json)
        .map_err(|e| WorkflowError::InvalidConfiguration(format!("invalid plan JSON: {e}")))?;
    if raw.tasks.is_empty() {
        return Err(WorkflowError::InvalidConfiguration(
            "decomposition produced no tasks".to_string(),
        ));
    }

    let mut plan = TaskPlan::new(raw.name, raw.description);
    plan.metadata = raw.metadata;
    plan.dependencies = raw.dependencies;
    for task in raw.tasks {
        if !task.dependencies.is_empty() {
            let deps = plan.dependencies.entry(task.name.clone()).or_default();
            for dep in task.dependencies {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
        }
        let mut def = TaskDefinition::new(task.name, task.task_type)
            .with_description(task.description)
            .with_priority(task.priority.unwrap_or(5));
        def.conditions = task.conditions;
        def.metadata = task.metadata;
        if let Some(tool) = task.tool_name {
            def = def.with_tool(tool, task.tool_params.unwrap_or(Value::Object(Default::default())));
        }
        plan.tasks.push(def);
    }
    plan.dependencies.retain(|_, deps| !deps.is_empty());

    plan.validate()?;
    plan.optimize_priorities();
    Ok(plan)
}

/// 两个任务描述的词重叠度（Jaccard）超过 0.3 视为相关
fn is_related(a: &TaskDefinition, b: &TaskDefinition) -> bool {
    let words = |t: &TaskDefinition| -> HashSet<String> {
        t.description
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    };
    let (wa, wb) = (words(a), words(b));
    let total = wa.union(&wb).count();
    total > 0 && wa.intersection(&wb).count() as f64 / total as f64 > 0.3
}

/// 按任务类型推断依赖：执行任务依赖相关的规划任务，反思任务依赖相关的执行任务
pub fn analyze_dependencies(tasks: &[TaskDefinition]) -> HashMap<String, Vec<String>> {
    let of_kind = |kind: TaskKind| tasks.iter().filter(move |t| t.kind == kind);
    let mut deps: HashMap<String, Vec<String>> = HashMap::new();
    for (dependent, prerequisite) in [(TaskKind::Execute, TaskKind::Plan), (TaskKind::Reflect, TaskKind::Execute)] {
        for task in of_kind(dependent) {
            let related: Vec<String> = of_kind(prerequisite)
                .filter(|p| is_related(task, p))
                .map(|p| p.name.clone())
                .collect();
            if !related.is_empty() {
                deps.insert(task.name.clone(), related);
            }
        }
    }
    deps
}

/// 可并行执行的任务组（包含多个任务的执行层级）；存在环时返回空
pub fn suggest_parallel_tasks(plan: &TaskPlan) -> Vec<Vec<String>> {
    let ids: HashMap<String, TaskId> = plan
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.clone(), i as TaskId))
        .collect();
    let Ok(graph) = TaskGraph::from_plan(plan, &ids) else {
        return Vec::new();
    };
    let Ok(levels) = graph.get_execution_levels() else {
        return Vec::new();
    };
    levels
        .into_iter()
        .filter(|level| level.len() > 1)
        .map(|level| {
            level
                .into_iter()
                .filter_map(|id| graph.node(id).map(|t| t.name.clone()))
                .collect()
        })
        .collect()
}

/// 基于 LLM 的分解器
pub struct LlmDecomposer {
    llm: Arc<dyn LlmClient>,
    tool_listing: Option<String>,
}

impl LlmDecomposer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            tool_listing: None,
        }
    }

    /// 可用工具说明（写入提示词）
    pub fn with_tools(mut self, listing: impl Into<String>) -> Self {
        self.tool_listing = Some(listing.into());
        self
    }

    fn build_messages(&self, request: &str, context: &Value) -> Vec<Message> {
        let mut system = format!("{DECOMPOSE_MARKER}\n{DECOMPOSE_PROMPT}");
        if let Some(tools) = &self.tool_listing {
            system.push_str("\n\n## 可用工具\n");
            system.push_str(tools);
        }

        let mut user = request.to_string();
        let has_context = match context {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            Value::Array(items) => !items.is_empty(),
            _ => true,
        };
        if has_context {
            let pretty = serde_json::to_string_pretty(context).unwrap_or_default();
            user.push_str(&format!("\n\n## 上下文信息\n{pretty}"));
        }
        vec![Message::system(system), Message::user(user)]
    }
}

#[async_trait]
impl Decomposer for LlmDecomposer {
    async fn decompose(&self, request: &str, context: &Value) -> Result<TaskPlan, OrchestratorError> {
        let preview: String = request.chars().take(100).collect();
        tracing::info!(request = %preview, "Decomposing request");

        let response = self.llm.complete(&self.build_messages(request, context)).await?;
        let plan = parse_plan(&response).map_err(|e| {
            let head: String = response.chars().take(200).collect();
            tracing::warn!(error = %e, response = %head, "Decomposition output rejected");
            OrchestratorError::Structural(format!("task decomposition failed: {e}"))
        })?;

        tracing::info!(plan = %plan.name, tasks = plan.tasks.len(), "Decomposition finished");
        Ok(plan)
    }
}
