//! 任务执行器
//!
//! `TaskRunner` 是单个任务的执行入口；`DefaultTaskRunner` 按任务类型分派：
//! 工具调用、规划/执行/反思步骤、条件分支，以及内联的循环、并行组与重试。
//! 任务体返回 Err 或 panic 都只影响该任务本身（见 `run_guarded`）。

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::OrchestratorError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::tools::ToolInvoker;
use crate::workflow::context::WorkflowContext;
use crate::workflow::loop_executor::LoopExecutor;
use crate::workflow::parallel::ParallelExecutor;
use crate::workflow::types::*;

/// 单个任务的产出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub message: String,
    pub data: Value,
}

impl TaskOutput {
    pub fn new(message: impl Into<String>, data: Value) -> Self {
        Self {
            message: message.into(),
            data,
        }
    }
}

/// 任务执行 trait
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &TaskDefinition, ctx: &WorkflowContext) -> Result<TaskOutput, OrchestratorError>;
}

/// 在任务边界捕获 panic，转为该任务的失败
pub async fn run_guarded(
    runner: &dyn TaskRunner,
    task: &TaskDefinition,
    ctx: &WorkflowContext,
) -> Result<TaskOutput, OrchestratorError> {
    match AssertUnwindSafe(runner.run(task, ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            tracing::error!(task = %task.name, reason = %reason, "Task panicked");
            Err(OrchestratorError::Unknown(format!(
                "task '{}' panicked: {reason}",
                task.name
            )))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// 把参数中的 `{{变量路径}}` 替换为上下文中的值
///
/// 整个字符串恰好是一个占位符时保留原值类型，否则按文本内插；找不到的占位符渲染为空文本。
pub fn render_params(params: &Value, vars: &HashMap<String, Value>) -> Value {
    match params {
        Value::String(s) => render_string(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_params(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_params(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(s: &str, vars: &HashMap<String, Value>) -> Value {
    let trimmed = s.trim();
    if let Some(path) = trimmed.strip_prefix("{{").and_then(|r| r.strip_suffix("}}")) {
        if !path.contains("{{") {
            return match lookup_path(vars, path.trim()) {
                Value::Null => Value::String(String::new()),
                value => value,
            };
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                match lookup_path(vars, path) {
                    Value::Null => {}
                    Value::String(v) => out.push_str(&v),
                    v => out.push_str(&v.to_string()),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

/// 工具输出是合法 JSON 时按结构保存，否则保存为字符串
fn tool_output_value(output: &str) -> Value {
    serde_json::from_str::<Value>(output.trim())
        .ok()
        .filter(|v| v.is_object() || v.is_array())
        .unwrap_or_else(|| Value::String(output.to_string()))
}

/// 任务内联的循环 / 并行单元 ID；与引擎按任务名登记的外层单元区分开
fn inline_unit_id(ctx: &WorkflowContext, task: &TaskDefinition) -> String {
    format!("{}:{}:inner", ctx.execution_id(), task.name)
}

fn meta_u64(task: &TaskDefinition, key: &str) -> Option<u64> {
    task.metadata.get(key).and_then(Value::as_u64)
}

fn meta_f64(task: &TaskDefinition, key: &str) -> Option<f64> {
    task.metadata.get(key).and_then(Value::as_f64)
}

fn meta_parse<T: serde::de::DeserializeOwned>(
    task: &TaskDefinition,
    key: &str,
) -> Result<Option<T>, OrchestratorError> {
    match task.metadata.get(key) {
        None => Ok(None),
        Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|e| {
            OrchestratorError::Validation(format!("task '{}' has invalid '{key}': {e}", task.name))
        }),
    }
}

/// 默认任务执行器
pub struct DefaultTaskRunner {
    tools: Option<Arc<dyn ToolInvoker>>,
    llm: Option<Arc<dyn LlmClient>>,
    loops: Arc<LoopExecutor>,
    parallel: Arc<ParallelExecutor>,
}

impl DefaultTaskRunner {
    pub fn new(loops: Arc<LoopExecutor>, parallel: Arc<ParallelExecutor>) -> Self {
        Self {
            tools: None,
            llm: None,
            loops,
            parallel,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    async fn call_tool(
        &self,
        task: &TaskDefinition,
        binding: &ToolBinding,
        ctx: &WorkflowContext,
    ) -> Result<TaskOutput, OrchestratorError> {
        let tools = self.tools.as_ref().ok_or_else(|| {
            OrchestratorError::Tool(format!(
                "no tool invoker configured for task '{}' (tool '{}')",
                task.name, binding.name
            ))
        })?;
        let vars = ctx.condition_view().await;
        let params = render_params(&binding.params, &vars);
        let output = tools.invoke(&binding.name, params).await?;
        Ok(TaskOutput::new(
            format!("tool '{}' completed", binding.name),
            tool_output_value(&output),
        ))
    }

    /// Plan / Execute / Reflect：绑定了工具则调用工具；配置了 LLM 则让 LLM 完成该步骤；
    /// 否则返回结构化的步骤记录
    async fn run_step(&self, task: &TaskDefinition, ctx: &WorkflowContext) -> Result<TaskOutput, OrchestratorError> {
        if let Some(binding) = &task.tool {
            return self.call_tool(task, binding, ctx).await;
        }

        let Some(llm) = &self.llm else {
            return Ok(TaskOutput::new(
                format!("{} step '{}' recorded", task.kind.as_str(), task.name),
                json!({
                    "task_type": task.kind.as_str(),
                    "description": task.description,
                    "metadata": task.metadata,
                }),
            ));
        };

        let instruction = match task.kind {
            TaskKind::Plan => "你是规划助手。为下面的步骤给出简明、可执行的方案。",
            TaskKind::Reflect => "你是审查助手。检查已有结果是否满足步骤要求，指出问题或确认完成。",
            _ => "你是执行助手。完成下面的步骤并直接给出结果。",
        };
        let results = ctx.task_results().await;
        let mut prompt = format!("步骤：{}\n说明：{}", task.name, task.description);
        if !results.is_empty() {
            let mut names: Vec<_> = results.keys().cloned().collect();
            names.sort();
            prompt.push_str("\n\n已有结果：");
            for name in names {
                let text = results[&name].to_string();
                let preview: String = text.chars().take(300).collect();
                prompt.push_str(&format!("\n- {name}: {preview}"));
            }
        }

        let answer = llm
            .complete(&[Message::system(instruction), Message::user(prompt)])
            .await?;
        Ok(TaskOutput::new(
            format!("{} step '{}' completed", task.kind.as_str(), task.name),
            json!({"task_type": task.kind.as_str(), "output": answer}),
        ))
    }

    /// 条件分支：对 metadata.branch 中的条件求值，结果写入变量 `<任务名>_branch`
    async fn run_conditional(
        &self,
        task: &TaskDefinition,
        ctx: &WorkflowContext,
    ) -> Result<TaskOutput, OrchestratorError> {
        let branch: Vec<Condition> = meta_parse(task, "branch")?.unwrap_or_default();
        let taken = ctx.conditions_met(&branch).await;
        ctx.set_variable(format!("{}_branch", task.name), Value::Bool(taken)).await;
        Ok(TaskOutput::new(
            format!("branch '{}' evaluated to {taken}", task.name),
            json!({"branch": taken}),
        ))
    }

    /// 循环体：metadata.body 给出的任务；没有时以任务自身（按 Execute 处理）作为循环体
    fn loop_body(task: &TaskDefinition) -> Result<Vec<TaskDefinition>, OrchestratorError> {
        if let Some(body) = meta_parse::<Vec<TaskDefinition>>(task, "body")? {
            return Ok(body);
        }
        let mut single = task.clone();
        single.kind = if single.tool.is_some() {
            TaskKind::ToolCall
        } else {
            TaskKind::Execute
        };
        single.metadata.remove("loop");
        single.conditions.clear();
        Ok(vec![single])
    }

    async fn run_loop(&self, task: &TaskDefinition, ctx: &WorkflowContext) -> Result<TaskOutput, OrchestratorError> {
        let config: LoopConfig = meta_parse(task, "loop")?.ok_or_else(|| {
            OrchestratorError::Validation(format!("loop task '{}' has no 'loop' configuration", task.name))
        })?;
        let body = Self::loop_body(task)?;
        let loop_id = inline_unit_id(ctx, task);

        let report = self
            .loops
            .execute_loop_config(&body, &config, &loop_id, ctx, self)
            .await
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;

        let data = serde_json::to_value(&report).unwrap_or(Value::Null);
        if report.success {
            Ok(TaskOutput::new(report.summary(), data))
        } else if let Some(err) = report.retry.as_ref().and_then(|r| r.last_error.clone()) {
            Err(err)
        } else {
            Err(OrchestratorError::Unknown(format!(
                "loop '{}' failed: {}",
                task.name,
                report.summary()
            )))
        }
    }

    async fn run_parallel(&self, task: &TaskDefinition, ctx: &WorkflowContext) -> Result<TaskOutput, OrchestratorError> {
        let tasks: Vec<TaskDefinition> = meta_parse(task, "tasks")?.unwrap_or_default();
        let mut group = ParallelGroup::new(tasks.iter().map(|t| t.name.clone()).collect());
        group.wait_all = task
            .metadata
            .get("wait_all")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        group.timeout_secs = meta_f64(task, "timeout_secs");
        group
            .validate()
            .map_err(|e| OrchestratorError::Validation(format!("parallel task '{}': {e}", task.name)))?;

        let group_id = inline_unit_id(ctx, task);
        let results = self.parallel.execute_group(&group, &tasks, &group_id, ctx, self).await;
        let failed: Vec<_> = results.iter().filter(|r| r.status == TaskStatus::Failed).collect();
        let any_success = results.iter().any(|r| r.is_success());
        let ok = if group.wait_all {
            failed.is_empty()
        } else {
            any_success
        };

        if ok {
            let data = serde_json::to_value(&results).unwrap_or(Value::Null);
            Ok(TaskOutput::new(
                format!("parallel group '{}' finished ({} tasks)", task.name, results.len()),
                data,
            ))
        } else if let Some(err) = failed.iter().find_map(|r| r.failure.clone()) {
            Err(err)
        } else {
            Err(OrchestratorError::Unknown(format!(
                "parallel group '{}' failed",
                task.name
            )))
        }
    }

    async fn run_retry(&self, task: &TaskDefinition, ctx: &WorkflowContext) -> Result<TaskOutput, OrchestratorError> {
        let mut body = task.clone();
        body.kind = if body.tool.is_some() {
            TaskKind::ToolCall
        } else {
            TaskKind::Execute
        };
        body.conditions.clear();

        let max_retries = meta_u64(task, "max_retries").unwrap_or(3) as u32;
        let retry_delay = Duration::from_millis(meta_u64(task, "retry_delay_ms").unwrap_or(1000));
        let backoff = meta_f64(task, "backoff_factor").unwrap_or(2.0).max(1.0);
        let loop_id = inline_unit_id(ctx, task);

        let outcome = self
            .loops
            .execute_with_retry(&body, max_retries, retry_delay, backoff, &loop_id, ctx, self)
            .await;

        match (outcome.success, outcome.output.clone()) {
            (true, Some(output)) => Ok(TaskOutput::new(
                format!("succeeded after {} attempt(s)", outcome.attempts),
                json!({"attempts": outcome.attempts, "output": output.data}),
            )),
            _ => Err(outcome.last_error.clone().unwrap_or_else(|| {
                OrchestratorError::Unknown(format!(
                    "task '{}' failed after {} attempt(s)",
                    task.name, outcome.attempts
                ))
            })),
        }
    }
}

#[async_trait]
impl TaskRunner for DefaultTaskRunner {
    async fn run(&self, task: &TaskDefinition, ctx: &WorkflowContext) -> Result<TaskOutput, OrchestratorError> {
        tracing::debug!(task = %task.name, kind = task.kind.as_str(), "Running task");
        match task.kind {
            TaskKind::ToolCall => {
                let binding = task.tool.as_ref().ok_or_else(|| {
                    OrchestratorError::Validation(format!(
                        "tool_call task '{}' has no tool binding",
                        task.name
                    ))
                })?;
                self.call_tool(task, binding, ctx).await
            }
            TaskKind::Plan | TaskKind::Execute | TaskKind::Reflect => self.run_step(task, ctx).await,
            TaskKind::Conditional => self.run_conditional(task, ctx).await,
            TaskKind::Loop => self.run_loop(task, ctx).await,
            TaskKind::Parallel => self.run_parallel(task, ctx).await,
            TaskKind::Retry => self.run_retry(task, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, FnTool, ToolExecutor, ToolRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner() -> DefaultTaskRunner {
        let calls = Arc::new(AtomicUsize::new(0));
        let flaky_calls = calls.clone();
        let registry = ToolRegistry::new()
            .with_tool(EchoTool)
            .with_tool(FnTool::new("flaky", "fails twice", move |_| {
                if flaky_calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("temporary failure".to_string())
                } else {
                    Ok("recovered".to_string())
                }
            }));
        DefaultTaskRunner::new(Arc::new(LoopExecutor::new()), Arc::new(ParallelExecutor::new()))
            .with_tools(Arc::new(ToolExecutor::new(registry, 5)))
    }

    #[test]
    fn test_render_params() {
        let vars: HashMap<String, Value> =
            [("current_item".to_string(), json!({"id": 7})), ("user".to_string(), json!("bob"))].into();
        let params = json!({
            "whole": "{{current_item}}",
            "text": "hello {{user}}, item {{current_item.id}} {{missing}}",
            "list": ["{{user}}", 1]
        });
        let rendered = render_params(&params, &vars);
        assert_eq!(rendered["whole"], json!({"id": 7}));
        assert_eq!(rendered["text"], "hello bob, item 7 ");
        assert_eq!(rendered["list"], json!(["bob", 1]));
    }

    #[test]
    fn test_unresolved_placeholders_render_empty() {
        let vars: HashMap<String, Value> = HashMap::new();
        let rendered = render_params(&json!({"text": "hi {{missing}}", "whole": "{{missing}}"}), &vars);
        assert_eq!(rendered, json!({"text": "hi ", "whole": ""}));
    }

    #[tokio::test]
    async fn test_tool_call_requires_binding() {
        let ctx = WorkflowContext::new("e");
        let task = TaskDefinition::new("t", TaskKind::ToolCall);
        let err = runner().run(&task, &ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_tool_call_renders_from_context() {
        let ctx = WorkflowContext::new("e");
        ctx.set_variable("name", json!("world")).await;
        let task = TaskDefinition::tool_call("greet", "echo", json!({"text": "hi {{name}}"}));
        let out = runner().run(&task, &ctx).await.unwrap();
        assert_eq!(out.data, json!("hi world"));
    }

    #[tokio::test]
    async fn test_step_without_llm_returns_record() {
        let ctx = WorkflowContext::new("e");
        let task = TaskDefinition::new("design", TaskKind::Plan).with_description("设计数据模型");
        let out = runner().run(&task, &ctx).await.unwrap();
        assert_eq!(out.data["task_type"], "plan");
        assert_eq!(out.data["description"], "设计数据模型");
    }

    #[tokio::test]
    async fn test_conditional_sets_branch_variable() {
        let ctx = WorkflowContext::new("e");
        ctx.set_variable("score", json!(0.9)).await;
        let task = TaskDefinition::new("gate", TaskKind::Conditional).with_metadata(
            "branch",
            json!([{"field": "score", "operator": "gt", "value": 0.5}]),
        );
        let out = runner().run(&task, &ctx).await.unwrap();
        assert_eq!(out.data["branch"], true);
        assert_eq!(ctx.get_variable("gate_branch").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_inline_for_loop() {
        let ctx = WorkflowContext::new("e");
        let task = TaskDefinition::new("each", TaskKind::Loop)
            .with_tool("echo", json!({"text": "{{current_item}}"}))
            .with_metadata("loop", json!({"type": "for", "items": ["a", "b", "c"]}));
        let out = runner().run(&task, &ctx).await.unwrap();
        assert_eq!(out.data["iterations"].as_array().unwrap().len(), 3);
        assert_eq!(ctx.get_task_result("each").await, Some(json!("c")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_retry_recovers() {
        let ctx = WorkflowContext::new("e");
        let task = TaskDefinition::new("call", TaskKind::Retry)
            .with_tool("flaky", json!({}))
            .with_metadata("max_retries", json!(3))
            .with_metadata("retry_delay_ms", json!(10));
        let out = runner().run(&task, &ctx).await.unwrap();
        assert_eq!(out.data["attempts"], 3);
        assert_eq!(out.data["output"], "recovered");
    }

    #[tokio::test]
    async fn test_inline_parallel() {
        let ctx = WorkflowContext::new("e");
        let task = TaskDefinition::new("fan_out", TaskKind::Parallel).with_metadata(
            "tasks",
            json!([
                {"name": "x", "task_type": "tool_call", "tool": {"name": "echo", "params": {"text": "x"}}},
                {"name": "y", "task_type": "tool_call", "tool": {"name": "echo", "params": {"text": "y"}}}
            ]),
        );
        runner().run(&task, &ctx).await.unwrap();
        assert_eq!(ctx.get_task_result("x").await, Some(json!("x")));
        assert_eq!(ctx.get_task_result("y").await, Some(json!("y")));
    }

    /// 执行时报告当前登记中的循环 ID
    struct ActiveLoopsTool(Arc<LoopExecutor>);

    #[async_trait]
    impl crate::tools::Tool for ActiveLoopsTool {
        fn name(&self) -> &str {
            "active_loops"
        }

        fn description(&self) -> &str {
            "lists active loop ids"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            let mut ids: Vec<String> = self.0.active_loops().await.into_iter().map(|s| s.id).collect();
            ids.sort();
            serde_json::to_string(&ids).map_err(|e| e.to_string())
        }
    }

    #[tokio::test]
    async fn test_nested_retry_keeps_outer_registration() {
        let loops = Arc::new(LoopExecutor::new());
        let registry = ToolRegistry::new().with_tool(ActiveLoopsTool(loops.clone()));
        let runner = DefaultTaskRunner::new(loops.clone(), Arc::new(ParallelExecutor::new()))
            .with_tools(Arc::new(ToolExecutor::new(registry, 5)));
        let ctx = WorkflowContext::new("e");
        let task = TaskDefinition::new("call", TaskKind::Retry)
            .with_tool("active_loops", json!({}))
            .with_metadata("max_retries", json!(0));

        let outer = loops
            .execute_with_retry(&task, 0, Duration::from_millis(1), 1.0, "e:call", &ctx, &runner)
            .await;
        assert!(outer.success);
        let seen = &outer.output.unwrap().data["output"];
        assert_eq!(seen, &json!(["e:call", "e:call:inner"]));
        assert!(loops.active_loops().await.is_empty());
    }

    struct PanickingRunner;

    #[async_trait]
    impl TaskRunner for PanickingRunner {
        async fn run(&self, _task: &TaskDefinition, _ctx: &WorkflowContext) -> Result<TaskOutput, OrchestratorError> {
            panic!("kaboom");
        }
    }

    #[tokio::test]
    async fn test_run_guarded_catches_panic() {
        let ctx = WorkflowContext::new("e");
        let task = TaskDefinition::new("t", TaskKind::Execute);
        let err = run_guarded(&PanickingRunner, &task, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }
}
