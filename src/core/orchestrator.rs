//! 编排器：单个请求的端到端驱动
//!
//! 流程：重置状态机 → 检索记忆 → ROUTING（显式模式或路由器决策）→ EXECUTING（按模式执行）
//! → 写回记忆 → COMPLETED。
//! 任何错误：ERROR → 交给 ErrorHandler → 可恢复则 RECOVERING → 以指令给出的模式重跑一次；
//! 否则返回携带完整状态历史的失败响应。编排器从不向调用方抛出错误。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::core::error::{classify_message, OrchestratorError, RecoveryDirective};
use crate::core::recovery::{ErrorHandler, ErrorStatistics};
use crate::core::router::{CacheStats, ExecutionMode, RouteDecision, TaskRouter};
use crate::core::state::{ExecutionState, StateMachine, StateTransition};
use crate::llm::LlmClient;
use crate::memory::{MemoryKind, MemoryRecord, MemoryStore, Message};
use crate::reflection::ReflectiveExecutor;
use crate::tools::ToolInvoker;
use crate::workflow::decomposer::extract_json;
use crate::workflow::{Decomposer, ExecutionOptions, ExecutionStatus, WorkflowEngine};

/// 保留状态的最近请求数
const MAX_SESSIONS: usize = 256;
/// 写入上下文摘要的记忆条数
const MEMORY_SUMMARY_ITEMS: usize = 5;
const DEFAULT_GOAL: &str = "完成用户请求";

fn default_user() -> String {
    "anonymous".to_string()
}

/// 编排请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorRequest {
    pub content: String,
    #[serde(default = "default_user")]
    pub user_id: String,
    /// 未指定时自动生成
    #[serde(default)]
    pub execution_id: Option<String>,
    /// 显式指定执行模式（跳过路由）
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    /// 调用方上下文（JSON 对象）
    #[serde(default)]
    pub context: Value,
}

impl OrchestratorRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            user_id: default_user(),
            execution_id: None,
            mode: None,
            context: Value::Object(Map::new()),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        if !self.context.is_object() {
            self.context = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.context {
            map.insert(key.into(), value);
        }
        self
    }
}

/// 编排响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResponse {
    pub success: bool,
    pub content: String,
    pub mode: ExecutionMode,
    pub execution_id: String,
    /// 秒
    pub execution_time: f64,
    pub state_history: Vec<StateTransition>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// get_status 的返回
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub execution_id: String,
    pub current_state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    pub state_history: Vec<StateTransition>,
    /// Planning 模式下仍在运行的工作流
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateMachineSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state: Option<ExecutionState>,
    pub transition_count: usize,
    pub tracked_executions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatistics {
    pub state_machine: StateMachineSummary,
    pub router: CacheStats,
    pub error_handler: ErrorStatistics,
}

/// 模式执行的产出
#[derive(Debug, Default)]
struct ModeOutput {
    content: String,
    metadata: HashMap<String, Value>,
}

impl ModeOutput {
    fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Simple 模式下 LLM 请求的工具调用
#[derive(Debug, Deserialize)]
struct ToolCallRequest {
    tool: String,
    #[serde(default)]
    args: Value,
}

fn parse_tool_call(response: &str) -> Option<ToolCallRequest> {
    let raw = extract_json(response)?;
    serde_json::from_str::<ToolCallRequest>(raw)
        .ok()
        .filter(|c| !c.tool.trim().is_empty())
}

#[derive(Debug)]
struct Session {
    machine: StateMachine,
    mode: Option<ExecutionMode>,
}

#[derive(Debug, Default)]
struct Sessions {
    by_id: HashMap<String, Session>,
    order: VecDeque<String>,
}

/// 编排器
pub struct Orchestrator {
    pub(crate) router: TaskRouter,
    pub(crate) engine: Arc<WorkflowEngine>,
    pub(crate) decomposer: Arc<dyn Decomposer>,
    pub(crate) reflector: Arc<dyn ReflectiveExecutor>,
    pub(crate) tools: Arc<dyn ToolInvoker>,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) memory: Arc<dyn MemoryStore>,
    pub(crate) error_handler: ErrorHandler,
    pub(crate) system_prompt: String,
    pub(crate) memory_limit: usize,
    sessions: Mutex<Sessions>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        router: TaskRouter,
        engine: Arc<WorkflowEngine>,
        decomposer: Arc<dyn Decomposer>,
        reflector: Arc<dyn ReflectiveExecutor>,
        tools: Arc<dyn ToolInvoker>,
        llm: Arc<dyn LlmClient>,
        memory: Arc<dyn MemoryStore>,
        error_handler: ErrorHandler,
        system_prompt: String,
        memory_limit: usize,
    ) -> Self {
        Self {
            router,
            engine,
            decomposer,
            reflector,
            tools,
            llm,
            memory,
            error_handler,
            system_prompt,
            memory_limit,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.error_handler
    }

    /// 执行一个请求
    pub async fn execute(&self, request: OrchestratorRequest) -> OrchestratorResponse {
        let started = Instant::now();
        let execution_id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.begin_session(&execution_id);

        let memories = self.retrieve_memories(&request).await;

        let preview: String = request.content.chars().take(100).collect();
        self.transition(
            &execution_id,
            ExecutionState::Routing,
            [
                ("request".to_string(), json!(preview)),
                ("memories_count".to_string(), json!(memories.len())),
            ],
        );

        let (mode, route) = match request.mode {
            Some(mode) => {
                tracing::info!(execution_id = %execution_id, mode = %mode, "Using explicit execution mode");
                (mode, None)
            }
            None => {
                let decision = self.router.route(&request.content, &request.context).await;
                (decision.mode, Some(decision))
            }
        };
        self.set_mode(&execution_id, mode);
        self.transition(
            &execution_id,
            ExecutionState::Executing,
            [("mode".to_string(), json!(mode))],
        );

        let context = build_context(&request, &execution_id, &memories, &self.system_prompt);
        match self.run_mode(mode, &request, &execution_id, &context).await {
            Ok(output) => {
                self.store_memory(&request, &execution_id, &output.content, mode).await;
                self.transition(
                    &execution_id,
                    ExecutionState::Completed,
                    [("success".to_string(), json!(true))],
                );
                let mut metadata = output.metadata;
                metadata.insert("user_id".to_string(), json!(request.user_id));
                metadata.insert("memories_retrieved".to_string(), json!(memories.len()));
                if let Some(route) = route {
                    metadata.insert("route".to_string(), route_value(&route));
                }
                OrchestratorResponse {
                    success: true,
                    content: output.content,
                    mode,
                    execution_id: execution_id.clone(),
                    execution_time: started.elapsed().as_secs_f64(),
                    state_history: self.history(&execution_id),
                    metadata,
                    error: None,
                }
            }
            Err(err) => {
                self.recover(&request, &execution_id, mode, &context, err, started)
                    .await
            }
        }
    }

    /// 错误恢复：最多在编排器层重跑一次
    async fn recover(
        &self,
        request: &OrchestratorRequest,
        execution_id: &str,
        mode: ExecutionMode,
        context: &Value,
        err: OrchestratorError,
        started: Instant,
    ) -> OrchestratorResponse {
        tracing::error!(execution_id = %execution_id, mode = %mode, error = %err, "Request execution failed");
        self.transition(
            execution_id,
            ExecutionState::Error,
            [("error".to_string(), json!(err.to_string()))],
        );

        let mut error_context = match &request.context {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        error_context
            .entry("execution_id")
            .or_insert_with(|| json!(execution_id));
        let directive = self
            .error_handler
            .handle_error(&err, &Value::Object(error_context));

        let mut final_mode = mode;
        if directive.can_recover {
            // Retry 没有指定模式：原模式重跑
            let retry_mode = directive.downgrade_to.unwrap_or(mode);
            tracing::info!(
                execution_id = %execution_id,
                strategy = ?directive.strategy,
                mode = %retry_mode,
                "Attempting recovery"
            );
            self.transition(
                execution_id,
                ExecutionState::Recovering,
                [("recovery_strategy".to_string(), json!(directive.strategy))],
            );
            self.set_mode(execution_id, retry_mode);
            self.transition(
                execution_id,
                ExecutionState::Executing,
                [
                    ("mode".to_string(), json!(retry_mode)),
                    ("recovery".to_string(), json!(true)),
                ],
            );
            final_mode = retry_mode;

            match self.run_mode(retry_mode, request, execution_id, context).await {
                Ok(output) => {
                    self.store_memory(request, execution_id, &output.content, retry_mode)
                        .await;
                    self.transition(
                        execution_id,
                        ExecutionState::Completed,
                        [
                            ("success".to_string(), json!(true)),
                            ("recovered".to_string(), json!(true)),
                        ],
                    );
                    let mut metadata = output.metadata;
                    metadata.insert("recovered".to_string(), json!(true));
                    metadata.insert("original_error".to_string(), json!(err.to_string()));
                    metadata.insert("recovery_strategy".to_string(), json!(directive.strategy));
                    return OrchestratorResponse {
                        success: true,
                        content: output.content,
                        mode: retry_mode,
                        execution_id: execution_id.to_string(),
                        execution_time: started.elapsed().as_secs_f64(),
                        state_history: self.history(execution_id),
                        metadata,
                        error: None,
                    };
                }
                Err(retry_err) => {
                    tracing::error!(execution_id = %execution_id, error = %retry_err, "Recovery failed");
                    self.transition(
                        execution_id,
                        ExecutionState::Error,
                        [("error".to_string(), json!(retry_err.to_string()))],
                    );
                }
            }
        }

        OrchestratorResponse {
            success: false,
            content: String::new(),
            mode: final_mode,
            execution_id: execution_id.to_string(),
            execution_time: started.elapsed().as_secs_f64(),
            state_history: self.history(execution_id),
            metadata: failure_metadata(&directive),
            error: Some(err.to_string()),
        }
    }

    async fn run_mode(
        &self,
        mode: ExecutionMode,
        request: &OrchestratorRequest,
        execution_id: &str,
        context: &Value,
    ) -> Result<ModeOutput, OrchestratorError> {
        match mode {
            ExecutionMode::Simple => self.run_simple(request, context).await,
            ExecutionMode::Planning => self.run_planning(request, execution_id, context).await,
            ExecutionMode::Reflection => self.run_reflection(request, context).await,
        }
    }

    /// Simple：单次 LLM 调用；回答是工具调用 JSON 时执行该工具
    async fn run_simple(&self, request: &OrchestratorRequest, context: &Value) -> Result<ModeOutput, OrchestratorError> {
        let mut system = self.system_prompt.clone();
        let listing = self.tools.describe_tools();
        if !listing.is_empty() {
            system.push_str("\n\n## 可用工具\n");
            system.push_str(&listing);
            system.push_str(
                "\n\n需要调用工具时只输出一个 JSON 对象：{\"tool\": \"工具名\", \"args\": {...}}；否则直接回答。",
            );
        }
        if let Some(summary) = context.get("memory_summary").and_then(Value::as_str) {
            system.push_str(&format!("\n\n## 相关记忆\n{summary}"));
        }

        let messages = vec![Message::system(system), Message::user(request.content.clone())];
        let response = self.llm.complete(&messages).await?;

        match parse_tool_call(&response) {
            Some(call) => {
                tracing::debug!(tool = %call.tool, "Simple mode tool call");
                let output = self.tools.invoke(&call.tool, call.args).await?;
                Ok(ModeOutput::new(output).with_metadata("tool", json!(call.tool)))
            }
            None => Ok(ModeOutput::new(response.trim())),
        }
    }

    /// Planning：分解为任务计划并交给工作流引擎
    async fn run_planning(
        &self,
        request: &OrchestratorRequest,
        execution_id: &str,
        context: &Value,
    ) -> Result<ModeOutput, OrchestratorError> {
        let plan = self.decomposer.decompose(&request.content, context).await?;

        let mut options = ExecutionOptions::default().with_variable("request", json!(request.content));
        options.user_id = Some(request.user_id.clone());
        let result = self
            .engine
            .execute_with_options(&plan, execution_id, options)
            .await?;

        if !result.success {
            let failed = result.failed_tasks();
            let details = failed
                .iter()
                .map(|o| format!("{}: {}", o.task_name, o.error.as_deref().unwrap_or(&o.message)))
                .collect::<Vec<_>>()
                .join("; ");
            let message = format!("planning execution failed ({}): {details}", result.message);
            // 沿用首个失败任务的错误类别，没有记录时按消息归类
            let kind = failed
                .iter()
                .find_map(|o| o.error_kind)
                .unwrap_or_else(|| classify_message(&message));
            return Err(OrchestratorError::of_kind(kind, message));
        }

        let mut outcomes: Vec<_> = result
            .task_results
            .values()
            .filter(|o| o.status == crate::workflow::TaskStatus::Completed)
            .collect();
        outcomes.sort_by_key(|o| o.task_id);
        let mut content = result.message.clone();
        for o in outcomes {
            content.push_str(&format!("\n- {}: {}", o.task_name, o.message));
        }

        Ok(ModeOutput::new(content)
            .with_metadata("plan_name", json!(plan.name))
            .with_metadata("task_count", json!(plan.tasks.len()))
            .with_metadata("workflow", json!(result.metadata)))
    }

    /// Reflection：交给反思执行器
    async fn run_reflection(&self, request: &OrchestratorRequest, context: &Value) -> Result<ModeOutput, OrchestratorError> {
        let goal = context
            .get("goal")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_GOAL)
            .to_string();
        let constraints: Vec<String> = context
            .get("constraints")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let outcome = self
            .reflector
            .execute_with_reflection(&request.content, &goal, &constraints, context)
            .await;
        if !outcome.success {
            let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(OrchestratorError::Unknown(format!("reflection failed: {error}")));
        }
        Ok(ModeOutput::new(outcome.output.unwrap_or_default())
            .with_metadata("reflection_attempts", json!(outcome.attempts))
            .with_metadata("corrections", json!(outcome.corrections)))
    }

    /// 检索记忆；失败退化为空
    async fn retrieve_memories(&self, request: &OrchestratorRequest) -> Vec<MemoryRecord> {
        if !self.memory.enabled() || self.memory_limit == 0 {
            return Vec::new();
        }
        match self
            .memory
            .retrieve(&request.content, &request.user_id, self.memory_limit)
            .await
        {
            Ok(memories) => {
                tracing::debug!(count = memories.len(), "Memories retrieved");
                memories
            }
            Err(e) => {
                tracing::warn!(error = %e, "Memory retrieval failed");
                Vec::new()
            }
        }
    }

    /// 写回记忆；失败只记日志
    async fn store_memory(&self, request: &OrchestratorRequest, execution_id: &str, result: &str, mode: ExecutionMode) {
        if !self.memory.enabled() {
            return;
        }
        let (kind, importance) = match mode {
            ExecutionMode::Reflection => (MemoryKind::Reflection, 0.8),
            ExecutionMode::Planning => (MemoryKind::Planning, 0.7),
            ExecutionMode::Simple => (MemoryKind::Conversation, 0.5),
        };
        let record = MemoryRecord::new(
            format!("用户: {}\n助手: {result}", request.content),
            request.user_id.clone(),
            execution_id,
            kind,
            importance,
        )
        .with_metadata("mode", json!(mode));
        if let Err(e) = self.memory.store(record).await {
            tracing::warn!(error = %e, "Memory store failed");
        }
    }

    /// 当前状态、转换历史、模式，以及仍在运行的工作流
    pub async fn get_status(&self, execution_id: &str) -> Option<StatusSnapshot> {
        let (current_state, mode, state_history) = {
            let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let session = sessions.by_id.get(execution_id)?;
            (
                session.machine.current_state(),
                session.mode,
                session.machine.history().to_vec(),
            )
        };
        let workflow = self.engine.get_execution_status(execution_id).await;
        Some(StatusSnapshot {
            execution_id: execution_id.to_string(),
            current_state,
            mode,
            state_history,
            workflow,
        })
    }

    pub fn statistics(&self) -> OrchestratorStatistics {
        let state_machine = {
            let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let last = sessions.order.back().cloned();
            let machine = last.as_ref().and_then(|id| sessions.by_id.get(id)).map(|s| &s.machine);
            StateMachineSummary {
                current_state: machine.map(StateMachine::current_state),
                transition_count: machine.map(|m| m.history().len()).unwrap_or(0),
                last_execution_id: last,
                tracked_executions: sessions.by_id.len(),
            }
        };
        OrchestratorStatistics {
            state_machine,
            router: self.router.cache_stats(),
            error_handler: self.error_handler.error_statistics(),
        }
    }

    /// 为请求准备一台全新的状态机
    fn begin_session(&self, execution_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let Sessions { by_id, order } = &mut *sessions;
        match by_id.get_mut(execution_id) {
            Some(session) => {
                session.machine.reset();
                session.mode = None;
                order.retain(|id| id != execution_id);
            }
            None => {
                by_id.insert(
                    execution_id.to_string(),
                    Session {
                        machine: StateMachine::new(),
                        mode: None,
                    },
                );
            }
        }
        order.push_back(execution_id.to_string());
        while order.len() > MAX_SESSIONS {
            if let Some(old) = order.pop_front() {
                by_id.remove(&old);
            }
        }
    }

    fn transition<I>(&self, execution_id: &str, target: ExecutionState, context: I) -> bool
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.by_id.get_mut(execution_id) {
            Some(session) => session
                .machine
                .transition(target, Some(context.into_iter().collect())),
            None => false,
        }
    }

    fn set_mode(&self, execution_id: &str, mode: ExecutionMode) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.by_id.get_mut(execution_id) {
            session.mode = Some(mode);
        }
    }

    fn history(&self, execution_id: &str) -> Vec<StateTransition> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(execution_id)
            .map(|s| s.machine.history().to_vec())
            .unwrap_or_default()
    }
}

/// 请求上下文 + 记忆 + 执行 ID
fn build_context(request: &OrchestratorRequest, execution_id: &str, memories: &[MemoryRecord], system_prompt: &str) -> Value {
    let mut map = match &request.context {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut m = Map::new();
            m.insert("request_context".to_string(), other.clone());
            m
        }
    };
    map.insert("execution_id".to_string(), json!(execution_id));
    map.insert("user_id".to_string(), json!(request.user_id));
    if !system_prompt.is_empty() {
        map.insert("system_prompt".to_string(), json!(system_prompt));
    }
    if !memories.is_empty() {
        let items: Vec<Value> = memories
            .iter()
            .map(|m| json!({"content": m.content, "type": m.kind, "importance": m.importance}))
            .collect();
        map.insert("memories".to_string(), Value::Array(items));
        map.insert("memory_summary".to_string(), json!(summarize_memories(memories)));
    }
    Value::Object(map)
}

fn summarize_memories(memories: &[MemoryRecord]) -> String {
    memories
        .iter()
        .take(MEMORY_SUMMARY_ITEMS)
        .map(|m| {
            let head: String = m.content.chars().take(100).collect();
            format!("[{}] {head}", m.kind.as_str())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn route_value(route: &RouteDecision) -> Value {
    serde_json::to_value(route).unwrap_or(Value::Null)
}

fn failure_metadata(directive: &RecoveryDirective) -> HashMap<String, Value> {
    let mut metadata = HashMap::new();
    metadata.insert(
        "recovery".to_string(),
        serde_json::to_value(directive).unwrap_or(Value::Null),
    );
    metadata
}
