//! 工作流引擎
//!
//! 执行任务计划：为每个任务创建记录、构建依赖图、按执行层级调度。
//! 同一层级的任务并发执行，层级之间严格先后；单个任务失败只记录在该任务上，
//! 每层结束后由失败策略决定是否继续。计划本身非法（环、未知任务、存储失败）时
//! 在任何任务运行前返回结构性错误。

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;

use crate::core::OrchestratorError;
use crate::llm::LlmClient;
use crate::tools::ToolInvoker;
use crate::workflow::context::{ContextSnapshot, WorkflowContext};
use crate::workflow::graph::TaskGraph;
use crate::workflow::loop_executor::LoopExecutor;
use crate::workflow::parallel::ParallelExecutor;
use crate::workflow::registry::{ActiveRegistry, ActiveStatus};
use crate::workflow::runner::{run_guarded, DefaultTaskRunner, TaskOutput, TaskRunner};
use crate::workflow::store::{InMemoryTaskStore, NewTask, TaskRecord, TaskStore};
use crate::workflow::types::*;

/// 失败策略：每层结束后根据失败数决定是否继续后续层级
pub trait FailurePolicy: Send + Sync + Debug {
    fn should_continue(&self, failed: usize, total: usize) -> bool;
}

/// 按失败比例决定：失败数 ≤ 总数 × 比例 时继续
#[derive(Debug, Clone)]
pub struct RatioFailurePolicy {
    pub max_failure_ratio: f64,
}

impl RatioFailurePolicy {
    pub fn new(max_failure_ratio: f64) -> Self {
        Self {
            max_failure_ratio: max_failure_ratio.clamp(0.0, 1.0),
        }
    }
}

impl Default for RatioFailurePolicy {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl FailurePolicy for RatioFailurePolicy {
    fn should_continue(&self, failed: usize, total: usize) -> bool {
        failed == 0 || failed as f64 <= total as f64 * self.max_failure_ratio
    }
}

/// 一次执行的附加选项
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// 任务名 -> 循环配置（该任务按循环执行）
    pub loops: HashMap<String, LoopConfig>,
    /// 并行组：同一层级中属于同一组的任务交给并行执行器
    pub parallel_groups: Vec<ParallelGroup>,
    /// 初始上下文变量
    pub variables: HashMap<String, Value>,
    pub user_id: Option<String>,
}

impl ExecutionOptions {
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_loop(mut self, task_name: impl Into<String>, config: LoopConfig) -> Self {
        self.loops.insert(task_name.into(), config);
        self
    }

    pub fn with_parallel_group(mut self, group: ParallelGroup) -> Self {
        self.parallel_groups.push(group);
        self
    }
}

/// 运行中执行的状态
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    pub execution_id: ExecutionId,
    pub progress: ActiveStatus,
    pub context: ContextSnapshot,
}

/// 工作流引擎构建器
pub struct WorkflowEngineBuilder {
    store: Option<Arc<dyn TaskStore>>,
    tools: Option<Arc<dyn ToolInvoker>>,
    llm: Option<Arc<dyn LlmClient>>,
    runner: Option<Arc<dyn TaskRunner>>,
    failure_policy: Arc<dyn FailurePolicy>,
    max_concurrency: usize,
    default_group_timeout: Option<Duration>,
}

impl Default for WorkflowEngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            tools: None,
            llm: None,
            runner: None,
            failure_policy: Arc::new(RatioFailurePolicy::default()),
            max_concurrency: 8,
            default_group_timeout: None,
        }
    }
}

impl WorkflowEngineBuilder {
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 自定义任务执行器（替代按类型分派的默认实现）
    pub fn runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn failure_policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn max_failure_ratio(self, ratio: f64) -> Self {
        self.failure_policy(Arc::new(RatioFailurePolicy::new(ratio)))
    }

    /// 同一层级同时运行的任务上限
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    /// 未设置超时的并行组使用该超时
    pub fn default_group_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_group_timeout = timeout;
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let loops = Arc::new(LoopExecutor::new());
        let parallel = Arc::new(ParallelExecutor::new());
        let runner = self.runner.unwrap_or_else(|| {
            let mut runner = DefaultTaskRunner::new(loops.clone(), parallel.clone());
            if let Some(tools) = self.tools {
                runner = runner.with_tools(tools);
            }
            if let Some(llm) = self.llm {
                runner = runner.with_llm(llm);
            }
            Arc::new(runner)
        });

        WorkflowEngine {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()) as Arc<dyn TaskStore>),
            runner,
            loops,
            parallel,
            failure_policy: self.failure_policy,
            executions: ActiveRegistry::new(),
            contexts: RwLock::new(HashMap::new()),
            max_concurrency: self.max_concurrency,
            default_group_timeout: self.default_group_timeout,
        }
    }
}

/// 工作流引擎
pub struct WorkflowEngine {
    store: Arc<dyn TaskStore>,
    runner: Arc<dyn TaskRunner>,
    loops: Arc<LoopExecutor>,
    parallel: Arc<ParallelExecutor>,
    failure_policy: Arc<dyn FailurePolicy>,
    executions: ActiveRegistry,
    contexts: RwLock<HashMap<ExecutionId, Arc<WorkflowContext>>>,
    /// 单个层级内同时运行的任务上限（每个层级各自计数）
    max_concurrency: usize,
    default_group_timeout: Option<Duration>,
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::default()
    }

    /// 使用给定存储与工具、默认失败策略创建引擎
    pub fn new(store: Arc<dyn TaskStore>, tools: Arc<dyn ToolInvoker>) -> Self {
        Self::builder().store(store).tools(tools).build()
    }

    pub fn loop_executor(&self) -> &Arc<LoopExecutor> {
        &self.loops
    }

    pub fn parallel_executor(&self) -> &Arc<ParallelExecutor> {
        &self.parallel
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// 执行计划
    pub async fn execute_plan(&self, plan: &TaskPlan, execution_id: &str) -> Result<ExecutionResult, WorkflowError> {
        self.execute_with_options(plan, execution_id, ExecutionOptions::default())
            .await
    }

    /// 执行计划，指定任务按循环配置执行
    pub async fn execute_with_loops(
        &self,
        plan: &TaskPlan,
        execution_id: &str,
        loops: HashMap<String, LoopConfig>,
    ) -> Result<ExecutionResult, WorkflowError> {
        let options = ExecutionOptions {
            loops,
            ..Default::default()
        };
        self.execute_with_options(plan, execution_id, options).await
    }

    /// 执行计划，同层中的并行组交给并行执行器（支持组超时与首个成功返回）
    pub async fn execute_with_parallel(
        &self,
        plan: &TaskPlan,
        execution_id: &str,
        groups: Vec<ParallelGroup>,
    ) -> Result<ExecutionResult, WorkflowError> {
        let options = ExecutionOptions {
            parallel_groups: groups,
            ..Default::default()
        };
        self.execute_with_options(plan, execution_id, options).await
    }

    pub async fn execute_with_options(
        &self,
        plan: &TaskPlan,
        execution_id: &str,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, WorkflowError> {
        let started = Instant::now();
        plan.validate()?;
        Self::validate_options(plan, &options)?;

        if self.executions.is_active(execution_id).await {
            return Err(WorkflowError::AlreadyRunning(execution_id.to_string()));
        }
        let token = self
            .executions
            .register(execution_id, "execution", plan.tasks.len(), None)
            .await;
        self.executions
            .set_info(execution_id, "plan_name", json!(plan.name))
            .await;

        let mut ctx = WorkflowContext::new(execution_id)
            .with_variables(options.variables.clone())
            .with_cancel_token(token);
        if let Some(user) = &options.user_id {
            ctx = ctx.with_user(user.clone());
        }
        let ctx = Arc::new(ctx);
        ctx.set_metadata("plan_name", json!(plan.name)).await;
        self.contexts
            .write()
            .await
            .insert(execution_id.to_string(), ctx.clone());

        tracing::info!(
            execution_id = %execution_id,
            plan = %plan.name,
            tasks = plan.tasks.len(),
            "Plan execution started"
        );
        let result = self.run_plan(plan, &ctx, &options).await;

        self.contexts.write().await.remove(execution_id);
        self.executions.remove(execution_id).await;

        match result {
            Ok(mut result) => {
                result.execution_time = started.elapsed().as_secs_f64();
                tracing::info!(
                    execution_id = %execution_id,
                    success = result.success,
                    message = %result.message,
                    elapsed_secs = result.execution_time,
                    "Plan execution finished"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(execution_id = %execution_id, error = %e, "Plan execution aborted");
                Err(e)
            }
        }
    }

    fn validate_options(plan: &TaskPlan, options: &ExecutionOptions) -> Result<(), WorkflowError> {
        for (name, config) in &options.loops {
            if !plan.contains_task(name) {
                return Err(WorkflowError::UnknownTask(name.clone()));
            }
            config.validate()?;
        }

        let mut grouped = HashMap::new();
        for (index, group) in options.parallel_groups.iter().enumerate() {
            group.validate()?;
            for name in &group.task_names {
                if !plan.contains_task(name) {
                    return Err(WorkflowError::UnknownTask(name.clone()));
                }
                if options.loops.contains_key(name) {
                    return Err(WorkflowError::InvalidConfiguration(format!(
                        "task '{name}' cannot be both a loop and a parallel group member"
                    )));
                }
                if let Some(previous) = grouped.insert(name.as_str(), index) {
                    if previous != index {
                        return Err(WorkflowError::InvalidConfiguration(format!(
                            "task '{name}' belongs to more than one parallel group"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_plan(
        &self,
        plan: &TaskPlan,
        ctx: &WorkflowContext,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, WorkflowError> {
        let execution_id = ctx.execution_id().to_string();

        let mut ids: HashMap<String, TaskId> = HashMap::with_capacity(plan.tasks.len());
        for task in &plan.tasks {
            let id = self.store.create_task(Self::new_record(&execution_id, task)).await?;
            ids.insert(task.name.clone(), id);
        }
        for task in &plan.tasks {
            let deps: Vec<TaskId> = plan
                .dependencies_of(&task.name)
                .iter()
                .filter_map(|d| ids.get(d).copied())
                .collect();
            if !deps.is_empty() {
                self.store.set_dependencies(ids[&task.name], deps).await?;
            }
        }

        let graph = TaskGraph::from_plan(plan, &ids)?;
        let levels = graph.get_execution_levels()?;
        let group_of: HashMap<&str, usize> = options
            .parallel_groups
            .iter()
            .enumerate()
            .flat_map(|(i, g)| g.task_names.iter().map(move |n| (n.as_str(), i)))
            .collect();

        let mut outcomes: HashMap<String, TaskOutcome> = HashMap::with_capacity(plan.tasks.len());
        let mut stopped_early = false;
        let mut cancelled = false;

        for (level_index, level) in levels.iter().enumerate() {
            if ctx.is_cancelled() {
                cancelled = true;
                self.cancel_levels(&levels[level_index..], &graph, "execution cancelled", &mut outcomes)
                    .await?;
                break;
            }

            let level_outcomes = self
                .run_level(level, &graph, ctx, options, &group_of)
                .await?;
            let failed = level_outcomes.iter().filter(|o| o.is_failure()).count();
            for outcome in level_outcomes {
                outcomes.insert(outcome.task_name.clone(), outcome);
            }
            self.executions.advance(&execution_id, outcomes.len()).await;

            if ctx.is_cancelled() {
                cancelled = true;
                self.cancel_levels(&levels[level_index + 1..], &graph, "execution cancelled", &mut outcomes)
                    .await?;
                break;
            }
            if failed > 0 && !self.failure_policy.should_continue(failed, level.len()) {
                tracing::warn!(
                    execution_id = %execution_id,
                    level = level_index,
                    failed,
                    total = level.len(),
                    "Too many failures in level, stopping execution"
                );
                stopped_early = true;
                let reason = format!("not started: execution stopped after level {level_index}");
                self.cancel_levels(&levels[level_index + 1..], &graph, &reason, &mut outcomes)
                    .await?;
                break;
            }
        }

        Ok(Self::build_result(plan, levels.len(), outcomes, stopped_early, cancelled))
    }

    fn new_record(execution_id: &str, task: &TaskDefinition) -> NewTask {
        let mut metadata = task.metadata.clone();
        metadata.insert("name".to_string(), json!(task.name));
        if !task.conditions.is_empty() {
            metadata.insert(
                "conditions".to_string(),
                serde_json::to_value(&task.conditions).unwrap_or(Value::Null),
            );
        }
        if let Some(tool) = &task.tool {
            metadata.insert("tool_name".to_string(), json!(tool.name));
            metadata.insert("tool_params".to_string(), tool.params.clone());
        }
        NewTask {
            execution_id: execution_id.to_string(),
            kind: task.kind,
            description: task.description.clone(),
            priority: task.priority,
            metadata,
        }
    }

    /// 把尚未开始的层级标记为 Cancelled
    async fn cancel_levels(
        &self,
        levels: &[Vec<TaskId>],
        graph: &TaskGraph,
        reason: &str,
        outcomes: &mut HashMap<String, TaskOutcome>,
    ) -> Result<(), WorkflowError> {
        for id in levels.iter().flatten() {
            let Some(task) = graph.node(*id) else { continue };
            self.store
                .update_status(*id, TaskStatus::Cancelled, None, Some(reason.to_string()))
                .await?;
            outcomes.insert(task.name.clone(), Self::outcome(*id, task, TaskStatus::Cancelled, reason, None, None, 0));
        }
        Ok(())
    }

    /// 并发执行一个层级；并行组成员作为一批交给并行执行器
    async fn run_level(
        &self,
        level: &[TaskId],
        graph: &TaskGraph,
        ctx: &WorkflowContext,
        options: &ExecutionOptions,
        group_of: &HashMap<&str, usize>,
    ) -> Result<Vec<TaskOutcome>, WorkflowError> {
        let limiter = Semaphore::new(self.max_concurrency);
        let mut batches: Vec<BoxFuture<'_, Result<Vec<TaskOutcome>, WorkflowError>>> = Vec::new();
        let mut group_members: HashMap<usize, Vec<(TaskId, &TaskDefinition)>> = HashMap::new();

        for &id in level {
            let task = graph.node(id).ok_or(WorkflowError::NodeNotFound(id))?;
            if let Some(&group_index) = group_of.get(task.name.as_str()) {
                group_members.entry(group_index).or_default().push((id, task));
                continue;
            }
            let loop_config = options.loops.get(&task.name);
            batches.push(
                self.run_node(id, task, ctx, loop_config, &limiter)
                    .map(|r| r.map(|o| vec![o]))
                    .boxed(),
            );
        }

        let mut groups: Vec<_> = group_members.into_iter().collect();
        groups.sort_by_key(|(i, _)| *i);
        for (group_index, members) in groups {
            let group = &options.parallel_groups[group_index];
            batches.push(self.run_group(group_index, group, members, ctx).boxed());
        }

        let mut outcomes = Vec::with_capacity(level.len());
        for batch in join_all(batches).await {
            outcomes.extend(batch?);
        }
        Ok(outcomes)
    }

    /// 条件检查；返回 Some 表示该任务不运行（已取消或跳过）
    async fn precheck(
        &self,
        id: TaskId,
        task: &TaskDefinition,
        ctx: &WorkflowContext,
    ) -> Result<Option<TaskOutcome>, WorkflowError> {
        if ctx.is_cancelled() {
            let reason = "execution cancelled";
            self.store
                .update_status(id, TaskStatus::Cancelled, None, Some(reason.to_string()))
                .await?;
            return Ok(Some(Self::outcome(id, task, TaskStatus::Cancelled, reason, None, None, 0)));
        }
        if !ctx.conditions_met(&task.conditions).await {
            tracing::debug!(task = %task.name, "Conditions not met, skipping task");
            self.store
                .update_status(id, TaskStatus::Skipped, None, None)
                .await?;
            return Ok(Some(Self::outcome(
                id,
                task,
                TaskStatus::Skipped,
                "conditions not met, skipped",
                None,
                None,
                0,
            )));
        }
        Ok(None)
    }

    async fn run_node(
        &self,
        id: TaskId,
        task: &TaskDefinition,
        ctx: &WorkflowContext,
        loop_config: Option<&LoopConfig>,
        limiter: &Semaphore,
    ) -> Result<TaskOutcome, WorkflowError> {
        if let Some(outcome) = self.precheck(id, task, ctx).await? {
            return Ok(outcome);
        }

        let _permit = limiter
            .acquire()
            .await
            .map_err(|_| WorkflowError::InvalidConfiguration("concurrency limiter closed".to_string()))?;

        self.store
            .update_status(id, TaskStatus::Running, None, None)
            .await?;
        let start = Instant::now();
        let result = match loop_config {
            None => run_guarded(self.runner.as_ref(), task, ctx).await,
            Some(config) => self.run_loop_node(id, task, config, ctx).await,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                ctx.set_task_result(task.name.clone(), output.data.clone()).await;
                self.store
                    .update_status(id, TaskStatus::Completed, Some(output.data.clone()), None)
                    .await?;
                Ok(Self::outcome(
                    id,
                    task,
                    TaskStatus::Completed,
                    &output.message,
                    Some(output.data),
                    None,
                    elapsed_ms,
                ))
            }
            Err(e) => {
                tracing::warn!(task = %task.name, error = %e, "Task failed");
                self.store
                    .update_status(id, TaskStatus::Failed, None, Some(e.to_string()))
                    .await?;
                let mut outcome = Self::outcome(
                    id,
                    task,
                    TaskStatus::Failed,
                    &format!("task '{}' failed", task.name),
                    None,
                    Some(e.to_string()),
                    elapsed_ms,
                );
                outcome.error_kind = Some(e.kind());
                Ok(outcome)
            }
        }
    }

    /// 以循环方式执行任务，循环体为任务自身
    async fn run_loop_node(
        &self,
        id: TaskId,
        task: &TaskDefinition,
        config: &LoopConfig,
        ctx: &WorkflowContext,
    ) -> Result<TaskOutput, OrchestratorError> {
        let mut body = task.clone();
        body.conditions.clear();
        let loop_id = format!("{}:{}", ctx.execution_id(), task.name);

        let report = self
            .loops
            .execute_loop_config(std::slice::from_ref(&body), config, &loop_id, ctx, self.runner.as_ref())
            .await
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;

        if let Some(retry) = &report.retry {
            if let Err(e) = self
                .store
                .record_retries(id, retry.attempts.saturating_sub(1))
                .await
            {
                tracing::warn!(task = %task.name, error = %e, "Failed to record retry count");
            }
        }

        let data = serde_json::to_value(&report).unwrap_or(Value::Null);
        if report.success {
            return Ok(TaskOutput::new(report.summary(), data));
        }
        match report.retry.as_ref().and_then(|r| r.last_error.clone()) {
            Some(err) => Err(err),
            None => Err(OrchestratorError::Unknown(format!(
                "loop '{}' failed: {}",
                task.name,
                report.summary()
            ))),
        }
    }

    async fn run_group(
        &self,
        group_index: usize,
        group: &ParallelGroup,
        members: Vec<(TaskId, &TaskDefinition)>,
        ctx: &WorkflowContext,
    ) -> Result<Vec<TaskOutcome>, WorkflowError> {
        let mut outcomes = Vec::with_capacity(members.len());
        let mut runnable: Vec<(TaskId, &TaskDefinition)> = Vec::new();
        for (id, task) in members {
            match self.precheck(id, task, ctx).await? {
                Some(outcome) => outcomes.push(outcome),
                None => {
                    self.store
                        .update_status(id, TaskStatus::Running, None, None)
                        .await?;
                    runnable.push((id, task));
                }
            }
        }
        if runnable.is_empty() {
            return Ok(outcomes);
        }

        let defs: Vec<TaskDefinition> = runnable.iter().map(|(_, t)| (*t).clone()).collect();
        let group_id = format!("{}_group_{group_index}", ctx.execution_id());
        let mut group = group.clone();
        if group.timeout_secs.is_none() {
            group.timeout_secs = self.default_group_timeout.map(|t| t.as_secs_f64());
        }
        let results = self
            .parallel
            .execute_group(&group, &defs, &group_id, ctx, self.runner.as_ref())
            .await;

        if let [only] = results.as_slice() {
            if only.is_group_failure() {
                let error = only.error.clone().unwrap_or_else(|| "parallel group failed".to_string());
                for (id, task) in runnable {
                    self.store
                        .update_status(id, TaskStatus::Failed, None, Some(error.clone()))
                        .await?;
                    let mut outcome = Self::outcome(
                        id,
                        task,
                        TaskStatus::Failed,
                        "parallel group timed out",
                        None,
                        Some(error.clone()),
                        only.elapsed_ms,
                    );
                    outcome.error_kind = only.failure.as_ref().map(OrchestratorError::kind);
                    outcomes.push(outcome);
                }
                return Ok(outcomes);
            }
        }

        for result in results {
            let Some((id, task)) = result.task_index.and_then(|i| runnable.get(i)).copied() else {
                continue;
            };
            self.store
                .update_status(id, result.status, result.data.clone(), result.error.clone())
                .await?;
            let mut outcome = Self::outcome(
                id,
                task,
                result.status,
                &result.message,
                result.data,
                result.error,
                result.elapsed_ms,
            );
            outcome.error_kind = result.failure.as_ref().map(OrchestratorError::kind);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn outcome(
        id: TaskId,
        task: &TaskDefinition,
        status: TaskStatus,
        message: &str,
        data: Option<Value>,
        error: Option<String>,
        elapsed_ms: u64,
    ) -> TaskOutcome {
        TaskOutcome {
            task_id: id,
            task_name: task.name.clone(),
            status,
            message: message.to_string(),
            data,
            error,
            error_kind: None,
            elapsed_ms,
        }
    }

    fn build_result(
        plan: &TaskPlan,
        level_count: usize,
        outcomes: HashMap<String, TaskOutcome>,
        stopped_early: bool,
        cancelled: bool,
    ) -> ExecutionResult {
        let count = |status: TaskStatus| outcomes.values().filter(|o| o.status == status).count();
        let completed = count(TaskStatus::Completed);
        let failed = count(TaskStatus::Failed);
        let skipped = count(TaskStatus::Skipped);
        let cancelled_tasks = count(TaskStatus::Cancelled);

        let mut message = format!("completed: {completed}, failed: {failed}");
        if skipped > 0 {
            message.push_str(&format!(", skipped: {skipped}"));
        }
        if cancelled_tasks > 0 {
            message.push_str(&format!(", cancelled: {cancelled_tasks}"));
        }
        if cancelled {
            message = format!("execution cancelled ({message})");
        } else if stopped_early {
            message = format!("execution stopped early ({message})");
        }

        let execution_times: serde_json::Map<String, Value> = outcomes
            .values()
            .filter(|o| matches!(o.status, TaskStatus::Completed | TaskStatus::Failed))
            .map(|o| (o.task_name.clone(), json!(o.elapsed_ms as f64 / 1000.0)))
            .collect();

        let mut metadata = HashMap::new();
        metadata.insert("plan_name".to_string(), json!(plan.name));
        metadata.insert("total_tasks".to_string(), json!(plan.tasks.len()));
        metadata.insert("completed_tasks".to_string(), json!(completed));
        metadata.insert("failed_tasks".to_string(), json!(failed));
        metadata.insert("skipped_tasks".to_string(), json!(skipped));
        metadata.insert("cancelled_tasks".to_string(), json!(cancelled_tasks));
        metadata.insert("execution_levels".to_string(), json!(level_count));
        metadata.insert("stopped_early".to_string(), json!(stopped_early));
        metadata.insert("cancelled".to_string(), json!(cancelled));
        metadata.insert("execution_times".to_string(), Value::Object(execution_times));

        ExecutionResult {
            success: failed == 0 && !stopped_early && !cancelled,
            message,
            task_results: outcomes,
            execution_time: 0.0,
            metadata,
            created_at: chrono::Utc::now(),
        }
    }

    /// 取消执行：尚未开始的任务标记为 Cancelled，正在运行的任务不会被强行中断
    pub async fn cancel_execution(&self, execution_id: &str) -> bool {
        self.executions.cancel(execution_id).await
    }

    pub async fn get_execution_status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        let progress = self.executions.status(execution_id).await?;
        let ctx = self.contexts.read().await.get(execution_id).cloned()?;
        Some(ExecutionStatus {
            execution_id: execution_id.to_string(),
            progress,
            context: ctx.snapshot().await,
        })
    }

    pub async fn active_executions(&self) -> Vec<ActiveStatus> {
        self.executions.list().await
    }

    pub async fn get_task_records(&self, execution_id: &str) -> Result<Vec<TaskRecord>, WorkflowError> {
        self.store.get_by_execution(execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, FnTool, ToolExecutor, ToolRegistry};
    use crate::workflow::builder::PlanBuilder;
    use async_trait::async_trait;

    fn tools() -> Arc<dyn ToolInvoker> {
        let registry = ToolRegistry::new()
            .with_tool(EchoTool)
            .with_tool(FnTool::new("fail", "always fails", |_| Err("broken".to_string())));
        Arc::new(ToolExecutor::new(registry, 5))
    }

    fn engine_with(store: Arc<InMemoryTaskStore>) -> WorkflowEngine {
        WorkflowEngine::builder().store(store).tools(tools()).build()
    }

    fn echo(name: &str) -> TaskDefinition {
        TaskDefinition::tool_call(name, "echo", json!({"text": name}))
    }

    fn failing(name: &str) -> TaskDefinition {
        TaskDefinition::tool_call(name, "fail", json!({}))
    }

    #[tokio::test]
    async fn test_diamond_with_failed_branch_still_runs_join() {
        let store = Arc::new(InMemoryTaskStore::new());
        let engine = engine_with(store.clone());
        let plan = PlanBuilder::new("diamond")
            .task(echo("A"))
            .task(failing("B"))
            .task(echo("C"))
            .task(echo("D"))
            .sequential("A", "B")
            .sequential("A", "C")
            .depends_on_all("D", ["B", "C"])
            .build()
            .unwrap();

        let result = engine.execute_plan(&plan, "exec_diamond").await.unwrap();

        assert!(!result.success);
        assert_eq!(result.outcome("A").unwrap().status, TaskStatus::Completed);
        assert_eq!(result.outcome("B").unwrap().status, TaskStatus::Failed);
        assert_eq!(result.outcome("C").unwrap().status, TaskStatus::Completed);
        assert_eq!(result.outcome("D").unwrap().status, TaskStatus::Completed);
        assert_eq!(result.message, "completed: 3, failed: 1");
        assert_eq!(result.metadata["failed_tasks"], json!(1));

        let records = store.get_by_execution("exec_diamond").await.unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.status.is_terminal()));
        let d = records.iter().find(|r| r.metadata["name"] == "D").unwrap();
        assert_eq!(d.dependencies.len(), 2);
        assert!(engine.get_execution_status("exec_diamond").await.is_none());
    }

    fn wide_plan(failures: usize) -> TaskPlan {
        let mut builder = PlanBuilder::new("wide");
        for i in 0..5 {
            let name = format!("t{i}");
            builder = builder.task(if i < failures { failing(&name) } else { echo(&name) });
        }
        builder
            .task(echo("after"))
            .depends_on_all("after", (0..5).map(|i| format!("t{i}")))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_two_of_five_failures_continue() {
        let engine = engine_with(Arc::new(InMemoryTaskStore::new()));
        let result = engine.execute_plan(&wide_plan(2), "exec_2of5").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.outcome("after").unwrap().status, TaskStatus::Completed);
        assert_eq!(result.metadata["stopped_early"], json!(false));
    }

    #[tokio::test]
    async fn test_three_of_five_failures_stop() {
        let store = Arc::new(InMemoryTaskStore::new());
        let engine = engine_with(store.clone());
        let result = engine.execute_plan(&wide_plan(3), "exec_3of5").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.outcome("after").unwrap().status, TaskStatus::Cancelled);
        assert_eq!(result.metadata["stopped_early"], json!(true));
        assert!(result.message.starts_with("execution stopped early"));
    }

    #[test]
    fn test_ratio_policy_boundaries() {
        let policy = RatioFailurePolicy::default();
        assert!(policy.should_continue(0, 5));
        assert!(policy.should_continue(2, 5));
        assert!(!policy.should_continue(3, 5));
        assert!(policy.should_continue(1, 2));
        assert!(!policy.should_continue(1, 1));
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_task_runs() {
        let store = Arc::new(InMemoryTaskStore::new());
        let engine = engine_with(store.clone());
        let mut plan = TaskPlan::new("cyclic", "");
        plan.tasks = vec![echo("A"), echo("B")];
        plan.dependencies.insert("A".into(), vec!["B".into()]);
        plan.dependencies.insert("B".into(), vec!["A".into()]);

        let err = engine.execute_plan(&plan, "exec_cycle").await.unwrap_err();
        assert_eq!(err, WorkflowError::CyclicDependency);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_conditions_skip_tasks() {
        let engine = engine_with(Arc::new(InMemoryTaskStore::new()));
        let plan = PlanBuilder::new("conditional")
            .task(echo("fetch"))
            .task(echo("on_ok").with_condition(Condition::new(
                "results.fetch",
                ConditionOperator::Eq,
                "fetch",
            )))
            .task(echo("on_prod").with_condition(Condition::new("env", ConditionOperator::Eq, "prod")))
            .sequential("fetch", "on_ok")
            .sequential("fetch", "on_prod")
            .build()
            .unwrap();

        let options = ExecutionOptions::default().with_variable("env", json!("dev"));
        let result = engine
            .execute_with_options(&plan, "exec_cond", options)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.outcome("on_ok").unwrap().status, TaskStatus::Completed);
        assert_eq!(result.outcome("on_prod").unwrap().status, TaskStatus::Skipped);
        assert!(result.message.contains("skipped: 1"));
    }

    #[tokio::test]
    async fn test_execute_with_loops() {
        let engine = engine_with(Arc::new(InMemoryTaskStore::new()));
        let plan = PlanBuilder::new("loop")
            .task(TaskDefinition::tool_call("each", "echo", json!({"text": "{{current_item}}"})))
            .build()
            .unwrap();
        let loops: HashMap<String, LoopConfig> = [(
            "each".to_string(),
            LoopConfig::for_each(vec![json!("x"), json!("y")]),
        )]
        .into();

        let result = engine.execute_with_loops(&plan, "exec_loop", loops).await.unwrap();
        assert!(result.success);
        let data = result.outcome("each").unwrap().data.clone().unwrap();
        assert_eq!(data["iterations"].as_array().unwrap().len(), 2);
        assert_eq!(data["loop_type"], "for");

        let bad: HashMap<String, LoopConfig> =
            [("ghost".to_string(), LoopConfig::for_each(vec![]))].into();
        assert!(matches!(
            engine.execute_with_loops(&plan, "exec_loop2", bad).await,
            Err(WorkflowError::UnknownTask(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retry_loop_reports_last_error() {
        let store = Arc::new(InMemoryTaskStore::new());
        let engine = engine_with(store.clone());
        let plan = PlanBuilder::new("retrying").task(failing("flaky")).build().unwrap();
        let loops: HashMap<String, LoopConfig> = [(
            "flaky".to_string(),
            LoopConfig::retry(2, Duration::from_millis(100), 2.0),
        )]
        .into();

        let result = engine.execute_with_loops(&plan, "exec_retry", loops).await.unwrap();
        let outcome = result.outcome("flaky").unwrap();
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("broken"));
        assert_eq!(outcome.error_kind, Some(crate::core::ErrorKind::Tool));

        let records = store.get_by_execution("exec_retry").await.unwrap();
        assert_eq!(records[0].retry_count, 2);
    }

    struct SleepyRunner;

    #[async_trait]
    impl TaskRunner for SleepyRunner {
        async fn run(&self, task: &TaskDefinition, _ctx: &WorkflowContext) -> Result<TaskOutput, OrchestratorError> {
            let secs = task.metadata.get("sleep").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_secs(secs)).await;
            Ok(TaskOutput::new("slept", json!(secs)))
        }
    }

    fn sleepy(name: &str, secs: u64) -> TaskDefinition {
        TaskDefinition::new(name, TaskKind::Execute).with_metadata("sleep", json!(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_group_timeout_fails_members() {
        let engine = WorkflowEngine::builder().runner(Arc::new(SleepyRunner)).build();
        let plan = PlanBuilder::new("grouped")
            .task(sleepy("quick", 1))
            .task(sleepy("stuck", 100))
            .task(sleepy("solo", 1))
            .build()
            .unwrap();
        let group = ParallelGroup::new(vec!["quick".into(), "stuck".into()])
            .with_timeout(Duration::from_secs(5));

        let result = engine
            .execute_with_parallel(&plan, "exec_group", vec![group])
            .await
            .unwrap();
        assert_eq!(result.outcome("solo").unwrap().status, TaskStatus::Completed);
        let stuck = result.outcome("stuck").unwrap();
        assert_eq!(stuck.status, TaskStatus::Failed);
        assert!(stuck.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(result.outcome("quick").unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_runs_concurrently() {
        let engine = WorkflowEngine::builder().runner(Arc::new(SleepyRunner)).build();
        let plan = PlanBuilder::new("concurrent")
            .task(sleepy("a", 2))
            .task(sleepy("b", 2))
            .task(sleepy("c", 2))
            .task(sleepy("d", 1))
            .depends_on_all("d", ["a", "b", "c"])
            .build()
            .unwrap();
        let start = Instant::now();
        let result = engine.execute_plan(&plan, "exec_conc").await.unwrap();
        assert!(result.success);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_is_per_level() {
        let engine = Arc::new(
            WorkflowEngine::builder()
                .runner(Arc::new(SleepyRunner))
                .max_concurrency(1)
                .build(),
        );
        let plan = PlanBuilder::new("single").task(sleepy("only", 2)).build().unwrap();

        let start = Instant::now();
        let (left, right) = tokio::join!(
            engine.execute_plan(&plan, "exec_left"),
            engine.execute_plan(&plan, "exec_right")
        );
        assert!(left.unwrap().success);
        assert!(right.unwrap().success);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_respects_concurrency_cap() {
        let engine = WorkflowEngine::builder()
            .runner(Arc::new(SleepyRunner))
            .max_concurrency(2)
            .build();
        let plan = PlanBuilder::new("capped")
            .task(sleepy("a", 2))
            .task(sleepy("b", 2))
            .task(sleepy("c", 2))
            .build()
            .unwrap();
        let start = Instant::now();
        assert!(engine.execute_plan(&plan, "exec_capped").await.unwrap().success);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_execution_between_levels() {
        let engine = Arc::new(WorkflowEngine::builder().runner(Arc::new(SleepyRunner)).build());
        let plan = PlanBuilder::new("long")
            .task(sleepy("first", 5))
            .task(sleepy("second", 5))
            .sequential("first", "second")
            .build()
            .unwrap();

        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute_plan(&plan, "exec_cancel").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = engine.get_execution_status("exec_cancel").await.unwrap();
        assert_eq!(status.context.metadata["plan_name"], json!("long"));
        assert!(engine.cancel_execution("exec_cancel").await);

        let result = handle.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.outcome("first").unwrap().status, TaskStatus::Completed);
        assert_eq!(result.outcome("second").unwrap().status, TaskStatus::Cancelled);
        assert_eq!(result.metadata["cancelled"], json!(true));
    }

    #[tokio::test]
    async fn test_duplicate_execution_id_rejected_while_running() {
        let engine = Arc::new(WorkflowEngine::builder().runner(Arc::new(SleepyRunner)).build());
        let plan = PlanBuilder::new("p").task(sleepy("a", 0)).build().unwrap();
        engine.executions.register("busy", "execution", 1, None).await;
        assert!(matches!(
            engine.execute_plan(&plan, "busy").await,
            Err(WorkflowError::AlreadyRunning(_))
        ));
    }
}
