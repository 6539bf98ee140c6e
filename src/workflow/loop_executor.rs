//! 循环执行器
//!
//! - For：对每个元素依次执行循环体，变量 `current_item` / `current_index` / `total_items`
//! - While：每轮之前对条件求值，`max_iterations` 为硬上限；变量 `current_iteration` / `max_iterations`
//! - Retry：最多 `max_retries + 1` 次尝试，第 k 次重试前等待 `retry_delay × backoff_factor^(k-1)`
//!
//! 每个循环在登记表中有一项，可按 loop_id 查询进度或取消（在迭代之间生效）。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::core::OrchestratorError;
use crate::workflow::context::WorkflowContext;
use crate::workflow::registry::{ActiveRegistry, ActiveStatus};
use crate::workflow::runner::{run_guarded, TaskOutput, TaskRunner};
use crate::workflow::types::*;

/// 循环体中单个任务的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub task_name: String,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 单轮迭代结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    /// 本轮所有任务都成功
    pub success: bool,
    pub results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_met: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

/// 重试结果
#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome {
    pub success: bool,
    pub attempts: u32,
    /// 总耗时（秒，含等待）
    pub total_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cancelled: bool,
    #[serde(skip)]
    pub last_error: Option<OrchestratorError>,
}

/// 循环结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExit {
    /// For 循环元素耗尽 / Retry 结束
    Completed,
    /// While 条件不再满足
    ConditionFalse,
    /// While 达到最大迭代次数
    MaxIterations,
    Cancelled,
}

/// 循环执行报告
#[derive(Debug, Clone, Serialize)]
pub struct LoopReport {
    pub loop_id: String,
    pub loop_type: String,
    pub iterations: Vec<IterationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOutcome>,
    pub exit: LoopExit,
    pub success: bool,
}

impl LoopReport {
    pub fn summary(&self) -> String {
        match &self.retry {
            Some(retry) => format!(
                "{} loop {}: {} attempt(s), success={}",
                self.loop_type, self.loop_id, retry.attempts, retry.success
            ),
            None => {
                let ok = self.iterations.iter().filter(|i| i.success).count();
                format!(
                    "{} loop {}: {}/{} iteration(s) succeeded, exit={:?}",
                    self.loop_type,
                    self.loop_id,
                    ok,
                    self.iterations.len(),
                    self.exit
                )
            }
        }
    }
}

/// 循环执行器
#[derive(Debug, Default)]
pub struct LoopExecutor {
    active: ActiveRegistry,
}

impl LoopExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次执行循环体中的任务；成功的结果写入上下文
    async fn run_iteration(
        tasks: &[TaskDefinition],
        ctx: &WorkflowContext,
        runner: &dyn TaskRunner,
    ) -> (bool, Vec<StepResult>, Option<String>) {
        let mut results = Vec::with_capacity(tasks.len());
        let mut first_error = None;
        for task in tasks {
            match run_guarded(runner, task, ctx).await {
                Ok(output) => {
                    ctx.set_task_result(task.name.clone(), output.data.clone()).await;
                    results.push(StepResult {
                        task_name: task.name.clone(),
                        success: true,
                        message: output.message,
                        data: Some(output.data),
                        error: None,
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    first_error.get_or_insert_with(|| msg.clone());
                    results.push(StepResult {
                        task_name: task.name.clone(),
                        success: false,
                        message: format!("task '{}' failed", task.name),
                        data: None,
                        error: Some(msg),
                    });
                }
            }
        }
        (first_error.is_none(), results, first_error)
    }

    /// For 循环：N 个元素恰好执行 N 轮（除非被取消）
    pub async fn execute_for_loop(
        &self,
        tasks: &[TaskDefinition],
        items: &[Value],
        loop_id: &str,
        ctx: &WorkflowContext,
        runner: &dyn TaskRunner,
    ) -> LoopReport {
        let token = self
            .active
            .register(loop_id, "for", items.len(), Some(ctx.cancel_token()))
            .await;
        tracing::info!(loop_id = %loop_id, items = items.len(), "For loop started");

        let mut iterations = Vec::with_capacity(items.len());
        let mut exit = LoopExit::Completed;
        for (index, item) in items.iter().enumerate() {
            if token.is_cancelled() {
                exit = LoopExit::Cancelled;
                break;
            }
            ctx.set_variable("current_item", item.clone()).await;
            ctx.set_variable("current_index", json!(index)).await;
            ctx.set_variable("total_items", json!(items.len())).await;

            let (success, results, error) = Self::run_iteration(tasks, ctx, runner).await;
            iterations.push(IterationResult {
                index,
                item: Some(item.clone()),
                success,
                results,
                error,
                condition_met: None,
                timestamp: Utc::now(),
            });
            self.active.advance(loop_id, index + 1).await;
        }

        self.active.remove(loop_id).await;
        let success = exit != LoopExit::Cancelled && iterations.iter().all(|i| i.success);
        tracing::info!(loop_id = %loop_id, iterations = iterations.len(), success, "For loop finished");
        LoopReport {
            loop_id: loop_id.to_string(),
            loop_type: "for".to_string(),
            iterations,
            retry: None,
            exit,
            success,
        }
    }

    /// While 循环：条件为假或达到 max_iterations 时停止
    pub async fn execute_while_loop(
        &self,
        tasks: &[TaskDefinition],
        condition: &Condition,
        max_iterations: u32,
        loop_id: &str,
        ctx: &WorkflowContext,
        runner: &dyn TaskRunner,
    ) -> LoopReport {
        let token = self
            .active
            .register(loop_id, "while", max_iterations as usize, Some(ctx.cancel_token()))
            .await;
        tracing::info!(loop_id = %loop_id, max_iterations, "While loop started");

        let mut iterations = Vec::new();
        let mut exit = LoopExit::MaxIterations;
        for index in 0..max_iterations as usize {
            if token.is_cancelled() {
                exit = LoopExit::Cancelled;
                break;
            }
            let view = ctx.condition_view().await;
            if !condition.evaluate(&view) {
                exit = LoopExit::ConditionFalse;
                break;
            }
            ctx.set_variable("current_iteration", json!(index)).await;
            ctx.set_variable("max_iterations", json!(max_iterations)).await;

            let (success, results, error) = Self::run_iteration(tasks, ctx, runner).await;
            iterations.push(IterationResult {
                index,
                item: None,
                success,
                results,
                error,
                condition_met: Some(true),
                timestamp: Utc::now(),
            });
            self.active.advance(loop_id, index + 1).await;
        }

        if exit == LoopExit::MaxIterations {
            tracing::warn!(loop_id = %loop_id, max_iterations, "While loop hit iteration limit");
        }
        self.active.remove(loop_id).await;
        let success = exit != LoopExit::Cancelled && iterations.iter().all(|i| i.success);
        LoopReport {
            loop_id: loop_id.to_string(),
            loop_type: "while".to_string(),
            iterations,
            retry: None,
            exit,
            success,
        }
    }

    /// 重试执行：首次成功即返回
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_with_retry(
        &self,
        task: &TaskDefinition,
        max_retries: u32,
        retry_delay: Duration,
        backoff_factor: f64,
        loop_id: &str,
        ctx: &WorkflowContext,
        runner: &dyn TaskRunner,
    ) -> RetryOutcome {
        let total_attempts = max_retries.saturating_add(1);
        let token = self
            .active
            .register(loop_id, "retry", total_attempts as usize, Some(ctx.cancel_token()))
            .await;
        let start = Instant::now();
        let mut attempts = 0;
        let mut last_error: Option<OrchestratorError> = None;
        let mut cancelled = false;

        for attempt in 1..=total_attempts {
            if attempt > 1 {
                let delay = backoff_delay(retry_delay, backoff_factor, attempt - 2);
                tracing::info!(
                    loop_id = %loop_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying task after backoff"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if token.is_cancelled() {
                cancelled = true;
                break;
            }

            attempts = attempt;
            ctx.set_variable("retry_attempt", json!(attempt)).await;
            match run_guarded(runner, task, ctx).await {
                Ok(output) => {
                    ctx.set_task_result(task.name.clone(), output.data.clone()).await;
                    self.active.remove(loop_id).await;
                    return RetryOutcome {
                        success: true,
                        attempts,
                        total_time: start.elapsed().as_secs_f64(),
                        output: Some(output),
                        error: None,
                        cancelled: false,
                        last_error: None,
                    };
                }
                Err(e) => {
                    tracing::warn!(loop_id = %loop_id, attempt, error = %e, "Attempt failed");
                    last_error = Some(e);
                    self.active.advance(loop_id, attempt as usize).await;
                }
            }
        }

        self.active.remove(loop_id).await;
        RetryOutcome {
            success: false,
            attempts,
            total_time: start.elapsed().as_secs_f64(),
            output: None,
            error: last_error.as_ref().map(|e| e.to_string()),
            cancelled,
            last_error,
        }
    }

    /// 按循环配置执行；配置非法时返回错误
    pub async fn execute_loop_config(
        &self,
        tasks: &[TaskDefinition],
        config: &LoopConfig,
        loop_id: &str,
        ctx: &WorkflowContext,
        runner: &dyn TaskRunner,
    ) -> Result<LoopReport, WorkflowError> {
        config.validate()?;
        if tasks.is_empty() {
            return Err(WorkflowError::InvalidConfiguration(format!(
                "loop '{loop_id}' has no tasks"
            )));
        }

        let report = match config {
            LoopConfig::For { items } => self.execute_for_loop(tasks, items, loop_id, ctx, runner).await,
            LoopConfig::While {
                condition,
                max_iterations,
            } => {
                self.execute_while_loop(tasks, condition, *max_iterations, loop_id, ctx, runner)
                    .await
            }
            LoopConfig::Retry {
                max_retries,
                retry_delay_ms,
                backoff_factor,
            } => {
                let [task] = tasks else {
                    return Err(WorkflowError::InvalidConfiguration(
                        "retry loop requires exactly one task".to_string(),
                    ));
                };
                let outcome = self
                    .execute_with_retry(
                        task,
                        *max_retries,
                        Duration::from_millis(*retry_delay_ms),
                        *backoff_factor,
                        loop_id,
                        ctx,
                        runner,
                    )
                    .await;
                LoopReport {
                    loop_id: loop_id.to_string(),
                    loop_type: "retry".to_string(),
                    iterations: Vec::new(),
                    success: outcome.success,
                    exit: if outcome.cancelled {
                        LoopExit::Cancelled
                    } else {
                        LoopExit::Completed
                    },
                    retry: Some(outcome),
                }
            }
        };
        Ok(report)
    }

    /// 取消循环（当前迭代结束后生效）
    pub async fn cancel_loop(&self, loop_id: &str) -> bool {
        self.active.cancel(loop_id).await
    }

    pub async fn get_loop_status(&self, loop_id: &str) -> Option<ActiveStatus> {
        self.active.status(loop_id).await
    }

    pub async fn active_loops(&self) -> Vec<ActiveStatus> {
        self.active.list().await
    }
}

/// 第 retry_index 次重试（从 0 计）前的等待时间
fn backoff_delay(base: Duration, factor: f64, retry_index: u32) -> Duration {
    let secs = base.as_secs_f64() * factor.powi(retry_index as i32);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
