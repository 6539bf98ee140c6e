//! 并行执行器
//!
//! 并发执行一组任务：单个任务失败（包括 panic）不影响同组其他任务；
//! 设置超时后，整组在超时前未全部完成即视为一次组级失败，未完成的任务被放弃。
//! 另外提供依赖图上的并行度分析。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::OrchestratorError;
use crate::workflow::context::WorkflowContext;
use crate::workflow::graph::TaskGraph;
use crate::workflow::registry::{ActiveRegistry, ActiveStatus};
use crate::workflow::runner::{run_guarded, TaskRunner};
use crate::workflow::types::*;

/// 组内单个任务的结果；`task_index` 为 None 表示组级结果（如整组超时）
#[derive(Debug, Clone, Serialize)]
pub struct ParallelTaskResult {
    pub task_index: Option<usize>,
    pub task_name: String,
    pub status: TaskStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub failure: Option<OrchestratorError>,
}

impl ParallelTaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_group_failure(&self) -> bool {
        self.task_index.is_none()
    }

    fn cancelled(index: usize, task: &TaskDefinition, reason: &str) -> Self {
        Self {
            task_index: Some(index),
            task_name: task.name.clone(),
            status: TaskStatus::Cancelled,
            message: reason.to_string(),
            data: None,
            error: None,
            elapsed_ms: 0,
            timestamp: Utc::now(),
            failure: None,
        }
    }

    fn group_timeout(group_id: &str, limit: Duration) -> Self {
        let err = OrchestratorError::Timeout(format!(
            "parallel group '{group_id}' timed out after {:.1}s",
            limit.as_secs_f64()
        ));
        Self {
            task_index: None,
            task_name: group_id.to_string(),
            status: TaskStatus::Failed,
            message: "parallel group timed out".to_string(),
            data: None,
            error: Some(err.to_string()),
            elapsed_ms: limit.as_millis() as u64,
            timestamp: Utc::now(),
            failure: Some(err),
        }
    }
}

/// 多个并行组依次执行时，每组的结果
#[derive(Debug, Clone, Serialize)]
pub struct GroupResult {
    pub group_index: usize,
    pub task_names: Vec<String>,
    pub success: bool,
    pub results: Vec<ParallelTaskResult>,
}

/// 并行度分析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelAnalysis {
    pub total_tasks: usize,
    pub execution_levels: usize,
    /// 含多于一个任务的层级数
    pub parallel_levels: usize,
    pub max_parallel_tasks: usize,
    /// 无依赖的任务数
    pub independent_tasks: usize,
    /// 任务数 / 层级数
    pub theoretical_speedup: f64,
    /// 加速比 / 最大并行数
    pub parallel_efficiency: f64,
    pub recommendations: Vec<String>,
}

/// 并行执行器
#[derive(Debug, Default)]
pub struct ParallelExecutor {
    active: ActiveRegistry,
}

impl ParallelExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one(
        &self,
        index: usize,
        task: &TaskDefinition,
        group_id: &str,
        token: &CancellationToken,
        done: &AtomicUsize,
        ctx: &WorkflowContext,
        runner: &dyn TaskRunner,
    ) -> ParallelTaskResult {
        if token.is_cancelled() {
            return ParallelTaskResult::cancelled(index, task, "group cancelled before start");
        }
        let start = Instant::now();
        let result = run_guarded(runner, task, ctx).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.advance(group_id, finished).await;

        match result {
            Ok(output) => {
                ctx.set_task_result(task.name.clone(), output.data.clone()).await;
                ParallelTaskResult {
                    task_index: Some(index),
                    task_name: task.name.clone(),
                    status: TaskStatus::Completed,
                    message: output.message,
                    data: Some(output.data),
                    error: None,
                    elapsed_ms,
                    timestamp: Utc::now(),
                    failure: None,
                }
            }
            Err(e) => {
                tracing::warn!(group = %group_id, task = %task.name, error = %e, "Parallel task failed");
                ParallelTaskResult {
                    task_index: Some(index),
                    task_name: task.name.clone(),
                    status: TaskStatus::Failed,
                    message: format!("task '{}' failed", task.name),
                    data: None,
                    error: Some(e.to_string()),
                    elapsed_ms,
                    timestamp: Utc::now(),
                    failure: Some(e),
                }
            }
        }
    }

    /// 并发执行全部任务，结果按输入顺序返回
    ///
    /// 超时时返回单个组级失败结果。
    pub async fn execute_parallel(
        &self,
        tasks: &[TaskDefinition],
        group_id: &str,
        ctx: &WorkflowContext,
        runner: &dyn TaskRunner,
        limit: Option<Duration>,
    ) -> Vec<ParallelTaskResult> {
        let token = self
            .active
            .register(group_id, "parallel", tasks.len(), Some(ctx.cancel_token()))
            .await;
        tracing::info!(group = %group_id, tasks = tasks.len(), "Parallel group started");
        let done = AtomicUsize::new(0);

        let futures = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| self.run_one(i, task, group_id, &token, &done, ctx, runner));
        let all = join_all(futures);

        let results = match limit {
            Some(limit) => match timeout(limit, all).await {
                Ok(results) => results,
                Err(_) => {
                    tracing::warn!(group = %group_id, limit_ms = limit.as_millis() as u64, "Parallel group timed out");
                    vec![ParallelTaskResult::group_timeout(group_id, limit)]
                }
            },
            None => all.await,
        };

        self.active.remove(group_id).await;
        results
    }

    /// 首个成功即返回：其余未完成的任务被放弃并标记为 Cancelled
    pub async fn execute_first_success(
        &self,
        tasks: &[TaskDefinition],
        group_id: &str,
        ctx: &WorkflowContext,
        runner: &dyn TaskRunner,
        limit: Option<Duration>,
    ) -> Vec<ParallelTaskResult> {
        let token = self
            .active
            .register(group_id, "parallel_first", tasks.len(), Some(ctx.cancel_token()))
            .await;
        let done = AtomicUsize::new(0);

        let race = async {
            let mut pending: FuturesUnordered<_> = tasks
                .iter()
                .enumerate()
                .map(|(i, task)| self.run_one(i, task, group_id, &token, &done, ctx, runner))
                .collect();
            let mut finished = Vec::new();
            while let Some(result) = pending.next().await {
                let won = result.is_success();
                finished.push(result);
                if won {
                    break;
                }
            }
            finished
        };

        let finished = match limit {
            Some(limit) => match timeout(limit, race).await {
                Ok(finished) => finished,
                Err(_) => {
                    self.active.remove(group_id).await;
                    return vec![ParallelTaskResult::group_timeout(group_id, limit)];
                }
            },
            None => race.await,
        };
        self.active.remove(group_id).await;

        let mut by_index: HashMap<usize, ParallelTaskResult> = finished
            .into_iter()
            .filter_map(|r| r.task_index.map(|i| (i, r)))
            .collect();
        tasks
            .iter()
            .enumerate()
            .map(|(i, task)| {
                by_index
                    .remove(&i)
                    .unwrap_or_else(|| ParallelTaskResult::cancelled(i, task, "abandoned after first success"))
            })
            .collect()
    }

    /// 按组配置执行（wait_all / timeout）
    pub async fn execute_group(
        &self,
        group: &ParallelGroup,
        tasks: &[TaskDefinition],
        group_id: &str,
        ctx: &WorkflowContext,
        runner: &dyn TaskRunner,
    ) -> Vec<ParallelTaskResult> {
        if group.wait_all {
            self.execute_parallel(tasks, group_id, ctx, runner, group.timeout())
                .await
        } else {
            self.execute_first_success(tasks, group_id, ctx, runner, group.timeout())
                .await
        }
    }

    /// 依次执行多个并行组；组内任务名必须存在于计划中
    pub async fn execute_parallel_groups(
        &self,
        groups: &[ParallelGroup],
        plan: &TaskPlan,
        execution_id: &str,
        ctx: &WorkflowContext,
        runner: &dyn TaskRunner,
    ) -> Result<Vec<GroupResult>, WorkflowError> {
        let mut resolved = Vec::with_capacity(groups.len());
        for group in groups {
            group.validate()?;
            let tasks = group
                .task_names
                .iter()
                .map(|name| {
                    plan.task(name)
                        .cloned()
                        .ok_or_else(|| WorkflowError::UnknownTask(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            resolved.push(tasks);
        }

        let mut out = Vec::with_capacity(groups.len());
        for (index, (group, tasks)) in groups.iter().zip(resolved).enumerate() {
            let group_id = format!("{execution_id}_group_{index}");
            let results = self.execute_group(group, &tasks, &group_id, ctx, runner).await;
            let success = if group.wait_all {
                results.iter().all(|r| r.is_success())
            } else {
                results.iter().any(|r| r.is_success())
            };
            out.push(GroupResult {
                group_index: index,
                task_names: group.task_names.clone(),
                success,
                results,
            });
        }
        Ok(out)
    }

    pub async fn cancel_parallel_execution(&self, group_id: &str) -> bool {
        self.active.cancel(group_id).await
    }

    pub async fn get_parallel_status(&self, group_id: &str) -> Option<ActiveStatus> {
        self.active.status(group_id).await
    }

    pub async fn active_executions(&self) -> Vec<ActiveStatus> {
        self.active.list().await
    }
}

/// 可并行的层级（含多于一个任务）
pub fn identify_parallel_tasks<T>(graph: &TaskGraph<T>) -> Result<Vec<Vec<TaskId>>, WorkflowError> {
    Ok(graph
        .get_execution_levels()?
        .into_iter()
        .filter(|level| level.len() > 1)
        .collect())
}

/// 分析计划的并行潜力
pub fn analyze_parallel_potential(plan: &TaskPlan) -> Result<ParallelAnalysis, WorkflowError> {
    plan.validate()?;
    let ids: HashMap<String, TaskId> = plan
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.clone(), i as TaskId + 1))
        .collect();
    let graph = TaskGraph::from_plan(plan, &ids)?;
    let levels = graph.get_execution_levels()?;

    let total_tasks = plan.tasks.len();
    let execution_levels = levels.len();
    let parallel_levels = levels.iter().filter(|l| l.len() > 1).count();
    let max_parallel_tasks = levels.iter().map(Vec::len).max().unwrap_or(0);
    let independent_tasks = graph.roots().len();
    let theoretical_speedup = if execution_levels == 0 {
        1.0
    } else {
        total_tasks as f64 / execution_levels as f64
    };
    let parallel_efficiency = if max_parallel_tasks == 0 {
        0.0
    } else {
        theoretical_speedup / max_parallel_tasks as f64
    };

    let mut recommendations = Vec::new();
    if independent_tasks > 1 {
        recommendations.push(format!(
            "{independent_tasks} independent tasks can start concurrently"
        ));
    }
    if parallel_levels > 0 {
        recommendations.push(format!(
            "{parallel_levels} execution level(s) contain parallelizable tasks"
        ));
    }
    if theoretical_speedup > 2.0 {
        recommendations.push(format!(
            "theoretical speedup {theoretical_speedup:.1}x, parallel execution recommended"
        ));
    } else if theoretical_speedup < 1.5 {
        recommendations.push("limited parallelism, mostly sequential execution".to_string());
    }
    if total_tasks > 20 && parallel_levels == 0 {
        recommendations.push("large sequential plan, consider redesigning dependencies".to_string());
    }

    Ok(ParallelAnalysis {
        total_tasks,
        execution_levels,
        parallel_levels,
        max_parallel_tasks,
        independent_tasks,
        theoretical_speedup,
        parallel_efficiency,
        recommendations,
    })
}
