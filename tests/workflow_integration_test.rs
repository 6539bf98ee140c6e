//! 工作流集成测试：只使用公开 API

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hive::tools::{EchoTool, FnTool, ToolExecutor, ToolInvoker, ToolRegistry};
use hive::workflow::*;
use serde_json::json;

fn counting_tools(counter: Arc<AtomicUsize>) -> Arc<dyn ToolInvoker> {
    let registry = ToolRegistry::new()
        .with_tool(EchoTool)
        .with_tool(FnTool::new("broken", "always fails", |_| Err("boom".to_string())))
        .with_tool(FnTool::new("flaky_timeout", "reports a timeout", |_| {
            Err("upstream timed out".to_string())
        }))
        .with_tool(FnTool::new("count", "counts calls", move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(args.to_string())
        }));
    Arc::new(ToolExecutor::new(registry, 5))
}

fn diamond(failing_b: bool) -> TaskPlan {
    let b_tool = if failing_b { "broken" } else { "echo" };
    PlanBuilder::new("diamond")
        .description("A -> {B, C} -> D")
        .tool_task("A", "echo", json!({"text": "a"}))
        .tool_task("B", b_tool, json!({"text": "b"}))
        .tool_task("C", "echo", json!({"text": "c"}))
        .tool_task("D", "echo", json!({"text": "d"}))
        .sequential("A", "B")
        .sequential("A", "C")
        .depends_on_all("D", ["B", "C"])
        .build()
        .unwrap()
}

#[test]
fn test_graph_levels_for_diamond() {
    let plan = diamond(false);
    let ids: HashMap<String, TaskId> = plan
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.clone(), i as TaskId + 1))
        .collect();
    let graph = TaskGraph::from_plan(&plan, &ids).unwrap();
    assert!(!graph.detect_cycle());

    let levels = graph.get_execution_levels().unwrap();
    assert_eq!(levels, vec![vec![1], vec![2, 3], vec![4]]);

    let mut flat: Vec<_> = levels.concat();
    flat.sort();
    assert_eq!(flat, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_failed_branch_still_reaches_join() {
    let engine = WorkflowEngine::new(
        Arc::new(InMemoryTaskStore::new()),
        counting_tools(Arc::new(AtomicUsize::new(0))),
    );
    let result = engine.execute_plan(&diamond(true), "exec-diamond").await.unwrap();

    assert!(!result.success);
    assert_eq!(result.outcome("B").unwrap().status, TaskStatus::Failed);
    assert_eq!(result.outcome("C").unwrap().status, TaskStatus::Completed);
    assert_eq!(result.outcome("D").unwrap().status, TaskStatus::Completed);

    let records = engine.get_task_records("exec-diamond").await.unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.status.is_terminal()));
    assert!(records
        .iter()
        .any(|r| r.status == TaskStatus::Failed && r.error.as_deref().unwrap_or("").contains("boom")));
}

#[tokio::test]
async fn test_cyclic_plan_is_rejected() {
    let mut plan = TaskPlan::new("cycle", "a <-> b");
    plan.tasks.push(TaskDefinition::tool_call("a", "echo", json!({"text": "a"})));
    plan.tasks.push(TaskDefinition::tool_call("b", "echo", json!({"text": "b"})));
    plan.dependencies.insert("a".into(), vec!["b".into()]);
    plan.dependencies.insert("b".into(), vec!["a".into()]);

    let engine = WorkflowEngine::new(
        Arc::new(InMemoryTaskStore::new()),
        counting_tools(Arc::new(AtomicUsize::new(0))),
    );
    let err = engine.execute_plan(&plan, "exec-cycle").await.unwrap_err();
    assert_eq!(err, WorkflowError::CyclicDependency);
    assert!(engine.get_task_records("exec-cycle").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_for_loop_over_items() {
    let counter = Arc::new(AtomicUsize::new(0));
    let plan = PlanBuilder::new("fan")
        .tool_task("each", "count", json!({"item": "{{current_item}}"}))
        .build()
        .unwrap();
    let engine = WorkflowEngine::new(Arc::new(InMemoryTaskStore::new()), counting_tools(counter.clone()));

    let mut loops = HashMap::new();
    loops.insert("each".to_string(), LoopConfig::for_each(vec![json!("x"), json!("y"), json!("z")]));
    let result = engine.execute_with_loops(&plan, "exec-loop", loops).await.unwrap();

    assert!(result.success, "{}", result.message);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_feedback_adds_retry_task_for_timeouts() {
    let plan = PlanBuilder::new("fetch")
        .tool_task("prepare", "echo", json!({"text": "ready"}))
        .tool_task("download", "flaky_timeout", json!({}))
        .sequential("prepare", "download")
        .build()
        .unwrap();
    let engine = WorkflowEngine::new(
        Arc::new(InMemoryTaskStore::new()),
        counting_tools(Arc::new(AtomicUsize::new(0))),
    );
    let result = engine.execute_plan(&plan, "exec-fetch").await.unwrap();
    assert!(!result.success);

    let feedback = ExecutionFeedback::from_result(&result);
    assert_eq!(feedback.failed_tasks.len(), 1);
    assert!(feedback.execution_times.contains_key("prepare"));

    let planner = DynamicPlanner::new();
    let adjusted = planner.adjust_plan(&plan, &feedback);
    let retry = adjusted.task("download_retry").unwrap();
    assert_eq!(retry.kind, TaskKind::Retry);
    assert_eq!(adjusted.dependencies_of("download_retry"), ["download".to_string()]);
    assert!(adjusted.validate().is_ok());
    assert!(!planner.get_modification_history(&adjusted).is_empty());
}

#[tokio::test]
async fn test_runtime_task_insertion() {
    let plan = diamond(false);
    let planner = DynamicPlanner::new();
    let extended = planner
        .add_task_runtime("D", TaskDefinition::tool_call("E", "echo", json!({"text": "e"})), &plan)
        .unwrap();
    assert_eq!(extended.dependencies_of("E"), ["D".to_string()]);
    assert_eq!(planner.get_active_modifications().len(), 1);

    let engine = WorkflowEngine::new(
        Arc::new(InMemoryTaskStore::new()),
        counting_tools(Arc::new(AtomicUsize::new(0))),
    );
    let result = engine.execute_plan(&extended, "exec-extended").await.unwrap();
    assert!(result.success);
    assert_eq!(result.outcome("E").unwrap().status, TaskStatus::Completed);

    assert_eq!(planner.prune_applied(&result), 1);
    assert!(planner.get_active_modifications().is_empty());
}
