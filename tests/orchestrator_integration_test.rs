//! 编排器集成测试：路由、模式执行、错误恢复与状态历史

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::config::AppConfig;
use hive::core::{
    ExecutionMode, ExecutionState, ModeClassifier, OrchestratorBuilder, OrchestratorError,
    OrchestratorRequest, RecoveryStrategy,
};
use hive::llm::{MockLlmClient, ScriptedLlmClient};
use hive::tools::{EchoTool, FnTool, Tool, ToolExecutor, ToolInvoker, ToolRegistry};
use hive::workflow::{Decomposer, PlanBuilder, StaticDecomposer, TaskPlan};
use serde_json::{json, Value};

fn tools() -> Arc<dyn ToolInvoker> {
    let registry = ToolRegistry::new()
        .with_tool(EchoTool)
        .with_tool(FnTool::new("broken", "always fails", |_| Err("boom".to_string())));
    Arc::new(ToolExecutor::new(registry, 5))
}

struct FixedClassifier(ExecutionMode);

#[async_trait]
impl ModeClassifier for FixedClassifier {
    async fn classify(&self, _request: &str, _context: &Value) -> Result<Option<ExecutionMode>, OrchestratorError> {
        Ok(Some(self.0))
    }
}

struct BrokenDecomposer;

#[async_trait]
impl Decomposer for BrokenDecomposer {
    async fn decompose(&self, _request: &str, _context: &Value) -> Result<TaskPlan, OrchestratorError> {
        Err(OrchestratorError::Structural("decomposition produced an empty plan".to_string()))
    }
}

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "never answers in time"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok("too late".to_string())
    }
}

fn states(history: &[hive::core::StateTransition]) -> Vec<ExecutionState> {
    history.iter().map(|t| t.to_state).collect()
}

#[tokio::test]
async fn test_short_request_routes_simple_without_classifier_call() {
    let llm = Arc::new(ScriptedLlmClient::always("fine, thanks"));
    let orch = OrchestratorBuilder::new(AppConfig::default())
        .with_llm(llm.clone())
        .with_tools(tools())
        .build();

    let resp = orch.execute(OrchestratorRequest::new("how are you")).await;
    assert!(resp.success);
    assert_eq!(resp.mode, ExecutionMode::Simple);
    assert_eq!(resp.content, "fine, thanks");
    // 只有 Simple 模式本身的一次 LLM 调用
    assert_eq!(llm.call_count(), 1);
    assert_eq!(resp.metadata["route"]["mode"], "simple");
}

#[tokio::test]
async fn test_classifier_decides_inconclusive_requests() {
    let plan = PlanBuilder::new("one_step")
        .tool_task("reply", "echo", json!({"text": "planned reply"}))
        .build()
        .unwrap();
    let orch = OrchestratorBuilder::new(AppConfig::default())
        .with_llm(Arc::new(MockLlmClient))
        .with_tools(tools())
        .with_classifier(Arc::new(FixedClassifier(ExecutionMode::Planning)))
        .with_decomposer(Arc::new(StaticDecomposer::new(plan)))
        .build();

    let resp = orch
        .execute(OrchestratorRequest::new("the weather near the harbour today"))
        .await;
    assert!(resp.success, "{:?}", resp.error);
    assert_eq!(resp.mode, ExecutionMode::Planning);
    assert!(resp.content.contains("planned reply") || resp.content.contains("reply"));
    assert_eq!(
        states(&resp.state_history),
        vec![ExecutionState::Routing, ExecutionState::Executing, ExecutionState::Completed]
    );
}

#[tokio::test]
async fn test_planning_tool_failure_retries_once_then_fails() {
    let plan = PlanBuilder::new("doomed")
        .tool_task("explode", "broken", json!({}))
        .build()
        .unwrap();
    let orch = OrchestratorBuilder::new(AppConfig::default())
        .with_llm(Arc::new(MockLlmClient))
        .with_tools(tools())
        .with_decomposer(Arc::new(StaticDecomposer::new(plan)))
        .build();

    let resp = orch
        .execute(
            OrchestratorRequest::new("run the doomed plan")
                .with_mode(ExecutionMode::Planning)
                .with_execution_id("exec-doomed"),
        )
        .await;

    assert!(!resp.success);
    assert!(resp.error.as_deref().unwrap().contains("boom"));
    assert_eq!(resp.metadata["recovery"]["strategy"], json!(RecoveryStrategy::Retry));
    assert_eq!(
        states(&resp.state_history),
        vec![
            ExecutionState::Routing,
            ExecutionState::Executing,
            ExecutionState::Error,
            ExecutionState::Recovering,
            ExecutionState::Executing,
            ExecutionState::Error,
        ]
    );

    let stats = orch.statistics();
    assert_eq!(stats.error_handler.total_errors, 1);
    assert_eq!(stats.error_handler.error_kinds["tool"], 1);

    let status = orch.get_status("exec-doomed").await.unwrap();
    assert_eq!(status.current_state, ExecutionState::Error);
    assert!(status.workflow.is_none());
}

#[tokio::test]
async fn test_structural_failure_downgrades_to_simple() {
    let orch = OrchestratorBuilder::new(AppConfig::default())
        .with_llm(Arc::new(MockLlmClient))
        .with_tools(tools())
        .with_decomposer(Arc::new(BrokenDecomposer))
        .build();

    let resp = orch
        .execute(OrchestratorRequest::new("organise the offsite").with_mode(ExecutionMode::Planning))
        .await;

    assert!(resp.success);
    assert_eq!(resp.mode, ExecutionMode::Simple);
    assert_eq!(resp.metadata["recovered"], true);
    assert!(resp.metadata["original_error"]
        .as_str()
        .unwrap()
        .contains("empty plan"));
    assert_eq!(resp.content, "Echo from Mock: organise the offsite");
}

#[tokio::test]
async fn test_reflection_mode_with_critic_loop() {
    let llm = Arc::new(ScriptedLlmClient::new([
        "first draft",
        "missing the conclusion",
        "second draft with conclusion",
        "OK",
    ]));
    let orch = OrchestratorBuilder::new(AppConfig::default())
        .with_llm(llm)
        .with_tools(tools())
        .build();

    let resp = orch
        .execute(
            OrchestratorRequest::new("write an essay")
                .with_mode(ExecutionMode::Reflection)
                .with_context("constraints", json!(["include a conclusion"])),
        )
        .await;
    assert!(resp.success, "{:?}", resp.error);
    assert_eq!(resp.content, "second draft with conclusion");
    assert_eq!(resp.metadata["reflection_attempts"], 2);
}

#[tokio::test]
async fn test_planning_tool_timeout_downgrades_to_simple() {
    let registry = ToolRegistry::new().with_tool(EchoTool).with_tool(SlowTool);
    let tools: Arc<dyn ToolInvoker> = Arc::new(ToolExecutor::with_timeout(registry, Duration::from_millis(50)));
    let plan = PlanBuilder::new("sluggish")
        .tool_task("fetch", "slow", json!({}))
        .build()
        .unwrap();
    let orch = OrchestratorBuilder::new(AppConfig::default())
        .with_llm(Arc::new(MockLlmClient))
        .with_tools(tools)
        .with_decomposer(Arc::new(StaticDecomposer::new(plan)))
        .build();

    let resp = orch
        .execute(OrchestratorRequest::new("fetch the quarterly report").with_mode(ExecutionMode::Planning))
        .await;

    assert!(resp.success, "{:?}", resp.error);
    assert_eq!(resp.mode, ExecutionMode::Simple);
    assert_eq!(resp.metadata["recovery_strategy"], json!(RecoveryStrategy::Downgrade));
    assert!(resp.metadata["original_error"].as_str().unwrap().starts_with("Timeout:"));
    assert_eq!(resp.content, "Echo from Mock: fetch the quarterly report");

    let stats = orch.statistics();
    assert_eq!(stats.error_handler.error_kinds.get("timeout"), Some(&1));
    assert!(stats.error_handler.error_kinds.get("tool").is_none());
}
