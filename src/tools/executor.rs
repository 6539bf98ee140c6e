//! 工具执行器
//!
//! 持有 ToolRegistry 与超时，对每次调用施加超时并把结果映射为 OrchestratorError
//! （Tool / Timeout）；每次调用输出结构化审计日志（JSON）。
//! 工作流中的 ToolCall 任务通过 ToolInvoker trait 调用工具。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::OrchestratorError;
use crate::tools::{Tool, ToolRegistry};

/// 工具调用入口（工作流任务、Simple 模式共用）
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, args: Value) -> Result<String, OrchestratorError>;

    fn has_tool(&self, tool_name: &str) -> bool;

    /// "- name: description" 列表
    fn describe_tools(&self) -> String {
        String::new()
    }
}

/// 工具执行器
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[async_trait]
impl ToolInvoker for ToolExecutor {
    /// 未注册的工具与工具返回的 Err 都归为 Tool 错误，超时归为 Timeout
    async fn invoke(&self, tool_name: &str, args: Value) -> Result<String, OrchestratorError> {
        let Some(tool) = self.registry.get(tool_name) else {
            tracing::warn!(tool = %tool_name, "Unknown tool requested");
            return Err(OrchestratorError::Tool(format!("Unknown tool: {tool_name}")));
        };

        let start = Instant::now();
        let preview = args_preview(&args);
        let result = timeout(self.timeout, tool.execute(args)).await;

        let (ok, outcome) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(OrchestratorError::Tool(format!("{tool_name}: {e}"))),
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "tool '{tool_name}' timed out after {:?}",
                self.timeout
            ))),
        }
    }

    fn has_tool(&self, tool_name: &str) -> bool {
        self.registry.contains(tool_name)
    }

    fn describe_tools(&self) -> String {
        self.registry.prompt_listing()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, FnTool};
    use serde_json::json;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        }
    }

    fn executor() -> ToolExecutor {
        let registry = ToolRegistry::new()
            .with_tool(EchoTool)
            .with_tool(SlowTool)
            .with_tool(FnTool::new("fail", "fails", |_| Err("disk full".to_string())));
        ToolExecutor::with_timeout(registry, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_invoke_ok() {
        let out = executor().invoke("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn test_unknown_and_failing_tools_are_tool_errors() {
        let exec = executor();
        assert!(matches!(
            exec.invoke("nope", json!({})).await,
            Err(OrchestratorError::Tool(msg)) if msg.contains("Unknown tool")
        ));
        assert!(matches!(
            exec.invoke("fail", json!({})).await,
            Err(OrchestratorError::Tool(msg)) if msg.contains("disk full")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let err = executor().invoke("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout(_)));
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({"text": "x".repeat(500)});
        assert!(args_preview(&long).ends_with("..."));
    }
}
