//! Mock LLM 客户端（用于测试与本地演示，无需 API）
//!
//! - `MockLlmClient`：按提示词类型给出确定性的回答（路由单词、计划 JSON、评审 OK、echo 工具调用）
//! - `ScriptedLlmClient`：按顺序返回预设回答，并记录调用次数

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

/// 提示词标记：路由器、分解器、评审者的系统提示中包含这些标记
pub const ROUTING_MARKER: &str = "[mode-routing]";
pub const DECOMPOSE_MARKER: &str = "[task-decomposition]";
pub const CRITIC_MARKER: &str = "[critic]";

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient;

fn last_user(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::User))
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)")
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let system = messages
            .iter()
            .filter(|m| matches!(m.role, Role::System))
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let user = last_user(messages);

        if system.contains(ROUTING_MARKER) {
            return Ok("simple".to_string());
        }
        if system.contains(CRITIC_MARKER) {
            return Ok("OK".to_string());
        }
        if system.contains(DECOMPOSE_MARKER) {
            let plan = json!({
                "name": "mock_plan",
                "description": format!("Mock plan for: {user}"),
                "tasks": [
                    {"name": "analyze", "description": "分析请求", "task_type": "plan", "priority": 8},
                    {
                        "name": "respond",
                        "description": "回显请求",
                        "task_type": "tool_call",
                        "tool_name": "echo",
                        "tool_params": {"text": user},
                        "dependencies": ["analyze"]
                    }
                ]
            });
            return Ok(format!("```json\n{plan:#}\n```"));
        }

        Ok(json!({"tool": "echo", "args": {"text": format!("Echo from Mock: {user}")}}).to_string())
    }
}

/// 脚本化客户端：依次弹出预设回答；耗尽后返回 fallback（未设置时报错）
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// 总是返回同一段回答
    pub fn always(response: impl Into<String>) -> Self {
        Self {
            fallback: Some(response.into()),
            ..Self::default()
        }
    }

    /// 总是失败
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn push_error(self, err: LlmError) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(err));
        self
    }

    pub fn push_response(self, response: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(response.into()));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(response) => response,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LlmError::Api("scripted responses exhausted".to_string())),
        }
    }
}
