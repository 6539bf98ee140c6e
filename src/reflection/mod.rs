//! 反思执行：先起草、再评审，不合格则带着修正意见重做

pub mod critic;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use critic::CriticReflectiveExecutor;

/// 反思执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 实际起草次数
    pub attempts: u32,
    /// 评审给出的修正意见（按轮次）
    #[serde(default)]
    pub corrections: Vec<String>,
}

impl ReflectionOutcome {
    pub fn succeeded(output: impl Into<String>, attempts: u32, corrections: Vec<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            attempts,
            corrections,
        }
    }

    pub fn failed(error: impl Into<String>, attempts: u32, corrections: Vec<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            attempts,
            corrections,
        }
    }
}

/// 反思执行器
#[async_trait]
pub trait ReflectiveExecutor: Send + Sync {
    async fn execute_with_reflection(
        &self,
        task: &str,
        goal: &str,
        constraints: &[String],
        context: &Value,
    ) -> ReflectionOutcome;
}
