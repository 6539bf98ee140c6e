//! 编排错误类型与恢复指令
//!
//! 与 ErrorHandler 配合：根据 OrchestratorError 的分类决定 Retry / Downgrade / Simplify / Abort。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::router::ExecutionMode;
use crate::llm::LlmError;
use crate::workflow::WorkflowError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    /// 计划非法（环、未知任务、存储失败等）
    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Tool execution failed: {0}")]
    Tool(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Unknown(String),
}

impl From<WorkflowError> for OrchestratorError {
    fn from(err: WorkflowError) -> Self {
        OrchestratorError::Structural(err.to_string())
    }
}

impl From<LlmError> for OrchestratorError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout(_) => OrchestratorError::Timeout(err.to_string()),
            _ => OrchestratorError::Llm(err.to_string()),
        }
    }
}

/// 错误分类（恢复策略按类别决定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Tool,
    Llm,
    Timeout,
    Validation,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Tool => "tool",
            ErrorKind::Llm => "llm",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl OrchestratorError {
    /// 按类别构造错误（把下层记录的类别带到上层）
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Tool => OrchestratorError::Tool(message),
            ErrorKind::Llm => OrchestratorError::Llm(message),
            ErrorKind::Timeout => OrchestratorError::Timeout(message),
            ErrorKind::Validation => OrchestratorError::Validation(message),
            ErrorKind::Unknown => OrchestratorError::Unknown(message),
        }
    }

    /// 先按变体分类；结构性/未知错误再按消息关键字归类
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Tool(_) => ErrorKind::Tool,
            OrchestratorError::Llm(_) => ErrorKind::Llm,
            OrchestratorError::Timeout(_) => ErrorKind::Timeout,
            OrchestratorError::Validation(_) => ErrorKind::Validation,
            OrchestratorError::Structural(msg) | OrchestratorError::Unknown(msg) => {
                classify_message(msg)
            }
        }
    }
}

/// 按错误消息关键字分类
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if lower.contains("tool") {
        ErrorKind::Tool
    } else if lower.contains("llm") || lower.contains("model") {
        ErrorKind::Llm
    } else if lower.contains("validation") {
        ErrorKind::Validation
    } else {
        ErrorKind::Unknown
    }
}

/// 恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// 原模式重试
    Retry,
    /// 降级到更简单的执行模式
    Downgrade,
    /// 简化请求（同样以更简单的模式重跑）
    Simplify,
    /// 放弃
    Abort,
}

/// ErrorHandler 给出的恢复指令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDirective {
    pub can_recover: bool,
    pub strategy: RecoveryStrategy,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downgrade_to: Option<ExecutionMode>,
}

impl RecoveryDirective {
    pub fn retry(retry_count: u32, reason: impl Into<String>) -> Self {
        Self {
            can_recover: true,
            strategy: RecoveryStrategy::Retry,
            reason: reason.into(),
            retry_count: Some(retry_count),
            downgrade_to: None,
        }
    }

    pub fn downgrade(to: ExecutionMode, reason: impl Into<String>) -> Self {
        Self {
            can_recover: true,
            strategy: RecoveryStrategy::Downgrade,
            reason: reason.into(),
            retry_count: None,
            downgrade_to: Some(to),
        }
    }

    pub fn simplify(to: ExecutionMode, reason: impl Into<String>) -> Self {
        Self {
            can_recover: true,
            strategy: RecoveryStrategy::Simplify,
            reason: reason.into(),
            retry_count: None,
            downgrade_to: Some(to),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            can_recover: false,
            strategy: RecoveryStrategy::Abort,
            reason: reason.into(),
            retry_count: None,
            downgrade_to: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_by_variant() {
        assert_eq!(OrchestratorError::Tool("x".into()).kind(), ErrorKind::Tool);
        assert_eq!(OrchestratorError::Timeout("tool x".into()).kind(), ErrorKind::Timeout);
        assert_eq!(OrchestratorError::Validation("bad".into()).kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_kind_by_message() {
        assert_eq!(
            OrchestratorError::Unknown("plan failed: Tool 'search' crashed".into()).kind(),
            ErrorKind::Tool
        );
        assert_eq!(
            OrchestratorError::Unknown("model overloaded".into()).kind(),
            ErrorKind::Llm
        );
        assert_eq!(
            OrchestratorError::Unknown("request timed out".into()).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            OrchestratorError::Unknown("t: Timeout: tool 'slow' timed out after 1s".into()).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            OrchestratorError::Structural(WorkflowError::CyclicDependency.to_string()).kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_from_llm_error() {
        let err: OrchestratorError = LlmError::Timeout("30s".into()).into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let err: OrchestratorError = LlmError::Api("500".into()).into();
        assert_eq!(err.kind(), ErrorKind::Llm);
    }
}
