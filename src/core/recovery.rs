//! 错误恢复：ErrorHandler
//!
//! 根据 OrchestratorError 的类别返回 RecoveryDirective，编排器据此决定是重试、降级、简化还是放弃。
//! 重试计数按 (类别, 任务/执行 ID) 记录，可显式重置；每次处理的错误都写入错误历史供统计。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RecoverySection;
use crate::core::error::{ErrorKind, OrchestratorError, RecoveryDirective};
use crate::core::router::ExecutionMode;

/// 最近错误保留条数（统计输出）
const RECENT_ERRORS: usize = 10;

/// 各类错误的重试 / 降级次数上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryLimits {
    pub tool_max_retries: u32,
    pub llm_max_retries: u32,
    pub unknown_max_downgrades: u32,
}

impl Default for RecoveryLimits {
    fn default() -> Self {
        Self::from(&RecoverySection::default())
    }
}

impl From<&RecoverySection> for RecoveryLimits {
    fn from(cfg: &RecoverySection) -> Self {
        Self {
            tool_max_retries: cfg.tool_max_retries,
            llm_max_retries: cfg.llm_max_retries,
            unknown_max_downgrades: cfg.unknown_max_downgrades,
        }
    }
}

/// 一条错误记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// 重试计数使用的键（task_id / execution_id）
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

/// 错误统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub error_kinds: BTreeMap<String, usize>,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Default)]
struct HandlerState {
    /// 只保留最近 RECENT_ERRORS 条，总数与分类计数单独累计
    recent: VecDeque<ErrorRecord>,
    total_errors: usize,
    kind_counts: BTreeMap<String, usize>,
    retry_counts: HashMap<String, u32>,
}

impl HandlerState {
    fn record(&mut self, record: ErrorRecord) {
        self.total_errors += 1;
        *self.kind_counts.entry(record.kind.as_str().to_string()).or_insert(0) += 1;
        if self.recent.len() == RECENT_ERRORS {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
    }
}

/// 错误处理器（进程内共享，内部加锁）
#[derive(Debug, Default)]
pub struct ErrorHandler {
    limits: RecoveryLimits,
    state: Mutex<HandlerState>,
}

/// 从上下文取重试计数键：优先 task_id，其次 execution_id
fn context_key(context: &Value) -> String {
    ["task_id", "execution_id"]
        .iter()
        .find_map(|k| match context.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(Value::String(_)) => None,
            Some(other) => Some(other.to_string()),
        })
        .unwrap_or_else(|| "unknown".to_string())
}

impl ErrorHandler {
    pub fn new(limits: RecoveryLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(HandlerState::default()),
        }
    }

    pub fn from_config(cfg: &RecoverySection) -> Self {
        Self::new(RecoveryLimits::from(cfg))
    }

    pub fn limits(&self) -> RecoveryLimits {
        self.limits
    }

    /// 处理一次错误，返回恢复指令
    pub fn handle_error(&self, error: &OrchestratorError, context: &Value) -> RecoveryDirective {
        let kind = error.kind();
        let key = context_key(context);
        let message = error.to_string();
        tracing::error!(kind = kind.as_str(), key = %key, error = %message, "Handling execution error");

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.record(ErrorRecord {
            kind,
            message: message.clone(),
            key: key.clone(),
            timestamp: Utc::now(),
        });

        let directive = match kind {
            ErrorKind::Tool => {
                match bump(&mut state.retry_counts, format!("tool_{key}"), self.limits.tool_max_retries) {
                    Some(n) => RecoveryDirective::retry(n, format!("tool call failed, retry #{n}")),
                    None => RecoveryDirective::downgrade(
                        ExecutionMode::Simple,
                        "tool call failed too many times, downgrading to simple mode",
                    ),
                }
            }
            ErrorKind::Llm => {
                match bump(&mut state.retry_counts, format!("llm_{key}"), self.limits.llm_max_retries) {
                    Some(n) => RecoveryDirective::retry(n, format!("LLM call failed, retry #{n}")),
                    None => RecoveryDirective::simplify(
                        ExecutionMode::Simple,
                        "LLM call kept failing, simplifying the request",
                    ),
                }
            }
            ErrorKind::Timeout => RecoveryDirective::downgrade(
                ExecutionMode::Simple,
                "execution timed out, downgrading to simple mode",
            ),
            ErrorKind::Validation => RecoveryDirective::abort(format!("validation failed: {message}")),
            ErrorKind::Unknown => {
                match bump(
                    &mut state.retry_counts,
                    format!("unknown_{key}"),
                    self.limits.unknown_max_downgrades,
                ) {
                    Some(_) => RecoveryDirective::downgrade(
                        ExecutionMode::Simple,
                        format!("unknown error, downgrading to simple mode: {message}"),
                    ),
                    None => RecoveryDirective::abort(format!("unrecoverable: {message}")),
                }
            }
        };

        tracing::info!(
            kind = kind.as_str(),
            strategy = ?directive.strategy,
            can_recover = directive.can_recover,
            "Recovery directive issued"
        );
        directive
    }

    /// 清空全部重试计数
    pub fn reset_retry_counts(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retry_counts
            .clear();
        tracing::debug!("Retry counters reset");
    }

    pub fn retry_count(&self, kind: ErrorKind, key: &str) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retry_counts
            .get(&format!("{}_{key}", kind.as_str()))
            .copied()
            .unwrap_or(0)
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        ErrorStatistics {
            total_errors: state.total_errors,
            error_kinds: state.kind_counts.clone(),
            recent_errors: state.recent.iter().cloned().collect(),
        }
    }
}

/// 计数未达上限时加一并返回新计数；否则返回 None
fn bump(counts: &mut HashMap<String, u32>, key: String, limit: u32) -> Option<u32> {
    let count = counts.entry(key).or_insert(0);
    if *count < limit {
        *count += 1;
        Some(*count)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::RecoveryStrategy;
    use serde_json::json;

    #[test]
    fn test_tool_errors_retry_three_times_then_downgrade() {
        let handler = ErrorHandler::default();
        let ctx = json!({"task_id": "t1"});
        let err = OrchestratorError::Tool("search exploded".into());

        let strategies: Vec<_> = (0..4).map(|_| handler.handle_error(&err, &ctx).strategy).collect();
        assert_eq!(
            strategies,
            vec![
                RecoveryStrategy::Retry,
                RecoveryStrategy::Retry,
                RecoveryStrategy::Retry,
                RecoveryStrategy::Downgrade
            ]
        );
        assert_eq!(handler.retry_count(ErrorKind::Tool, "t1"), 3);

        // 其他任务的计数独立
        let other = handler.handle_error(&err, &json!({"task_id": "t2"}));
        assert_eq!(other.strategy, RecoveryStrategy::Retry);
        assert_eq!(other.retry_count, Some(1));
    }

    #[test]
    fn test_llm_errors_simplify_after_two_retries() {
        let handler = ErrorHandler::default();
        let ctx = json!({"execution_id": "e1"});
        let err = OrchestratorError::Llm("503".into());
        assert_eq!(handler.handle_error(&err, &ctx).retry_count, Some(1));
        assert_eq!(handler.handle_error(&err, &ctx).retry_count, Some(2));
        let third = handler.handle_error(&err, &ctx);
        assert_eq!(third.strategy, RecoveryStrategy::Simplify);
        assert_eq!(third.downgrade_to, Some(ExecutionMode::Simple));
        assert!(third.can_recover);
    }

    #[test]
    fn test_timeout_and_validation() {
        let handler = ErrorHandler::default();
        let d = handler.handle_error(&OrchestratorError::Timeout("slow".into()), &Value::Null);
        assert_eq!(d.strategy, RecoveryStrategy::Downgrade);
        assert_eq!(d.downgrade_to, Some(ExecutionMode::Simple));

        let d = handler.handle_error(&OrchestratorError::Validation("bad input".into()), &Value::Null);
        assert!(!d.can_recover);
        assert_eq!(d.strategy, RecoveryStrategy::Abort);
        assert!(d.reason.contains("bad input"));
    }

    #[test]
    fn test_unknown_downgrades_once_then_aborts() {
        let handler = ErrorHandler::default();
        let err = OrchestratorError::Unknown("something odd".into());
        assert_eq!(handler.handle_error(&err, &json!({})).strategy, RecoveryStrategy::Downgrade);
        assert_eq!(handler.handle_error(&err, &json!({})).strategy, RecoveryStrategy::Abort);

        handler.reset_retry_counts();
        assert_eq!(handler.handle_error(&err, &json!({})).strategy, RecoveryStrategy::Downgrade);
    }

    #[test]
    fn test_configured_limits() {
        let handler = ErrorHandler::new(RecoveryLimits {
            tool_max_retries: 1,
            llm_max_retries: 0,
            unknown_max_downgrades: 0,
        });
        let ctx = json!({"task_id": 7});
        let tool = OrchestratorError::Tool("x".into());
        assert_eq!(handler.handle_error(&tool, &ctx).strategy, RecoveryStrategy::Retry);
        assert_eq!(handler.handle_error(&tool, &ctx).strategy, RecoveryStrategy::Downgrade);
        assert_eq!(handler.retry_count(ErrorKind::Tool, "7"), 1);
        assert_eq!(
            handler.handle_error(&OrchestratorError::Llm("x".into()), &ctx).strategy,
            RecoveryStrategy::Simplify
        );
    }

    #[test]
    fn test_error_statistics() {
        let handler = ErrorHandler::default();
        for i in 0..12 {
            handler.handle_error(&OrchestratorError::Tool(format!("e{i}")), &json!({"task_id": i}));
        }
        handler.handle_error(&OrchestratorError::Timeout("t".into()), &json!({}));

        let stats = handler.error_statistics();
        assert_eq!(stats.total_errors, 13);
        assert_eq!(stats.error_kinds["tool"], 12);
        assert_eq!(stats.error_kinds["timeout"], 1);
        assert_eq!(stats.recent_errors.len(), 10);
        assert_eq!(stats.recent_errors.last().unwrap().kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_stored_history_is_bounded() {
        let handler = ErrorHandler::default();
        for i in 0..50 {
            handler.handle_error(&OrchestratorError::Validation(format!("v{i}")), &json!({}));
        }
        let state = handler.state.lock().unwrap();
        assert_eq!(state.recent.len(), RECENT_ERRORS);
        assert_eq!(state.total_errors, 50);
        assert_eq!(state.recent.front().unwrap().message, "Validation error: v40");
    }
}
