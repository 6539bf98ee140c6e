//! 请求执行状态机
//!
//! 每个请求一台状态机：IDLE → ROUTING → EXECUTING → {COMPLETED | ERROR}；
//! ERROR → RECOVERING → {EXECUTING | ERROR | COMPLETED}；COMPLETED → IDLE。
//! 非法转换被拒绝（返回 false，状态不变）并记录警告；合法转换全部写入历史。

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Idle,
    Routing,
    Executing,
    Completed,
    Error,
    Recovering,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Idle => "IDLE",
            ExecutionState::Routing => "ROUTING",
            ExecutionState::Executing => "EXECUTING",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Error => "ERROR",
            ExecutionState::Recovering => "RECOVERING",
        }
    }

    /// 转换表
    pub fn valid_targets(&self) -> &'static [ExecutionState] {
        use ExecutionState::*;
        match self {
            Idle => &[Routing],
            Routing => &[Executing],
            Executing => &[Completed, Error],
            Error => &[Recovering],
            Recovering => &[Executing, Error, Completed],
            Completed => &[Idle],
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次状态转换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: ExecutionState,
    pub to_state: ExecutionState,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

/// 状态机
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: ExecutionState,
    history: Vec<StateTransition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: ExecutionState::Idle,
            history: Vec::new(),
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 执行转换；非法时返回 false 且状态不变
    pub fn transition(&mut self, target: ExecutionState, context: Option<HashMap<String, Value>>) -> bool {
        if !self.can_transition(target) {
            tracing::warn!(from = %self.current, to = %target, "Illegal state transition rejected");
            return false;
        }
        self.history.push(StateTransition {
            from_state: self.current,
            to_state: target,
            timestamp: Utc::now(),
            context: context.unwrap_or_default(),
        });
        tracing::debug!(from = %self.current, to = %target, "State transition");
        self.current = target;
        true
    }

    pub fn can_transition(&self, target: ExecutionState) -> bool {
        self.current.valid_targets().contains(&target)
    }

    /// 回到 IDLE 并清空历史
    pub fn reset(&mut self) {
        self.current = ExecutionState::Idle;
        self.history.clear();
    }

    pub fn current_state(&self) -> ExecutionState {
        self.current
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn is_completed(&self) -> bool {
        self.current == ExecutionState::Completed
    }

    pub fn is_error(&self) -> bool {
        self.current == ExecutionState::Error
    }

    /// 第一次到最后一次转换之间的秒数
    pub fn execution_duration(&self) -> f64 {
        match (self.history.first(), self.history.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_illegal_transition_rejected() {
        let mut sm = StateMachine::new();
        assert!(!sm.transition(ExecutionState::Executing, None));
        assert_eq!(sm.current_state(), ExecutionState::Idle);
        assert!(sm.history().is_empty());
    }

    #[test]
    fn test_happy_path_history() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(ExecutionState::Routing, None));
        assert!(sm.transition(ExecutionState::Executing, Some([("mode".to_string(), json!("simple"))].into())));
        assert!(sm.transition(ExecutionState::Completed, None));
        assert!(sm.is_completed());
        assert!(sm.transition(ExecutionState::Idle, None));

        let history = sm.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].from_state, ExecutionState::Routing);
        assert_eq!(history[1].context["mode"], "simple");
        assert_eq!(history[3].to_state, ExecutionState::Idle);
        assert!(sm.execution_duration() >= 0.0);
    }

    #[test]
    fn test_recovery_path() {
        let mut sm = StateMachine::new();
        sm.transition(ExecutionState::Routing, None);
        sm.transition(ExecutionState::Executing, None);
        assert!(sm.transition(ExecutionState::Error, None));
        assert!(sm.is_error());
        assert!(!sm.can_transition(ExecutionState::Completed));
        assert!(sm.transition(ExecutionState::Recovering, None));
        assert!(sm.transition(ExecutionState::Executing, None));
        assert!(sm.transition(ExecutionState::Completed, None));

        sm.reset();
        assert_eq!(sm.current_state(), ExecutionState::Idle);
        assert!(sm.history().is_empty());
        assert_eq!(sm.execution_duration(), 0.0);
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_value(ExecutionState::Recovering).unwrap(), json!("RECOVERING"));
    }
}
