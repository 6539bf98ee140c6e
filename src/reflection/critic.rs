//! CriticReflectiveExecutor：LLM 起草 + 评审循环
//!
//! 每一轮先让 LLM 起草答案，再用评审提示词判断是否符合目标：
//! 回答以 `OK` 开头（或为空）视为通过，否则把评审意见作为修正追加到下一轮的请求中。
//! 起草调用失败直接返回失败；评审调用失败时接受当前草稿。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{LlmClient, CRITIC_MARKER};
use crate::memory::Message;
use crate::reflection::{ReflectionOutcome, ReflectiveExecutor};

const DRAFT_PROMPT: &str = "你是一个严谨的执行者。请直接完成用户给出的任务，输出最终结果，不要解释过程。";

const CRITIC_PROMPT: &str = "你是评审者。判断下面的结果是否达成了目标并满足所有约束。\
如果达成，只回复 OK；否则用一两句话指出需要修正的地方。";

pub struct CriticReflectiveExecutor {
    llm: Arc<dyn LlmClient>,
    /// 评审用的 LLM（默认与起草相同）
    critic: Arc<dyn LlmClient>,
    max_attempts: u32,
}

impl CriticReflectiveExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, max_attempts: u32) -> Self {
        Self {
            critic: llm.clone(),
            llm,
            max_attempts: max_attempts.max(1),
        }
    }

    /// 使用独立的评审模型（避免自我认同）
    pub fn with_critic(mut self, critic: Arc<dyn LlmClient>) -> Self {
        self.critic = critic;
        self
    }

    fn draft_messages(task: &str, goal: &str, constraints: &[String], context: &Value, corrections: &[String]) -> Vec<Message> {
        let mut system = format!("{DRAFT_PROMPT}\n\n目标：{goal}");
        if !constraints.is_empty() {
            system.push_str("\n约束：");
            for c in constraints {
                system.push_str(&format!("\n- {c}"));
            }
        }
        if let Some(summary) = context.get("memory_summary").and_then(Value::as_str) {
            if !summary.is_empty() {
                system.push_str(&format!("\n\n相关记忆：\n{summary}"));
            }
        }

        let mut user = task.to_string();
        if !corrections.is_empty() {
            user.push_str("\n\n上一轮结果未通过评审，请根据以下意见修正：");
            for (i, c) in corrections.iter().enumerate() {
                user.push_str(&format!("\n{}. {c}", i + 1));
            }
        }
        vec![Message::system(system), Message::user(user)]
    }

    fn critic_messages(task: &str, goal: &str, constraints: &[String], draft: &str) -> Vec<Message> {
        let mut user = format!("任务：{task}\n目标：{goal}");
        if !constraints.is_empty() {
            user.push_str(&format!("\n约束：{}", constraints.join("；")));
        }
        user.push_str(&format!("\n\n结果：\n{draft}"));
        vec![
            Message::system(format!("{CRITIC_MARKER}\n{CRITIC_PROMPT}")),
            Message::user(user),
        ]
    }
}

#[async_trait]
impl ReflectiveExecutor for CriticReflectiveExecutor {
    async fn execute_with_reflection(
        &self,
        task: &str,
        goal: &str,
        constraints: &[String],
        context: &Value,
    ) -> ReflectionOutcome {
        let mut corrections: Vec<String> = Vec::new();

        for attempt in 1..=self.max_attempts {
            let draft = match self
                .llm
                .complete(&Self::draft_messages(task, goal, constraints, context, &corrections))
                .await
            {
                Ok(draft) => draft,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reflection draft failed");
                    return ReflectionOutcome::failed(e.to_string(), attempt, corrections);
                }
            };

            let verdict = match self
                .critic
                .complete(&Self::critic_messages(task, goal, constraints, &draft))
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Critic unavailable, accepting draft");
                    return ReflectionOutcome::succeeded(draft, attempt, corrections);
                }
            };

            let verdict = verdict.trim();
            if verdict.is_empty() || verdict.to_uppercase().starts_with("OK") {
                tracing::info!(attempt, "Reflection approved");
                return ReflectionOutcome::succeeded(draft, attempt, corrections);
            }
            tracing::info!(attempt, correction = %verdict, "Reflection requested correction");
            corrections.push(verdict.to_string());
        }

        let last = corrections.last().cloned().unwrap_or_default();
        ReflectionOutcome::failed(
            format!(
                "reflection did not converge after {} attempts: {last}",
                self.max_attempts
            ),
            self.max_attempts,
            corrections,
        )
    }
}
