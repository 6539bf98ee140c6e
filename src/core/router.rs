//! 任务路由
//!
//! 为每个请求选择执行模式（Simple / Planning / Reflection）：
//! 1. 查决策缓存（键为归一化后的请求文本）
//! 2. 规则判断：长度、特殊指示词、关键词加权与复杂度评分
//! 3. 规则无法判断时交给分类器（通常由 LLM 实现）
//! 4. 仍无结果时默认 Simple
//!
//! 所有决策都会写入容量有限的缓存，满时淘汰最早的条目。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::RouterSection;
use crate::core::error::OrchestratorError;
use crate::llm::{LlmClient, ROUTING_MARKER};
use crate::memory::Message;

/// 执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// 直接调用工具或 LLM
    Simple,
    /// 分解为任务计划后由工作流引擎执行
    Planning,
    /// 自我批评、迭代改进
    Reflection,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Simple => "simple",
            ExecutionMode::Planning => "planning",
            ExecutionMode::Reflection => "reflection",
        }
    }

    /// 从自由文本中识别模式名
    pub fn parse_loose(text: &str) -> Option<Self> {
        let lower = text.trim().to_lowercase();
        [ExecutionMode::Simple, ExecutionMode::Planning, ExecutionMode::Reflection]
            .into_iter()
            .find(|m| lower.contains(m.as_str()))
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 路由决策
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub mode: ExecutionMode,
    pub confidence: f64,
    pub reason: String,
    #[serde(default)]
    pub analysis: HashMap<String, Value>,
}

impl RouteDecision {
    fn new(mode: ExecutionMode, confidence: f64, reason: impl Into<String>, method: &str) -> Self {
        let mut analysis = HashMap::new();
        analysis.insert("method".to_string(), json!(method));
        Self {
            mode,
            confidence,
            reason: reason.into(),
            analysis,
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.analysis.insert(key.to_string(), value);
        self
    }

    pub fn method(&self) -> Option<&str> {
        self.analysis.get("method").and_then(Value::as_str)
    }
}

/// 模式分类器：规则无法判断时调用；返回 None 表示无法判断
#[async_trait]
pub trait ModeClassifier: Send + Sync {
    async fn classify(&self, request: &str, context: &Value) -> Result<Option<ExecutionMode>, OrchestratorError>;
}

const CLASSIFY_RUBRIC: &str = "请分析用户请求的复杂度，并选择最合适的执行模式：

1. simple - 简单对话模式：简单问答、信息查询、单步骤任务、基础对话
2. planning - 规划模式：多步骤任务、需要分解的复杂任务、项目管理
3. reflection - 反思模式：代码生成、复杂分析、高质量输出、需要验证的任务

只返回模式名称（simple、planning 或 reflection），不要包含其他内容。";

/// 基于 LLM 的模式分类器
pub struct LlmModeClassifier {
    llm: Arc<dyn LlmClient>,
}

impl LlmModeClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ModeClassifier for LlmModeClassifier {
    async fn classify(&self, request: &str, context: &Value) -> Result<Option<ExecutionMode>, OrchestratorError> {
        let mut prompt = format!("用户请求: {request}");
        if let Some(memories) = context.get("memories").and_then(Value::as_array) {
            prompt.push_str(&format!("\n相关记忆数量: {}", memories.len()));
        }
        if let Some(role) = context.get("role").and_then(Value::as_str) {
            prompt.push_str(&format!("\n角色类型: {role}"));
        }

        let messages = [
            Message::system(format!("{ROUTING_MARKER}\n{CLASSIFY_RUBRIC}")),
            Message::user(prompt),
        ];
        let answer = self.llm.complete(&messages).await?;
        let mode = ExecutionMode::parse_loose(&answer);
        if mode.is_none() {
            tracing::warn!(answer = %answer.trim(), "Classifier returned an unknown mode");
        }
        Ok(mode)
    }
}

const SIMPLE_KEYWORDS: &[&str] = &[
    "什么", "怎么", "如何", "查询", "查看", "获取", "显示", "告诉我", "hello", "hi", "你好", "谢谢",
    "再见", "解释", "说明", "介绍",
];

const PLANNING_KEYWORDS: &[&str] = &[
    "规划", "计划", "分析", "设计", "重构", "优化", "改进", "帮我", "步骤", "流程", "方案", "策略",
    "架构", "系统", "多步骤", "复杂", "分解", "任务", "项目", "plan", "design", "refactor",
];

const REFLECTION_KEYWORDS: &[&str] = &[
    "生成", "创建", "编写", "实现", "开发", "构建", "制作", "代码", "sql", "测试", "文档", "脚本",
    "程序", "算法", "高质量", "完美", "最佳", "优化", "改进", "修复", "调试", "implement", "debug",
];

/// 出现即直接判定的指示词
const REFLECTION_INDICATORS: &[&str] = &["代码", "sql", "脚本", "程序", "算法", "code", "script"];
const PLANNING_INDICATORS: &[&str] = &["步骤", "流程", "方案", "策略", "架构", "step by step", "roadmap"];

const HIGH_COMPLEXITY: &[&str] = &["系统", "架构", "框架", "平台", "完整", "全面", "详细"];
const MEDIUM_COMPLEXITY: &[&str] = &["分析", "设计", "规划", "方案", "策略", "流程"];
const LOW_COMPLEXITY: &[&str] = &["简单", "快速", "基础", "基本", "入门"];
const SCOPE_WORDS: &[&str] = &["完整", "全面", "详细", "系统", "架构"];
const MULTI_ITEM_WORDS: &[&str] = &["多", "几个", "多个", "各种", "不同", "several", "multiple"];
const TECH_TERMS: &[&str] = &["api", "数据库", "算法", "框架", "库", "接口", "协议", "database"];

fn count_matches(text: &str, words: &[&str]) -> usize {
    words.iter().filter(|w| text.contains(*w)).count()
}

fn any_match(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// 复杂度评分 0.0-1.0
pub fn complexity_score(lower: &str) -> f64 {
    let mut score = count_matches(lower, HIGH_COMPLEXITY) as f64 * 0.3
        + count_matches(lower, MEDIUM_COMPLEXITY) as f64 * 0.2
        + count_matches(lower, LOW_COMPLEXITY) as f64 * 0.1;
    if any_match(lower, SCOPE_WORDS) {
        score += 0.3;
    }
    if any_match(lower, MULTI_ITEM_WORDS) {
        score += 0.2;
    }
    score += count_matches(lower, TECH_TERMS) as f64 * 0.1;
    score.min(1.0)
}

/// 缓存键：小写，去掉标点，空白折叠为 `_`，最长 100 字符
pub fn cache_key(request: &str) -> String {
    let cleaned: String = request
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join("_").chars().take(100).collect()
}

#[derive(Debug)]
struct RouteCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, RouteDecision>,
}

impl RouteCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, key: String, decision: RouteDecision) {
        if self.entries.insert(key.clone(), decision).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

/// 缓存统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub cache_size: usize,
    pub max_size: usize,
    pub mode_distribution: BTreeMap<String, usize>,
}

/// 任务路由器
pub struct TaskRouter {
    classifier: Option<Arc<dyn ModeClassifier>>,
    cache: Mutex<RouteCache>,
    short_request_chars: usize,
    long_request_chars: usize,
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::from_config(&RouterSection::default())
    }
}

impl TaskRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &RouterSection) -> Self {
        Self {
            classifier: None,
            cache: Mutex::new(RouteCache::new(cfg.cache_size)),
            short_request_chars: cfg.short_request_chars,
            long_request_chars: cfg.long_request_chars,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ModeClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// 便捷方法：以 LLM 作为分类器
    pub fn with_llm(self, llm: Arc<dyn LlmClient>) -> Self {
        self.with_classifier(Arc::new(LlmModeClassifier::new(llm)))
    }

    pub async fn route(&self, request: &str, context: &Value) -> RouteDecision {
        let key = cache_key(request);
        if let Some(hit) = self.cached(&key) {
            tracing::debug!(key = %key, mode = %hit.mode, "Route cache hit");
            return hit;
        }

        let decision = match self.rule_based(request) {
            Some(decision) => decision,
            None => self.classify(request, context).await,
        };
        tracing::info!(
            mode = %decision.mode,
            confidence = decision.confidence,
            method = decision.method().unwrap_or("unknown"),
            "Route decided"
        );
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, decision.clone());
        decision
    }

    fn cached(&self, key: &str) -> Option<RouteDecision> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(key)
            .cloned()
    }

    async fn classify(&self, request: &str, context: &Value) -> RouteDecision {
        let Some(classifier) = &self.classifier else {
            return RouteDecision::new(ExecutionMode::Simple, 0.6, "默认简单模式", "default");
        };
        match classifier.classify(request, context).await {
            Ok(Some(mode)) => RouteDecision::new(mode, 0.9, "基于 LLM 分析", "llm_based"),
            Ok(None) => RouteDecision::new(ExecutionMode::Simple, 0.6, "默认简单模式", "default"),
            Err(e) => {
                tracing::warn!(error = %e, "Mode classifier failed, falling back to simple");
                RouteDecision::new(
                    ExecutionMode::Simple,
                    0.5,
                    format!("分类失败，降级到简单模式: {e}"),
                    "fallback",
                )
                .with("error", json!(e.to_string()))
            }
        }
    }

    /// 规则判断；没有任何信号或得分不足时返回 None
    fn rule_based(&self, request: &str) -> Option<RouteDecision> {
        let length = request.trim().chars().count();
        let rule = |mode: ExecutionMode, reason: &str| {
            RouteDecision::new(mode, 0.8, reason, "rule_based").with("request_length", json!(length))
        };

        if length < self.short_request_chars {
            return Some(rule(ExecutionMode::Simple, "短请求"));
        }

        let lower = request.to_lowercase();
        let complexity = complexity_score(&lower);
        if any_match(&lower, REFLECTION_INDICATORS) {
            return Some(rule(ExecutionMode::Reflection, "包含代码类指示词").with("complexity", json!(complexity)));
        }
        if any_match(&lower, PLANNING_INDICATORS) {
            return Some(rule(ExecutionMode::Planning, "包含规划类指示词").with("complexity", json!(complexity)));
        }
        if length > self.long_request_chars {
            let mode = if complexity >= 0.6 {
                ExecutionMode::Reflection
            } else {
                ExecutionMode::Planning
            };
            return Some(rule(mode, "长请求").with("complexity", json!(complexity)));
        }

        let simple = count_matches(&lower, SIMPLE_KEYWORDS);
        let planning = count_matches(&lower, PLANNING_KEYWORDS);
        let reflection = count_matches(&lower, REFLECTION_KEYWORDS);

        if simple + planning + reflection == 0 {
            let mode = if complexity >= 0.7 {
                ExecutionMode::Reflection
            } else if complexity >= 0.4 {
                ExecutionMode::Planning
            } else if complexity > 0.0 {
                ExecutionMode::Simple
            } else {
                return None;
            };
            return Some(rule(mode, "按复杂度判断").with("complexity", json!(complexity)));
        }

        let mut scores = [
            (ExecutionMode::Simple, simple as f64),
            (ExecutionMode::Planning, planning as f64 * 1.2),
            (ExecutionMode::Reflection, reflection as f64 * 1.5),
        ];
        if complexity >= 0.6 {
            scores[2].1 *= 1.5;
            scores[1].1 *= 1.2;
        } else if complexity >= 0.3 {
            scores[1].1 *= 1.3;
        }

        let (mut best, mut best_score) = scores[0];
        for &(mode, score) in &scores[1..] {
            if score > best_score {
                best = mode;
                best_score = score;
            }
        }
        let tied = scores
            .iter()
            .filter(|(_, s)| (s - best_score).abs() < f64::EPSILON)
            .count()
            > 1;
        if best_score < 1.0 || tied {
            return None;
        }

        let score_map: BTreeMap<&str, f64> = scores.iter().map(|(m, s)| (m.as_str(), *s)).collect();
        Some(
            rule(best, "关键词加权")
                .with("complexity", json!(complexity))
                .with("scores", json!(score_map)),
        )
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!("Route cache cleared");
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let mut mode_distribution = BTreeMap::new();
        for decision in cache.entries.values() {
            *mode_distribution
                .entry(decision.mode.as_str().to_string())
                .or_insert(0) += 1;
        }
        CacheStats {
            cache_size: cache.entries.len(),
            max_size: cache.capacity,
            mode_distribution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient};

    fn router_with(llm: Arc<ScriptedLlmClient>) -> TaskRouter {
        TaskRouter::new().with_llm(llm)
    }

    #[tokio::test]
    async fn test_short_request_skips_classifier() {
        let llm = Arc::new(ScriptedLlmClient::always("reflection"));
        let router = router_with(llm.clone());
        let decision = router.route("写个SQL", &Value::Null).await;
        assert_eq!(decision.mode, ExecutionMode::Simple);
        assert_eq!(decision.confidence, 0.8);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_indicator_rules() {
        let router = TaskRouter::new();
        let d = router
            .route("帮我写一段 SQL 统计每个月的订单数量和金额", &Value::Null)
            .await;
        assert_eq!(d.mode, ExecutionMode::Reflection);

        let d = router
            .route("请给出数据库迁移的方案以及具体的实施计划安排", &Value::Null)
            .await;
        assert_eq!(d.mode, ExecutionMode::Planning);
    }

    #[tokio::test]
    async fn test_long_request_uses_complexity() {
        let router = TaskRouter::new();
        let long_plain = "请帮忙整理一下".repeat(40);
        assert_eq!(router.route(&long_plain, &Value::Null).await.mode, ExecutionMode::Planning);

        let long_complex = format!("{}完整的平台框架", "请整理一下".repeat(50));
        assert_eq!(router.route(&long_complex, &Value::Null).await.mode, ExecutionMode::Reflection);
    }

    #[tokio::test]
    async fn test_keyword_scoring() {
        let router = TaskRouter::new();
        let d = router
            .route("what does this error message mean for me", &Value::Null)
            .await;
        assert_eq!(d.mode, ExecutionMode::Simple);
        assert_eq!(d.method(), Some("rule_based"));
    }

    #[tokio::test]
    async fn test_no_signal_consults_classifier_once() {
        let llm = Arc::new(ScriptedLlmClient::always("Planning."));
        let router = router_with(llm.clone());
        let request = "the weather tomorrow in the city please";

        let first = router.route(request, &Value::Null).await;
        assert_eq!(first.mode, ExecutionMode::Planning);
        assert_eq!(first.confidence, 0.9);
        assert_eq!(first.method(), Some("llm_based"));

        let second = router.route("The weather, tomorrow in the city please!", &Value::Null).await;
        assert_eq!(first, second);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_classifier_failure_and_unknown_answer() {
        let failing = Arc::new(ScriptedLlmClient::failing().push_error(LlmError::Api("down".into())));
        let router = router_with(failing);
        let d = router.route("the weather tomorrow in the city please", &Value::Null).await;
        assert_eq!(d.mode, ExecutionMode::Simple);
        assert_eq!(d.confidence, 0.5);

        let vague = router_with(Arc::new(ScriptedLlmClient::always("not sure")));
        let d = vague.route("the weather tomorrow in the city please", &Value::Null).await;
        assert_eq!(d.confidence, 0.6);
        assert_eq!(d.method(), Some("default"));

        let none = TaskRouter::new();
        let d = none.route("the weather tomorrow in the city please", &Value::Null).await;
        assert_eq!(d.mode, ExecutionMode::Simple);
        assert_eq!(d.confidence, 0.6);
    }

    #[test]
    fn test_cache_key_normalization() {
        assert_eq!(cache_key("  Hello,   World! "), "hello_world");
        assert_eq!(cache_key("你好 世界？"), "你好_世界");
        assert_eq!(cache_key(&"a".repeat(300)).len(), 100);
    }

    #[tokio::test]
    async fn test_cache_is_bounded_and_observable() {
        let router = TaskRouter::from_config(&RouterSection {
            cache_size: 2,
            ..RouterSection::default()
        });
        router.route("hi", &Value::Null).await;
        router.route("帮我写一段 SQL 统计每个月的订单数量和金额", &Value::Null).await;
        router.route("请给出数据库迁移的方案以及具体的实施计划安排", &Value::Null).await;

        let stats = router.cache_stats();
        assert_eq!(stats.cache_size, 2);
        assert_eq!(stats.max_size, 2);
        assert_eq!(stats.mode_distribution.get("simple"), None);
        assert_eq!(stats.mode_distribution["reflection"], 1);
        assert_eq!(stats.mode_distribution["planning"], 1);

        router.clear_cache();
        assert_eq!(router.cache_stats().cache_size, 0);
    }
}
