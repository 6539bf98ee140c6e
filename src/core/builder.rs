//! 编排器构建器：统一的组件装配逻辑
//!
//! 未显式提供的协作方按配置补默认实现：Mock LLM、只含 echo 的工具箱、不启用记忆、
//! 基于 LLM 的分解器与反思执行器、内存任务存储。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::orchestrator::Orchestrator;
use crate::core::recovery::ErrorHandler;
use crate::core::router::{ModeClassifier, TaskRouter};
use crate::llm::{LlmClient, MockLlmClient};
use crate::memory::{MemoryStore, NoopMemory};
use crate::reflection::{CriticReflectiveExecutor, ReflectiveExecutor};
use crate::tools::{EchoTool, ToolExecutor, ToolInvoker, ToolRegistry};
use crate::workflow::{Decomposer, LlmDecomposer, TaskStore, WorkflowEngine};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Hive, a helpful assistant with access to tools.";

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    tools: Option<Arc<dyn ToolInvoker>>,
    registry: Option<ToolRegistry>,
    memory: Option<Arc<dyn MemoryStore>>,
    decomposer: Option<Arc<dyn Decomposer>>,
    reflector: Option<Arc<dyn ReflectiveExecutor>>,
    classifier: Option<Arc<dyn ModeClassifier>>,
    store: Option<Arc<dyn TaskStore>>,
    system_prompt: Option<String>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            tools: None,
            registry: None,
            memory: None,
            decomposer: None,
            reflector: None,
            classifier: None,
            store: None,
            system_prompt: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 直接提供工具调用入口（优先于 with_tool_registry）
    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// 提供工具注册表，由构建器按 [tools] 配置包一层 ToolExecutor
    pub fn with_tool_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    pub fn with_reflector(mut self, reflector: Arc<dyn ReflectiveExecutor>) -> Self {
        self.reflector = Some(reflector);
        self
    }

    /// 路由器的兜底分类器（默认用 LLM）
    pub fn with_classifier(mut self, classifier: Arc<dyn ModeClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 默认工具注册表
    pub fn build_tool_registry(&self) -> ToolRegistry {
        ToolRegistry::new().with_tool(EchoTool)
    }

    pub fn build(self) -> Orchestrator {
        let cfg = &self.config;
        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| Arc::new(MockLlmClient) as Arc<dyn LlmClient>);

        let tools = match (self.tools.clone(), self.registry.clone()) {
            (Some(tools), _) => tools,
            (None, registry) => {
                let registry = registry.unwrap_or_else(|| self.build_tool_registry());
                Arc::new(ToolExecutor::new(registry, cfg.tools.tool_timeout_secs)) as Arc<dyn ToolInvoker>
            }
        };

        let router = TaskRouter::from_config(&cfg.router);
        let router = match self.classifier.clone() {
            Some(classifier) => router.with_classifier(classifier),
            None => router.with_llm(llm.clone()),
        };

        let group_timeout = cfg
            .workflow
            .default_parallel_timeout_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);
        let mut engine = WorkflowEngine::builder()
            .tools(tools.clone())
            .llm(llm.clone())
            .max_failure_ratio(cfg.workflow.max_failure_ratio)
            .max_concurrency(cfg.workflow.max_concurrency)
            .default_group_timeout(group_timeout);
        if let Some(store) = self.store.clone() {
            engine = engine.store(store);
        }
        let engine = Arc::new(engine.build());

        let decomposer = self.decomposer.clone().unwrap_or_else(|| {
            Arc::new(LlmDecomposer::new(llm.clone()).with_tools(tools.describe_tools())) as Arc<dyn Decomposer>
        });
        let reflector = self.reflector.clone().unwrap_or_else(|| {
            Arc::new(CriticReflectiveExecutor::new(llm.clone(), cfg.reflection.max_attempts))
                as Arc<dyn ReflectiveExecutor>
        });
        let memory = self
            .memory
            .clone()
            .unwrap_or_else(|| Arc::new(NoopMemory) as Arc<dyn MemoryStore>);

        let system_prompt = self
            .system_prompt
            .clone()
            .or_else(|| cfg.app.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        tracing::info!(
            app = cfg.app.name.as_deref().unwrap_or("hive"),
            memory_enabled = memory.enabled(),
            max_concurrency = cfg.workflow.max_concurrency,
            "Orchestrator initialised"
        );

        Orchestrator::from_parts(
            router,
            engine,
            decomposer,
            reflector,
            tools,
            llm,
            memory,
            ErrorHandler::from_config(&cfg.recovery),
            system_prompt,
            cfg.app.memory_limit,
        )
    }
}

impl Orchestrator {
    pub fn builder(config: AppConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }
}
