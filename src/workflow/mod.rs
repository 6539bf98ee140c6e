//! 工作流层：任务模型、依赖图、执行引擎、循环与并行执行、动态计划修改、任务分解

pub mod builder;
pub mod context;
pub mod decomposer;
pub mod dynamic;
pub mod engine;
pub mod graph;
pub mod loop_executor;
pub mod parallel;
pub mod registry;
pub mod runner;
pub mod store;
pub mod types;

pub use builder::PlanBuilder;
pub use context::{ContextSnapshot, WorkflowContext, RESULTS_VARIABLE};
pub use decomposer::{Decomposer, LlmDecomposer, StaticDecomposer};
pub use dynamic::{DynamicPlanner, ExecutionFeedback, PlanConstraints, UserFeedback};
pub use engine::{
    ExecutionOptions, ExecutionStatus, FailurePolicy, RatioFailurePolicy, WorkflowEngine,
    WorkflowEngineBuilder,
};
pub use graph::TaskGraph;
pub use loop_executor::{LoopExecutor, LoopReport, RetryOutcome};
pub use parallel::{analyze_parallel_potential, identify_parallel_tasks, ParallelAnalysis, ParallelExecutor};
pub use registry::{ActiveRegistry, ActiveStatus};
pub use runner::{DefaultTaskRunner, TaskOutput, TaskRunner};
pub use store::{InMemoryTaskStore, NewTask, TaskRecord, TaskStore};
pub use types::*;
