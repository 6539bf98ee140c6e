//! 核心编排层：错误与恢复、状态机、任务路由、编排器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod router;
pub mod state;

pub use builder::OrchestratorBuilder;
pub use error::{classify_message, ErrorKind, OrchestratorError, RecoveryDirective, RecoveryStrategy};
pub use orchestrator::{
    Orchestrator, OrchestratorRequest, OrchestratorResponse, OrchestratorStatistics, StatusSnapshot,
};
pub use recovery::{ErrorHandler, ErrorRecord, ErrorStatistics, RecoveryLimits};
pub use router::{
    CacheStats, ExecutionMode, LlmModeClassifier, ModeClassifier, RouteDecision, TaskRouter,
};
pub use state::{ExecutionState, StateMachine, StateTransition};
