//! LLM 层：客户端抽象与测试实现

pub mod mock;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient, CRITIC_MARKER, DECOMPOSE_MARKER, ROUTING_MARKER};
pub use traits::{LlmClient, LlmError};
