//! Hive - Rust 任务编排引擎
//!
//! 模块划分：
//! - **workflow**: 任务模型、依赖图、工作流引擎、循环 / 并行执行、动态计划修改、任务分解
//! - **core**: 编排器、任务路由、状态机、错误恢复
//! - **llm**: LLM 客户端抽象与 Mock 实现
//! - **memory**: 消息类型与长期记忆协作方
//! - **tools**: 工具注册表与带超时的执行器
//! - **reflection**: 起草 + 评审的反思执行
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod reflection;
pub mod tools;
pub mod workflow;

pub use crate::core::{Orchestrator, OrchestratorBuilder, OrchestratorRequest, OrchestratorResponse};
pub use crate::workflow::WorkflowEngine;
