//! Hive - Rust 任务编排引擎
//!
//! 入口：初始化日志、加载配置、装配编排器（Mock LLM + 内存协作方），执行命令行给出的请求或计划文件。
//!
//! 用法：
//!   hive [--config path] [--mode simple|planning|reflection] "<request>"
//!   hive [--config path] --plan plan.toml

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use hive::config::load_config;
use hive::core::{ExecutionMode, OrchestratorBuilder, OrchestratorRequest};
use hive::memory::InMemoryMemoryStore;
use hive::tools::{EchoTool, ToolExecutor, ToolRegistry};
use hive::workflow::{ExecutionOptions, LoopConfig, ParallelGroup, TaskPlan, WorkflowEngine};
use serde::Deserialize;
use serde_json::Value;

/// 计划文件：TaskPlan 本体 + 可选的循环 / 并行组 / 初始变量
#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(flatten)]
    plan: TaskPlan,
    #[serde(default)]
    loops: HashMap<String, LoopConfig>,
    #[serde(default)]
    parallel_groups: Vec<ParallelGroup>,
    #[serde(default)]
    variables: HashMap<String, Value>,
}

#[derive(Parser, Debug)]
#[command(name = "hive", version, about = "Rust 任务编排引擎")]
struct Cli {
    /// 额外的配置文件（叠加在 config/default.toml 之上）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 直接交给工作流引擎执行的计划文件（TOML）
    #[arg(short, long, conflicts_with = "request")]
    plan: Option<PathBuf>,

    /// 强制执行模式：simple | planning | reflection
    #[arg(short, long, value_parser = parse_mode)]
    mode: Option<ExecutionMode>,

    /// 请求内容
    #[arg(required_unless_present = "plan")]
    request: Vec<String>,
}

fn parse_mode(raw: &str) -> Result<ExecutionMode, String> {
    ExecutionMode::parse_loose(raw).ok_or_else(|| format!("unknown mode: {raw}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let args = Cli::parse();
    let config = load_config(args.config.clone()).context("Failed to load config")?;

    let registry = ToolRegistry::new().with_tool(EchoTool);

    if let Some(path) = args.plan {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read plan file {}", path.display()))?;
        let file: PlanFile = toml::from_str(&text).context("Invalid plan file")?;

        let options = ExecutionOptions {
            loops: file.loops,
            parallel_groups: file.parallel_groups,
            variables: file.variables,
            user_id: None,
        };

        let tools = Arc::new(ToolExecutor::new(registry, config.tools.tool_timeout_secs));
        let engine = WorkflowEngine::builder()
            .tools(tools)
            .max_failure_ratio(config.workflow.max_failure_ratio)
            .max_concurrency(config.workflow.max_concurrency)
            .build();
        let execution_id = uuid::Uuid::new_v4().to_string();
        let result = engine
            .execute_with_options(&file.plan, &execution_id, options)
            .await
            .context("Plan execution failed")?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let content = args.request.join(" ");
    if content.trim().is_empty() {
        bail!("request must not be empty");
    }

    let orchestrator = OrchestratorBuilder::new(config.clone())
        .with_tool_registry(registry)
        .with_memory(Arc::new(InMemoryMemoryStore::default()))
        .build();

    let mut request = OrchestratorRequest::new(content);
    request.mode = args.mode;
    let response = orchestrator.execute(request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
