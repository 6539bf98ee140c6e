//! 工具注册表
//!
//! 工具实现 Tool trait（name / description / execute），由 ToolRegistry 按名注册与查找。
//! 任务分解提示词中的可用工具列表也取自注册表。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// 工具 trait：名称、描述、参数 schema、异步执行（args 为 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（任务定义中的 tool_name）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认表示参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具注册表（按名称有序，生成的提示词稳定）
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具会被替换
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Tool re-registered, previous definition replaced");
        }
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// "- name: description" 列表，用于任务分解提示词
    pub fn prompt_listing(&self) -> String {
        self.tools
            .iter()
            .map(|(name, tool)| format!("- {name}: {}", tool.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 工具 schema JSON（名称、描述、参数）
    pub fn to_schema_json(&self) -> Value {
        Value::Array(
            self.tools
                .iter()
                .map(|(name, tool)| {
                    serde_json::json!({
                        "name": name,
                        "description": tool.description(),
                        "parameters": tool.parameters_schema()
                    })
                })
                .collect(),
        )
    }
}
