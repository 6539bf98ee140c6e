//! 任务计划构建器
//!
//! 提供流畅的 API 来构建任务计划，build() 时校验

use serde_json::Value;

use crate::workflow::types::*;

/// 任务计划构建器
pub struct PlanBuilder {
    plan: TaskPlan,
}

impl PlanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            plan: TaskPlan::new(name, ""),
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.plan.description = desc.into();
        self
    }

    /// 添加任务
    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.plan.tasks.push(task);
        self
    }

    /// 添加工具调用任务
    pub fn tool_task(self, name: impl Into<String>, tool: impl Into<String>, params: Value) -> Self {
        self.task(TaskDefinition::tool_call(name, tool, params))
    }

    /// `to` 依赖 `from`
    pub fn sequential(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let deps = self.plan.dependencies.entry(to.into()).or_default();
        let from = from.into();
        if !deps.contains(&from) {
            deps.push(from);
        }
        self
    }

    /// `task` 依赖全部 `deps`
    pub fn depends_on_all<I, S>(mut self, task: impl Into<String>, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.plan.dependencies.entry(task.into()).or_default();
        for dep in deps {
            let dep = dep.into();
            if !entry.contains(&dep) {
                entry.push(dep);
            }
        }
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.plan.metadata.insert(key.into(), value);
        self
    }

    /// 构建并校验（重名、未知依赖、环、优先级范围）
    pub fn build(self) -> Result<TaskPlan, WorkflowError> {
        if self.plan.tasks.is_empty() {
            return Err(WorkflowError::InvalidConfiguration(
                "plan must contain at least one task".to_string(),
            ));
        }
        self.plan.validate()?;
        Ok(self.plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_diamond_plan() {
        let plan = PlanBuilder::new("diamond")
            .description("A -> {B, C} -> D")
            .task(TaskDefinition::new("A", TaskKind::Plan))
            .tool_task("B", "echo", json!({"text": "b"}))
            .task(TaskDefinition::new("C", TaskKind::Execute))
            .task(TaskDefinition::new("D", TaskKind::Reflect))
            .sequential("A", "B")
            .sequential("A", "C")
            .depends_on_all("D", ["B", "C"])
            .build()
            .unwrap();

        assert_eq!(plan.tasks.len(), 4);
        assert_eq!(plan.dependencies_of("D"), ["B".to_string(), "C".to_string()]);
        assert_eq!(plan.root_tasks().len(), 1);
    }

    #[test]
    fn test_build_rejects_bad_plans() {
        assert!(PlanBuilder::new("empty").build().is_err());

        let cyclic = PlanBuilder::new("cyclic")
            .task(TaskDefinition::new("A", TaskKind::Execute))
            .task(TaskDefinition::new("B", TaskKind::Execute))
            .sequential("A", "B")
            .sequential("B", "A")
            .build();
        assert_eq!(cyclic.unwrap_err(), WorkflowError::CyclicDependency);

        let unknown = PlanBuilder::new("unknown")
            .task(TaskDefinition::new("A", TaskKind::Execute))
            .sequential("ghost", "A")
            .build();
        assert_eq!(unknown.unwrap_err(), WorkflowError::UnknownTask("ghost".into()));
    }
}
