//! 任务依赖图
//!
//! 使用邻接表和反向邻接表实现 DAG：环检测、拓扑排序、执行层级划分

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::workflow::types::*;

/// 任务依赖图
///
/// 边 `from -> to` 表示 `to` 依赖 `from`（`from` 是前置任务）。
/// 节点按 ID 有序存储，层级与拓扑序在同一输入下是确定的。
#[derive(Debug, Clone)]
pub struct TaskGraph<T = TaskDefinition> {
    nodes: BTreeMap<TaskId, T>,
    /// 邻接表：任务 ID -> 依赖该任务的任务
    edges: HashMap<TaskId, BTreeSet<TaskId>>,
    /// 反向邻接表：任务 ID -> 前置任务
    reverse_edges: HashMap<TaskId, BTreeSet<TaskId>>,
}

impl<T> Default for TaskGraph<T> {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: HashMap::new(),
            reverse_edges: HashMap::new(),
        }
    }
}

impl<T> TaskGraph<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加节点；重复添加时替换载荷，保留已有的边
    pub fn add_node(&mut self, id: TaskId, payload: T) {
        self.nodes.insert(id, payload);
        self.edges.entry(id).or_default();
        self.reverse_edges.entry(id).or_default();
    }

    /// 添加依赖边，两端节点必须已存在
    pub fn add_edge(&mut self, from: TaskId, to: TaskId) -> Result<(), WorkflowError> {
        if !self.nodes.contains_key(&from) {
            return Err(WorkflowError::NodeNotFound(from));
        }
        if !self.nodes.contains_key(&to) {
            return Err(WorkflowError::NodeNotFound(to));
        }
        self.edges.entry(from).or_default().insert(to);
        self.reverse_edges.entry(to).or_default().insert(from);
        Ok(())
    }

    pub fn remove_edge(&mut self, from: TaskId, to: TaskId) -> bool {
        let removed = self
            .edges
            .get_mut(&from)
            .map(|children| children.remove(&to))
            .unwrap_or(false);
        if let Some(parents) = self.reverse_edges.get_mut(&to) {
            parents.remove(&from);
        }
        removed
    }

    pub fn node(&self, id: TaskId) -> Option<&T> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.nodes.keys().copied()
    }

    /// 直接后继
    pub fn children(&self, id: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 直接前置
    pub fn parents(&self, id: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn roots(&self) -> Vec<TaskId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| self.reverse_edges.get(id).map_or(true, |p| p.is_empty()))
            .collect()
    }

    pub fn leaves(&self) -> Vec<TaskId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| self.edges.get(id).map_or(true, |c| c.is_empty()))
            .collect()
    }

    /// 三色 DFS 检测环
    pub fn detect_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<TaskId, Color> =
            self.nodes.keys().map(|id| (*id, Color::White)).collect();

        // 显式栈，避免深链路上的递归溢出
        for &start in self.nodes.keys() {
            if color.get(&start) != Some(&Color::White) {
                continue;
            }
            let mut stack: Vec<(TaskId, Vec<TaskId>)> = vec![(start, self.children(start))];
            color.insert(start, Color::Gray);

            loop {
                let Some((node, pending)) = stack.last_mut() else {
                    break;
                };
                let node = *node;
                match pending.pop() {
                    Some(child) => match color.get(&child).copied().unwrap_or(Color::White) {
                        Color::Gray => return true,
                        Color::White => {
                            color.insert(child, Color::Gray);
                            let grand = self.children(child);
                            stack.push((child, grand));
                        }
                        Color::Black => {}
                    },
                    None => {
                        color.insert(node, Color::Black);
                        stack.pop();
                    }
                }
            }
        }
        false
    }

    fn in_degrees(&self) -> HashMap<TaskId, usize> {
        self.nodes
            .keys()
            .map(|id| (*id, self.reverse_edges.get(id).map_or(0, |p| p.len())))
            .collect()
    }

    /// Kahn 拓扑排序：每个节点都排在其所有前置节点之后
    pub fn topological_sort(&self) -> Result<Vec<TaskId>, WorkflowError> {
        let mut in_degree = self.in_degrees();
        let mut queue: VecDeque<TaskId> = self
            .nodes
            .keys()
            .copied()
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for child in self.children(id) {
                if let Some(degree) = in_degree.get_mut(&child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(WorkflowError::CyclicDependency);
        }
        Ok(order)
    }

    /// 执行层级划分
    ///
    /// 第 0 层为所有根节点；第 k 层为移除前 k 层后入度为 0 的节点。
    /// 同层节点互不依赖，可并发执行。仍有节点但无法再提取时报告环。
    pub fn get_execution_levels(&self) -> Result<Vec<Vec<TaskId>>, WorkflowError> {
        let mut in_degree = self.in_degrees();
        let mut current: Vec<TaskId> = self
            .nodes
            .keys()
            .copied()
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut levels = Vec::new();
        let mut extracted = 0;

        while !current.is_empty() {
            extracted += current.len();
            let mut next = BTreeSet::new();
            for &id in &current {
                for child in self.children(id) {
                    if let Some(degree) = in_degree.get_mut(&child) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(child);
                        }
                    }
                }
            }
            levels.push(current);
            current = next.into_iter().collect();
        }

        if extracted != self.nodes.len() {
            return Err(WorkflowError::CyclicDependency);
        }
        Ok(levels)
    }
}

impl TaskGraph<TaskDefinition> {
    /// 由任务计划构建依赖图，`ids` 为任务名到记录 ID 的映射
    pub fn from_plan(plan: &TaskPlan, ids: &HashMap<String, TaskId>) -> Result<Self, WorkflowError> {
        let mut graph = TaskGraph::new();
        for task in &plan.tasks {
            let id = *ids
                .get(&task.name)
                .ok_or_else(|| WorkflowError::UnknownTask(task.name.clone()))?;
            graph.add_node(id, task.clone());
        }

        for (task_name, deps) in &plan.dependencies {
            let to = *ids
                .get(task_name)
                .ok_or_else(|| WorkflowError::UnknownTask(task_name.clone()))?;
            for dep in deps {
                let from = *ids
                    .get(dep)
                    .ok_or_else(|| WorkflowError::UnknownTask(dep.clone()))?;
                graph.add_edge(from, to)?;
            }
        }

        if graph.detect_cycle() {
            return Err(WorkflowError::CyclicDependency);
        }
        Ok(graph)
    }
}
