//! 计划校验：ID 唯一、依赖存在、无环（DFS + visiting/visited 标记，回边即环）

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::delegation::types::{DelegationPlan, SubTask};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanValidationError {
    #[error("plan has no tasks")]
    Empty,

    #[error("duplicate subTaskId '{0}'")]
    DuplicateId(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// 通过校验的计划；只能由 validate_plan 构造
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    tasks: Vec<SubTask>,
}

impl ValidatedPlan {
    pub fn tasks(&self) -> &[SubTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

pub fn validate_plan(plan: DelegationPlan) -> Result<ValidatedPlan, PlanValidationError> {
    if plan.tasks.is_empty() {
        return Err(PlanValidationError::Empty);
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, task) in plan.tasks.iter().enumerate() {
        if index.insert(task.sub_task_id.as_str(), i).is_some() {
            return Err(PlanValidationError::DuplicateId(task.sub_task_id.clone()));
        }
    }
    for task in &plan.tasks {
        for dep in &task.dependencies {
            if !index.contains_key(dep.as_str()) {
                return Err(PlanValidationError::UnknownDependency {
                    task: task.sub_task_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut visiting: Vec<&str> = Vec::new();
    for task in &plan.tasks {
        if let Some(path) = find_cycle(task.sub_task_id.as_str(), &plan.tasks, &index, &mut visiting, &mut visited) {
            return Err(PlanValidationError::Cycle { path });
        }
    }

    Ok(ValidatedPlan { tasks: plan.tasks })
}

/// visiting 按访问顺序保存当前 DFS 栈，命中栈内节点即得到环路径
fn find_cycle<'a>(
    id: &'a str,
    tasks: &'a [SubTask],
    index: &HashMap<&'a str, usize>,
    visiting: &mut Vec<&'a str>,
    visited: &mut HashSet<&'a str>,
) -> Option<Vec<String>> {
    if visited.contains(id) {
        return None;
    }
    if let Some(pos) = visiting.iter().position(|v| *v == id) {
        let mut path: Vec<String> = visiting[pos..].iter().map(|s| s.to_string()).collect();
        path.push(id.to_string());
        return Some(path);
    }

    visiting.push(id);
    let task = &tasks[index[id]];
    for dep in &task.dependencies {
        if let Some(path) = find_cycle(dep.as_str(), tasks, index, visiting, visited) {
            return Some(path);
        }
    }
    visiting.pop();
    visited.insert(id);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::types::AgentRole;

    fn task(id: &str, deps: &[&str]) -> SubTask {
        SubTask::new(id, AgentRole::Researcher, "x").depends_on(deps.iter().copied())
    }

    #[test]
    fn test_valid_diamond() {
        let plan = DelegationPlan {
            tasks: vec![task("A", &[]), task("B", &["A"]), task("C", &["A"]), task("D", &["B", "C"])],
        };
        assert_eq!(validate_plan(plan).unwrap().len(), 4);
    }

    #[test]
    fn test_duplicate_and_unknown() {
        let plan = DelegationPlan {
            tasks: vec![task("A", &[]), task("A", &[])],
        };
        assert_eq!(validate_plan(plan).unwrap_err(), PlanValidationError::DuplicateId("A".into()));

        let plan = DelegationPlan {
            tasks: vec![task("A", &["Z"])],
        };
        assert!(matches!(
            validate_plan(plan).unwrap_err(),
            PlanValidationError::UnknownDependency { .. }
        ));

        assert_eq!(
            validate_plan(DelegationPlan { tasks: vec![] }).unwrap_err(),
            PlanValidationError::Empty
        );
    }

    #[test]
    fn test_cycle_path_is_named() {
        let plan = DelegationPlan {
            tasks: vec![task("A", &["C"]), task("B", &["A"]), task("C", &["B"]), task("D", &[])],
        };
        let err = validate_plan(plan).unwrap_err();
        assert_eq!(
            err,
            PlanValidationError::Cycle {
                path: vec!["A".into(), "C".into(), "B".into(), "A".into()]
            }
        );
        assert_eq!(err.to_string(), "dependency cycle: A -> C -> B -> A");
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let plan = DelegationPlan {
            tasks: vec![task("A", &["A"])],
        };
        assert!(matches!(validate_plan(plan).unwrap_err(), PlanValidationError::Cycle { .. }));
    }
}
