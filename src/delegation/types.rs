//! 委派数据模型：子任务、任务节点、子 Agent 结果

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 子 Agent 角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Researcher,
    BashOperator,
    Writer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Researcher => "researcher",
            AgentRole::BashOperator => "bash_operator",
            AgentRole::Writer => "writer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "researcher" => Some(AgentRole::Researcher),
            "bash_operator" => Some(AgentRole::BashOperator),
            "writer" => Some(AgentRole::Writer),
            _ => None,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub sub_task_id: String,
    pub agent_role: AgentRole,
    pub prompt: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_path: Option<String>,
}

impl SubTask {
    pub fn new(id: impl Into<String>, role: AgentRole, prompt: impl Into<String>) -> Self {
        Self {
            sub_task_id: id.into(),
            agent_role: role,
            prompt: prompt.into(),
            dependencies: Vec::new(),
            write_path: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_write_path(mut self, path: impl Into<String>) -> Self {
        self.write_path = Some(path.into());
        self
    }
}

/// 委派计划（delegate_sub_tasks 的输入）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationPlan {
    pub tasks: Vec<SubTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 只允许前进：pending → running → completed/failed，pending 也可直接 failed（被依赖阻塞）
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// 子 Agent 执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

impl AgentResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            artifacts: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid task transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// DAG 中的一个节点；只在一次执行内存活
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub task: SubTask,
    pub status: TaskStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub result: Option<AgentResult>,
}

impl TaskNode {
    pub fn new(task: SubTask) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            created_at: Utc::now().timestamp_millis(),
            started_at: None,
            finished_at: None,
            result: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.task.sub_task_id
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now().timestamp_millis();
        match next {
            TaskStatus::Running => self.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed => self.finished_at = Some(now),
            TaskStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }

    /// 进入终态并记录结果；结果 success 决定 completed / failed
    pub fn finish(&mut self, result: AgentResult) -> Result<(), TransitionError> {
        let next = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.transition(next)?;
        self.result = Some(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_wire_format() {
        let json = r#"{"tasks":[
            {"subTaskId":"A","agentRole":"researcher","prompt":"look","dependencies":[]},
            {"subTaskId":"B","agentRole":"writer","prompt":"write","dependencies":["A"],"writePath":"output/b.md"}
        ]}"#;
        let plan: DelegationPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].agent_role, AgentRole::Writer);
        assert_eq!(plan.tasks[1].dependencies, vec!["A"]);
        assert_eq!(plan.tasks[1].write_path.as_deref(), Some("output/b.md"));
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut node = TaskNode::new(SubTask::new("A", AgentRole::Researcher, "x"));
        assert!(node.transition(TaskStatus::Completed).is_err());
        node.transition(TaskStatus::Running).unwrap();
        assert!(node.started_at.is_some());
        node.finish(AgentResult::ok("done")).unwrap();
        assert_eq!(node.status, TaskStatus::Completed);
        assert!(node.transition(TaskStatus::Running).is_err());
        assert!(node.transition(TaskStatus::Failed).is_err());
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let mut node = TaskNode::new(SubTask::new("B", AgentRole::Writer, "x"));
        node.finish(AgentResult::failed("blocked")).unwrap();
        assert_eq!(node.status, TaskStatus::Failed);
        assert!(node.started_at.is_none());
    }
}
