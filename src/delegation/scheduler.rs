//! DAG 调度循环
//!
//! 每一轮：失败传播 → 计算就绪集 → 按空闲槽位派发 → 等待第一条完成消息（或取消）。
//! 就绪集按计划顺序取，保证派发顺序可预期。

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::delegation::error::DelegationError;
use crate::delegation::events::{DelegationEvent, EventBus};
use crate::delegation::graph::ValidatedPlan;
use crate::delegation::pool::{DependencyOutput, WorkerMessage, WorkerPool, WorkerTask};
use crate::delegation::types::{AgentResult, TaskNode, TaskStatus};

/// 一次调度的结果（节点按计划顺序）
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub nodes: Vec<TaskNode>,
    pub aborted: bool,
}

pub struct DagScheduler<'a> {
    nodes: Vec<TaskNode>,
    index: HashMap<String, usize>,
    /// 失败任务 → 根因任务 ID 列表
    root_causes: HashMap<String, Vec<String>>,
    events: &'a EventBus<DelegationEvent>,
    run_id: &'a str,
}

impl<'a> DagScheduler<'a> {
    pub fn new(plan: &ValidatedPlan, events: &'a EventBus<DelegationEvent>, run_id: &'a str) -> Self {
        Self::from_nodes(
            plan.tasks().iter().cloned().map(TaskNode::new).collect(),
            events,
            run_id,
        )
    }

    fn from_nodes(nodes: Vec<TaskNode>, events: &'a EventBus<DelegationEvent>, run_id: &'a str) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id().to_string(), i))
            .collect();
        Self {
            nodes,
            index,
            root_causes: HashMap::new(),
            events,
            run_id,
        }
    }

    pub async fn run(
        mut self,
        pool: &WorkerPool,
        rx: &mut UnboundedReceiver<WorkerMessage>,
        workspace_override: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<ScheduleOutcome, DelegationError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(self.abort(pool));
            }
            self.propagate_failures();
            if self.nodes.iter().all(|n| n.status.is_terminal()) {
                break;
            }

            let ready = self.ready_ids();
            if ready.is_empty() && self.running_count() == 0 {
                let stuck = self
                    .nodes
                    .iter()
                    .filter(|n| n.status == TaskStatus::Pending)
                    .map(|n| n.id().to_string())
                    .collect();
                return Err(DelegationError::Deadlock(stuck));
            }

            for id in ready.into_iter().take(pool.available_slots()) {
                self.dispatch(&id, pool, workspace_override);
            }
            // 派发全部同步失败时重新评估
            if self.running_count() == 0 {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(self.abort(pool));
                }
                message = rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => return Err(DelegationError::ChannelClosed),
                },
            }
        }

        Ok(ScheduleOutcome {
            nodes: self.nodes,
            aborted: false,
        })
    }

    fn running_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.status == TaskStatus::Running).count()
    }

    fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.index.get(id).map(|&i| self.nodes[i].status)
    }

    fn ready_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.status == TaskStatus::Pending)
            .filter(|n| {
                n.task
                    .dependencies
                    .iter()
                    .all(|d| self.status_of(d) == Some(TaskStatus::Completed))
            })
            .map(|n| n.id().to_string())
            .collect()
    }

    /// pending 且有依赖失败 → 失败；重复直到不动点，实现传递性
    fn propagate_failures(&mut self) {
        loop {
            let mut changed = false;
            for i in 0..self.nodes.len() {
                if self.nodes[i].status != TaskStatus::Pending {
                    continue;
                }
                let failed: Vec<String> = self.nodes[i]
                    .task
                    .dependencies
                    .iter()
                    .filter(|d| self.status_of(d) == Some(TaskStatus::Failed))
                    .cloned()
                    .collect();
                if failed.is_empty() {
                    continue;
                }

                let mut roots: Vec<String> = Vec::new();
                for dep in &failed {
                    let dep_roots = self
                        .root_causes
                        .get(dep)
                        .cloned()
                        .unwrap_or_else(|| vec![dep.clone()]);
                    for r in dep_roots {
                        if !roots.contains(&r) {
                            roots.push(r);
                        }
                    }
                }
                let error = format!(
                    "blocked by failed dependencies: {}; root failure: {}",
                    failed.join(", "),
                    roots.join(", ")
                );
                let id = self.nodes[i].id().to_string();
                if self.nodes[i].finish(AgentResult::failed(error.clone())).is_ok() {
                    tracing::info!(task_id = %id, %error, "task blocked");
                    self.root_causes.insert(id.clone(), roots);
                    self.emit_failed(i, error);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn dispatch(&mut self, id: &str, pool: &WorkerPool, workspace_override: Option<&Path>) {
        let Some(&i) = self.index.get(id) else {
            return;
        };
        let dependency_outputs = self.nodes[i]
            .task
            .dependencies
            .iter()
            .filter_map(|d| self.index.get(d).map(|&j| &self.nodes[j]))
            .filter_map(|dep| {
                dep.result.as_ref().map(|r| DependencyOutput {
                    task_id: dep.id().to_string(),
                    output: r.output.clone(),
                    artifacts: r.artifacts.clone(),
                })
            })
            .collect();
        let task = &self.nodes[i].task;
        let worker_task = WorkerTask {
            task_id: task.sub_task_id.clone(),
            agent_role: task.agent_role,
            prompt: task.prompt.clone(),
            write_path: task.write_path.clone(),
            dependency_outputs,
            workspace_override: workspace_override.map(Path::to_path_buf),
        };
        let role = task.agent_role;

        match pool.submit(worker_task) {
            Ok(()) => {
                if self.nodes[i].transition(TaskStatus::Running).is_ok() {
                    tracing::info!(task_id = %id, role = %role, "task started");
                    self.events.emit(&DelegationEvent::TaskStarted {
                        run_id: self.run_id.to_string(),
                        task_id: id.to_string(),
                        role,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "task dispatch failed");
                let error = format!("dispatch failed: {}", e);
                if self.nodes[i].finish(AgentResult::failed(error.clone())).is_ok() {
                    self.emit_failed(i, error);
                }
            }
        }
    }

    fn handle(&mut self, message: WorkerMessage) {
        let Some(&i) = self.index.get(message.task_id()) else {
            return;
        };
        if self.nodes[i].status != TaskStatus::Running {
            return;
        }
        let role = self.nodes[i].task.agent_role;
        match message {
            WorkerMessage::Progress { task_id, message } => {
                self.events.emit(&DelegationEvent::TaskProgress {
                    run_id: self.run_id.to_string(),
                    task_id,
                    role,
                    message,
                });
            }
            WorkerMessage::Completed { task_id, result } => {
                let success = result.success;
                let error = result.error.clone().unwrap_or_else(|| "task reported failure".to_string());
                if self.nodes[i].finish(result.clone()).is_err() {
                    return;
                }
                if success {
                    tracing::info!(task_id = %task_id, "task completed");
                    self.events.emit(&DelegationEvent::TaskCompleted {
                        run_id: self.run_id.to_string(),
                        task_id,
                        role,
                        result,
                    });
                } else {
                    tracing::info!(task_id = %task_id, %error, "task failed");
                    self.emit_failed(i, error);
                }
            }
            WorkerMessage::Failed { task_id, error } => {
                tracing::warn!(task_id = %task_id, %error, "task failed");
                if self.nodes[i].finish(AgentResult::failed(error.clone())).is_ok() {
                    self.emit_failed(i, error);
                }
            }
        }
    }

    fn emit_failed(&self, i: usize, error: String) {
        let node = &self.nodes[i];
        self.events.emit(&DelegationEvent::TaskFailed {
            run_id: self.run_id.to_string(),
            task_id: node.id().to_string(),
            role: node.task.agent_role,
            error,
        });
    }

    /// 强制终止所有单元；未产出结果的任务一律记为失败
    fn abort(mut self, pool: &WorkerPool) -> ScheduleOutcome {
        let terminated = pool.terminate_all();
        tracing::warn!(run_id = %self.run_id, terminated, "delegation aborted");
        for node in self.nodes.iter_mut().filter(|n| !n.status.is_terminal()) {
            let _ = node.finish(AgentResult::failed("aborted"));
        }
        self.events.emit(&DelegationEvent::Aborted {
            run_id: self.run_id.to_string(),
        });
        ScheduleOutcome {
            nodes: self.nodes,
            aborted: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::pool::{ProgressReporter, TaskRunner};
    use crate::delegation::types::{AgentRole, SubTask};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoopRunner;

    #[async_trait]
    impl TaskRunner for NoopRunner {
        async fn run(&self, _task: WorkerTask, _progress: ProgressReporter) -> AgentResult {
            AgentResult::ok("ok")
        }
    }

    #[tokio::test]
    async fn test_deadlock_guard_names_stuck_tasks() {
        // 依赖指向不存在的节点：永远不会就绪也不会被判失败
        let nodes = vec![TaskNode::new(
            SubTask::new("X", AgentRole::Researcher, "p").depends_on(["ghost"]),
        )];
        let events = EventBus::new();
        let scheduler = DagScheduler::from_nodes(nodes, &events, "run");
        let (pool, mut rx) = WorkerPool::new(1, Arc::new(NoopRunner));

        let err = scheduler
            .run(&pool, &mut rx, None, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DelegationError::Deadlock(ids) => assert_eq!(ids, vec!["X"]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
