//! Delegation Engine：校验计划 → 建池 → 调度 → 汇总，沿途发布生命周期事件

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::delegation::error::DelegationError;
use crate::delegation::events::{DelegationEvent, EventBus};
use crate::delegation::graph::validate_plan;
use crate::delegation::pool::{TaskRunner, WorkerPool};
use crate::delegation::scheduler::DagScheduler;
use crate::delegation::types::{AgentResult, AgentRole, DelegationPlan, TaskStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub sub_task_id: String,
    pub agent_role: AgentRole,
    pub status: TaskStatus,
    pub result: AgentResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationReport {
    pub run_id: String,
    pub aborted: bool,
    pub tasks: Vec<TaskReport>,
}

impl DelegationReport {
    pub fn succeeded(&self) -> usize {
        self.tasks.iter().filter(|t| t.result.success).count()
    }

    pub fn failed(&self) -> usize {
        self.tasks.len() - self.succeeded()
    }

    pub fn result(&self, sub_task_id: &str) -> Option<&AgentResult> {
        self.tasks
            .iter()
            .find(|t| t.sub_task_id == sub_task_id)
            .map(|t| &t.result)
    }
}

pub struct DelegationEngine {
    capacity: usize,
    runtime: Arc<dyn TaskRunner>,
    events: Arc<EventBus<DelegationEvent>>,
}

impl DelegationEngine {
    pub fn new(capacity: usize, runtime: Arc<dyn TaskRunner>) -> Self {
        Self {
            capacity: capacity.max(1),
            runtime,
            events: Arc::new(EventBus::new()),
        }
    }

    /// 注入外部事件总线
    pub fn with_events(mut self, events: Arc<EventBus<DelegationEvent>>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus<DelegationEvent>> {
        &self.events
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn run(
        &self,
        plan: DelegationPlan,
        workspace_override: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<DelegationReport, DelegationError> {
        let run_id = Uuid::new_v4().to_string();
        self.run_with_id(&run_id, plan, workspace_override, cancel).await
    }

    /// 调用方预先生成 run_id，便于在执行前按 run_id 订阅事件
    pub async fn run_with_id(
        &self,
        run_id: &str,
        plan: DelegationPlan,
        workspace_override: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<DelegationReport, DelegationError> {
        let plan = validate_plan(plan).map_err(|e| {
            tracing::warn!(run_id = %run_id, error = %e, "delegation plan rejected");
            e
        })?;
        tracing::info!(run_id = %run_id, tasks = plan.len(), capacity = self.capacity, "delegation plan accepted");
        self.events.emit(&DelegationEvent::PlanAccepted {
            run_id: run_id.to_string(),
            task_ids: plan.tasks().iter().map(|t| t.sub_task_id.clone()).collect(),
        });

        let (pool, mut rx) = WorkerPool::new(self.capacity, self.runtime.clone());
        let outcome = DagScheduler::new(&plan, &self.events, run_id)
            .run(&pool, &mut rx, workspace_override, cancel)
            .await?;

        let tasks: Vec<TaskReport> = outcome
            .nodes
            .into_iter()
            .map(|node| TaskReport {
                sub_task_id: node.task.sub_task_id,
                agent_role: node.task.agent_role,
                status: node.status,
                result: node
                    .result
                    .unwrap_or_else(|| AgentResult::failed("task produced no result")),
            })
            .collect();
        let report = DelegationReport {
            run_id: run_id.to_string(),
            aborted: outcome.aborted,
            tasks,
        };
        tracing::info!(
            run_id = %run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            aborted = report.aborted,
            "delegation finished"
        );
        self.events.emit(&DelegationEvent::Finished {
            run_id: run_id.to_string(),
            succeeded: report.succeeded(),
            failed: report.failed(),
        });
        Ok(report)
    }
}
