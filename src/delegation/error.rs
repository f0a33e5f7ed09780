use thiserror::Error;

use crate::delegation::graph::PlanValidationError;

#[derive(Debug, Clone, Error)]
pub enum DelegationError {
    #[error("plan rejected: {0}")]
    InvalidPlan(#[from] PlanValidationError),

    /// 调度不变量被破坏：没有在执行的任务、没有就绪任务，却仍有 pending
    #[error("scheduler stalled with pending tasks that can never run: {}", .0.join(", "))]
    Deadlock(Vec<String>),

    #[error("worker channel closed unexpectedly")]
    ChannelClosed,
}
