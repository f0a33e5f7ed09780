//! 委派层：计划校验、事件总线、有界 Worker Pool、DAG 调度、子 Agent 与引擎

pub mod agents;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod pool;
pub mod scheduler;
pub mod types;

pub use agents::{
    allowed_tools, AgentRuntime, BashOperatorAgent, ResearcherAgent, SubAgent, SubAgentInput,
    WriterAgent,
};
pub use engine::{DelegationEngine, DelegationReport, TaskReport};
pub use error::DelegationError;
pub use events::{DelegationEvent, EventBus, ListenerId};
pub use graph::{validate_plan, PlanValidationError, ValidatedPlan};
pub use pool::{
    DependencyOutput, PoolError, ProgressReporter, TaskRunner, WorkerMessage, WorkerPool,
    WorkerTask,
};
pub use scheduler::{DagScheduler, ScheduleOutcome};
pub use types::{AgentResult, AgentRole, DelegationPlan, SubTask, TaskNode, TaskStatus};
